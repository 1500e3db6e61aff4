// Copyright 2021 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Server-side key backup support.
//!
//! Megolm sessions get encrypted with the public half of the backup key and
//! uploaded in batches, so a device that lost its local store can recover its
//! room history with the private half.

pub(crate) mod keys;

use std::collections::BTreeMap;

use ruma::{
    DeviceId, OwnedRoomId, OwnedTransactionId, RoomId, TransactionId, UserId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, trace, warn};
use vodozemac::Curve25519PublicKey;

pub use keys::{BackupDecryptionError, BackupDecryptionKey, DecodeError, MegolmV1BackupKey};

use crate::{
    error::SignatureError,
    olm::{Account, InboundGroupSession},
    store::{Changes, CryptoStoreError, DynCryptoStore, RoomKeyCounts},
    types::{deserialize_curve_key, serialize_curve_key, verify_signed_json, Signatures},
};

/// The number of Megolm sessions a single backup upload may carry.
const BACKUP_BATCH_SIZE: usize = 100;

/// A single Megolm session, encrypted for upload into the backup.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyBackupData {
    /// The first ratchet index the backed up session can decrypt.
    pub first_message_index: u32,
    /// How many devices forwarded this session to us.
    pub forwarded_count: u32,
    /// Whether the device that initiated the session was verified.
    pub is_verified: bool,
    /// The encrypted session itself.
    pub session_data: EncryptedSessionData,
}

/// The ciphertext part of a [`KeyBackupData`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptedSessionData {
    /// The unpadded base64 encoded ephemeral Curve25519 key of the sender.
    pub ephemeral: String,
    /// The unpadded base64 encoded ciphertext.
    pub ciphertext: String,
    /// The unpadded base64 encoded message authentication code.
    pub mac: String,
}

/// The backed up sessions of a single room.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RoomKeyBackup {
    /// A map from the session id to the encrypted session.
    pub sessions: BTreeMap<String, KeyBackupData>,
}

/// The auth data of a `m.megolm_backup.v1.curve25519-aes-sha2` backup
/// version.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MegolmV1AuthData {
    /// The public half of the backup key.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub public_key: Curve25519PublicKey,
    /// Signatures over the auth data.
    #[serde(default)]
    pub signatures: Signatures,
}

/// A pending upload of encrypted room keys.
#[derive(Clone, Debug)]
pub struct KeysBackupRequest {
    /// The version of the backup the keys are uploaded to.
    pub version: String,
    /// The encrypted sessions, grouped by room.
    pub rooms: BTreeMap<OwnedRoomId, RoomKeyBackup>,
}

/// Error type for the backup machine.
#[derive(Debug, Error)]
pub enum BackupError {
    /// The private backup key is not known, the backup cannot be restored.
    #[error("the backup decryption key is not stored")]
    MissingDecryptionKey,

    /// Keys of a different backup version than the enabled one were given.
    #[error("mismatched backup version, expected {expected}, got {got}")]
    MismatchedVersion {
        /// The version the stored decryption key belongs to.
        expected: String,
        /// The version the keys were downloaded from.
        got: String,
    },

    /// The storage layer failed.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),
}

/// The result of a single signature check over the backup auth data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignatureState {
    /// No signature of the device was found.
    Missing,
    /// A signature was found but it did not verify.
    Invalid,
    /// The signature verified but the signing device is not verified.
    ValidButNotTrusted,
    /// The signature verified and the signing device is verified.
    ValidAndTrusted,
}

impl SignatureState {
    /// Is the signature both valid and made by a trusted device.
    pub fn trusted(self) -> bool {
        self == SignatureState::ValidAndTrusted
    }
}

/// The result of verifying the signatures of a backup version.
#[derive(Clone, Copy, Debug)]
pub struct SignatureVerification {
    /// The state of the signature made by our own device.
    pub device_signature: SignatureState,
}

impl SignatureVerification {
    /// Can the backup be trusted with newly received room keys.
    pub fn trusted(&self) -> bool {
        self.device_signature.trusted()
    }
}

#[derive(Debug)]
struct PendingBackup {
    request_id: OwnedTransactionId,
    request: KeysBackupRequest,
    sessions: Vec<(OwnedRoomId, String)>,
}

/// The state machine that drives the upload side of the key backup.
#[derive(Debug, Clone)]
pub struct BackupMachine {
    account: Account,
    store: DynCryptoStore,
    backup_key: std::sync::Arc<RwLock<Option<MegolmV1BackupKey>>>,
    pending_backup: std::sync::Arc<RwLock<Option<PendingBackup>>>,
}

impl BackupMachine {
    pub(crate) fn new(account: Account, store: DynCryptoStore) -> Self {
        Self {
            account,
            store,
            backup_key: Default::default(),
            pending_backup: Default::default(),
        }
    }

    /// Is a backup key set and ready to receive room keys.
    pub async fn enabled(&self) -> bool {
        self.backup_key.read().await.as_ref().is_some_and(|key| key.backup_version().is_some())
    }

    /// The version of the currently enabled backup, if any.
    pub async fn backup_version(&self) -> Option<String> {
        self.backup_key.read().await.as_ref().and_then(|key| key.backup_version())
    }

    /// How many room keys the store holds and how many of them are backed up.
    pub async fn room_key_counts(&self) -> Result<RoomKeyCounts, CryptoStoreError> {
        self.store.inbound_group_session_counts().await
    }

    /// Activate the given backup key, uploads will encrypt against it from
    /// now on.
    ///
    /// If a backup with a different version was active before, the backed-up
    /// flags of all stored sessions are reset so everything gets uploaded to
    /// the new version.
    #[instrument(skip(self, key))]
    pub async fn enable_backup_v1(
        &self,
        key: MegolmV1BackupKey,
        version: String,
    ) -> Result<(), CryptoStoreError> {
        let previous_version = self.backup_version().await;

        if previous_version.as_deref().is_some_and(|previous| previous != version) {
            debug!(?previous_version, "Resetting backup state for a new backup version");
            self.store.reset_backup_state().await?;
            *self.pending_backup.write().await = None;
        }

        key.set_version(version.clone());
        *self.backup_key.write().await = Some(key);

        self.store
            .save_changes(Changes { backup_version: Some(version), ..Default::default() })
            .await?;

        info!("Key backup enabled");

        Ok(())
    }

    /// Deactivate the backup and forget which sessions were uploaded to it.
    pub async fn disable_backup(&self) -> Result<(), CryptoStoreError> {
        *self.backup_key.write().await = None;
        *self.pending_backup.write().await = None;
        self.store.reset_backup_state().await?;

        info!("Key backup disabled");

        Ok(())
    }

    /// Persist the private half of the backup key.
    pub async fn save_decryption_key(
        &self,
        decryption_key: BackupDecryptionKey,
        version: Option<String>,
    ) -> Result<(), CryptoStoreError> {
        self.store
            .save_changes(Changes {
                backup_decryption_key: Some(decryption_key),
                backup_version: version,
                ..Default::default()
            })
            .await
    }

    /// Load the stored private half of the backup key, if any.
    pub async fn get_backup_keys(&self) -> Result<crate::store::BackupKeys, CryptoStoreError> {
        self.store.load_backup_keys().await
    }

    /// Check the signatures on the auth data of a backup version.
    ///
    /// A backup counts as trusted if our own, locally verified device signed
    /// its auth data.
    pub async fn verify_backup(
        &self,
        auth_data: &MegolmV1AuthData,
    ) -> Result<SignatureVerification, CryptoStoreError> {
        let user_id = self.account.user_id();
        let device_id = self.account.device_id();

        let json = match serde_json::to_value(auth_data) {
            Ok(json) => json,
            Err(_) => {
                return Ok(SignatureVerification { device_signature: SignatureState::Missing })
            }
        };

        let device_signature =
            self.check_device_signature(user_id, device_id, &json).await?;

        Ok(SignatureVerification { device_signature })
    }

    async fn check_device_signature(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        json: &Value,
    ) -> Result<SignatureState, CryptoStoreError> {
        let Some(device) = self.store.get_device(user_id, device_id).await? else {
            // Our own device isn't in the store yet, check against the
            // account keys directly.
            return Ok(
                match verify_signed_json(
                    self.account.identity_keys().ed25519,
                    user_id,
                    device_id,
                    json,
                ) {
                    Ok(()) => SignatureState::ValidButNotTrusted,
                    Err(SignatureError::NoSignatureFound) => SignatureState::Missing,
                    Err(_) => SignatureState::Invalid,
                },
            );
        };

        let Some(ed25519_key) = device.ed25519_key() else {
            return Ok(SignatureState::Missing);
        };

        Ok(match verify_signed_json(ed25519_key, user_id, device_id, json) {
            Ok(()) if device.is_verified() => SignatureState::ValidAndTrusted,
            Ok(()) => SignatureState::ValidButNotTrusted,
            Err(SignatureError::NoSignatureFound) => SignatureState::Missing,
            Err(_) => SignatureState::Invalid,
        })
    }

    /// Fetch the next batch of room keys that need to be backed up, encrypt
    /// them, and return the upload request.
    ///
    /// Returns `None` if no backup is enabled or every stored session is
    /// already backed up. As long as the returned request isn't marked as
    /// sent with [`BackupMachine::mark_request_as_sent`], subsequent calls
    /// return the same request.
    pub async fn backup(
        &self,
    ) -> Result<Option<(OwnedTransactionId, KeysBackupRequest)>, CryptoStoreError> {
        let mut pending = self.pending_backup.write().await;

        if let Some(pending) = pending.as_ref() {
            trace!("A backup upload is already pending");
            return Ok(Some((pending.request_id.clone(), pending.request.clone())));
        }

        let (Some(backup_key), Some(version)) = (
            self.backup_key.read().await.clone(),
            self.backup_version().await,
        ) else {
            warn!("Trying to backup room keys but no backup is enabled");
            return Ok(None);
        };

        let sessions = self.store.inbound_group_sessions_for_backup(BACKUP_BATCH_SIZE).await?;

        if sessions.is_empty() {
            trace!("No room keys need to be backed up");
            return Ok(None);
        }

        debug!(key_count = sessions.len(), version, "Backing up room keys");

        let session_ids: Vec<_> = sessions
            .iter()
            .map(|session| (session.room_id.clone(), session.session_id().to_owned()))
            .collect();

        let mut rooms: BTreeMap<OwnedRoomId, RoomKeyBackup> = BTreeMap::new();

        for session in sessions {
            let room_id = session.room_id.clone();
            let session_id = session.session_id().to_owned();
            let backup_data = backup_key.encrypt(session).await;

            rooms.entry(room_id).or_default().sessions.insert(session_id, backup_data);
        }

        let request = KeysBackupRequest { version, rooms };
        let request_id = TransactionId::new();

        *pending = Some(PendingBackup {
            request_id: request_id.clone(),
            request: request.clone(),
            sessions: session_ids,
        });

        Ok(Some((request_id, request)))
    }

    /// Mark a backup upload as sent, flagging every session it carried as
    /// backed up.
    pub async fn mark_request_as_sent(
        &self,
        request_id: &TransactionId,
    ) -> Result<(), CryptoStoreError> {
        let mut pending = self.pending_backup.write().await;

        match pending.as_ref() {
            Some(backup) if backup.request_id == request_id => {
                let sessions: Vec<_> = backup
                    .sessions
                    .iter()
                    .map(|(room_id, session_id)| (room_id.as_ref(), session_id.as_str()))
                    .collect();

                self.store.mark_inbound_group_sessions_as_backed_up(&sessions).await?;
                *pending = None;

                Ok(())
            }
            Some(backup) => {
                warn!(
                    expected = ?backup.request_id,
                    got = ?request_id,
                    "Tried to mark an unknown backup request as sent"
                );
                Ok(())
            }
            None => {
                warn!(?request_id, "Tried to mark a backup request as sent but none is pending");
                Ok(())
            }
        }
    }

    /// Decrypt a set of downloaded backup keys and store the resulting
    /// sessions.
    ///
    /// Sessions that fail to decrypt or parse are skipped, everything else is
    /// imported. Returns the number of newly stored sessions and the total
    /// number of downloaded ones.
    #[instrument(skip(self, room_keys))]
    pub async fn import_backed_up_keys(
        &self,
        version: &str,
        room_keys: BTreeMap<OwnedRoomId, RoomKeyBackup>,
    ) -> Result<(usize, usize), BackupError> {
        let backup_keys = self.store.load_backup_keys().await?;

        let Some(decryption_key) = backup_keys.decryption_key else {
            return Err(BackupError::MissingDecryptionKey);
        };

        if let Some(expected) = &backup_keys.backup_version {
            if expected != version {
                return Err(BackupError::MismatchedVersion {
                    expected: expected.clone(),
                    got: version.to_owned(),
                });
            }
        }

        let mut total = 0;
        let mut sessions = Vec::new();

        for (room_id, room_backup) in room_keys {
            for (session_id, key_backup) in room_backup.sessions {
                total += 1;

                let room_key = match decryption_key.decrypt_session_data(&key_backup.session_data)
                {
                    Ok(room_key) => room_key,
                    Err(error) => {
                        warn!(
                            %room_id,
                            session_id,
                            "Couldn't decrypt a backed up room key: {error}"
                        );
                        continue;
                    }
                };

                let exported = room_key.into_exported(room_id.clone(), session_id.clone());

                match InboundGroupSession::from_export(&exported) {
                    Ok(session) => {
                        // The session came out of this backup, no reason to
                        // upload it again.
                        session.mark_as_backed_up();
                        sessions.push(session);
                    }
                    Err(error) => {
                        warn!(
                            %room_id,
                            session_id,
                            "Couldn't import a backed up room key: {error}"
                        );
                    }
                }
            }
        }

        let imported = sessions.len();

        self.store
            .save_changes(Changes { inbound_group_sessions: sessions, ..Default::default() })
            .await
            .map_err(BackupError::Store)?;

        info!(imported, total, "Imported room keys from a backup");

        Ok((imported, total))
    }
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, room_id, user_id};

    use super::*;
    use crate::{
        olm::OutboundGroupSession,
        store::{CryptoStore, MemoryStore},
    };

    async fn backup_machine() -> BackupMachine {
        let account = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        let store = MemoryStore::new().into_dyn();

        store
            .save_changes(Changes { account: Some(account.clone()), ..Default::default() })
            .await
            .unwrap();

        BackupMachine::new(account, store)
    }

    async fn store_room_key(machine: &BackupMachine) {
        let account = &machine.account;
        let room_id = room_id!("!test:localhost");

        let outbound =
            OutboundGroupSession::new(account.static_data(), room_id, Default::default())
                .unwrap();
        let session = InboundGroupSession::new(
            account.identity_keys().curve25519,
            account.identity_keys().ed25519,
            room_id,
            &outbound.session_key().await,
            outbound.settings().algorithm.clone(),
        )
        .unwrap();

        machine
            .store
            .save_changes(Changes {
                inbound_group_sessions: vec![session],
                ..Default::default()
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn backup_upload_cycle() {
        let machine = backup_machine().await;
        store_room_key(&machine).await;

        // No backup enabled yet.
        assert!(!machine.enabled().await);
        assert!(machine.backup().await.unwrap().is_none());

        let decryption_key = BackupDecryptionKey::new();
        let backup_key = decryption_key.megolm_v1_public_key();
        machine.enable_backup_v1(backup_key, "1".to_owned()).await.unwrap();
        assert!(machine.enabled().await);

        let (request_id, request) = machine.backup().await.unwrap().unwrap();
        assert_eq!(request.version, "1");
        assert_eq!(request.rooms.len(), 1);

        // The request stays pending until it's marked as sent.
        let (second_id, _) = machine.backup().await.unwrap().unwrap();
        assert_eq!(request_id, second_id);

        machine.mark_request_as_sent(&request_id).await.unwrap();

        let counts = machine.room_key_counts().await.unwrap();
        assert_eq!(counts, RoomKeyCounts { total: 1, backed_up: 1 });
        assert!(machine.backup().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn backup_restore_cycle() {
        let machine = backup_machine().await;
        store_room_key(&machine).await;

        let decryption_key = BackupDecryptionKey::new();
        machine.enable_backup_v1(decryption_key.megolm_v1_public_key(), "1".to_owned()).await.unwrap();

        let (request_id, request) = machine.backup().await.unwrap().unwrap();
        machine.mark_request_as_sent(&request_id).await.unwrap();

        // Wipe the store and restore from the downloaded backup.
        let restored_machine = backup_machine().await;
        restored_machine.save_decryption_key(decryption_key, Some("1".to_owned())).await.unwrap();

        let (imported, total) =
            restored_machine.import_backed_up_keys("1", request.rooms).await.unwrap();
        assert_eq!(imported, 1);
        assert_eq!(total, 1);

        let counts = restored_machine.room_key_counts().await.unwrap();
        assert_eq!(counts, RoomKeyCounts { total: 1, backed_up: 1 });
    }

    #[tokio::test]
    async fn restore_requires_decryption_key() {
        let machine = backup_machine().await;
        let result = machine.import_backed_up_keys("1", Default::default()).await;
        assert!(matches!(result, Err(BackupError::MissingDecryptionKey)));
    }

    #[tokio::test]
    async fn new_version_resets_backup_state() {
        let machine = backup_machine().await;
        store_room_key(&machine).await;

        let decryption_key = BackupDecryptionKey::new();
        machine
            .enable_backup_v1(decryption_key.megolm_v1_public_key(), "1".to_owned())
            .await
            .unwrap();

        let (request_id, _) = machine.backup().await.unwrap().unwrap();
        machine.mark_request_as_sent(&request_id).await.unwrap();
        assert!(machine.backup().await.unwrap().is_none());

        let new_key = BackupDecryptionKey::new();
        machine
            .enable_backup_v1(new_key.megolm_v1_public_key(), "2".to_owned())
            .await
            .unwrap();

        // The session needs to be uploaded again for the new version.
        let (_, request) = machine.backup().await.unwrap().unwrap();
        assert_eq!(request.version, "2");
    }
}
