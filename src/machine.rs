// Copyright 2020 The Matrix.org Foundation C.I.C.
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

//! The top-level state machine tying the Olm account, the Megolm session
//! management, verification, gossiping and key backups together.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::{Duration, Instant};

use ruma::{
    serde::Raw, DeviceId, OwnedDeviceId, OwnedUserId, RoomId, TransactionId, UserId,
};
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};
use vodozemac::{olm::OlmMessage, Curve25519PublicKey, Ed25519PublicKey};

use crate::{
    backups::{BackupDecryptionKey, BackupMachine},
    error::{EventError, MegolmError, MegolmResult, OlmError, OlmResult, SecretImportError},
    gossiping::{GossipMachine, RoomKeyRequestInfo, SecretInfo},
    identities::{Device, DeviceChanges, LocalTrust},
    key_provider::DeviceKeyProvider,
    olm::{
        Account, EncryptionSettings, ExportedRoomKey, InboundGroupSession, OlmMessageHash,
        Session,
    },
    session_manager::GroupSessionManager,
    store::{Changes, CryptoStoreError, DynCryptoStore, MemoryStore},
    types::{
        events::{
            DecryptedOlmPayload, EncryptedEvent, ForwardedRoomKeyContent,
            OlmV1Curve25519AesSha2Content, RoomEncryptedContent, RoomKeyContent,
            SecretSendContent, ToDeviceRequest,
        },
        DeviceKeys, EventEncryptionAlgorithm, SignedKey,
    },
    verification::VerificationMachine,
};

/// The name of the secret holding the private half of the backup key.
const MEGOLM_BACKUP_SECRET: &str = "m.megolm_backup.v1";

/// How long a device stays in the key claim queue after a wedged session was
/// noticed before a renewed decryption failure may queue it up again.
const UNWEDGING_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// The key material that still needs to be uploaded to the homeserver.
#[derive(Clone, Debug)]
pub struct KeysForUpload {
    /// Our own device keys, `None` if they were already uploaded.
    pub device_keys: Option<DeviceKeys>,
    /// Signed one-time and fallback keys that were not published yet.
    pub one_time_keys: BTreeMap<String, SignedKey>,
}

impl KeysForUpload {
    /// Is there anything that needs to be sent to the server.
    pub fn is_empty(&self) -> bool {
        self.device_keys.is_none() && self.one_time_keys.is_empty()
    }
}

/// The result of an import of exported or backed-up room keys.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RoomKeyImportResult {
    /// The number of sessions that were newly stored or upgraded.
    pub imported_count: usize,
    /// The total number of sessions the import contained.
    pub total_count: usize,
}

/// A successfully decrypted room event, together with the information about
/// the Megolm session that protected it.
#[derive(Clone, Debug)]
pub struct DecryptedRoomEvent {
    /// The decrypted event, in its full JSON form.
    pub event: Value,
    /// The user that sent the event.
    pub sender: OwnedUserId,
    /// The Curve25519 key of the device which initiated the session.
    pub sender_key: Curve25519PublicKey,
    /// The Ed25519 key the session creator claimed to have.
    pub claimed_ed25519_key: Option<String>,
    /// The ID of the session that was used for decryption.
    pub session_id: String,
    /// The ratchet index of the message inside the session.
    pub message_index: u32,
}

/// The state machine implementing the client side of Matrix end-to-end
/// encryption.
///
/// It owns our own Olm [`Account`], the storage layer, and the sub state
/// machines for group sessions, verification, secret gossiping and key
/// backups. The transport layer feeds it to-device events and key counts and
/// sends out the requests it produces; everything else happens in here.
#[derive(Clone)]
pub struct OlmMachine {
    account: Account,
    store: DynCryptoStore,
    group_session_manager: GroupSessionManager,
    gossip_machine: GossipMachine,
    backup_machine: BackupMachine,
    verification_machine: VerificationMachine,
    users_for_key_claim: Arc<StdRwLock<BTreeMap<OwnedUserId, BTreeSet<OwnedDeviceId>>>>,
    last_unwedging_times: Arc<StdRwLock<BTreeMap<String, Instant>>>,
}

impl std::fmt::Debug for OlmMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OlmMachine")
            .field("user_id", &self.user_id())
            .field("device_id", &self.device_id())
            .finish_non_exhaustive()
    }
}

impl OlmMachine {
    /// Create a new machine with a fresh account, backed by an in-memory
    /// store.
    pub fn new(user_id: &UserId, device_id: &DeviceId) -> Self {
        Self::from_parts(Account::new(user_id, device_id), MemoryStore::new().into_dyn())
    }

    /// Open a machine on top of the given store, restoring the account that
    /// was saved there or creating and persisting a fresh one.
    pub async fn with_store(
        user_id: &UserId,
        device_id: &DeviceId,
        store: DynCryptoStore,
    ) -> Result<Self, CryptoStoreError> {
        let account = match store.load_account().await? {
            Some(account) => {
                debug!(
                    user_id = account.user_id().as_str(),
                    device_id = account.device_id().as_str(),
                    "Restored a previously stored account"
                );
                account
            }
            None => {
                let account = Account::new(user_id, device_id);
                store
                    .save_changes(Changes {
                        account: Some(account.clone()),
                        ..Default::default()
                    })
                    .await?;
                account
            }
        };

        Ok(Self::from_parts(account, store))
    }

    fn from_parts(account: Account, store: DynCryptoStore) -> Self {
        let static_data = account.static_data().clone();

        Self {
            group_session_manager: GroupSessionManager::new(account.clone(), store.clone()),
            gossip_machine: GossipMachine::new(
                static_data.user_id.clone(),
                static_data.device_id.clone(),
                store.clone(),
            ),
            backup_machine: BackupMachine::new(account.clone(), store.clone()),
            verification_machine: VerificationMachine::new(static_data, store.clone()),
            users_for_key_claim: Default::default(),
            last_unwedging_times: Default::default(),
            account,
            store,
        }
    }

    /// The provider of our own device identity, backed by the static data of
    /// the Olm [`Account`] this machine owns.
    pub fn key_provider(&self) -> &dyn DeviceKeyProvider {
        self.account.static_data()
    }

    /// The ID of the user owning this machine.
    pub fn user_id(&self) -> &UserId {
        self.account.user_id()
    }

    /// The ID of the device this machine runs on.
    pub fn device_id(&self) -> &DeviceId {
        self.account.device_id()
    }

    /// The public identity keys of our own device.
    pub fn identity_keys(&self) -> vodozemac::olm::IdentityKeys {
        self.account.identity_keys()
    }

    /// The state machine handling interactive verification flows.
    pub fn verification_machine(&self) -> &VerificationMachine {
        &self.verification_machine
    }

    /// The state machine handling server-side key backups.
    pub fn backup_machine(&self) -> &BackupMachine {
        &self.backup_machine
    }

    /// The key material that should be uploaded to the homeserver, `None` if
    /// nothing needs to be uploaded.
    ///
    /// [`OlmMachine::mark_keys_as_published`] needs to be called once the
    /// upload went through, otherwise the same keys will be handed out again.
    pub async fn keys_for_upload(&self) -> Option<KeysForUpload> {
        self.account.generate_one_time_keys_if_needed().await;

        let device_keys =
            if self.account.shared() { None } else { Some(self.account.device_keys().await) };
        let one_time_keys = self.account.signed_keys_for_upload().await;

        let keys = KeysForUpload { device_keys, one_time_keys };

        (!keys.is_empty()).then_some(keys)
    }

    /// Mark the last key upload as successful.
    ///
    /// The count is the number of signed one-time keys the server holds for
    /// us after the upload.
    pub async fn mark_keys_as_published(
        &self,
        one_time_key_count: u64,
    ) -> Result<(), CryptoStoreError> {
        self.account.mark_as_shared();
        self.account.update_uploaded_key_count(one_time_key_count);
        self.account.mark_keys_as_published().await;

        self.store
            .save_changes(Changes { account: Some(self.account.clone()), ..Default::default() })
            .await
    }

    /// Update the one-time key count from a sync response, topping up the
    /// pool on the next [`OlmMachine::keys_for_upload`] call if needed.
    pub fn update_one_time_key_count(&self, count: u64) {
        self.account.update_uploaded_key_count(count);
    }

    /// Receive a batch of downloaded device keys, e.g. from a `/keys/query`
    /// response.
    ///
    /// Keys with an invalid self-signature are rejected, existing devices are
    /// updated in place. Returns which devices are new and which changed.
    pub async fn receive_device_keys(
        &self,
        device_keys: impl IntoIterator<Item = DeviceKeys>,
    ) -> Result<DeviceChanges, CryptoStoreError> {
        let mut changes = DeviceChanges::default();

        for keys in device_keys {
            if keys.user_id == self.user_id() && keys.device_id == self.device_id() {
                continue;
            }

            if let Err(error) = Device::verify_device_keys(&keys) {
                warn!(
                    user_id = keys.user_id.as_str(),
                    device_id = keys.device_id.as_str(),
                    ?error,
                    "Rejecting device keys with an invalid self-signature"
                );
                continue;
            }

            match self.store.get_device(&keys.user_id, &keys.device_id).await? {
                Some(mut device) => {
                    if device.update_device(&keys).is_ok() {
                        changes.changed.push(device);
                    }
                }
                None => {
                    changes.new.push(Device::new(keys, LocalTrust::Unset));
                }
            }
        }

        if !changes.is_empty() {
            self.store
                .save_changes(Changes { devices: changes.clone(), ..Default::default() })
                .await?;
        }

        Ok(changes)
    }

    /// Establish a fresh Olm session with the given device, using a one-time
    /// key claimed from the server.
    ///
    /// If the device was queued up in [`OlmMachine::users_for_key_claim`]
    /// because a session with it is wedged, the queue entry is cleared and an
    /// encrypted `m.dummy` event is returned. Sending it out lets the other
    /// side switch over to the new session.
    pub async fn create_outbound_session(
        &self,
        device: &Device,
        one_time_key: &SignedKey,
    ) -> OlmResult<Option<ToDeviceRequest>> {
        let mut session = self.account.create_outbound_session(device, one_time_key).await?;

        let was_wedged = {
            let mut users = self
                .users_for_key_claim
                .write()
                .expect("The key claim queue lock should never be poisoned");

            let removed = users
                .get_mut(device.user_id())
                .is_some_and(|devices| devices.remove(device.device_id()));

            if users.get(device.user_id()).is_some_and(|devices| devices.is_empty()) {
                users.remove(device.user_id());
            }

            removed
        };

        let request = if was_wedged {
            info!(
                user_id = device.user_id().as_str(),
                device_id = device.device_id().as_str(),
                "Replacing a wedged Olm session with a fresh one"
            );

            let content = session.encrypt(device, "m.dummy", json!({})).await?;

            let mut request = ToDeviceRequest::new("m.room.encrypted");
            request
                .messages
                .entry(device.user_id().to_owned())
                .or_default()
                .insert(device.device_id().to_owned(), serde_json::to_value(content)?);

            Some(request)
        } else {
            None
        };

        self.store
            .save_changes(Changes { sessions: vec![session], ..Default::default() })
            .await?;

        Ok(request)
    }

    /// The devices that need a one-time key claimed for them so a wedged Olm
    /// session can be replaced, keyed by their owning user.
    ///
    /// The map feeds a `/keys/claim` request, the claimed keys are then fed
    /// back through [`OlmMachine::create_outbound_session`].
    pub fn users_for_key_claim(&self) -> BTreeMap<OwnedUserId, BTreeSet<OwnedDeviceId>> {
        self.users_for_key_claim
            .read()
            .expect("The key claim queue lock should never be poisoned")
            .clone()
    }

    /// Queue the device owning the given sender key up for a one-time key
    /// claim, so that the wedged Olm session it used can be replaced.
    ///
    /// Marking the same sender key again within [`UNWEDGING_INTERVAL`] is a
    /// no-op.
    async fn mark_device_as_wedged(
        &self,
        sender: &UserId,
        sender_key: Curve25519PublicKey,
    ) -> Result<(), CryptoStoreError> {
        {
            let mut times = self
                .last_unwedging_times
                .write()
                .expect("The unwedging time lock should never be poisoned");
            let sender_key = sender_key.to_base64();

            if times.get(&sender_key).is_some_and(|t| t.elapsed() < UNWEDGING_INTERVAL) {
                return Ok(());
            }

            times.insert(sender_key, Instant::now());
        }

        let Some(device) = self.find_device_by_curve_key(sender, sender_key).await? else {
            warn!(
                sender = sender.as_str(),
                sender_key = sender_key.to_base64(),
                "A message from an unknown device couldn't be decrypted"
            );
            return Ok(());
        };

        warn!(
            user_id = device.user_id().as_str(),
            device_id = device.device_id().as_str(),
            "The Olm session with a device is wedged, queueing up a one-time \
             key claim for it"
        );

        self.users_for_key_claim
            .write()
            .expect("The key claim queue lock should never be poisoned")
            .entry(device.user_id().to_owned())
            .or_default()
            .insert(device.device_id().to_owned());

        Ok(())
    }

    /// Receive a to-device event addressed to this device.
    ///
    /// Encrypted events are decrypted and their inner payload is handled and
    /// returned, plaintext verification events are forwarded to the
    /// verification machine.
    #[instrument(skip(self, content), fields(sender = %sender, event_type = event_type))]
    pub async fn receive_to_device_event(
        &self,
        sender: &UserId,
        event_type: &str,
        content: &Value,
    ) -> OlmResult<Option<DecryptedOlmPayload>> {
        match event_type {
            "m.room.encrypted" => {
                let content: RoomEncryptedContent = serde_json::from_value(content.clone())?;
                let algorithm = content.algorithm();

                let RoomEncryptedContent::OlmV1Curve25519AesSha2(content) = content else {
                    return Err(EventError::UnsupportedAlgorithm(algorithm.to_string()).into());
                };

                let (payload, device) = self.decrypt_to_device_event(sender, &content).await?;
                self.handle_decrypted_to_device_event(
                    sender,
                    device.as_ref(),
                    content.sender_key,
                    &payload,
                )
                .await?;

                Ok(Some(payload))
            }
            t if t.starts_with("m.key.verification.") => {
                self.verification_machine.receive_to_device_event(sender, t, content).await?;
                Ok(None)
            }
            "m.room_key" | "m.forwarded_room_key" | "m.secret.send" => {
                warn!("Received a sensitive event in plaintext, ignoring it");
                Ok(None)
            }
            _ => {
                debug!("Ignoring an unsupported to-device event");
                Ok(None)
            }
        }
    }

    /// Decrypt an `m.room.encrypted` to-device event and check that its inner
    /// payload is bound to the claimed sender and to us.
    async fn decrypt_to_device_event(
        &self,
        sender: &UserId,
        content: &OlmV1Curve25519AesSha2Content,
    ) -> OlmResult<(DecryptedOlmPayload, Option<Device>)> {
        if content.recipient_key != self.key_provider().curve25519_key() {
            return Err(EventError::MissingCiphertext.into());
        }

        let message_hash = OlmMessageHash::new(content.sender_key, &content.ciphertext);

        if self.store.is_message_known(&message_hash).await? {
            return Err(OlmError::ReplayedMessage(
                sender.to_owned(),
                content.sender_key.to_base64(),
            ));
        }

        let decrypted = self
            .try_decrypt_with_existing_sessions(content.sender_key, &content.ciphertext)
            .await?;

        let (session, plaintext, account_changed) = match decrypted {
            Some((session, plaintext)) => (session, plaintext, false),
            None => match &content.ciphertext {
                // No established session could decrypt the message, but a
                // pre-key message lets us create a brand new one.
                OlmMessage::PreKey(message) => {
                    match self.account.create_inbound_session(content.sender_key, message).await
                    {
                        Ok(result) => {
                            let plaintext = String::from_utf8(result.plaintext).map_err(|_| {
                                EventError::MissingField("content".to_owned())
                            })?;

                            (result.session, plaintext, true)
                        }
                        Err(_) => {
                            self.mark_device_as_wedged(sender, content.sender_key).await?;

                            return Err(OlmError::SessionWedged(
                                sender.to_owned(),
                                content.sender_key.to_base64(),
                            ));
                        }
                    }
                }
                OlmMessage::Normal(_) => {
                    self.mark_device_as_wedged(sender, content.sender_key).await?;

                    return Err(OlmError::SessionWedged(
                        sender.to_owned(),
                        content.sender_key.to_base64(),
                    ));
                }
            },
        };

        self.store
            .save_changes(Changes {
                account: account_changed.then(|| self.account.clone()),
                sessions: vec![session],
                message_hashes: vec![message_hash],
                ..Default::default()
            })
            .await?;

        let payload: DecryptedOlmPayload = serde_json::from_str(&plaintext)?;

        if payload.sender != sender {
            return Err(EventError::MismatchedSender(
                payload.sender.clone(),
                sender.to_owned(),
            )
            .into());
        }

        if payload.recipient != self.user_id() {
            return Err(EventError::MismatchedSender(
                payload.recipient.clone(),
                self.user_id().to_owned(),
            )
            .into());
        }

        if payload.recipient_keys.ed25519 != self.key_provider().ed25519_key().to_base64() {
            return Err(EventError::MismatchedKeys.into());
        }

        let device = self.find_device_by_curve_key(&payload.sender, content.sender_key).await?;

        if let Some(device) = &device {
            let signing_key = device.ed25519_key().map(|key| key.to_base64());

            if signing_key.as_deref() != Some(payload.keys.ed25519.as_str()) {
                return Err(EventError::MismatchedKeys.into());
            }
        }

        Ok((payload, device))
    }

    /// Try to decrypt the message with every Olm session we share with the
    /// device owning the given sender key.
    async fn try_decrypt_with_existing_sessions(
        &self,
        sender_key: Curve25519PublicKey,
        message: &OlmMessage,
    ) -> OlmResult<Option<(Session, String)>> {
        let Some(sessions) = self.store.get_sessions(&sender_key.to_base64()).await? else {
            return Ok(None);
        };

        for mut session in sessions {
            // Failing to decrypt with one session is expected if the sender
            // has several of them, just move on to the next one.
            if let Ok(plaintext) = session.decrypt(message).await {
                return Ok(Some((session, plaintext)));
            }
        }

        Ok(None)
    }

    /// Find the device of the given user that owns the given Curve25519 key.
    async fn find_device_by_curve_key(
        &self,
        user_id: &UserId,
        curve_key: Curve25519PublicKey,
    ) -> Result<Option<Device>, CryptoStoreError> {
        let devices = self.store.get_user_devices(user_id).await?;

        Ok(devices.into_values().find(|device| device.curve25519_key() == Some(curve_key)))
    }

    /// Handle the decrypted payload of an Olm-encrypted to-device event.
    async fn handle_decrypted_to_device_event(
        &self,
        sender: &UserId,
        sender_device: Option<&Device>,
        sender_key: Curve25519PublicKey,
        payload: &DecryptedOlmPayload,
    ) -> OlmResult<()> {
        match payload.event_type.as_str() {
            "m.room_key" => self.add_room_key(sender_key, payload).await,
            "m.forwarded_room_key" => {
                self.add_forwarded_room_key(sender_device, sender_key, payload).await
            }
            "m.secret.send" => self.receive_secret(sender, sender_device, payload).await,
            "m.dummy" => {
                debug!("Received an Olm session keep-alive message");
                Ok(())
            }
            t if t.starts_with("m.key.verification.") => {
                self.verification_machine
                    .receive_to_device_event(sender, t, &payload.content)
                    .await?;
                Ok(())
            }
            _ => {
                debug!(
                    event_type = payload.event_type.as_str(),
                    "Ignoring an unsupported decrypted to-device event"
                );
                Ok(())
            }
        }
    }

    /// Store the Megolm session an `m.room_key` event carries.
    async fn add_room_key(
        &self,
        sender_key: Curve25519PublicKey,
        payload: &DecryptedOlmPayload,
    ) -> OlmResult<()> {
        let content: RoomKeyContent = serde_json::from_value(payload.content.clone())?;

        if content.algorithm != EventEncryptionAlgorithm::MegolmV1AesSha2 {
            warn!(
                algorithm = %content.algorithm,
                "Received a room key with an unsupported algorithm"
            );
            return Ok(());
        }

        let signing_key = Ed25519PublicKey::from_base64(&payload.keys.ed25519)
            .map_err(|_| EventError::MissingSigningKey)?;

        let session = match InboundGroupSession::new(
            sender_key,
            signing_key,
            &content.room_id,
            &content.session_key,
            content.algorithm,
        ) {
            Ok(session) => session,
            Err(error) => {
                warn!(?error, "Failed to create a session from a received room key");
                return Ok(());
            }
        };

        info!(
            room_id = content.room_id.as_str(),
            session_id = session.session_id(),
            "Received a new Megolm room key"
        );

        self.store
            .save_changes(Changes {
                inbound_group_sessions: vec![session],
                ..Default::default()
            })
            .await?;

        Ok(())
    }

    /// Store the Megolm session an `m.forwarded_room_key` event carries.
    ///
    /// Forwarded keys are only accepted if they answer a room key request we
    /// actually made, and only from our own verified devices.
    async fn add_forwarded_room_key(
        &self,
        sender_device: Option<&Device>,
        sender_key: Curve25519PublicKey,
        payload: &DecryptedOlmPayload,
    ) -> OlmResult<()> {
        let content: ForwardedRoomKeyContent = serde_json::from_value(payload.content.clone())?;

        let info = SecretInfo::KeyRequest(RoomKeyRequestInfo {
            algorithm: content.algorithm.clone(),
            room_id: content.room_id.clone(),
            sender_key: content.claimed_sender_key,
            session_id: content.session_id.clone(),
        });

        let Some(request) = self.store.get_secret_request_by_info(&info).await? else {
            warn!(
                room_id = content.room_id.as_str(),
                session_id = content.session_id.as_str(),
                "Received a forwarded room key we didn't request, ignoring it"
            );
            return Ok(());
        };

        let from_verified_device =
            sender_device.is_some_and(|d| d.user_id() == self.user_id() && d.is_verified());

        if !from_verified_device {
            warn!(
                session_id = content.session_id.as_str(),
                "Received a forwarded room key from an unverified device, ignoring it"
            );
            return Ok(());
        }

        let session = match InboundGroupSession::from_forwarded(sender_key, &content) {
            Ok(session) => session,
            Err(error) => {
                warn!(?error, "Failed to create a session from a forwarded room key");
                return Ok(());
            }
        };

        info!(
            room_id = content.room_id.as_str(),
            session_id = session.session_id(),
            "Received a forwarded Megolm room key"
        );

        self.store
            .save_changes(Changes {
                inbound_group_sessions: vec![session],
                ..Default::default()
            })
            .await?;
        self.store.delete_outgoing_secret_requests(&request.request_id).await?;

        Ok(())
    }

    /// Handle an `m.secret.send` event that answers one of our gossip
    /// requests.
    async fn receive_secret(
        &self,
        sender: &UserId,
        sender_device: Option<&Device>,
        payload: &DecryptedOlmPayload,
    ) -> OlmResult<()> {
        let content: SecretSendContent = serde_json::from_value(payload.content.clone())?;

        let Some(device) = sender_device else {
            warn!("Received a secret from an unknown device, ignoring it");
            return Ok(());
        };

        let Some(secret) =
            self.gossip_machine.receive_secret_send(sender, device, &content).await?
        else {
            return Ok(());
        };

        if secret.secret_name == MEGOLM_BACKUP_SECRET {
            match self.import_secret(MEGOLM_BACKUP_SECRET, &secret.event.secret).await {
                Ok(()) => info!("Imported the backup decryption key from a gossiped secret"),
                Err(error) => {
                    warn!(?error, "A gossiped backup decryption key couldn't be imported")
                }
            }
        }

        self.store
            .save_changes(Changes { secrets: vec![secret], ..Default::default() })
            .await?;

        Ok(())
    }

    /// Import a named secret, e.g. one restored from secret storage or
    /// received via gossiping.
    ///
    /// Currently only `m.megolm_backup.v1` is understood, it hooks the
    /// private half of the backup key into the backup machine.
    pub async fn import_secret(
        &self,
        secret_name: &str,
        secret: &str,
    ) -> Result<(), SecretImportError> {
        if secret_name == MEGOLM_BACKUP_SECRET {
            let decryption_key = BackupDecryptionKey::from_base64(secret)
                .map_err(|_| SecretImportError::MalformedSecret)?;
            let version = self.backup_machine.backup_version().await;

            self.backup_machine.save_decryption_key(decryption_key, version).await?;
        }

        Ok(())
    }

    /// Request a secret from our other devices.
    ///
    /// Returns `None` if a request for the same secret is already in flight.
    pub async fn request_secret(
        &self,
        secret_name: &str,
    ) -> Result<Option<ToDeviceRequest>, CryptoStoreError> {
        let Some((gossip_request, request)) =
            self.gossip_machine.request_secret(secret_name).await?
        else {
            return Ok(None);
        };

        self.store
            .save_changes(Changes { key_requests: vec![gossip_request], ..Default::default() })
            .await?;

        Ok(Some(request))
    }

    /// Request the room key that is needed to decrypt the given event from
    /// our other devices.
    ///
    /// Returns `None` if a request for the same key is already in flight.
    pub async fn request_room_key(
        &self,
        event: &EncryptedEvent,
    ) -> Result<Option<ToDeviceRequest>, CryptoStoreError> {
        let RoomEncryptedContent::MegolmV1AesSha2(content) = &event.content else {
            return Ok(None);
        };
        let Some(room_id) = &event.room_id else {
            return Ok(None);
        };

        let Some((gossip_request, request)) = self
            .gossip_machine
            .request_room_key(room_id, content.sender_key, &content.session_id)
            .await?
        else {
            return Ok(None);
        };

        self.store
            .save_changes(Changes { key_requests: vec![gossip_request], ..Default::default() })
            .await?;

        Ok(Some(request))
    }

    /// Encrypt and queue the current outbound group session of the room for
    /// every device of the given users that doesn't have it yet.
    ///
    /// The returned requests have to be sent out and marked as sent with
    /// [`OlmMachine::mark_request_as_sent`] before the session counts as
    /// shared.
    pub async fn share_room_key(
        &self,
        room_id: &RoomId,
        users: &[&UserId],
        settings: EncryptionSettings,
    ) -> OlmResult<Vec<Arc<ToDeviceRequest>>> {
        self.group_session_manager.share_room_key(room_id, users, settings).await
    }

    /// Encrypt a room event with the Megolm session of the given room.
    pub async fn encrypt_room_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: &Value,
    ) -> MegolmResult<Raw<RoomEncryptedContent>> {
        self.group_session_manager.encrypt(room_id, event_type, content).await
    }

    /// Invalidate the outbound group session of the given room.
    ///
    /// The next message in the room will trigger a fresh session that needs
    /// to be shared again, used when the room membership or encryption
    /// settings change.
    pub async fn invalidate_group_session(
        &self,
        room_id: &RoomId,
    ) -> Result<bool, CryptoStoreError> {
        self.group_session_manager.invalidate_group_session(room_id).await
    }

    /// Decrypt an `m.room.encrypted` room event.
    #[instrument(skip(self, event), fields(sender = %event.sender))]
    pub async fn decrypt_room_event(
        &self,
        event: &EncryptedEvent,
    ) -> MegolmResult<DecryptedRoomEvent> {
        let RoomEncryptedContent::MegolmV1AesSha2(content) = &event.content else {
            return Err(EventError::UnsupportedAlgorithm(
                event.content.algorithm().to_string(),
            )
            .into());
        };

        let room_id = event
            .room_id
            .as_deref()
            .ok_or_else(|| EventError::MissingField("room_id".to_owned()))?;

        let session = self
            .store
            .get_inbound_group_session(room_id, &content.session_id)
            .await?
            .ok_or(MegolmError::MissingRoomKey(None))?;

        // The device that encrypted the event must be the device that
        // created, or forwarded us, the session.
        if session.creator_info.curve25519_key != content.sender_key {
            return Err(MegolmError::MismatchedIdentityKeys);
        }

        let (plaintext, message_index) =
            session.decrypt(event.room_id.as_deref(), &content.ciphertext).await?;

        let decrypted_event = serde_json::from_slice(&plaintext)?;

        Ok(DecryptedRoomEvent {
            event: decrypted_event,
            sender: event.sender.clone(),
            sender_key: content.sender_key,
            claimed_ed25519_key: session.creator_info.signing_keys.get("ed25519").cloned(),
            session_id: content.session_id.clone(),
            message_index,
        })
    }

    /// Export the stored inbound group sessions that match the given
    /// predicate.
    pub async fn export_room_keys(
        &self,
        predicate: impl Fn(&InboundGroupSession) -> bool,
    ) -> Result<Vec<ExportedRoomKey>, CryptoStoreError> {
        let mut exported = Vec::new();

        for session in self.store.get_inbound_group_sessions().await? {
            if predicate(&session) {
                exported.push(session.export().await);
            }
        }

        Ok(exported)
    }

    /// Import a set of previously exported room keys.
    ///
    /// Keys we already have a better copy of are skipped, everything else is
    /// stored.
    pub async fn import_room_keys(
        &self,
        room_keys: Vec<ExportedRoomKey>,
    ) -> Result<RoomKeyImportResult, CryptoStoreError> {
        use vodozemac::megolm::SessionOrdering;

        let total_count = room_keys.len();
        let mut sessions = Vec::new();

        for key in room_keys {
            let session = match InboundGroupSession::from_export(&key) {
                Ok(session) => session,
                Err(error) => {
                    warn!(
                        session_id = key.session_id.as_str(),
                        ?error,
                        "Skipping a room key that couldn't be imported"
                    );
                    continue;
                }
            };

            let keep = match self
                .store
                .get_inbound_group_session(&key.room_id, &key.session_id)
                .await?
            {
                Some(existing) => matches!(
                    existing.compare(&session).await,
                    SessionOrdering::Worse | SessionOrdering::Unconnected
                ),
                None => true,
            };

            if keep {
                sessions.push(session);
            }
        }

        let imported_count = sessions.len();

        self.store
            .save_changes(Changes { inbound_group_sessions: sessions, ..Default::default() })
            .await?;

        info!(imported_count, total_count, "Imported room keys");

        Ok(RoomKeyImportResult { imported_count, total_count })
    }

    /// Mark an outgoing request produced by one of the sub state machines as
    /// sent.
    pub async fn mark_request_as_sent(
        &self,
        request_id: &TransactionId,
    ) -> Result<(), CryptoStoreError> {
        self.group_session_manager.mark_request_as_sent(request_id).await?;
        self.backup_machine.mark_request_as_sent(request_id).await?;

        if let Some(mut request) = self.store.get_outgoing_secret_request(request_id).await? {
            request.sent_out = true;
            self.store
                .save_changes(Changes { key_requests: vec![request], ..Default::default() })
                .await?;
        }

        Ok(())
    }

    /// All the devices of the given user we know about.
    pub async fn get_user_devices(
        &self,
        user_id: &UserId,
    ) -> Result<std::collections::HashMap<OwnedDeviceId, Device>, CryptoStoreError> {
        self.store.get_user_devices(user_id).await
    }

    /// A single device of the given user.
    pub async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<Device>, CryptoStoreError> {
        self.store.get_device(user_id, device_id).await
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use ruma::{device_id, room_id, user_id};
    use serde_json::json;

    use super::*;
    use crate::store::CryptoStore;

    fn alice_machine() -> OlmMachine {
        OlmMachine::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"))
    }

    fn bob_machine() -> OlmMachine {
        OlmMachine::new(user_id!("@bob:localhost"), device_id!("BOBDEVICE"))
    }

    /// Two machines that know about each other's devices and share an
    /// established Olm session.
    async fn get_machine_pair() -> (OlmMachine, OlmMachine) {
        let alice = alice_machine();
        let bob = bob_machine();

        let alice_device = Device::new(alice.account.device_keys().await, LocalTrust::Unset);
        let bob_device = Device::new(bob.account.device_keys().await, LocalTrust::Unset);

        let (alice_session, bob_session) =
            alice.account.create_session_for(&bob.account).await;

        alice
            .store
            .save_changes(Changes {
                sessions: vec![alice_session],
                devices: DeviceChanges { new: vec![bob_device], ..Default::default() },
                ..Default::default()
            })
            .await
            .unwrap();

        bob.store
            .save_changes(Changes {
                sessions: vec![bob_session],
                devices: DeviceChanges { new: vec![alice_device], ..Default::default() },
                ..Default::default()
            })
            .await
            .unwrap();

        (alice, bob)
    }

    /// Deliver every message of the given to-device request to the other
    /// machine.
    async fn deliver(
        sender: &OlmMachine,
        receiver: &OlmMachine,
        request: &ToDeviceRequest,
    ) -> Option<DecryptedOlmPayload> {
        let mut payload = None;

        for (user_id, messages) in &request.messages {
            assert_eq!(user_id, receiver.user_id());

            for content in messages.values() {
                payload = receiver
                    .receive_to_device_event(sender.user_id(), &request.event_type, content)
                    .await
                    .unwrap();
            }
        }

        payload
    }

    #[tokio::test]
    async fn initial_key_upload() {
        let machine = alice_machine();

        let keys = machine.keys_for_upload().await.unwrap();
        assert!(keys.device_keys.is_some());
        assert!(!keys.one_time_keys.is_empty());

        let count = keys.one_time_keys.len() as u64;
        machine.mark_keys_as_published(count).await.unwrap();

        // The device keys were uploaded, they are no longer part of the
        // payload.
        let keys = machine.keys_for_upload().await;
        assert!(keys.is_none() || keys.unwrap().device_keys.is_none());
    }

    #[tokio::test]
    async fn room_key_sharing_and_room_message_decryption() {
        let (alice, bob) = get_machine_pair().await;
        let room_id = room_id!("!test:localhost");

        let requests = alice
            .share_room_key(room_id, &[bob.user_id()], EncryptionSettings::default())
            .await
            .unwrap();
        assert_eq!(requests.len(), 1);

        let payload = deliver(&alice, &bob, &requests[0]).await.unwrap();
        assert_eq!(payload.event_type, "m.room_key");

        alice.mark_request_as_sent(&requests[0].txn_id).await.unwrap();

        let content = json!({ "body": "It's a secret to everybody" });
        let encrypted =
            alice.encrypt_room_event(room_id, "m.room.message", &content).await.unwrap();

        let event = EncryptedEvent {
            sender: alice.user_id().to_owned(),
            event_id: None,
            origin_server_ts: None,
            room_id: Some(room_id.to_owned()),
            content: encrypted.deserialize().unwrap(),
        };

        let decrypted = bob.decrypt_room_event(&event).await.unwrap();

        assert_eq!(decrypted.sender, alice.user_id());
        assert_eq!(decrypted.event["content"], content);
        assert_eq!(decrypted.message_index, 0);
    }

    #[tokio::test]
    async fn replayed_olm_messages_are_rejected() {
        let (alice, bob) = get_machine_pair().await;
        let room_id = room_id!("!test:localhost");

        let requests = alice
            .share_room_key(room_id, &[bob.user_id()], EncryptionSettings::default())
            .await
            .unwrap();

        let content = requests[0].messages[bob.user_id()].values().next().unwrap();

        bob.receive_to_device_event(alice.user_id(), "m.room.encrypted", content)
            .await
            .unwrap();

        let result =
            bob.receive_to_device_event(alice.user_id(), "m.room.encrypted", content).await;
        assert_matches!(result, Err(OlmError::ReplayedMessage(..)));
    }

    #[tokio::test]
    async fn room_key_import_skips_known_sessions() {
        let (alice, bob) = get_machine_pair().await;
        let room_id = room_id!("!test:localhost");

        alice
            .share_room_key(room_id, &[bob.user_id()], EncryptionSettings::default())
            .await
            .unwrap();

        // Sharing stores our own inbound copy of the new session.
        let exported = alice.export_room_keys(|_| true).await.unwrap();
        assert_eq!(exported.len(), 1);

        let charlie = OlmMachine::new(user_id!("@charlie:localhost"), device_id!("CHARLIE"));

        let result = charlie.import_room_keys(exported.clone()).await.unwrap();
        assert_eq!(result, RoomKeyImportResult { imported_count: 1, total_count: 1 });

        let result = charlie.import_room_keys(exported).await.unwrap();
        assert_eq!(result, RoomKeyImportResult { imported_count: 0, total_count: 1 });
    }

    #[tokio::test]
    async fn missing_room_keys_can_be_requested_once() {
        let (alice, bob) = get_machine_pair().await;
        let room_id = room_id!("!test:localhost");

        // Alice encrypts without ever sharing the session with bob.
        alice.share_room_key(room_id, &[], EncryptionSettings::default()).await.unwrap();
        let encrypted = alice
            .encrypt_room_event(room_id, "m.room.message", &json!({ "body": "hello" }))
            .await
            .unwrap();

        let event = EncryptedEvent {
            sender: alice.user_id().to_owned(),
            event_id: None,
            origin_server_ts: None,
            room_id: Some(room_id.to_owned()),
            content: encrypted.deserialize().unwrap(),
        };

        let result = bob.decrypt_room_event(&event).await;
        assert_matches!(result, Err(MegolmError::MissingRoomKey(None)));

        let request = bob.request_room_key(&event).await.unwrap();
        assert!(request.is_some());

        // A second request for the same key is deduplicated.
        let request = bob.request_room_key(&event).await.unwrap();
        assert!(request.is_none());
    }

    #[test]
    fn key_provider_exposes_the_account_identity() {
        let machine = alice_machine();
        let provider = machine.key_provider();

        assert_eq!(provider.user_id(), machine.user_id());
        assert_eq!(provider.device_id(), machine.device_id());
        assert_eq!(provider.ed25519_key(), machine.identity_keys().ed25519);
        assert_eq!(provider.curve25519_key(), machine.identity_keys().curve25519);
    }

    #[tokio::test]
    async fn wedged_sessions_are_replaced_through_key_claims() {
        let (alice, bob) = get_machine_pair().await;

        // An Olm message that was encrypted for a different device can't be
        // decrypted by bob, no matter what its recipient key claims.
        let charlie = OlmMachine::new(user_id!("@charlie:localhost"), device_id!("CHARLIE"));
        let charlie_device = Device::new(charlie.account.device_keys().await, LocalTrust::Unset);
        let (mut alice_session, _) = alice.account.create_session_for(&charlie.account).await;

        let content =
            alice_session.encrypt(&charlie_device, "m.dummy", json!({})).await.unwrap();
        let RoomEncryptedContent::OlmV1Curve25519AesSha2(content) = content else {
            panic!("An Olm session should produce Olm encrypted content");
        };

        let event = serde_json::to_value(RoomEncryptedContent::OlmV1Curve25519AesSha2(
            OlmV1Curve25519AesSha2Content {
                ciphertext: content.ciphertext,
                recipient_key: bob.identity_keys().curve25519,
                sender_key: content.sender_key,
            },
        ))
        .unwrap();

        let result =
            bob.receive_to_device_event(alice.user_id(), "m.room.encrypted", &event).await;
        assert_matches!(result, Err(OlmError::SessionWedged(..)));

        // The device owning the session is now waiting for a key claim.
        let users = bob.users_for_key_claim();
        assert!(users[alice.user_id()].contains(alice.device_id()));

        // A renewed failure within the unwedging interval doesn't queue the
        // device up twice.
        let result =
            bob.receive_to_device_event(alice.user_id(), "m.room.encrypted", &event).await;
        assert_matches!(result, Err(OlmError::SessionWedged(..)));
        assert_eq!(bob.users_for_key_claim()[alice.user_id()].len(), 1);

        // Claiming a one-time key and creating the replacement session clears
        // the queue and produces the keep-alive for the other side.
        alice.account.generate_one_time_keys_if_needed().await;
        let one_time_key =
            alice.account.signed_keys_for_upload().await.into_values().next().unwrap();
        let alice_device =
            bob.get_device(alice.user_id(), alice.device_id()).await.unwrap().unwrap();

        let request = bob
            .create_outbound_session(&alice_device, &one_time_key)
            .await
            .unwrap()
            .expect("Replacing a wedged session should produce a keep-alive message");

        assert_eq!(request.event_type, "m.room.encrypted");
        assert!(bob.users_for_key_claim().is_empty());

        let payload = deliver(&bob, &alice, &request).await.unwrap();
        assert_eq!(payload.event_type, "m.dummy");
    }

    #[tokio::test]
    async fn device_keys_with_bad_signatures_are_rejected() {
        let alice = alice_machine();
        let bob = bob_machine();

        let mut device_keys = bob.account.device_keys().await;

        let changes = alice.receive_device_keys([device_keys.clone()]).await.unwrap();
        assert_eq!(changes.new.len(), 1);

        device_keys.signatures.clear();
        let charlie = OlmMachine::new(user_id!("@charlie:localhost"), device_id!("CHARLIE"));
        let changes = charlie.receive_device_keys([device_keys]).await.unwrap();
        assert!(changes.is_empty());
    }

    #[tokio::test]
    async fn gossiped_backup_key_is_imported() {
        let machine = alice_machine();
        let key = BackupDecryptionKey::new();

        machine.import_secret(MEGOLM_BACKUP_SECRET, &key.to_base64()).await.unwrap();

        let stored = machine.backup_machine().get_backup_keys().await.unwrap();
        assert_eq!(
            stored.decryption_key.unwrap().megolm_v1_public_key().to_base64(),
            key.megolm_v1_public_key().to_base64()
        );
    }
}
