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

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, SecondsSinceUnixEpoch, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, trace};
use vodozemac::{
    base64_encode,
    olm::{
        Account as InnerAccount, AccountPickle, IdentityKeys, OlmMessage, PreKeyMessage,
        SessionConfig,
    },
    Curve25519PublicKey, Ed25519Signature, KeyId,
};

use super::{PickledSession, Session};
use crate::{
    error::{SessionCreationError, SignatureError},
    identities::Device,
    types::{to_signable_json, DeviceKeys, EventEncryptionAlgorithm, SignedKey},
};

/// The static identity data of our own device.
///
/// This never changes for the lifetime of the account, so it can be freely
/// cloned and handed to the subsystems that need to know who we are.
#[derive(Clone, Debug)]
pub struct StaticAccountData {
    /// The ID of the user the account belongs to.
    pub user_id: OwnedUserId,
    /// The ID of the device the account belongs to.
    pub device_id: OwnedDeviceId,
    /// The long lived public identity keys of the account.
    pub identity_keys: Arc<IdentityKeys>,
    /// The time the account was created, in seconds since the unix epoch.
    pub creation_local_time: SecondsSinceUnixEpoch,
}

impl StaticAccountData {
    /// The Ed25519 key of the account, used to sign our uploads.
    pub fn ed25519_key(&self) -> vodozemac::Ed25519PublicKey {
        self.identity_keys.ed25519
    }

    /// The Curve25519 key of the account, used to establish Olm sessions.
    pub fn curve25519_key(&self) -> Curve25519PublicKey {
        self.identity_keys.curve25519
    }
}

/// The result of an inbound Olm session creation, the session and the
/// plaintext of the pre-key message that created it.
pub struct InboundCreationResult {
    /// The newly created Olm session.
    pub session: Session,
    /// The decrypted payload of the pre-key message.
    pub plaintext: Vec<u8>,
}

/// A hash of a successfully decrypted Olm message, used to detect replays.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct OlmMessageHash {
    /// The Curve25519 key of the device that sent us the message.
    pub sender_key: String,
    /// The hash of the message.
    pub hash: String,
}

impl OlmMessageHash {
    pub(crate) fn new(sender_key: Curve25519PublicKey, ciphertext: &OlmMessage) -> Self {
        let (message_type, ciphertext) = ciphertext.clone().to_parts();
        let sender_key = sender_key.to_base64();

        let sha = Sha256::new()
            .chain_update(sender_key.as_bytes())
            .chain_update([message_type as u8])
            .chain_update(ciphertext)
            .finalize();

        Self { sender_key, hash: base64_encode(sha.as_slice()) }
    }
}

/// A serializable form of the account, suitable for persisting.
#[derive(Serialize, Deserialize)]
#[allow(missing_debug_implementations)]
pub struct PickledAccount {
    /// The user id of the account owner.
    pub user_id: OwnedUserId,
    /// The device id of the account owner.
    pub device_id: OwnedDeviceId,
    /// The pickled version of the Olm account.
    pub pickle: AccountPickle,
    /// Was the account shared with the homeserver.
    pub shared: bool,
    /// The number of uploaded one-time keys the homeserver still has.
    pub uploaded_signed_key_count: u64,
    /// The time the account was created.
    #[serde(default = "default_account_creation_time")]
    pub creation_local_time: SecondsSinceUnixEpoch,
}

fn default_account_creation_time() -> SecondsSinceUnixEpoch {
    SecondsSinceUnixEpoch(ruma::UInt::default())
}

/// Our own Olm account, holding the long lived identity keys and the one-time
/// key machinery that Olm session establishment needs.
#[derive(Clone)]
pub struct Account {
    static_data: StaticAccountData,
    inner: Arc<Mutex<InnerAccount>>,
    shared: Arc<AtomicBool>,
    /// The number of signed one-time keys we have uploaded to the server. If
    /// this is None, no action will be taken. After a sync request the client
    /// needs to update this count.
    uploaded_signed_key_count: Arc<AtomicU64>,
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("user_id", &self.user_id())
            .field("device_id", &self.device_id())
            .field("identity_keys", &self.identity_keys())
            .field("shared", &self.shared())
            .finish()
    }
}

impl Account {
    const ALGORITHMS: [EventEncryptionAlgorithm; 2] = [
        EventEncryptionAlgorithm::OlmV1Curve25519AesSha2,
        EventEncryptionAlgorithm::MegolmV1AesSha2,
    ];

    /// Create a fresh account for the given user and device.
    pub fn new(user_id: &UserId, device_id: &DeviceId) -> Self {
        let account = InnerAccount::new();
        let identity_keys = account.identity_keys();

        Self {
            static_data: StaticAccountData {
                user_id: user_id.to_owned(),
                device_id: device_id.to_owned(),
                identity_keys: Arc::new(identity_keys),
                creation_local_time: SecondsSinceUnixEpoch::now(),
            },
            inner: Arc::new(Mutex::new(account)),
            shared: Arc::new(AtomicBool::new(false)),
            uploaded_signed_key_count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// The static identity data of the account.
    pub fn static_data(&self) -> &StaticAccountData {
        &self.static_data
    }

    pub fn user_id(&self) -> &UserId {
        &self.static_data.user_id
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.static_data.device_id
    }

    pub fn identity_keys(&self) -> IdentityKeys {
        (*self.static_data.identity_keys).clone()
    }

    /// Has the account been shared with the homeserver.
    pub fn shared(&self) -> bool {
        self.shared.load(Ordering::SeqCst)
    }

    /// Mark the account as shared, meaning our device keys were uploaded.
    pub fn mark_as_shared(&self) {
        self.shared.store(true, Ordering::SeqCst);
    }

    /// The number of our one-time keys the homeserver still holds.
    pub fn uploaded_key_count(&self) -> u64 {
        self.uploaded_signed_key_count.load(Ordering::SeqCst)
    }

    /// Update the count of one-time keys the homeserver still holds, taken
    /// from a sync response.
    pub fn update_uploaded_key_count(&self, new_count: u64) {
        self.uploaded_signed_key_count.store(new_count, Ordering::SeqCst);
    }

    /// The currently unpublished one-time keys.
    pub async fn one_time_keys(&self) -> HashMap<KeyId, Curve25519PublicKey> {
        self.inner.lock().await.one_time_keys()
    }

    /// The currently unpublished fallback key.
    pub async fn fallback_key(&self) -> HashMap<KeyId, Curve25519PublicKey> {
        self.inner.lock().await.fallback_key()
    }

    /// Generate enough one-time keys to fill up half of the server-side
    /// limit, taking the keys the server still holds into account.
    ///
    /// Returns the number of newly generated keys, or `None` if the server
    /// already has enough of them.
    pub async fn generate_one_time_keys_if_needed(&self) -> Option<u64> {
        let mut account = self.inner.lock().await;

        let max_keys = account.max_number_of_one_time_keys() as u64;
        let target = max_keys / 2;
        let uploaded = self.uploaded_key_count();
        let unpublished = account.one_time_keys().len() as u64;

        if target <= uploaded + unpublished {
            return None;
        }

        let count = target - uploaded - unpublished;
        account.generate_one_time_keys(count as usize);

        trace!(count, "Generated new one-time keys");

        Some(count)
    }

    /// Generate a new fallback key, to be used when our one-time keys run
    /// out.
    pub async fn generate_fallback_key(&self) {
        debug!("Generating a new fallback key");
        self.inner.lock().await.generate_fallback_key();
    }

    /// Mark the one-time and fallback keys as published, the server holds
    /// them now.
    pub async fn mark_keys_as_published(&self) {
        self.inner.lock().await.mark_keys_as_published();
    }

    /// Sign the given string with the account's Ed25519 key.
    pub async fn sign(&self, string: &str) -> Ed25519Signature {
        self.inner.lock().await.sign(string)
    }

    /// Sign the given JSON object, after converting it to its canonical form
    /// with the `signatures` and `unsigned` fields removed.
    pub async fn sign_json(&self, json: Value) -> Result<Ed25519Signature, SignatureError> {
        let message = to_signable_json(json)?;
        Ok(self.sign(&message).await)
    }

    /// The device keys of the account, signed and ready for upload.
    pub async fn device_keys(&self) -> DeviceKeys {
        let identity_keys = self.identity_keys();

        let mut device_keys = DeviceKeys {
            user_id: self.user_id().to_owned(),
            device_id: self.device_id().to_owned(),
            algorithms: Self::ALGORITHMS.to_vec(),
            keys: BTreeMap::from([
                (
                    format!("curve25519:{}", self.device_id()),
                    identity_keys.curve25519.to_base64(),
                ),
                (format!("ed25519:{}", self.device_id()), identity_keys.ed25519.to_base64()),
            ]),
            signatures: Default::default(),
            unsigned: Default::default(),
        };

        if let Ok(json) = serde_json::to_value(&device_keys) {
            if let Ok(signature) = self.sign_json(json).await {
                device_keys
                    .signatures
                    .entry(self.user_id().to_owned())
                    .or_default()
                    .insert(format!("ed25519:{}", self.device_id()), signature.to_base64());
            }
        }

        device_keys
    }

    /// The unpublished one-time and fallback keys, signed and keyed the way
    /// the `/keys/upload` request expects them.
    pub async fn signed_keys_for_upload(&self) -> BTreeMap<String, SignedKey> {
        let one_time_keys = self.one_time_keys().await;
        let fallback_key = self.fallback_key().await;

        let mut signed_keys = BTreeMap::new();

        for (fallback, keys) in [(false, one_time_keys), (true, fallback_key)] {
            for (key_id, key) in keys {
                let mut signed = SignedKey { key, signatures: Default::default(), fallback };

                if let Ok(json) = serde_json::to_value(&signed) {
                    if let Ok(signature) = self.sign_json(json).await {
                        signed.signatures.entry(self.user_id().to_owned()).or_default().insert(
                            format!("ed25519:{}", self.device_id()),
                            signature.to_base64(),
                        );
                    }
                }

                signed_keys.insert(format!("signed_curve25519:{}", key_id.to_base64()), signed);
            }
        }

        signed_keys
    }

    /// Create a new outbound Olm session with the given device, using the
    /// signed one-time key we claimed for it.
    ///
    /// The signature of the one-time key is checked with the device's Ed25519
    /// key before the session is created.
    pub async fn create_outbound_session(
        &self,
        device: &Device,
        one_time_key: &SignedKey,
    ) -> Result<Session, SessionCreationError> {
        let user_id = device.user_id().to_owned();
        let device_id = device.device_id().to_owned();

        let identity_key = device.curve25519_key().ok_or_else(|| {
            SessionCreationError::DeviceMissingCurveKey(user_id.clone(), device_id.clone())
        })?;

        device
            .verify_one_time_key(one_time_key)
            .map_err(|e| SessionCreationError::InvalidSignature(user_id, device_id, e))?;

        let session = self.inner.lock().await.create_outbound_session(
            SessionConfig::version_1(),
            identity_key,
            one_time_key.key,
        );

        let now = SecondsSinceUnixEpoch::now();

        Ok(Session {
            our_device_keys: Arc::new(self.device_keys().await),
            session_id: session.session_id().into(),
            inner: Arc::new(Mutex::new(session)),
            sender_key: identity_key,
            created_using_fallback_key: one_time_key.fallback,
            creation_time: now,
            last_use_time: now,
        })
    }

    /// Create a new inbound Olm session from the given pre-key message.
    ///
    /// Returns the session and the plaintext of the message that created it.
    pub async fn create_inbound_session(
        &self,
        sender_key: Curve25519PublicKey,
        message: &PreKeyMessage,
    ) -> Result<InboundCreationResult, SessionCreationError> {
        debug!(session_id = message.session_id(), "Creating a new Olm session from a pre-key message");

        let result =
            self.inner.lock().await.create_inbound_session(sender_key, message).map_err(|e| {
                SessionCreationError::InboundCreation(
                    self.user_id().to_owned(),
                    sender_key.to_base64(),
                    e,
                )
            })?;

        let now = SecondsSinceUnixEpoch::now();

        Ok(InboundCreationResult {
            session: Session {
                our_device_keys: Arc::new(self.device_keys().await),
                session_id: result.session.session_id().into(),
                inner: Arc::new(Mutex::new(result.session)),
                sender_key,
                created_using_fallback_key: false,
                creation_time: now,
                last_use_time: now,
            },
            plaintext: result.plaintext,
        })
    }

    /// Serialize the account to a storable form.
    pub async fn pickle(&self) -> PickledAccount {
        let pickle = self.inner.lock().await.pickle();

        PickledAccount {
            user_id: self.user_id().to_owned(),
            device_id: self.device_id().to_owned(),
            pickle,
            shared: self.shared(),
            uploaded_signed_key_count: self.uploaded_key_count(),
            creation_local_time: self.static_data.creation_local_time,
        }
    }

    /// Restore an account from its previously pickled form.
    pub fn from_pickle(pickle: PickledAccount) -> Self {
        let account = InnerAccount::from_pickle(pickle.pickle);
        let identity_keys = account.identity_keys();

        Self {
            static_data: StaticAccountData {
                user_id: pickle.user_id,
                device_id: pickle.device_id,
                identity_keys: Arc::new(identity_keys),
                creation_local_time: pickle.creation_local_time,
            },
            inner: Arc::new(Mutex::new(account)),
            shared: Arc::new(AtomicBool::new(pickle.shared)),
            uploaded_signed_key_count: Arc::new(AtomicU64::new(pickle.uploaded_signed_key_count)),
        }
    }

    /// Create a pair of established Olm sessions between this account and the
    /// given one, bypassing the one-time key claiming that normally drives
    /// this.
    #[cfg(any(test, feature = "testing"))]
    pub async fn create_session_for(&self, other: &Account) -> (Session, Session) {
        use crate::types::events::{OlmV1Curve25519AesSha2Content, RoomEncryptedContent};

        other.generate_one_time_keys_if_needed().await;
        let one_time_key =
            *other.one_time_keys().await.values().next().expect("The other account should have a one-time key");
        other.mark_keys_as_published().await;

        let session = self.inner.lock().await.create_outbound_session(
            SessionConfig::version_1(),
            other.identity_keys().curve25519,
            one_time_key,
        );

        let now = SecondsSinceUnixEpoch::now();

        let mut our_session = Session {
            our_device_keys: Arc::new(self.device_keys().await),
            session_id: session.session_id().into(),
            inner: Arc::new(Mutex::new(session)),
            sender_key: other.identity_keys().curve25519,
            created_using_fallback_key: false,
            creation_time: now,
            last_use_time: now,
        };

        let device = Device::from_account(other).await;
        let content = our_session
            .encrypt(&device, "m.dummy", serde_json::json!({}))
            .await
            .expect("We should be able to encrypt a dummy event");

        let RoomEncryptedContent::OlmV1Curve25519AesSha2(OlmV1Curve25519AesSha2Content {
            ciphertext: OlmMessage::PreKey(message),
            ..
        }) = content
        else {
            panic!("The first message of a new session should be a pre-key message");
        };

        let their_session = other
            .create_inbound_session(self.identity_keys().curve25519, &message)
            .await
            .expect("The other account should be able to create an inbound session")
            .session;

        (our_session, their_session)
    }
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, user_id};

    use super::*;

    #[tokio::test]
    async fn one_time_key_generation() {
        let account = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));

        let generated = account
            .generate_one_time_keys_if_needed()
            .await
            .expect("A fresh account needs to generate one-time keys");
        assert!(generated > 0);
        assert_eq!(account.one_time_keys().await.len() as u64, generated);

        // The keys are unpublished, so asking again is a no-op.
        assert!(account.generate_one_time_keys_if_needed().await.is_none());

        account.mark_keys_as_published().await;
        account.update_uploaded_key_count(generated);

        assert!(account.one_time_keys().await.is_empty());
        assert!(account.generate_one_time_keys_if_needed().await.is_none());

        // The server used up most of our keys, we need to replenish.
        account.update_uploaded_key_count(2);
        assert!(account.generate_one_time_keys_if_needed().await.is_some());
    }

    #[tokio::test]
    async fn device_keys_are_signed() {
        let account = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        let device_keys = account.device_keys().await;

        let json = serde_json::to_value(&device_keys).unwrap();

        crate::types::verify_signed_json(
            account.identity_keys().ed25519,
            account.user_id(),
            account.device_id(),
            &json,
        )
        .expect("The device keys should be self-signed");
    }

    #[tokio::test]
    async fn account_pickling_cycle() {
        let account = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        account.mark_as_shared();

        let pickle = account.pickle().await;
        let restored = Account::from_pickle(pickle);

        assert_eq!(account.identity_keys(), restored.identity_keys());
        assert_eq!(account.user_id(), restored.user_id());
        assert!(restored.shared());
    }
}
