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
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, RwLock as StdRwLock,
    },
    time::Duration,
};

use ruma::{
    DeviceId, OwnedDeviceId, OwnedRoomId, OwnedTransactionId, OwnedUserId, RoomId,
    SecondsSinceUnixEpoch, TransactionId, UserId,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, error, info};
use vodozemac::{
    megolm::{GroupSession, GroupSessionPickle, MegolmMessage, SessionConfig, SessionKey},
    Curve25519PublicKey,
};

use crate::{
    error::EventError,
    olm::StaticAccountData,
    types::{
        deserialize_curve_key, serialize_curve_key,
        events::{MegolmV1AesSha2Content, RoomEncryptedContent, RoomKeyContent, ToDeviceRequest},
        EventEncryptionAlgorithm,
    },
};

const ROTATION_PERIOD: Duration = Duration::from_millis(604800000);
const ROTATION_MESSAGES: u64 = 100;

/// Settings that control when an outbound group session needs to be rotated
/// and who may receive it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionSettings {
    /// The encryption algorithm that should be used in the room.
    pub algorithm: EventEncryptionAlgorithm,

    /// How long the session should be used before changing it.
    pub rotation_period: Duration,

    /// How many messages should be encrypted using the session before
    /// changing it.
    pub rotation_period_msgs: u64,

    /// Should untrusted devices receive the room key, or should they be
    /// excluded from the conversation.
    pub only_allow_trusted_devices: bool,
}

impl Default for EncryptionSettings {
    fn default() -> Self {
        Self {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            rotation_period: ROTATION_PERIOD,
            rotation_period_msgs: ROTATION_MESSAGES,
            only_allow_trusted_devices: false,
        }
    }
}

/// Whether a device has received the session key of an outbound session, and
/// at which ratchet index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShareState {
    /// The session was never shared with the device.
    NotShared,
    /// The session was shared with a device that has the same ID but a
    /// different Curve25519 key, the key needs to be withheld.
    SharedButChangedSenderKey,
    /// The session was shared with the device.
    Shared {
        /// The ratchet index at which the device received the session.
        message_index: u32,
    },
}

/// Struct tying together the ratchet index a device received a session at
/// with the Curve25519 key the device had at that point.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShareInfo {
    /// The Curve25519 key of the device that received the session.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub sender_key: Curve25519PublicKey,
    /// The ratchet index the device received the session at.
    pub message_index: u32,
}

type ShareInfoSet = BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, ShareInfo>>;

/// The Megolm session we encrypt our own room messages with.
///
/// The session key needs to travel to every device in the room over Olm
/// channels before messages encrypted with it become readable; until then the
/// encrypted share requests sit in the pending request queue.
#[derive(Clone)]
pub struct OutboundGroupSession {
    inner: Arc<Mutex<GroupSession>>,
    device_id: OwnedDeviceId,
    account_identity_key: Curve25519PublicKey,
    session_id: Arc<str>,
    room_id: OwnedRoomId,
    pub(crate) creation_time: SecondsSinceUnixEpoch,
    message_count: Arc<AtomicU64>,
    shared: Arc<AtomicBool>,
    invalidated: Arc<AtomicBool>,
    settings: Arc<EncryptionSettings>,
    shared_with_set: Arc<StdRwLock<ShareInfoSet>>,
    to_share_with_set: Arc<StdRwLock<BTreeMap<OwnedTransactionId, (Arc<ToDeviceRequest>, ShareInfoSet)>>>,
}

impl fmt::Debug for OutboundGroupSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundGroupSession")
            .field("session_id", &self.session_id)
            .field("room_id", &self.room_id)
            .field("creation_time", &self.creation_time)
            .field("message_count", &self.message_count)
            .finish()
    }
}

impl OutboundGroupSession {
    /// Create a fresh outbound session for the given room.
    pub fn new(
        account: &StaticAccountData,
        room_id: &RoomId,
        settings: EncryptionSettings,
    ) -> Result<Self, EventError> {
        if settings.algorithm != EventEncryptionAlgorithm::MegolmV1AesSha2 {
            return Err(EventError::UnsupportedAlgorithm(settings.algorithm.to_string()));
        }

        let session = GroupSession::new(SessionConfig::version_1());
        let session_id = session.session_id();

        Ok(Self {
            inner: Arc::new(Mutex::new(session)),
            device_id: account.device_id.clone(),
            account_identity_key: account.curve25519_key(),
            session_id: session_id.into(),
            room_id: room_id.to_owned(),
            creation_time: SecondsSinceUnixEpoch::now(),
            message_count: Arc::new(AtomicU64::new(0)),
            shared: Arc::new(AtomicBool::new(false)),
            invalidated: Arc::new(AtomicBool::new(false)),
            settings: Arc::new(settings),
            shared_with_set: Default::default(),
            to_share_with_set: Default::default(),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn settings(&self) -> &EncryptionSettings {
        &self.settings
    }

    /// The current ratchet index of the session.
    pub async fn message_index(&self) -> u32 {
        self.inner.lock().await.message_index()
    }

    /// The exportable ratchet of the session at its current index.
    pub async fn session_key(&self) -> SessionKey {
        self.inner.lock().await.session_key()
    }

    /// Has the session outlived its rotation thresholds, either by message
    /// count or by age.
    pub fn expired(&self) -> bool {
        let message_count_limit = self.settings.rotation_period_msgs.clamp(1, 10_000);

        if self.message_count.load(Ordering::SeqCst) >= message_count_limit {
            return true;
        }

        // Rotating faster than once an hour would mostly churn through
        // one-time keys, clamp the period.
        let period = self.settings.rotation_period.max(Duration::from_secs(3600));

        self.creation_time
            .to_system_time()
            .and_then(|t| t.elapsed().ok())
            .is_some_and(|elapsed| elapsed >= period)
    }

    /// Mark the session as no longer usable for encryption, a new session
    /// will be created on the next encrypt call.
    ///
    /// Returns true if the session was active before the call.
    pub fn invalidate_session(&self) -> bool {
        !self.invalidated.swap(true, Ordering::SeqCst)
    }

    pub fn invalidated(&self) -> bool {
        self.invalidated.load(Ordering::SeqCst)
    }

    /// Has the session key been distributed to all the devices it was queued
    /// up for.
    pub fn shared(&self) -> bool {
        self.shared.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_as_shared(&self) {
        self.shared.store(true, Ordering::SeqCst);
    }

    /// Encrypt the given room event content with the session.
    pub async fn encrypt(&self, event_type: &str, content: &Value) -> RoomEncryptedContent {
        let payload = json!({
            "room_id": self.room_id,
            "type": event_type,
            "content": content,
        });

        let plaintext =
            serde_json::to_string(&payload).expect("A JSON object can always be serialized");
        let ciphertext = self.encrypt_helper(plaintext).await;

        RoomEncryptedContent::MegolmV1AesSha2(MegolmV1AesSha2Content {
            ciphertext,
            sender_key: self.account_identity_key,
            device_id: self.device_id.clone(),
            session_id: self.session_id.to_string(),
        })
    }

    pub(crate) async fn encrypt_helper(&self, plaintext: String) -> MegolmMessage {
        let mut session = self.inner.lock().await;
        self.message_count.fetch_add(1, Ordering::SeqCst);
        session.encrypt(&plaintext)
    }

    /// The content of the `m.room_key` to-device event that distributes this
    /// session.
    pub async fn as_room_key_content(&self) -> RoomKeyContent {
        RoomKeyContent {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            room_id: self.room_id.clone(),
            session_id: self.session_id.to_string(),
            session_key: self.session_key().await,
        }
    }

    /// Queue up a to-device request carrying this session key, to be marked
    /// as shared once the server confirms the request.
    pub fn add_request(
        &self,
        request_id: OwnedTransactionId,
        request: Arc<ToDeviceRequest>,
        share_infos: ShareInfoSet,
    ) {
        self.to_share_with_set
            .write()
            .expect("The share set lock should never be poisoned")
            .insert(request_id, (request, share_infos));
    }

    /// The share requests that still need to go out for this session.
    pub fn pending_requests(&self) -> Vec<Arc<ToDeviceRequest>> {
        self.to_share_with_set
            .read()
            .expect("The share set lock should never be poisoned")
            .values()
            .map(|(request, _)| request.clone())
            .collect()
    }

    /// The users the session key was already sent to, or is queued up for.
    pub fn shared_with_users(&self) -> Vec<OwnedUserId> {
        let mut users: Vec<_> = self
            .shared_with_set
            .read()
            .expect("The share set lock should never be poisoned")
            .keys()
            .cloned()
            .collect();

        let pending = self.to_share_with_set.read().expect("The share set lock should never be poisoned");
        users.extend(pending.values().flat_map(|(_, infos)| infos.keys().cloned()));

        users.sort_unstable();
        users.dedup();

        users
    }

    /// Mark the request with the given ID as sent, moving the devices it
    /// addressed into the shared set.
    ///
    /// When the last request is marked as sent, the whole session flips to
    /// shared.
    pub fn mark_request_as_sent(&self, request_id: &TransactionId) {
        let removed = self
            .to_share_with_set
            .write()
            .expect("The share set lock should never be poisoned")
            .remove(request_id);

        if let Some((_, share_infos)) = removed {
            debug!(
                request_id = request_id.to_string().as_str(),
                session_id = self.session_id(),
                "Marking to-device request carrying a room key as sent"
            );

            let mut shared_with = self
                .shared_with_set
                .write()
                .expect("The share set lock should never be poisoned");

            for (user_id, devices) in share_infos {
                shared_with.entry(user_id).or_default().extend(devices);
            }
        } else {
            error!(
                request_id = request_id.to_string().as_str(),
                "Tried to mark an unknown to-device request as sent"
            );
        }

        let queue_empty = self
            .to_share_with_set
            .read()
            .expect("The share set lock should never be poisoned")
            .is_empty();

        if queue_empty {
            if !self.shared() {
                info!(session_id = self.session_id(), "The session was shared with all devices");
            }
            self.mark_as_shared();
        }
    }

    pub(crate) fn mark_shared_with(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        sender_key: Curve25519PublicKey,
        message_index: u32,
    ) {
        self.shared_with_set
            .write()
            .expect("The share set lock should never be poisoned")
            .entry(user_id.to_owned())
            .or_default()
            .insert(device_id.to_owned(), ShareInfo { sender_key, message_index });
    }

    /// Did the device already receive this session, and if so does the key
    /// the device had back then still match.
    pub fn is_shared_with(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        sender_key: Curve25519PublicKey,
    ) -> ShareState {
        let check = |info: &ShareInfo| {
            if info.sender_key == sender_key {
                ShareState::Shared { message_index: info.message_index }
            } else {
                ShareState::SharedButChangedSenderKey
            }
        };

        let shared = self
            .shared_with_set
            .read()
            .expect("The share set lock should never be poisoned")
            .get(user_id)
            .and_then(|devices| devices.get(device_id))
            .map(check);

        if let Some(state) = shared {
            return state;
        }

        self.to_share_with_set
            .read()
            .expect("The share set lock should never be poisoned")
            .values()
            .find_map(|(_, infos)| infos.get(user_id).and_then(|devices| devices.get(device_id)))
            .map(check)
            .unwrap_or(ShareState::NotShared)
    }

    /// Serialize the session to a storable form.
    pub async fn pickle(&self) -> PickledOutboundGroupSession {
        PickledOutboundGroupSession {
            pickle: self.inner.lock().await.pickle(),
            room_id: self.room_id.clone(),
            settings: self.settings.as_ref().clone(),
            shared_with_set: self
                .shared_with_set
                .read()
                .expect("The share set lock should never be poisoned")
                .clone(),
            creation_time: self.creation_time,
            message_count: self.message_count.load(Ordering::SeqCst),
            shared: self.shared(),
            invalidated: self.invalidated(),
        }
    }

    /// Restore the session from its previously pickled form.
    ///
    /// Pending share requests are not persisted, an unshared restored session
    /// needs to be rotated before use.
    pub fn from_pickle(
        account: &StaticAccountData,
        pickle: PickledOutboundGroupSession,
    ) -> Self {
        let session = GroupSession::from_pickle(pickle.pickle);
        let session_id = session.session_id();

        Self {
            inner: Arc::new(Mutex::new(session)),
            device_id: account.device_id.clone(),
            account_identity_key: account.curve25519_key(),
            session_id: session_id.into(),
            room_id: pickle.room_id,
            creation_time: pickle.creation_time,
            message_count: Arc::new(AtomicU64::new(pickle.message_count)),
            shared: Arc::new(AtomicBool::new(pickle.shared)),
            invalidated: Arc::new(AtomicBool::new(pickle.invalidated)),
            settings: Arc::new(pickle.settings),
            shared_with_set: Arc::new(StdRwLock::new(pickle.shared_with_set)),
            to_share_with_set: Default::default(),
        }
    }
}

/// A serializable form of an outbound group session.
#[derive(Serialize, Deserialize)]
#[allow(missing_debug_implementations)]
pub struct PickledOutboundGroupSession {
    /// The pickled version of the session itself.
    pub pickle: GroupSessionPickle,
    /// The room the session is used in.
    pub room_id: OwnedRoomId,
    /// The settings the session was created under.
    pub settings: EncryptionSettings,
    /// The devices the session key was distributed to.
    pub shared_with_set: ShareInfoSet,
    /// The time the session was created.
    pub creation_time: SecondsSinceUnixEpoch,
    /// The number of messages the session encrypted so far.
    pub message_count: u64,
    /// Was the session key distributed to all the devices it needed to reach.
    pub shared: bool,
    /// Was the session invalidated.
    pub invalidated: bool,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ruma::{device_id, room_id, user_id};

    use super::*;
    use crate::olm::Account;

    fn outbound_session(settings: EncryptionSettings) -> OutboundGroupSession {
        let account = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));

        OutboundGroupSession::new(account.static_data(), room_id!("!test:localhost"), settings)
            .expect("We can always create a megolm v1 session")
    }

    #[tokio::test]
    async fn expiration_by_message_count() {
        let session = outbound_session(EncryptionSettings {
            rotation_period_msgs: 1,
            ..Default::default()
        });

        assert!(!session.expired());
        session.encrypt("m.room.message", &serde_json::json!({"body": "hello"})).await;
        assert!(session.expired());
    }

    #[tokio::test]
    async fn message_count_limit_is_clamped() {
        // A limit of zero would expire the session before its first use.
        let session = outbound_session(EncryptionSettings {
            rotation_period_msgs: 0,
            ..Default::default()
        });

        assert!(!session.expired());
        session.encrypt("m.room.message", &serde_json::json!({"body": "hello"})).await;
        assert!(session.expired());

        // And the upper bound caps at 10k messages.
        let session = outbound_session(EncryptionSettings {
            rotation_period_msgs: 1_000_000,
            ..Default::default()
        });
        assert_eq!(session.settings().rotation_period_msgs.clamp(1, 10_000), 10_000);
    }

    #[tokio::test]
    async fn sharing_state_machine() {
        let session = outbound_session(Default::default());
        let bob = user_id!("@bob:localhost");
        let bob_device = device_id!("BOBDEVICE");
        let bob_key = Curve25519PublicKey::from_base64(
            "ClCcCcqKWmBZLmEbeQjBhQBCBGWaXLCvjHKVKFgNWSY",
        )
        .unwrap();

        assert_eq!(session.is_shared_with(bob, bob_device, bob_key), ShareState::NotShared);
        assert!(!session.shared());

        let request = Arc::new(ToDeviceRequest::new("m.room.encrypted"));
        let request_id = request.txn_id.clone();
        let share_infos = BTreeMap::from([(
            bob.to_owned(),
            BTreeMap::from([(
                bob_device.to_owned(),
                ShareInfo { sender_key: bob_key, message_index: 0 },
            )]),
        )]);

        session.add_request(request_id.clone(), request, share_infos);

        // Queued but not yet sent still counts as shared for deduplication.
        assert_eq!(
            session.is_shared_with(bob, bob_device, bob_key),
            ShareState::Shared { message_index: 0 }
        );
        assert!(!session.shared());

        session.mark_request_as_sent(&request_id);

        assert!(session.shared());
        assert_eq!(
            session.is_shared_with(bob, bob_device, bob_key),
            ShareState::Shared { message_index: 0 }
        );

        // A device that rotated its Curve25519 key must not be treated as
        // having the session.
        let new_key = Curve25519PublicKey::from_base64(
            "mjkTX0I0Cp44ZfolOVbFe7WYPRmT6AxN4hYZ6efFcxo",
        )
        .unwrap();
        assert_eq!(
            session.is_shared_with(bob, bob_device, new_key),
            ShareState::SharedButChangedSenderKey
        );
    }

    #[tokio::test]
    async fn invalidation() {
        let session = outbound_session(Default::default());

        assert!(!session.invalidated());
        assert!(session.invalidate_session());
        assert!(session.invalidated());
        // A second invalidation is a no-op.
        assert!(!session.invalidate_session());
    }

    #[tokio::test]
    async fn pickling_cycle() {
        let account = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        let session = OutboundGroupSession::new(
            account.static_data(),
            room_id!("!test:localhost"),
            EncryptionSettings {
                rotation_period: Duration::from_secs(3600),
                rotation_period_msgs: 500,
                ..Default::default()
            },
        )
        .unwrap();

        session.encrypt("m.room.message", &serde_json::json!({"body": "one"})).await;

        let pickle = session.pickle().await;
        let serialized = serde_json::to_string(&pickle).unwrap();
        let pickle: PickledOutboundGroupSession = serde_json::from_str(&serialized).unwrap();

        let restored = OutboundGroupSession::from_pickle(account.static_data(), pickle);

        assert_eq!(restored.session_id(), session.session_id());
        assert_eq!(restored.room_id(), session.room_id());
        assert_eq!(restored.message_index().await, session.message_index().await);
        assert_eq!(restored.settings(), session.settings());
    }
}
