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
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use ruma::{OwnedRoomId, RoomId};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use vodozemac::{
    megolm::{
        InboundGroupSession as InnerSession, InboundGroupSessionPickle, MegolmMessage,
        SessionConfig, SessionKey, SessionOrdering,
    },
    Curve25519PublicKey, Ed25519PublicKey,
};

use super::{BackedUpRoomKey, ExportedRoomKey};
use crate::{
    error::{EventError, MegolmError},
    types::{
        deserialize_curve_key, events::ForwardedRoomKeyContent, serialize_curve_key,
        EventEncryptionAlgorithm,
    },
};

/// Information about the creator of an inbound group session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionCreatorInfo {
    /// The Curve25519 key of the device which initiated the session.
    #[serde(
        rename = "sender_key",
        deserialize_with = "deserialize_curve_key",
        serialize_with = "serialize_curve_key"
    )]
    pub curve25519_key: Curve25519PublicKey,

    /// The signing keys the creating device claimed to have, usually just an
    /// `ed25519` entry.
    ///
    /// The keys are claimed, not proven: for a session received via an
    /// `m.forwarded_room_key` event nothing ties them to the original
    /// device.
    pub signing_keys: Arc<BTreeMap<String, String>>,
}

/// A Megolm session of another device that we use to decrypt their room
/// messages.
#[derive(Clone)]
pub struct InboundGroupSession {
    inner: Arc<Mutex<InnerSession>>,
    session_id: Arc<str>,
    first_known_index: u32,

    /// Information about the device that created the session.
    pub creator_info: SessionCreatorInfo,

    /// The room the session is used in.
    pub room_id: OwnedRoomId,

    /// The chain of Curve25519 keys the session was forwarded through, empty
    /// for directly received sessions.
    pub forwarding_curve25519_key_chain: Arc<Vec<String>>,

    /// Was the session received via an `m.forwarded_room_key` event or a key
    /// import, rather than directly over a secure Olm channel.
    pub imported: bool,

    algorithm: EventEncryptionAlgorithm,
    backed_up: Arc<AtomicBool>,
}

impl fmt::Debug for InboundGroupSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundGroupSession")
            .field("session_id", &self.session_id())
            .field("room_id", &self.room_id)
            .field("imported", &self.imported)
            .finish()
    }
}

impl InboundGroupSession {
    /// Create a new session from a session key that was received directly via
    /// an `m.room_key` event.
    pub fn new(
        sender_key: Curve25519PublicKey,
        signing_key: Ed25519PublicKey,
        room_id: &RoomId,
        session_key: &SessionKey,
        algorithm: EventEncryptionAlgorithm,
    ) -> Result<Self, MegolmError> {
        if algorithm != EventEncryptionAlgorithm::MegolmV1AesSha2 {
            return Err(EventError::UnsupportedAlgorithm(algorithm.to_string()).into());
        }

        let session = InnerSession::new(session_key, SessionConfig::version_1());
        let session_id = session.session_id();
        let first_known_index = session.first_known_index();

        Ok(Self {
            inner: Arc::new(Mutex::new(session)),
            session_id: session_id.into(),
            first_known_index,
            creator_info: SessionCreatorInfo {
                curve25519_key: sender_key,
                signing_keys: Arc::new(BTreeMap::from([(
                    "ed25519".to_owned(),
                    signing_key.to_base64(),
                )])),
            },
            room_id: room_id.to_owned(),
            forwarding_curve25519_key_chain: Arc::new(Vec::new()),
            imported: false,
            algorithm,
            backed_up: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Create a session from an exported room key, e.g. one restored from a
    /// backup or a key export file.
    pub fn from_export(key: &ExportedRoomKey) -> Result<Self, MegolmError> {
        if key.algorithm != EventEncryptionAlgorithm::MegolmV1AesSha2 {
            return Err(EventError::UnsupportedAlgorithm(key.algorithm.to_string()).into());
        }

        let session = InnerSession::import(&key.session_key, SessionConfig::version_1());
        let first_known_index = session.first_known_index();

        Ok(Self {
            inner: Arc::new(Mutex::new(session)),
            session_id: key.session_id.as_str().into(),
            first_known_index,
            creator_info: SessionCreatorInfo {
                curve25519_key: key.sender_key,
                signing_keys: Arc::new(key.sender_claimed_keys.clone()),
            },
            room_id: key.room_id.clone(),
            forwarding_curve25519_key_chain: Arc::new(
                key.forwarding_curve25519_key_chain.clone(),
            ),
            imported: true,
            algorithm: key.algorithm.clone(),
            backed_up: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Create a session from an `m.forwarded_room_key` event, extending the
    /// forwarding chain with the key of the device that forwarded it to us.
    pub fn from_forwarded(
        forwarder_key: Curve25519PublicKey,
        content: &ForwardedRoomKeyContent,
    ) -> Result<Self, MegolmError> {
        if content.algorithm != EventEncryptionAlgorithm::MegolmV1AesSha2 {
            return Err(EventError::UnsupportedAlgorithm(content.algorithm.to_string()).into());
        }

        let session = InnerSession::import(&content.session_key, SessionConfig::version_1());
        let first_known_index = session.first_known_index();

        let mut chain = content.forwarding_curve25519_key_chain.clone();
        chain.push(forwarder_key.to_base64());

        Ok(Self {
            inner: Arc::new(Mutex::new(session)),
            session_id: content.session_id.as_str().into(),
            first_known_index,
            creator_info: SessionCreatorInfo {
                curve25519_key: content.claimed_sender_key,
                signing_keys: Arc::new(BTreeMap::from([(
                    "ed25519".to_owned(),
                    content.sender_claimed_ed25519_key.clone(),
                )])),
            },
            room_id: content.room_id.clone(),
            forwarding_curve25519_key_chain: Arc::new(chain),
            imported: true,
            algorithm: content.algorithm.clone(),
            backed_up: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The unique ID of the session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The lowest ratchet index we can decrypt from.
    pub fn first_known_index(&self) -> u32 {
        self.first_known_index
    }

    pub fn algorithm(&self) -> &EventEncryptionAlgorithm {
        &self.algorithm
    }

    /// Has the session been uploaded to the key backup.
    pub fn backed_up(&self) -> bool {
        self.backed_up.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_as_backed_up(&self) {
        self.backed_up.store(true, Ordering::SeqCst);
    }

    /// Clear the backup flag, e.g. because the user switched to a new backup
    /// version and everything needs re-uploading.
    pub(crate) fn reset_backup_state(&self) {
        self.backed_up.store(false, Ordering::SeqCst);
    }

    /// Decrypt a Megolm message with this session.
    ///
    /// The room the encrypted event claims to come from needs to match the
    /// room the session was created for, otherwise an attacker could replay
    /// a message into a different room.
    pub async fn decrypt(
        &self,
        event_room_id: Option<&RoomId>,
        message: &MegolmMessage,
    ) -> Result<(Vec<u8>, u32), MegolmError> {
        if event_room_id != Some(&self.room_id) {
            return Err(EventError::MismatchedRoom(
                event_room_id.map(|r| r.to_owned()),
                self.room_id.clone(),
            )
            .into());
        }

        let decrypted = self.inner.lock().await.decrypt(message)?;

        Ok((decrypted.plaintext, decrypted.message_index))
    }

    /// Export the session at the given ratchet index.
    ///
    /// Returns `None` if the requested index is lower than our first known
    /// index, we can't hand out history we never had.
    pub async fn export_at_index(&self, message_index: u32) -> Option<ExportedRoomKey> {
        let session_key = self.inner.lock().await.export_at(message_index)?;

        Some(ExportedRoomKey {
            algorithm: self.algorithm.clone(),
            room_id: self.room_id.clone(),
            sender_key: self.creator_info.curve25519_key,
            session_id: self.session_id.to_string(),
            session_key,
            sender_claimed_keys: self.creator_info.signing_keys.as_ref().clone(),
            forwarding_curve25519_key_chain: self.forwarding_curve25519_key_chain.as_ref().clone(),
        })
    }

    /// Export the session at its earliest known index.
    pub async fn export(&self) -> ExportedRoomKey {
        self.export_at_index(self.first_known_index())
            .await
            .expect("A session can always be exported at its first known index")
    }

    /// The session in the form the key backup uploads.
    pub async fn to_backup(&self) -> BackedUpRoomKey {
        self.export().await.into()
    }

    /// Compare this session to another copy claiming the same session ID.
    ///
    /// A session that can decrypt from an earlier ratchet index is the better
    /// one; unconnected ratchets mean one of the two keys is forged.
    pub async fn compare(&self, other: &InboundGroupSession) -> SessionOrdering {
        if self.session_id() != other.session_id() {
            SessionOrdering::Unconnected
        } else {
            let mut other_inner = other.inner.lock().await;
            self.inner.lock().await.compare(&mut other_inner)
        }
    }

    /// Serialize the session to a storable form.
    pub async fn pickle(&self) -> PickledInboundGroupSession {
        PickledInboundGroupSession {
            pickle: self.inner.lock().await.pickle(),
            sender_key: self.creator_info.curve25519_key,
            signing_key: self.creator_info.signing_keys.as_ref().clone(),
            room_id: self.room_id.clone(),
            forwarding_chains: self.forwarding_curve25519_key_chain.as_ref().clone(),
            imported: self.imported,
            backed_up: self.backed_up(),
            algorithm: self.algorithm.clone(),
        }
    }

    /// Restore the session from its previously pickled form.
    pub fn from_pickle(pickle: PickledInboundGroupSession) -> Self {
        let session = InnerSession::from_pickle(pickle.pickle);
        let session_id = session.session_id();
        let first_known_index = session.first_known_index();

        Self {
            inner: Arc::new(Mutex::new(session)),
            session_id: session_id.into(),
            first_known_index,
            creator_info: SessionCreatorInfo {
                curve25519_key: pickle.sender_key,
                signing_keys: Arc::new(pickle.signing_key),
            },
            room_id: pickle.room_id,
            forwarding_curve25519_key_chain: Arc::new(pickle.forwarding_chains),
            imported: pickle.imported,
            algorithm: pickle.algorithm,
            backed_up: Arc::new(AtomicBool::new(pickle.backed_up)),
        }
    }
}

/// A serializable form of an inbound group session.
#[derive(Serialize, Deserialize)]
#[allow(missing_debug_implementations)]
pub struct PickledInboundGroupSession {
    /// The pickled version of the session itself.
    pub pickle: InboundGroupSessionPickle,
    /// The Curve25519 key of the device which initiated the session.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub sender_key: Curve25519PublicKey,
    /// The claimed signing keys of the device which initiated the session.
    pub signing_key: BTreeMap<String, String>,
    /// The room the session is used in.
    pub room_id: OwnedRoomId,
    /// The chain of Curve25519 keys the session was forwarded through.
    #[serde(default)]
    pub forwarding_chains: Vec<String>,
    /// Was the session imported rather than received directly.
    pub imported: bool,
    /// Was the session backed up.
    #[serde(default)]
    pub backed_up: bool,
    /// The algorithm of the session.
    pub algorithm: EventEncryptionAlgorithm,
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use ruma::room_id;
    use vodozemac::megolm::GroupSession;

    use super::*;

    fn session_pair() -> (GroupSession, InboundGroupSession) {
        let outbound = GroupSession::new(SessionConfig::version_1());

        let sender_key = Curve25519PublicKey::from_base64(
            "ClCcCcqKWmBZLmEbeQjBhQBCBGWaXLCvjHKVKFgNWSY",
        )
        .unwrap();
        let signing_key = vodozemac::Ed25519Keypair::new().public_key();

        let inbound = InboundGroupSession::new(
            sender_key,
            signing_key,
            room_id!("!test:localhost"),
            &outbound.session_key(),
            EventEncryptionAlgorithm::MegolmV1AesSha2,
        )
        .unwrap();

        (outbound, inbound)
    }

    #[tokio::test]
    async fn decryption_roundtrip() {
        let (mut outbound, inbound) = session_pair();
        assert_eq!(outbound.session_id(), inbound.session_id());

        let message = outbound.encrypt(b"It's a secret to everybody".as_slice());
        let (plaintext, index) = inbound
            .decrypt(Some(room_id!("!test:localhost")), &message)
            .await
            .expect("The message should decrypt");

        assert_eq!(plaintext, b"It's a secret to everybody");
        assert_eq!(index, 0);
    }

    #[tokio::test]
    async fn mismatched_room_is_rejected() {
        let (mut outbound, inbound) = session_pair();
        let message = outbound.encrypt(b"secret".as_slice());

        let error = inbound
            .decrypt(Some(room_id!("!other:localhost")), &message)
            .await
            .expect_err("A message replayed into another room should be rejected");

        assert_matches!(
            error,
            MegolmError::EventError(EventError::MismatchedRoom(Some(_), _))
        );
    }

    #[tokio::test]
    async fn export_and_reimport_at_later_index() {
        let (mut outbound, inbound) = session_pair();

        let first = outbound.encrypt(b"one".as_slice());
        let second = outbound.encrypt(b"two".as_slice());

        let export = inbound.export_at_index(1).await.expect("Index 1 should be exportable");
        let reimported = InboundGroupSession::from_export(&export).unwrap();

        assert!(reimported.imported);
        assert_eq!(reimported.first_known_index(), 1);

        // The re-imported session only has the ratchet from index 1 onwards.
        reimported
            .decrypt(Some(room_id!("!test:localhost")), &second)
            .await
            .expect("A message at the exported index should decrypt");
        reimported
            .decrypt(Some(room_id!("!test:localhost")), &first)
            .await
            .expect_err("A message before the exported index should not decrypt");

        // Exporting below the first known index is refused.
        assert!(reimported.export_at_index(0).await.is_none());
    }

    #[tokio::test]
    async fn session_comparison() {
        let (mut outbound, inbound) = session_pair();
        outbound.encrypt(b"advance the ratchet".as_slice());

        let export = inbound.export_at_index(1).await.unwrap();
        let worse = InboundGroupSession::from_export(&export).unwrap();

        assert_eq!(inbound.compare(&worse).await, SessionOrdering::Better);
        assert_eq!(worse.compare(&inbound).await, SessionOrdering::Worse);
        assert_eq!(inbound.compare(&inbound).await, SessionOrdering::Equal);

        let (_, unrelated) = session_pair();
        assert_eq!(inbound.compare(&unrelated).await, SessionOrdering::Unconnected);
    }

    #[tokio::test]
    async fn pickling_cycle() {
        let (_, inbound) = session_pair();
        inbound.mark_as_backed_up();

        let pickle = inbound.pickle().await;
        let serialized = serde_json::to_string(&pickle).unwrap();
        let pickle: PickledInboundGroupSession = serde_json::from_str(&serialized).unwrap();

        let restored = InboundGroupSession::from_pickle(pickle);

        assert_eq!(restored.session_id(), inbound.session_id());
        assert_eq!(restored.room_id, inbound.room_id);
        assert!(restored.backed_up());
    }
}
