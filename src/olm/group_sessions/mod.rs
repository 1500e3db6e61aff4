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

mod inbound;
mod outbound;

use std::collections::BTreeMap;

use ruma::OwnedRoomId;
use serde::{Deserialize, Serialize};
use vodozemac::{megolm::ExportedSessionKey, Curve25519PublicKey};

pub use inbound::{InboundGroupSession, PickledInboundGroupSession, SessionCreatorInfo};
pub use outbound::{
    EncryptionSettings, OutboundGroupSession, PickledOutboundGroupSession, ShareInfo, ShareState,
};

use crate::types::{
    deserialize_curve_key, events::deserialize_exported_session_key,
    events::serialize_exported_session_key, serialize_curve_key, EventEncryptionAlgorithm,
};

/// An exported version of an `InboundGroupSession`.
///
/// This can be used to share the session with another device or to store it
/// in an encrypted key export file.
#[derive(Serialize, Deserialize)]
pub struct ExportedRoomKey {
    /// The encryption algorithm the session uses.
    pub algorithm: EventEncryptionAlgorithm,

    /// The room where the session is used.
    pub room_id: OwnedRoomId,

    /// The Curve25519 key of the device which initiated the session.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub sender_key: Curve25519PublicKey,

    /// The ID of the session.
    pub session_id: String,

    /// The key for the session.
    #[serde(
        serialize_with = "serialize_exported_session_key",
        deserialize_with = "deserialize_exported_session_key"
    )]
    pub session_key: ExportedSessionKey,

    /// The Ed25519 key of the device which initiated the session, as claimed
    /// by the sender.
    pub sender_claimed_keys: BTreeMap<String, String>,

    /// Chain of Curve25519 keys through which the session was forwarded, via
    /// `m.forwarded_room_key` events.
    #[serde(default)]
    pub forwarding_curve25519_key_chain: Vec<String>,
}

impl Clone for ExportedRoomKey {
    fn clone(&self) -> Self {
        Self {
            algorithm: self.algorithm.clone(),
            room_id: self.room_id.clone(),
            sender_key: self.sender_key,
            session_id: self.session_id.clone(),
            session_key: ExportedSessionKey::from_bytes(&self.session_key.to_bytes())
                .expect("a valid exported session key can be round-tripped through its byte encoding"),
            sender_claimed_keys: self.sender_claimed_keys.clone(),
            forwarding_curve25519_key_chain: self.forwarding_curve25519_key_chain.clone(),
        }
    }
}

impl std::fmt::Debug for ExportedRoomKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportedRoomKey")
            .field("algorithm", &self.algorithm)
            .field("room_id", &self.room_id)
            .field("sender_key", &self.sender_key)
            .field("session_id", &self.session_id)
            .field("sender_claimed_keys", &self.sender_claimed_keys)
            .field("forwarding_curve25519_key_chain", &self.forwarding_curve25519_key_chain)
            .finish_non_exhaustive()
    }
}

/// A Megolm session in the form the key backup stores it, inside the
/// encrypted `session_data` of a backed up key.
///
/// The room and session IDs are carried next to the encrypted blob, so they
/// don't appear here.
#[derive(Serialize, Deserialize)]
pub struct BackedUpRoomKey {
    /// The encryption algorithm the session uses.
    pub algorithm: EventEncryptionAlgorithm,

    /// The Curve25519 key of the device which initiated the session.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub sender_key: Curve25519PublicKey,

    /// The key for the session.
    #[serde(
        serialize_with = "serialize_exported_session_key",
        deserialize_with = "deserialize_exported_session_key"
    )]
    pub session_key: ExportedSessionKey,

    /// The Ed25519 key of the device which initiated the session, as claimed
    /// by the sender.
    pub sender_claimed_keys: BTreeMap<String, String>,

    /// Chain of Curve25519 keys through which the session was forwarded.
    #[serde(default)]
    pub forwarding_curve25519_key_chain: Vec<String>,
}

impl Clone for BackedUpRoomKey {
    fn clone(&self) -> Self {
        Self {
            algorithm: self.algorithm.clone(),
            sender_key: self.sender_key,
            session_key: ExportedSessionKey::from_bytes(&self.session_key.to_bytes())
                .expect("a valid exported session key can be round-tripped through its byte encoding"),
            sender_claimed_keys: self.sender_claimed_keys.clone(),
            forwarding_curve25519_key_chain: self.forwarding_curve25519_key_chain.clone(),
        }
    }
}

impl std::fmt::Debug for BackedUpRoomKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackedUpRoomKey")
            .field("algorithm", &self.algorithm)
            .field("sender_key", &self.sender_key)
            .field("sender_claimed_keys", &self.sender_claimed_keys)
            .field("forwarding_curve25519_key_chain", &self.forwarding_curve25519_key_chain)
            .finish_non_exhaustive()
    }
}

impl From<ExportedRoomKey> for BackedUpRoomKey {
    fn from(value: ExportedRoomKey) -> Self {
        Self {
            algorithm: value.algorithm,
            sender_key: value.sender_key,
            session_key: value.session_key,
            sender_claimed_keys: value.sender_claimed_keys,
            forwarding_curve25519_key_chain: value.forwarding_curve25519_key_chain,
        }
    }
}

impl BackedUpRoomKey {
    /// Upgrade the backed up key into an exported room key, re-attaching the
    /// room and session IDs the backup stored out of band.
    pub fn into_exported(self, room_id: OwnedRoomId, session_id: String) -> ExportedRoomKey {
        ExportedRoomKey {
            algorithm: self.algorithm,
            room_id,
            sender_key: self.sender_key,
            session_id,
            session_key: self.session_key,
            sender_claimed_keys: self.sender_claimed_keys,
            forwarding_curve25519_key_chain: self.forwarding_curve25519_key_chain,
        }
    }
}
