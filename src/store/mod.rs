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

//! Storage abstraction for the cryptographic state of the crate.
//!
//! All writes travel through a [`Changes`] object that a store implementation
//! has to apply atomically, partially applied changes would leave the Olm
//! ratchets and the device list in an inconsistent state.

mod memorystore;
mod traits;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memorystore::MemoryStore;
pub use traits::{CryptoStore, DynCryptoStore};

use crate::{
    backups::BackupDecryptionKey,
    gossiping::{GossipRequest, GossippedSecret},
    identities::DeviceChanges,
    olm::{Account, InboundGroupSession, OlmMessageHash, OutboundGroupSession, Session},
};

/// The error type the storage layer produces.
#[derive(Debug, Error)]
pub enum CryptoStoreError {
    /// An operation needed the account but none was stored yet.
    #[error("the account is not stored yet")]
    AccountUnset,

    /// Some stored value failed to serialize or deserialize.
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    /// A pickled Olm object could not be restored.
    #[error(transparent)]
    Pickle(#[from] vodozemac::PickleError),

    /// The underlying storage backend failed.
    #[error("the storage backend failed: {0}")]
    Backend(String),
}

/// A batch of state changes that the store applies in a single atomic write.
#[derive(Debug, Default)]
pub struct Changes {
    /// Our own account, stored when its key counts or shared state changed.
    pub account: Option<Account>,
    /// Olm sessions that were created or whose ratchet advanced.
    pub sessions: Vec<Session>,
    /// Hashes of Olm messages we decrypted, for replay detection.
    pub message_hashes: Vec<OlmMessageHash>,
    /// Newly received or imported Megolm sessions of other devices.
    pub inbound_group_sessions: Vec<InboundGroupSession>,
    /// Our own Megolm sessions.
    pub outbound_group_sessions: Vec<OutboundGroupSession>,
    /// Device list changes.
    pub devices: DeviceChanges,
    /// Outgoing gossip requests.
    pub key_requests: Vec<GossipRequest>,
    /// Secrets received from our other devices, waiting for import.
    pub secrets: Vec<GossippedSecret>,
    /// A new key backup version was created.
    pub backup_version: Option<String>,
    /// The private key of the key backup.
    pub backup_decryption_key: Option<BackupDecryptionKey>,
}

impl Changes {
    /// Are there any changes to be written out.
    pub fn is_empty(&self) -> bool {
        self.account.is_none()
            && self.sessions.is_empty()
            && self.message_hashes.is_empty()
            && self.inbound_group_sessions.is_empty()
            && self.outbound_group_sessions.is_empty()
            && self.devices.is_empty()
            && self.key_requests.is_empty()
            && self.secrets.is_empty()
            && self.backup_version.is_none()
            && self.backup_decryption_key.is_none()
    }
}

/// How many Megolm sessions the store holds, and how many of them are already
/// in the key backup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomKeyCounts {
    /// The total number of stored inbound group sessions.
    pub total: usize,
    /// The number of sessions already uploaded to the backup.
    pub backed_up: usize,
}

/// The key material and version of the active key backup, as far as the store
/// knows them.
#[derive(Clone, Debug, Default)]
pub struct BackupKeys {
    /// The private half of the backup key, if it was stored or gossiped to
    /// us.
    pub decryption_key: Option<BackupDecryptionKey>,
    /// The version of the backup the key belongs to.
    pub backup_version: Option<String>,
}
