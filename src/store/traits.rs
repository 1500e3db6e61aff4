// Copyright 2023 The Matrix.org Foundation C.I.C.
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

use std::{collections::HashMap, fmt::Debug, sync::Arc};

use async_trait::async_trait;
use ruma::{DeviceId, OwnedDeviceId, RoomId, TransactionId, UserId};

use super::{BackupKeys, Changes, CryptoStoreError, RoomKeyCounts};
use crate::{
    gossiping::{GossipRequest, GossippedSecret, SecretInfo},
    identities::Device,
    olm::{Account, InboundGroupSession, OlmMessageHash, OutboundGroupSession, Session},
};

/// A type-erased, shareable handle to a [`CryptoStore`].
pub type DynCryptoStore = Arc<dyn CryptoStore>;

/// Trait abstracting over the storage backend that holds our cryptographic
/// state.
///
/// A [`Changes`] batch given to [`CryptoStore::save_changes`] must be applied
/// atomically.
#[async_trait]
pub trait CryptoStore: Send + Sync + Debug {
    /// Load our own account, if one was stored.
    async fn load_account(&self) -> Result<Option<Account>, CryptoStoreError>;

    /// Atomically apply a batch of state changes.
    async fn save_changes(&self, changes: Changes) -> Result<(), CryptoStoreError>;

    /// All Olm sessions we share with the device owning the given Curve25519
    /// sender key.
    async fn get_sessions(
        &self,
        sender_key: &str,
    ) -> Result<Option<Vec<Session>>, CryptoStoreError>;

    /// Fetch a single inbound Megolm session.
    async fn get_inbound_group_session(
        &self,
        room_id: &RoomId,
        session_id: &str,
    ) -> Result<Option<InboundGroupSession>, CryptoStoreError>;

    /// All stored inbound Megolm sessions.
    async fn get_inbound_group_sessions(
        &self,
    ) -> Result<Vec<InboundGroupSession>, CryptoStoreError>;

    /// How many inbound Megolm sessions we hold and how many of them made it
    /// into the backup.
    async fn inbound_group_session_counts(&self) -> Result<RoomKeyCounts, CryptoStoreError>;

    /// Up to `limit` inbound Megolm sessions that still need to be backed up.
    async fn inbound_group_sessions_for_backup(
        &self,
        limit: usize,
    ) -> Result<Vec<InboundGroupSession>, CryptoStoreError>;

    /// Flag the given sessions as having been uploaded to the backup.
    async fn mark_inbound_group_sessions_as_backed_up(
        &self,
        room_and_session_ids: &[(&RoomId, &str)],
    ) -> Result<(), CryptoStoreError>;

    /// Clear the backed-up flag of every stored inbound Megolm session.
    ///
    /// Used when the backup version changes and every session needs to be
    /// uploaded again.
    async fn reset_backup_state(&self) -> Result<(), CryptoStoreError>;

    /// Load the stored backup decryption key and backup version.
    async fn load_backup_keys(&self) -> Result<BackupKeys, CryptoStoreError>;

    /// Fetch the outbound Megolm session for the given room.
    async fn get_outbound_group_session(
        &self,
        room_id: &RoomId,
    ) -> Result<Option<OutboundGroupSession>, CryptoStoreError>;

    /// Fetch a single known device of a user.
    async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<Device>, CryptoStoreError>;

    /// All known devices of a user.
    async fn get_user_devices(
        &self,
        user_id: &UserId,
    ) -> Result<HashMap<OwnedDeviceId, Device>, CryptoStoreError>;

    /// Was an Olm message with this hash already decrypted.
    async fn is_message_known(&self, hash: &OlmMessageHash) -> Result<bool, CryptoStoreError>;

    /// Fetch an outgoing secret or room key request by its request id.
    async fn get_outgoing_secret_request(
        &self,
        request_id: &TransactionId,
    ) -> Result<Option<GossipRequest>, CryptoStoreError>;

    /// Fetch an outgoing secret or room key request by the info it asks for.
    async fn get_secret_request_by_info(
        &self,
        secret_info: &SecretInfo,
    ) -> Result<Option<GossipRequest>, CryptoStoreError>;

    /// All outgoing gossip requests that were not yet sent out.
    async fn get_unsent_secret_requests(&self) -> Result<Vec<GossipRequest>, CryptoStoreError>;

    /// Delete an outgoing gossip request.
    async fn delete_outgoing_secret_requests(
        &self,
        request_id: &TransactionId,
    ) -> Result<(), CryptoStoreError>;

    /// All received secrets with the given name that still sit in the inbox.
    async fn get_secrets_from_inbox(
        &self,
        secret_name: &str,
    ) -> Result<Vec<GossippedSecret>, CryptoStoreError>;

    /// Remove all received secrets with the given name from the inbox.
    async fn delete_secrets_from_inbox(&self, secret_name: &str)
        -> Result<(), CryptoStoreError>;
}
