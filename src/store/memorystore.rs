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

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use ruma::{
    DeviceId, OwnedDeviceId, OwnedRoomId, OwnedTransactionId, OwnedUserId, RoomId, TransactionId,
    UserId,
};
use tokio::sync::RwLock;
use vodozemac::megolm::SessionOrdering;

use super::{BackupKeys, Changes, CryptoStore, CryptoStoreError, DynCryptoStore, RoomKeyCounts};
use crate::{
    gossiping::{GossipRequest, GossippedSecret, SecretInfo},
    identities::Device,
    olm::{Account, InboundGroupSession, OlmMessageHash, OutboundGroupSession, Session},
};

/// An in-memory [`CryptoStore`].
///
/// Nothing survives a restart of the process, useful for tests and for
/// ephemeral devices that never persist their state.
#[derive(Debug, Default)]
pub struct MemoryStore {
    account: RwLock<Option<Account>>,
    sessions: RwLock<BTreeMap<String, Vec<Session>>>,
    inbound_group_sessions: RwLock<BTreeMap<OwnedRoomId, HashMap<String, InboundGroupSession>>>,
    outbound_group_sessions: RwLock<BTreeMap<OwnedRoomId, OutboundGroupSession>>,
    devices: RwLock<HashMap<OwnedUserId, HashMap<OwnedDeviceId, Device>>>,
    message_hashes: RwLock<HashSet<OlmMessageHash>>,
    key_requests_by_id: RwLock<HashMap<OwnedTransactionId, GossipRequest>>,
    key_requests_by_info: RwLock<HashMap<String, OwnedTransactionId>>,
    secret_inbox: RwLock<HashMap<String, Vec<GossippedSecret>>>,
    backup_keys: RwLock<BackupKeys>,
}

impl MemoryStore {
    /// Create a new, empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap the store into a type-erased, shareable handle.
    pub fn into_dyn(self) -> DynCryptoStore {
        Arc::new(self)
    }

    async fn save_sessions(&self, sessions: Vec<Session>) {
        let mut session_map = self.sessions.write().await;

        for session in sessions {
            let entry = session_map.entry(session.sender_key().to_base64()).or_default();

            if let Some(existing) =
                entry.iter_mut().find(|s| s.session_id() == session.session_id())
            {
                *existing = session;
            } else {
                entry.push(session);
            }
        }
    }

    async fn save_inbound_group_sessions(&self, sessions: Vec<InboundGroupSession>) {
        let mut session_map = self.inbound_group_sessions.write().await;

        for session in sessions {
            let room_sessions = session_map.entry(session.room_id.to_owned()).or_default();

            // Keep the stored session if it can decrypt from an earlier
            // ratchet index than the incoming copy.
            if let Some(existing) = room_sessions.get(session.session_id()) {
                match existing.compare(&session).await {
                    SessionOrdering::Better | SessionOrdering::Equal => continue,
                    SessionOrdering::Worse | SessionOrdering::Unconnected => {}
                }
            }

            room_sessions.insert(session.session_id().to_owned(), session);
        }
    }

    async fn save_devices(&self, changes: crate::identities::DeviceChanges) {
        let mut devices = self.devices.write().await;

        for device in changes.new.into_iter().chain(changes.changed) {
            devices
                .entry(device.user_id().to_owned())
                .or_default()
                .insert(device.device_id().to_owned(), device);
        }

        for device in changes.deleted {
            if let Some(user_devices) = devices.get_mut(device.user_id()) {
                user_devices.remove(device.device_id());
            }
        }
    }

    async fn save_key_requests(&self, requests: Vec<GossipRequest>) {
        let mut by_id = self.key_requests_by_id.write().await;
        let mut by_info = self.key_requests_by_info.write().await;

        for request in requests {
            by_info.insert(request.info.as_key(), request.request_id.clone());
            by_id.insert(request.request_id.clone(), request);
        }
    }
}

#[async_trait]
impl CryptoStore for MemoryStore {
    async fn load_account(&self) -> Result<Option<Account>, CryptoStoreError> {
        Ok(self.account.read().await.clone())
    }

    async fn save_changes(&self, changes: Changes) -> Result<(), CryptoStoreError> {
        if let Some(account) = changes.account {
            *self.account.write().await = Some(account);
        }

        self.save_sessions(changes.sessions).await;
        self.save_inbound_group_sessions(changes.inbound_group_sessions).await;

        {
            let mut outbound = self.outbound_group_sessions.write().await;
            for session in changes.outbound_group_sessions {
                outbound.insert(session.room_id().to_owned(), session);
            }
        }

        self.save_devices(changes.devices).await;

        {
            let mut hashes = self.message_hashes.write().await;
            hashes.extend(changes.message_hashes);
        }

        self.save_key_requests(changes.key_requests).await;

        {
            let mut inbox = self.secret_inbox.write().await;
            for secret in changes.secrets {
                inbox.entry(secret.secret_name.clone()).or_default().push(secret);
            }
        }

        {
            let mut backup_keys = self.backup_keys.write().await;

            if let Some(version) = changes.backup_version {
                backup_keys.backup_version = Some(version);
            }

            if let Some(key) = changes.backup_decryption_key {
                backup_keys.decryption_key = Some(key);
            }
        }

        Ok(())
    }

    async fn get_sessions(
        &self,
        sender_key: &str,
    ) -> Result<Option<Vec<Session>>, CryptoStoreError> {
        Ok(self.sessions.read().await.get(sender_key).cloned())
    }

    async fn get_inbound_group_session(
        &self,
        room_id: &RoomId,
        session_id: &str,
    ) -> Result<Option<InboundGroupSession>, CryptoStoreError> {
        Ok(self
            .inbound_group_sessions
            .read()
            .await
            .get(room_id)
            .and_then(|sessions| sessions.get(session_id))
            .cloned())
    }

    async fn get_inbound_group_sessions(
        &self,
    ) -> Result<Vec<InboundGroupSession>, CryptoStoreError> {
        Ok(self
            .inbound_group_sessions
            .read()
            .await
            .values()
            .flat_map(|sessions| sessions.values().cloned())
            .collect())
    }

    async fn inbound_group_session_counts(&self) -> Result<RoomKeyCounts, CryptoStoreError> {
        let mut counts = RoomKeyCounts::default();

        for session in self.inbound_group_sessions.read().await.values().flat_map(|s| s.values())
        {
            counts.total += 1;

            if session.backed_up() {
                counts.backed_up += 1;
            }
        }

        Ok(counts)
    }

    async fn inbound_group_sessions_for_backup(
        &self,
        limit: usize,
    ) -> Result<Vec<InboundGroupSession>, CryptoStoreError> {
        Ok(self
            .inbound_group_sessions
            .read()
            .await
            .values()
            .flat_map(|sessions| sessions.values())
            .filter(|session| !session.backed_up())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_inbound_group_sessions_as_backed_up(
        &self,
        room_and_session_ids: &[(&RoomId, &str)],
    ) -> Result<(), CryptoStoreError> {
        let sessions = self.inbound_group_sessions.read().await;

        for (room_id, session_id) in room_and_session_ids {
            if let Some(session) =
                sessions.get(*room_id).and_then(|sessions| sessions.get(*session_id))
            {
                session.mark_as_backed_up();
            }
        }

        Ok(())
    }

    async fn reset_backup_state(&self) -> Result<(), CryptoStoreError> {
        for session in
            self.inbound_group_sessions.read().await.values().flat_map(|s| s.values())
        {
            session.reset_backup_state();
        }

        Ok(())
    }

    async fn load_backup_keys(&self) -> Result<BackupKeys, CryptoStoreError> {
        Ok(self.backup_keys.read().await.clone())
    }

    async fn get_outbound_group_session(
        &self,
        room_id: &RoomId,
    ) -> Result<Option<OutboundGroupSession>, CryptoStoreError> {
        Ok(self.outbound_group_sessions.read().await.get(room_id).cloned())
    }

    async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<Device>, CryptoStoreError> {
        Ok(self
            .devices
            .read()
            .await
            .get(user_id)
            .and_then(|devices| devices.get(device_id))
            .cloned())
    }

    async fn get_user_devices(
        &self,
        user_id: &UserId,
    ) -> Result<HashMap<OwnedDeviceId, Device>, CryptoStoreError> {
        Ok(self.devices.read().await.get(user_id).cloned().unwrap_or_default())
    }

    async fn is_message_known(&self, hash: &OlmMessageHash) -> Result<bool, CryptoStoreError> {
        Ok(self.message_hashes.read().await.contains(hash))
    }

    async fn get_outgoing_secret_request(
        &self,
        request_id: &TransactionId,
    ) -> Result<Option<GossipRequest>, CryptoStoreError> {
        Ok(self.key_requests_by_id.read().await.get(request_id).cloned())
    }

    async fn get_secret_request_by_info(
        &self,
        secret_info: &SecretInfo,
    ) -> Result<Option<GossipRequest>, CryptoStoreError> {
        let by_info = self.key_requests_by_info.read().await;
        let by_id = self.key_requests_by_id.read().await;

        Ok(by_info.get(&secret_info.as_key()).and_then(|id| by_id.get(id)).cloned())
    }

    async fn get_unsent_secret_requests(&self) -> Result<Vec<GossipRequest>, CryptoStoreError> {
        Ok(self
            .key_requests_by_id
            .read()
            .await
            .values()
            .filter(|request| !request.sent_out)
            .cloned()
            .collect())
    }

    async fn delete_outgoing_secret_requests(
        &self,
        request_id: &TransactionId,
    ) -> Result<(), CryptoStoreError> {
        if let Some(request) = self.key_requests_by_id.write().await.remove(request_id) {
            self.key_requests_by_info.write().await.remove(&request.info.as_key());
        }

        Ok(())
    }

    async fn get_secrets_from_inbox(
        &self,
        secret_name: &str,
    ) -> Result<Vec<GossippedSecret>, CryptoStoreError> {
        Ok(self.secret_inbox.read().await.get(secret_name).cloned().unwrap_or_default())
    }

    async fn delete_secrets_from_inbox(
        &self,
        secret_name: &str,
    ) -> Result<(), CryptoStoreError> {
        self.secret_inbox.write().await.remove(secret_name);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, room_id, user_id};

    use super::*;

    fn account() -> Account {
        Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"))
    }

    async fn inbound_session(account: &Account) -> InboundGroupSession {
        let outbound = OutboundGroupSession::new(
            account.static_data(),
            room_id!("!test:localhost"),
            Default::default(),
        )
        .unwrap();

        InboundGroupSession::new(
            account.identity_keys().curve25519,
            account.identity_keys().ed25519,
            room_id!("!test:localhost"),
            &outbound.session_key().await,
            outbound.settings().algorithm.clone(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn account_storage() {
        let store = MemoryStore::new();
        assert!(store.load_account().await.unwrap().is_none());

        let account = account();
        store
            .save_changes(Changes { account: Some(account.clone()), ..Default::default() })
            .await
            .unwrap();

        let loaded = store.load_account().await.unwrap().unwrap();
        assert_eq!(loaded.identity_keys(), account.identity_keys());
    }

    #[tokio::test]
    async fn olm_session_storage() {
        let alice = account();
        let bob = Account::new(user_id!("@bob:localhost"), device_id!("BOBDEVICE"));
        let (session, _) = alice.create_session_for(&bob).await;

        let store = MemoryStore::new();
        store
            .save_changes(Changes { sessions: vec![session.clone()], ..Default::default() })
            .await
            .unwrap();

        let sessions =
            store.get_sessions(&session.sender_key().to_base64()).await.unwrap().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id(), session.session_id());

        // Saving the same session again replaces it instead of duplicating.
        store
            .save_changes(Changes { sessions: vec![session.clone()], ..Default::default() })
            .await
            .unwrap();
        let sessions =
            store.get_sessions(&session.sender_key().to_base64()).await.unwrap().unwrap();
        assert_eq!(sessions.len(), 1);
    }

    #[tokio::test]
    async fn backup_flags() {
        let account = account();
        let session = inbound_session(&account).await;
        let room_id = session.room_id.clone();
        let session_id = session.session_id().to_owned();

        let store = MemoryStore::new();
        store
            .save_changes(Changes {
                inbound_group_sessions: vec![session],
                ..Default::default()
            })
            .await
            .unwrap();

        let counts = store.inbound_group_session_counts().await.unwrap();
        assert_eq!(counts, RoomKeyCounts { total: 1, backed_up: 0 });
        assert_eq!(store.inbound_group_sessions_for_backup(10).await.unwrap().len(), 1);

        store
            .mark_inbound_group_sessions_as_backed_up(&[(&room_id, &session_id)])
            .await
            .unwrap();

        let counts = store.inbound_group_session_counts().await.unwrap();
        assert_eq!(counts, RoomKeyCounts { total: 1, backed_up: 1 });
        assert!(store.inbound_group_sessions_for_backup(10).await.unwrap().is_empty());

        store.reset_backup_state().await.unwrap();
        assert_eq!(store.inbound_group_sessions_for_backup(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn better_inbound_session_is_kept() {
        let account = account();
        let room_id = room_id!("!test:localhost");
        let outbound = OutboundGroupSession::new(
            account.static_data(),
            room_id,
            Default::default(),
        )
        .unwrap();

        let full = InboundGroupSession::new(
            account.identity_keys().curve25519,
            account.identity_keys().ed25519,
            room_id,
            &outbound.session_key().await,
            outbound.settings().algorithm.clone(),
        )
        .unwrap();

        outbound.encrypt("m.room.message", &serde_json::json!({})).await;
        outbound.encrypt("m.room.message", &serde_json::json!({})).await;

        let late = InboundGroupSession::new(
            account.identity_keys().curve25519,
            account.identity_keys().ed25519,
            room_id,
            &outbound.session_key().await,
            outbound.settings().algorithm.clone(),
        )
        .unwrap();
        assert_eq!(late.first_known_index(), 2);

        let store = MemoryStore::new();
        store
            .save_changes(Changes {
                inbound_group_sessions: vec![full],
                ..Default::default()
            })
            .await
            .unwrap();

        // A copy that only knows a later ratchet index must not replace the
        // one that can decrypt from the start.
        store
            .save_changes(Changes {
                inbound_group_sessions: vec![late],
                ..Default::default()
            })
            .await
            .unwrap();

        let stored = store
            .get_inbound_group_session(room_id, outbound.session_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.first_known_index(), 0);
    }

    #[tokio::test]
    async fn message_hashes() {
        let store = MemoryStore::new();
        let hash = OlmMessageHash {
            sender_key: "senderkey".to_owned(),
            hash: "hash".to_owned(),
        };

        assert!(!store.is_message_known(&hash).await.unwrap());

        store
            .save_changes(Changes { message_hashes: vec![hash.clone()], ..Default::default() })
            .await
            .unwrap();

        assert!(store.is_message_known(&hash).await.unwrap());
    }

    #[tokio::test]
    async fn backup_key_storage() {
        let store = MemoryStore::new();
        let keys = store.load_backup_keys().await.unwrap();
        assert!(keys.decryption_key.is_none());

        let decryption_key = crate::backups::BackupDecryptionKey::new();
        store
            .save_changes(Changes {
                backup_decryption_key: Some(decryption_key.clone()),
                backup_version: Some("1".to_owned()),
                ..Default::default()
            })
            .await
            .unwrap();

        let keys = store.load_backup_keys().await.unwrap();
        assert_eq!(keys.decryption_key.unwrap().to_base64(), decryption_key.to_base64());
        assert_eq!(keys.backup_version.as_deref(), Some("1"));
    }
}
