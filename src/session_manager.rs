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

//! Management of outbound Megolm sessions and the distribution of their
//! session keys over Olm channels.

use std::{
    collections::{BTreeMap, HashSet},
    sync::{Arc, RwLock as StdRwLock},
};

use ruma::{
    serde::Raw, OwnedDeviceId, OwnedRoomId, OwnedTransactionId, OwnedUserId, RoomId,
    TransactionId, UserId,
};
use serde_json::Value;
use tracing::{debug, info, instrument, trace};

use crate::{
    error::{EventError, MegolmError, MegolmResult, OlmError, OlmResult},
    identities::Device,
    olm::{
        Account, EncryptionSettings, InboundGroupSession, OutboundGroupSession, Session,
        ShareInfo, ShareState,
    },
    store::{Changes, CryptoStoreError, DynCryptoStore},
    types::events::{RoomKeyWithheldContent, ToDeviceRequest, WithheldCode},
};

/// The maximum number of to-device messages a single request may carry.
const MAX_TO_DEVICE_MESSAGES: usize = 250;

/// The result of a recipient collection run for a room key share.
#[derive(Debug, Default)]
pub(crate) struct CollectRecipientsResult {
    /// Does the session need to be rotated before it can be shared.
    pub should_rotate: bool,
    /// Devices that should receive the session key.
    pub devices: Vec<Device>,
    /// Devices that should instead receive a withheld notice.
    pub withheld_devices: Vec<(Device, WithheldCode)>,
}

/// The manager that owns all outbound Megolm sessions and drives the room key
/// sharing machinery.
#[derive(Debug, Clone)]
pub(crate) struct GroupSessionManager {
    account: Account,
    store: DynCryptoStore,
    sessions: Arc<StdRwLock<BTreeMap<OwnedRoomId, OutboundGroupSession>>>,
    /// Map from the request id of a pending share request to the room of the
    /// session the request belongs to.
    outgoing_requests: Arc<StdRwLock<BTreeMap<OwnedTransactionId, OwnedRoomId>>>,
}

impl GroupSessionManager {
    pub fn new(account: Account, store: DynCryptoStore) -> Self {
        Self {
            account,
            store,
            sessions: Default::default(),
            outgoing_requests: Default::default(),
        }
    }

    /// The outbound session of the given room, if one exists.
    pub async fn get_outbound_group_session(
        &self,
        room_id: &RoomId,
    ) -> Result<Option<OutboundGroupSession>, CryptoStoreError> {
        let cached = self
            .sessions
            .read()
            .expect("The session cache lock should never be poisoned")
            .get(room_id)
            .cloned();

        if let Some(session) = cached {
            return Ok(Some(session));
        }

        let Some(session) = self.store.get_outbound_group_session(room_id).await? else {
            return Ok(None);
        };

        self.sessions
            .write()
            .expect("The session cache lock should never be poisoned")
            .insert(room_id.to_owned(), session.clone());

        Ok(Some(session))
    }

    /// Encrypt a room event with the outbound session of the given room.
    ///
    /// The session key must have been shared beforehand, otherwise the
    /// recipients won't be able to decrypt the event.
    pub async fn encrypt(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: &Value,
    ) -> MegolmResult<Raw<crate::types::events::RoomEncryptedContent>> {
        let session = self
            .get_outbound_group_session(room_id)
            .await?
            .filter(|session| !session.expired() && !session.invalidated())
            .ok_or(MegolmError::MissingRoomKey(None))?;

        let content = session.encrypt(event_type, content).await;

        self.store
            .save_changes(Changes {
                outbound_group_sessions: vec![session],
                ..Default::default()
            })
            .await?;

        Ok(Raw::new(&content)?)
    }

    /// Create a fresh outbound session for the room, along with our own
    /// inbound copy of it so we can decrypt our own messages.
    async fn create_outbound_group_session(
        &self,
        room_id: &RoomId,
        settings: EncryptionSettings,
    ) -> OlmResult<(OutboundGroupSession, InboundGroupSession)> {
        let static_data = self.account.static_data();

        let outbound = OutboundGroupSession::new(static_data, room_id, settings)?;

        let inbound = InboundGroupSession::new(
            static_data.curve25519_key(),
            static_data.ed25519_key(),
            room_id,
            &outbound.session_key().await,
            outbound.settings().algorithm.clone(),
        )
        .map_err(|_| {
            EventError::UnsupportedAlgorithm(outbound.settings().algorithm.to_string())
        })?;

        self.sessions
            .write()
            .expect("The session cache lock should never be poisoned")
            .insert(room_id.to_owned(), outbound.clone());

        Ok((outbound, inbound))
    }

    /// Get the room's current outbound session, creating or rotating it if
    /// needed.
    async fn get_or_create_outbound_session(
        &self,
        room_id: &RoomId,
        settings: EncryptionSettings,
    ) -> OlmResult<(OutboundGroupSession, Option<InboundGroupSession>)> {
        let session = self.get_outbound_group_session(room_id).await?;

        match session {
            Some(session)
                if !session.expired()
                    && !session.invalidated()
                    && session.settings() == &settings =>
            {
                Ok((session, None))
            }
            _ => {
                let (outbound, inbound) =
                    self.create_outbound_group_session(room_id, settings).await?;
                Ok((outbound, Some(inbound)))
            }
        }
    }

    /// Figure out which devices the session should go to, which get a
    /// withheld notice instead, and whether the session needs to be rotated
    /// first.
    async fn collect_session_recipients(
        &self,
        users: &[&UserId],
        settings: &EncryptionSettings,
        outbound: &OutboundGroupSession,
    ) -> Result<CollectRecipientsResult, CryptoStoreError> {
        let users: HashSet<&UserId> = users.iter().copied().collect();

        // Rotate as soon as a user that previously received the session is
        // no longer a recipient, the ratchet must not keep advancing for
        // them.
        let mut should_rotate =
            outbound.shared_with_users().iter().any(|user| !users.contains(user.as_ref() as &UserId));

        let mut devices = Vec::new();
        let mut withheld_devices = Vec::new();

        for user_id in users {
            for device in self.store.get_user_devices(user_id).await?.into_values() {
                if device.user_id() == self.account.user_id()
                    && device.device_id() == self.account.device_id()
                {
                    continue;
                }

                let Some(sender_key) = device.curve25519_key() else {
                    withheld_devices.push((device, WithheldCode::Unavailable));
                    continue;
                };

                if device.is_blacklisted() {
                    withheld_devices.push((device, WithheldCode::Blacklisted));
                } else if settings.only_allow_trusted_devices && !device.is_verified() {
                    withheld_devices.push((device, WithheldCode::Unverified));
                } else {
                    // A device that reused its ID with a fresh Curve25519 key
                    // must never see the old ratchet again.
                    if outbound.is_shared_with(device.user_id(), device.device_id(), sender_key)
                        == ShareState::SharedButChangedSenderKey
                    {
                        should_rotate = true;
                    }

                    devices.push(device);
                }
            }
        }

        trace!(
            should_rotate,
            recipient_count = devices.len(),
            withheld_count = withheld_devices.len(),
            "Collected room key recipients"
        );

        Ok(CollectRecipientsResult { should_rotate, devices, withheld_devices })
    }

    /// Most recently used Olm session with the given device, if any.
    async fn get_olm_session(&self, device: &Device) -> Result<Option<Session>, CryptoStoreError> {
        let Some(sender_key) = device.curve25519_key() else {
            return Ok(None);
        };

        let sessions = self.store.get_sessions(&sender_key.to_base64()).await?;

        Ok(sessions.and_then(|sessions| {
            sessions.into_iter().max_by_key(|session| session.last_use_time())
        }))
    }

    /// Encrypt and queue the session key for every device that still needs
    /// it.
    ///
    /// Returns the requests that have to be sent out, the session counts as
    /// shared once every one of them was marked as sent.
    #[instrument(skip(self, users, settings), fields(room_id = %room_id))]
    pub async fn share_room_key(
        &self,
        room_id: &RoomId,
        users: &[&UserId],
        settings: EncryptionSettings,
    ) -> OlmResult<Vec<Arc<ToDeviceRequest>>> {
        let (mut outbound, mut inbound) =
            self.get_or_create_outbound_session(room_id, settings.clone()).await?;

        let mut result = self.collect_session_recipients(users, &settings, &outbound).await?;

        if result.should_rotate {
            info!("Rotating the outbound group session");

            outbound.invalidate_session();
            let (new_outbound, new_inbound) =
                self.create_outbound_group_session(room_id, settings.clone()).await?;
            outbound = new_outbound;
            inbound = Some(new_inbound);

            result = self.collect_session_recipients(users, &settings, &outbound).await?;
        }

        let key_content = serde_json::to_value(outbound.as_room_key_content().await)
            .map_err(OlmError::JsonError)?;

        let message_index = outbound.message_index().await;

        let mut changed_sessions = Vec::new();
        let mut messages: Vec<(OwnedUserId, OwnedDeviceId, ShareInfo, Value)> = Vec::new();

        for device in result.devices {
            let sender_key = match device.curve25519_key() {
                Some(key) => key,
                None => continue,
            };

            if matches!(
                outbound.is_shared_with(device.user_id(), device.device_id(), sender_key),
                ShareState::Shared { .. }
            ) {
                continue;
            }

            let Some(mut session) = self.get_olm_session(&device).await? else {
                debug!(
                    user_id = %device.user_id(),
                    device_id = %device.device_id(),
                    "Cannot share a room key with a device we have no Olm session with"
                );
                result.withheld_devices.push((device, WithheldCode::NoOlm));
                continue;
            };

            let encrypted = session.encrypt(&device, "m.room_key", key_content.clone()).await?;
            changed_sessions.push(session);

            messages.push((
                device.user_id().to_owned(),
                device.device_id().to_owned(),
                ShareInfo { sender_key, message_index },
                serde_json::to_value(encrypted).map_err(OlmError::JsonError)?,
            ));
        }

        let mut requests = Vec::new();

        for chunk in messages.chunks(MAX_TO_DEVICE_MESSAGES) {
            let mut request = ToDeviceRequest::new("m.room.encrypted");
            let mut share_infos = BTreeMap::<OwnedUserId, BTreeMap<OwnedDeviceId, ShareInfo>>::new();

            for (user_id, device_id, share_info, message) in chunk {
                request
                    .messages
                    .entry(user_id.clone())
                    .or_default()
                    .insert(device_id.clone(), message.clone());
                share_infos
                    .entry(user_id.clone())
                    .or_default()
                    .insert(device_id.clone(), share_info.clone());
            }

            let request = Arc::new(request);
            outbound.add_request(request.txn_id.clone(), request.clone(), share_infos);
            self.outgoing_requests
                .write()
                .expect("The outgoing request lock should never be poisoned")
                .insert(request.txn_id.clone(), room_id.to_owned());

            requests.push(request);
        }

        requests.extend(self.withheld_requests(&outbound, result.withheld_devices));

        if requests.is_empty() {
            // Nothing left to share, the session is fully distributed.
            debug!(
                session_id = outbound.session_id(),
                "The room key is already shared with all devices"
            );
            outbound.mark_as_shared();
        }

        let mut changes = Changes {
            sessions: changed_sessions,
            outbound_group_sessions: vec![outbound],
            ..Default::default()
        };
        changes.inbound_group_sessions.extend(inbound);

        self.store.save_changes(changes).await?;

        Ok(requests)
    }

    /// Build the plaintext `m.room_key.withheld` notices for devices that
    /// were excluded from a share.
    fn withheld_requests(
        &self,
        outbound: &OutboundGroupSession,
        withheld_devices: Vec<(Device, WithheldCode)>,
    ) -> Vec<Arc<ToDeviceRequest>> {
        let mut requests = Vec::new();
        let mut request = ToDeviceRequest::new("m.room_key.withheld");

        for (device, code) in withheld_devices {
            // `m.no_olm` is about the device pair, not a specific session.
            let content = if code == WithheldCode::NoOlm {
                RoomKeyWithheldContent {
                    algorithm: outbound.settings().algorithm.clone(),
                    code,
                    room_id: None,
                    session_id: None,
                    sender_key: Some(self.account.identity_keys().curve25519),
                }
            } else {
                RoomKeyWithheldContent {
                    algorithm: outbound.settings().algorithm.clone(),
                    code,
                    room_id: Some(outbound.room_id().to_owned()),
                    session_id: Some(outbound.session_id().to_owned()),
                    sender_key: Some(self.account.identity_keys().curve25519),
                }
            };

            let Ok(content) = serde_json::to_value(content) else {
                continue;
            };

            request
                .messages
                .entry(device.user_id().to_owned())
                .or_default()
                .insert(device.device_id().to_owned(), content);

            if request.message_count() >= MAX_TO_DEVICE_MESSAGES {
                requests.push(Arc::new(std::mem::replace(
                    &mut request,
                    ToDeviceRequest::new("m.room_key.withheld"),
                )));
            }
        }

        if request.message_count() > 0 {
            requests.push(Arc::new(request));
        }

        requests
    }

    /// Mark a share request as sent, releasing the recipients it covered
    /// into the shared set of the session.
    pub async fn mark_request_as_sent(
        &self,
        request_id: &TransactionId,
    ) -> Result<(), CryptoStoreError> {
        let room_id = self
            .outgoing_requests
            .write()
            .expect("The outgoing request lock should never be poisoned")
            .remove(request_id);

        if let Some(room_id) = room_id {
            if let Some(session) = self.get_outbound_group_session(&room_id).await? {
                session.mark_request_as_sent(request_id);

                self.store
                    .save_changes(Changes {
                        outbound_group_sessions: vec![session],
                        ..Default::default()
                    })
                    .await?;
            }
        }

        Ok(())
    }

    /// Invalidate the outbound session of the given room, the next message
    /// will trigger a fresh session.
    pub async fn invalidate_group_session(
        &self,
        room_id: &RoomId,
    ) -> Result<bool, CryptoStoreError> {
        if let Some(session) = self.get_outbound_group_session(room_id).await? {
            session.invalidate_session();

            self.store
                .save_changes(Changes {
                    outbound_group_sessions: vec![session],
                    ..Default::default()
                })
                .await?;

            Ok(true)
        } else {
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, room_id, user_id};

    use super::*;
    use crate::{
        identities::{DeviceChanges, LocalTrust},
        store::{CryptoStore, MemoryStore},
    };

    /// A manager for alice, with bob's device and an Olm session to it
    /// already in the store.
    async fn manager_with_bob() -> (GroupSessionManager, Account) {
        let alice = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        let bob = Account::new(user_id!("@bob:localhost"), device_id!("BOBDEVICE"));

        let (alice_session, _) = alice.create_session_for(&bob).await;
        let bob_device = Device::from_account(&bob).await;

        let store = MemoryStore::new().into_dyn();
        store
            .save_changes(Changes {
                sessions: vec![alice_session],
                devices: DeviceChanges { new: vec![bob_device], ..Default::default() },
                ..Default::default()
            })
            .await
            .unwrap();

        (GroupSessionManager::new(alice, store), bob)
    }

    #[tokio::test]
    async fn room_key_sharing() {
        let (manager, bob) = manager_with_bob().await;
        let room_id = room_id!("!test:localhost");

        let requests = manager
            .share_room_key(room_id, &[bob.user_id()], EncryptionSettings::default())
            .await
            .unwrap();

        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].event_type, "m.room.encrypted");
        assert_eq!(requests[0].message_count(), 1);

        let session = manager.get_outbound_group_session(room_id).await.unwrap().unwrap();
        assert!(!session.shared());

        manager.mark_request_as_sent(&requests[0].txn_id).await.unwrap();
        assert!(session.shared());

        // Sharing again produces no new requests.
        let requests = manager
            .share_room_key(room_id, &[bob.user_id()], EncryptionSettings::default())
            .await
            .unwrap();
        assert!(requests.is_empty());
    }

    #[tokio::test]
    async fn unverified_devices_get_withheld_notices() {
        let (manager, bob) = manager_with_bob().await;
        let room_id = room_id!("!test:localhost");

        let settings =
            EncryptionSettings { only_allow_trusted_devices: true, ..Default::default() };

        let requests =
            manager.share_room_key(room_id, &[bob.user_id()], settings.clone()).await.unwrap();

        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].event_type, "m.room_key.withheld");

        let content: RoomKeyWithheldContent = serde_json::from_value(
            requests[0].messages[bob.user_id()][bob.device_id()].clone(),
        )
        .unwrap();
        assert_eq!(content.code, WithheldCode::Unverified);

        // Once bob's device is verified it receives the key.
        let device =
            manager.store.get_device(bob.user_id(), bob.device_id()).await.unwrap().unwrap();
        device.set_trust_state(LocalTrust::Verified);

        let requests =
            manager.share_room_key(room_id, &[bob.user_id()], settings).await.unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].event_type, "m.room.encrypted");
    }

    #[tokio::test]
    async fn membership_shrink_rotates_the_session() {
        let (manager, bob) = manager_with_bob().await;
        let room_id = room_id!("!test:localhost");

        let requests = manager
            .share_room_key(room_id, &[bob.user_id()], EncryptionSettings::default())
            .await
            .unwrap();
        manager.mark_request_as_sent(&requests[0].txn_id).await.unwrap();

        let old_session =
            manager.get_outbound_group_session(room_id).await.unwrap().unwrap();
        let old_session_id = old_session.session_id().to_owned();

        // Bob leaves the room.
        manager.share_room_key(room_id, &[], EncryptionSettings::default()).await.unwrap();

        let new_session =
            manager.get_outbound_group_session(room_id).await.unwrap().unwrap();
        assert_ne!(old_session_id, new_session.session_id());
    }

    #[tokio::test]
    async fn encrypting_without_a_session_fails() {
        let (manager, _) = manager_with_bob().await;
        let room_id = room_id!("!test:localhost");

        let result =
            manager.encrypt(room_id, "m.room.message", &serde_json::json!({"body": "hi"})).await;

        assert!(matches!(result, Err(MegolmError::MissingRoomKey(None))));
    }
}
