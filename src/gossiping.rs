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

//! Requesting secrets and room keys from our other devices, and accepting
//! the answers.

use ruma::{
    DeviceId, OwnedRoomId, OwnedTransactionId, OwnedUserId, RoomId, TransactionId, UserId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use vodozemac::Curve25519PublicKey;

use crate::{
    identities::Device,
    store::{CryptoStoreError, DynCryptoStore},
    types::{
        deserialize_curve_key,
        events::{SecretRequestContent, SecretSendContent, ToDeviceRequest},
        serialize_curve_key, EventEncryptionAlgorithm,
    },
};

/// The body of a request for a specific room key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomKeyRequestInfo {
    /// The algorithm of the requested session.
    pub algorithm: EventEncryptionAlgorithm,
    /// The room the session is used in.
    pub room_id: OwnedRoomId,
    /// The Curve25519 key of the device which initiated the session.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub sender_key: Curve25519PublicKey,
    /// The ID of the requested session.
    pub session_id: String,
}

/// The subject of a gossip request, either a named secret or a specific room
/// key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecretInfo {
    /// A request for a room key.
    KeyRequest(RoomKeyRequestInfo),
    /// A request for a named secret, e.g. `m.megolm_backup.v1`.
    SecretRequest(String),
}

impl SecretInfo {
    /// A stable lookup key for the request, used to deduplicate requests for
    /// the same thing.
    pub fn as_key(&self) -> String {
        match self {
            SecretInfo::KeyRequest(info) => {
                format!(
                    "keyRequest:{}:{}:{}",
                    info.room_id, info.session_id, info.algorithm
                )
            }
            SecretInfo::SecretRequest(name) => format!("secretName:{name}"),
        }
    }
}

/// An outgoing request for a secret or room key that one of our other devices
/// may answer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GossipRequest {
    /// The user we are requesting the secret from, always ourselves for
    /// secret requests.
    pub request_recipient: OwnedUserId,
    /// A unique ID tying the eventual answer back to this request.
    pub request_id: OwnedTransactionId,
    /// What is being requested.
    pub info: SecretInfo,
    /// Has the request already been sent out.
    pub sent_out: bool,
}

/// A secret one of our devices sent us in answer to a gossip request, waiting
/// in the inbox until the user imports it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GossippedSecret {
    /// The name of the secret.
    pub secret_name: String,
    /// The request this secret answers.
    pub gossip_request: GossipRequest,
    /// The content of the `m.secret.send` event carrying the secret.
    pub event: SecretSendContent,
}

/// State machine handling the request and receipt of gossiped secrets.
#[derive(Debug, Clone)]
pub struct GossipMachine {
    user_id: OwnedUserId,
    device_id: ruma::OwnedDeviceId,
    store: DynCryptoStore,
}

impl GossipMachine {
    pub(crate) fn new(
        user_id: OwnedUserId,
        device_id: ruma::OwnedDeviceId,
        store: DynCryptoStore,
    ) -> Self {
        Self { user_id, device_id, store }
    }

    /// Create a request for the named secret, addressed to all our other
    /// devices.
    ///
    /// Returns `None` if a request for the same secret is already in flight.
    pub async fn request_secret(
        &self,
        secret_name: &str,
    ) -> Result<Option<(GossipRequest, ToDeviceRequest)>, CryptoStoreError> {
        let info = SecretInfo::SecretRequest(secret_name.to_owned());

        if self.store.get_secret_request_by_info(&info).await?.is_some() {
            debug!(secret_name, "A request for this secret is already in flight");
            return Ok(None);
        }

        let request_id = TransactionId::new();
        let gossip_request = GossipRequest {
            request_recipient: self.user_id.clone(),
            request_id: request_id.clone(),
            info,
            sent_out: false,
        };

        let content = SecretRequestContent::Request {
            name: secret_name.to_owned(),
            requesting_device_id: self.device_id.clone(),
            request_id,
        };

        let request = self.to_own_devices_request(&content).await?;

        info!(secret_name, "Requesting a secret from our other devices");

        Ok(Some((gossip_request, request)))
    }

    /// Create a request for a room key we are missing, addressed to all our
    /// other devices.
    pub async fn request_room_key(
        &self,
        room_id: &RoomId,
        sender_key: Curve25519PublicKey,
        session_id: &str,
    ) -> Result<Option<(GossipRequest, ToDeviceRequest)>, CryptoStoreError> {
        let info = SecretInfo::KeyRequest(RoomKeyRequestInfo {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            room_id: room_id.to_owned(),
            sender_key,
            session_id: session_id.to_owned(),
        });

        if self.store.get_secret_request_by_info(&info).await?.is_some() {
            return Ok(None);
        }

        let request_id = TransactionId::new();
        let gossip_request = GossipRequest {
            request_recipient: self.user_id.clone(),
            request_id: request_id.clone(),
            info: info.clone(),
            sent_out: false,
        };

        let content = serde_json::json!({
            "action": "request",
            "body": info,
            "requesting_device_id": self.device_id,
            "request_id": request_id,
        });

        let request = self.to_own_devices_raw(content, "m.room_key_request").await?;

        debug!(?room_id, session_id, "Requesting a room key from our other devices");

        Ok(Some((gossip_request, request)))
    }

    /// Receive an `m.secret.send` event that was decrypted from an Olm
    /// channel.
    ///
    /// The secret is only accepted if it answers a request we actually made,
    /// came from one of our own devices, and that device is verified.
    pub async fn receive_secret_send(
        &self,
        sender: &UserId,
        sender_device: &Device,
        content: &SecretSendContent,
    ) -> Result<Option<GossippedSecret>, CryptoStoreError> {
        let Some(request) = self.store.get_outgoing_secret_request(&content.request_id).await?
        else {
            warn!(
                request_id = content.request_id.to_string().as_str(),
                "Received a secret we didn't request, ignoring it"
            );
            return Ok(None);
        };

        if sender != self.user_id {
            warn!(
                sender = sender.as_str(),
                "Received a secret from another user, secrets are only \
                 gossiped between our own devices"
            );
            return Ok(None);
        }

        if !sender_device.is_verified() {
            warn!(
                device_id = sender_device.device_id().as_str(),
                "Received a secret from an unverified device, ignoring it"
            );
            return Ok(None);
        }

        let SecretInfo::SecretRequest(secret_name) = &request.info else {
            // Room key answers travel as `m.forwarded_room_key` events, not
            // as `m.secret.send`.
            warn!("Received an m.secret.send answering a room key request");
            return Ok(None);
        };

        info!(secret_name, "Received a requested secret from a verified own device");

        self.store.delete_outgoing_secret_requests(&request.request_id).await?;

        Ok(Some(GossippedSecret {
            secret_name: secret_name.clone(),
            gossip_request: request,
            event: content.clone(),
        }))
    }

    async fn to_own_devices_request(
        &self,
        content: &SecretRequestContent,
    ) -> Result<ToDeviceRequest, CryptoStoreError> {
        let content = serde_json::to_value(content)
            .expect("A secret request content can always be serialized");
        self.to_own_devices_raw(content, "m.secret.request").await
    }

    async fn to_own_devices_raw(
        &self,
        content: Value,
        event_type: &str,
    ) -> Result<ToDeviceRequest, CryptoStoreError> {
        let mut request = ToDeviceRequest::new(event_type);
        let devices = self.store.get_user_devices(&self.user_id).await?;

        let messages = devices
            .into_iter()
            .filter(|(device_id, _)| self.own_device_filter(device_id))
            .map(|(device_id, _)| (device_id, content.clone()))
            .collect();

        request.messages.insert(self.user_id.clone(), messages);

        Ok(request)
    }

    fn own_device_filter(&self, device_id: &DeviceId) -> bool {
        device_id != self.device_id
    }
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, user_id};

    use super::*;
    use crate::{
        identities::LocalTrust,
        olm::Account,
        store::{Changes, CryptoStore, MemoryStore},
    };

    async fn machine_with_second_device() -> (GossipMachine, Device) {
        let user_id = user_id!("@alice:localhost");
        let store = MemoryStore::new().into_dyn();

        let second_account = Account::new(user_id, device_id!("SECONDDEVICE"));
        let second_device = Device::from_account(&second_account).await;

        store
            .save_changes(Changes {
                devices: crate::identities::DeviceChanges {
                    new: vec![second_device.clone()],
                    ..Default::default()
                },
                ..Default::default()
            })
            .await
            .unwrap();

        let machine = GossipMachine::new(user_id.to_owned(), device_id!("FIRSTDEVICE").to_owned(), store);

        (machine, second_device)
    }

    #[tokio::test]
    async fn secret_request_lifecycle() {
        let (machine, second_device) = machine_with_second_device().await;

        let (gossip_request, request) = machine
            .request_secret("m.megolm_backup.v1")
            .await
            .unwrap()
            .expect("The first request for a secret should be created");

        // The request goes to our other devices, not to the requesting one.
        assert!(request.messages[&machine.user_id].contains_key(second_device.device_id()));
        assert_eq!(request.message_count(), 1);

        machine
            .store
            .save_changes(Changes {
                key_requests: vec![gossip_request.clone()],
                ..Default::default()
            })
            .await
            .unwrap();

        // A duplicate request for the same secret is suppressed.
        assert!(machine.request_secret("m.megolm_backup.v1").await.unwrap().is_none());

        // The answer is rejected while the device is unverified.
        let content = SecretSendContent {
            request_id: gossip_request.request_id.clone(),
            secret: "it's a secret to everybody".to_owned(),
        };
        let secret = machine
            .receive_secret_send(&machine.user_id, &second_device, &content)
            .await
            .unwrap();
        assert!(secret.is_none());

        second_device.set_trust_state(LocalTrust::Verified);
        let secret = machine
            .receive_secret_send(&machine.user_id, &second_device, &content)
            .await
            .unwrap()
            .expect("A verified own device may answer our request");

        assert_eq!(secret.secret_name, "m.megolm_backup.v1");
        assert_eq!(secret.event.secret, "it's a secret to everybody");

        // The request is gone once it was answered.
        assert!(machine
            .store
            .get_outgoing_secret_request(&gossip_request.request_id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn secrets_from_other_users_are_rejected() {
        let (machine, second_device) = machine_with_second_device().await;
        second_device.set_trust_state(LocalTrust::Verified);

        let (gossip_request, _) =
            machine.request_secret("m.megolm_backup.v1").await.unwrap().unwrap();
        machine
            .store
            .save_changes(Changes { key_requests: vec![gossip_request.clone()], ..Default::default() })
            .await
            .unwrap();

        let content = SecretSendContent {
            request_id: gossip_request.request_id,
            secret: "sneaky".to_owned(),
        };

        let secret = machine
            .receive_secret_send(user_id!("@mallory:localhost"), &second_device, &content)
            .await
            .unwrap();

        assert!(secret.is_none());
    }
}
