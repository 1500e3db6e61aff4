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

use std::{fmt, sync::Arc};

use ruma::SecondsSinceUnixEpoch;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use vodozemac::{
    olm::{OlmMessage, Session as InnerSession, SessionPickle},
    Curve25519PublicKey,
};

use crate::{
    error::{EventError, OlmError},
    identities::Device,
    types::{
        events::{OlmV1Curve25519AesSha2Content, RoomEncryptedContent},
        DeviceKeys,
    },
};

/// An established 1:1 Olm channel with another device.
#[derive(Clone)]
pub struct Session {
    /// The signed public identity of our own device, baked into every
    /// encrypted payload.
    pub(crate) our_device_keys: Arc<DeviceKeys>,
    /// The underlying double ratchet.
    pub(crate) inner: Arc<Mutex<InnerSession>>,
    /// The unique ID of the session.
    pub(crate) session_id: Arc<str>,
    /// The Curve25519 key of the device on the other end.
    pub(crate) sender_key: Curve25519PublicKey,
    /// Was the session established using a fallback key rather than a
    /// one-time key.
    pub(crate) created_using_fallback_key: bool,
    /// When the session was created.
    pub(crate) creation_time: SecondsSinceUnixEpoch,
    /// When the session was last used to encrypt or decrypt.
    pub(crate) last_use_time: SecondsSinceUnixEpoch,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id())
            .field("sender_key", &self.sender_key)
            .finish()
    }
}

impl Session {
    /// The unique ID of the session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The Curve25519 key of the device on the other end of the session.
    pub fn sender_key(&self) -> Curve25519PublicKey {
        self.sender_key
    }

    /// When the session was created.
    pub fn creation_time(&self) -> SecondsSinceUnixEpoch {
        self.creation_time
    }

    /// When the session was last used.
    pub fn last_use_time(&self) -> SecondsSinceUnixEpoch {
        self.last_use_time
    }

    /// Decrypt the given Olm message, advancing the ratchet.
    pub async fn decrypt(&mut self, message: &OlmMessage) -> Result<String, OlmError> {
        let plaintext = self.inner.lock().await.decrypt(message)?;
        self.last_use_time = SecondsSinceUnixEpoch::now();

        let plaintext = String::from_utf8(plaintext)
            .map_err(|_| EventError::MissingField("content".to_owned()))?;

        Ok(plaintext)
    }

    /// Encrypt the given event for the device on the other end of the
    /// session.
    ///
    /// The payload repeats our and the recipient's identity so the receiving
    /// side can detect a mismatched or forwarded message.
    pub async fn encrypt(
        &mut self,
        recipient_device: &Device,
        event_type: &str,
        content: Value,
    ) -> Result<RoomEncryptedContent, OlmError> {
        let recipient_signing_key =
            recipient_device.ed25519_key().ok_or(EventError::MissingSigningKey)?;
        let recipient_key =
            recipient_device.curve25519_key().ok_or(OlmError::MissingCurveKey)?;
        let our_signing_key =
            self.our_device_keys.ed25519_key().ok_or(EventError::MissingSigningKey)?;
        let our_sender_key =
            self.our_device_keys.curve25519_key().ok_or(OlmError::MissingCurveKey)?;

        let payload = json!({
            "sender": self.our_device_keys.user_id,
            "sender_device": self.our_device_keys.device_id,
            "keys": {
                "ed25519": our_signing_key.to_base64(),
            },
            "recipient": recipient_device.user_id(),
            "recipient_keys": {
                "ed25519": recipient_signing_key.to_base64(),
            },
            "type": event_type,
            "content": content,
        });

        let plaintext = serde_json::to_string(&payload)?;
        let ciphertext = self.inner.lock().await.encrypt(&plaintext);
        self.last_use_time = SecondsSinceUnixEpoch::now();

        Ok(RoomEncryptedContent::OlmV1Curve25519AesSha2(OlmV1Curve25519AesSha2Content {
            ciphertext,
            recipient_key,
            sender_key: our_sender_key,
        }))
    }

    /// Serialize the session to a storable form.
    pub async fn pickle(&self) -> PickledSession {
        let pickle = self.inner.lock().await.pickle();

        PickledSession {
            pickle,
            sender_key: self.sender_key,
            created_using_fallback_key: self.created_using_fallback_key,
            creation_time: self.creation_time,
            last_use_time: self.last_use_time,
        }
    }

    /// Restore a session from its previously pickled form.
    pub fn from_pickle(our_device_keys: Arc<DeviceKeys>, pickle: PickledSession) -> Self {
        let session = InnerSession::from_pickle(pickle.pickle);

        Self {
            our_device_keys,
            session_id: session.session_id().into(),
            inner: Arc::new(Mutex::new(session)),
            sender_key: pickle.sender_key,
            created_using_fallback_key: pickle.created_using_fallback_key,
            creation_time: pickle.creation_time,
            last_use_time: pickle.last_use_time,
        }
    }
}

/// A serializable form of an Olm session.
#[derive(Serialize, Deserialize)]
#[allow(missing_debug_implementations)]
pub struct PickledSession {
    /// The pickled version of the session itself.
    pub pickle: SessionPickle,
    /// The Curve25519 key of the other end of the session.
    #[serde(
        deserialize_with = "crate::types::deserialize_curve_key",
        serialize_with = "crate::types::serialize_curve_key"
    )]
    pub sender_key: Curve25519PublicKey,
    /// Was the session created using a fallback key.
    #[serde(default)]
    pub created_using_fallback_key: bool,
    /// When the session was created.
    pub creation_time: SecondsSinceUnixEpoch,
    /// When the session was last used.
    pub last_use_time: SecondsSinceUnixEpoch,
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use ruma::{device_id, user_id};

    use super::*;
    use crate::olm::Account;

    #[tokio::test]
    async fn olm_session_roundtrip() {
        let alice = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        let bob = Account::new(user_id!("@bob:localhost"), device_id!("BOBDEVICE"));

        let (mut alice_session, mut bob_session) = alice.create_session_for(&bob).await;
        assert_eq!(alice_session.session_id(), bob_session.session_id());

        let bob_device = Device::from_account(&bob).await;
        let content = alice_session
            .encrypt(&bob_device, "m.dummy", json!({"answer": 42}))
            .await
            .expect("Alice should be able to encrypt for Bob");

        let message = assert_matches!(
            content,
            RoomEncryptedContent::OlmV1Curve25519AesSha2(c) => c.ciphertext
        );

        let plaintext = bob_session
            .decrypt(&message)
            .await
            .expect("Bob should be able to decrypt Alice's message");

        let payload: crate::types::events::DecryptedOlmPayload =
            serde_json::from_str(&plaintext).unwrap();
        assert_eq!(payload.event_type, "m.dummy");
        assert_eq!(payload.recipient, bob.user_id());
        assert_eq!(payload.sender, alice.user_id());
        assert_eq!(payload.keys.ed25519, alice.identity_keys().ed25519.to_base64());
    }

    #[tokio::test]
    async fn session_pickling_cycle() {
        let alice = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        let bob = Account::new(user_id!("@bob:localhost"), device_id!("BOBDEVICE"));

        let (alice_session, _) = alice.create_session_for(&bob).await;

        let pickle = alice_session.pickle().await;
        let serialized = serde_json::to_string(&pickle).unwrap();
        let deserialized: PickledSession = serde_json::from_str(&serialized).unwrap();

        let restored =
            Session::from_pickle(Arc::new(alice.device_keys().await), deserialized);

        assert_eq!(restored.session_id(), alice_session.session_id());
        assert_eq!(restored.sender_key(), alice_session.sender_key());
    }
}
