// Copyright 2022 The Matrix.org Foundation C.I.C.
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

//! Event contents for the encrypted and key-distribution to-device events.

use std::fmt::{self, Display};

use ruma::{
    MilliSecondsSinceUnixEpoch, OwnedDeviceId, OwnedEventId, OwnedRoomId, OwnedTransactionId,
    OwnedUserId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vodozemac::{
    megolm::{ExportedSessionKey, MegolmMessage, SessionKey},
    olm::OlmMessage,
    Curve25519PublicKey,
};

use super::{
    deserialize_curve_key, serialize_curve_key, EventEncryptionAlgorithm,
};

/// The content of an `m.room.encrypted` event, in either its room or
/// to-device form.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "algorithm")]
pub enum RoomEncryptedContent {
    /// An event encrypted with the `m.olm.v1.curve25519-aes-sha2` algorithm.
    #[serde(rename = "m.olm.v1.curve25519-aes-sha2")]
    OlmV1Curve25519AesSha2(OlmV1Curve25519AesSha2Content),

    /// An event encrypted with the `m.megolm.v1.aes-sha2` algorithm.
    #[serde(rename = "m.megolm.v1.aes-sha2")]
    MegolmV1AesSha2(MegolmV1AesSha2Content),
}

impl RoomEncryptedContent {
    pub fn algorithm(&self) -> EventEncryptionAlgorithm {
        match self {
            Self::OlmV1Curve25519AesSha2(_) => EventEncryptionAlgorithm::OlmV1Curve25519AesSha2,
            Self::MegolmV1AesSha2(_) => EventEncryptionAlgorithm::MegolmV1AesSha2,
        }
    }
}

/// The `m.olm.v1.curve25519-aes-sha2` variant of an encrypted event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OlmV1Curve25519AesSha2Content {
    /// The encrypted payload.
    pub ciphertext: OlmMessage,

    /// The Curve25519 key of the device that is meant to decrypt the
    /// payload.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub recipient_key: Curve25519PublicKey,

    /// The Curve25519 key of the device that encrypted the payload.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub sender_key: Curve25519PublicKey,
}

/// The `m.megolm.v1.aes-sha2` variant of an encrypted room event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MegolmV1AesSha2Content {
    /// The encrypted content of the room event.
    pub ciphertext: MegolmMessage,

    /// The Curve25519 key of the device that encrypted the event.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub sender_key: Curve25519PublicKey,

    /// The ID of the device that encrypted the event.
    pub device_id: OwnedDeviceId,

    /// The ID of the Megolm session that was used to encrypt the event.
    pub session_id: String,
}

/// An `m.room.encrypted` room event, with only the fields the decryption step
/// needs to look at.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptedEvent {
    /// The ID of the user that sent the event.
    pub sender: OwnedUserId,

    /// The globally unique identifier of the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<OwnedEventId>,

    /// The timestamp the homeserver put on the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_server_ts: Option<MilliSecondsSinceUnixEpoch>,

    /// The ID of the room the event was sent to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<OwnedRoomId>,

    /// The encrypted content of the event.
    pub content: RoomEncryptedContent,
}

/// The decrypted payload that travels inside an Olm-encrypted to-device
/// event.
///
/// The redundant sender and recipient fields bind the plaintext to the two
/// devices of the Olm channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DecryptedOlmPayload {
    /// The ID of the user that encrypted the payload.
    pub sender: OwnedUserId,

    /// The ID of the device that encrypted the payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_device: Option<OwnedDeviceId>,

    /// The ID of the user the payload was meant for.
    pub recipient: OwnedUserId,

    /// The Ed25519 key of the sender, in its base64 form.
    pub keys: OlmPayloadKeys,

    /// The Ed25519 key the sender believes the recipient to have.
    pub recipient_keys: OlmPayloadKeys,

    /// The type of the event that was encrypted.
    #[serde(rename = "type")]
    pub event_type: String,

    /// The content of the encrypted event.
    pub content: Value,
}

/// The signing keys that tie an Olm payload to a device identity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OlmPayloadKeys {
    /// The base64 encoded Ed25519 key.
    pub ed25519: String,
}

/// The content of an `m.room_key` to-device event.
#[derive(Serialize, Deserialize)]
pub struct RoomKeyContent {
    /// The encryption algorithm the session is to be used with.
    pub algorithm: EventEncryptionAlgorithm,

    /// The ID of the room the session belongs to.
    pub room_id: OwnedRoomId,

    /// The ID of the session.
    pub session_id: String,

    /// The ratchet of the session at the point the key was shared.
    #[serde(
        serialize_with = "serialize_session_key",
        deserialize_with = "deserialize_session_key"
    )]
    pub session_key: SessionKey,
}

impl Clone for RoomKeyContent {
    fn clone(&self) -> Self {
        Self {
            algorithm: self.algorithm.clone(),
            room_id: self.room_id.clone(),
            session_id: self.session_id.clone(),
            session_key: SessionKey::from_bytes(&self.session_key.to_bytes())
                .expect("a valid session key can be round-tripped through its byte encoding"),
        }
    }
}

impl fmt::Debug for RoomKeyContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomKeyContent")
            .field("algorithm", &self.algorithm)
            .field("room_id", &self.room_id)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

/// The content of an `m.forwarded_room_key` to-device event.
#[derive(Serialize, Deserialize)]
pub struct ForwardedRoomKeyContent {
    /// The encryption algorithm the session is to be used with.
    pub algorithm: EventEncryptionAlgorithm,

    /// The ID of the room the session belongs to.
    pub room_id: OwnedRoomId,

    /// The Curve25519 key of the device which initiated the session.
    #[serde(
        rename = "sender_key",
        deserialize_with = "deserialize_curve_key",
        serialize_with = "serialize_curve_key"
    )]
    pub claimed_sender_key: Curve25519PublicKey,

    /// The ID of the session.
    pub session_id: String,

    /// The exported ratchet of the session.
    #[serde(
        serialize_with = "serialize_exported_session_key",
        deserialize_with = "deserialize_exported_session_key"
    )]
    pub session_key: ExportedSessionKey,

    /// The claimed Ed25519 key of the device which initiated the session.
    pub sender_claimed_ed25519_key: String,

    /// The Curve25519 keys of the devices that forwarded the session to us,
    /// oldest first.
    pub forwarding_curve25519_key_chain: Vec<String>,
}

impl Clone for ForwardedRoomKeyContent {
    fn clone(&self) -> Self {
        Self {
            algorithm: self.algorithm.clone(),
            room_id: self.room_id.clone(),
            claimed_sender_key: self.claimed_sender_key,
            session_id: self.session_id.clone(),
            session_key: ExportedSessionKey::from_bytes(&self.session_key.to_bytes())
                .expect("a valid exported session key can be round-tripped through its byte encoding"),
            sender_claimed_ed25519_key: self.sender_claimed_ed25519_key.clone(),
            forwarding_curve25519_key_chain: self.forwarding_curve25519_key_chain.clone(),
        }
    }
}

impl fmt::Debug for ForwardedRoomKeyContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwardedRoomKeyContent")
            .field("algorithm", &self.algorithm)
            .field("room_id", &self.room_id)
            .field("claimed_sender_key", &self.claimed_sender_key)
            .field("session_id", &self.session_id)
            .field("sender_claimed_ed25519_key", &self.sender_claimed_ed25519_key)
            .field("forwarding_curve25519_key_chain", &self.forwarding_curve25519_key_chain)
            .finish_non_exhaustive()
    }
}

/// Machine readable reasons a room key was withheld from a device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WithheldCode {
    /// The recipient device is blacklisted.
    #[serde(rename = "m.blacklisted")]
    Blacklisted,

    /// The recipient device is not verified and the sender only shares keys
    /// with verified devices.
    #[serde(rename = "m.unverified")]
    Unverified,

    /// The recipient is not in the room where the session is used.
    #[serde(rename = "m.unauthorised")]
    Unauthorised,

    /// The sender never had the requested session, or no longer has it.
    #[serde(rename = "m.unavailable")]
    Unavailable,

    /// An Olm session could not be established with the recipient device.
    #[serde(rename = "m.no_olm")]
    NoOlm,
}

impl WithheldCode {
    pub fn as_str(&self) -> &str {
        match self {
            WithheldCode::Blacklisted => "m.blacklisted",
            WithheldCode::Unverified => "m.unverified",
            WithheldCode::Unauthorised => "m.unauthorised",
            WithheldCode::Unavailable => "m.unavailable",
            WithheldCode::NoOlm => "m.no_olm",
        }
    }
}

impl Display for WithheldCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let string = match self {
            WithheldCode::Blacklisted => "The sender has blocked you.",
            WithheldCode::Unverified => "The sender has disabled encrypting to unverified devices.",
            WithheldCode::Unauthorised => "You are not authorised to read the message.",
            WithheldCode::Unavailable => "The requested key was not found.",
            WithheldCode::NoOlm => "Unable to establish a secure channel.",
        };

        f.write_str(string)
    }
}

/// The content of an `m.room_key.withheld` to-device event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoomKeyWithheldContent {
    /// The algorithm of the session the notice is about.
    pub algorithm: EventEncryptionAlgorithm,

    /// The reason the key was withheld.
    pub code: WithheldCode,

    /// The room of the session, missing for `m.no_olm` notices.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<OwnedRoomId>,

    /// The ID of the withheld session, missing for `m.no_olm` notices.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    /// The Curve25519 key of the device that withheld the session.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "super::deserialize_curve_key_option",
        serialize_with = "super::serialize_curve_key_option"
    )]
    pub sender_key: Option<Curve25519PublicKey>,
}

/// The content of an `m.secret.request` to-device event.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum SecretRequestContent {
    /// A request for a secret.
    #[serde(rename = "request")]
    Request {
        /// The name of the requested secret.
        name: String,
        /// The device requesting the secret.
        requesting_device_id: OwnedDeviceId,
        /// A unique ID tying the request to its eventual cancellation or
        /// answer.
        request_id: OwnedTransactionId,
    },

    /// The cancellation of a previous request.
    #[serde(rename = "request_cancellation")]
    Cancellation {
        /// The device that sent the original request.
        requesting_device_id: OwnedDeviceId,
        /// The ID of the request that is cancelled.
        request_id: OwnedTransactionId,
    },
}

/// The content of an `m.secret.send` to-device event, always travelling over
/// an Olm channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SecretSendContent {
    /// The ID of the request this secret answers.
    pub request_id: OwnedTransactionId,

    /// The secret itself.
    pub secret: String,
}

/// A to-device message with its type, addressed to a single device.
///
/// A batch of these, grouped by transaction ID, forms the request the
/// transport layer needs to send out.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToDeviceRequest {
    /// The type of the event to be sent.
    pub event_type: String,

    /// A unique ID for the request, used to mark it as sent.
    pub txn_id: OwnedTransactionId,

    /// The per-user, per-device message contents.
    pub messages: std::collections::BTreeMap<
        OwnedUserId,
        std::collections::BTreeMap<OwnedDeviceId, Value>,
    >,
}

impl ToDeviceRequest {
    pub fn new(event_type: &str) -> Self {
        Self {
            event_type: event_type.to_owned(),
            txn_id: ruma::TransactionId::new(),
            messages: Default::default(),
        }
    }

    /// The number of unique messages in the request.
    pub fn message_count(&self) -> usize {
        self.messages.values().map(|m| m.len()).sum()
    }
}

pub(crate) fn serialize_session_key<S>(key: &SessionKey, s: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    s.serialize_str(&key.to_base64())
}

pub(crate) fn deserialize_session_key<'de, D>(de: D) -> Result<SessionKey, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let key: String = Deserialize::deserialize(de)?;
    SessionKey::from_base64(&key).map_err(serde::de::Error::custom)
}

pub(crate) fn serialize_exported_session_key<S>(
    key: &ExportedSessionKey,
    s: S,
) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    s.serialize_str(&key.to_base64())
}

pub(crate) fn deserialize_exported_session_key<'de, D>(
    de: D,
) -> Result<ExportedSessionKey, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let key: String = Deserialize::deserialize(de)?;
    ExportedSessionKey::from_base64(&key).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn encrypted_content_cycle() {
        let mut session =
            vodozemac::megolm::GroupSession::new(vodozemac::megolm::SessionConfig::version_1());

        let content = RoomEncryptedContent::MegolmV1AesSha2(MegolmV1AesSha2Content {
            ciphertext: session.encrypt(b"secret message"),
            sender_key: Curve25519PublicKey::from_base64(
                "ClCcCcqKWmBZLmEbeQjBhQBCBGWaXLCvjHKVKFgNWSY",
            )
            .unwrap(),
            device_id: "DEWRCMENGS".into(),
            session_id: session.session_id(),
        });

        let serialized = serde_json::to_value(&content)
            .expect("We can serialize an encrypted content");

        assert_eq!(serialized["algorithm"], json!("m.megolm.v1.aes-sha2"));
        assert_eq!(serialized["session_id"], json!(session.session_id()));

        let deserialized: RoomEncryptedContent = serde_json::from_value(serialized)
            .expect("We can deserialize the content back");
        let megolm = assert_matches::assert_matches!(
            deserialized, RoomEncryptedContent::MegolmV1AesSha2(c) => c
        );
        assert_eq!(megolm.session_id, session.session_id());
        assert_eq!(megolm.device_id, "DEWRCMENGS");
    }

    #[test]
    fn withheld_code_cycle() {
        let code: WithheldCode = serde_json::from_value(json!("m.unverified")).unwrap();
        assert_eq!(code, WithheldCode::Unverified);
        assert_eq!(serde_json::to_value(&code).unwrap(), json!("m.unverified"));
    }
}
