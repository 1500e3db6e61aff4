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

//! Serializable data types shared between the modules of the crate.

pub mod events;

use std::{
    collections::BTreeMap,
    fmt::{self, Display},
};

use ruma::{CanonicalJsonValue, DeviceId, OwnedDeviceId, OwnedUserId, UserId};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey, Ed25519Signature};

use crate::error::SignatureError;

/// An encryption algorithm to be used to encrypt messages sent to a room or a
/// device.
///
/// This is a closed enum, synced with the algorithms the crate can actually
/// handle. Unsupported values survive a serialization cycle through the
/// `Unknown` variant.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventEncryptionAlgorithm {
    /// Olm version 1 using Curve25519, AES-256, and SHA-256.
    OlmV1Curve25519AesSha2,
    /// Megolm version 1 using AES-256 and SHA-256.
    MegolmV1AesSha2,
    /// An unsupported algorithm.
    Unknown(String),
}

impl EventEncryptionAlgorithm {
    pub fn as_str(&self) -> &str {
        match self {
            Self::OlmV1Curve25519AesSha2 => "m.olm.v1.curve25519-aes-sha2",
            Self::MegolmV1AesSha2 => "m.megolm.v1.aes-sha2",
            Self::Unknown(a) => a,
        }
    }
}

impl From<&str> for EventEncryptionAlgorithm {
    fn from(value: &str) -> Self {
        match value {
            "m.olm.v1.curve25519-aes-sha2" => Self::OlmV1Curve25519AesSha2,
            "m.megolm.v1.aes-sha2" => Self::MegolmV1AesSha2,
            other => Self::Unknown(other.to_owned()),
        }
    }
}

impl Display for EventEncryptionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventEncryptionAlgorithm {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventEncryptionAlgorithm {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let algorithm = String::deserialize(deserializer)?;
        Ok(algorithm.as_str().into())
    }
}

/// Signatures of a signed JSON object, keyed by the user that created them and
/// the ID of the signing key.
pub type Signatures = BTreeMap<OwnedUserId, BTreeMap<String, String>>;

/// The public identity keys of a device, in the shape the `/keys/upload` and
/// `/keys/query` endpoints use.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceKeys {
    /// The ID of the user the device belongs to.
    pub user_id: OwnedUserId,

    /// The ID of the device these keys belong to.
    pub device_id: OwnedDeviceId,

    /// The encryption algorithms supported by this device.
    pub algorithms: Vec<EventEncryptionAlgorithm>,

    /// Public identity keys, keyed by `{algorithm}:{device_id}`.
    pub keys: BTreeMap<String, String>,

    /// Signatures for the device key object.
    pub signatures: Signatures,

    /// Additional data added to the device key information by intermediate
    /// servers, and not covered by the signatures.
    #[serde(default, skip_serializing_if = "UnsignedDeviceInfo::is_empty")]
    pub unsigned: UnsignedDeviceInfo,
}

impl DeviceKeys {
    pub fn curve25519_key(&self) -> Option<Curve25519PublicKey> {
        self.keys
            .get(&format!("curve25519:{}", self.device_id))
            .and_then(|k| Curve25519PublicKey::from_base64(k).ok())
    }

    pub fn ed25519_key(&self) -> Option<Ed25519PublicKey> {
        self.keys
            .get(&format!("ed25519:{}", self.device_id))
            .and_then(|k| Ed25519PublicKey::from_base64(k).ok())
    }
}

/// Additional data added to device key information by intermediate servers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedDeviceInfo {
    /// The display name which the user set on the device.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_display_name: Option<String>,
}

impl UnsignedDeviceInfo {
    pub fn is_empty(&self) -> bool {
        self.device_display_name.is_none()
    }
}

/// A one-time or fallback public key, signed by the device that created it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedKey {
    /// The public part of the key.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub key: Curve25519PublicKey,

    /// Signatures of the key object.
    pub signatures: Signatures,

    /// Whether the key is a fallback key.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fallback: bool,
}

// Vodozemac serializes Curve25519 keys as byte slices, Matrix expects
// unpadded base64 strings.
pub(crate) fn deserialize_curve_key<'de, D>(de: D) -> Result<Curve25519PublicKey, D::Error>
where
    D: Deserializer<'de>,
{
    let key: String = Deserialize::deserialize(de)?;
    Curve25519PublicKey::from_base64(&key).map_err(serde::de::Error::custom)
}

pub(crate) fn serialize_curve_key<S>(key: &Curve25519PublicKey, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    s.serialize_str(&key.to_base64())
}

pub(crate) fn deserialize_curve_key_option<'de, D>(
    de: D,
) -> Result<Option<Curve25519PublicKey>, D::Error>
where
    D: Deserializer<'de>,
{
    let key: Option<String> = Deserialize::deserialize(de)?;
    key.map(|k| Curve25519PublicKey::from_base64(&k).map_err(serde::de::Error::custom))
        .transpose()
}

pub(crate) fn serialize_curve_key_option<S>(
    key: &Option<Curve25519PublicKey>,
    s: S,
) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match key {
        Some(key) => s.serialize_some(&key.to_base64()),
        None => s.serialize_none(),
    }
}

/// Produce the canonical JSON form of the given object, with the `signatures`
/// and `unsigned` fields removed.
pub(crate) fn to_signable_json(mut value: Value) -> Result<String, SignatureError> {
    let json_object = value.as_object_mut().ok_or(SignatureError::NotAnObject)?;
    json_object.remove("signatures");
    json_object.remove("unsigned");

    let canonical: CanonicalJsonValue =
        value.try_into().map_err(|_| SignatureError::NotAnObject)?;

    Ok(canonical.to_string())
}

/// Check the Ed25519 signature a device created over a JSON object.
///
/// The signature is expected under `signatures.{user_id}.ed25519:{device_id}`.
pub(crate) fn verify_signed_json(
    key: Ed25519PublicKey,
    user_id: &UserId,
    device_id: &DeviceId,
    json: &Value,
) -> Result<(), SignatureError> {
    let signature = json
        .get("signatures")
        .and_then(|s| s.get(user_id.as_str()))
        .and_then(|s| s.get(format!("ed25519:{device_id}")))
        .and_then(Value::as_str)
        .ok_or(SignatureError::NoSignatureFound)?;

    let signature = Ed25519Signature::from_base64(signature)?;
    let message = to_signable_json(json.clone())?;

    key.verify(message.as_bytes(), &signature)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn algorithm_serialization_cycle() {
        let algorithm = EventEncryptionAlgorithm::MegolmV1AesSha2;
        let serialized = serde_json::to_value(&algorithm).unwrap();

        assert_eq!(serialized, json!("m.megolm.v1.aes-sha2"));
        assert_eq!(serde_json::from_value::<EventEncryptionAlgorithm>(serialized).unwrap(), algorithm);

        let unknown: EventEncryptionAlgorithm =
            serde_json::from_value(json!("m.megolm.v100.aes-sha2")).unwrap();
        assert_eq!(unknown, EventEncryptionAlgorithm::Unknown("m.megolm.v100.aes-sha2".to_owned()));
        assert_eq!(serde_json::to_value(&unknown).unwrap(), json!("m.megolm.v100.aes-sha2"));
    }

    #[test]
    fn signable_json_strips_signatures() {
        let value = json!({
            "algorithms": ["m.megolm.v1.aes-sha2"],
            "signatures": { "@alice:localhost": { "ed25519:DEVICEID": "signature" } },
            "unsigned": { "device_display_name": "Alice's phone" },
        });

        let canonical = to_signable_json(value).unwrap();
        assert_eq!(canonical, r#"{"algorithms":["m.megolm.v1.aes-sha2"]}"#);
    }
}
