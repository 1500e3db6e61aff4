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

//! Wire content of the to-device `m.key.verification.*` events.

use std::collections::BTreeMap;

use ruma::{MilliSecondsSinceUnixEpoch, OwnedDeviceId, OwnedTransactionId};
use serde::{Deserialize, Serialize};

use super::CancelCode;

/// The content of an `m.key.verification.request` event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestContent {
    /// The device that is requesting to be verified.
    pub from_device: OwnedDeviceId,
    /// The verification methods the requesting device supports.
    pub methods: Vec<String>,
    /// The time the request was made, requests older than ten minutes are
    /// ignored.
    pub timestamp: MilliSecondsSinceUnixEpoch,
    /// A unique id tying the whole verification flow together.
    pub transaction_id: OwnedTransactionId,
}

/// The content of an `m.key.verification.ready` event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReadyContent {
    /// The device that accepted the verification request.
    pub from_device: OwnedDeviceId,
    /// The subset of the requested methods the accepting device supports.
    pub methods: Vec<String>,
    /// The id of the verification flow.
    pub transaction_id: OwnedTransactionId,
}

/// The content of an `m.key.verification.start` event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StartContent {
    /// The device that started the verification.
    pub from_device: OwnedDeviceId,
    /// The id of the verification flow.
    pub transaction_id: OwnedTransactionId,
    /// The method specific part of the event.
    #[serde(flatten)]
    pub method: StartMethod,
}

/// The verification method that a `m.key.verification.start` event chose.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum StartMethod {
    /// Short auth string verification.
    #[serde(rename = "m.sas.v1")]
    SasV1(SasV1Content),
    /// QR code verification, the scanning side echoes the shared secret
    /// back.
    #[serde(rename = "m.reciprocate.v1")]
    ReciprocateV1(ReciprocateV1Content),
}

/// The protocol lists a SAS verification start event advertises.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SasV1Content {
    /// The key agreement protocols the sender supports.
    pub key_agreement_protocols: Vec<String>,
    /// The hash algorithms the sender supports.
    pub hashes: Vec<String>,
    /// The MAC algorithms the sender supports.
    pub message_authentication_codes: Vec<String>,
    /// The short auth string representations the sender supports.
    pub short_authentication_string: Vec<String>,
}

impl Default for SasV1Content {
    fn default() -> Self {
        Self {
            key_agreement_protocols: vec!["curve25519-hkdf-sha256".to_owned()],
            hashes: vec!["sha256".to_owned()],
            message_authentication_codes: vec![
                "hkdf-hmac-sha256.v2".to_owned(),
                "hkdf-hmac-sha256".to_owned(),
            ],
            short_authentication_string: vec!["decimal".to_owned(), "emoji".to_owned()],
        }
    }
}

/// The content of a `m.reciprocate.v1` start event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReciprocateV1Content {
    /// The unpadded base64 encoded shared secret from the QR code.
    pub secret: String,
}

/// The content of an `m.key.verification.accept` event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AcceptContent {
    /// The id of the verification flow.
    pub transaction_id: OwnedTransactionId,
    /// The method of the verification, always `m.sas.v1`.
    pub method: String,
    /// The chosen key agreement protocol.
    pub key_agreement_protocol: String,
    /// The chosen hash algorithm.
    pub hash: String,
    /// The chosen MAC algorithm.
    pub message_authentication_code: String,
    /// The chosen short auth string representations.
    pub short_authentication_string: Vec<String>,
    /// The base64 encoded SHA-256 commitment over our yet unrevealed public
    /// key and the start event.
    pub commitment: String,
}

/// The content of an `m.key.verification.key` event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyContent {
    /// The id of the verification flow.
    pub transaction_id: OwnedTransactionId,
    /// The unpadded base64 encoded ephemeral Curve25519 public key.
    pub key: String,
}

/// The content of an `m.key.verification.mac` event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MacContent {
    /// The id of the verification flow.
    pub transaction_id: OwnedTransactionId,
    /// A map from key id to the MAC of the key, calculated using the shared
    /// secret.
    pub mac: BTreeMap<String, String>,
    /// The MAC of the comma separated, sorted list of key ids in `mac`.
    pub keys: String,
}

/// The content of an `m.key.verification.done` event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DoneContent {
    /// The id of the verification flow.
    pub transaction_id: OwnedTransactionId,
}

/// The content of an `m.key.verification.cancel` event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CancelContent {
    /// The id of the verification flow.
    pub transaction_id: OwnedTransactionId,
    /// The machine readable cancellation code.
    pub code: CancelCode,
    /// A human readable description of the cancellation.
    pub reason: String,
}

impl CancelContent {
    pub(crate) fn new(transaction_id: OwnedTransactionId, code: CancelCode) -> Self {
        let reason = code.reason().to_owned();
        Self { transaction_id, code, reason }
    }
}
