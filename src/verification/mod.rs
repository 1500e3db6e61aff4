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

//! Interactive device verification.
//!
//! Verification starts with a request carrying the supported methods; once
//! the other side is ready, either a short auth string flow (`m.sas.v1`) or a
//! QR code flow (`m.reciprocate.v1`) confirms that both devices hold the keys
//! they claim to, after which local trust is upgraded.

pub mod events;
mod machine;
mod qrcode;
mod requests;
mod sas;

use std::fmt;

use ruma::{OwnedTransactionId, TransactionId};
use serde::{Deserialize, Serialize};

pub use machine::VerificationMachine;
pub use qrcode::{QrVerification, QrVerificationState, QrCodeData, QrCodeDecodeError, QrMode};
pub use requests::{VerificationRequest, VerificationRequestState};
pub use sas::{Sas, SasState};

/// An emoji of the short auth string, with its description from the spec.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Emoji {
    /// The emoji symbol.
    pub symbol: &'static str,
    /// The English description of the emoji.
    pub description: &'static str,
}

/// The id that ties all events of a verification flow together.
///
/// Verification here always runs over to-device messages, so the flow id is
/// the shared transaction id.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowId(OwnedTransactionId);

impl FlowId {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn as_transaction_id(&self) -> &TransactionId {
        &self.0
    }
}

impl From<OwnedTransactionId> for FlowId {
    fn from(transaction_id: OwnedTransactionId) -> Self {
        Self(transaction_id)
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A machine readable code describing why a verification flow was cancelled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CancelCode {
    /// The user cancelled the verification.
    User,
    /// The verification took too long to complete.
    Timeout,
    /// An event referenced an unknown verification flow.
    UnknownTransaction,
    /// None of the offered verification methods are supported.
    UnknownMethod,
    /// An event arrived that the current flow state can't handle.
    UnexpectedMessage,
    /// A key MAC didn't match the expected key.
    KeyMismatch,
    /// The event sender doesn't match the user we're verifying.
    UserMismatch,
    /// An event was malformed.
    InvalidMessage,
    /// The flow was accepted on a different device.
    Accepted,
    /// The hash commitment didn't match the revealed public key.
    MismatchedCommitment,
    /// The short auth strings didn't match.
    MismatchedSas,
    /// A code this crate doesn't know about.
    Custom(String),
}

impl CancelCode {
    /// The wire representation of the code.
    pub fn as_str(&self) -> &str {
        match self {
            CancelCode::User => "m.user",
            CancelCode::Timeout => "m.timeout",
            CancelCode::UnknownTransaction => "m.unknown_transaction",
            CancelCode::UnknownMethod => "m.unknown_method",
            CancelCode::UnexpectedMessage => "m.unexpected_message",
            CancelCode::KeyMismatch => "m.key_mismatch",
            CancelCode::UserMismatch => "m.user_mismatch",
            CancelCode::InvalidMessage => "m.invalid_message",
            CancelCode::Accepted => "m.accepted",
            CancelCode::MismatchedCommitment => "m.mismatched_commitment",
            CancelCode::MismatchedSas => "m.mismatched_sas",
            CancelCode::Custom(code) => code,
        }
    }

    /// A human readable description of the cancellation.
    pub fn reason(&self) -> &'static str {
        match self {
            CancelCode::User => "The user cancelled the verification",
            CancelCode::Timeout => "The verification process timed out",
            CancelCode::UnknownTransaction => {
                "The device does not know about the given verification"
            }
            CancelCode::UnknownMethod => {
                "The device does not know how to handle the requested method"
            }
            CancelCode::UnexpectedMessage => "The device received an unexpected message",
            CancelCode::KeyMismatch => "The key was not verified",
            CancelCode::UserMismatch => "The expected user did not match the user verified",
            CancelCode::InvalidMessage => "The device received an invalid message",
            CancelCode::Accepted => "A m.key.verification.request was accepted by a different device",
            CancelCode::MismatchedCommitment => "The hash commitment did not match",
            CancelCode::MismatchedSas => "The short authentication strings did not match",
            CancelCode::Custom(_) => "Unknown cancel reason",
        }
    }
}

impl fmt::Display for CancelCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for CancelCode {
    fn from(code: &str) -> Self {
        match code {
            "m.user" => CancelCode::User,
            "m.timeout" => CancelCode::Timeout,
            "m.unknown_transaction" => CancelCode::UnknownTransaction,
            "m.unknown_method" => CancelCode::UnknownMethod,
            "m.unexpected_message" => CancelCode::UnexpectedMessage,
            "m.key_mismatch" => CancelCode::KeyMismatch,
            "m.user_mismatch" => CancelCode::UserMismatch,
            "m.invalid_message" => CancelCode::InvalidMessage,
            "m.accepted" => CancelCode::Accepted,
            "m.mismatched_commitment" => CancelCode::MismatchedCommitment,
            "m.mismatched_sas" => CancelCode::MismatchedSas,
            code => CancelCode::Custom(code.to_owned()),
        }
    }
}

impl Serialize for CancelCode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for CancelCode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let code = String::deserialize(deserializer)?;
        Ok(CancelCode::from(code.as_str()))
    }
}

/// Information about a cancelled verification flow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CancelInfo {
    cancel_code: CancelCode,
    cancelled_by_us: bool,
}

impl CancelInfo {
    pub(crate) fn new(cancel_code: CancelCode, cancelled_by_us: bool) -> Self {
        Self { cancel_code, cancelled_by_us }
    }

    /// The machine readable reason of the cancellation.
    pub fn cancel_code(&self) -> &CancelCode {
        &self.cancel_code
    }

    /// A human readable description of the cancellation.
    pub fn reason(&self) -> &'static str {
        self.cancel_code.reason()
    }

    /// Was the verification cancelled by our own side.
    pub fn cancelled_by_us(&self) -> bool {
        self.cancelled_by_us
    }
}

/// A concrete, in-flight verification.
#[derive(Clone, Debug)]
pub enum Verification {
    /// A short auth string verification.
    SasV1(Sas),
    /// A QR code verification.
    QrV1(QrVerification),
}

impl Verification {
    /// Get this verification as a SAS verification, if it is one.
    pub fn sas_v1(&self) -> Option<Sas> {
        if let Verification::SasV1(sas) = self {
            Some(sas.clone())
        } else {
            None
        }
    }

    /// Get this verification as a QR verification, if it is one.
    pub fn qr_v1(&self) -> Option<QrVerification> {
        if let Verification::QrV1(qr) = self {
            Some(qr.clone())
        } else {
            None
        }
    }

    /// Has the verification completed successfully.
    pub fn is_done(&self) -> bool {
        match self {
            Verification::SasV1(sas) => sas.is_done(),
            Verification::QrV1(qr) => qr.is_done(),
        }
    }

    /// Has the verification been cancelled.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Verification::SasV1(sas) => sas.is_cancelled(),
            Verification::QrV1(qr) => qr.is_cancelled(),
        }
    }

    /// The id of the flow this verification belongs to.
    pub fn flow_id(&self) -> &FlowId {
        match self {
            Verification::SasV1(sas) => sas.flow_id(),
            Verification::QrV1(qr) => qr.flow_id(),
        }
    }
}

impl From<Sas> for Verification {
    fn from(sas: Sas) -> Self {
        Verification::SasV1(sas)
    }
}

impl From<QrVerification> for Verification {
    fn from(qr: QrVerification) -> Self {
        Verification::QrV1(qr)
    }
}
