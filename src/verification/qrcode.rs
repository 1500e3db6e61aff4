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

//! QR code based verification.
//!
//! One device displays a QR code carrying its keys and a random shared
//! secret, the other device scans it and echoes the secret back in an
//! `m.reciprocate.v1` start event. The displaying side checks the secret and
//! asks its user to confirm that the other device shows a green checkmark.

use std::{
    io::{Cursor, Read},
    sync::{Arc, Mutex as StdMutex},
};

use rand::{thread_rng, RngCore};
use ruma::UserId;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{info, warn};
use vodozemac::{base64_decode, base64_encode, Ed25519PublicKey};

use super::{
    events::{CancelContent, DoneContent, ReciprocateV1Content, StartContent, StartMethod},
    CancelCode, CancelInfo, FlowId,
};
use crate::{identities::Device, olm::StaticAccountData};

const HEADER: [u8; 6] = *b"MATRIX";
const VERSION: u8 = 0x02;
const SECRET_LEN: usize = 16;
const MIN_SECRET_LEN: usize = 8;

/// The capability a QR code advertises.
///
/// The mode tells the scanning device which of the two embedded keys is
/// being attested and which one the displaying device expects the scanner
/// to hold.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QrMode {
    /// Verifying another user.
    CrossVerification,
    /// Verifying one of our own devices which trusts our keys.
    SelfVerification,
    /// Verifying one of our own devices which doesn't yet trust our keys.
    SelfVerificationNoTrust,
}

impl QrMode {
    fn as_byte(self) -> u8 {
        match self {
            QrMode::CrossVerification => 0x00,
            QrMode::SelfVerification => 0x01,
            QrMode::SelfVerificationNoTrust => 0x02,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(QrMode::CrossVerification),
            0x01 => Some(QrMode::SelfVerification),
            0x02 => Some(QrMode::SelfVerificationNoTrust),
            _ => None,
        }
    }
}

/// An error that can happen while decoding the binary payload of a QR code.
#[derive(Debug, Error)]
pub enum QrCodeDecodeError {
    /// The payload is missing the `MATRIX` header.
    #[error("the QR code is missing the Matrix header")]
    Header,
    /// The payload uses a version we don't support.
    #[error("the QR code contains an invalid or unsupported version: {0}")]
    Version(u8),
    /// The payload advertises an unknown verification mode.
    #[error("the QR code contains an invalid verification mode: {0}")]
    Mode(u8),
    /// The payload was truncated.
    #[error(transparent)]
    Read(#[from] std::io::Error),
    /// The flow id isn't valid UTF-8.
    #[error(transparent)]
    Utf8(#[from] std::string::FromUtf8Error),
    /// One of the embedded keys isn't a valid Ed25519 key.
    #[error(transparent)]
    Keys(#[from] vodozemac::KeyError),
    /// The shared secret is too short to be safe.
    #[error("the QR code contains a too short shared secret, length: {0}")]
    SharedSecret(usize),
}

/// The decoded payload of a verification QR code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QrCodeData {
    /// The capability the QR code advertises.
    pub mode: QrMode,
    /// The id of the verification flow the QR code belongs to.
    pub flow_id: FlowId,
    /// The key the displaying device attests, its own Ed25519 key.
    pub first_key: Ed25519PublicKey,
    /// The key the displaying device expects the scanner to hold.
    pub second_key: Ed25519PublicKey,
    /// The random secret the scanner echoes back to prove it scanned this
    /// exact code.
    pub shared_secret: Vec<u8>,
}

impl QrCodeData {
    /// Encode the payload into the byte string that gets rendered as a QR
    /// code.
    pub fn to_bytes(&self) -> Vec<u8> {
        let flow_id = self.flow_id.as_str().as_bytes();

        let mut bytes = Vec::with_capacity(
            HEADER.len() + 2 + 2 + flow_id.len() + 64 + self.shared_secret.len(),
        );

        bytes.extend_from_slice(&HEADER);
        bytes.push(VERSION);
        bytes.push(self.mode.as_byte());
        bytes.extend_from_slice(&(flow_id.len() as u16).to_be_bytes());
        bytes.extend_from_slice(flow_id);
        bytes.extend_from_slice(self.first_key.as_bytes());
        bytes.extend_from_slice(self.second_key.as_bytes());
        bytes.extend_from_slice(&self.shared_secret);

        bytes
    }

    /// Decode the byte string of a scanned QR code.
    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> Result<Self, QrCodeDecodeError> {
        let mut cursor = Cursor::new(bytes.as_ref());

        let mut header = [0u8; 6];
        let mut version = [0u8; 1];
        let mut mode = [0u8; 1];

        cursor.read_exact(&mut header)?;
        cursor.read_exact(&mut version)?;
        cursor.read_exact(&mut mode)?;

        if header != HEADER {
            return Err(QrCodeDecodeError::Header);
        } else if version[0] != VERSION {
            return Err(QrCodeDecodeError::Version(version[0]));
        }

        let mode = QrMode::from_byte(mode[0]).ok_or(QrCodeDecodeError::Mode(mode[0]))?;

        let mut flow_id_len = [0u8; 2];
        cursor.read_exact(&mut flow_id_len)?;

        let mut flow_id = vec![0u8; u16::from_be_bytes(flow_id_len).into()];
        let mut first_key = [0u8; 32];
        let mut second_key = [0u8; 32];

        cursor.read_exact(&mut flow_id)?;
        cursor.read_exact(&mut first_key)?;
        cursor.read_exact(&mut second_key)?;

        let mut shared_secret = Vec::new();
        cursor.read_to_end(&mut shared_secret)?;

        if shared_secret.len() < MIN_SECRET_LEN {
            return Err(QrCodeDecodeError::SharedSecret(shared_secret.len()));
        }

        let flow_id: FlowId = ruma::OwnedTransactionId::from(
            String::from_utf8(flow_id)?.as_str(),
        )
        .into();

        Ok(Self {
            mode,
            flow_id,
            first_key: Ed25519PublicKey::from_slice(&first_key)?,
            second_key: Ed25519PublicKey::from_slice(&second_key)?,
            shared_secret,
        })
    }
}

/// A snapshot of the current phase of a [`QrVerification`] flow.
#[derive(Clone, Debug)]
pub enum QrVerificationState {
    /// The QR code is being displayed, nobody scanned it yet.
    Started,
    /// The other side scanned our QR code and echoed the secret back, our
    /// user needs to confirm the checkmark on the other device.
    Scanned,
    /// We confirmed that the other side scanned our code.
    Confirmed,
    /// We scanned the QR code of the other side and told it so.
    Reciprocated,
    /// The flow completed and the device was marked as verified.
    Done {
        /// The devices the flow verified.
        verified_devices: Vec<Device>,
    },
    /// The flow was cancelled.
    Cancelled(CancelInfo),
}

#[derive(Clone, Debug)]
enum InnerQr {
    /// We're displaying the QR code.
    Started { secret: Arc<Vec<u8>> },
    /// The displayed code was scanned and the secret checked out.
    Scanned,
    /// We confirmed the scan, waiting for the done event.
    Confirmed,
    /// We scanned their code and sent the reciprocation, waiting for the
    /// done event.
    Reciprocated,
    Done,
    Cancelled(CancelInfo),
}

/// A QR code verification flow with another device.
#[derive(Clone, Debug)]
pub struct QrVerification {
    inner: Arc<StdMutex<InnerQr>>,
    account: StaticAccountData,
    other_device: Device,
    flow_id: Arc<FlowId>,
    we_started: bool,
}

impl QrVerification {
    /// Create a flow that displays a QR code for the given device to scan.
    ///
    /// Returns `None` if the device didn't upload an Ed25519 key.
    pub(crate) fn new_show(
        account: StaticAccountData,
        other_device: Device,
        flow_id: FlowId,
    ) -> Option<(QrVerification, QrCodeData)> {
        let second_key = other_device.ed25519_key()?;

        let mut secret = vec![0u8; SECRET_LEN];
        thread_rng().fill_bytes(&mut secret);

        let data = QrCodeData {
            mode: if account.user_id == other_device.user_id() {
                QrMode::SelfVerification
            } else {
                QrMode::CrossVerification
            },
            flow_id: flow_id.clone(),
            first_key: account.ed25519_key(),
            second_key,
            shared_secret: secret.clone(),
        };

        let verification = QrVerification {
            inner: Arc::new(StdMutex::new(InnerQr::Started { secret: Arc::new(secret) })),
            account,
            other_device,
            flow_id: Arc::new(flow_id),
            we_started: true,
        };

        Some((verification, data))
    }

    /// Create a flow from a QR code we scanned off the given device.
    ///
    /// Returns the flow object and the reciprocation start event that proves
    /// to the displaying side that we scanned its code.
    pub(crate) fn from_scan(
        account: StaticAccountData,
        other_device: Device,
        data: QrCodeData,
    ) -> Result<(QrVerification, StartContent), CancelCode> {
        if Some(data.first_key) != other_device.ed25519_key()
            || data.second_key != account.ed25519_key()
        {
            warn!(
                user_id = %other_device.user_id(),
                device_id = %other_device.device_id(),
                "The scanned QR code contains unexpected keys"
            );
            return Err(CancelCode::KeyMismatch);
        }

        let content = StartContent {
            from_device: account.device_id.clone(),
            transaction_id: data.flow_id.as_transaction_id().to_owned(),
            method: StartMethod::ReciprocateV1(ReciprocateV1Content {
                secret: base64_encode(&data.shared_secret),
            }),
        };

        let verification = QrVerification {
            inner: Arc::new(StdMutex::new(InnerQr::Reciprocated)),
            account,
            other_device,
            flow_id: Arc::new(data.flow_id),
            we_started: false,
        };

        Ok((verification, content))
    }

    /// The id tying all the events of this flow together.
    pub fn flow_id(&self) -> &FlowId {
        &self.flow_id
    }

    /// The device on the other side of this flow.
    pub fn other_device(&self) -> &Device {
        &self.other_device
    }

    /// Our own user id.
    pub fn user_id(&self) -> &UserId {
        &self.account.user_id
    }

    /// Did we display the QR code.
    pub fn we_started(&self) -> bool {
        self.we_started
    }

    /// The current phase of the flow.
    pub fn state(&self) -> QrVerificationState {
        match &*self.lock() {
            InnerQr::Started { .. } => QrVerificationState::Started,
            InnerQr::Scanned => QrVerificationState::Scanned,
            InnerQr::Confirmed => QrVerificationState::Confirmed,
            InnerQr::Reciprocated => QrVerificationState::Reciprocated,
            InnerQr::Done => QrVerificationState::Done {
                verified_devices: vec![self.other_device.clone()],
            },
            InnerQr::Cancelled(info) => QrVerificationState::Cancelled(info.clone()),
        }
    }

    /// The other side scanned our QR code and echoes the secret back.
    pub(crate) fn receive_reciprocation(&self, sender: &UserId, content: &StartContent) {
        if sender != self.other_device.user_id()
            || content.transaction_id != *self.flow_id.as_transaction_id()
        {
            return;
        }

        let mut guard = self.lock();

        let InnerQr::Started { secret } = &*guard else {
            return;
        };

        let StartMethod::ReciprocateV1(reciprocate) = &content.method else {
            *guard = InnerQr::Cancelled(CancelInfo::new(CancelCode::UnexpectedMessage, true));
            return;
        };

        let Ok(their_secret) = base64_decode(&reciprocate.secret) else {
            *guard = InnerQr::Cancelled(CancelInfo::new(CancelCode::InvalidMessage, true));
            return;
        };

        if their_secret.as_slice().ct_eq(secret.as_slice()).into() {
            info!(
                user_id = %sender,
                flow_id = self.flow_id.as_str(),
                "Our QR code was scanned by the other device"
            );
            *guard = InnerQr::Scanned;
        } else {
            *guard = InnerQr::Cancelled(CancelInfo::new(CancelCode::KeyMismatch, true));
        }
    }

    /// Confirm that the other device scanned our QR code and shows the
    /// checkmark.
    ///
    /// Returns the done event if the flow was waiting for this confirmation.
    pub fn confirm_scanning(&self) -> Option<DoneContent> {
        let mut guard = self.lock();

        match &*guard {
            InnerQr::Scanned => {
                *guard = InnerQr::Confirmed;
                Some(DoneContent {
                    transaction_id: self.flow_id.as_transaction_id().to_owned(),
                })
            }
            _ => None,
        }
    }

    /// The other side is done with the flow.
    ///
    /// If we scanned the code this also produces our own done event.
    pub(crate) fn receive_done(
        &self,
        sender: &UserId,
        content: &DoneContent,
    ) -> Option<DoneContent> {
        if sender != self.other_device.user_id()
            || content.transaction_id != *self.flow_id.as_transaction_id()
        {
            return None;
        }

        let mut guard = self.lock();

        match &*guard {
            InnerQr::Confirmed => {
                *guard = InnerQr::Done;
                None
            }
            InnerQr::Reciprocated => {
                *guard = InnerQr::Done;
                Some(DoneContent {
                    transaction_id: self.flow_id.as_transaction_id().to_owned(),
                })
            }
            _ => None,
        }
    }

    /// Cancel the flow, returning the cancellation event that needs to be
    /// sent out, unless the flow already ended.
    pub fn cancel(&self, code: CancelCode) -> Option<CancelContent> {
        let mut guard = self.lock();

        match &*guard {
            InnerQr::Done | InnerQr::Cancelled(_) => None,
            _ => {
                *guard = InnerQr::Cancelled(CancelInfo::new(code.clone(), true));
                Some(CancelContent::new(self.flow_id.as_transaction_id().to_owned(), code))
            }
        }
    }

    /// The other side cancelled the flow.
    pub(crate) fn receive_cancel(&self, sender: &UserId, content: &CancelContent) {
        if sender != self.other_device.user_id()
            || content.transaction_id != *self.flow_id.as_transaction_id()
        {
            return;
        }

        let mut guard = self.lock();

        if !matches!(&*guard, InnerQr::Done | InnerQr::Cancelled(_)) {
            *guard = InnerQr::Cancelled(CancelInfo::new(content.code.clone(), false));
        }
    }

    /// Did the flow complete successfully.
    pub fn is_done(&self) -> bool {
        matches!(&*self.lock(), InnerQr::Done)
    }

    /// Was the flow cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(&*self.lock(), InnerQr::Cancelled(_))
    }

    /// Why and by whom was the flow cancelled, if it was.
    pub fn cancel_info(&self) -> Option<CancelInfo> {
        match &*self.lock() {
            InnerQr::Cancelled(info) => Some(info.clone()),
            _ => None,
        }
    }

    /// The devices the completed flow verified.
    pub fn verified_devices(&self) -> Option<Vec<Device>> {
        match &*self.lock() {
            InnerQr::Done => Some(vec![self.other_device.clone()]),
            _ => None,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, InnerQr> {
        self.inner.lock().expect("The QR verification lock should never be poisoned")
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use ruma::{device_id, user_id, TransactionId};

    use super::*;
    use crate::olm::Account;

    fn random_key() -> Ed25519PublicKey {
        vodozemac::Ed25519Keypair::new().public_key()
    }

    #[test]
    fn qr_code_data_encoding_round_trips() {
        let flow_id: FlowId = TransactionId::new().into();

        let data = QrCodeData {
            mode: QrMode::SelfVerificationNoTrust,
            flow_id,
            first_key: random_key(),
            second_key: random_key(),
            shared_secret: vec![3u8; SECRET_LEN],
        };

        let decoded = QrCodeData::from_bytes(data.to_bytes()).unwrap();
        assert_eq!(data, decoded);
    }

    #[test]
    fn invalid_payloads_are_rejected() {
        assert_matches!(
            QrCodeData::from_bytes(b"NOTMATRIX"),
            Err(QrCodeDecodeError::Header)
        );

        let flow_id: FlowId = TransactionId::new().into();
        let data = QrCodeData {
            mode: QrMode::SelfVerification,
            flow_id,
            first_key: random_key(),
            second_key: random_key(),
            shared_secret: vec![3u8; 4],
        };

        assert_matches!(
            QrCodeData::from_bytes(data.to_bytes()),
            Err(QrCodeDecodeError::SharedSecret(4))
        );
    }

    #[tokio::test]
    async fn full_qr_flow() {
        let alice = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        let bob = Account::new(user_id!("@alice:localhost"), device_id!("BOBDEVICE"));

        let alice_device = Device::from_account(&alice).await;
        let bob_device = Device::from_account(&bob).await;

        let flow_id: FlowId = TransactionId::new().into();

        let (alice_qr, data) =
            QrVerification::new_show(alice.static_data().clone(), bob_device, flow_id).unwrap();
        assert_eq!(data.mode, QrMode::SelfVerification);

        let data = QrCodeData::from_bytes(data.to_bytes()).unwrap();

        let (bob_qr, start) =
            QrVerification::from_scan(bob.static_data().clone(), alice_device, data).unwrap();
        assert_matches!(bob_qr.state(), QrVerificationState::Reciprocated);

        alice_qr.receive_reciprocation(bob.static_data().user_id.as_ref(), &start);
        assert_matches!(alice_qr.state(), QrVerificationState::Scanned);

        let done = alice_qr.confirm_scanning().unwrap();
        let bob_done = bob_qr
            .receive_done(alice.static_data().user_id.as_ref(), &done)
            .unwrap();
        assert!(bob_qr.is_done());

        assert!(alice_qr
            .receive_done(bob.static_data().user_id.as_ref(), &bob_done)
            .is_none());
        assert!(alice_qr.is_done());
        assert!(!alice_qr.verified_devices().unwrap().is_empty());
    }

    #[tokio::test]
    async fn mismatched_keys_fail_the_scan() {
        let alice = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        let bob = Account::new(user_id!("@alice:localhost"), device_id!("BOBDEVICE"));

        let alice_device = Device::from_account(&alice).await;
        let bob_device = Device::from_account(&bob).await;

        let flow_id: FlowId = TransactionId::new().into();

        let (_, mut data) =
            QrVerification::new_show(alice.static_data().clone(), bob_device, flow_id).unwrap();
        data.first_key = random_key();

        let result = QrVerification::from_scan(bob.static_data().clone(), alice_device, data);
        assert_matches!(result, Err(CancelCode::KeyMismatch));
    }
}
