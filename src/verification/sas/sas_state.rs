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

//! The typestate machine of a single short auth string flow.
//!
//! Every state transition consumes the old state, events that don't fit the
//! current state cancel the flow. The ephemeral Curve25519 secret lives
//! inside `vodozemac::sas::Sas` and gets consumed by the Diffie-Hellman step,
//! which is why the pre-established states carry it inside an
//! `Arc<Mutex<Option<_>>>`.

use std::{
    sync::{Arc, Mutex as StdMutex},
    time::{Duration, Instant},
};

use ruma::UserId;
use tracing::trace;
use vodozemac::{sas::EstablishedSas, Curve25519PublicKey};

use super::{
    super::{
        events::{
            AcceptContent, KeyContent, MacContent, SasV1Content, StartContent, StartMethod,
        },
        CancelCode, Emoji, FlowId,
    },
    helpers::{
        calculate_commitment, get_decimal, get_emoji, get_emoji_index, get_mac_content,
        receive_mac_event, SasIds, SupportedMacMethod,
    },
};
use crate::identities::Device;

/// The whole flow is aborted if it takes longer than this.
const MAX_AGE: Duration = Duration::from_secs(60 * 5);

const KEY_AGREEMENT_PROTOCOL: &str = "curve25519-hkdf-sha256";
const HASH_ALGORITHM: &str = "sha256";

/// The protocol choices both sides agreed on.
#[derive(Clone, Debug)]
pub struct AcceptedProtocols {
    pub key_agreement_protocol: String,
    pub hash: String,
    pub mac_method: SupportedMacMethod,
    pub short_auth_string: Vec<String>,
}

impl AcceptedProtocols {
    /// Pick our preferred protocols out of the lists a start event
    /// advertised.
    fn from_start_content(content: &SasV1Content) -> Result<Self, CancelCode> {
        if !content
            .key_agreement_protocols
            .iter()
            .any(|protocol| protocol == KEY_AGREEMENT_PROTOCOL)
            || !content.hashes.iter().any(|hash| hash == HASH_ALGORITHM)
            || content.short_authentication_string.is_empty()
        {
            return Err(CancelCode::UnknownMethod);
        }

        let mac_method = content
            .message_authentication_codes
            .iter()
            .filter_map(|method| SupportedMacMethod::from_wire(method))
            .max_by_key(|method| *method == SupportedMacMethod::HkdfHmacSha256V2)
            .ok_or(CancelCode::UnknownMethod)?;

        Ok(Self {
            key_agreement_protocol: KEY_AGREEMENT_PROTOCOL.to_owned(),
            hash: HASH_ALGORITHM.to_owned(),
            mac_method,
            short_auth_string: content.short_authentication_string.clone(),
        })
    }

    /// Check that an accept event picked protocols we actually offered.
    fn from_accept_content(content: &AcceptContent) -> Result<Self, CancelCode> {
        if content.key_agreement_protocol != KEY_AGREEMENT_PROTOCOL
            || content.hash != HASH_ALGORITHM
            || content.short_authentication_string.is_empty()
        {
            return Err(CancelCode::UnknownMethod);
        }

        let mac_method = SupportedMacMethod::from_wire(&content.message_authentication_code)
            .ok_or(CancelCode::UnknownMethod)?;

        Ok(Self {
            key_agreement_protocol: content.key_agreement_protocol.clone(),
            hash: content.hash.clone(),
            mac_method,
            short_auth_string: content.short_authentication_string.clone(),
        })
    }
}

/// A SAS flow in the given state.
#[derive(Clone, Debug)]
pub struct SasState<S: Clone> {
    /// The identities of both sides of the flow.
    pub ids: SasIds,
    /// The id tying all events of this flow together.
    pub verification_flow_id: Arc<FlowId>,
    /// The time the flow was created, used to time the whole flow out.
    pub creation_time: Arc<Instant>,
    /// The state specific data.
    pub state: S,
}

/// We started the flow and sent the start event.
#[derive(Clone)]
pub struct Created {
    sas: Arc<StdMutex<Option<vodozemac::sas::Sas>>>,
    our_public_key: Curve25519PublicKey,
    protocols: Arc<SasV1Content>,
}

impl std::fmt::Debug for Created {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Created")
            .field("our_public_key", &self.our_public_key)
            .field("protocols", &self.protocols)
            .finish_non_exhaustive()
    }
}

/// The other side started the flow, we computed the commitment and are ready
/// to accept.
#[derive(Clone)]
pub struct Started {
    sas: Arc<StdMutex<Option<vodozemac::sas::Sas>>>,
    our_public_key: Curve25519PublicKey,
    commitment: String,
    accepted_protocols: Arc<AcceptedProtocols>,
}

impl std::fmt::Debug for Started {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Started")
            .field("our_public_key", &self.our_public_key)
            .field("commitment", &self.commitment)
            .field("accepted_protocols", &self.accepted_protocols)
            .finish_non_exhaustive()
    }
}

/// We started the flow and the other side accepted, their commitment is
/// stored until they reveal their public key.
#[derive(Clone)]
pub struct Accepted {
    sas: Arc<StdMutex<Option<vodozemac::sas::Sas>>>,
    our_public_key: Curve25519PublicKey,
    commitment: String,
    start_content: Arc<StartContent>,
    accepted_protocols: Arc<AcceptedProtocols>,
}

impl std::fmt::Debug for Accepted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Accepted")
            .field("our_public_key", &self.our_public_key)
            .field("commitment", &self.commitment)
            .field("start_content", &self.start_content)
            .field("accepted_protocols", &self.accepted_protocols)
            .finish_non_exhaustive()
    }
}

/// Both public keys were exchanged, the short auth string can be presented.
#[derive(Clone, Debug)]
pub struct KeyReceived {
    established: Arc<EstablishedSas>,
    we_started: bool,
    accepted_protocols: Arc<AcceptedProtocols>,
}

/// The user confirmed that the short auth strings match, we're waiting for
/// the MAC of the other side.
#[derive(Clone, Debug)]
pub struct Confirmed {
    established: Arc<EstablishedSas>,
    accepted_protocols: Arc<AcceptedProtocols>,
}

/// The MAC of the other side verified, we're waiting for the user to confirm
/// the short auth strings.
#[derive(Clone, Debug)]
pub struct MacReceived {
    established: Arc<EstablishedSas>,
    we_started: bool,
    verified_devices: Arc<Vec<Device>>,
    accepted_protocols: Arc<AcceptedProtocols>,
}

/// Both sides confirmed and verified, the flow is complete.
#[derive(Clone, Debug)]
pub struct Done {
    verified_devices: Arc<Vec<Device>>,
}

/// The flow was aborted.
#[derive(Clone, Debug)]
pub struct Cancelled {
    pub cancel_code: CancelCode,
    pub cancelled_by_us: bool,
}

impl<S: Clone> SasState<S> {
    /// Has the flow been alive for too long.
    pub fn timed_out(&self) -> bool {
        self.creation_time.elapsed() > MAX_AGE
    }

    /// Check that an event belongs to this flow and comes from the device
    /// we're verifying.
    fn check_event(&self, sender: &UserId, flow_id: &str) -> Result<(), CancelCode> {
        if flow_id != self.verification_flow_id.as_str() {
            Err(CancelCode::UnknownTransaction)
        } else if sender != self.ids.other_device.user_id() {
            Err(CancelCode::UserMismatch)
        } else if self.timed_out() {
            Err(CancelCode::Timeout)
        } else {
            Ok(())
        }
    }

    fn into_cancelled(self, cancel_code: CancelCode, cancelled_by_us: bool) -> SasState<Cancelled> {
        SasState {
            ids: self.ids,
            verification_flow_id: self.verification_flow_id,
            creation_time: self.creation_time,
            state: Cancelled { cancel_code, cancelled_by_us },
        }
    }

    /// Abort the flow with the given code, because of something our own side
    /// noticed or decided.
    pub fn cancel(self, cancel_code: CancelCode) -> SasState<Cancelled> {
        self.into_cancelled(cancel_code, true)
    }

    /// Transition into the cancelled state because the other side sent us a
    /// cancellation.
    pub fn cancelled_by_them(self, cancel_code: CancelCode) -> SasState<Cancelled> {
        self.into_cancelled(cancel_code, false)
    }
}

impl SasState<Created> {
    /// Start a new flow towards the given device.
    pub fn new(ids: SasIds, flow_id: FlowId) -> Self {
        let sas = vodozemac::sas::Sas::new();
        let our_public_key = sas.public_key();

        Self {
            ids,
            verification_flow_id: Arc::new(flow_id),
            creation_time: Arc::new(Instant::now()),
            state: Created {
                sas: Arc::new(StdMutex::new(Some(sas))),
                our_public_key,
                protocols: Arc::new(SasV1Content::default()),
            },
        }
    }

    /// The start event that opens the flow on the wire.
    pub fn as_content(&self) -> StartContent {
        StartContent {
            from_device: self.ids.account.device_id.clone(),
            transaction_id: self.verification_flow_id.as_transaction_id().to_owned(),
            method: StartMethod::SasV1((*self.state.protocols).clone()),
        }
    }

    /// Receive the accept event of the other side, remembering their
    /// commitment.
    pub fn into_accepted(
        self,
        sender: &UserId,
        content: &AcceptContent,
    ) -> Result<SasState<Accepted>, SasState<Cancelled>> {
        if let Err(code) = self.check_event(sender, content.transaction_id.as_str()) {
            return Err(self.cancel(code));
        }

        let accepted_protocols = match AcceptedProtocols::from_accept_content(content) {
            Ok(protocols) => protocols,
            Err(code) => return Err(self.cancel(code)),
        };

        let start_content = Arc::new(self.as_content());

        Ok(SasState {
            ids: self.ids,
            verification_flow_id: self.verification_flow_id,
            creation_time: self.creation_time,
            state: Accepted {
                sas: self.state.sas,
                our_public_key: self.state.our_public_key,
                commitment: content.commitment.clone(),
                start_content,
                accepted_protocols: Arc::new(accepted_protocols),
            },
        })
    }
}

impl SasState<Started> {
    /// Accept a flow another device started with us.
    pub fn from_start_event(
        ids: SasIds,
        flow_id: FlowId,
        content: &StartContent,
    ) -> Result<Self, (SasState<Cancelled>, CancelCode)> {
        let make_cancelled = |code: CancelCode| {
            let state = SasState {
                ids: ids.clone(),
                verification_flow_id: Arc::new(flow_id.clone()),
                creation_time: Arc::new(Instant::now()),
                state: Cancelled { cancel_code: code.clone(), cancelled_by_us: true },
            };
            (state, code)
        };

        let StartMethod::SasV1(protocols) = &content.method else {
            return Err(make_cancelled(CancelCode::UnknownMethod));
        };

        let accepted_protocols = match AcceptedProtocols::from_start_content(protocols) {
            Ok(protocols) => protocols,
            Err(code) => return Err(make_cancelled(code)),
        };

        let sas = vodozemac::sas::Sas::new();
        let our_public_key = sas.public_key();

        let commitment = match calculate_commitment(our_public_key, content) {
            Ok(commitment) => commitment,
            Err(code) => return Err(make_cancelled(code)),
        };

        trace!(
            flow_id = flow_id.as_str(),
            commitment,
            "Calculated SAS commitment for an incoming start event"
        );

        Ok(Self {
            ids,
            verification_flow_id: Arc::new(flow_id),
            creation_time: Arc::new(Instant::now()),
            state: Started {
                sas: Arc::new(StdMutex::new(Some(sas))),
                our_public_key,
                commitment,
                accepted_protocols: Arc::new(accepted_protocols),
            },
        })
    }

    /// The accept event that commits us to our yet unrevealed public key.
    pub fn as_content(&self) -> AcceptContent {
        let protocols = &self.state.accepted_protocols;

        AcceptContent {
            transaction_id: self.verification_flow_id.as_transaction_id().to_owned(),
            method: "m.sas.v1".to_owned(),
            key_agreement_protocol: protocols.key_agreement_protocol.clone(),
            hash: protocols.hash.clone(),
            message_authentication_code: protocols.mac_method.as_str().to_owned(),
            short_authentication_string: protocols.short_auth_string.clone(),
            commitment: self.state.commitment.clone(),
        }
    }

    /// Receive the public key of the side that started the flow.
    pub fn into_key_received(
        self,
        sender: &UserId,
        content: &KeyContent,
    ) -> Result<SasState<KeyReceived>, SasState<Cancelled>> {
        if let Err(code) = self.check_event(sender, content.transaction_id.as_str()) {
            return Err(self.cancel(code));
        }

        let Ok(their_public_key) = Curve25519PublicKey::from_base64(&content.key) else {
            return Err(self.cancel(CancelCode::InvalidMessage));
        };

        let Some(sas) = self.state.sas.lock().expect("The SAS lock should never be poisoned").take()
        else {
            return Err(self.cancel(CancelCode::UnexpectedMessage));
        };

        let Ok(established) = sas.diffie_hellman(their_public_key) else {
            return Err(self.cancel(CancelCode::InvalidMessage));
        };

        let accepted_protocols = self.state.accepted_protocols.clone();

        Ok(SasState {
            ids: self.ids,
            verification_flow_id: self.verification_flow_id,
            creation_time: self.creation_time,
            state: KeyReceived {
                established: Arc::new(established),
                we_started: false,
                accepted_protocols,
            },
        })
    }
}

impl SasState<Accepted> {
    /// The key event revealing our public key.
    pub fn as_content(&self) -> KeyContent {
        KeyContent {
            transaction_id: self.verification_flow_id.as_transaction_id().to_owned(),
            key: self.state.our_public_key.to_base64(),
        }
    }

    /// Receive the public key of the accepting side, checking it against the
    /// commitment from the accept event.
    pub fn into_key_received(
        self,
        sender: &UserId,
        content: &KeyContent,
    ) -> Result<SasState<KeyReceived>, SasState<Cancelled>> {
        if let Err(code) = self.check_event(sender, content.transaction_id.as_str()) {
            return Err(self.cancel(code));
        }

        let Ok(their_public_key) = Curve25519PublicKey::from_base64(&content.key) else {
            return Err(self.cancel(CancelCode::InvalidMessage));
        };

        let commitment = match calculate_commitment(their_public_key, &self.state.start_content) {
            Ok(commitment) => commitment,
            Err(code) => return Err(self.cancel(code)),
        };

        if commitment != self.state.commitment {
            return Err(self.cancel(CancelCode::MismatchedCommitment));
        }

        let Some(sas) = self.state.sas.lock().expect("The SAS lock should never be poisoned").take()
        else {
            return Err(self.cancel(CancelCode::UnexpectedMessage));
        };

        let Ok(established) = sas.diffie_hellman(their_public_key) else {
            return Err(self.cancel(CancelCode::InvalidMessage));
        };

        let accepted_protocols = self.state.accepted_protocols.clone();

        Ok(SasState {
            ids: self.ids,
            verification_flow_id: self.verification_flow_id,
            creation_time: self.creation_time,
            state: KeyReceived {
                established: Arc::new(established),
                we_started: true,
                accepted_protocols,
            },
        })
    }
}

impl SasState<KeyReceived> {
    /// The key event revealing our public key; only the accepting side sends
    /// its key at this stage.
    pub fn as_content(&self) -> KeyContent {
        KeyContent {
            transaction_id: self.verification_flow_id.as_transaction_id().to_owned(),
            key: self.state.established.our_public_key().to_base64(),
        }
    }

    /// The emojis of the short auth string.
    pub fn get_emoji(&self) -> [Emoji; 7] {
        get_emoji(
            &self.state.established,
            &self.ids,
            self.verification_flow_id.as_str(),
            self.state.we_started,
        )
    }

    /// The raw emoji indices of the short auth string.
    pub fn get_emoji_index(&self) -> [u8; 7] {
        get_emoji_index(
            &self.state.established,
            &self.ids,
            self.verification_flow_id.as_str(),
            self.state.we_started,
        )
    }

    /// The decimal representation of the short auth string.
    pub fn get_decimal(&self) -> (u16, u16, u16) {
        get_decimal(
            &self.state.established,
            &self.ids,
            self.verification_flow_id.as_str(),
            self.state.we_started,
        )
    }

    /// The user confirmed that the short auth string matches, produce our
    /// MAC event.
    pub fn confirm(self) -> (SasState<Confirmed>, MacContent) {
        let content = get_mac_content(
            &self.state.established,
            &self.ids,
            &self.verification_flow_id,
            self.state.accepted_protocols.mac_method,
        );

        let state = SasState {
            ids: self.ids,
            verification_flow_id: self.verification_flow_id,
            creation_time: self.creation_time,
            state: Confirmed {
                established: self.state.established,
                accepted_protocols: self.state.accepted_protocols,
            },
        };

        (state, content)
    }

    /// The other side confirmed before our user did, verify their MAC and
    /// wait for the local confirmation.
    pub fn into_mac_received(
        self,
        sender: &UserId,
        content: &MacContent,
    ) -> Result<SasState<MacReceived>, SasState<Cancelled>> {
        if let Err(code) = self.check_event(sender, content.transaction_id.as_str()) {
            return Err(self.cancel(code));
        }

        let devices = match receive_mac_event(
            &self.state.established,
            &self.ids,
            self.verification_flow_id.as_str(),
            self.state.accepted_protocols.mac_method,
            content,
        ) {
            Ok(devices) => devices,
            Err(code) => return Err(self.cancel(code)),
        };

        Ok(SasState {
            ids: self.ids,
            verification_flow_id: self.verification_flow_id,
            creation_time: self.creation_time,
            state: MacReceived {
                established: self.state.established,
                we_started: self.state.we_started,
                verified_devices: Arc::new(devices),
                accepted_protocols: self.state.accepted_protocols,
            },
        })
    }
}

impl SasState<Confirmed> {
    /// Receive the MAC of the other side, completing the flow.
    pub fn into_done(
        self,
        sender: &UserId,
        content: &MacContent,
    ) -> Result<SasState<Done>, SasState<Cancelled>> {
        if let Err(code) = self.check_event(sender, content.transaction_id.as_str()) {
            return Err(self.cancel(code));
        }

        let devices = match receive_mac_event(
            &self.state.established,
            &self.ids,
            self.verification_flow_id.as_str(),
            self.state.accepted_protocols.mac_method,
            content,
        ) {
            Ok(devices) => devices,
            Err(code) => return Err(self.cancel(code)),
        };

        Ok(SasState {
            ids: self.ids,
            verification_flow_id: self.verification_flow_id,
            creation_time: self.creation_time,
            state: Done { verified_devices: Arc::new(devices) },
        })
    }
}

impl SasState<MacReceived> {
    /// The user confirmed that the short auth string matches, send out our
    /// MAC and complete the flow.
    pub fn confirm(self) -> (SasState<Done>, MacContent) {
        let content = get_mac_content(
            &self.state.established,
            &self.ids,
            &self.verification_flow_id,
            self.state.accepted_protocols.mac_method,
        );

        let state = SasState {
            ids: self.ids,
            verification_flow_id: self.verification_flow_id,
            creation_time: self.creation_time,
            state: Done { verified_devices: self.state.verified_devices },
        };

        (state, content)
    }

    /// The emojis of the short auth string.
    pub fn get_emoji(&self) -> [Emoji; 7] {
        get_emoji(
            &self.state.established,
            &self.ids,
            self.verification_flow_id.as_str(),
            self.state.we_started,
        )
    }

    /// The raw emoji indices of the short auth string.
    pub fn get_emoji_index(&self) -> [u8; 7] {
        get_emoji_index(
            &self.state.established,
            &self.ids,
            self.verification_flow_id.as_str(),
            self.state.we_started,
        )
    }

    /// The decimal representation of the short auth string.
    pub fn get_decimal(&self) -> (u16, u16, u16) {
        get_decimal(
            &self.state.established,
            &self.ids,
            self.verification_flow_id.as_str(),
            self.state.we_started,
        )
    }
}

impl SasState<Done> {
    /// The devices this flow successfully verified.
    pub fn verified_devices(&self) -> Arc<Vec<Device>> {
        self.state.verified_devices.clone()
    }
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, user_id, TransactionId};

    use super::*;
    use crate::olm::Account;

    async fn sas_pair() -> (SasState<Created>, SasState<Started>) {
        let alice = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        let bob = Account::new(user_id!("@bob:localhost"), device_id!("BOBDEVICE"));

        let alice_device = Device::from_account(&alice).await;
        let bob_device = Device::from_account(&bob).await;

        let flow_id: FlowId = TransactionId::new().into();

        let alice_ids =
            SasIds { account: alice.static_data().clone(), other_device: bob_device };
        let bob_ids = SasIds { account: bob.static_data().clone(), other_device: alice_device };

        let alice_sas = SasState::<Created>::new(alice_ids, flow_id.clone());
        let start_content = alice_sas.as_content();
        let bob_sas =
            SasState::<Started>::from_start_event(bob_ids, flow_id, &start_content).unwrap();

        (alice_sas, bob_sas)
    }

    #[tokio::test]
    async fn expired_flows_cancel_with_a_timeout() {
        let (mut alice, bob) = sas_pair().await;
        let bob_user = bob.ids.account.user_id.clone();

        alice.creation_time =
            Arc::new(Instant::now().checked_sub(MAX_AGE + Duration::from_secs(1)).unwrap());
        assert!(alice.timed_out());

        let accept = bob.as_content();
        let cancelled = alice.into_accepted(&bob_user, &accept).unwrap_err();

        assert_eq!(cancelled.state.cancel_code, CancelCode::Timeout);
        assert!(cancelled.state.cancelled_by_us);
    }

    #[tokio::test]
    async fn full_sas_flow() {
        let (alice, bob) = sas_pair().await;
        let alice_user = alice.ids.account.user_id.clone();
        let bob_user = bob.ids.account.user_id.clone();

        let accept = bob.as_content();
        let alice = alice.into_accepted(&bob_user, &accept).unwrap();

        let alice_key = alice.as_content();
        let bob = bob.into_key_received(&alice_user, &alice_key).unwrap();

        let bob_key = bob.as_content();
        let alice = alice.into_key_received(&bob_user, &bob_key).unwrap();

        assert_eq!(alice.get_emoji(), bob.get_emoji());
        assert_eq!(alice.get_decimal(), bob.get_decimal());

        let (alice, alice_mac) = alice.confirm();
        let bob = bob.into_mac_received(&alice_user, &alice_mac).unwrap();

        let (bob, bob_mac) = bob.confirm();
        let alice = alice.into_done(&bob_user, &bob_mac).unwrap();

        assert!(!alice.verified_devices().is_empty());
        assert!(!bob.verified_devices().is_empty());
    }

    #[tokio::test]
    async fn wrong_sender_cancels_the_flow() {
        let (alice, bob) = sas_pair().await;

        let accept = bob.as_content();
        let cancelled =
            alice.into_accepted(user_id!("@eve:localhost"), &accept).unwrap_err();

        assert_eq!(cancelled.state.cancel_code, CancelCode::UserMismatch);
        assert!(cancelled.state.cancelled_by_us);
    }

    #[tokio::test]
    async fn mismatched_commitment_cancels_the_flow() {
        let (alice, bob) = sas_pair().await;
        let alice_user = alice.ids.account.user_id.clone();
        let bob_user = bob.ids.account.user_id.clone();

        let mut accept = bob.as_content();
        accept.commitment = "invalid commitment".to_owned();

        let alice = alice.into_accepted(&bob_user, &accept).unwrap();
        let _ = bob.into_key_received(&alice_user, &alice.as_content()).unwrap();

        // Bob's real key doesn't match the tampered commitment.
        let bob_key = KeyContent {
            transaction_id: alice.verification_flow_id.as_transaction_id().to_owned(),
            key: vodozemac::sas::Sas::new().public_key().to_base64(),
        };

        let cancelled = alice.into_key_received(&bob_user, &bob_key).unwrap_err();
        assert_eq!(cancelled.state.cancel_code, CancelCode::MismatchedCommitment);
    }

    #[tokio::test]
    async fn tampered_mac_cancels_the_flow() {
        let (alice, bob) = sas_pair().await;
        let alice_user = alice.ids.account.user_id.clone();
        let bob_user = bob.ids.account.user_id.clone();

        let accept = bob.as_content();
        let alice = alice.into_accepted(&bob_user, &accept).unwrap();
        let bob = bob.into_key_received(&alice_user, &alice.as_content()).unwrap();
        let alice = alice.into_key_received(&bob_user, &bob.as_content()).unwrap();

        let (_, mut alice_mac) = alice.confirm();
        alice_mac.keys = "dGFtcGVyZWQ".to_owned();

        let cancelled = bob.into_mac_received(&alice_user, &alice_mac).unwrap_err();
        assert!(matches!(
            cancelled.state.cancel_code,
            CancelCode::KeyMismatch | CancelCode::InvalidMessage
        ));
    }

    #[tokio::test]
    async fn unsupported_methods_are_rejected() {
        let alice = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        let bob = Account::new(user_id!("@bob:localhost"), device_id!("BOBDEVICE"));
        let alice_device = Device::from_account(&alice).await;

        let flow_id: FlowId = TransactionId::new().into();
        let bob_ids = SasIds { account: bob.static_data().clone(), other_device: alice_device };

        let start_content = StartContent {
            from_device: device_id!("ALICEDEVICE").to_owned(),
            transaction_id: flow_id.as_transaction_id().to_owned(),
            method: StartMethod::SasV1(SasV1Content {
                key_agreement_protocols: vec!["curve25519".to_owned()],
                ..Default::default()
            }),
        };

        let (_, code) =
            SasState::<Started>::from_start_event(bob_ids, flow_id, &start_content).unwrap_err();
        assert_eq!(code, CancelCode::UnknownMethod);
    }
}
