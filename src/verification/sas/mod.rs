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

mod helpers;
mod sas_state;

use std::sync::{Arc, Mutex as StdMutex};

use ruma::UserId;
use tracing::{info, trace};

use self::helpers::SasIds;
use self::sas_state::{
    Accepted, Cancelled, Confirmed, Created, Done, KeyReceived, MacReceived, SasState as State,
    Started,
};
use super::{
    events::{AcceptContent, CancelContent, DoneContent, KeyContent, MacContent, StartContent},
    CancelCode, CancelInfo, Emoji, FlowId,
};
use crate::{identities::Device, olm::StaticAccountData};

/// All the states a SAS flow can be in, without the type parameter, so the
/// flow can live behind a single lock and be inspected at runtime.
#[derive(Clone, Debug)]
enum InnerSas {
    Created(State<Created>),
    Started(State<Started>),
    Accepted(State<Accepted>),
    KeyReceived(State<KeyReceived>),
    Confirmed(State<Confirmed>),
    MacReceived(State<MacReceived>),
    Done(State<Done>),
    Cancelled(State<Cancelled>),
}

/// A short auth string verification flow with another device.
#[derive(Clone, Debug)]
pub struct Sas {
    inner: Arc<StdMutex<InnerSas>>,
    account: StaticAccountData,
    other_device: Device,
    flow_id: Arc<FlowId>,
    we_started: bool,
}

/// A snapshot of the current phase of a [`Sas`] flow.
#[derive(Clone, Debug)]
pub enum SasState {
    /// We started the flow and are waiting for the other side to accept.
    Created,
    /// The other side started the flow and we haven't accepted yet.
    Started,
    /// The flow was accepted, the public keys are being exchanged.
    Accepted,
    /// Both keys were exchanged, the short auth string can be presented.
    KeysExchanged {
        /// The emoji representation of the short auth string.
        emojis: [Emoji; 7],
        /// The decimal representation of the short auth string.
        decimals: (u16, u16, u16),
    },
    /// The local user confirmed, we're waiting for the other side.
    Confirmed,
    /// The flow completed and the device was marked as verified.
    Done {
        /// The devices the flow verified.
        verified_devices: Vec<Device>,
    },
    /// The flow was cancelled.
    Cancelled(CancelInfo),
}

impl Sas {
    /// Start a new SAS flow towards the given device.
    ///
    /// Returns the flow object and the start event that needs to be sent to
    /// the other device.
    pub(crate) fn start(
        account: StaticAccountData,
        other_device: Device,
        flow_id: FlowId,
        we_started_from_request: bool,
    ) -> (Sas, StartContent) {
        let ids = SasIds { account: account.clone(), other_device: other_device.clone() };
        let state = State::<Created>::new(ids, flow_id);
        let content = state.as_content();
        let flow_id = state.verification_flow_id.clone();

        trace!(
            user_id = %other_device.user_id(),
            device_id = %other_device.device_id(),
            flow_id = flow_id.as_str(),
            from_request = we_started_from_request,
            "Starting a new SAS verification flow"
        );

        let sas = Sas {
            inner: Arc::new(StdMutex::new(InnerSas::Created(state))),
            account,
            other_device,
            flow_id,
            we_started: true,
        };

        (sas, content)
    }

    /// Create a flow from a start event another device sent us.
    pub(crate) fn from_start_event(
        account: StaticAccountData,
        other_device: Device,
        flow_id: FlowId,
        content: &StartContent,
    ) -> Result<Sas, CancelContent> {
        let ids = SasIds { account: account.clone(), other_device: other_device.clone() };

        let state = match State::<Started>::from_start_event(ids, flow_id, content) {
            Ok(state) => state,
            Err((_, code)) => {
                return Err(CancelContent::new(content.transaction_id.clone(), code))
            }
        };

        let flow_id = state.verification_flow_id.clone();

        Ok(Sas {
            inner: Arc::new(StdMutex::new(InnerSas::Started(state))),
            account,
            other_device,
            flow_id,
            we_started: false,
        })
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

    /// Did we start this flow.
    pub fn we_started(&self) -> bool {
        self.we_started
    }

    /// The current phase of the flow.
    pub fn state(&self) -> SasState {
        match &*self.lock() {
            InnerSas::Created(_) => SasState::Created,
            InnerSas::Started(_) => SasState::Started,
            InnerSas::Accepted(_) => SasState::Accepted,
            InnerSas::KeyReceived(state) => SasState::KeysExchanged {
                emojis: state.get_emoji(),
                decimals: state.get_decimal(),
            },
            InnerSas::MacReceived(state) => SasState::KeysExchanged {
                emojis: state.get_emoji(),
                decimals: state.get_decimal(),
            },
            InnerSas::Confirmed(_) => SasState::Confirmed,
            InnerSas::Done(state) => {
                SasState::Done { verified_devices: state.verified_devices().to_vec() }
            }
            InnerSas::Cancelled(state) => SasState::Cancelled(CancelInfo::new(
                state.state.cancel_code.clone(),
                state.state.cancelled_by_us,
            )),
        }
    }

    /// Accept a flow the other side started.
    ///
    /// Returns the accept event if the flow is in a state where accepting
    /// makes sense.
    pub fn accept(&self) -> Option<AcceptContent> {
        match &*self.lock() {
            InnerSas::Started(state) => Some(state.as_content()),
            _ => None,
        }
    }

    /// The other side accepted our start event, reveal our public key.
    pub(crate) fn receive_accept_event(
        &self,
        sender: &UserId,
        content: &AcceptContent,
    ) -> Option<KeyContent> {
        let mut guard = self.lock();

        let InnerSas::Created(state) = guard.clone() else {
            return None;
        };

        match state.into_accepted(sender, content) {
            Ok(state) => {
                let key = state.as_content();
                *guard = InnerSas::Accepted(state);
                Some(key)
            }
            Err(state) => {
                *guard = InnerSas::Cancelled(state);
                None
            }
        }
    }

    /// Receive the public key of the other side.
    ///
    /// If we're the accepting side this also produces our own key event,
    /// which must only be revealed now that their key arrived.
    pub(crate) fn receive_key_event(
        &self,
        sender: &UserId,
        content: &KeyContent,
    ) -> Option<KeyContent> {
        let mut guard = self.lock();

        match guard.clone() {
            InnerSas::Accepted(state) => match state.into_key_received(sender, content) {
                Ok(state) => {
                    *guard = InnerSas::KeyReceived(state);
                    None
                }
                Err(state) => {
                    *guard = InnerSas::Cancelled(state);
                    None
                }
            },
            InnerSas::Started(state) => match state.into_key_received(sender, content) {
                Ok(state) => {
                    let key = state.as_content();
                    *guard = InnerSas::KeyReceived(state);
                    Some(key)
                }
                Err(state) => {
                    *guard = InnerSas::Cancelled(state);
                    None
                }
            },
            _ => None,
        }
    }

    /// Receive the MAC event of the other side.
    ///
    /// If our user already confirmed, this completes the flow and produces
    /// the done event.
    pub(crate) fn receive_mac_event(
        &self,
        sender: &UserId,
        content: &MacContent,
    ) -> Option<DoneContent> {
        let mut guard = self.lock();

        match guard.clone() {
            InnerSas::KeyReceived(state) => match state.into_mac_received(sender, content) {
                Ok(state) => {
                    *guard = InnerSas::MacReceived(state);
                    None
                }
                Err(state) => {
                    *guard = InnerSas::Cancelled(state);
                    None
                }
            },
            InnerSas::Confirmed(state) => match state.into_done(sender, content) {
                Ok(state) => {
                    info!(
                        user_id = %self.other_device.user_id(),
                        device_id = %self.other_device.device_id(),
                        flow_id = self.flow_id.as_str(),
                        "The SAS verification flow finished successfully"
                    );

                    *guard = InnerSas::Done(state);
                    Some(DoneContent {
                        transaction_id: self.flow_id.as_transaction_id().to_owned(),
                    })
                }
                Err(state) => {
                    *guard = InnerSas::Cancelled(state);
                    None
                }
            },
            _ => None,
        }
    }

    /// The local user confirmed that the short auth string matches.
    ///
    /// Returns our MAC event and, if the other side already confirmed, the
    /// done event.
    pub fn confirm(&self) -> (Option<MacContent>, Option<DoneContent>) {
        let mut guard = self.lock();

        match guard.clone() {
            InnerSas::KeyReceived(state) => {
                let (state, mac) = state.confirm();
                *guard = InnerSas::Confirmed(state);
                (Some(mac), None)
            }
            InnerSas::MacReceived(state) => {
                let (state, mac) = state.confirm();
                *guard = InnerSas::Done(state);
                (
                    Some(mac),
                    Some(DoneContent {
                        transaction_id: self.flow_id.as_transaction_id().to_owned(),
                    }),
                )
            }
            _ => (None, None),
        }
    }

    /// Cancel the flow, returning the cancellation event that needs to be
    /// sent out, unless the flow already ended.
    pub fn cancel(&self, code: CancelCode) -> Option<CancelContent> {
        let mut guard = self.lock();

        let inner = guard.clone();

        let cancelled = match inner {
            InnerSas::Created(state) => state.cancel(code.clone()),
            InnerSas::Started(state) => state.cancel(code.clone()),
            InnerSas::Accepted(state) => state.cancel(code.clone()),
            InnerSas::KeyReceived(state) => state.cancel(code.clone()),
            InnerSas::Confirmed(state) => state.cancel(code.clone()),
            InnerSas::MacReceived(state) => state.cancel(code.clone()),
            InnerSas::Done(_) | InnerSas::Cancelled(_) => return None,
        };

        *guard = InnerSas::Cancelled(cancelled);

        Some(CancelContent::new(self.flow_id.as_transaction_id().to_owned(), code))
    }

    /// The other side cancelled the flow.
    pub(crate) fn receive_cancel_event(&self, sender: &UserId, content: &CancelContent) {
        if sender != self.other_device.user_id()
            || content.transaction_id != *self.flow_id.as_transaction_id()
        {
            return;
        }

        let mut guard = self.lock();

        let cancelled = match guard.clone() {
            InnerSas::Created(state) => state.cancelled_by_them(content.code.clone()),
            InnerSas::Started(state) => state.cancelled_by_them(content.code.clone()),
            InnerSas::Accepted(state) => state.cancelled_by_them(content.code.clone()),
            InnerSas::KeyReceived(state) => state.cancelled_by_them(content.code.clone()),
            InnerSas::Confirmed(state) => state.cancelled_by_them(content.code.clone()),
            InnerSas::MacReceived(state) => state.cancelled_by_them(content.code.clone()),
            InnerSas::Done(_) | InnerSas::Cancelled(_) => return,
        };

        *guard = InnerSas::Cancelled(cancelled);
    }

    /// The emojis of the short auth string, if the keys were exchanged.
    pub fn emoji(&self) -> Option<[Emoji; 7]> {
        match &*self.lock() {
            InnerSas::KeyReceived(state) => Some(state.get_emoji()),
            InnerSas::MacReceived(state) => Some(state.get_emoji()),
            _ => None,
        }
    }

    /// The decimal triple of the short auth string, if the keys were
    /// exchanged.
    pub fn decimals(&self) -> Option<(u16, u16, u16)> {
        match &*self.lock() {
            InnerSas::KeyReceived(state) => Some(state.get_decimal()),
            InnerSas::MacReceived(state) => Some(state.get_decimal()),
            _ => None,
        }
    }

    /// Did the flow complete successfully.
    pub fn is_done(&self) -> bool {
        matches!(&*self.lock(), InnerSas::Done(_))
    }

    /// Was the flow cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(&*self.lock(), InnerSas::Cancelled(_))
    }

    /// Why and by whom was the flow cancelled, if it was.
    pub fn cancel_info(&self) -> Option<CancelInfo> {
        match &*self.lock() {
            InnerSas::Cancelled(state) => Some(CancelInfo::new(
                state.state.cancel_code.clone(),
                state.state.cancelled_by_us,
            )),
            _ => None,
        }
    }

    /// The devices the completed flow verified.
    pub fn verified_devices(&self) -> Option<Vec<Device>> {
        match &*self.lock() {
            InnerSas::Done(state) => Some(state.verified_devices().to_vec()),
            _ => None,
        }
    }

    /// Has the flow been alive for too long.
    pub fn timed_out(&self) -> bool {
        match &*self.lock() {
            InnerSas::Created(state) => state.timed_out(),
            InnerSas::Started(state) => state.timed_out(),
            InnerSas::Accepted(state) => state.timed_out(),
            InnerSas::KeyReceived(state) => state.timed_out(),
            InnerSas::Confirmed(state) => state.timed_out(),
            InnerSas::MacReceived(state) => state.timed_out(),
            InnerSas::Done(_) | InnerSas::Cancelled(_) => false,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, InnerSas> {
        self.inner.lock().expect("The SAS state lock should never be poisoned")
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use ruma::{device_id, user_id, TransactionId};

    use super::*;
    use crate::olm::Account;

    async fn sas_pair() -> (Sas, Sas) {
        let alice = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        let bob = Account::new(user_id!("@bob:localhost"), device_id!("BOBDEVICE"));

        let alice_device = Device::from_account(&alice).await;
        let bob_device = Device::from_account(&bob).await;

        let flow_id: FlowId = TransactionId::new().into();

        let (alice_sas, start) =
            Sas::start(alice.static_data().clone(), bob_device, flow_id.clone(), false);
        let bob_sas =
            Sas::from_start_event(bob.static_data().clone(), alice_device, flow_id, &start)
                .unwrap();

        (alice_sas, bob_sas)
    }

    #[tokio::test]
    async fn full_flow_over_the_public_object() {
        let (alice, bob) = sas_pair().await;
        let alice_user = alice.user_id().to_owned();
        let bob_user = bob.user_id().to_owned();

        let accept = bob.accept().unwrap();
        let alice_key = alice.receive_accept_event(&bob_user, &accept).unwrap();
        let bob_key = bob.receive_key_event(&alice_user, &alice_key).unwrap();
        assert!(alice.receive_key_event(&bob_user, &bob_key).is_none());

        assert_eq!(alice.emoji(), bob.emoji());
        assert_eq!(alice.decimals(), bob.decimals());

        let (alice_mac, done) = alice.confirm();
        let alice_mac = alice_mac.unwrap();
        assert!(done.is_none());

        assert!(bob.receive_mac_event(&alice_user, &alice_mac).is_none());
        let (bob_mac, bob_done) = bob.confirm();
        assert!(bob_done.is_some());

        let alice_done = alice.receive_mac_event(&bob_user, &bob_mac.unwrap());
        assert!(alice_done.is_some());

        assert!(alice.is_done());
        assert!(bob.is_done());
        assert!(!alice.verified_devices().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancelling_is_propagated_to_the_state() {
        let (alice, bob) = sas_pair().await;

        let content = alice.cancel(CancelCode::User).unwrap();
        assert!(alice.is_cancelled());
        assert!(alice.cancel_info().unwrap().cancelled_by_us());

        bob.receive_cancel_event(alice.user_id(), &content);
        assert!(bob.is_cancelled());
        assert!(!bob.cancel_info().unwrap().cancelled_by_us());

        // A cancelled flow can't be cancelled again.
        assert!(alice.cancel(CancelCode::User).is_none());
    }

    #[tokio::test]
    async fn accepting_twice_is_a_no_op() {
        let (alice, bob) = sas_pair().await;
        let bob_user = bob.user_id().to_owned();

        let accept = bob.accept().unwrap();
        let _ = alice.receive_accept_event(&bob_user, &accept).unwrap();

        assert_matches!(alice.state(), SasState::Accepted);
        assert!(alice.accept().is_none());
    }
}
