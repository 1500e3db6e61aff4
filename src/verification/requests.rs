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

use std::{
    sync::{Arc, Mutex as StdMutex},
    time::{Duration, Instant},
};

use ruma::{MilliSecondsSinceUnixEpoch, OwnedDeviceId, OwnedUserId, UserId};
use tracing::{debug, info, warn};

use super::{
    events::{CancelContent, DoneContent, ReadyContent, RequestContent, StartContent},
    sas::Sas,
    CancelCode, CancelInfo, FlowId, Verification,
};
use crate::{identities::Device, olm::StaticAccountData};

/// A verification request is no longer responded to after this much time has
/// passed.
const VERIFICATION_TIMEOUT: Duration = Duration::from_secs(60 * 10);

/// Incoming requests carrying a timestamp this far in the future are treated
/// as invalid.
const MAX_TIMESTAMP_SKEW: Duration = Duration::from_secs(60 * 5);

/// The verification methods this implementation can take part in.
pub const SUPPORTED_METHODS: &[&str] = &[
    "m.sas.v1",
    "m.qr_code.show.v1",
    "m.qr_code.scan.v1",
    "m.reciprocate.v1",
];

/// The negotiation phase that happens before a concrete verification flow
/// starts.
///
/// One side requests a verification advertising the methods it supports, the
/// other side answers with a ready event carrying its own methods, and only
/// then does one of them start a flow with a method both support.
#[derive(Clone, Debug)]
pub struct VerificationRequest {
    account: StaticAccountData,
    other_user_id: OwnedUserId,
    flow_id: Arc<FlowId>,
    we_started: bool,
    creation_time: Arc<Instant>,
    inner: Arc<StdMutex<InnerRequest>>,
}

#[derive(Clone, Debug)]
enum InnerRequest {
    /// We sent the request and are waiting for a ready event.
    Created { our_methods: Vec<String> },
    /// The other side sent us a request we haven't answered yet.
    Requested { their_methods: Vec<String>, other_device_id: OwnedDeviceId },
    /// Both sides agreed on the supported methods, a flow can start.
    Ready {
        their_methods: Vec<String>,
        our_methods: Vec<String>,
        other_device_id: OwnedDeviceId,
    },
    /// A concrete verification flow took over.
    Transitioned { verification: Verification },
    /// The verification finished successfully.
    Done,
    /// The request was cancelled.
    Cancelled(CancelInfo),
}

/// A snapshot of the current phase of a [`VerificationRequest`].
#[derive(Clone, Debug)]
pub enum VerificationRequestState {
    /// We sent the request and are waiting for a ready event.
    Created {
        /// The methods we advertised.
        our_methods: Vec<String>,
    },
    /// The other side sent us a request we haven't answered yet.
    Requested {
        /// The methods the other side supports.
        their_methods: Vec<String>,
        /// The device that sent the request.
        other_device_id: OwnedDeviceId,
    },
    /// Both sides agreed on the supported methods, a flow can start.
    Ready {
        /// The methods the other side supports.
        their_methods: Vec<String>,
        /// The methods we support.
        our_methods: Vec<String>,
        /// The device that answered or sent the request.
        other_device_id: OwnedDeviceId,
    },
    /// A concrete verification flow took over.
    Transitioned {
        /// The flow that is now in progress.
        verification: Verification,
    },
    /// The verification finished successfully.
    Done,
    /// The request was cancelled.
    Cancelled(CancelInfo),
}

impl VerificationRequest {
    /// Request a verification with the given user.
    ///
    /// Returns the request object and the request event that needs to be
    /// sent out.
    pub(crate) fn new(
        account: StaticAccountData,
        other_user_id: OwnedUserId,
        flow_id: FlowId,
        methods: Option<Vec<String>>,
    ) -> (VerificationRequest, RequestContent) {
        let our_methods =
            methods.unwrap_or_else(|| SUPPORTED_METHODS.iter().map(|m| m.to_string()).collect());

        let content = RequestContent {
            from_device: account.device_id.clone(),
            methods: our_methods.clone(),
            timestamp: MilliSecondsSinceUnixEpoch::now(),
            transaction_id: flow_id.as_transaction_id().to_owned(),
        };

        let request = Self {
            account,
            other_user_id,
            flow_id: Arc::new(flow_id),
            we_started: true,
            creation_time: Arc::new(Instant::now()),
            inner: Arc::new(StdMutex::new(InnerRequest::Created { our_methods })),
        };

        (request, content)
    }

    /// Create a request object out of a request event another device sent
    /// us.
    ///
    /// Returns `None` if the timestamp of the event is outside the window in
    /// which we answer requests.
    pub(crate) fn from_request_event(
        account: StaticAccountData,
        sender: OwnedUserId,
        flow_id: FlowId,
        content: &RequestContent,
    ) -> Option<VerificationRequest> {
        if !Self::is_timestamp_valid(content.timestamp) {
            debug!(
                user_id = %sender,
                flow_id = flow_id.as_str(),
                timestamp = ?content.timestamp,
                "Ignoring a verification request with an out of range timestamp"
            );
            return None;
        }

        Some(Self {
            account,
            other_user_id: sender,
            flow_id: Arc::new(flow_id),
            we_started: false,
            creation_time: Arc::new(Instant::now()),
            inner: Arc::new(StdMutex::new(InnerRequest::Requested {
                their_methods: content.methods.clone(),
                other_device_id: content.from_device.clone(),
            })),
        })
    }

    fn is_timestamp_valid(timestamp: MilliSecondsSinceUnixEpoch) -> bool {
        let now = MilliSecondsSinceUnixEpoch::now();

        let age_valid = now
            .to_system_time()
            .zip(timestamp.to_system_time())
            .and_then(|(now, then)| now.duration_since(then).ok())
            .map_or(true, |age| age <= VERIFICATION_TIMEOUT);

        let skew_valid = timestamp
            .to_system_time()
            .zip(now.to_system_time())
            .and_then(|(then, now)| then.duration_since(now).ok())
            .map_or(true, |skew| skew <= MAX_TIMESTAMP_SKEW);

        age_valid && skew_valid
    }

    /// The id tying all the events of this verification together.
    pub fn flow_id(&self) -> &FlowId {
        &self.flow_id
    }

    /// The user we're verifying with.
    pub fn other_user_id(&self) -> &UserId {
        &self.other_user_id
    }

    /// Did we send the request.
    pub fn we_started(&self) -> bool {
        self.we_started
    }

    /// Has the request been alive for too long.
    pub fn timed_out(&self) -> bool {
        self.creation_time.elapsed() > VERIFICATION_TIMEOUT
    }

    /// The current phase of the request.
    pub fn state(&self) -> VerificationRequestState {
        match &*self.lock() {
            InnerRequest::Created { our_methods } => {
                VerificationRequestState::Created { our_methods: our_methods.clone() }
            }
            InnerRequest::Requested { their_methods, other_device_id } => {
                VerificationRequestState::Requested {
                    their_methods: their_methods.clone(),
                    other_device_id: other_device_id.clone(),
                }
            }
            InnerRequest::Ready { their_methods, our_methods, other_device_id } => {
                VerificationRequestState::Ready {
                    their_methods: their_methods.clone(),
                    our_methods: our_methods.clone(),
                    other_device_id: other_device_id.clone(),
                }
            }
            InnerRequest::Transitioned { verification } => {
                VerificationRequestState::Transitioned { verification: verification.clone() }
            }
            InnerRequest::Done => VerificationRequestState::Done,
            InnerRequest::Cancelled(info) => VerificationRequestState::Cancelled(info.clone()),
        }
    }

    /// Did the verification finish successfully.
    pub fn is_done(&self) -> bool {
        matches!(&*self.lock(), InnerRequest::Done)
    }

    /// Was the request cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(&*self.lock(), InnerRequest::Cancelled(_))
    }

    /// Why and by whom was the request cancelled, if it was.
    pub fn cancel_info(&self) -> Option<CancelInfo> {
        match &*self.lock() {
            InnerRequest::Cancelled(info) => Some(info.clone()),
            _ => None,
        }
    }

    /// Accept a request the other side sent us.
    ///
    /// Returns the ready event announcing the methods we support, or `None`
    /// if the request isn't waiting to be accepted or no common method
    /// exists.
    pub fn accept(&self) -> Option<ReadyContent> {
        let mut guard = self.lock();

        let InnerRequest::Requested { their_methods, other_device_id } = guard.clone() else {
            return None;
        };

        let our_methods: Vec<String> = SUPPORTED_METHODS
            .iter()
            .filter(|method| their_methods.iter().any(|theirs| theirs == *method))
            .map(|method| method.to_string())
            .collect();

        if our_methods.is_empty() {
            warn!(
                user_id = %self.other_user_id,
                flow_id = self.flow_id.as_str(),
                "Can't accept a verification request, no common methods found"
            );
            *guard = InnerRequest::Cancelled(CancelInfo::new(CancelCode::UnknownMethod, true));
            return None;
        }

        let content = ReadyContent {
            from_device: self.account.device_id.clone(),
            methods: our_methods.clone(),
            transaction_id: self.flow_id.as_transaction_id().to_owned(),
        };

        *guard = InnerRequest::Ready { their_methods, our_methods, other_device_id };

        Some(content)
    }

    /// The other side answered our request with the methods it supports.
    ///
    /// Returns the cancellation event if no common method exists.
    pub(crate) fn receive_ready(
        &self,
        sender: &UserId,
        content: &ReadyContent,
    ) -> Option<CancelContent> {
        if sender != self.other_user_id
            || content.transaction_id != *self.flow_id.as_transaction_id()
        {
            return None;
        }

        let mut guard = self.lock();

        let InnerRequest::Created { our_methods } = guard.clone() else {
            return None;
        };

        let common: Vec<String> = our_methods
            .iter()
            .filter(|method| content.methods.contains(method))
            .cloned()
            .collect();

        if common.is_empty() {
            *guard = InnerRequest::Cancelled(CancelInfo::new(CancelCode::UnknownMethod, true));
            return Some(CancelContent::new(
                self.flow_id.as_transaction_id().to_owned(),
                CancelCode::UnknownMethod,
            ));
        }

        info!(
            user_id = %sender,
            device_id = %content.from_device,
            flow_id = self.flow_id.as_str(),
            "The verification request is ready to transition into a flow"
        );

        *guard = InnerRequest::Ready {
            their_methods: content.methods.clone(),
            our_methods,
            other_device_id: content.from_device.clone(),
        };

        None
    }

    /// Start a short auth string flow with the device that answered the
    /// request.
    ///
    /// Returns the flow object and the start event that needs to be sent
    /// out, or `None` if the request isn't ready or SAS isn't a common
    /// method.
    pub fn start_sas(&self, other_device: Device) -> Option<(Sas, StartContent)> {
        let mut guard = self.lock();

        let InnerRequest::Ready { their_methods, our_methods, other_device_id } = &*guard else {
            return None;
        };

        if other_device.device_id() != &**other_device_id
            || !their_methods.iter().any(|method| method == "m.sas.v1")
            || !our_methods.iter().any(|method| method == "m.sas.v1")
        {
            return None;
        }

        let (sas, content) = Sas::start(
            self.account.clone(),
            other_device,
            (*self.flow_id).clone(),
            true,
        );

        *guard = InnerRequest::Transitioned { verification: sas.clone().into() };

        Some((sas, content))
    }

    /// A flow started by the other side is taking over this request.
    pub(crate) fn transition(&self, verification: Verification) {
        let mut guard = self.lock();

        if matches!(&*guard, InnerRequest::Ready { .. } | InnerRequest::Requested { .. }) {
            *guard = InnerRequest::Transitioned { verification };
        }
    }

    /// The flow that took over this request, if any.
    pub fn verification(&self) -> Option<Verification> {
        match &*self.lock() {
            InnerRequest::Transitioned { verification } => Some(verification.clone()),
            _ => None,
        }
    }

    /// The flow this request transitioned into finished successfully.
    pub(crate) fn receive_done(&self, sender: &UserId, content: &DoneContent) {
        if sender != self.other_user_id
            || content.transaction_id != *self.flow_id.as_transaction_id()
        {
            return;
        }

        let mut guard = self.lock();

        if let InnerRequest::Transitioned { verification } = &*guard {
            if verification.is_done() {
                *guard = InnerRequest::Done;
            }
        }
    }

    /// Mark the request as done after the flow it transitioned into
    /// finished.
    pub(crate) fn mark_as_done(&self) {
        let mut guard = self.lock();

        if matches!(&*guard, InnerRequest::Transitioned { .. }) {
            *guard = InnerRequest::Done;
        }
    }

    /// Cancel the request, returning the cancellation event that needs to be
    /// sent out, unless the request already ended.
    pub fn cancel(&self, code: CancelCode) -> Option<CancelContent> {
        let mut guard = self.lock();

        match &*guard {
            InnerRequest::Done | InnerRequest::Cancelled(_) => None,
            _ => {
                *guard = InnerRequest::Cancelled(CancelInfo::new(code.clone(), true));
                Some(CancelContent::new(self.flow_id.as_transaction_id().to_owned(), code))
            }
        }
    }

    /// The other side cancelled the request.
    pub(crate) fn receive_cancel(&self, sender: &UserId, content: &CancelContent) {
        if sender != self.other_user_id
            || content.transaction_id != *self.flow_id.as_transaction_id()
        {
            return;
        }

        let mut guard = self.lock();

        if !matches!(&*guard, InnerRequest::Done | InnerRequest::Cancelled(_)) {
            *guard = InnerRequest::Cancelled(CancelInfo::new(content.code.clone(), false));
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, InnerRequest> {
        self.inner.lock().expect("The verification request lock should never be poisoned")
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use ruma::{device_id, user_id, TransactionId};

    use super::*;
    use crate::olm::Account;

    fn request_pair() -> (VerificationRequest, VerificationRequest) {
        let alice = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        let bob = Account::new(user_id!("@bob:localhost"), device_id!("BOBDEVICE"));

        let flow_id: FlowId = TransactionId::new().into();

        let (alice_request, content) = VerificationRequest::new(
            alice.static_data().clone(),
            bob.static_data().user_id.clone(),
            flow_id.clone(),
            None,
        );

        let bob_request = VerificationRequest::from_request_event(
            bob.static_data().clone(),
            alice.static_data().user_id.clone(),
            flow_id,
            &content,
        )
        .unwrap();

        (alice_request, bob_request)
    }

    #[tokio::test]
    async fn request_negotiation_reaches_the_ready_state() {
        let (alice, bob) = request_pair();

        assert_matches!(alice.state(), VerificationRequestState::Created { .. });
        assert_matches!(bob.state(), VerificationRequestState::Requested { .. });

        let ready = bob.accept().unwrap();
        assert!(alice.receive_ready(bob.account.user_id.as_ref(), &ready).is_none());

        assert_matches!(alice.state(), VerificationRequestState::Ready { .. });
        assert_matches!(bob.state(), VerificationRequestState::Ready { .. });
    }

    #[tokio::test]
    async fn sas_flow_can_take_over_a_ready_request() {
        let (alice, bob) = request_pair();

        let ready = bob.accept().unwrap();
        alice.receive_ready(bob.account.user_id.as_ref(), &ready);

        let bob_account = Account::new(user_id!("@bob:localhost"), device_id!("BOBDEVICE"));
        let bob_device = Device::from_account(&bob_account).await;

        let (sas, _start) = alice.start_sas(bob_device).unwrap();
        assert_eq!(sas.flow_id(), alice.flow_id());
        assert_matches!(alice.state(), VerificationRequestState::Transitioned { .. });
    }

    #[tokio::test]
    async fn no_common_methods_cancels_the_request() {
        let alice = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        let bob = Account::new(user_id!("@bob:localhost"), device_id!("BOBDEVICE"));

        let flow_id: FlowId = TransactionId::new().into();

        let (alice_request, mut content) = VerificationRequest::new(
            alice.static_data().clone(),
            bob.static_data().user_id.clone(),
            flow_id.clone(),
            Some(vec!["m.sas.v1".to_owned()]),
        );

        content.methods = vec!["io.example.custom.v0".to_owned()];

        let bob_request = VerificationRequest::from_request_event(
            bob.static_data().clone(),
            alice.static_data().user_id.clone(),
            flow_id,
            &content,
        )
        .unwrap();

        assert!(bob_request.accept().is_none());
        assert!(bob_request.is_cancelled());
        assert_eq!(
            bob_request.cancel_info().unwrap().cancel_code(),
            &CancelCode::UnknownMethod
        );

        let ready = ReadyContent {
            from_device: bob.static_data().device_id.clone(),
            methods: vec!["io.example.custom.v0".to_owned()],
            transaction_id: alice_request.flow_id().as_transaction_id().to_owned(),
        };

        let cancel = alice_request
            .receive_ready(bob.static_data().user_id.as_ref(), &ready)
            .unwrap();
        assert_eq!(cancel.code, CancelCode::UnknownMethod);
        assert!(alice_request.is_cancelled());
    }

    #[tokio::test]
    async fn stale_requests_are_ignored() {
        let alice = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        let bob = Account::new(user_id!("@bob:localhost"), device_id!("BOBDEVICE"));

        let flow_id: FlowId = TransactionId::new().into();

        let (_, mut content) = VerificationRequest::new(
            alice.static_data().clone(),
            bob.static_data().user_id.clone(),
            flow_id.clone(),
            None,
        );

        content.timestamp = MilliSecondsSinceUnixEpoch(ruma::UInt::from(1_000u32));

        assert!(VerificationRequest::from_request_event(
            bob.static_data().clone(),
            alice.static_data().user_id.clone(),
            flow_id,
            &content,
        )
        .is_none());
    }
}
