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
    collections::BTreeMap,
    sync::{Arc, RwLock as StdRwLock},
};

use ruma::{OwnedUserId, TransactionId, UserId};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, trace, warn};

use super::{
    events::{
        AcceptContent, CancelContent, DoneContent, KeyContent, MacContent, ReadyContent,
        RequestContent, StartContent, StartMethod,
    },
    qrcode::{QrCodeData, QrVerification},
    requests::VerificationRequest,
    sas::Sas,
    CancelCode, FlowId, Verification,
};
use crate::{
    identities::{Device, DeviceChanges, LocalTrust},
    olm::StaticAccountData,
    store::{Changes, CryptoStoreError, DynCryptoStore},
    types::events::ToDeviceRequest,
};

/// The event types this machine handles.
const REQUEST: &str = "m.key.verification.request";
const READY: &str = "m.key.verification.ready";
const START: &str = "m.key.verification.start";
const ACCEPT: &str = "m.key.verification.accept";
const KEY: &str = "m.key.verification.key";
const MAC: &str = "m.key.verification.mac";
const DONE: &str = "m.key.verification.done";
const CANCEL: &str = "m.key.verification.cancel";

/// The object tracking all in-flight interactive verifications.
///
/// It receives `m.key.verification.*` to-device events, advances the
/// individual flows and queues up the answers that need to be sent out. When
/// a flow finishes the verified device is persisted with its trust state
/// upgraded.
#[derive(Clone, Debug)]
pub struct VerificationMachine {
    account: StaticAccountData,
    store: DynCryptoStore,
    requests: Arc<StdRwLock<BTreeMap<String, VerificationRequest>>>,
    verifications: Arc<StdRwLock<BTreeMap<String, Verification>>>,
    outgoing_messages: Arc<StdRwLock<Vec<ToDeviceRequest>>>,
}

impl VerificationMachine {
    pub(crate) fn new(account: StaticAccountData, store: DynCryptoStore) -> Self {
        Self {
            account,
            store,
            requests: Default::default(),
            verifications: Default::default(),
            outgoing_messages: Default::default(),
        }
    }

    /// Send a verification request to all the devices of the given user.
    pub fn request_verification(
        &self,
        other_user_id: &UserId,
        methods: Option<Vec<String>>,
    ) -> VerificationRequest {
        let flow_id: FlowId = TransactionId::new().into();

        let (request, content) = VerificationRequest::new(
            self.account.clone(),
            other_user_id.to_owned(),
            flow_id,
            methods,
        );

        self.queue_message(other_user_id.to_owned(), "*", REQUEST, &content);
        self.insert_request(request.clone());

        request
    }

    /// Start a short auth string flow with the given device directly,
    /// without the request negotiation phase.
    pub fn start_sas(&self, device: Device) -> Sas {
        let flow_id: FlowId = TransactionId::new().into();
        let (sas, content) = Sas::start(self.account.clone(), device, flow_id, false);

        self.queue_to_device(sas.other_device(), START, &content);
        self.insert_verification(sas.clone().into());

        sas
    }

    /// Display a QR code that the given device can scan to verify us.
    pub fn show_qr_code(&self, device: Device) -> Option<(QrVerification, QrCodeData)> {
        let flow_id: FlowId = TransactionId::new().into();
        let (verification, data) =
            QrVerification::new_show(self.account.clone(), device, flow_id)?;

        self.insert_verification(verification.clone().into());

        Some((verification, data))
    }

    /// We scanned a QR code of the given device, tell the other side.
    pub fn scan_qr_code(
        &self,
        device: Device,
        data: QrCodeData,
    ) -> Result<QrVerification, CancelCode> {
        let (verification, content) =
            QrVerification::from_scan(self.account.clone(), device, data)?;

        self.queue_to_device(verification.other_device(), START, &content);
        self.insert_verification(verification.clone().into());

        Ok(verification)
    }

    /// The verification request with the given flow id, if any.
    pub fn get_request(&self, flow_id: &str) -> Option<VerificationRequest> {
        self.read_requests().get(flow_id).cloned()
    }

    /// The in-flight verification with the given flow id, if any.
    pub fn get_verification(&self, flow_id: &str) -> Option<Verification> {
        self.read_verifications().get(flow_id).cloned()
    }

    /// Take all the messages that need to be sent out.
    pub fn outgoing_messages(&self) -> Vec<ToDeviceRequest> {
        std::mem::take(
            &mut *self
                .outgoing_messages
                .write()
                .expect("The verification outgoing queue lock should never be poisoned"),
        )
    }

    /// Cancel every flow that has been alive for too long.
    pub fn garbage_collect(&self) {
        for request in self.read_requests().values() {
            if request.timed_out() {
                if let Some(content) = request.cancel(CancelCode::Timeout) {
                    self.queue_message(
                        request.other_user_id().to_owned(),
                        "*",
                        CANCEL,
                        &content,
                    );
                }
            }
        }

        for verification in self.read_verifications().values() {
            if let Verification::SasV1(sas) = verification {
                if sas.timed_out() {
                    if let Some(content) = sas.cancel(CancelCode::Timeout) {
                        self.queue_to_device(sas.other_device(), CANCEL, &content);
                    }
                }
            }
        }

        self.requests
            .write()
            .expect("The verification requests lock should never be poisoned")
            .retain(|_, request| !request.is_cancelled() && !request.is_done());
        self.verifications
            .write()
            .expect("The verifications lock should never be poisoned")
            .retain(|_, verification| !verification.is_cancelled());
    }

    /// Handle an incoming `m.key.verification.*` to-device event.
    pub async fn receive_to_device_event(
        &self,
        sender: &UserId,
        event_type: &str,
        content: &Value,
    ) -> Result<(), CryptoStoreError> {
        macro_rules! deserialize {
            ($type:ty) => {
                match serde_json::from_value::<$type>(content.clone()) {
                    Ok(content) => content,
                    Err(error) => {
                        warn!(
                            %sender,
                            event_type,
                            %error,
                            "Failed to deserialize a verification event"
                        );
                        return Ok(());
                    }
                }
            };
        }

        match event_type {
            REQUEST => self.receive_request(sender, &deserialize!(RequestContent)),
            READY => self.receive_ready(sender, &deserialize!(ReadyContent)),
            START => self.receive_start(sender, &deserialize!(StartContent)).await?,
            ACCEPT => self.receive_accept(sender, &deserialize!(AcceptContent)),
            KEY => self.receive_key(sender, &deserialize!(KeyContent)),
            MAC => self.receive_mac(sender, &deserialize!(MacContent)).await?,
            DONE => self.receive_done(sender, &deserialize!(DoneContent)).await?,
            CANCEL => self.receive_cancel(sender, &deserialize!(CancelContent)),
            _ => {
                trace!(event_type, "Received an unknown verification event");
            }
        }

        Ok(())
    }

    fn receive_request(&self, sender: &UserId, content: &RequestContent) {
        let flow_id: FlowId = content.transaction_id.clone().into();

        let Some(request) = VerificationRequest::from_request_event(
            self.account.clone(),
            sender.to_owned(),
            flow_id,
            content,
        ) else {
            return;
        };

        info!(
            user_id = %sender,
            device_id = %content.from_device,
            flow_id = request.flow_id().as_str(),
            "Received a new verification request"
        );

        self.insert_request(request);
    }

    fn receive_ready(&self, sender: &UserId, content: &ReadyContent) {
        let Some(request) = self.get_request(content.transaction_id.as_str()) else {
            return;
        };

        if let Some(cancel) = request.receive_ready(sender, content) {
            self.queue_message(sender.to_owned(), "*", CANCEL, &cancel);
        }
    }

    async fn receive_start(
        &self,
        sender: &UserId,
        content: &StartContent,
    ) -> Result<(), CryptoStoreError> {
        let Some(device) = self.store.get_device(sender, &content.from_device).await? else {
            warn!(
                user_id = %sender,
                device_id = %content.from_device,
                "Received a verification start event from an unknown device"
            );
            return Ok(());
        };

        match &content.method {
            StartMethod::SasV1(_) => {
                let flow_id: FlowId = content.transaction_id.clone().into();

                match Sas::from_start_event(self.account.clone(), device, flow_id, content) {
                    Ok(sas) => {
                        if let Some(request) = self.get_request(content.transaction_id.as_str())
                        {
                            request.transition(sas.clone().into());
                        }

                        self.insert_verification(sas.into());
                    }
                    Err(cancel) => {
                        self.queue_message(
                            sender.to_owned(),
                            content.from_device.as_str(),
                            CANCEL,
                            &cancel,
                        );
                    }
                }
            }
            StartMethod::ReciprocateV1(_) => {
                if let Some(Verification::QrV1(qr)) =
                    self.get_verification(content.transaction_id.as_str())
                {
                    qr.receive_reciprocation(sender, content);

                    if let Some(request) = self.get_request(content.transaction_id.as_str()) {
                        request.transition(qr.into());
                    }
                }
            }
        }

        Ok(())
    }

    fn receive_accept(&self, sender: &UserId, content: &AcceptContent) {
        let Some(Verification::SasV1(sas)) =
            self.get_verification(content.transaction_id.as_str())
        else {
            return;
        };

        if let Some(key) = sas.receive_accept_event(sender, content) {
            self.queue_to_device(sas.other_device(), KEY, &key);
        } else {
            self.queue_cancel_if_cancelled(&sas);
        }
    }

    fn receive_key(&self, sender: &UserId, content: &KeyContent) {
        let Some(Verification::SasV1(sas)) =
            self.get_verification(content.transaction_id.as_str())
        else {
            return;
        };

        if let Some(key) = sas.receive_key_event(sender, content) {
            self.queue_to_device(sas.other_device(), KEY, &key);
        } else {
            self.queue_cancel_if_cancelled(&sas);
        }
    }

    async fn receive_mac(
        &self,
        sender: &UserId,
        content: &MacContent,
    ) -> Result<(), CryptoStoreError> {
        let Some(Verification::SasV1(sas)) =
            self.get_verification(content.transaction_id.as_str())
        else {
            return Ok(());
        };

        if let Some(done) = sas.receive_mac_event(sender, content) {
            self.queue_to_device(sas.other_device(), DONE, &done);
        } else {
            self.queue_cancel_if_cancelled(&sas);
        }

        self.mark_flow_devices_as_verified(&Verification::SasV1(sas)).await
    }

    async fn receive_done(
        &self,
        sender: &UserId,
        content: &DoneContent,
    ) -> Result<(), CryptoStoreError> {
        if let Some(verification) = self.get_verification(content.transaction_id.as_str()) {
            if let Verification::QrV1(qr) = &verification {
                if let Some(done) = qr.receive_done(sender, content) {
                    self.queue_to_device(qr.other_device(), DONE, &done);
                }
            }

            self.mark_flow_devices_as_verified(&verification).await?;
        }

        if let Some(request) = self.get_request(content.transaction_id.as_str()) {
            request.receive_done(sender, content);
        }

        Ok(())
    }

    fn receive_cancel(&self, sender: &UserId, content: &CancelContent) {
        if let Some(request) = self.get_request(content.transaction_id.as_str()) {
            request.receive_cancel(sender, content);
        }

        match self.get_verification(content.transaction_id.as_str()) {
            Some(Verification::SasV1(sas)) => sas.receive_cancel_event(sender, content),
            Some(Verification::QrV1(qr)) => qr.receive_cancel(sender, content),
            None => {}
        }
    }

    /// Upgrade the trust state of the devices a finished flow verified and
    /// persist them.
    async fn mark_flow_devices_as_verified(
        &self,
        verification: &Verification,
    ) -> Result<(), CryptoStoreError> {
        let devices = match verification {
            Verification::SasV1(sas) => sas.verified_devices(),
            Verification::QrV1(qr) => qr.verified_devices(),
        };

        let Some(devices) = devices else {
            return Ok(());
        };

        let mut changed = Vec::new();

        for device in devices {
            if !device.is_verified() {
                info!(
                    user_id = %device.user_id(),
                    device_id = %device.device_id(),
                    "Marking a device as verified after a successful verification"
                );

                device.set_trust_state(LocalTrust::Verified);
                changed.push(device);
            }
        }

        if !changed.is_empty() {
            let changes = Changes {
                devices: DeviceChanges { changed, ..Default::default() },
                ..Default::default()
            };

            self.store.save_changes(changes).await?;
        }

        if let Some(request) =
            self.get_request(verification.flow_id().as_str()).filter(|_| verification.is_done())
        {
            request.mark_as_done();
        }

        Ok(())
    }

    fn queue_cancel_if_cancelled(&self, sas: &Sas) {
        if let Some(info) = sas.cancel_info().filter(|info| info.cancelled_by_us()) {
            debug!(
                flow_id = sas.flow_id().as_str(),
                code = info.cancel_code().as_str(),
                "A SAS flow was cancelled while handling an event"
            );

            let content = CancelContent::new(
                sas.flow_id().as_transaction_id().to_owned(),
                info.cancel_code().clone(),
            );

            self.queue_to_device(sas.other_device(), CANCEL, &content);
        }
    }

    fn insert_request(&self, request: VerificationRequest) {
        self.requests
            .write()
            .expect("The verification requests lock should never be poisoned")
            .insert(request.flow_id().as_str().to_owned(), request);
    }

    fn insert_verification(&self, verification: Verification) {
        self.verifications
            .write()
            .expect("The verifications lock should never be poisoned")
            .insert(verification.flow_id().as_str().to_owned(), verification);
    }

    fn queue_to_device(&self, device: &Device, event_type: &str, content: &impl Serialize) {
        self.queue_message(
            device.user_id().to_owned(),
            device.device_id().as_str(),
            event_type,
            content,
        );
    }

    fn queue_message(
        &self,
        user_id: OwnedUserId,
        device_id: &str,
        event_type: &str,
        content: &impl Serialize,
    ) {
        let Ok(content) = serde_json::to_value(content) else {
            return;
        };

        let mut request = ToDeviceRequest::new(event_type);
        request
            .messages
            .entry(user_id)
            .or_default()
            .insert(device_id.into(), content);

        self.outgoing_messages
            .write()
            .expect("The verification outgoing queue lock should never be poisoned")
            .push(request);
    }

    fn read_requests(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, VerificationRequest>> {
        self.requests.read().expect("The verification requests lock should never be poisoned")
    }

    fn read_verifications(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Verification>> {
        self.verifications
            .read()
            .expect("The verifications lock should never be poisoned")
    }
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, user_id};

    use super::*;
    use crate::{
        olm::Account,
        store::{CryptoStore, MemoryStore},
    };

    async fn machine_pair() -> (VerificationMachine, VerificationMachine) {
        let alice = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        let bob = Account::new(user_id!("@bob:localhost"), device_id!("BOBDEVICE"));

        let alice_device = Device::from_account(&alice).await;
        let bob_device = Device::from_account(&bob).await;

        let alice_store = MemoryStore::new();
        let mut changes = Changes::default();
        changes.devices.new.push(bob_device);
        alice_store.save_changes(changes).await.unwrap();

        let bob_store = MemoryStore::new();
        let mut changes = Changes::default();
        changes.devices.new.push(alice_device);
        bob_store.save_changes(changes).await.unwrap();

        let alice_machine =
            VerificationMachine::new(alice.static_data().clone(), alice_store.into_dyn());
        let bob_machine =
            VerificationMachine::new(bob.static_data().clone(), bob_store.into_dyn());

        (alice_machine, bob_machine)
    }

    /// Deliver every queued message of `from` to `to`.
    async fn deliver(from: &VerificationMachine, to: &VerificationMachine) {
        for request in from.outgoing_messages() {
            for (_, messages) in &request.messages {
                for (_, content) in messages {
                    to.receive_to_device_event(
                        &from.account.user_id,
                        &request.event_type,
                        content,
                    )
                    .await
                    .unwrap();
                }
            }
        }
    }

    #[tokio::test]
    async fn full_interactive_verification() {
        let (alice, bob) = machine_pair().await;
        let bob_user = bob.account.user_id.clone();

        let alice_request = alice.request_verification(&bob_user, None);
        deliver(&alice, &bob).await;

        let bob_request = bob.get_request(alice_request.flow_id().as_str()).unwrap();
        let ready = bob_request.accept().unwrap();
        bob.queue_message(
            alice.account.user_id.clone(),
            alice.account.device_id.as_str(),
            READY,
            &ready,
        );
        deliver(&bob, &alice).await;

        let bob_device = alice
            .store
            .get_device(&bob.account.user_id, &bob.account.device_id)
            .await
            .unwrap()
            .unwrap();

        let (alice_sas, start) = alice_request.start_sas(bob_device).unwrap();
        alice.insert_verification(alice_sas.clone().into());
        alice.queue_to_device(alice_sas.other_device(), START, &start);
        deliver(&alice, &bob).await;

        let Some(Verification::SasV1(bob_sas)) =
            bob.get_verification(alice_sas.flow_id().as_str())
        else {
            panic!("Bob should have a SAS flow");
        };

        let accept = bob_sas.accept().unwrap();
        bob.queue_to_device(bob_sas.other_device(), ACCEPT, &accept);
        deliver(&bob, &alice).await;
        // Alice answered the accept with her key.
        deliver(&alice, &bob).await;
        // Bob revealed his own key in turn.
        deliver(&bob, &alice).await;

        assert_eq!(alice_sas.emoji(), bob_sas.emoji());

        let (alice_mac, _) = alice_sas.confirm();
        alice.queue_to_device(alice_sas.other_device(), MAC, &alice_mac.unwrap());
        deliver(&alice, &bob).await;

        let (bob_mac, _) = bob_sas.confirm();
        bob.queue_to_device(bob_sas.other_device(), MAC, &bob_mac.unwrap());
        deliver(&bob, &alice).await;
        // The done events cross over.
        deliver(&alice, &bob).await;
        deliver(&bob, &alice).await;

        assert!(alice_sas.is_done());
        assert!(bob_sas.is_done());

        let bob_device = alice
            .store
            .get_device(&bob.account.user_id, &bob.account.device_id)
            .await
            .unwrap()
            .unwrap();
        assert!(bob_device.is_verified());

        let alice_device = bob
            .store
            .get_device(&alice.account.user_id, &alice.account.device_id)
            .await
            .unwrap()
            .unwrap();
        assert!(alice_device.is_verified());
    }

    #[tokio::test]
    async fn qr_code_verification_through_the_machine() {
        let (alice, bob) = machine_pair().await;

        let bob_device = alice
            .store
            .get_device(&bob.account.user_id, &bob.account.device_id)
            .await
            .unwrap()
            .unwrap();
        let alice_device = bob
            .store
            .get_device(&alice.account.user_id, &alice.account.device_id)
            .await
            .unwrap()
            .unwrap();

        let (alice_qr, data) = alice.show_qr_code(bob_device).unwrap();
        let bob_qr = bob.scan_qr_code(alice_device, data).unwrap();
        deliver(&bob, &alice).await;

        let done = alice_qr.confirm_scanning().unwrap();
        alice.queue_to_device(alice_qr.other_device(), DONE, &done);
        deliver(&alice, &bob).await;
        deliver(&bob, &alice).await;

        assert!(alice_qr.is_done());
        assert!(bob_qr.is_done());
    }

    #[tokio::test]
    async fn unknown_devices_cant_start_flows() {
        let (alice, _) = machine_pair().await;

        let content = serde_json::json!({
            "from_device": "UNKNOWNDEVICE",
            "transaction_id": "abcdefg",
            "method": "m.sas.v1",
            "key_agreement_protocols": ["curve25519-hkdf-sha256"],
            "hashes": ["sha256"],
            "message_authentication_codes": ["hkdf-hmac-sha256.v2"],
            "short_authentication_string": ["emoji", "decimal"],
        });

        alice
            .receive_to_device_event(user_id!("@eve:localhost"), START, &content)
            .await
            .unwrap();

        assert!(alice.get_verification("abcdefg").is_none());
    }
}
