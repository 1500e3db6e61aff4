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

//! Device records of other devices and the local trust we assign to them.

use std::sync::{Arc, RwLock as StdRwLock};

use ruma::{DeviceId, MilliSecondsSinceUnixEpoch, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey};

use crate::{
    error::SignatureError,
    types::{verify_signed_json, DeviceKeys, EventEncryptionAlgorithm, SignedKey},
};

/// The local verification state of a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalTrust {
    /// The device was manually verified, e.g. via interactive verification.
    Verified,
    /// The device is blocked, no room keys may be shared with it.
    BlackListed,
    /// The device is explicitly accepted without verification.
    Ignored,
    /// No trust decision was made yet.
    Unset,
}

/// A device belonging to some user, together with the local trust decision we
/// made about it.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(from = "DeviceHelper", into = "DeviceHelper")]
pub struct Device {
    inner: Arc<DeviceKeys>,
    /// Shared between the clones of a device, so a verification upgrades
    /// every copy that is still floating around.
    trust_state: Arc<StdRwLock<LocalTrust>>,
    first_time_seen: MilliSecondsSinceUnixEpoch,
}

impl Device {
    /// Create a device record from a set of downloaded device keys.
    ///
    /// The self-signature of the keys needs to have been checked with
    /// [`Device::verify_device_keys`] beforehand.
    pub fn new(device_keys: DeviceKeys, trust_state: LocalTrust) -> Self {
        Self {
            inner: Arc::new(device_keys),
            trust_state: Arc::new(StdRwLock::new(trust_state)),
            first_time_seen: MilliSecondsSinceUnixEpoch::now(),
        }
    }

    /// Check that a set of downloaded device keys is correctly self-signed.
    pub fn verify_device_keys(device_keys: &DeviceKeys) -> Result<(), SignatureError> {
        let signing_key = device_keys.ed25519_key().ok_or(SignatureError::InvalidKey)?;
        let json = serde_json::to_value(device_keys)
            .map_err(|_| SignatureError::NotAnObject)?;

        verify_signed_json(signing_key, &device_keys.user_id, &device_keys.device_id, &json)
    }

    pub fn user_id(&self) -> &UserId {
        &self.inner.user_id
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.inner.device_id
    }

    pub fn display_name(&self) -> Option<&str> {
        self.inner.unsigned.device_display_name.as_deref()
    }

    pub fn algorithms(&self) -> &[EventEncryptionAlgorithm] {
        &self.inner.algorithms
    }

    /// The complete key object of the device.
    pub fn as_device_keys(&self) -> &DeviceKeys {
        &self.inner
    }

    /// The Curve25519 key of the device, used for Olm session establishment.
    pub fn curve25519_key(&self) -> Option<Curve25519PublicKey> {
        self.inner.curve25519_key()
    }

    /// The Ed25519 key of the device, used for signing.
    pub fn ed25519_key(&self) -> Option<Ed25519PublicKey> {
        self.inner.ed25519_key()
    }

    /// Does the device support any of the encryption algorithms we can use.
    pub fn supports_olm(&self) -> bool {
        self.inner.algorithms.contains(&EventEncryptionAlgorithm::OlmV1Curve25519AesSha2)
    }

    /// The local trust decision made about the device.
    pub fn local_trust_state(&self) -> LocalTrust {
        *self.trust_state.read().expect("The trust state lock should never be poisoned")
    }

    pub fn is_verified(&self) -> bool {
        self.local_trust_state() == LocalTrust::Verified
    }

    pub fn is_blacklisted(&self) -> bool {
        self.local_trust_state() == LocalTrust::BlackListed
    }

    /// Record a new trust decision for the device.
    pub fn set_trust_state(&self, state: LocalTrust) {
        *self.trust_state.write().expect("The trust state lock should never be poisoned") = state;
    }

    /// When the device was first seen by us.
    pub fn first_time_seen(&self) -> MilliSecondsSinceUnixEpoch {
        self.first_time_seen
    }

    /// Replace the key object of the device with a newly downloaded one.
    ///
    /// If the Ed25519 key of the device changed, any previously recorded
    /// trust is revoked and the device goes back to being unset. Returns
    /// true if the signing key changed.
    pub fn update_device(&mut self, device_keys: &DeviceKeys) -> Result<bool, SignatureError> {
        if self.user_id() != device_keys.user_id || self.device_id() != device_keys.device_id {
            return Err(SignatureError::InvalidKey);
        }

        Self::verify_device_keys(device_keys)?;

        let key_changed = self.ed25519_key() != device_keys.ed25519_key();

        if key_changed {
            warn!(
                user_id = self.user_id().as_str(),
                device_id = self.device_id().as_str(),
                "The Ed25519 key of a device changed, revoking its verification state"
            );
            self.set_trust_state(LocalTrust::Unset);
        }

        self.inner = Arc::new(device_keys.clone());

        Ok(key_changed)
    }

    /// Check the signature of a one-time key that was claimed for this
    /// device.
    pub fn verify_one_time_key(&self, one_time_key: &SignedKey) -> Result<(), SignatureError> {
        let json = serde_json::to_value(one_time_key)
            .map_err(|_| SignatureError::NotAnObject)?;
        self.is_signed_by_device(&json)
    }

    /// Check that the given JSON object carries a valid signature created by
    /// this device.
    pub fn is_signed_by_device(&self, json: &Value) -> Result<(), SignatureError> {
        let signing_key = self.ed25519_key().ok_or(SignatureError::InvalidKey)?;
        verify_signed_json(signing_key, self.user_id(), self.device_id(), json)
    }

    /// Create a device record for the given account, as other devices would
    /// see it.
    pub(crate) async fn from_account(account: &crate::olm::Account) -> Device {
        Self::new(account.device_keys().await, LocalTrust::Unset)
    }
}

#[derive(Clone, Serialize, Deserialize)]
struct DeviceHelper {
    device_keys: DeviceKeys,
    trust_state: LocalTrust,
    first_time_seen: MilliSecondsSinceUnixEpoch,
}

impl From<DeviceHelper> for Device {
    fn from(value: DeviceHelper) -> Self {
        Self {
            inner: Arc::new(value.device_keys),
            trust_state: Arc::new(StdRwLock::new(value.trust_state)),
            first_time_seen: value.first_time_seen,
        }
    }
}

impl From<Device> for DeviceHelper {
    fn from(value: Device) -> Self {
        Self {
            trust_state: value.local_trust_state(),
            first_time_seen: value.first_time_seen,
            device_keys: value.inner.as_ref().clone(),
        }
    }
}

/// The set of devices that changed during a device list update.
#[derive(Clone, Debug, Default)]
pub struct DeviceChanges {
    /// Devices we saw for the first time.
    pub new: Vec<Device>,
    /// Devices that rotated some part of their key object.
    pub changed: Vec<Device>,
    /// Devices that were deleted from the user's device list.
    pub deleted: Vec<Device>,
}

impl DeviceChanges {
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.changed.is_empty() && self.deleted.is_empty()
    }

    pub fn extend(&mut self, other: DeviceChanges) {
        self.new.extend(other.new);
        self.changed.extend(other.changed);
        self.deleted.extend(other.deleted);
    }
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, user_id};

    use super::*;
    use crate::olm::Account;

    #[tokio::test]
    async fn device_creation_from_account() {
        let account = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        let device_keys = account.device_keys().await;

        Device::verify_device_keys(&device_keys)
            .expect("Device keys created by an account should be correctly self-signed");

        let device = Device::new(device_keys, LocalTrust::Unset);

        assert_eq!(device.user_id(), account.user_id());
        assert_eq!(device.device_id(), account.device_id());
        assert_eq!(device.ed25519_key(), Some(account.identity_keys().ed25519));
        assert!(device.supports_olm());
        assert!(!device.is_verified());
    }

    #[tokio::test]
    async fn trust_is_shared_between_clones() {
        let account = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        let device = Device::from_account(&account).await;

        let clone = device.clone();
        device.set_trust_state(LocalTrust::Verified);

        assert!(clone.is_verified());
    }

    #[tokio::test]
    async fn key_change_revokes_trust() {
        let account = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        let mut device = Device::from_account(&account).await;
        device.set_trust_state(LocalTrust::Verified);

        // The same device ID reappears with a fresh set of keys.
        let imposter = Account::new(account.user_id(), account.device_id());
        let changed = device
            .update_device(&imposter.device_keys().await)
            .expect("The new key object is correctly self-signed");

        assert!(changed);
        assert_eq!(device.local_trust_state(), LocalTrust::Unset);
        assert_eq!(device.ed25519_key(), Some(imposter.identity_keys().ed25519));
    }

    #[tokio::test]
    async fn unchanged_update_keeps_trust() {
        let account = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        let mut device = Device::from_account(&account).await;
        device.set_trust_state(LocalTrust::Verified);

        let changed = device.update_device(&account.device_keys().await).unwrap();

        assert!(!changed);
        assert!(device.is_verified());
    }

    #[tokio::test]
    async fn tampered_device_keys_are_rejected() {
        let account = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        let mut device_keys = account.device_keys().await;

        device_keys.unsigned.device_display_name = Some("unsigned data can change".to_owned());
        Device::verify_device_keys(&device_keys)
            .expect("The unsigned field is not covered by the signature");

        device_keys
            .keys
            .insert(format!("curve25519:{}", device_keys.device_id), "tampered".to_owned());
        Device::verify_device_keys(&device_keys)
            .expect_err("A modified key object should fail the signature check");
    }
}
