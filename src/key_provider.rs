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

//! A trait abstracting over the identity of our own device.

use ruma::{DeviceId, UserId};
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey};

use crate::olm::StaticAccountData;

/// A source for the identity of the device we are running on.
///
/// Everything that needs to know who we are asks a provider instead of
/// reading global state. The [`OlmMachine`] hands out the static data of its
/// Olm [`Account`] as the one concrete provider.
///
/// [`OlmMachine`]: crate::OlmMachine
/// [`Account`]: crate::olm::Account
pub trait DeviceKeyProvider: Send + Sync + std::fmt::Debug {
    /// The ID of the user owning the device.
    fn user_id(&self) -> &UserId;

    /// The ID of the device itself.
    fn device_id(&self) -> &DeviceId;

    /// The long lived Ed25519 signing key of the device.
    fn ed25519_key(&self) -> Ed25519PublicKey;

    /// The long lived Curve25519 identity key of the device.
    fn curve25519_key(&self) -> Curve25519PublicKey;
}

impl DeviceKeyProvider for StaticAccountData {
    fn user_id(&self) -> &UserId {
        &self.user_id
    }

    fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    fn ed25519_key(&self) -> Ed25519PublicKey {
        StaticAccountData::ed25519_key(self)
    }

    fn curve25519_key(&self) -> Curve25519PublicKey {
        StaticAccountData::curve25519_key(self)
    }
}
