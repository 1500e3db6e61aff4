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

use std::collections::BTreeMap;

use ruma::CanonicalJsonValue;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{trace, warn};
use vodozemac::{base64_encode, sas::EstablishedSas, Curve25519PublicKey};

use super::super::{
    events::{MacContent, StartContent},
    CancelCode, Emoji, FlowId,
};
use crate::{identities::Device, olm::StaticAccountData};

/// The identities involved in a SAS flow.
#[derive(Clone, Debug)]
pub struct SasIds {
    pub account: StaticAccountData,
    pub other_device: Device,
}

/// The MAC methods this implementation can produce and check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SupportedMacMethod {
    /// The original method, which base64 encoded the MAC incorrectly. Kept
    /// for compatibility with older clients.
    HkdfHmacSha256,
    /// The fixed method with proper base64 encoding.
    HkdfHmacSha256V2,
}

impl SupportedMacMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            SupportedMacMethod::HkdfHmacSha256 => "hkdf-hmac-sha256",
            SupportedMacMethod::HkdfHmacSha256V2 => "hkdf-hmac-sha256.v2",
        }
    }

    pub fn from_wire(method: &str) -> Option<Self> {
        match method {
            "hkdf-hmac-sha256" => Some(SupportedMacMethod::HkdfHmacSha256),
            "hkdf-hmac-sha256.v2" => Some(SupportedMacMethod::HkdfHmacSha256V2),
            _ => None,
        }
    }

    pub fn calculate_mac(self, sas: &EstablishedSas, input: &str, info: &str) -> String {
        match self {
            SupportedMacMethod::HkdfHmacSha256 => sas.calculate_mac_invalid_base64(input, info),
            SupportedMacMethod::HkdfHmacSha256V2 => sas.calculate_mac(input, info).to_base64(),
        }
    }

    pub fn verify_mac(
        self,
        sas: &EstablishedSas,
        input: &str,
        info: &str,
        tag: &str,
    ) -> Result<(), CancelCode> {
        match self {
            SupportedMacMethod::HkdfHmacSha256 => {
                let expected = self.calculate_mac(sas, input, info);

                if expected.as_bytes().ct_eq(tag.as_bytes()).into() {
                    Ok(())
                } else {
                    Err(CancelCode::KeyMismatch)
                }
            }
            SupportedMacMethod::HkdfHmacSha256V2 => {
                let tag = vodozemac::sas::Mac::from_base64(tag)
                    .map_err(|_| CancelCode::InvalidMessage)?;

                sas.verify_mac(input, info, &tag).map_err(|_| CancelCode::KeyMismatch)
            }
        }
    }
}

/// Calculate the commitment for an accept event from the public key and the
/// start event that began the flow.
pub fn calculate_commitment(
    public_key: Curve25519PublicKey,
    content: &StartContent,
) -> Result<String, CancelCode> {
    let json = serde_json::to_value(content).map_err(|_| CancelCode::InvalidMessage)?;
    let canonical: CanonicalJsonValue =
        json.try_into().map_err(|_| CancelCode::InvalidMessage)?;

    Ok(base64_encode(
        Sha256::new()
            .chain_update(public_key.to_base64())
            .chain_update(canonical.to_string())
            .finalize(),
    ))
}

/// Get the emoji and its description for one of the 64 indices of the short
/// auth string.
///
/// The table is fixed by the spec, both sides have to render the exact same
/// symbols.
///
/// # Panics
///
/// Panics if the index is bigger than 63, the emoji indices produced by the
/// established SAS are always in range.
fn emoji_from_index(index: u8) -> Emoji {
    match index {
        0 => Emoji { symbol: "🐶", description: "Dog" },
        1 => Emoji { symbol: "🐱", description: "Cat" },
        2 => Emoji { symbol: "🦁", description: "Lion" },
        3 => Emoji { symbol: "🐎", description: "Horse" },
        4 => Emoji { symbol: "🦄", description: "Unicorn" },
        5 => Emoji { symbol: "🐷", description: "Pig" },
        6 => Emoji { symbol: "🐘", description: "Elephant" },
        7 => Emoji { symbol: "🐰", description: "Rabbit" },
        8 => Emoji { symbol: "🐼", description: "Panda" },
        9 => Emoji { symbol: "🐓", description: "Rooster" },
        10 => Emoji { symbol: "🐧", description: "Penguin" },
        11 => Emoji { symbol: "🐢", description: "Turtle" },
        12 => Emoji { symbol: "🐟", description: "Fish" },
        13 => Emoji { symbol: "🐙", description: "Octopus" },
        14 => Emoji { symbol: "🦋", description: "Butterfly" },
        15 => Emoji { symbol: "🌷", description: "Flower" },
        16 => Emoji { symbol: "🌳", description: "Tree" },
        17 => Emoji { symbol: "🌵", description: "Cactus" },
        18 => Emoji { symbol: "🍄", description: "Mushroom" },
        19 => Emoji { symbol: "🌏", description: "Globe" },
        20 => Emoji { symbol: "🌙", description: "Moon" },
        21 => Emoji { symbol: "☁️", description: "Cloud" },
        22 => Emoji { symbol: "🔥", description: "Fire" },
        23 => Emoji { symbol: "🍌", description: "Banana" },
        24 => Emoji { symbol: "🍎", description: "Apple" },
        25 => Emoji { symbol: "🍓", description: "Strawberry" },
        26 => Emoji { symbol: "🌽", description: "Corn" },
        27 => Emoji { symbol: "🍕", description: "Pizza" },
        28 => Emoji { symbol: "🎂", description: "Cake" },
        29 => Emoji { symbol: "❤️", description: "Heart" },
        30 => Emoji { symbol: "😀", description: "Smiley" },
        31 => Emoji { symbol: "🤖", description: "Robot" },
        32 => Emoji { symbol: "🎩", description: "Hat" },
        33 => Emoji { symbol: "👓", description: "Glasses" },
        34 => Emoji { symbol: "🔧", description: "Spanner" },
        35 => Emoji { symbol: "🎅", description: "Santa" },
        36 => Emoji { symbol: "👍", description: "Thumbs Up" },
        37 => Emoji { symbol: "☂️", description: "Umbrella" },
        38 => Emoji { symbol: "⌛", description: "Hourglass" },
        39 => Emoji { symbol: "⏰", description: "Clock" },
        40 => Emoji { symbol: "🎁", description: "Gift" },
        41 => Emoji { symbol: "💡", description: "Light Bulb" },
        42 => Emoji { symbol: "📕", description: "Book" },
        43 => Emoji { symbol: "✏️", description: "Pencil" },
        44 => Emoji { symbol: "📎", description: "Paperclip" },
        45 => Emoji { symbol: "✂️", description: "Scissors" },
        46 => Emoji { symbol: "🔒", description: "Lock" },
        47 => Emoji { symbol: "🔑", description: "Key" },
        48 => Emoji { symbol: "🔨", description: "Hammer" },
        49 => Emoji { symbol: "☎️", description: "Telephone" },
        50 => Emoji { symbol: "🏁", description: "Flag" },
        51 => Emoji { symbol: "🚂", description: "Train" },
        52 => Emoji { symbol: "🚲", description: "Bicycle" },
        53 => Emoji { symbol: "✈️", description: "Aeroplane" },
        54 => Emoji { symbol: "🚀", description: "Rocket" },
        55 => Emoji { symbol: "🏆", description: "Trophy" },
        56 => Emoji { symbol: "⚽", description: "Ball" },
        57 => Emoji { symbol: "🎸", description: "Guitar" },
        58 => Emoji { symbol: "🎺", description: "Trumpet" },
        59 => Emoji { symbol: "🔔", description: "Bell" },
        60 => Emoji { symbol: "⚓", description: "Anchor" },
        61 => Emoji { symbol: "🎧", description: "Headphones" },
        62 => Emoji { symbol: "📁", description: "Folder" },
        63 => Emoji { symbol: "📌", description: "Pin" },
        _ => panic!("Trying to fetch an emoji outside the allowed range"),
    }
}

/// The info string used when we check the MACs the other side sent us.
fn extra_mac_info_receive(ids: &SasIds, flow_id: &str) -> String {
    format!(
        "MATRIX_KEY_VERIFICATION_MAC{first_user}{first_device}\
        {second_user}{second_device}{transaction_id}",
        first_user = ids.other_device.user_id(),
        first_device = ids.other_device.device_id(),
        second_user = ids.account.user_id,
        second_device = ids.account.device_id,
        transaction_id = flow_id,
    )
}

/// The info string used when producing the MACs we're going to send out.
fn extra_mac_info_send(ids: &SasIds, flow_id: &str) -> String {
    format!(
        "MATRIX_KEY_VERIFICATION_MAC{first_user}{first_device}\
        {second_user}{second_device}{transaction_id}",
        first_user = ids.account.user_id,
        first_device = ids.account.device_id,
        second_user = ids.other_device.user_id(),
        second_device = ids.other_device.device_id(),
        transaction_id = flow_id,
    )
}

/// Check the MACs of an incoming `m.key.verification.mac` event, returning
/// the device that was successfully verified.
pub fn receive_mac_event(
    sas: &EstablishedSas,
    ids: &SasIds,
    flow_id: &str,
    mac_method: SupportedMacMethod,
    content: &MacContent,
) -> Result<Vec<Device>, CancelCode> {
    let mut verified_devices = Vec::new();
    let info = extra_mac_info_receive(ids, flow_id);

    trace!(
        sender = %ids.other_device.user_id(),
        device_id = %ids.other_device.device_id(),
        "Received a key.verification.mac event"
    );

    let mut key_ids: Vec<_> = content.mac.keys().map(|id| id.as_str()).collect();
    key_ids.sort_unstable();
    mac_method.verify_mac(sas, &key_ids.join(","), &format!("{info}KEY_IDS"), &content.keys)?;

    for (key_id, key_mac) in &content.mac {
        let Some(key) = ids.other_device.as_device_keys().keys.get(key_id) else {
            warn!(
                key_id,
                "Key ID in the MAC event doesn't belong to the device that is being verified"
            );
            continue;
        };

        mac_method.verify_mac(sas, key, &format!("{info}{key_id}"), key_mac)?;
        trace!(key_id, "Successfully verified a device key");
        verified_devices.push(ids.other_device.clone());
    }

    Ok(verified_devices)
}

/// Produce the content of the `m.key.verification.mac` event for our own
/// device keys.
pub fn get_mac_content(
    sas: &EstablishedSas,
    ids: &SasIds,
    flow_id: &FlowId,
    mac_method: SupportedMacMethod,
) -> MacContent {
    let mut mac = BTreeMap::new();
    let info = extra_mac_info_send(ids, flow_id.as_str());

    let key_id = format!("ed25519:{}", ids.account.device_id);
    let key = ids.account.identity_keys.ed25519.to_base64();
    mac.insert(key_id.clone(), mac_method.calculate_mac(sas, &key, &format!("{info}{key_id}")));

    let mut key_ids: Vec<_> = mac.keys().map(|id| id.as_str()).collect();
    key_ids.sort_unstable();
    let keys = mac_method.calculate_mac(sas, &key_ids.join(","), &format!("{info}KEY_IDS"));

    MacContent {
        transaction_id: flow_id.as_transaction_id().to_owned(),
        mac,
        keys,
    }
}

/// The info string that the short auth string bytes are derived from, starter
/// first.
fn extra_info_sas(
    ids: &SasIds,
    own_pubkey: Curve25519PublicKey,
    their_pubkey: Curve25519PublicKey,
    flow_id: &str,
    we_started: bool,
) -> String {
    let our_info =
        format!("{}|{}|{}", ids.account.user_id, ids.account.device_id, own_pubkey.to_base64());
    let their_info = format!(
        "{}|{}|{}",
        ids.other_device.user_id(),
        ids.other_device.device_id(),
        their_pubkey.to_base64()
    );

    let (first_info, second_info) =
        if we_started { (our_info, their_info) } else { (their_info, our_info) };

    let info = format!("MATRIX_KEY_VERIFICATION_SAS|{first_info}|{second_info}|{flow_id}");

    trace!("Generated a SAS extra info: {info}");

    info
}

/// The emoji representation of the short auth string.
pub fn get_emoji(
    sas: &EstablishedSas,
    ids: &SasIds,
    flow_id: &str,
    we_started: bool,
) -> [Emoji; 7] {
    get_emoji_index(sas, ids, flow_id, we_started).map(emoji_from_index)
}

/// The raw emoji indices of the short auth string, in the range 0..=63.
pub fn get_emoji_index(
    sas: &EstablishedSas,
    ids: &SasIds,
    flow_id: &str,
    we_started: bool,
) -> [u8; 7] {
    let bytes = sas.bytes(&extra_info_sas(
        ids,
        sas.our_public_key(),
        sas.their_public_key(),
        flow_id,
        we_started,
    ));

    bytes.emoji_indices()
}

/// The decimal representation of the short auth string, three numbers in the
/// range 1000..=9191.
pub fn get_decimal(
    sas: &EstablishedSas,
    ids: &SasIds,
    flow_id: &str,
    we_started: bool,
) -> (u16, u16, u16) {
    let bytes = sas.bytes(&extra_info_sas(
        ids,
        sas.our_public_key(),
        sas.their_public_key(),
        flow_id,
        we_started,
    ));

    bytes.decimals()
}

#[cfg(test)]
mod tests {
    use ruma::device_id;
    use vodozemac::Curve25519PublicKey;

    use super::calculate_commitment;
    use crate::verification::events::{SasV1Content, StartContent, StartMethod};

    #[test]
    fn commitment_is_deterministic() {
        let public_key =
            Curve25519PublicKey::from_base64("Q/NmNFEUS1fS+YeEmiZkjjblKTitrKOAk7cPEumcMlg")
                .unwrap();

        let content = StartContent {
            from_device: device_id!("XOWLHHFSWM").to_owned(),
            transaction_id: "bYxBsirjUJO9osar6ST4i2M2NjrYLA7l".into(),
            method: StartMethod::SasV1(SasV1Content::default()),
        };

        let first = calculate_commitment(public_key, &content).unwrap();
        let second = calculate_commitment(public_key, &content).unwrap();
        assert_eq!(first, second);

        let other_key =
            Curve25519PublicKey::from_base64("ilqi/Ty5mnAYD9UNYVpkcdT9g4jKAQDAB6hNlSxHGGY")
                .unwrap();
        assert_ne!(first, calculate_commitment(other_key, &content).unwrap());
    }
}
