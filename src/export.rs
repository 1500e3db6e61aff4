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

//! The passphrase protected room key export file format.
//!
//! The exported keys are serialized to JSON, encrypted with AES-256-CTR and
//! authenticated with HMAC-SHA-256, both keys derived from the passphrase
//! with PBKDF2-SHA-512. The binary payload is base64 encoded and wrapped in
//! armor lines similar to PEM.

use std::io::{Cursor, Read};

use hmac::digest::MacError;
use thiserror::Error;
use vodozemac::{base64_decode, base64_encode};

use crate::{
    ciphers::{AesHmacSha2Key, IV_SIZE, MAC_SIZE, SALT_SIZE},
    olm::ExportedRoomKey,
};

const HEADER: &str = "-----BEGIN MEGOLM SESSION DATA-----";
const FOOTER: &str = "-----END MEGOLM SESSION DATA-----";
const VERSION: u8 = 1;

/// An error that can happen while decrypting a room key export.
#[derive(Debug, Error)]
pub enum KeyExportError {
    /// The armor lines around the payload are missing.
    #[error("the key export is missing its header or footer")]
    InvalidArmor,

    /// The export uses a version of the format we don't support.
    #[error("the key export uses an unsupported version: {0}")]
    UnsupportedVersion(u8),

    /// The payload was truncated.
    #[error(transparent)]
    Truncated(#[from] std::io::Error),

    /// The base64 payload couldn't be decoded.
    #[error(transparent)]
    Base64(#[from] vodozemac::Base64DecodeError),

    /// The MAC tag doesn't match, the passphrase is wrong or the export was
    /// tampered with.
    #[error("the MAC tag of the key export didn't match")]
    Mac(#[from] MacError),

    /// The decrypted payload isn't a valid room key list.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Encrypt a list of room keys into the armored export format.
pub fn encrypt_room_key_export(
    room_keys: &[ExportedRoomKey],
    passphrase: &str,
    rounds: u32,
) -> Result<String, serde_json::Error> {
    let plaintext = serde_json::to_vec(room_keys)?;

    let salt = AesHmacSha2Key::generate_salt();
    let key = AesHmacSha2Key::from_passphrase(passphrase, rounds, &salt);

    let (ciphertext, iv) = key.encrypt(plaintext);

    let mut payload =
        Vec::with_capacity(1 + SALT_SIZE + IV_SIZE + 4 + ciphertext.len() + MAC_SIZE);

    payload.push(VERSION);
    payload.extend_from_slice(&salt);
    payload.extend_from_slice(&iv);
    payload.extend_from_slice(&rounds.to_be_bytes());
    payload.extend_from_slice(&ciphertext);

    let mac = key.create_mac_tag(&payload);
    payload.extend_from_slice(&mac);

    let mut armored = String::from(HEADER);
    armored.push('\n');

    // Wrap the base64 payload the way other implementations do, so the
    // files stay interoperable.
    let encoded = base64_encode(payload);
    for chunk in encoded.as_bytes().chunks(96) {
        armored.push_str(std::str::from_utf8(chunk).expect("Base64 output should be ASCII"));
        armored.push('\n');
    }

    armored.push_str(FOOTER);
    armored.push('\n');

    Ok(armored)
}

/// Decrypt an armored room key export.
pub fn decrypt_room_key_export(
    export: &str,
    passphrase: &str,
) -> Result<Vec<ExportedRoomKey>, KeyExportError> {
    let payload = decode_armor(export)?;

    if payload.len() < 1 + SALT_SIZE + IV_SIZE + 4 + MAC_SIZE {
        return Err(KeyExportError::Truncated(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "the key export payload is too short",
        )));
    }

    let mut cursor = Cursor::new(payload.as_slice());

    let mut version = [0u8; 1];
    let mut salt = [0u8; SALT_SIZE];
    let mut iv = [0u8; IV_SIZE];
    let mut rounds = [0u8; 4];

    cursor.read_exact(&mut version)?;
    cursor.read_exact(&mut salt)?;
    cursor.read_exact(&mut iv)?;
    cursor.read_exact(&mut rounds)?;

    if version[0] != VERSION {
        return Err(KeyExportError::UnsupportedVersion(version[0]));
    }

    let ciphertext_start = cursor.position() as usize;
    let mac_start = payload.len() - MAC_SIZE;

    let key = AesHmacSha2Key::from_passphrase(passphrase, u32::from_be_bytes(rounds), &salt);

    key.verify_mac(&payload[..mac_start], &payload[mac_start..])?;

    let ciphertext = payload[ciphertext_start..mac_start].to_vec();
    let plaintext = key.decrypt(ciphertext, &iv);

    Ok(serde_json::from_slice(&plaintext)?)
}

fn decode_armor(export: &str) -> Result<Vec<u8>, KeyExportError> {
    let mut lines = export.lines().map(str::trim).filter(|line| !line.is_empty());

    if lines.next() != Some(HEADER) {
        return Err(KeyExportError::InvalidArmor);
    }

    let mut base64 = String::new();
    let mut saw_footer = false;

    for line in lines {
        if line == FOOTER {
            saw_footer = true;
            break;
        }

        base64.push_str(line);
    }

    if !saw_footer {
        return Err(KeyExportError::InvalidArmor);
    }

    Ok(base64_decode(base64)?)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use ruma::room_id;
    use vodozemac::{
        megolm::{GroupSession, SessionConfig},
        Curve25519PublicKey,
    };

    use super::*;
    use crate::{olm::InboundGroupSession, types::EventEncryptionAlgorithm};

    const PASSPHRASE: &str = "1234";

    async fn room_key() -> ExportedRoomKey {
        let outbound = GroupSession::new(SessionConfig::version_1());

        let sender_key = Curve25519PublicKey::from_base64(
            "ClCcCcqKWmBZLmEbeQjBhQBCBGWaXLCvjHKVKFgNWSY",
        )
        .unwrap();
        let signing_key = vodozemac::Ed25519Keypair::new().public_key();

        let inbound = InboundGroupSession::new(
            sender_key,
            signing_key,
            room_id!("!test:localhost"),
            &outbound.session_key(),
            EventEncryptionAlgorithm::MegolmV1AesSha2,
        )
        .unwrap();

        inbound.export().await
    }

    #[tokio::test]
    async fn export_round_trip() {
        let key = room_key().await;

        let export = encrypt_room_key_export(std::slice::from_ref(&key), PASSPHRASE, 10).unwrap();
        let decrypted = decrypt_room_key_export(&export, PASSPHRASE).unwrap();

        assert_eq!(decrypted.len(), 1);
        assert_eq!(decrypted[0].session_id, key.session_id);
        assert_eq!(decrypted[0].room_id, key.room_id);
    }

    #[tokio::test]
    async fn wrong_passphrase_fails_the_mac_check() {
        let key = room_key().await;

        let export = encrypt_room_key_export(std::slice::from_ref(&key), PASSPHRASE, 10).unwrap();

        assert_matches!(
            decrypt_room_key_export(&export, "wrong passphrase"),
            Err(KeyExportError::Mac(_))
        );
    }

    #[test]
    fn missing_armor_is_rejected() {
        assert_matches!(
            decrypt_room_key_export("not an export", PASSPHRASE),
            Err(KeyExportError::InvalidArmor)
        );
    }

    #[tokio::test]
    async fn unsupported_versions_are_rejected() {
        let key = room_key().await;

        let export = encrypt_room_key_export(std::slice::from_ref(&key), PASSPHRASE, 10).unwrap();

        let mut payload = decode_armor(&export).unwrap();
        payload[0] = 2;

        let tampered = format!("{HEADER}\n{}\n{FOOTER}\n", base64_encode(payload));

        assert_matches!(
            decrypt_room_key_export(&tampered, PASSPHRASE),
            Err(KeyExportError::UnsupportedVersion(2))
        );
    }
}
