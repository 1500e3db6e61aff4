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

use std::{
    fmt,
    sync::{Arc, Mutex as StdMutex},
};

use rand::{thread_rng, RngCore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vodozemac::{
    base64_decode, base64_encode,
    pk_encryption::{Message, PkDecryption, PkEncryption},
    Curve25519PublicKey, Curve25519SecretKey,
};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::olm::{BackedUpRoomKey, InboundGroupSession};

use super::{EncryptedSessionData, KeyBackupData};

/// Prefix bytes every recovery key carries before the key material.
const RECOVERY_KEY_PREFIX: [u8; 2] = [0x8b, 0x01];
const KEY_SIZE: usize = 32;

/// Error type for the decoding of a recovery key from its text forms.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The decoded recovery key has an invalid prefix.
    #[error("the decoded recovery key has an invalid prefix, expected {0:?}, got {1:?}")]
    Prefix([u8; 2], [u8; 2]),

    /// The parity byte of the recovery key didn't match.
    #[error("the parity byte of the recovery key doesn't match, expected {0:x}, got {1:x}")]
    Parity(u8, u8),

    /// The recovery key has an invalid length.
    #[error("the decoded recovery key has an invalid length, expected {0}, got {1}")]
    Length(usize, usize),

    /// The recovery key isn't valid base58.
    #[error(transparent)]
    Base58(#[from] bs58::decode::Error),

    /// The recovery key isn't valid base64.
    #[error(transparent)]
    Base64(#[from] vodozemac::Base64DecodeError),
}

/// Error type for the decryption of backed up room keys.
#[derive(Debug, Error)]
pub enum BackupDecryptionError {
    /// One of the base64 encoded fields of the backed up key couldn't be
    /// decoded.
    #[error(transparent)]
    Base64(#[from] vodozemac::Base64DecodeError),

    /// One of the keys in the backed up data was invalid.
    #[error(transparent)]
    Key(#[from] vodozemac::KeyError),

    /// The ciphertext failed to decrypt, usually because the MAC check
    /// failed.
    #[error("the backed up room key failed to decrypt: {0}")]
    Decryption(String),
}

/// The private half of a backup key, able to decrypt the room keys a backup
/// holds.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct BackupDecryptionKey {
    inner: Box<[u8; KEY_SIZE]>,
}

impl fmt::Debug for BackupDecryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BackupDecryptionKey").field(&"...").finish()
    }
}

impl BackupDecryptionKey {
    /// Generate a fresh random decryption key.
    pub fn new() -> Self {
        let mut key = Box::new([0u8; KEY_SIZE]);
        thread_rng().fill_bytes(key.as_mut_slice());

        Self { inner: key }
    }

    /// Create the key from exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8; KEY_SIZE]) -> Self {
        Self { inner: Box::new(*bytes) }
    }

    /// Restore the key from its unpadded base64 form.
    pub fn from_base64(key: &str) -> Result<Self, DecodeError> {
        let decoded = base64_decode(key)?;

        if decoded.len() != KEY_SIZE {
            return Err(DecodeError::Length(KEY_SIZE, decoded.len()));
        }

        let mut key = Box::new([0u8; KEY_SIZE]);
        key.copy_from_slice(&decoded);

        let mut decoded = decoded;
        decoded.zeroize();

        Ok(Self { inner: key })
    }

    /// Restore the key from the base58 recovery key form a user would type
    /// in, e.g. `EsTc LW2K PGiF wKEA 3As5 g5c4 ...`.
    pub fn from_base58(value: &str) -> Result<Self, DecodeError> {
        // The spaces the display form groups the key with are ignored.
        let value: String = value.chars().filter(|c| !c.is_whitespace()).collect();

        let mut decoded = bs58::decode(value).with_alphabet(bs58::Alphabet::BITCOIN).into_vec()?;

        let expected_length = RECOVERY_KEY_PREFIX.len() + KEY_SIZE + 1;
        if decoded.len() != expected_length {
            decoded.zeroize();
            return Err(DecodeError::Length(expected_length, decoded.len()));
        }

        let prefix = [decoded[0], decoded[1]];
        if prefix != RECOVERY_KEY_PREFIX {
            decoded.zeroize();
            return Err(DecodeError::Prefix(RECOVERY_KEY_PREFIX, prefix));
        }

        let expected_parity = decoded[..decoded.len() - 1].iter().fold(0u8, |acc, b| acc ^ b);
        let parity = decoded[decoded.len() - 1];

        if expected_parity != parity {
            decoded.zeroize();
            return Err(DecodeError::Parity(expected_parity, parity));
        }

        let mut key = Box::new([0u8; KEY_SIZE]);
        key.copy_from_slice(&decoded[RECOVERY_KEY_PREFIX.len()..decoded.len() - 1]);
        decoded.zeroize();

        Ok(Self { inner: key })
    }

    /// The key in its unpadded base64 form.
    pub fn to_base64(&self) -> String {
        base64_encode(self.inner.as_slice())
    }

    /// The public half of the key, able to encrypt room keys for the backup.
    pub fn megolm_v1_public_key(&self) -> MegolmV1BackupKey {
        let pk = PkDecryption::from_key(Curve25519SecretKey::from_slice(self.inner.as_ref()));

        MegolmV1BackupKey::new(pk.public_key(), None)
    }

    /// Decrypt the `session_data` of a backed up room key.
    pub fn decrypt_session_data(
        &self,
        session_data: &EncryptedSessionData,
    ) -> Result<BackedUpRoomKey, BackupDecryptionError> {
        let pk = PkDecryption::from_key(Curve25519SecretKey::from_slice(self.inner.as_ref()));

        let message = Message {
            ciphertext: base64_decode(&session_data.ciphertext)?,
            mac: base64_decode(&session_data.mac)?,
            ephemeral_key: Curve25519PublicKey::from_base64(&session_data.ephemeral)?,
        };

        let decrypted =
            pk.decrypt(&message).map_err(|e| BackupDecryptionError::Decryption(e.to_string()))?;

        serde_json::from_slice(&decrypted)
            .map_err(|e| BackupDecryptionError::Decryption(e.to_string()))
    }
}

impl fmt::Display for BackupDecryptionKey {
    /// The recovery key form: base58 of prefix + key + parity, grouped into
    /// chunks of four characters.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut bytes = Vec::with_capacity(RECOVERY_KEY_PREFIX.len() + KEY_SIZE + 1);
        bytes.extend_from_slice(&RECOVERY_KEY_PREFIX);
        bytes.extend_from_slice(self.inner.as_slice());

        let parity = bytes.iter().fold(0u8, |acc, b| acc ^ b);
        bytes.push(parity);

        let base58 = bs58::encode(&bytes).into_string();
        bytes.zeroize();

        let chunks: Vec<&str> = base58
            .as_bytes()
            .chunks(4)
            .map(|c| std::str::from_utf8(c).expect("base58 is always valid ASCII"))
            .collect();

        write!(f, "{}", chunks.join(" "))
    }
}

impl Serialize for BackupDecryptionKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for BackupDecryptionKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let key = String::deserialize(deserializer)?;
        Self::from_base64(&key).map_err(serde::de::Error::custom)
    }
}

/// The public half of a backup key, it can encrypt room keys for upload but
/// never read them back.
#[derive(Clone, Debug)]
pub struct MegolmV1BackupKey {
    key: Curve25519PublicKey,
    version: Arc<StdMutex<Option<String>>>,
}

impl MegolmV1BackupKey {
    pub(crate) fn new(key: Curve25519PublicKey, version: Option<String>) -> Self {
        Self { key, version: Arc::new(StdMutex::new(version)) }
    }

    /// Restore the public key from its unpadded base64 form.
    pub fn from_base64(key: &str) -> Result<Self, vodozemac::KeyError> {
        Ok(Self::new(Curve25519PublicKey::from_base64(key)?, None))
    }

    /// The public key in its unpadded base64 form.
    pub fn to_base64(&self) -> String {
        self.key.to_base64()
    }

    /// The backup algorithm this key is used with.
    pub fn backup_algorithm(&self) -> &str {
        "m.megolm_backup.v1.curve25519-aes-sha2"
    }

    /// The version of the backup this key belongs to, if known.
    pub fn backup_version(&self) -> Option<String> {
        self.version.lock().expect("The version lock should never be poisoned").clone()
    }

    /// Remember which backup version this key belongs to.
    pub fn set_version(&self, version: String) {
        *self.version.lock().expect("The version lock should never be poisoned") = Some(version);
    }

    /// Encrypt the given session for upload into the backup.
    pub async fn encrypt(&self, session: InboundGroupSession) -> KeyBackupData {
        let pk = PkEncryption::from_key(self.key);

        let room_key: BackedUpRoomKey = session.to_backup().await;
        let key =
            serde_json::to_vec(&room_key).expect("A backed up room key can always be serialized");

        let message = pk.encrypt(&key);

        KeyBackupData {
            first_message_index: session.first_known_index(),
            forwarded_count: session.forwarding_curve25519_key_chain.len() as u32,
            // The backup crypto layer doesn't track cross-signing trust,
            // uploads always start out unverified.
            is_verified: false,
            session_data: EncryptedSessionData {
                ephemeral: message.ephemeral_key.to_base64(),
                ciphertext: base64_encode(&message.ciphertext),
                mac: base64_encode(&message.mac),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use ruma::room_id;
    use vodozemac::megolm::{GroupSession, SessionConfig};

    use super::*;
    use crate::types::EventEncryptionAlgorithm;

    const TEST_KEY: [u8; 32] = [
        0x77, 0x07, 0x6D, 0x0A, 0x73, 0x18, 0xA5, 0x7D, 0x3C, 0x16, 0xC1, 0x72, 0x51, 0xB2,
        0x66, 0x45, 0xDF, 0x4C, 0x2F, 0x87, 0xEB, 0xC0, 0x99, 0x2A, 0xB1, 0x77, 0xFB, 0xA5,
        0x1D, 0xB9, 0x2C, 0x2A,
    ];

    #[test]
    fn base58_roundtrip() {
        let key = BackupDecryptionKey::new();
        let display = key.to_string();

        let decoded =
            BackupDecryptionKey::from_base58(&display).expect("The display form should decode");
        assert_eq!(decoded.to_base64(), key.to_base64());
    }

    #[test]
    fn base58_corruption_is_detected() {
        let key = BackupDecryptionKey::from_bytes(&TEST_KEY);
        let display = key.to_string().replace(' ', "");

        let mut bytes = bs58::decode(&display).into_vec().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let corrupted = bs58::encode(&bytes).into_string();

        let error = BackupDecryptionKey::from_base58(&corrupted)
            .expect_err("A corrupted recovery key should not decode");
        assert_matches!(error, DecodeError::Parity(..));
    }

    #[test]
    fn base64_roundtrip() {
        let key = BackupDecryptionKey::from_bytes(&TEST_KEY);
        let decoded = BackupDecryptionKey::from_base64(&key.to_base64()).unwrap();

        assert_eq!(decoded.to_base64(), key.to_base64());
    }

    #[test]
    fn invalid_length_is_rejected() {
        let error = BackupDecryptionKey::from_base64(&base64_encode([0u8; 16]))
            .expect_err("A 16 byte key should be rejected");
        assert_matches!(error, DecodeError::Length(32, 16));
    }

    #[tokio::test]
    async fn encryption_roundtrip() {
        let decryption_key = BackupDecryptionKey::new();
        let backup_key = decryption_key.megolm_v1_public_key();

        let outbound = GroupSession::new(SessionConfig::version_1());
        let session = crate::olm::InboundGroupSession::new(
            Curve25519PublicKey::from_base64("ClCcCcqKWmBZLmEbeQjBhQBCBGWaXLCvjHKVKFgNWSY")
                .unwrap(),
            vodozemac::Ed25519Keypair::new().public_key(),
            room_id!("!test:localhost"),
            &outbound.session_key(),
            EventEncryptionAlgorithm::MegolmV1AesSha2,
        )
        .unwrap();

        let backup_data = backup_key.encrypt(session.clone()).await;
        assert_eq!(backup_data.first_message_index, 0);

        let decrypted = decryption_key
            .decrypt_session_data(&backup_data.session_data)
            .expect("The private half of the key should decrypt the upload");

        assert_eq!(decrypted.session_key.to_base64(), session.export().await.session_key.to_base64());
    }

    #[tokio::test]
    async fn tampered_backup_fails_to_decrypt() {
        let decryption_key = BackupDecryptionKey::new();
        let backup_key = decryption_key.megolm_v1_public_key();

        let outbound = GroupSession::new(SessionConfig::version_1());
        let session = crate::olm::InboundGroupSession::new(
            Curve25519PublicKey::from_base64("ClCcCcqKWmBZLmEbeQjBhQBCBGWaXLCvjHKVKFgNWSY")
                .unwrap(),
            vodozemac::Ed25519Keypair::new().public_key(),
            room_id!("!test:localhost"),
            &outbound.session_key(),
            EventEncryptionAlgorithm::MegolmV1AesSha2,
        )
        .unwrap();

        let mut backup_data = backup_key.encrypt(session).await;
        backup_data.session_data.mac = base64_encode([0u8; 32]);

        decryption_key
            .decrypt_session_data(&backup_data.session_data)
            .expect_err("A tampered MAC should make the decryption fail");
    }
}
