// Copyright 2023 The Matrix.org Foundation C.I.C.
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

//! Client side secret storage, the `m.secret_storage.v1.aes-hmac-sha2`
//! algorithm.
//!
//! A single 32-byte storage key protects any number of named secrets. Each
//! secret gets its own AES and HMAC key pair, derived from the storage key
//! with HKDF-SHA-256 and the name of the secret as the info, so leaking the
//! keys of one secret doesn't endanger the others.

use hmac::digest::MacError;
use serde::{Deserialize, Serialize};
use sha2::Sha512;
use thiserror::Error;
use vodozemac::{base64_decode, base64_encode};
use zeroize::{Zeroize, Zeroizing};

use crate::ciphers::{AesHmacSha2Key, IV_SIZE, KEY_SIZE, MAC_SIZE};

/// The number of PBKDF2 rounds used when a storage key is created from a
/// passphrase.
const DEFAULT_PBKDF_ROUNDS: u32 = 500_000;

/// An error that can happen while decrypting a secret from secret storage.
#[derive(Debug, Error)]
pub enum SecretStorageError {
    /// One of the base64 encoded fields couldn't be decoded.
    #[error(transparent)]
    Base64(#[from] vodozemac::Base64DecodeError),

    /// A field has the wrong length.
    #[error("a field of the encrypted data has an invalid length, expected {expected}, got {got}")]
    InvalidLength {
        /// The expected length in bytes.
        expected: usize,
        /// The length we actually got.
        got: usize,
    },

    /// The MAC tag of the ciphertext doesn't match, either the data was
    /// tampered with or a different key or secret name was used.
    #[error("the MAC tag of the encrypted data didn't match")]
    Mac(#[from] MacError),
}

/// The encrypted form a secret takes inside the account data of the user.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AesHmacSha2EncryptedData {
    /// The unpadded base64 encoded initialization vector.
    pub iv: String,
    /// The unpadded base64 encoded ciphertext.
    pub ciphertext: String,
    /// The unpadded base64 encoded MAC tag of the ciphertext.
    pub mac: String,
}

/// The PBKDF2 parameters needed to recreate a storage key from a
/// passphrase.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PassphraseInfo {
    /// The KDF algorithm, always `m.pbkdf2`.
    pub algorithm: String,
    /// The unpadded base64 encoded salt.
    pub salt: String,
    /// The number of PBKDF2 rounds.
    pub iterations: u32,
}

/// A secret storage key, the root secret protecting all the others.
pub struct SecretStorageKey {
    inner: Box<[u8; KEY_SIZE]>,
    passphrase_info: Option<PassphraseInfo>,
}

impl std::fmt::Debug for SecretStorageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretStorageKey")
            .field("passphrase_info", &self.passphrase_info)
            .finish_non_exhaustive()
    }
}

impl Drop for SecretStorageKey {
    fn drop(&mut self) {
        self.inner.zeroize();
    }
}

impl SecretStorageKey {
    /// Create a new random storage key.
    pub fn new() -> Self {
        use rand::RngCore;

        let mut key = Box::new([0u8; KEY_SIZE]);
        rand::thread_rng().fill_bytes(key.as_mut_slice());

        Self { inner: key, passphrase_info: None }
    }

    /// Derive a storage key from a passphrase, generating a fresh salt.
    pub fn from_passphrase(passphrase: &str) -> Self {
        let salt = AesHmacSha2Key::generate_salt();

        let info = PassphraseInfo {
            algorithm: "m.pbkdf2".to_owned(),
            salt: base64_encode(salt),
            iterations: DEFAULT_PBKDF_ROUNDS,
        };

        Self::expand_passphrase(passphrase, &salt, DEFAULT_PBKDF_ROUNDS, info)
    }

    /// Recreate a storage key from a passphrase and the stored KDF
    /// parameters.
    pub fn from_passphrase_info(
        passphrase: &str,
        info: &PassphraseInfo,
    ) -> Result<Self, SecretStorageError> {
        let salt = base64_decode(&info.salt)?;

        Ok(Self::expand_passphrase(passphrase, &salt, info.iterations, info.clone()))
    }

    fn expand_passphrase(
        passphrase: &str,
        salt: &[u8],
        rounds: u32,
        info: PassphraseInfo,
    ) -> Self {
        let mut key = Box::new([0u8; KEY_SIZE]);

        pbkdf2::pbkdf2::<hmac::Hmac<Sha512>>(
            passphrase.as_bytes(),
            salt,
            rounds,
            key.as_mut_slice(),
        )
        .expect("We should be able to expand a passphrase of any length");

        Self { inner: key, passphrase_info: Some(info) }
    }

    /// Restore a storage key from its unpadded base64 form.
    pub fn from_base64(key: &str) -> Result<Self, SecretStorageError> {
        let decoded = Zeroizing::new(base64_decode(key)?);

        if decoded.len() != KEY_SIZE {
            return Err(SecretStorageError::InvalidLength {
                expected: KEY_SIZE,
                got: decoded.len(),
            });
        }

        let mut key = Box::new([0u8; KEY_SIZE]);
        key.copy_from_slice(&decoded);

        Ok(Self { inner: key, passphrase_info: None })
    }

    /// The storage key in its unpadded base64 form.
    pub fn to_base64(&self) -> String {
        base64_encode(self.inner.as_slice())
    }

    /// The KDF parameters of the key, if it was derived from a passphrase.
    pub fn passphrase_info(&self) -> Option<&PassphraseInfo> {
        self.passphrase_info.as_ref()
    }

    /// Encrypt a named secret.
    pub fn encrypt(&self, secret_name: &str, plaintext: &[u8]) -> AesHmacSha2EncryptedData {
        let key = AesHmacSha2Key::from_secret_storage_key(&self.inner, secret_name);

        let (ciphertext, iv) = key.encrypt(plaintext.to_vec());
        let mac = key.create_mac_tag(&ciphertext);

        AesHmacSha2EncryptedData {
            iv: base64_encode(iv),
            ciphertext: base64_encode(&ciphertext),
            mac: base64_encode(mac),
        }
    }

    /// Decrypt a named secret, verifying the MAC tag first.
    pub fn decrypt(
        &self,
        secret_name: &str,
        data: &AesHmacSha2EncryptedData,
    ) -> Result<Vec<u8>, SecretStorageError> {
        let iv = base64_decode(&data.iv)?;
        let iv: [u8; IV_SIZE] = iv.try_into().map_err(|iv: Vec<u8>| {
            SecretStorageError::InvalidLength { expected: IV_SIZE, got: iv.len() }
        })?;

        let mac = base64_decode(&data.mac)?;
        if mac.len() != MAC_SIZE {
            return Err(SecretStorageError::InvalidLength {
                expected: MAC_SIZE,
                got: mac.len(),
            });
        }

        let ciphertext = base64_decode(&data.ciphertext)?;

        let key = AesHmacSha2Key::from_secret_storage_key(&self.inner, secret_name);
        key.verify_mac(&ciphertext, &mac)?;

        Ok(key.decrypt(ciphertext, &iv))
    }
}

impl Default for SecretStorageKey {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn secret_round_trip() {
        let key = SecretStorageKey::new();

        let encrypted = key.encrypt("m.megolm_backup.v1", b"a very secret recovery key");
        let decrypted = key.decrypt("m.megolm_backup.v1", &encrypted).unwrap();

        assert_eq!(decrypted, b"a very secret recovery key");
    }

    #[test]
    fn secrets_are_bound_to_their_name() {
        let key = SecretStorageKey::new();

        let encrypted = key.encrypt("m.megolm_backup.v1", b"a very secret recovery key");

        key.decrypt("m.cross_signing.master", &encrypted)
            .expect_err("A secret encrypted under one name shouldn't decrypt under another");
    }

    #[test]
    fn tampering_is_detected() {
        let key = SecretStorageKey::new();

        let mut encrypted = key.encrypt("m.megolm_backup.v1", b"a very secret recovery key");
        encrypted.ciphertext = base64_encode(b"something else entirely");

        assert_matches!(
            key.decrypt("m.megolm_backup.v1", &encrypted),
            Err(SecretStorageError::Mac(_))
        );
    }

    #[test]
    fn passphrase_keys_can_be_recreated() {
        let key = SecretStorageKey::from_passphrase("It's a secret to everybody");
        let info = key.passphrase_info().unwrap().clone();

        let encrypted = key.encrypt("m.megolm_backup.v1", b"a very secret recovery key");

        let recreated =
            SecretStorageKey::from_passphrase_info("It's a secret to everybody", &info).unwrap();
        let decrypted = recreated.decrypt("m.megolm_backup.v1", &encrypted).unwrap();

        assert_eq!(decrypted, b"a very secret recovery key");
    }

    #[test]
    fn base64_round_trip() {
        let key = SecretStorageKey::new();
        let restored = SecretStorageKey::from_base64(&key.to_base64()).unwrap();

        let encrypted = key.encrypt("m.example.secret", b"opaque");
        assert_eq!(restored.decrypt("m.example.secret", &encrypted).unwrap(), b"opaque");
    }
}
