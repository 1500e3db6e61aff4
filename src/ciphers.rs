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

//! The underlying symmetric cipher used by secret storage and key export,
//! AES-CTR-256 paired with HMAC-SHA-256 in an encrypt-then-MAC mode.

use aes::{
    cipher::{KeyIvInit, StreamCipher},
    Aes256,
};
use hkdf::Hkdf;
use hmac::{digest::MacError, Mac as MacT};
use rand::{thread_rng, RngCore};
use sha2::{Sha256, Sha512};
use zeroize::{Zeroize, ZeroizeOnDrop};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;
type HmacSha256 = hmac::Hmac<Sha256>;

pub(crate) const IV_SIZE: usize = 16;
pub(crate) const KEY_SIZE: usize = 32;
pub(crate) const SALT_SIZE: usize = 16;
pub(crate) const MAC_SIZE: usize = 32;

/// An AES-CTR-256 key pair with a separate HMAC-SHA-256 key.
///
/// The two keys are derived together from a single 32-byte secret and are
/// always used in an encrypt-then-MAC manner, the MAC tag needs to be
/// verified before a ciphertext may be decrypted.
#[derive(Zeroize, ZeroizeOnDrop)]
pub(crate) struct AesHmacSha2Key {
    aes_key: Box<[u8; KEY_SIZE]>,
    mac_key: Box<[u8; KEY_SIZE]>,
}

impl AesHmacSha2Key {
    /// Expand the given passphrase into a key pair using PBKDF2 with
    /// HMAC-SHA-512 as the PRF.
    pub(crate) fn from_passphrase(
        passphrase: &str,
        pbkdf_rounds: u32,
        salt: &[u8; SALT_SIZE],
    ) -> Self {
        let mut expanded = Box::new([0u8; KEY_SIZE * 2]);
        pbkdf2::pbkdf2::<hmac::Hmac<Sha512>>(
            passphrase.as_bytes(),
            salt.as_slice(),
            pbkdf_rounds,
            expanded.as_mut_slice(),
        )
        .expect("We should be able to expand a passphrase of any length");

        let key = Self::from_expanded_key(&expanded);
        expanded.zeroize();

        key
    }

    /// Derive a per-secret key pair from a 32-byte secret storage key using
    /// HKDF-SHA-256, with the name of the secret as the info.
    pub(crate) fn from_secret_storage_key(key: &[u8; KEY_SIZE], secret_name: &str) -> Self {
        let mut expanded = Box::new([0u8; KEY_SIZE * 2]);
        let hkdf: Hkdf<Sha256> = Hkdf::new(None, key);

        hkdf.expand(secret_name.as_bytes(), expanded.as_mut_slice())
            .expect("We should be able to expand into a 64 byte key");

        let key = Self::from_expanded_key(&expanded);
        expanded.zeroize();

        key
    }

    fn from_expanded_key(expanded: &[u8; KEY_SIZE * 2]) -> Self {
        let mut aes_key = Box::new([0u8; KEY_SIZE]);
        let mut mac_key = Box::new([0u8; KEY_SIZE]);

        aes_key.copy_from_slice(&expanded[..KEY_SIZE]);
        mac_key.copy_from_slice(&expanded[KEY_SIZE..]);

        Self { aes_key, mac_key }
    }

    /// Encrypt the plaintext, returning the ciphertext and the random
    /// initialization vector that was used.
    pub(crate) fn encrypt(&self, plaintext: Vec<u8>) -> (Vec<u8>, [u8; IV_SIZE]) {
        let iv = Self::generate_iv();
        let ciphertext = self.apply_keystream(plaintext, &iv);

        (ciphertext, iv)
    }

    /// Decrypt the ciphertext.
    ///
    /// The MAC tag must have been verified with
    /// [`AesHmacSha2Key::verify_mac()`] before this is called, the cipher
    /// itself provides no authenticity.
    pub(crate) fn decrypt(&self, ciphertext: Vec<u8>, iv: &[u8; IV_SIZE]) -> Vec<u8> {
        self.apply_keystream(ciphertext, iv)
    }

    fn apply_keystream(&self, mut bytes: Vec<u8>, iv: &[u8; IV_SIZE]) -> Vec<u8> {
        let mut cipher = Aes256Ctr::new(self.aes_key.as_slice().into(), iv.into());
        cipher.apply_keystream(&mut bytes);

        bytes
    }

    /// Create a MAC tag over the given message, usually the ciphertext.
    pub(crate) fn create_mac_tag(&self, message: &[u8]) -> [u8; MAC_SIZE] {
        let mut mac =
            HmacSha256::new_from_slice(self.mac_key.as_slice())
                .expect("We should be able to create a HMAC object from a 32 byte key");
        mac.update(message);

        mac.finalize().into_bytes().into()
    }

    /// Verify, in constant time, that the given MAC tag matches the message.
    pub(crate) fn verify_mac(&self, message: &[u8], tag: &[u8]) -> Result<(), MacError> {
        let mut mac =
            HmacSha256::new_from_slice(self.mac_key.as_slice())
                .expect("We should be able to create a HMAC object from a 32 byte key");
        mac.update(message);

        mac.verify_slice(tag)
    }

    /// Generate a random IV with the most significant bit of the counter half
    /// cleared, so AES-CTR can't wrap around within a single message.
    fn generate_iv() -> [u8; IV_SIZE] {
        let mut iv = [0u8; IV_SIZE];
        thread_rng().fill_bytes(&mut iv);
        iv[8] &= 0x7f;

        iv
    }

    pub(crate) fn generate_salt() -> [u8; SALT_SIZE] {
        let mut salt = [0u8; SALT_SIZE];
        thread_rng().fill_bytes(&mut salt);

        salt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PASSPHRASE: &str = "It's a secret to everybody";

    #[test]
    fn encryption_roundtrip() {
        let plaintext = b"It's dangerous to go alone";

        let salt = AesHmacSha2Key::generate_salt();
        let key = AesHmacSha2Key::from_passphrase(PASSPHRASE, 10, &salt);

        let (ciphertext, iv) = key.encrypt(plaintext.to_vec());
        let mac = key.create_mac_tag(&ciphertext);

        assert_ne!(ciphertext, plaintext);

        key.verify_mac(&ciphertext, &mac).expect("The MAC tag should match");
        let decrypted = key.decrypt(ciphertext, &iv);

        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn mac_failure_is_detected() {
        let salt = AesHmacSha2Key::generate_salt();
        let key = AesHmacSha2Key::from_passphrase(PASSPHRASE, 10, &salt);

        let (mut ciphertext, _) = key.encrypt(b"Link".to_vec());
        let mac = key.create_mac_tag(&ciphertext);

        ciphertext[0] = ciphertext[0].wrapping_add(1);

        key.verify_mac(&ciphertext, &mac)
            .expect_err("A flipped ciphertext byte should invalidate the MAC tag");
    }

    #[test]
    fn iv_counter_bit_is_clamped() {
        for _ in 0..16 {
            let iv = AesHmacSha2Key::generate_iv();
            assert_eq!(iv[8] & 0x80, 0, "The high bit of the counter half must be cleared");
        }
    }

    #[test]
    fn per_secret_keys_differ() {
        let storage_key = [1u8; KEY_SIZE];

        let first = AesHmacSha2Key::from_secret_storage_key(&storage_key, "m.megolm_backup.v1");
        let second = AesHmacSha2Key::from_secret_storage_key(&storage_key, "m.cross_signing.master");

        let (ciphertext, _) = first.encrypt(b"foo".to_vec());
        let mac = first.create_mac_tag(&ciphertext);

        second
            .verify_mac(&ciphertext, &mac)
            .expect_err("Keys derived for different secrets should not verify each other's tags");
    }
}
