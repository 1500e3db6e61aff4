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

use ruma::{OwnedDeviceId, OwnedRoomId, OwnedUserId};
use serde_json::Error as JsonError;
use thiserror::Error;

use crate::{store::CryptoStoreError, types::events::WithheldCode};

pub type OlmResult<T> = Result<T, OlmError>;
pub type MegolmResult<T> = Result<T, MegolmError>;

/// Error representing a failure during a device to device cryptographic
/// operation.
#[derive(Error, Debug)]
pub enum OlmError {
    /// The event that should have been decrypted is malformed.
    #[error(transparent)]
    EventError(#[from] EventError),

    /// The received decrypted event couldn't be deserialized.
    #[error(transparent)]
    JsonError(#[from] JsonError),

    /// The underlying Olm session operated on an incorrect message.
    #[error("decryption via Olm failed: {0}")]
    Decryption(#[from] vodozemac::olm::DecryptionError),

    /// The undecryptable pre-key message was sent by a session we already
    /// established, the session is likely wedged and needs to be reset.
    #[error(
        "decryption via Olm failed for an existing session, the session with \
         the sender {0} and sender key {1} is likely wedged"
    )]
    SessionWedged(OwnedUserId, String),

    /// An Olm message got replayed while the Olm ratchet has already moved
    /// forward.
    #[error("the Olm message from {0} with sender key {1} was replayed")]
    ReplayedMessage(OwnedUserId, String),

    /// Encryption failed because the recipient device doesn't have a valid
    /// Curve25519 key.
    #[error("encryption failed because the recipient device is missing a Curve25519 key")]
    MissingCurveKey,

    /// Encryption failed because we don't have an established Olm session
    /// with the recipient device.
    #[error(
        "encryption failed because no Olm session with the device {0} of user \
         {1} could be found"
    )]
    MissingSession(OwnedUserId, OwnedDeviceId),

    /// The creation of a new Olm session failed.
    #[error(transparent)]
    SessionCreation(#[from] SessionCreationError),

    /// The storage layer failed.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),
}

/// Error representing a failure during a group encryption operation.
#[derive(Error, Debug)]
pub enum MegolmError {
    /// The event that should have been decrypted is malformed.
    #[error(transparent)]
    EventError(#[from] EventError),

    /// The received decrypted event couldn't be deserialized.
    #[error(transparent)]
    JsonError(#[from] JsonError),

    /// Decryption failed because we're missing the room key that was used to
    /// encrypt the event.
    #[error("can't find the room key to decrypt the event, withheld code: {0:?}")]
    MissingRoomKey(Option<WithheldCode>),

    /// The encrypted Megolm message couldn't be decoded.
    #[error(transparent)]
    Decode(#[from] vodozemac::DecodeError),

    /// The underlying Megolm session returned a decryption error.
    #[error("decryption via Megolm failed: {0}")]
    Decryption(#[from] vodozemac::megolm::DecryptionError),

    /// The sender of the room key doesn't match the device that encrypted the
    /// event.
    #[error("the sender of the room key has changed their identity keys")]
    MismatchedIdentityKeys,

    /// The storage layer failed.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),
}

/// Error representing a malformed or mismatched event.
#[derive(Error, Debug)]
pub enum EventError {
    #[error("the Olm message was not meant for this device")]
    MissingCiphertext,

    #[error("the Olm message is missing the signing key of the sender")]
    MissingSigningKey,

    #[error("the Olm message is missing the field {0}")]
    MissingField(String),

    #[error("the sender of the event doesn't match the owner of the device, got {0}, expected {1}")]
    MismatchedSender(OwnedUserId, OwnedUserId),

    #[error("the public key of the event sender doesn't match the key we have stored")]
    MismatchedKeys,

    #[error(
        "the room id of the room key doesn't match the room id of the \
         event, got {0:?}, expected {1:?}"
    )]
    MismatchedRoom(Option<OwnedRoomId>, OwnedRoomId),

    #[error("the event used an unsupported algorithm {0}")]
    UnsupportedAlgorithm(String),
}

/// Error type for the creation of an Olm session.
#[derive(Error, Debug)]
pub enum SessionCreationError {
    #[error(
        "can't create a new Olm session for {0} {1}, the requested one-time \
         key isn't a signed Curve25519 key"
    )]
    OneTimeKeyNotSigned(OwnedUserId, OwnedDeviceId),

    #[error("can't create a new Olm session for {0} {1}: {2}")]
    InvalidSignature(OwnedUserId, OwnedDeviceId, SignatureError),

    #[error(
        "tried to create a new Olm session for {0} {1}, but the signed \
         one-time key is missing"
    )]
    OneTimeKeyMissing(OwnedUserId, OwnedDeviceId),

    #[error(
        "tried to create a new Olm session for {0} {1}, but the device is \
         missing a Curve25519 key"
    )]
    DeviceMissingCurveKey(OwnedUserId, OwnedDeviceId),

    #[error("error deserializing the one-time key: {0}")]
    InvalidJson(#[from] JsonError),

    #[error("the Olm library produced an error for {0} {1}: {2}")]
    InboundCreation(OwnedUserId, String, vodozemac::olm::SessionCreationError),
}

/// Error type describing failures during signature verification.
#[derive(Error, Debug)]
pub enum SignatureError {
    #[error("the signature used an unsupported algorithm")]
    UnsupportedAlgorithm,

    #[error("the Ed25519 key isn't valid")]
    InvalidKey,

    #[error("the signature is missing from the signed object")]
    NoSignatureFound,

    #[error("the signed object couldn't be converted to canonical JSON")]
    NotAnObject,

    #[error("the signature didn't match the provided key and signed object: {0}")]
    VerificationError(#[from] vodozemac::SignatureError),

    #[error("the signature couldn't be decoded: {0}")]
    InvalidSignature(#[from] vodozemac::Base64DecodeError),
}

/// Error type describing failures while importing secrets that were shared
/// with us or restored from secret storage.
#[derive(Error, Debug)]
pub enum SecretImportError {
    /// The secret we tried to import has an invalid format or value.
    #[error("the secret has an invalid format or value")]
    MalformedSecret,

    /// The secret we tried to import doesn't match the expected public
    /// counterpart.
    #[error("the secret doesn't match the expected public key")]
    MismatchedPublicKeys,

    /// The storage layer failed.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),
}
