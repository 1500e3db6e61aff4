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

//! A no-network implementation of Matrix end-to-end encryption.
//!
//! This crate implements the client-side state machines that Matrix
//! end-to-end encryption needs: Olm sessions for encrypted device-to-device
//! messaging, Megolm sessions for encrypted rooms, interactive device
//! verification, server-side key backups, secret storage and gossiping, and
//! room key import/export.
//!
//! The main entry point is the [`OlmMachine`]. It doesn't do any networking
//! on its own; the caller feeds it to-device events and key counts received
//! from the homeserver, and sends out the requests it produces.

#![warn(
    missing_debug_implementations,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications
)]

pub mod backups;
mod ciphers;
mod error;
mod export;
mod gossiping;
mod identities;
mod key_provider;
mod machine;
pub mod olm;
mod secret_storage;
mod session_manager;
pub mod store;
pub mod types;
mod verification;

pub use error::{
    EventError, MegolmError, MegolmResult, OlmError, OlmResult, SecretImportError,
    SessionCreationError, SignatureError,
};
pub use export::{decrypt_room_key_export, encrypt_room_key_export, KeyExportError};
pub use gossiping::{GossipRequest, GossippedSecret, RoomKeyRequestInfo, SecretInfo};
pub use identities::{Device, DeviceChanges, LocalTrust};
pub use key_provider::DeviceKeyProvider;
pub use machine::{DecryptedRoomEvent, KeysForUpload, OlmMachine, RoomKeyImportResult};
pub use olm::EncryptionSettings;
pub use secret_storage::{
    AesHmacSha2EncryptedData, PassphraseInfo, SecretStorageError, SecretStorageKey,
};
pub use verification::{
    CancelCode, CancelInfo, Emoji, FlowId, QrCodeData, QrCodeDecodeError, QrMode, QrVerification,
    QrVerificationState, Sas, SasState, Verification, VerificationMachine, VerificationRequest,
    VerificationRequestState,
};
