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

//! The wrappers around the vodozemac Olm and Megolm primitives.

mod account;
mod group_sessions;
mod session;

pub use account::{Account, InboundCreationResult, OlmMessageHash, PickledAccount, StaticAccountData};
pub use group_sessions::{
    BackedUpRoomKey, EncryptionSettings, ExportedRoomKey, InboundGroupSession,
    OutboundGroupSession, PickledInboundGroupSession, PickledOutboundGroupSession,
    SessionCreatorInfo, ShareInfo, ShareState,
};
pub use session::{PickledSession, Session};
