// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tokenkeep wire format shared by the server and its agents.
//!
//! Every frame on an agent channel is an [`Envelope`]:
//! `{ "type": string, "payload": object, "timestamp": integer-millis }`.
//! The timestamp is sender-local and only used for diagnostics; ordering is
//! whatever order the channel delivers frames in.

pub mod credential;
pub mod envelope;
pub mod payload;

pub use credential::{CredentialStatus, CredentialView};
pub use envelope::{Envelope, Message, MessageType, ProtocolError};
pub use payload::{
    CredentialAckPayload, CredentialNotice, CredentialSource, CredentialUploadPayload,
    HeartbeatPayload, RegisterAckPayload, RegisterPayload,
};

/// Return current epoch millis.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
