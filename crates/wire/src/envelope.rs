// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Message envelope, the closed set of message types, and typed decoding.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::epoch_ms;
use crate::payload::{
    CredentialAckPayload, CredentialNotice, CredentialUploadPayload, HeartbeatPayload,
    RegisterAckPayload, RegisterPayload,
};

/// Every message type that may appear on an agent channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Register,
    RegisterAck,
    CredentialUpload,
    CredentialAck,
    Heartbeat,
    Pong,
    CredentialExpired,
    CredentialDeleted,
}

impl MessageType {
    pub const ALL: [MessageType; 8] = [
        Self::Register,
        Self::RegisterAck,
        Self::CredentialUpload,
        Self::CredentialAck,
        Self::Heartbeat,
        Self::Pong,
        Self::CredentialExpired,
        Self::CredentialDeleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::RegisterAck => "register_ack",
            Self::CredentialUpload => "credential_upload",
            Self::CredentialAck => "credential_ack",
            Self::Heartbeat => "heartbeat",
            Self::Pong => "pong",
            Self::CredentialExpired => "credential_expired",
            Self::CredentialDeleted => "credential_deleted",
        }
    }

    /// Look up a type by its wire name.
    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }

    /// True for types the server sends to agents.
    pub fn is_server_to_client(&self) -> bool {
        matches!(
            self,
            Self::RegisterAck
                | Self::CredentialAck
                | Self::Pong
                | Self::CredentialExpired
                | Self::CredentialDeleted
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an incoming frame could not be turned into a [`Message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Not JSON, not an object, or missing/mistyped envelope fields.
    Malformed(String),
    /// Well-formed envelope whose `type` is outside the closed set.
    UnknownType(String),
    /// Known type whose payload does not match its schema.
    InvalidPayload { kind: MessageType, reason: String },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(reason) => write!(f, "malformed envelope: {reason}"),
            Self::UnknownType(kind) => write!(f, "unknown message type: {kind}"),
            Self::InvalidPayload { kind, reason } => {
                write!(f, "invalid {kind} payload: {reason}")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

/// The unit exchanged on a channel in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub payload: Value,
    pub timestamp: u64,
}

impl Envelope {
    /// Build an envelope stamped with the current time.
    pub fn new(kind: MessageType, payload: Value) -> Self {
        Self { kind, payload, timestamp: epoch_ms() }
    }

    /// Parse a text frame.
    ///
    /// Unknown types are reported separately from structural problems so the
    /// receiver can log them distinctly; both are dropped by callers.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let Value::Object(mut obj) = value else {
            return Err(ProtocolError::Malformed("envelope is not an object".to_owned()));
        };

        let kind = match obj.get("type") {
            Some(Value::String(name)) => MessageType::from_wire(name)
                .ok_or_else(|| ProtocolError::UnknownType(name.clone()))?,
            Some(_) => return Err(ProtocolError::Malformed("type is not a string".to_owned())),
            None => return Err(ProtocolError::Malformed("missing type".to_owned())),
        };

        let timestamp = match obj.get("timestamp") {
            Some(ts) => ts
                .as_u64()
                .ok_or_else(|| ProtocolError::Malformed("timestamp is not an integer".to_owned()))?,
            None => return Err(ProtocolError::Malformed("missing timestamp".to_owned())),
        };

        let payload = match obj.remove("payload") {
            Some(p @ Value::Object(_)) => p,
            Some(_) => return Err(ProtocolError::Malformed("payload is not an object".to_owned())),
            None => return Err(ProtocolError::Malformed("missing payload".to_owned())),
        };

        Ok(Self { kind, payload, timestamp })
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Decode the payload according to the envelope type.
    pub fn decode(&self) -> Result<Message, ProtocolError> {
        let msg = match self.kind {
            MessageType::Register => Message::Register(self.payload_as()?),
            MessageType::RegisterAck => Message::RegisterAck(self.payload_as()?),
            MessageType::CredentialUpload => Message::CredentialUpload(self.payload_as()?),
            MessageType::CredentialAck => Message::CredentialAck(self.payload_as()?),
            MessageType::Heartbeat => Message::Heartbeat(self.payload_as()?),
            MessageType::Pong => Message::Pong,
            MessageType::CredentialExpired => Message::CredentialExpired(self.payload_as()?),
            MessageType::CredentialDeleted => Message::CredentialDeleted(self.payload_as()?),
        };
        Ok(msg)
    }

    fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        T::deserialize(&self.payload).map_err(|e| ProtocolError::InvalidPayload {
            kind: self.kind,
            reason: e.to_string(),
        })
    }
}

/// A decoded envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Register(RegisterPayload),
    RegisterAck(RegisterAckPayload),
    CredentialUpload(CredentialUploadPayload),
    CredentialAck(CredentialAckPayload),
    Heartbeat(HeartbeatPayload),
    Pong,
    CredentialExpired(CredentialNotice),
    CredentialDeleted(CredentialNotice),
}

impl Message {
    pub fn kind(&self) -> MessageType {
        match self {
            Self::Register(_) => MessageType::Register,
            Self::RegisterAck(_) => MessageType::RegisterAck,
            Self::CredentialUpload(_) => MessageType::CredentialUpload,
            Self::CredentialAck(_) => MessageType::CredentialAck,
            Self::Heartbeat(_) => MessageType::Heartbeat,
            Self::Pong => MessageType::Pong,
            Self::CredentialExpired(_) => MessageType::CredentialExpired,
            Self::CredentialDeleted(_) => MessageType::CredentialDeleted,
        }
    }

    /// Wrap into an envelope stamped with the current time.
    pub fn into_envelope(self) -> Envelope {
        let kind = self.kind();
        let payload = match self {
            Self::Register(p) => serde_json::to_value(p),
            Self::RegisterAck(p) => serde_json::to_value(p),
            Self::CredentialUpload(p) => serde_json::to_value(p),
            Self::CredentialAck(p) => serde_json::to_value(p),
            Self::Heartbeat(p) => serde_json::to_value(p),
            Self::Pong => Ok(Value::Object(serde_json::Map::new())),
            Self::CredentialExpired(p) | Self::CredentialDeleted(p) => serde_json::to_value(p),
        };
        // Payload structs only hold strings, bools and integers.
        let payload = payload.unwrap_or_else(|_| Value::Object(serde_json::Map::new()));
        Envelope::new(kind, payload)
    }
}

impl From<Message> for Envelope {
    fn from(msg: Message) -> Self {
        msg.into_envelope()
    }
}

#[cfg(test)]
#[path = "envelope_tests.rs"]
mod tests;
