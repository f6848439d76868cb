// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Typed payloads for each message type. Field names are camelCase on the wire.

use serde::{Deserialize, Serialize};

/// Shortest accepted token.
pub const MIN_TOKEN_LEN: usize = 10;
/// Longest accepted token.
pub const MAX_TOKEN_LEN: usize = 500;
/// Longest accepted account or client identity.
pub const MAX_IDENTITY_LEN: usize = 64;
/// Longest accepted account category.
pub const MAX_CATEGORY_LEN: usize = 32;

/// Where the agent found the credential.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CredentialSource {
    #[default]
    #[serde(rename = "response")]
    Response,
    #[serde(rename = "cookie")]
    Cookie,
    #[serde(rename = "localStorage")]
    LocalStorage,
}

impl CredentialSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Response => "response",
            Self::Cookie => "cookie",
            Self::LocalStorage => "localStorage",
        }
    }
}

/// `register` (client -> server).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    pub client_identity: String,
    #[serde(default)]
    pub version: String,
}

impl RegisterPayload {
    pub fn validate(&self) -> Result<(), String> {
        check_identity("clientIdentity", &self.client_identity)
    }
}

/// `register_ack` (server -> client).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterAckPayload {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// `credential_upload` (client -> server).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialUploadPayload {
    pub token: String,
    pub account_identity: String,
    pub account_category: String,
    #[serde(default)]
    pub source: CredentialSource,
}

// Keeps token values out of logs and panic messages.
impl std::fmt::Debug for CredentialUploadPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialUploadPayload")
            .field("token", &"<redacted>")
            .field("account_identity", &self.account_identity)
            .field("account_category", &self.account_category)
            .field("source", &self.source)
            .finish()
    }
}

impl CredentialUploadPayload {
    /// Check the upload against the accepted token and identity formats.
    pub fn validate(&self) -> Result<(), String> {
        let token = self.token.trim();
        if token.is_empty() {
            return Err("token must not be blank".to_owned());
        }
        let len = token.chars().count();
        if len < MIN_TOKEN_LEN {
            return Err(format!("token must be at least {MIN_TOKEN_LEN} characters"));
        }
        if len > MAX_TOKEN_LEN {
            return Err(format!("token must be at most {MAX_TOKEN_LEN} characters"));
        }
        if !token.chars().all(is_token_char) {
            return Err("token contains characters outside [A-Za-z0-9_-.=+/]".to_owned());
        }
        check_identity("accountIdentity", &self.account_identity)?;
        let category = self.account_category.trim();
        if category.is_empty() {
            return Err("accountCategory must not be blank".to_owned());
        }
        if category.chars().count() > MAX_CATEGORY_LEN {
            return Err(format!("accountCategory must be at most {MAX_CATEGORY_LEN} characters"));
        }
        Ok(())
    }
}

/// `credential_ack` (server -> client).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialAckPayload {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// `heartbeat` (client -> server).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub client_identity: String,
}

/// `credential_expired` and `credential_deleted` (server -> client).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialNotice {
    pub account_identity: String,
    pub reason: String,
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '=' | '+' | '/')
}

fn check_identity(field: &str, value: &str) -> Result<(), String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(format!("{field} must not be blank"));
    }
    if value.chars().count() > MAX_IDENTITY_LEN {
        return Err(format!("{field} must be at most {MAX_IDENTITY_LEN} characters"));
    }
    Ok(())
}
