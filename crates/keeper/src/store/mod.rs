// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Credential store: one record per account identity.

pub mod memory;
pub mod persist;

use std::fmt;

use serde::{Deserialize, Serialize};
use tokenkeep_wire::{CredentialSource, CredentialStatus, CredentialUploadPayload, CredentialView};

pub use memory::MemoryStore;

/// Errors returned by every store operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    NotFound(u64),
    Invalid(String),
    Persistence(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(id) => write!(f, "credential {id} not found"),
            Self::Invalid(reason) => write!(f, "invalid credential: {reason}"),
            Self::Persistence(reason) => write!(f, "persistence failed: {reason}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// A stored credential.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRecord {
    pub id: u64,
    pub account_identity: String,
    pub account_category: String,
    pub token: String,
    #[serde(default)]
    pub source: CredentialSource,
    /// Client identity of the most recent uploader.
    pub owner: String,
    pub status: CredentialStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
    /// Bumped on every accepted upload.
    pub revision: u64,
    pub created_at: u64,
    pub updated_at: u64,
    #[serde(default)]
    pub last_active_at: Option<u64>,
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("id", &self.id)
            .field("account_identity", &self.account_identity)
            .field("account_category", &self.account_category)
            .field("token", &"<redacted>")
            .field("owner", &self.owner)
            .field("status", &self.status)
            .field("revision", &self.revision)
            .finish_non_exhaustive()
    }
}

impl CredentialRecord {
    /// Token-free view for HTTP responses and agent resync.
    pub fn view(&self) -> CredentialView {
        CredentialView {
            id: self.id,
            account_identity: self.account_identity.clone(),
            account_category: self.account_category.clone(),
            status: self.status,
            status_reason: self.status_reason.clone(),
            source: self.source,
            owner: self.owner.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            last_active_at: self.last_active_at,
        }
    }
}

/// Storage backend for credential records.
/// Result of [`CredentialStore::set_status`].
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub previous: CredentialStatus,
    pub record: CredentialRecord,
}

impl StatusChange {
    /// True when the record just left `active`.
    pub fn deactivated(&self) -> bool {
        self.previous.is_active() && !self.record.status.is_active()
    }
}

#[async_trait::async_trait]
pub trait CredentialStore: Send + Sync {
    /// Insert or replace the record for the upload's account identity.
    ///
    /// Always leaves the record `active` with a fresh revision.
    async fn upsert(
        &self,
        upload: &CredentialUploadPayload,
        owner: &str,
    ) -> Result<CredentialRecord, StoreError>;

    async fn get(&self, id: u64) -> Result<CredentialRecord, StoreError>;

    async fn find_by_account(&self, account_identity: &str) -> Option<CredentialRecord>;

    async fn list(&self, include_inactive: bool) -> Vec<CredentialRecord>;

    async fn list_owned_by(&self, owner: &str) -> Vec<CredentialRecord>;

    async fn find_active(&self) -> Vec<CredentialRecord>;

    /// Set `status` and report what it was before, in one step.
    async fn set_status(
        &self,
        id: u64,
        status: CredentialStatus,
        reason: Option<String>,
    ) -> Result<StatusChange, StoreError>;

    /// Move an active record to `status` only if it is still at `revision`.
    ///
    /// Returns `Ok(false)` when the record was re-uploaded or already left
    /// `active` in the meantime.
    async fn expire_if_unchanged(
        &self,
        id: u64,
        revision: u64,
        status: CredentialStatus,
        reason: &str,
    ) -> Result<bool, StoreError>;

    /// Refresh `lastActiveAt` if the record is still active at `revision`.
    async fn touch_last_active(&self, id: u64, revision: u64) -> Result<bool, StoreError>;

    async fn owner_of(&self, account_identity: &str) -> Option<String>;

    async fn delete(&self, id: u64) -> Result<CredentialRecord, StoreError>;
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
