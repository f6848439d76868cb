// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;

use tokenkeep_wire::{epoch_ms, CredentialStatus, CredentialUploadPayload};
use tokio::sync::RwLock;

use super::persist::{self, StoreState};
use super::{CredentialRecord, CredentialStore, StatusChange, StoreError};

/// In-memory store, optionally mirrored to a JSON file.
///
/// With a path configured, every mutation is applied to a copy, written to
/// disk, and only then swapped in. A failed write leaves memory unchanged.
pub struct MemoryStore {
    state: RwLock<StoreState>,
    path: Option<PathBuf>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let mut state = StoreState::default();
        state.normalize();
        Self { state: RwLock::new(state), path: None }
    }

    /// Open a store backed by `path`, loading it if it exists.
    pub fn open(path: PathBuf) -> anyhow::Result<Self> {
        let state = if path.exists() {
            let state = persist::load(&path)?;
            tracing::info!(path = %path.display(), records = state.records.len(), "loaded credentials");
            state
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut state = StoreState::default();
            state.normalize();
            state
        };
        Ok(Self { state: RwLock::new(state), path: Some(path) })
    }

    async fn mutate<T>(
        &self,
        f: impl FnOnce(&mut StoreState) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.state.write().await;
        let Some(ref path) = self.path else {
            return f(&mut guard);
        };
        let mut next = guard.clone();
        let out = f(&mut next)?;
        persist::save(path, &next).map_err(|e| {
            tracing::error!(path = %path.display(), err = %e, "failed to persist credentials");
            StoreError::Persistence(format!("{e:#}"))
        })?;
        *guard = next;
        Ok(out)
    }

    async fn select(&self, pred: impl Fn(&CredentialRecord) -> bool) -> Vec<CredentialRecord> {
        self.state.read().await.records.values().filter(|r| pred(r)).cloned().collect()
    }
}

fn record_mut(state: &mut StoreState, id: u64) -> Result<&mut CredentialRecord, StoreError> {
    state.records.get_mut(&id).ok_or(StoreError::NotFound(id))
}

#[async_trait::async_trait]
impl CredentialStore for MemoryStore {
    async fn upsert(
        &self,
        upload: &CredentialUploadPayload,
        owner: &str,
    ) -> Result<CredentialRecord, StoreError> {
        upload.validate().map_err(StoreError::Invalid)?;
        let account = upload.account_identity.trim().to_owned();
        let category = upload.account_category.trim().to_owned();
        let token = upload.token.trim().to_owned();

        self.mutate(|state| {
            let now = epoch_ms();
            let existing = state.records.values_mut().find(|r| r.account_identity == account);
            let record = match existing {
                Some(record) => {
                    record.account_category = category;
                    record.token = token;
                    record.source = upload.source;
                    record.owner = owner.to_owned();
                    record.status = CredentialStatus::Active;
                    record.status_reason = None;
                    record.revision += 1;
                    record.updated_at = now;
                    record.last_active_at = None;
                    record.clone()
                }
                None => {
                    let id = state.next_id;
                    state.next_id += 1;
                    let record = CredentialRecord {
                        id,
                        account_identity: account,
                        account_category: category,
                        token,
                        source: upload.source,
                        owner: owner.to_owned(),
                        status: CredentialStatus::Active,
                        status_reason: None,
                        revision: 1,
                        created_at: now,
                        updated_at: now,
                        last_active_at: None,
                    };
                    state.records.insert(id, record.clone());
                    record
                }
            };
            Ok(record)
        })
        .await
    }

    async fn get(&self, id: u64) -> Result<CredentialRecord, StoreError> {
        self.state.read().await.records.get(&id).cloned().ok_or(StoreError::NotFound(id))
    }

    async fn find_by_account(&self, account_identity: &str) -> Option<CredentialRecord> {
        let state = self.state.read().await;
        state.records.values().find(|r| r.account_identity == account_identity).cloned()
    }

    async fn list(&self, include_inactive: bool) -> Vec<CredentialRecord> {
        self.select(|r| include_inactive || r.status.is_active()).await
    }

    async fn list_owned_by(&self, owner: &str) -> Vec<CredentialRecord> {
        self.select(|r| r.owner == owner).await
    }

    async fn find_active(&self) -> Vec<CredentialRecord> {
        self.select(|r| r.status.is_active()).await
    }

    async fn set_status(
        &self,
        id: u64,
        status: CredentialStatus,
        reason: Option<String>,
    ) -> Result<StatusChange, StoreError> {
        self.mutate(|state| {
            let record = record_mut(state, id)?;
            let previous = record.status;
            record.status = status;
            record.status_reason = if status.is_active() { None } else { reason };
            record.updated_at = epoch_ms();
            Ok(StatusChange { previous, record: record.clone() })
        })
        .await
    }

    async fn expire_if_unchanged(
        &self,
        id: u64,
        revision: u64,
        status: CredentialStatus,
        reason: &str,
    ) -> Result<bool, StoreError> {
        {
            // Cheap pre-check so a stale result never costs a disk write.
            let state = self.state.read().await;
            let record = state.records.get(&id).ok_or(StoreError::NotFound(id))?;
            if record.revision != revision || !record.status.is_active() {
                return Ok(false);
            }
        }
        self.mutate(|state| {
            let record = record_mut(state, id)?;
            if record.revision != revision || !record.status.is_active() {
                return Ok(false);
            }
            record.status = status;
            record.status_reason = Some(reason.to_owned());
            record.updated_at = epoch_ms();
            Ok(true)
        })
        .await
    }

    async fn touch_last_active(&self, id: u64, revision: u64) -> Result<bool, StoreError> {
        self.mutate(|state| {
            let record = record_mut(state, id)?;
            if record.revision != revision || !record.status.is_active() {
                return Ok(false);
            }
            record.last_active_at = Some(epoch_ms());
            Ok(true)
        })
        .await
    }

    async fn owner_of(&self, account_identity: &str) -> Option<String> {
        self.find_by_account(account_identity).await.map(|r| r.owner)
    }

    async fn delete(&self, id: u64) -> Result<CredentialRecord, StoreError> {
        self.mutate(|state| state.records.remove(&id).ok_or(StoreError::NotFound(id))).await
    }
}
