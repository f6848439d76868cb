// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Liveness prober: periodically re-validates every active credential
//! against the remote authority.
//!
//! - Only `active` records are checked. `expired` and `invalid` wait for a
//!   fresh upload.
//! - Checks run concurrently up to a fixed cap, and a record is never
//!   checked again while its previous check is still in flight.
//! - Transport errors leave the record `active`. Only an explicit
//!   rejection expires it, and only if nobody re-uploaded in the meantime.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokenkeep_wire::{epoch_ms, CredentialStatus};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::authority::{Authority, ProbeOutcome};
use crate::dispatcher::Dispatcher;
use crate::store::{CredentialRecord, CredentialStore};

/// Default maximum number of checks in flight.
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Summary of one scan.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub total: usize,
    pub alive: usize,
    pub expired: usize,
    pub unreachable: usize,
    pub store_errors: usize,
    /// Already in flight from an earlier scan, or re-uploaded mid-check.
    pub skipped: usize,
}

/// Cumulative counters since startup.
#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProberStats {
    pub cycles: u64,
    pub checks: u64,
    pub alive: u64,
    pub expired: u64,
    pub failures: u64,
    pub last_cycle_at: Option<u64>,
    pub last_report: Option<CycleReport>,
}

/// What happened to one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    Alive,
    Expired,
    Unreachable,
    StoreError,
    Superseded,
}

pub struct Prober {
    store: Arc<dyn CredentialStore>,
    authority: Arc<dyn Authority>,
    dispatcher: Arc<Dispatcher>,
    permits: Semaphore,
    in_flight: Arc<Mutex<HashSet<u64>>>,
    stats: Mutex<ProberStats>,
}

/// Holds a record's in-flight slot until dropped.
struct InFlight {
    set: Arc<Mutex<HashSet<u64>>>,
    id: u64,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set.lock().remove(&self.id);
    }
}

impl Prober {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        authority: Arc<dyn Authority>,
        dispatcher: Arc<Dispatcher>,
        concurrency: usize,
    ) -> Self {
        Self {
            store,
            authority,
            dispatcher,
            permits: Semaphore::new(concurrency.max(1)),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            stats: Mutex::new(ProberStats::default()),
        }
    }

    fn claim(&self, id: u64) -> Option<InFlight> {
        if self.in_flight.lock().insert(id) {
            Some(InFlight { set: Arc::clone(&self.in_flight), id })
        } else {
            None
        }
    }

    pub fn stats(&self) -> ProberStats {
        self.stats.lock().clone()
    }

    /// Check every active record once and wait for all checks to finish.
    pub async fn run_cycle(self: &Arc<Self>) -> CycleReport {
        let records = self.store.find_active().await;
        let mut report = CycleReport { total: records.len(), ..Default::default() };
        let mut handles = Vec::with_capacity(records.len());

        for record in records {
            let Some(slot) = self.claim(record.id) else {
                tracing::debug!(record = record.id, "check already in flight, skipping");
                report.skipped += 1;
                continue;
            };
            let prober = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                let _slot = slot;
                let _permit = prober.permits.acquire().await;
                prober.probe_one(&record).await
            }));
        }

        for h in handles {
            match h.await {
                Ok(ProbeResult::Alive) => report.alive += 1,
                Ok(ProbeResult::Expired) => report.expired += 1,
                Ok(ProbeResult::Unreachable) => report.unreachable += 1,
                Ok(ProbeResult::StoreError) => report.store_errors += 1,
                Ok(ProbeResult::Superseded) => report.skipped += 1,
                Err(e) => {
                    tracing::error!(err = %e, "probe task failed");
                    report.store_errors += 1;
                }
            }
        }

        {
            let mut stats = self.stats.lock();
            stats.cycles += 1;
            stats.checks += (report.alive + report.expired + report.unreachable) as u64;
            stats.alive += report.alive as u64;
            stats.expired += report.expired as u64;
            stats.failures += (report.unreachable + report.store_errors) as u64;
            stats.last_cycle_at = Some(epoch_ms());
            stats.last_report = Some(report.clone());
        }
        tracing::info!(
            total = report.total,
            alive = report.alive,
            expired = report.expired,
            unreachable = report.unreachable,
            store_errors = report.store_errors,
            skipped = report.skipped,
            "liveness scan complete"
        );
        report
    }

    /// Check one record and apply the result.
    pub async fn probe_one(&self, record: &CredentialRecord) -> ProbeResult {
        let id = record.id;
        let account = record.account_identity.as_str();

        match self.authority.check(&record.token, &record.account_category).await {
            ProbeOutcome::Alive => match self.store.touch_last_active(id, record.revision).await {
                Ok(true) => {
                    tracing::debug!(record = id, account, "credential alive");
                    ProbeResult::Alive
                }
                Ok(false) => {
                    tracing::debug!(record = id, account, "record changed during check");
                    ProbeResult::Superseded
                }
                Err(e) => {
                    tracing::warn!(record = id, account, err = %e, "failed to record liveness");
                    ProbeResult::StoreError
                }
            },
            ProbeOutcome::AuthFailed(detail) => {
                let reason = format!("liveness check rejected by remote authority: {detail}");
                match self
                    .store
                    .expire_if_unchanged(id, record.revision, CredentialStatus::Expired, &reason)
                    .await
                {
                    Ok(true) => {
                        tracing::info!(record = id, account, %reason, "credential expired");
                        self.dispatcher.notify_expired(account, &reason).await;
                        ProbeResult::Expired
                    }
                    Ok(false) => {
                        tracing::debug!(record = id, account, "credential changed during check");
                        ProbeResult::Superseded
                    }
                    Err(e) => {
                        tracing::warn!(record = id, account, err = %e, "failed to expire credential");
                        ProbeResult::StoreError
                    }
                }
            }
            ProbeOutcome::TransportError(e) => {
                tracing::warn!(record = id, account, err = %e, "authority unreachable, leaving credential active");
                ProbeResult::Unreachable
            }
        }
    }
}

/// Spawn the periodic scan. The first scan runs one `interval` after start.
pub fn spawn_prober(
    prober: Arc<Prober>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + interval;
        let mut timer = tokio::time::interval_at(start, interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = timer.tick() => {}
            }
            prober.run_cycle().await;
        }
    })
}

#[cfg(test)]
#[path = "prober_tests.rs"]
mod tests;
