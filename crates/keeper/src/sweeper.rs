// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Background eviction of channels that stopped sending heartbeats.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::registry::Registry;

/// Call [`Registry::sweep_stale`] every `period` until shutdown.
pub fn spawn_stale_sweeper(
    registry: Arc<Registry>,
    period: Duration,
    threshold: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = timer.tick() => {}
            }

            let evicted = registry.sweep_stale(threshold).await;
            if !evicted.is_empty() {
                tracing::info!(count = evicted.len(), clients = ?evicted, "swept stale channels");
            }
        }
    })
}
