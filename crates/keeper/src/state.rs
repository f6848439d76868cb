// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::authority::Authority;
use crate::config::KeeperConfig;
use crate::dispatcher::Dispatcher;
use crate::prober::Prober;
use crate::registry::Registry;
use crate::store::CredentialStore;

/// Shared keeper state, handed to every handler and background task.
pub struct KeeperState {
    pub config: KeeperConfig,
    pub registry: Arc<Registry>,
    pub store: Arc<dyn CredentialStore>,
    pub dispatcher: Arc<Dispatcher>,
    /// `None` when no remote authority is configured.
    pub prober: Option<Arc<Prober>>,
    pub shutdown: CancellationToken,
}

impl KeeperState {
    pub fn new(
        config: KeeperConfig,
        store: Arc<dyn CredentialStore>,
        authority: Option<Arc<dyn Authority>>,
        shutdown: CancellationToken,
    ) -> Self {
        let registry = Arc::new(Registry::new());
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&registry), Arc::clone(&store)));
        let prober = authority.map(|authority| {
            Arc::new(Prober::new(
                Arc::clone(&store),
                authority,
                Arc::clone(&dispatcher),
                config.probe_concurrency,
            ))
        });
        Self { config, registry, store, dispatcher, prober, shutdown }
    }
}
