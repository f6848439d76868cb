// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tokenkeep: credential keeper for a fleet of agents.
//!
//! Agents hold one channel each and upload the credentials they find. The
//! keeper stores them, re-validates active ones against a remote authority,
//! and pushes expiry notices back to the owning agent when it can.

pub mod authority;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod prober;
pub mod registry;
pub mod state;
pub mod store;
pub mod sweeper;
pub mod transport;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::authority::{Authority, AuthorityConfig, HttpAuthority};
use crate::config::KeeperConfig;
use crate::prober::spawn_prober;
use crate::state::KeeperState;
use crate::store::{CredentialStore, MemoryStore};
use crate::sweeper::spawn_stale_sweeper;
use crate::transport::build_router;

/// Install the process-wide rustls provider. Safe to call more than once.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Build the remote authority from config, if one is configured.
pub fn build_authority(config: &KeeperConfig) -> anyhow::Result<Option<Arc<dyn Authority>>> {
    let authority_config = match (&config.authority_config, &config.probe_url) {
        (Some(path), _) => AuthorityConfig::load(path)?,
        (None, Some(url)) => AuthorityConfig::single(url.clone()),
        (None, None) => return Ok(None),
    };
    let authority = HttpAuthority::new(authority_config, config.probe_timeout())?;
    Ok(Some(Arc::new(authority)))
}

/// Start background tasks for `state`: stale sweeper and, if configured, the prober.
pub fn spawn_background(state: &Arc<KeeperState>) {
    spawn_stale_sweeper(
        Arc::clone(&state.registry),
        state.config.heartbeat_interval(),
        state.config.stale_threshold(),
        state.shutdown.clone(),
    );
    if let Some(ref prober) = state.prober {
        spawn_prober(Arc::clone(prober), state.config.probe_interval(), state.shutdown.clone());
    }
}

/// Serve on an already bound listener until `state.shutdown` fires.
pub async fn serve(listener: TcpListener, state: Arc<KeeperState>) -> anyhow::Result<()> {
    let shutdown = state.shutdown.clone();
    let router = build_router(state);
    axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

/// Run the keeper until Ctrl-C.
pub async fn run(config: KeeperConfig) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let shutdown = CancellationToken::new();

    let store: Arc<dyn CredentialStore> = match config.store_path() {
        Some(path) => Arc::new(MemoryStore::open(path)?),
        None => Arc::new(MemoryStore::new()),
    };
    let authority = build_authority(&config)?;
    if authority.is_none() {
        tracing::warn!("no remote authority configured, liveness prober disabled");
    }

    let state = Arc::new(KeeperState::new(config, store, authority, shutdown.clone()));
    spawn_background(&state);

    {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let closed = state.registry.close_all("server shutting down").await;
                tracing::info!(closed, "shutting down");
                state.shutdown.cancel();
            }
        });
    }

    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(
        "tokenkeep listening on {addr} (prober {})",
        if state.prober.is_some() { "enabled" } else { "disabled" }
    );
    serve(listener, state).await
}
