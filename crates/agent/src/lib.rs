// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tokenkeep agent: the client half of the credential channel.
//!
//! The agent keeps one channel open to the keeper, uploads credentials it is
//! handed, and reports when the keeper says one of them stopped working.

pub mod config;
pub mod identity;
pub mod session;
pub mod transport;

use std::sync::Arc;

use tokenkeep_wire::CredentialUploadPayload;
use tokio::io::AsyncBufReadExt;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::session::{spawn_session, AgentEvent, SessionHandle};
use crate::transport::{HttpStatusClient, WsConnector};

pub use crate::session::{SessionConfig, SessionError, SessionState};

/// Install the process-wide rustls provider. Safe to call more than once.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Build a session for `config` without connecting it.
pub fn start_session(config: &AgentConfig) -> anyhow::Result<SessionHandle> {
    let identity = identity::load_or_create(&config.state_dir)?;
    let connector = Arc::new(WsConnector::new(config.channel_url()));
    let status = Arc::new(HttpStatusClient::new(config.api_base(), config.auth_token.clone())?);
    Ok(spawn_session(identity, config.session_config(), connector, status))
}

/// Run the agent until Ctrl-C or end of input.
///
/// Each stdin line is a JSON `credential_upload` payload.
pub async fn run(config: AgentConfig) -> anyhow::Result<()> {
    let session = start_session(&config)?;
    tracing::info!(client = %session.identity(), server = %config.server_url, "starting agent");

    let shutdown = CancellationToken::new();
    tokio::spawn(log_events(session.clone(), shutdown.clone()));
    session.connect().await?;

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
            line = lines.next_line() => match line? {
                Some(line) => submit(&session, &line).await,
                // Input closed; keep the channel up until interrupted.
                None => {
                    let _ = tokio::signal::ctrl_c().await;
                    break;
                }
            },
        }
    }

    session.disconnect().await?;
    shutdown.cancel();
    Ok(())
}

async fn submit(session: &SessionHandle, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let upload: CredentialUploadPayload = match serde_json::from_str(line) {
        Ok(upload) => upload,
        Err(e) => {
            tracing::warn!(err = %e, "ignoring unreadable upload line");
            return;
        }
    };
    let account = upload.account_identity.clone();
    match session.upload(upload).await {
        Ok(()) => tracing::info!(%account, state = %session.state(), "upload accepted for delivery"),
        Err(e) => tracing::warn!(%account, err = %e, "upload refused"),
    }
}

async fn log_events(session: SessionHandle, shutdown: CancellationToken) {
    let mut events = session.subscribe();
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => return,
            event = events.recv() => event,
        };
        match event {
            Ok(event @ (AgentEvent::CredentialInvalid { .. } | AgentEvent::CredentialRejected { .. })) => {
                tracing::warn!(?event, "{event}");
            }
            Ok(event @ AgentEvent::Failed) => tracing::error!("{event}"),
            Ok(event) => tracing::info!(?event, "{event}"),
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "event log fell behind");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        }
    }
}
