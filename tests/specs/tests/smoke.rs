// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end tests: the real `tokenkeep` binary with in-process agents.

use std::time::Duration;

use tokenkeep_agent::session::{AgentEvent, SessionHandle};
use tokenkeep_agent::SessionState;
use tokenkeep_specs::{free_port, start_agent, FakeAuthority, KeeperProcess};
use tokenkeep_wire::{CredentialSource, CredentialUploadPayload};
use tokio::sync::broadcast;

const TIMEOUT: Duration = Duration::from_secs(15);

fn upload(account: &str, token: &str) -> CredentialUploadPayload {
    CredentialUploadPayload {
        token: token.to_owned(),
        account_identity: account.to_owned(),
        account_category: format!("{account}-network"),
        source: CredentialSource::LocalStorage,
    }
}

async fn wait_event(
    events: &mut broadcast::Receiver<AgentEvent>,
    want: impl Fn(&AgentEvent) -> bool,
) -> anyhow::Result<AgentEvent> {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        let event = tokio::time::timeout_at(deadline, events.recv()).await??;
        if want(&event) {
            return Ok(event);
        }
    }
}

async fn connected(agent: &SessionHandle) -> anyhow::Result<()> {
    agent.connect().await?;
    tokio::time::timeout(TIMEOUT, agent.wait_for(|s| *s == SessionState::Connected)).await??;
    Ok(())
}

async fn agent_credentials(
    keeper: &KeeperProcess,
    identity: &str,
) -> anyhow::Result<serde_json::Value> {
    let url = format!("{}/api/v1/agents/{identity}/credentials", keeper.base_url());
    Ok(reqwest::get(url).await?.json().await?)
}

#[tokio::test]
async fn health_counts_connected_agents() -> anyhow::Result<()> {
    let state = tempfile::tempdir()?;
    let keeper = KeeperProcess::spawn(free_port()?, state.path(), &[])?;
    keeper.wait_healthy(TIMEOUT).await?;

    let agent_dir = tempfile::tempdir()?;
    let agent = start_agent(&keeper.ws_url(), agent_dir.path(), &[])?;
    connected(&agent).await?;

    let health: serde_json::Value =
        reqwest::get(format!("{}/api/v1/health", keeper.base_url())).await?.json().await?;
    assert_eq!(health["status"], "running");
    assert_eq!(health["connections"], 1);
    assert_eq!(health["proberEnabled"], false);

    agent.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn revoked_credential_is_pushed_back_to_owner() -> anyhow::Result<()> {
    let authority = FakeAuthority::default();
    let probe_url = authority.serve().await?;

    let state = tempfile::tempdir()?;
    let keeper = KeeperProcess::spawn(
        free_port()?,
        state.path(),
        &["--probe-url", &probe_url, "--probe-interval-secs", "1"],
    )?;
    keeper.wait_healthy(TIMEOUT).await?;

    let agent_dir = tempfile::tempdir()?;
    let agent = start_agent(&keeper.ws_url(), agent_dir.path(), &[])?;
    let mut events = agent.subscribe();
    connected(&agent).await?;

    agent.upload(upload("alice", "alice-token-0001")).await?;
    wait_event(&mut events, |e| matches!(e, AgentEvent::CredentialAccepted { .. })).await?;

    authority.revoke("alice-token-0001");
    let event =
        wait_event(&mut events, |e| matches!(e, AgentEvent::CredentialInvalid { .. })).await?;
    let AgentEvent::CredentialInvalid { account_identity, reason } = event else {
        anyhow::bail!("unexpected event");
    };
    assert_eq!(account_identity, "alice");
    assert!(reason.contains("liveness check rejected"), "reason: {reason}");

    let creds = agent_credentials(&keeper, agent.identity()).await?;
    assert_eq!(creds[0]["status"], "expired");
    assert!(creds[0].get("token").is_none());
    Ok(())
}

#[tokio::test]
async fn agent_rides_out_keeper_restart() -> anyhow::Result<()> {
    let port = free_port()?;
    let state = tempfile::tempdir()?;
    let mut keeper = KeeperProcess::spawn(port, state.path(), &[])?;
    keeper.wait_healthy(TIMEOUT).await?;

    let agent_dir = tempfile::tempdir()?;
    let agent = start_agent(&keeper.ws_url(), agent_dir.path(), &[])?;
    let mut events = agent.subscribe();
    connected(&agent).await?;
    agent.upload(upload("alice", "alice-token-0001")).await?;
    wait_event(&mut events, |e| matches!(e, AgentEvent::CredentialAccepted { .. })).await?;

    keeper.kill();
    wait_event(&mut events, |e| matches!(e, AgentEvent::Reconnecting { .. })).await?;

    // Queued while the keeper is down.
    agent.upload(upload("bob", "bob-token-00002")).await?;

    let keeper = KeeperProcess::spawn(port, state.path(), &[])?;
    keeper.wait_healthy(TIMEOUT).await?;
    wait_event(&mut events, |e| {
        matches!(e, AgentEvent::CredentialAccepted { account_identity, .. } if account_identity == "bob")
    })
    .await?;
    assert_eq!(agent.state(), SessionState::Connected);

    let creds = agent_credentials(&keeper, agent.identity()).await?;
    let mut accounts: Vec<&str> =
        creds.as_array().into_iter().flatten().filter_map(|c| c["accountIdentity"].as_str()).collect();
    accounts.sort_unstable();
    assert_eq!(accounts, ["alice", "bob"]);
    Ok(())
}

#[tokio::test]
async fn agent_gives_up_when_keeper_is_gone() -> anyhow::Result<()> {
    let agent_dir = tempfile::tempdir()?;
    let url = format!("ws://127.0.0.1:{}/ws", free_port()?);
    let agent = start_agent(&url, agent_dir.path(), &["--max-reconnect-attempts", "2"])?;
    let mut events = agent.subscribe();

    agent.connect().await?;
    wait_event(&mut events, |e| *e == AgentEvent::Failed).await?;
    assert_eq!(agent.state(), SessionState::Failed);
    Ok(())
}
