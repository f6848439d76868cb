// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Harness for end-to-end tests.
//!
//! Spawns the real `tokenkeep` binary as a subprocess, runs agents in
//! process against it, and serves a scriptable remote authority.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Once};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::Router;
use clap::Parser;
use parking_lot::Mutex;
use tokenkeep_agent::config::AgentConfig;
use tokenkeep_agent::session::SessionHandle;

static CRYPTO_INIT: Once = Once::new();

/// Install the ring crypto provider for reqwest/rustls.
pub fn ensure_crypto() {
    CRYPTO_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Resolve the path to the compiled `tokenkeep` binary.
pub fn keeper_binary() -> PathBuf {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    // tests/specs → tests → workspace root
    let workspace = manifest.parent().and_then(|p| p.parent()).unwrap_or(manifest);
    workspace.join("target").join("debug").join("tokenkeep")
}

/// Find a free TCP port by binding to :0 then releasing.
pub fn free_port() -> anyhow::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// A running `tokenkeep` process that is killed on drop.
pub struct KeeperProcess {
    child: Child,
    port: u16,
}

impl KeeperProcess {
    /// Spawn the keeper on `port` with state under `state_dir` plus `extra` flags.
    pub fn spawn(port: u16, state_dir: &Path, extra: &[&str]) -> anyhow::Result<Self> {
        ensure_crypto();
        let binary = keeper_binary();
        anyhow::ensure!(binary.exists(), "tokenkeep binary not found at {}", binary.display());

        let mut args: Vec<String> = vec![
            "--host".into(),
            "127.0.0.1".into(),
            "--port".into(),
            port.to_string(),
            "--state-dir".into(),
            state_dir.to_string_lossy().into_owned(),
            "--log-format".into(),
            "text".into(),
            "--log-level".into(),
            "warn".into(),
        ];
        args.extend(extra.iter().map(|s| s.to_string()));

        let child = Command::new(&binary)
            .args(&args)
            .env_remove("TOKENKEEP_AUTH_TOKEN")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(Self { child, port })
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://127.0.0.1:{}/ws", self.port)
    }

    /// Poll health until responsive.
    pub async fn wait_healthy(&self, timeout: Duration) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        let client = reqwest::Client::new();
        let url = format!("{}/api/v1/health", self.base_url());
        loop {
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("keeper did not become healthy within {timeout:?}");
            }
            if let Ok(resp) = client.get(&url).send().await {
                if resp.status().is_success() {
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Stop the process and wait for it to exit.
    pub fn kill(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for KeeperProcess {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Start an agent session against `ws_url` with fast reconnects. Not yet connected.
pub fn start_agent(ws_url: &str, state_dir: &Path, extra: &[&str]) -> anyhow::Result<SessionHandle> {
    ensure_crypto();
    let state_dir = state_dir.to_string_lossy();
    let mut argv = vec!["tokenkeep-agent", "--server-url", ws_url, "--state-dir", &*state_dir];
    for (flag, value) in [("--reconnect-delay-secs", "1"), ("--max-reconnect-attempts", "10")] {
        if !extra.contains(&flag) {
            argv.extend([flag, value]);
        }
    }
    argv.extend_from_slice(extra);
    let config = AgentConfig::try_parse_from(argv)?;
    config.validate()?;
    tokenkeep_agent::start_session(&config)
}

/// Remote authority that accepts every bearer token except revoked ones.
#[derive(Clone, Default)]
pub struct FakeAuthority {
    revoked: Arc<Mutex<HashSet<String>>>,
}

impl FakeAuthority {
    pub fn revoke(&self, token: &str) {
        self.revoked.lock().insert(token.to_owned());
    }

    /// Serve on an ephemeral port; returns the probe URL.
    pub async fn serve(&self) -> anyhow::Result<String> {
        let app = Router::new().route("/whoami", get(whoami)).with_state(self.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Ok(format!("http://{addr}/whoami"))
    }
}

async fn whoami(State(authority): State<FakeAuthority>, headers: HeaderMap) -> StatusCode {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default();
    let revoked = authority.revoked.lock().contains(token);
    if token.is_empty() || revoked {
        StatusCode::UNAUTHORIZED
    } else {
        StatusCode::OK
    }
}
