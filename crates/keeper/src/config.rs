// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

/// Credential keeper: agent channel registry and liveness prober.
#[derive(Debug, Clone, clap::Parser)]
#[command(name = "tokenkeep", version, about)]
pub struct KeeperConfig {
    /// Host to bind on.
    #[arg(long, default_value = "127.0.0.1", env = "TOKENKEEP_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8080, env = "TOKENKEEP_PORT")]
    pub port: u16,

    /// Bearer token for the HTTP API (`?token=` on `/ws`). If unset, auth is disabled.
    #[arg(long, env = "TOKENKEEP_AUTH_TOKEN")]
    pub auth_token: Option<String>,

    /// Accept connections from any address instead of loopback/LAN only.
    #[arg(long, env = "TOKENKEEP_ALLOW_REMOTE")]
    pub allow_remote: bool,

    /// Expected agent heartbeat interval in seconds. Also the sweep period.
    #[arg(long, default_value_t = 30, env = "TOKENKEEP_HEARTBEAT_SECS")]
    pub heartbeat_secs: u64,

    /// Evict channels silent for longer than this. Defaults to twice the heartbeat interval.
    #[arg(long, env = "TOKENKEEP_STALE_AFTER_SECS")]
    pub stale_after_secs: Option<u64>,

    /// Seconds a new channel has to send `register` before it is closed.
    #[arg(long, default_value_t = 10, env = "TOKENKEEP_HANDSHAKE_TIMEOUT_SECS")]
    pub handshake_timeout_secs: u64,

    /// Liveness scan interval in seconds.
    #[arg(long, default_value_t = 300, env = "TOKENKEEP_PROBE_INTERVAL_SECS")]
    pub probe_interval_secs: u64,

    /// Maximum liveness checks in flight against the remote authority.
    #[arg(long, default_value_t = 8, env = "TOKENKEEP_PROBE_CONCURRENCY")]
    pub probe_concurrency: usize,

    /// Per-request timeout for liveness checks, in seconds.
    #[arg(long, default_value_t = 30, env = "TOKENKEEP_PROBE_TIMEOUT_SECS")]
    pub probe_timeout_secs: u64,

    /// Path to a JSON file describing how to probe each account category.
    #[arg(long, env = "TOKENKEEP_AUTHORITY_CONFIG")]
    pub authority_config: Option<PathBuf>,

    /// Single probe URL used for every category (GET with a bearer token).
    #[arg(long, env = "TOKENKEEP_PROBE_URL")]
    pub probe_url: Option<String>,

    /// Directory for persisted credential state. In-memory only if unset.
    #[arg(long, env = "TOKENKEEP_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Log format (json or text).
    #[arg(long, default_value = "json", env = "TOKENKEEP_LOG_FORMAT")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "TOKENKEEP_LOG_LEVEL")]
    pub log_level: String,
}

impl KeeperConfig {
    /// Validate the configuration after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.heartbeat_secs == 0 {
            anyhow::bail!("--heartbeat-secs must be greater than zero");
        }
        if let Some(stale) = self.stale_after_secs {
            if stale < self.heartbeat_secs {
                anyhow::bail!("--stale-after-secs must be at least --heartbeat-secs");
            }
        }
        if self.probe_interval_secs == 0 {
            anyhow::bail!("--probe-interval-secs must be greater than zero");
        }
        if self.probe_concurrency == 0 {
            anyhow::bail!("--probe-concurrency must be greater than zero");
        }
        if self.authority_config.is_some() && self.probe_url.is_some() {
            anyhow::bail!("cannot specify both --authority-config and --probe-url");
        }
        match self.log_format.as_str() {
            "json" | "text" => {}
            other => anyhow::bail!("invalid log format: {other}"),
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs.unwrap_or(self.heartbeat_secs * 2))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// Path of the persisted credential file, if persistence is enabled.
    pub fn store_path(&self) -> Option<PathBuf> {
        self.state_dir.as_ref().map(|dir| dir.join("credentials.json"))
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
