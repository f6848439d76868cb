// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

use crate::session::SessionConfig;

/// Tokenkeep agent: keeps one channel open to the keeper and uploads credentials.
#[derive(Debug, Clone, clap::Parser)]
#[command(name = "tokenkeep-agent", version, about)]
pub struct AgentConfig {
    /// Keeper channel URL.
    #[arg(long, default_value = "ws://127.0.0.1:8080/ws", env = "TOKENKEEP_AGENT_SERVER_URL")]
    pub server_url: String,

    /// Keeper HTTP base URL for resync. Derived from --server-url if unset.
    #[arg(long, env = "TOKENKEEP_AGENT_API_URL")]
    pub api_url: Option<String>,

    /// Token for the keeper API and channel.
    #[arg(long, env = "TOKENKEEP_AGENT_AUTH_TOKEN")]
    pub auth_token: Option<String>,

    /// Directory holding the persisted client identity.
    #[arg(long, default_value = ".tokenkeep", env = "TOKENKEEP_AGENT_STATE_DIR")]
    pub state_dir: PathBuf,

    /// Heartbeat interval in seconds.
    #[arg(long, default_value_t = 30, env = "TOKENKEEP_AGENT_HEARTBEAT_SECS")]
    pub heartbeat_secs: u64,

    /// Fixed delay between reconnect attempts, in seconds.
    #[arg(long, default_value_t = 5, env = "TOKENKEEP_AGENT_RECONNECT_DELAY_SECS")]
    pub reconnect_delay_secs: u64,

    /// Reconnect attempts before giving up.
    #[arg(long, default_value_t = 3, env = "TOKENKEEP_AGENT_MAX_RECONNECT_ATTEMPTS")]
    pub max_reconnect_attempts: u32,

    /// Seconds allowed for opening the channel.
    #[arg(long, default_value_t = 10, env = "TOKENKEEP_AGENT_HANDSHAKE_TIMEOUT_SECS")]
    pub handshake_timeout_secs: u64,

    /// Seconds to wait for `register_ack` and `credential_ack`.
    #[arg(long, default_value_t = 10, env = "TOKENKEEP_AGENT_ACK_TIMEOUT_SECS")]
    pub ack_timeout_secs: u64,

    /// Uploads held while disconnected.
    #[arg(long, default_value_t = 100, env = "TOKENKEEP_AGENT_QUEUE_CAPACITY")]
    pub queue_capacity: usize,

    /// Version string sent in `register`.
    #[arg(long, default_value = env!("CARGO_PKG_VERSION"), env = "TOKENKEEP_AGENT_VERSION")]
    pub agent_version: String,

    /// Log format (json or text).
    #[arg(long, default_value = "json", env = "TOKENKEEP_AGENT_LOG_FORMAT")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "TOKENKEEP_AGENT_LOG_LEVEL")]
    pub log_level: String,
}

impl AgentConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.server_url.starts_with("ws://") {
            anyhow::bail!("--server-url must be a ws:// URL");
        }
        if self.heartbeat_secs == 0 {
            anyhow::bail!("--heartbeat-secs must be greater than zero");
        }
        if self.ack_timeout_secs == 0 || self.handshake_timeout_secs == 0 {
            anyhow::bail!("timeouts must be greater than zero");
        }
        if self.queue_capacity == 0 {
            anyhow::bail!("--queue-capacity must be greater than zero");
        }
        if let Some(ref api) = self.api_url {
            if !api.starts_with("http://") && !api.starts_with("https://") {
                anyhow::bail!("--api-url must be an http(s) URL");
            }
        }
        match self.log_format.as_str() {
            "json" | "text" => {}
            other => anyhow::bail!("invalid log format: {other}"),
        }
        Ok(())
    }

    /// Channel URL including the `token` query parameter when configured.
    pub fn channel_url(&self) -> String {
        match self.auth_token {
            Some(ref token) => {
                let sep = if self.server_url.contains('?') { '&' } else { '?' };
                format!("{}{sep}token={token}", self.server_url)
            }
            None => self.server_url.clone(),
        }
    }

    /// HTTP base URL of the keeper API.
    pub fn api_base(&self) -> String {
        if let Some(ref api) = self.api_url {
            return api.trim_end_matches('/').to_owned();
        }
        let rest = self.server_url.strip_prefix("ws://").unwrap_or(&self.server_url);
        let host = rest.split('/').next().unwrap_or(rest);
        format!("http://{host}")
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            version: self.agent_version.clone(),
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
            reconnect_delay: Duration::from_secs(self.reconnect_delay_secs),
            max_reconnect_attempts: self.max_reconnect_attempts,
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            ack_timeout: Duration::from_secs(self.ack_timeout_secs),
            queue_capacity: self.queue_capacity,
        }
    }
}
