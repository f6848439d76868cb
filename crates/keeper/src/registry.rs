// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Connection registry: at most one live channel per client identity.
//!
//! The registry is passive. It never runs timers of its own; the stale
//! sweeper in [`crate::sweeper`] drives [`Registry::sweep_stale`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokenkeep_wire::{epoch_ms, Envelope};
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Close code for a normal close (replacement, explicit unregister).
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code for heartbeat eviction and server shutdown.
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Close code for a handshake that broke protocol.
pub const CLOSE_POLICY: u16 = 1008;

/// Upper bound on how long a directed send may wait for queue space.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Item queued for a channel's writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
    Frame(Envelope),
    Close { code: u16, reason: String },
}

/// Write half of a live channel, as seen by the registry.
///
/// The transport owns the matching receiver and drains it into the socket.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    tx: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
}

impl ChannelHandle {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx, cancel: CancellationToken::new() }, rx)
    }

    /// Queue a frame. Returns false if the channel is closed or the writer
    /// stayed blocked past the send timeout.
    pub async fn send(&self, envelope: Envelope) -> bool {
        if self.is_closed() {
            return false;
        }
        self.tx.send_timeout(Outbound::Frame(envelope), SEND_TIMEOUT).await.is_ok()
    }

    /// Ask the writer to send a close frame. Falls back to cancelling the
    /// channel outright when the queue is full or gone.
    pub fn close(&self, code: u16, reason: &str) {
        if self.cancel.is_cancelled() {
            return;
        }
        let close = Outbound::Close { code, reason: reason.to_owned() };
        if self.tx.try_send(close).is_err() {
            self.cancel.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// A registered agent channel.
#[derive(Debug)]
pub struct Connection {
    pub id: u64,
    pub channel: ChannelHandle,
    pub version: String,
    /// Epoch millis.
    pub connected_at: u64,
    pub last_heartbeat: Instant,
}

/// Serializable summary of a connection for the management API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub client_identity: String,
    pub connection_id: u64,
    pub version: String,
    pub connected_at: u64,
    pub idle_ms: u64,
}

#[derive(Debug)]
pub struct Registry {
    connections: RwLock<HashMap<String, Connection>>,
    next_id: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self { connections: RwLock::new(HashMap::new()), next_id: AtomicU64::new(1) }
    }

    /// Admit a channel for `identity`, closing any channel it replaces.
    ///
    /// Returns the connection id the caller must present to [`Self::release`].
    pub async fn register(&self, identity: &str, version: &str, channel: ChannelHandle) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut connections = self.connections.write().await;
        if let Some(old) = connections.remove(identity) {
            tracing::info!(client = %identity, old = old.id, new = id, "replacing existing channel");
            old.channel.close(CLOSE_NORMAL, "replaced by a newer connection");
        }
        connections.insert(
            identity.to_owned(),
            Connection {
                id,
                channel,
                version: version.to_owned(),
                connected_at: epoch_ms(),
                last_heartbeat: Instant::now(),
            },
        );
        tracing::info!(client = %identity, conn = id, total = connections.len(), "channel registered");
        id
    }

    /// Remove and close the channel for `identity`. No-op if absent.
    pub async fn unregister(&self, identity: &str) -> bool {
        let removed = self.connections.write().await.remove(identity);
        match removed {
            Some(conn) => {
                conn.channel.close(CLOSE_NORMAL, "unregistered");
                tracing::info!(client = %identity, conn = conn.id, "channel unregistered");
                true
            }
            None => false,
        }
    }

    /// Remove the entry for `identity` only if it is still connection `conn_id`.
    ///
    /// Used by a channel's own handler on exit so that a replaced handler
    /// never tears down its successor.
    pub async fn release(&self, identity: &str, conn_id: u64) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get(identity) {
            Some(conn) if conn.id == conn_id => {
                connections.remove(identity);
                tracing::debug!(client = %identity, conn = conn_id, "channel released");
                true
            }
            _ => false,
        }
    }

    /// Refresh the heartbeat clock. Unknown identities are ignored.
    pub async fn touch_heartbeat(&self, identity: &str) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get_mut(identity) {
            Some(conn) => {
                conn.last_heartbeat = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Directed send. False when nobody is connected as `identity` or the
    /// write could not be queued. A channel that fails a write is released
    /// and closed, so its handler exits and the agent reconnects.
    pub async fn send(&self, identity: &str, envelope: Envelope) -> bool {
        let target = {
            let connections = self.connections.read().await;
            connections.get(identity).map(|c| (c.id, c.channel.clone()))
        };
        let Some((conn_id, channel)) = target else {
            tracing::debug!(client = %identity, kind = %envelope.kind, "no live channel");
            return false;
        };
        if channel.send(envelope).await {
            return true;
        }
        tracing::warn!(client = %identity, conn = conn_id, "send failed, closing channel");
        self.release(identity, conn_id).await;
        channel.close(CLOSE_GOING_AWAY, "send failed");
        false
    }

    /// Send to every live channel. Returns how many accepted the write.
    pub async fn broadcast(&self, envelope: Envelope) -> usize {
        let targets: Vec<_> = {
            let connections = self.connections.read().await;
            connections.iter().map(|(k, c)| (k.clone(), c.id, c.channel.clone())).collect()
        };

        let sends = targets.iter().map(|(_, _, channel)| channel.send(envelope.clone()));
        let results = futures_util::future::join_all(sends).await;

        let mut delivered = 0;
        for ((identity, conn_id, channel), ok) in targets.iter().zip(results) {
            if ok {
                delivered += 1;
            } else {
                self.release(identity, *conn_id).await;
                channel.close(CLOSE_GOING_AWAY, "send failed");
            }
        }
        tracing::debug!(kind = %envelope.kind, delivered, total = targets.len(), "broadcast");
        delivered
    }

    /// Evict every connection whose last heartbeat is older than `timeout`.
    pub async fn sweep_stale(&self, timeout: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut connections = self.connections.write().await;
        let stale: Vec<String> = connections
            .iter()
            .filter(|(_, c)| now.duration_since(c.last_heartbeat) > timeout)
            .map(|(k, _)| k.clone())
            .collect();
        for identity in &stale {
            if let Some(conn) = connections.remove(identity) {
                conn.channel.close(CLOSE_GOING_AWAY, "heartbeat timeout");
                tracing::info!(client = %identity, conn = conn.id, "evicted stale channel");
            }
        }
        stale
    }

    /// Close and drop every channel. Returns how many were closed.
    pub async fn close_all(&self, reason: &str) -> usize {
        let drained: Vec<_> = self.connections.write().await.drain().collect();
        for (_, conn) in &drained {
            conn.channel.close(CLOSE_GOING_AWAY, reason);
        }
        drained.len()
    }

    pub async fn snapshot(&self) -> Vec<ConnectionInfo> {
        let now = Instant::now();
        let connections = self.connections.read().await;
        let mut infos: Vec<_> = connections
            .iter()
            .map(|(identity, c)| ConnectionInfo {
                client_identity: identity.clone(),
                connection_id: c.id,
                version: c.version.clone(),
                connected_at: c.connected_at,
                idle_ms: now.duration_since(c.last_heartbeat).as_millis() as u64,
            })
            .collect();
        infos.sort_by(|a, b| a.client_identity.cmp(&b.client_identity));
        infos
    }

    pub async fn is_connected(&self, identity: &str) -> bool {
        self.connections.read().await.contains_key(identity)
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
