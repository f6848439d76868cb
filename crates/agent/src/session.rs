// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Client session: one actor task per agent that owns the channel.
//!
//! ```text
//! DISCONNECTED --connect()--> CONNECTING --register_ack--> CONNECTED
//!      ^                          |                           |
//!      |                          v  (failure)                v  (channel lost)
//!      +--disconnect()---- RECONNECTING <---------------------+
//!                                 |
//!                                 v  (attempts exhausted)
//!                               FAILED --connect()--> CONNECTING
//! ```
//!
//! Uploads made while not connected wait in a bounded FIFO queue. Uploads
//! sent but not yet acknowledged go back to the front of the queue when the
//! channel drops, so every upload is delivered at least once.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokenkeep_wire::{
    CredentialStatus, CredentialUploadPayload, CredentialView, Envelope, HeartbeatPayload, Message,
    MessageType, RegisterAckPayload, RegisterPayload,
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::transport::{Connector, StatusClient, Transport};

const COMMAND_BUFFER: usize = 32;
const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub version: String,
    pub heartbeat_interval: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub handshake_timeout: Duration,
    pub ack_timeout: Duration,
    pub queue_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_owned(),
            heartbeat_interval: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: 3,
            handshake_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(10),
            queue_capacity: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
            Self::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

/// Something the user of the agent should hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    Connected,
    Disconnected,
    Reconnecting { attempt: u32 },
    Failed,
    Resynced { credentials: usize },
    CredentialAccepted { account_identity: String, record_id: Option<u64> },
    CredentialRejected { account_identity: String, message: String },
    CredentialInvalid { account_identity: String, reason: String },
    CredentialDeleted { account_identity: String, reason: String },
}

impl fmt::Display for AgentEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => f.write_str("connected"),
            Self::Disconnected => f.write_str("disconnected"),
            Self::Reconnecting { .. } => f.write_str("reconnecting"),
            Self::Failed => f.write_str("connection failed, giving up"),
            Self::Resynced { credentials } => write!(f, "resynced {credentials} credentials"),
            Self::CredentialAccepted { .. } => f.write_str("credential accepted"),
            Self::CredentialRejected { message, .. } => write!(f, "credential rejected: {message}"),
            Self::CredentialInvalid { .. } => f.write_str("credential invalid, please re-authenticate"),
            Self::CredentialDeleted { .. } => f.write_str("credential deleted"),
        }
    }
}

/// What the agent believes about the credential it holds for one category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalCredential {
    pub account_identity: String,
    pub status: CredentialStatus,
    pub reason: Option<String>,
    /// `None` until the keeper acknowledges the upload.
    pub record_id: Option<u64>,
}

impl From<&CredentialView> for LocalCredential {
    fn from(view: &CredentialView) -> Self {
        Self {
            account_identity: view.account_identity.clone(),
            status: view.status,
            reason: view.status_reason.clone(),
            record_id: Some(view.id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The offline queue is at capacity.
    QueueFull,
    Invalid(String),
    /// The session task has stopped.
    Closed,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueFull => f.write_str("outbound queue is full"),
            Self::Invalid(reason) => write!(f, "invalid upload: {reason}"),
            Self::Closed => f.write_str("session closed"),
        }
    }
}

impl std::error::Error for SessionError {}

enum Command {
    Connect,
    Disconnect(oneshot::Sender<()>),
    Upload(CredentialUploadPayload, oneshot::Sender<Result<(), SessionError>>),
}

/// Cloneable handle to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    identity: Arc<str>,
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<SessionState>,
    credentials: watch::Receiver<BTreeMap<String, LocalCredential>>,
    events: broadcast::Sender<AgentEvent>,
}

impl SessionHandle {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Start connecting. No-op if already connected or connecting.
    pub async fn connect(&self) -> Result<(), SessionError> {
        self.commands.send(Command::Connect).await.map_err(|_| SessionError::Closed)
    }

    /// Close the channel without reconnecting. Returns once `DISCONNECTED`.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::Disconnect(tx)).await.map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Send an upload now, or queue it until the next connect.
    pub async fn upload(&self, upload: CredentialUploadPayload) -> Result<(), SessionError> {
        upload.validate().map_err(SessionError::Invalid)?;
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::Upload(upload, tx)).await.map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Local credential state keyed by account category.
    pub fn credentials(&self) -> BTreeMap<String, LocalCredential> {
        self.credentials.borrow().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    /// Wait until the state satisfies `pred`.
    pub async fn wait_for(
        &self,
        pred: impl FnMut(&SessionState) -> bool,
    ) -> Result<SessionState, SessionError> {
        let mut rx = self.state.clone();
        let state = rx.wait_for(pred).await.map_err(|_| SessionError::Closed)?;
        Ok(*state)
    }
}

/// Spawn the session actor. It stays `DISCONNECTED` until [`SessionHandle::connect`].
pub fn spawn_session(
    identity: impl Into<String>,
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    status: Arc<dyn StatusClient>,
) -> SessionHandle {
    let identity: String = identity.into();
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
    let (creds_tx, creds_rx) = watch::channel(BTreeMap::new());
    let (events, _) = broadcast::channel(EVENT_BUFFER);

    let session = Session {
        identity: identity.clone(),
        config,
        connector,
        status,
        commands: cmd_rx,
        state: state_tx,
        credentials: creds_tx,
        events: events.clone(),
        queue: VecDeque::new(),
    };
    tokio::spawn(session.run());

    SessionHandle {
        identity: identity.into(),
        commands: cmd_tx,
        state: state_rx,
        credentials: creds_rx,
        events,
    }
}

/// A request to stop that arrived mid-cycle.
enum Stop {
    Disconnect(oneshot::Sender<()>),
    Shutdown,
}

/// How a connection cycle ended.
enum Exit {
    Lost(String),
    Stopped(Stop),
}

impl From<Stop> for Exit {
    fn from(stop: Stop) -> Self {
        Self::Stopped(stop)
    }
}

/// Upload sent on the current channel and awaiting `credential_ack`.
struct InFlight {
    upload: CredentialUploadPayload,
    deadline: Instant,
}

struct Session {
    identity: String,
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    status: Arc<dyn StatusClient>,
    commands: mpsc::Receiver<Command>,
    state: watch::Sender<SessionState>,
    credentials: watch::Sender<BTreeMap<String, LocalCredential>>,
    events: broadcast::Sender<AgentEvent>,
    queue: VecDeque<CredentialUploadPayload>,
}

impl Session {
    async fn run(mut self) {
        loop {
            let Some(cmd) = self.commands.recv().await else {
                return;
            };
            match cmd {
                Command::Connect => {
                    if !self.drive().await {
                        return;
                    }
                }
                Command::Disconnect(done) => {
                    self.set_state(SessionState::Disconnected);
                    let _ = done.send(());
                }
                Command::Upload(upload, reply) => {
                    let _ = reply.send(self.enqueue(upload));
                }
            }
        }
    }

    /// Connect, stay connected, and reconnect until told to stop or out of
    /// attempts. Returns false when the session should shut down.
    async fn drive(&mut self) -> bool {
        let mut attempt = 0u32;
        loop {
            self.set_state(SessionState::Connecting);
            let exit = match self.establish().await {
                Ok(link) => {
                    attempt = 0;
                    self.serve(link).await
                }
                Err(exit) => exit,
            };

            match exit {
                Exit::Stopped(stop) => return self.stop(stop),
                Exit::Lost(reason) => {
                    tracing::warn!(client = %self.identity, %reason, "channel lost");
                    self.emit(AgentEvent::Disconnected);
                }
            }

            if attempt >= self.config.max_reconnect_attempts {
                tracing::error!(client = %self.identity, attempts = attempt, "giving up on reconnect");
                self.set_state(SessionState::Failed);
                self.emit(AgentEvent::Failed);
                return true;
            }
            attempt += 1;
            self.set_state(SessionState::Reconnecting { attempt });
            self.emit(AgentEvent::Reconnecting { attempt });

            let delay = tokio::time::sleep(self.config.reconnect_delay);
            if let Err(stop) = self.with_commands(delay).await {
                return self.stop(stop);
            }
        }
    }

    /// Settle a stop request. Returns false on shutdown.
    fn stop(&self, stop: Stop) -> bool {
        match stop {
            Stop::Shutdown => false,
            Stop::Disconnect(done) => {
                self.set_state(SessionState::Disconnected);
                self.emit(AgentEvent::Disconnected);
                let _ = done.send(());
                true
            }
        }
    }

    /// Await `fut` while still taking commands. Uploads are queued; a
    /// disconnect or shutdown abandons `fut`.
    async fn with_commands<F: Future>(&mut self, fut: F) -> Result<F::Output, Stop> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                out = &mut fut => return Ok(out),
                cmd = self.commands.recv() => match cmd {
                    None => return Err(Stop::Shutdown),
                    Some(Command::Disconnect(done)) => return Err(Stop::Disconnect(done)),
                    Some(Command::Upload(upload, reply)) => {
                        let _ = reply.send(self.enqueue(upload));
                    }
                    Some(Command::Connect) => {}
                },
            }
        }
    }

    /// Open the channel and complete the register handshake.
    async fn establish(&mut self) -> Result<Transport, Exit> {
        let connector = Arc::clone(&self.connector);
        let connect = tokio::time::timeout(self.config.handshake_timeout, async move {
            connector.connect().await
        });
        let mut link = match self.with_commands(connect).await? {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => return Err(Exit::Lost(format!("{e:#}"))),
            Err(_) => return Err(Exit::Lost("connect timed out".to_owned())),
        };

        let register = Message::Register(RegisterPayload {
            client_identity: self.identity.clone(),
            version: self.config.version.clone(),
        });
        if link.tx.send(register.into_envelope()).await.is_err() {
            return Err(Exit::Lost("channel closed before register".to_owned()));
        }

        let ack_timeout = self.config.ack_timeout;
        let wait = tokio::time::timeout(ack_timeout, wait_register_ack(&mut link.rx));
        match self.with_commands(wait).await? {
            Ok(Ok(ack)) if ack.success => {
                tracing::info!(client = %self.identity, "registered");
                Ok(link)
            }
            Ok(Ok(ack)) => Err(Exit::Lost(format!(
                "registration rejected: {}",
                ack.message.unwrap_or_else(|| "no reason given".to_owned())
            ))),
            Ok(Err(e)) => Err(Exit::Lost(format!("{e:#}"))),
            Err(_) => Err(Exit::Lost(format!("no register_ack within {ack_timeout:?}"))),
        }
    }

    /// Run a registered channel until it ends.
    async fn serve(&mut self, mut link: Transport) -> Exit {
        self.set_state(SessionState::Connected);
        self.emit(AgentEvent::Connected);
        if let Err(stop) = self.resync().await {
            return stop.into();
        }

        let mut in_flight: VecDeque<InFlight> = VecDeque::new();
        let exit = self.pump(&mut link, &mut in_flight).await;

        // Anything unacknowledged goes out again on the next channel.
        for pending in in_flight.into_iter().rev() {
            self.queue.push_front(pending.upload);
        }
        exit
    }

    async fn pump(&mut self, link: &mut Transport, in_flight: &mut VecDeque<InFlight>) -> Exit {
        while let Some(upload) = self.queue.pop_front() {
            if let Err(e) = self.send_upload(link, in_flight, upload).await {
                return e;
            }
        }

        let period = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let deadline = in_flight.front().map(|p| p.deadline);
            tokio::select! {
                _ = heartbeat.tick() => {
                    let hb = Message::Heartbeat(HeartbeatPayload { client_identity: self.identity.clone() });
                    if link.tx.send(hb.into_envelope()).await.is_err() {
                        return Exit::Lost("channel closed".to_owned());
                    }
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    return Exit::Lost("credential_ack timed out".to_owned());
                }
                frame = link.rx.recv() => match frame {
                    Some(env) => self.handle_frame(env, in_flight),
                    None => return Exit::Lost("channel closed".to_owned()),
                },
                cmd = self.commands.recv() => match cmd {
                    None => return Stop::Shutdown.into(),
                    Some(Command::Connect) => {}
                    Some(Command::Disconnect(done)) => return Stop::Disconnect(done).into(),
                    Some(Command::Upload(upload, reply)) => {
                        self.remember_upload(&upload);
                        let _ = reply.send(Ok(()));
                        if let Err(e) = self.send_upload(link, in_flight, upload).await {
                            return e;
                        }
                    }
                },
            }
        }
    }

    async fn send_upload(
        &mut self,
        link: &mut Transport,
        in_flight: &mut VecDeque<InFlight>,
        upload: CredentialUploadPayload,
    ) -> Result<(), Exit> {
        let env = Message::CredentialUpload(upload.clone()).into_envelope();
        if link.tx.send(env).await.is_err() {
            self.queue.push_front(upload);
            return Err(Exit::Lost("channel closed".to_owned()));
        }
        tracing::debug!(account = %upload.account_identity, "upload sent");
        in_flight.push_back(InFlight { upload, deadline: Instant::now() + self.config.ack_timeout });
        Ok(())
    }

    fn handle_frame(&mut self, env: Envelope, in_flight: &mut VecDeque<InFlight>) {
        let message = match env.decode() {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(err = %e, "dropping invalid message");
                return;
            }
        };

        match message {
            Message::CredentialAck(ack) => {
                let Some(sent) = in_flight.pop_front() else {
                    tracing::warn!("credential_ack with nothing in flight");
                    return;
                };
                let account = sent.upload.account_identity.trim().to_owned();
                let category = sent.upload.account_category.trim().to_owned();
                if ack.success {
                    self.credentials.send_modify(|map| {
                        map.insert(
                            category,
                            LocalCredential {
                                account_identity: account.clone(),
                                status: CredentialStatus::Active,
                                reason: None,
                                record_id: ack.record_id,
                            },
                        );
                    });
                    self.emit(AgentEvent::CredentialAccepted {
                        account_identity: account,
                        record_id: ack.record_id,
                    });
                } else {
                    let message = ack.message.unwrap_or_else(|| "rejected".to_owned());
                    tracing::warn!(account = %account, %message, "upload rejected");
                    self.credentials.send_modify(|map| {
                        if let Some(local) = map.get_mut(&category) {
                            local.status = CredentialStatus::Invalid;
                            local.reason = Some(message.clone());
                        }
                    });
                    self.emit(AgentEvent::CredentialRejected { account_identity: account, message });
                }
            }
            Message::CredentialExpired(notice) => {
                tracing::warn!(account = %notice.account_identity, reason = %notice.reason, "credential expired");
                self.credentials.send_modify(|map| {
                    for local in map.values_mut() {
                        if local.account_identity == notice.account_identity {
                            local.status = CredentialStatus::Expired;
                            local.reason = Some(notice.reason.clone());
                        }
                    }
                });
                self.emit(AgentEvent::CredentialInvalid {
                    account_identity: notice.account_identity,
                    reason: notice.reason,
                });
            }
            Message::CredentialDeleted(notice) => {
                tracing::warn!(account = %notice.account_identity, reason = %notice.reason, "credential deleted");
                self.credentials
                    .send_modify(|map| map.retain(|_, l| l.account_identity != notice.account_identity));
                self.emit(AgentEvent::CredentialDeleted {
                    account_identity: notice.account_identity,
                    reason: notice.reason,
                });
            }
            Message::Pong => tracing::trace!("pong"),
            Message::RegisterAck(_) => tracing::debug!("duplicate register_ack ignored"),
            other => tracing::warn!(kind = %other.kind(), "unexpected message, dropped"),
        }
    }

    /// Fetch authoritative status and reconcile local state. Failures are
    /// logged and leave local state alone.
    async fn resync(&mut self) -> Result<(), Stop> {
        let status = Arc::clone(&self.status);
        let identity = self.identity.clone();
        let fetch = tokio::time::timeout(self.config.ack_timeout, async move {
            status.fetch(&identity).await
        });
        let views = match self.with_commands(fetch).await? {
            Ok(Ok(views)) => views,
            Ok(Err(e)) => {
                tracing::warn!(client = %self.identity, err = %e, "resync failed");
                return Ok(());
            }
            Err(_) => {
                tracing::warn!(client = %self.identity, "resync timed out");
                return Ok(());
            }
        };

        let mut invalid = Vec::new();
        let mut deleted = Vec::new();
        self.credentials.send_modify(|map| {
            for view in &views {
                let category = view.account_category.clone();
                let previous = map.get(&category);
                // A queued re-upload is newer than whatever the server has.
                if previous.is_some_and(|p| p.record_id.is_none()) {
                    continue;
                }
                let was_active = previous.is_none_or(|p| p.status.is_active());
                if was_active && !view.status.is_active() {
                    invalid.push((
                        view.account_identity.clone(),
                        view.status_reason.clone().unwrap_or_else(|| view.status.to_string()),
                    ));
                }
                map.insert(category, LocalCredential::from(view));
            }
            map.retain(|_, local| {
                let known = local.record_id.is_none()
                    || views.iter().any(|v| v.account_identity == local.account_identity);
                if !known {
                    deleted.push(local.account_identity.clone());
                }
                known
            });
        });

        tracing::info!(client = %self.identity, credentials = views.len(), "resynced");
        for (account_identity, reason) in invalid {
            self.emit(AgentEvent::CredentialInvalid { account_identity, reason });
        }
        for account_identity in deleted {
            self.emit(AgentEvent::CredentialDeleted {
                account_identity,
                reason: "no longer held by the keeper".to_owned(),
            });
        }
        self.emit(AgentEvent::Resynced { credentials: views.len() });
        Ok(())
    }

    fn enqueue(&mut self, upload: CredentialUploadPayload) -> Result<(), SessionError> {
        if self.queue.len() >= self.config.queue_capacity {
            tracing::warn!(account = %upload.account_identity, "queue full, upload refused");
            return Err(SessionError::QueueFull);
        }
        self.remember_upload(&upload);
        tracing::debug!(account = %upload.account_identity, queued = self.queue.len() + 1, "upload queued");
        self.queue.push_back(upload);
        Ok(())
    }

    /// Record a not-yet-acknowledged upload in local state.
    fn remember_upload(&self, upload: &CredentialUploadPayload) {
        let category = upload.account_category.trim().to_owned();
        let local = LocalCredential {
            account_identity: upload.account_identity.trim().to_owned(),
            status: CredentialStatus::Active,
            reason: None,
            record_id: None,
        };
        self.credentials.send_modify(|map| {
            map.insert(category, local);
        });
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::info!(client = %self.identity, from = %previous, to = %state, "session state");
        }
    }

    fn emit(&self, event: AgentEvent) {
        let _ = self.events.send(event);
    }
}

/// Read frames until `register_ack`, skipping anything else.
async fn wait_register_ack(
    rx: &mut mpsc::Receiver<Envelope>,
) -> anyhow::Result<RegisterAckPayload> {
    loop {
        let Some(env) = rx.recv().await else {
            anyhow::bail!("channel closed before register_ack");
        };
        if env.kind != MessageType::RegisterAck {
            tracing::debug!(kind = %env.kind, "ignoring frame before register_ack");
            continue;
        }
        match env.decode()? {
            Message::RegisterAck(ack) => return Ok(ack),
            other => anyhow::bail!("unexpected {}", other.kind()),
        }
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
