// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokenkeep_wire::{
    CredentialAckPayload, CredentialNotice, CredentialSource, CredentialStatus,
    CredentialUploadPayload, CredentialView, Envelope, Message, MessageType, RegisterAckPayload,
};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use super::{spawn_session, AgentEvent, SessionConfig, SessionError, SessionHandle, SessionState};
use crate::transport::{Connector, StatusClient, Transport};

const WAIT: Duration = Duration::from_secs(120);

/// The keeper's side of one mock channel.
struct ServerEnd {
    tx: mpsc::Sender<Envelope>,
    rx: mpsc::Receiver<Envelope>,
}

impl ServerEnd {
    async fn recv(&mut self) -> anyhow::Result<Message> {
        match tokio::time::timeout(WAIT, self.rx.recv()).await? {
            Some(env) => Ok(env.decode()?),
            None => anyhow::bail!("client closed the channel"),
        }
    }

    async fn send(&self, msg: Message) -> anyhow::Result<()> {
        self.tx.send(msg.into_envelope()).await.map_err(|_| anyhow::anyhow!("client gone"))
    }

    /// Answer the register handshake.
    async fn accept(&mut self) -> anyhow::Result<()> {
        let Message::Register(reg) = self.recv().await? else {
            anyhow::bail!("expected register");
        };
        assert_eq!(reg.client_identity, "agent-1");
        self.send(Message::RegisterAck(RegisterAckPayload { success: true, message: None })).await
    }

    async fn recv_upload(&mut self) -> anyhow::Result<CredentialUploadPayload> {
        loop {
            match self.recv().await? {
                Message::CredentialUpload(upload) => return Ok(upload),
                Message::Heartbeat(_) => continue,
                other => anyhow::bail!("expected credential_upload, got {}", other.kind()),
            }
        }
    }

    async fn ack(&self, record_id: u64) -> anyhow::Result<()> {
        self.send(Message::CredentialAck(CredentialAckPayload {
            success: true,
            record_id: Some(record_id),
            message: None,
        }))
        .await
    }
}

struct MockConnector {
    calls: AtomicUsize,
    refuse: AtomicBool,
    accepted: mpsc::UnboundedSender<ServerEnd>,
}

#[async_trait::async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> anyhow::Result<Transport> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            anyhow::bail!("connection refused");
        }
        let (up_tx, up_rx) = mpsc::channel(16);
        let (down_tx, down_rx) = mpsc::channel(16);
        self.accepted
            .send(ServerEnd { tx: down_tx, rx: up_rx })
            .map_err(|_| anyhow::anyhow!("test harness gone"))?;
        Ok(Transport { tx: up_tx, rx: down_rx })
    }
}

#[derive(Default)]
struct MockStatus {
    views: Mutex<Vec<CredentialView>>,
    fetches: AtomicUsize,
}

#[async_trait::async_trait]
impl StatusClient for MockStatus {
    async fn fetch(&self, _client_identity: &str) -> anyhow::Result<Vec<CredentialView>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.views.lock().clone())
    }
}

struct Harness {
    handle: SessionHandle,
    events: broadcast::Receiver<AgentEvent>,
    connector: Arc<MockConnector>,
    status: Arc<MockStatus>,
    servers: mpsc::UnboundedReceiver<ServerEnd>,
}

impl Harness {
    fn new(config: SessionConfig) -> Self {
        let (accepted, servers) = mpsc::unbounded_channel();
        let connector = Arc::new(MockConnector {
            calls: AtomicUsize::new(0),
            refuse: AtomicBool::new(false),
            accepted,
        });
        let status = Arc::new(MockStatus::default());
        let handle = spawn_session(
            "agent-1",
            config,
            Arc::clone(&connector) as Arc<dyn Connector>,
            Arc::clone(&status) as Arc<dyn StatusClient>,
        );
        let events = handle.subscribe();
        Self { handle, events, connector, status, servers }
    }

    async fn next_server(&mut self) -> anyhow::Result<ServerEnd> {
        tokio::time::timeout(WAIT, self.servers.recv())
            .await?
            .ok_or_else(|| anyhow::anyhow!("connector dropped"))
    }

    async fn connected(&mut self) -> anyhow::Result<ServerEnd> {
        self.handle.connect().await?;
        let mut server = self.next_server().await?;
        server.accept().await?;
        self.handle.wait_for(|s| *s == SessionState::Connected).await?;
        Ok(server)
    }

    async fn expect_event(&mut self, want: impl Fn(&AgentEvent) -> bool) -> anyhow::Result<AgentEvent> {
        loop {
            let event = tokio::time::timeout(WAIT, self.events.recv()).await??;
            if want(&event) {
                return Ok(event);
            }
        }
    }
}

fn upload(account: &str, category: &str) -> CredentialUploadPayload {
    CredentialUploadPayload {
        token: format!("tok{account}0123456789"),
        account_identity: account.to_owned(),
        account_category: category.to_owned(),
        source: CredentialSource::LocalStorage,
    }
}

fn view(id: u64, account: &str, category: &str, status: CredentialStatus) -> CredentialView {
    CredentialView {
        id,
        account_identity: account.to_owned(),
        account_category: category.to_owned(),
        status,
        status_reason: (!status.is_active()).then(|| "authority said no".to_owned()),
        source: CredentialSource::LocalStorage,
        owner: "agent-1".to_owned(),
        created_at: 1,
        updated_at: 1,
        last_active_at: None,
    }
}

#[tokio::test(start_paused = true)]
async fn registers_then_heartbeats_on_interval() -> anyhow::Result<()> {
    let mut h = Harness::new(SessionConfig::default());
    assert_eq!(h.handle.state(), SessionState::Disconnected);

    let mut server = h.connected().await?;
    let started = Instant::now();
    match server.recv().await? {
        Message::Heartbeat(hb) => assert_eq!(hb.client_identity, "agent-1"),
        other => anyhow::bail!("expected heartbeat, got {}", other.kind()),
    }
    assert!(started.elapsed() >= Duration::from_secs(30));
    assert_eq!(h.status.fetches.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn queued_uploads_flush_in_order_after_resync() -> anyhow::Result<()> {
    let mut h = Harness::new(SessionConfig::default());
    h.handle.upload(upload("A", "network")).await?;
    h.handle.upload(upload("B", "storage")).await?;

    let mut server = h.connected().await?;
    let first = server.recv_upload().await?;
    assert_eq!(h.status.fetches.load(Ordering::SeqCst), 1, "resync runs before the flush");
    let second = server.recv_upload().await?;
    assert_eq!(first.account_identity, "A");
    assert_eq!(second.account_identity, "B");

    server.ack(7).await?;
    server.ack(8).await?;
    h.expect_event(|e| matches!(e, AgentEvent::CredentialAccepted { record_id: Some(8), .. })).await?;

    let creds = h.handle.credentials();
    assert_eq!(creds.get("network").and_then(|c| c.record_id), Some(7));
    assert_eq!(creds.get("storage").and_then(|c| c.record_id), Some(8));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_bounded_reconnects() -> anyhow::Result<()> {
    let mut h = Harness::new(SessionConfig::default());
    h.connector.refuse.store(true, Ordering::SeqCst);

    let started = Instant::now();
    h.handle.connect().await?;
    for attempt in 1..=3 {
        h.expect_event(|e| *e == AgentEvent::Reconnecting { attempt }).await?;
    }
    h.expect_event(|e| *e == AgentEvent::Failed).await?;

    assert_eq!(h.handle.state(), SessionState::Failed);
    assert_eq!(h.connector.calls.load(Ordering::SeqCst), 4);
    assert!(started.elapsed() >= Duration::from_secs(15));

    // Nothing further happens on its own.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.connector.calls.load(Ordering::SeqCst), 4);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn connect_after_failure_starts_over() -> anyhow::Result<()> {
    let mut h = Harness::new(SessionConfig { max_reconnect_attempts: 0, ..Default::default() });
    h.connector.refuse.store(true, Ordering::SeqCst);
    h.handle.connect().await?;
    h.handle.wait_for(|s| *s == SessionState::Failed).await?;

    h.connector.refuse.store(false, Ordering::SeqCst);
    let _server = h.connected().await?;
    assert_eq!(h.connector.calls.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unacked_upload_is_resent_after_reconnect() -> anyhow::Result<()> {
    let mut h = Harness::new(SessionConfig::default());
    let mut server = h.connected().await?;

    h.handle.upload(upload("X", "network")).await?;
    assert_eq!(server.recv_upload().await?.account_identity, "X");
    drop(server);

    h.expect_event(|e| *e == AgentEvent::Reconnecting { attempt: 1 }).await?;
    let lost_at = Instant::now();
    let mut server = h.next_server().await?;
    assert!(lost_at.elapsed() >= Duration::from_secs(5));
    server.accept().await?;

    assert_eq!(server.recv_upload().await?.account_identity, "X");
    server.ack(3).await?;
    h.expect_event(|e| matches!(e, AgentEvent::CredentialAccepted { record_id: Some(3), .. })).await?;
    assert_eq!(h.handle.state(), SessionState::Connected);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn successful_reconnect_resets_attempts() -> anyhow::Result<()> {
    let mut h = Harness::new(SessionConfig { max_reconnect_attempts: 1, ..Default::default() });
    let server = h.connected().await?;
    drop(server);

    h.expect_event(|e| *e == AgentEvent::Reconnecting { attempt: 1 }).await?;
    let mut server = h.next_server().await?;
    server.accept().await?;
    h.handle.wait_for(|s| *s == SessionState::Connected).await?;
    drop(server);

    // A fresh budget: attempt 1 again rather than giving up.
    h.expect_event(|e| *e == AgentEvent::Reconnecting { attempt: 1 }).await?;
    assert_ne!(h.handle.state(), SessionState::Failed);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn explicit_disconnect_does_not_reconnect() -> anyhow::Result<()> {
    let mut h = Harness::new(SessionConfig::default());
    let mut server = h.connected().await?;

    h.handle.disconnect().await?;
    assert_eq!(h.handle.state(), SessionState::Disconnected);
    assert!(server.recv().await.is_err(), "channel should be closed");

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.connector.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.handle.state(), SessionState::Disconnected);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn disconnect_while_awaiting_register_ack() -> anyhow::Result<()> {
    let mut h = Harness::new(SessionConfig::default());
    h.handle.upload(upload("A", "network")).await?;
    h.handle.connect().await?;
    let mut server = h.next_server().await?;
    assert_eq!(server.recv().await?.kind(), MessageType::Register);
    assert_eq!(h.handle.state(), SessionState::Connecting);

    h.handle.disconnect().await?;
    assert_eq!(h.handle.state(), SessionState::Disconnected);
    assert!(tokio::time::timeout(WAIT, server.rx.recv()).await?.is_none(), "nothing after register");

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.connector.calls.load(Ordering::SeqCst), 1);

    // The queued upload waits for the next connect.
    let mut server = h.connected().await?;
    assert_eq!(server.recv_upload().await?.account_identity, "A");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn upload_while_connecting_is_queued() -> anyhow::Result<()> {
    let mut h = Harness::new(SessionConfig::default());
    h.handle.connect().await?;
    let mut server = h.next_server().await?;
    assert_eq!(server.recv().await?.kind(), MessageType::Register);

    tokio::time::timeout(Duration::from_secs(1), h.handle.upload(upload("A", "network"))).await??;
    assert_eq!(h.handle.state(), SessionState::Connecting);
    assert_eq!(h.handle.credentials().get("network").map(|c| c.record_id), Some(None));

    server.send(Message::RegisterAck(RegisterAckPayload { success: true, message: None })).await?;
    assert_eq!(server.recv_upload().await?.account_identity, "A");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn disconnect_during_reconnect_delay() -> anyhow::Result<()> {
    let mut h = Harness::new(SessionConfig::default());
    h.connector.refuse.store(true, Ordering::SeqCst);
    h.handle.connect().await?;
    h.expect_event(|e| *e == AgentEvent::Reconnecting { attempt: 1 }).await?;

    let asked = Instant::now();
    h.handle.disconnect().await?;
    assert!(asked.elapsed() < Duration::from_secs(5), "disconnect waited out the delay");
    assert_eq!(h.handle.state(), SessionState::Disconnected);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.connector.calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn rejected_registration_is_a_failed_attempt() -> anyhow::Result<()> {
    let mut h = Harness::new(SessionConfig::default());
    h.handle.connect().await?;
    let mut server = h.next_server().await?;
    assert_eq!(server.recv().await?.kind(), MessageType::Register);
    server
        .send(Message::RegisterAck(RegisterAckPayload {
            success: false,
            message: Some("nope".into()),
        }))
        .await?;

    h.expect_event(|e| *e == AgentEvent::Reconnecting { attempt: 1 }).await?;
    assert_eq!(h.handle.state(), SessionState::Reconnecting { attempt: 1 });
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn missing_register_ack_times_out() -> anyhow::Result<()> {
    let mut h = Harness::new(SessionConfig::default());
    h.handle.connect().await?;
    let mut server = h.next_server().await?;
    assert_eq!(server.recv().await?.kind(), MessageType::Register);

    let started = Instant::now();
    h.expect_event(|e| *e == AgentEvent::Reconnecting { attempt: 1 }).await?;
    assert!(started.elapsed() >= Duration::from_secs(10));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn missing_credential_ack_drops_the_channel() -> anyhow::Result<()> {
    let mut h = Harness::new(SessionConfig::default());
    let mut server = h.connected().await?;

    h.handle.upload(upload("X", "network")).await?;
    server.recv_upload().await?;
    h.expect_event(|e| *e == AgentEvent::Reconnecting { attempt: 1 }).await?;

    let mut server = h.next_server().await?;
    server.accept().await?;
    assert_eq!(server.recv_upload().await?.account_identity, "X");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn expiry_notice_marks_local_credential() -> anyhow::Result<()> {
    let mut h = Harness::new(SessionConfig::default());
    let mut server = h.connected().await?;
    h.handle.upload(upload("A", "network")).await?;
    server.recv_upload().await?;
    server.ack(1).await?;
    h.expect_event(|e| matches!(e, AgentEvent::CredentialAccepted { .. })).await?;

    server
        .send(Message::CredentialExpired(CredentialNotice {
            account_identity: "A".into(),
            reason: "liveness check rejected by remote authority: 401".into(),
        }))
        .await?;
    let event = h.expect_event(|e| matches!(e, AgentEvent::CredentialInvalid { .. })).await?;
    assert_eq!(event.to_string(), "credential invalid, please re-authenticate");

    let local = h.handle.credentials().remove("network");
    assert_eq!(local.as_ref().map(|l| l.status), Some(CredentialStatus::Expired));
    assert!(local.and_then(|l| l.reason).is_some_and(|r| r.contains("401")));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn padded_account_matches_expiry_notice() -> anyhow::Result<()> {
    let mut h = Harness::new(SessionConfig::default());
    let mut server = h.connected().await?;
    let mut padded = upload("A", "network");
    padded.account_identity = "  A ".into();
    h.handle.upload(padded).await?;
    server.recv_upload().await?;
    server.ack(1).await?;
    h.expect_event(|e| matches!(e, AgentEvent::CredentialAccepted { .. })).await?;
    assert_eq!(
        h.handle.credentials().get("network").map(|c| c.account_identity.clone()),
        Some("A".to_owned())
    );

    server
        .send(Message::CredentialExpired(CredentialNotice {
            account_identity: "A".into(),
            reason: "revoked".into(),
        }))
        .await?;
    h.expect_event(|e| matches!(e, AgentEvent::CredentialInvalid { .. })).await?;
    let local = h.handle.credentials().remove("network");
    assert_eq!(local.map(|l| l.status), Some(CredentialStatus::Expired));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn deletion_notice_forgets_local_credential() -> anyhow::Result<()> {
    let mut h = Harness::new(SessionConfig::default());
    let mut server = h.connected().await?;
    h.handle.upload(upload("A", "network")).await?;
    server.recv_upload().await?;
    server.ack(1).await?;
    h.expect_event(|e| matches!(e, AgentEvent::CredentialAccepted { .. })).await?;

    server
        .send(Message::CredentialDeleted(CredentialNotice {
            account_identity: "A".into(),
            reason: "deleted by operator".into(),
        }))
        .await?;
    h.expect_event(|e| matches!(e, AgentEvent::CredentialDeleted { .. })).await?;
    assert!(h.handle.credentials().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn resync_reports_credentials_expired_while_offline() -> anyhow::Result<()> {
    let mut h = Harness::new(SessionConfig::default());
    h.status.views.lock().push(view(4, "A", "network", CredentialStatus::Expired));

    let _server = h.connected().await?;
    let event = h.expect_event(|e| matches!(e, AgentEvent::CredentialInvalid { .. })).await?;
    assert_eq!(
        event,
        AgentEvent::CredentialInvalid {
            account_identity: "A".into(),
            reason: "authority said no".into(),
        }
    );
    h.expect_event(|e| *e == AgentEvent::Resynced { credentials: 1 }).await?;

    let local = h.handle.credentials().remove("network");
    assert_eq!(local.map(|l| (l.status, l.record_id)), Some((CredentialStatus::Expired, Some(4))));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn resync_keeps_pending_reupload() -> anyhow::Result<()> {
    let mut h = Harness::new(SessionConfig::default());
    h.status.views.lock().push(view(4, "A", "network", CredentialStatus::Expired));
    h.handle.upload(upload("A", "network")).await?;

    let mut server = h.connected().await?;
    h.expect_event(|e| matches!(e, AgentEvent::Resynced { .. })).await?;
    let local = h.handle.credentials().remove("network");
    assert_eq!(local.map(|l| (l.status, l.record_id)), Some((CredentialStatus::Active, None)));
    server.recv_upload().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn full_queue_refuses_uploads() -> anyhow::Result<()> {
    let h = Harness::new(SessionConfig { queue_capacity: 2, ..Default::default() });
    h.handle.upload(upload("A", "network")).await?;
    h.handle.upload(upload("B", "network")).await?;
    assert_eq!(h.handle.upload(upload("C", "network")).await, Err(SessionError::QueueFull));
    Ok(())
}

#[tokio::test]
async fn malformed_upload_is_refused_locally() -> anyhow::Result<()> {
    let h = Harness::new(SessionConfig::default());
    let mut bad = upload("A", "network");
    bad.token = "has spaces in it".into();
    assert!(matches!(h.handle.upload(bad).await, Err(SessionError::Invalid(_))));
    Ok(())
}
