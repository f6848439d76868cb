// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent channel: `GET /ws`.
//!
//! The first frame must be `register`. After that the handler answers
//! heartbeats and credential uploads until the channel closes, is replaced,
//! or is evicted by the sweeper.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokenkeep_wire::{
    CredentialAckPayload, Envelope, Message, RegisterAckPayload, RegisterPayload,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::registry::{ChannelHandle, Outbound, CLOSE_POLICY};
use crate::state::KeeperState;
use crate::transport::auth;

/// Frames queued per channel before directed sends start to wait.
const OUTBOUND_CAPACITY: usize = 64;

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelQuery {
    pub token: Option<String>,
}

/// `GET /ws`: upgrade to an agent channel.
pub async fn ws_handler(
    State(state): State<Arc<KeeperState>>,
    Query(query): Query<ChannelQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if let Err(code) =
        auth::validate_ws_token(query.token.as_deref(), state.config.auth_token.as_deref())
    {
        return code.to_http_response("unauthorized").into_response();
    }
    ws.on_upgrade(move |socket| handle_channel(state, socket)).into_response()
}

async fn handle_channel(state: Arc<KeeperState>, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();

    let register =
        match tokio::time::timeout(state.config.handshake_timeout(), await_register(&mut stream))
            .await
        {
            Ok(Ok(register)) => register,
            Ok(Err(Some(reason))) => {
                tracing::warn!(%reason, "rejecting channel");
                send_close(&mut sink, CLOSE_POLICY, &reason).await;
                return;
            }
            Ok(Err(None)) => return,
            Err(_) => {
                tracing::warn!("channel did not register in time");
                send_close(&mut sink, CLOSE_POLICY, "register timeout").await;
                return;
            }
        };

    let identity = register.client_identity.trim().to_owned();
    let (channel, rx) = ChannelHandle::new(OUTBOUND_CAPACITY);
    let cancel = channel.cancel_token().clone();
    let conn_id = state.registry.register(&identity, &register.version, channel.clone()).await;
    let writer = tokio::spawn(write_loop(sink, rx, cancel.clone()));

    let ack = RegisterAckPayload { success: true, message: None };
    channel.send(Message::RegisterAck(ack).into_envelope()).await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = stream.next() => match msg {
                Some(Ok(WsMessage::Text(text))) => {
                    handle_text(&state, &identity, &channel, text.as_str()).await;
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Err(e)) => {
                    tracing::debug!(client = %identity, err = %e, "channel read failed");
                    break;
                }
                _ => {}
            }
        }
    }

    state.registry.release(&identity, conn_id).await;
    cancel.cancel();
    let _ = writer.await;
    tracing::info!(client = %identity, conn = conn_id, "channel closed");
}

/// Wait for the opening `register`. `Err(None)` means the peer went away.
async fn await_register(
    stream: &mut SplitStream<WebSocket>,
) -> Result<RegisterPayload, Option<String>> {
    loop {
        let text = match stream.next().await {
            Some(Ok(WsMessage::Text(text))) => text,
            Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => return Err(None),
            Some(Ok(_)) => continue,
        };
        let message = Envelope::parse(text.as_str())
            .and_then(|env| env.decode())
            .map_err(|e| Some(e.to_string()))?;
        let kind = message.kind();
        let Message::Register(register) = message else {
            return Err(Some(format!("expected register, got {kind}")));
        };
        register.validate().map_err(Some)?;
        return Ok(register);
    }
}

async fn handle_text(state: &KeeperState, identity: &str, channel: &ChannelHandle, text: &str) {
    let message = match Envelope::parse(text).and_then(|env| env.decode()) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(client = %identity, err = %e, "dropping invalid message");
            return;
        }
    };

    match message {
        Message::Heartbeat(hb) => {
            if hb.client_identity != identity {
                tracing::debug!(client = %identity, claimed = %hb.client_identity, "heartbeat identity mismatch");
            }
            state.registry.touch_heartbeat(identity).await;
            channel.send(Message::Pong.into_envelope()).await;
        }
        Message::CredentialUpload(upload) => {
            let ack = match state.store.upsert(&upload, identity).await {
                Ok(record) => {
                    tracing::info!(
                        client = %identity,
                        account = %record.account_identity,
                        record = record.id,
                        revision = record.revision,
                        source = record.source.as_str(),
                        "credential stored"
                    );
                    CredentialAckPayload { success: true, record_id: Some(record.id), message: None }
                }
                Err(e) => {
                    tracing::warn!(client = %identity, account = %upload.account_identity, err = %e, "credential rejected");
                    CredentialAckPayload { success: false, record_id: None, message: Some(e.to_string()) }
                }
            };
            channel.send(Message::CredentialAck(ack).into_envelope()).await;
        }
        other => {
            tracing::warn!(client = %identity, kind = %other.kind(), "unexpected message, dropped");
        }
    }
}

/// Drain the outbound queue into the socket.
async fn write_loop(
    mut sink: SplitSink<WebSocket, WsMessage>,
    mut rx: mpsc::Receiver<Outbound>,
    cancel: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => break,
            item = rx.recv() => item,
        };
        match item {
            Some(Outbound::Frame(env)) => {
                let json = match env.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::warn!(err = %e, "failed to encode frame");
                        continue;
                    }
                };
                if sink.send(WsMessage::Text(json.into())).await.is_err() {
                    break;
                }
            }
            Some(Outbound::Close { code, reason }) => {
                send_close(&mut sink, code, &reason).await;
                break;
            }
            None => break,
        }
    }
    cancel.cancel();
}

async fn send_close(sink: &mut SplitSink<WebSocket, WsMessage>, code: u16, reason: &str) {
    let frame = CloseFrame { code, reason: reason.to_owned().into() };
    let _ = sink.send(WsMessage::Close(Some(frame))).await;
}
