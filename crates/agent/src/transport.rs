// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Channel and resync transports used by the session.

use futures_util::{SinkExt, StreamExt};
use tokenkeep_wire::{CredentialView, Envelope};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// Frames buffered in each direction of an open channel.
const CHANNEL_BUFFER: usize = 64;

/// An open channel as seen by the session.
///
/// `rx` yielding `None` means the channel closed. Dropping `tx` closes it
/// from our side.
pub struct Transport {
    pub tx: mpsc::Sender<Envelope>,
    pub rx: mpsc::Receiver<Envelope>,
}

#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> anyhow::Result<Transport>;
}

/// Source of authoritative credential status for resync.
#[async_trait::async_trait]
pub trait StatusClient: Send + Sync {
    async fn fetch(&self, client_identity: &str) -> anyhow::Result<Vec<CredentialView>>;
}

/// WebSocket connector for `ws://` URLs.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait::async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> anyhow::Result<Transport> {
        let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str()).await?;
        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Envelope>(CHANNEL_BUFFER);
        let (in_tx, in_rx) = mpsc::channel::<Envelope>(CHANNEL_BUFFER);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    out = out_rx.recv() => match out {
                        Some(env) => {
                            let json = match env.to_json() {
                                Ok(json) => json,
                                Err(e) => {
                                    tracing::warn!(err = %e, "failed to encode frame");
                                    continue;
                                }
                            };
                            if sink.send(WsMessage::text(json)).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            let _ = sink.send(WsMessage::Close(None)).await;
                            break;
                        }
                    },
                    frame = stream.next() => match frame {
                        Some(Ok(WsMessage::Text(text))) => match Envelope::parse(text.as_str()) {
                            Ok(env) => {
                                if in_tx.send(env).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => tracing::warn!(err = %e, "dropping invalid frame"),
                        },
                        Some(Ok(WsMessage::Close(frame))) => {
                            tracing::debug!(?frame, "channel closed by server");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::debug!(err = %e, "channel read failed");
                            break;
                        }
                        None => break,
                    },
                }
            }
        });

        Ok(Transport { tx: out_tx, rx: in_rx })
    }
}

/// Resync over the keeper's HTTP API.
pub struct HttpStatusClient {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpStatusClient {
    pub fn new(base_url: impl Into<String>, auth_token: Option<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(std::time::Duration::from_secs(10)).build()?;
        Ok(Self { client, base_url: base_url.into(), auth_token })
    }
}

#[async_trait::async_trait]
impl StatusClient for HttpStatusClient {
    async fn fetch(&self, client_identity: &str) -> anyhow::Result<Vec<CredentialView>> {
        let url = format!("{}/api/v1/agents/{client_identity}/credentials", self.base_url);
        let mut req = self.client.get(&url);
        if let Some(ref token) = self.auth_token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("resync failed: HTTP {status}");
        }
        Ok(resp.json().await?)
    }
}
