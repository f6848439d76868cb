// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP handlers for the management API.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tokenkeep_wire::{
    CredentialSource, CredentialStatus, CredentialUploadPayload, CredentialView, Envelope,
    MessageType,
};

use crate::error::KeeperError;
use crate::prober::Prober;
use crate::state::KeeperState;
use crate::store::StoreError;

/// Owner recorded for credentials created through the API.
const API_OWNER: &str = "api";

// -- Request/Response types ---------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub connections: usize,
    pub active_credentials: usize,
    pub prober_enabled: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub include_inactive: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCredentialRequest {
    pub token: String,
    pub account_identity: String,
    pub account_category: String,
    #[serde(default)]
    pub source: CredentialSource,
    /// Client identity to record as owner. Defaults to `api`.
    #[serde(default)]
    pub owner: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SetStatusRequest {
    pub status: CredentialStatus,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct NotifiedResponse {
    pub credential: CredentialView,
    pub notified: bool,
}

#[derive(Debug, Deserialize)]
pub struct BroadcastRequest {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default = "empty_object")]
    pub payload: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

#[derive(Debug, Serialize)]
pub struct BroadcastResponse {
    pub delivered: usize,
}

// -- Helpers ------------------------------------------------------------------

fn store_error(e: &StoreError) -> Response {
    KeeperError::from(e).to_http_response(e.to_string()).into_response()
}

fn get_prober(s: &KeeperState) -> Result<&Arc<Prober>, Box<Response>> {
    s.prober.as_ref().ok_or_else(|| {
        Box::new(KeeperError::BadRequest.to_http_response("prober not configured").into_response())
    })
}

fn views(records: Vec<crate::store::CredentialRecord>) -> Vec<CredentialView> {
    records.iter().map(|r| r.view()).collect()
}

// -- Handlers -----------------------------------------------------------------

/// `GET /api/v1/health`
pub async fn health(State(s): State<Arc<KeeperState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "running".to_owned(),
        connections: s.registry.len().await,
        active_credentials: s.store.find_active().await.len(),
        prober_enabled: s.prober.is_some(),
    })
}

/// `GET /api/v1/credentials`
pub async fn list_credentials(
    State(s): State<Arc<KeeperState>>,
    Query(q): Query<ListQuery>,
) -> impl IntoResponse {
    Json(views(s.store.list(q.include_inactive).await))
}

/// `POST /api/v1/credentials`: upsert a credential by account identity.
pub async fn create_credential(
    State(s): State<Arc<KeeperState>>,
    Json(req): Json<CreateCredentialRequest>,
) -> Response {
    let owner = req.owner.unwrap_or_else(|| API_OWNER.to_owned());
    let upload = CredentialUploadPayload {
        token: req.token,
        account_identity: req.account_identity,
        account_category: req.account_category,
        source: req.source,
    };
    match s.store.upsert(&upload, &owner).await {
        Ok(record) => {
            tracing::info!(account = %record.account_identity, record = record.id, %owner, "credential stored via api");
            (StatusCode::CREATED, Json(record.view())).into_response()
        }
        Err(e) => store_error(&e),
    }
}

/// `GET /api/v1/credentials/{id}`
pub async fn get_credential(State(s): State<Arc<KeeperState>>, Path(id): Path<u64>) -> Response {
    match s.store.get(id).await {
        Ok(record) => Json(record.view()).into_response(),
        Err(e) => store_error(&e),
    }
}

/// `DELETE /api/v1/credentials/{id}`: remove and tell the owner.
pub async fn delete_credential(
    State(s): State<Arc<KeeperState>>,
    Path(id): Path<u64>,
) -> Response {
    let record = match s.store.delete(id).await {
        Ok(r) => r,
        Err(e) => return store_error(&e),
    };
    tracing::info!(record = id, account = %record.account_identity, "credential deleted");
    let notified = s
        .dispatcher
        .notify_deleted(&record.owner, &record.account_identity, "credential deleted by operator")
        .await;
    Json(NotifiedResponse { credential: record.view(), notified }).into_response()
}

/// `PUT /api/v1/credentials/{id}/status`
pub async fn set_status(
    State(s): State<Arc<KeeperState>>,
    Path(id): Path<u64>,
    Json(req): Json<SetStatusRequest>,
) -> Response {
    let reason = req
        .reason
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| format!("marked {} by operator", req.status));
    let change = match s.store.set_status(id, req.status, Some(reason.clone())).await {
        Ok(c) => c,
        Err(e) => return store_error(&e),
    };

    let notified = if change.deactivated() {
        s.dispatcher.notify_expired(&change.record.account_identity, &reason).await
    } else {
        false
    };
    Json(NotifiedResponse { credential: change.record.view(), notified }).into_response()
}

/// `GET /api/v1/accounts/{account}`
pub async fn get_account(
    State(s): State<Arc<KeeperState>>,
    Path(account): Path<String>,
) -> Response {
    match s.store.find_by_account(&account).await {
        Some(record) => Json(record.view()).into_response(),
        None => KeeperError::NotFound
            .to_http_response(format!("no credential for account {account}"))
            .into_response(),
    }
}

/// `GET /api/v1/agents/{identity}/credentials`: resync source for agents.
pub async fn agent_credentials(
    State(s): State<Arc<KeeperState>>,
    Path(identity): Path<String>,
) -> impl IntoResponse {
    Json(views(s.store.list_owned_by(&identity).await))
}

/// `GET /api/v1/connections`
pub async fn list_connections(State(s): State<Arc<KeeperState>>) -> impl IntoResponse {
    Json(s.registry.snapshot().await)
}

/// `POST /api/v1/connections/broadcast`: server-to-client types only.
pub async fn broadcast(
    State(s): State<Arc<KeeperState>>,
    Json(req): Json<BroadcastRequest>,
) -> Response {
    if !req.kind.is_server_to_client() {
        return KeeperError::BadRequest
            .to_http_response(format!("{} is not a server-to-client message", req.kind))
            .into_response();
    }
    if !req.payload.is_object() {
        return KeeperError::BadRequest.to_http_response("payload must be an object").into_response();
    }
    let delivered = s.registry.broadcast(Envelope::new(req.kind, req.payload)).await;
    Json(BroadcastResponse { delivered }).into_response()
}

/// `GET /api/v1/prober`
pub async fn prober_status(State(s): State<Arc<KeeperState>>) -> Response {
    match get_prober(&s) {
        Ok(p) => Json(p.stats()).into_response(),
        Err(resp) => *resp,
    }
}

/// `POST /api/v1/prober/run`: run one scan now and return its report.
pub async fn prober_run(State(s): State<Arc<KeeperState>>) -> Response {
    let prober = match get_prober(&s) {
        Ok(p) => Arc::clone(p),
        Err(resp) => return *resp,
    };
    Json(prober.run_cycle().await).into_response()
}
