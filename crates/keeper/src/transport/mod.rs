// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP + WebSocket transport for the keeper.

pub mod auth;
pub mod http;
pub mod ws;

use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post, put};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::KeeperState;

/// Build the axum `Router` with all keeper routes.
pub fn build_router(state: Arc<KeeperState>) -> Router {
    Router::new()
        // Health (no bearer auth)
        .route("/api/v1/health", get(http::health))
        // Credentials
        .route("/api/v1/credentials", get(http::list_credentials).post(http::create_credential))
        .route(
            "/api/v1/credentials/{id}",
            get(http::get_credential).delete(http::delete_credential),
        )
        .route("/api/v1/credentials/{id}/status", put(http::set_status))
        .route("/api/v1/accounts/{account}", get(http::get_account))
        .route("/api/v1/agents/{identity}/credentials", get(http::agent_credentials))
        // Channels
        .route("/api/v1/connections", get(http::list_connections))
        .route("/api/v1/connections/broadcast", post(http::broadcast))
        // Prober (returns 400 when no authority is configured)
        .route("/api/v1/prober", get(http::prober_status))
        .route("/api/v1/prober/run", post(http::prober_run))
        // Agent channel
        .route("/ws", get(ws::ws_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn_with_state(state.clone(), auth::gatekeeper)),
        )
        .with_state(state)
}
