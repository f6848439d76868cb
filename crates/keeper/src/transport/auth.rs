// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::KeeperError;
use crate::state::KeeperState;

/// Constant-time string comparison to prevent timing side-channel attacks.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

/// Validate a Bearer token from HTTP headers.
pub fn validate_bearer(headers: &HeaderMap, expected: Option<&str>) -> Result<(), KeeperError> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or(KeeperError::Unauthorized)?;
    let token = header.strip_prefix("Bearer ").ok_or(KeeperError::Unauthorized)?;
    if constant_time_eq(token, expected) {
        Ok(())
    } else {
        Err(KeeperError::Unauthorized)
    }
}

/// Validate the `token` query parameter presented on a channel upgrade.
pub fn validate_ws_token(token: Option<&str>, expected: Option<&str>) -> Result<(), KeeperError> {
    match (expected, token) {
        (None, _) => Ok(()),
        (Some(expected), Some(token)) if constant_time_eq(token, expected) => Ok(()),
        _ => Err(KeeperError::Unauthorized),
    }
}

/// Loopback, private LAN and link-local addresses.
pub fn is_allowed_peer(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_allowed_peer(IpAddr::V4(v4));
            }
            let first = v6.segments()[0];
            v6.is_loopback() || (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
        }
    }
}

/// Gatekeeper middleware: peer address check, then bearer auth.
///
/// Requests without a recorded peer address (in-process test servers) skip
/// the address check. Health and the channel upgrade skip bearer auth; the
/// channel authenticates with `?token=` in its own handler.
pub async fn gatekeeper(
    state: State<Arc<KeeperState>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    if !state.config.allow_remote {
        let peer = req.extensions().get::<ConnectInfo<SocketAddr>>().map(|ci| ci.0);
        if let Some(peer) = peer {
            if !is_allowed_peer(peer.ip()) {
                tracing::warn!(%peer, path = %req.uri().path(), "rejected non-local peer");
                return KeeperError::Forbidden
                    .to_http_response("only local network peers are accepted")
                    .into_response();
            }
        }
    }

    let path = req.uri().path();
    if path == "/api/v1/health" || path == "/ws" {
        return next.run(req).await;
    }

    if let Err(code) = validate_bearer(req.headers(), state.config.auth_token.as_deref()) {
        return code.to_http_response("unauthorized").into_response();
    }

    next.run(req).await
}
