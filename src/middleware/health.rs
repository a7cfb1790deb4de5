use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Request},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::warn;

/// Answer `/healthz` for loopback peers without touching the rest of the
/// chain; the probe never reaches the upstream.
pub async fn health_check(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    if req.uri().path() != "/healthz" {
        return next.run(req).await;
    }

    if addr.ip().is_loopback() {
        return (StatusCode::OK, "OK").into_response();
    }

    warn!(peer = %addr, "health check rejected for non-local peer");
    (StatusCode::FORBIDDEN, "Forbidden").into_response()
}
