use std::net::SocketAddr;
use std::time::Instant;

use axum::{
    extract::{ConnectInfo, Request},
    middleware::Next,
    response::Response,
};
use tracing::info;

use super::request_id::RequestId;
use crate::observability::metrics;

/// Structured access log: one record per request with timing, status, and
/// peer identity.
pub async fn access_log(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let uri = req.uri().clone();
    let host = req
        .headers()
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let user_agent = req
        .headers()
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let trace_id = req
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();

    let response = next.run(req).await;

    let duration = start.elapsed();
    let status = response.status().as_u16();

    info!(
        %trace_id,
        %host,
        method = %method,
        uri = %uri,
        status,
        duration_ms = duration.as_millis() as u64,
        client_ip = %addr.ip(),
        %user_agent,
        "goga request"
    );
    metrics::record_request(method.as_str(), status, duration.as_secs_f64());

    response
}
