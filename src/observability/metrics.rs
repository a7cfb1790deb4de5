use anyhow::Result;
use axum::{routing::get, Router};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::MetricsConfig;

/// Register metric descriptions and start the Prometheus render endpoint
/// when metrics are enabled. Recording helpers below are no-ops without an
/// installed recorder, so callers never need to branch.
pub async fn init(config: &MetricsConfig) -> Result<()> {
    if !config.enabled {
        return Ok(());
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("failed to install Prometheus recorder: {}", e))?;

    register_metrics();

    let app = Router::new().route("/metrics", get(move || async move { handle.render() }));
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;

    info!(%addr, "metrics server listening");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "metrics server error");
        }
    });

    Ok(())
}

fn register_metrics() {
    describe_counter!("gateway_requests_total", "Requests handled by the gateway");
    describe_histogram!(
        "gateway_request_duration_seconds",
        "Wall time spent handling a request"
    );
    describe_counter!(
        "gateway_upstream_errors_total",
        "Upstream transport failures by kind"
    );
    describe_counter!(
        "gateway_decrypt_requests_total",
        "Request bodies classified by the decryption pipeline"
    );
    describe_counter!(
        "gateway_decrypt_failures_total",
        "Decryption pipeline rejections by reason"
    );
    describe_counter!("gateway_security_events_total", "Security events by kind");
    describe_counter!("gateway_rewrites_total", "HTML rewrite outcomes");
    describe_counter!("gateway_keys_issued_total", "Keys minted by the distribution endpoint");
    describe_counter!("gateway_websocket_sessions_total", "WebSocket proxy sessions opened");
}

pub fn record_request(method: &str, status: u16, duration_secs: f64) {
    let status_class = match status {
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        _ => "5xx",
    };
    counter!(
        "gateway_requests_total",
        "method" => method.to_string(),
        "status" => status_class,
    )
    .increment(1);
    histogram!("gateway_request_duration_seconds").record(duration_secs);
}

pub fn record_upstream_error(kind: &'static str) {
    counter!("gateway_upstream_errors_total", "kind" => kind).increment(1);
}

pub fn record_classification(encrypted: bool) {
    let class = if encrypted { "encrypted" } else { "plain" };
    counter!("gateway_decrypt_requests_total", "class" => class).increment(1);
}

/// Count one decryption pipeline rejection. Reasons: `invalid_token`,
/// `base64_decode_error`, `decryption_error`, `malformed_frame`,
/// `malformed_payload`, `invalid_session`.
pub fn record_decrypt_failure(reason: &'static str) {
    counter!("gateway_decrypt_failures_total", "reason" => reason).increment(1);
}

pub fn record_security_event(kind: &'static str) {
    counter!("gateway_security_events_total", "kind" => kind).increment(1);
}

/// Outcomes: `injected`, `oversize`.
pub fn record_rewrite(outcome: &'static str) {
    counter!("gateway_rewrites_total", "outcome" => outcome).increment(1);
}

pub fn record_key_issued() {
    counter!("gateway_keys_issued_total").increment(1);
}

pub fn record_websocket_session() {
    counter!("gateway_websocket_sessions_total").increment(1);
}
