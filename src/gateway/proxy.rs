use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    body::Body,
    extract::Request,
    http::header::{HeaderName, CONTENT_TYPE, HOST},
    http::{HeaderMap, StatusCode},
    response::Response,
};
use futures_util::TryStreamExt;
use tracing::{debug, error};

use super::rewriter;
use super::GatewayState;
use crate::error::GatewayError;
use crate::observability::metrics;

/// Total timeout for establishing the upstream connection.
const UPSTREAM_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Streaming single-upstream reverse proxy. Bodies are piped in both
/// directions; nothing is collected except by the HTML rewriter within its
/// own budget.
pub struct ReverseProxy {
    client: reqwest::Client,
    backend: reqwest::Url,
}

impl ReverseProxy {
    pub fn new(backend_url: &str) -> anyhow::Result<Self> {
        let backend = reqwest::Url::parse(backend_url)?;
        let client = reqwest::Client::builder()
            .connect_timeout(UPSTREAM_DIAL_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self { client, backend })
    }

    pub fn backend(&self) -> &reqwest::Url {
        &self.backend
    }

    /// Forward one request to the backend and relay the response, running
    /// HTML responses through the rewriter.
    pub async fn handle(
        &self,
        state: &GatewayState,
        peer: SocketAddr,
        req: Request,
    ) -> Result<Response, GatewayError> {
        let (parts, body) = req.into_parts();

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let target = format!(
            "{}{}",
            self.backend.as_str().trim_end_matches('/'),
            path_and_query
        );

        debug!(%target, method = %parts.method, "forwarding request to upstream");

        let mut builder = self.client.request(parts.method.clone(), &target);

        // Copy end-to-end headers. Host and X-Forwarded-For are set
        // explicitly below, so both are skipped here.
        for (name, value) in parts.headers.iter() {
            if !is_hop_by_hop_header(name) && *name != HOST && *name != "x-forwarded-for" {
                builder = builder.header(name, value);
            }
        }

        // The inbound Host is preserved so upstream apps generating absolute
        // URLs keep working behind this gateway.
        if let Some(host) = parts.headers.get(HOST) {
            builder = builder.header(HOST, host);
        }
        builder = builder.header("x-forwarded-for", append_forwarded_for(&parts.headers, peer));

        let upstream = builder
            .body(reqwest::Body::wrap_stream(body.into_data_stream()))
            .send()
            .await
            .map_err(map_upstream_error)?;

        let status = StatusCode::from_u16(upstream.status().as_u16())
            .map_err(|_| GatewayError::BadGateway("invalid upstream status".into()))?;

        let mut headers = HeaderMap::new();
        for (name, value) in upstream.headers().iter() {
            if !is_hop_by_hop_header(name) {
                headers.append(name.clone(), value.clone());
            }
        }

        let is_html = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("text/html"))
            .unwrap_or(false);

        let body = if state.config.encryption.enabled && status == StatusCode::OK && is_html {
            debug!("response eligible for script injection");
            let stream = Box::pin(upstream.bytes_stream().map_err(std::io::Error::other));
            rewriter::rewrite_html_body(&mut headers, stream, state.script.clone()).await
        } else {
            Body::from_stream(upstream.bytes_stream())
        };

        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

/// Append the immediate peer's IP to any inbound X-Forwarded-For chain.
fn append_forwarded_for(headers: &HeaderMap, peer: SocketAddr) -> String {
    let client_ip = peer.ip().to_string();
    match headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        Some(existing) => format!("{}, {}", existing, client_ip),
        None => client_ip,
    }
}

fn map_upstream_error(e: reqwest::Error) -> GatewayError {
    if e.is_timeout() {
        error!(error = %e, "upstream request timed out");
        metrics::record_upstream_error("timeout");
        return GatewayError::GatewayTimeout("upstream did not respond in time".into());
    }
    if e.is_connect() {
        error!(error = %e, "upstream connection failed");
        metrics::record_upstream_error("connect");
        return GatewayError::BadGateway("could not connect to upstream".into());
    }
    error!(error = %e, "upstream transport error");
    metrics::record_upstream_error("transport");
    GatewayError::BadGateway("upstream transport error".into())
}

/// Hop-by-hop headers must not be forwarded through a proxy.
pub fn is_hop_by_hop_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_peer_ip_to_existing_chain() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "10.0.0.1, 10.0.0.2".parse().unwrap());
        let peer: SocketAddr = "192.168.1.5:51234".parse().unwrap();

        assert_eq!(
            append_forwarded_for(&headers, peer),
            "10.0.0.1, 10.0.0.2, 192.168.1.5"
        );
    }

    #[test]
    fn starts_a_chain_when_absent() {
        let peer: SocketAddr = "192.168.1.5:51234".parse().unwrap();
        assert_eq!(append_forwarded_for(&HeaderMap::new(), peer), "192.168.1.5");
    }

    #[test]
    fn hop_by_hop_headers_are_recognized() {
        assert!(is_hop_by_hop_header(&HeaderName::from_static("connection")));
        assert!(is_hop_by_hop_header(&HeaderName::from_static("transfer-encoding")));
        assert!(!is_hop_by_hop_header(&HeaderName::from_static("host")));
        assert!(!is_hop_by_hop_header(&HeaderName::from_static("content-type")));
    }
}
