use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::HeaderValue,
    middleware::Next,
    response::Response,
};

use crate::gateway::GatewayState;

/// Add the recommended security headers to every response. A
/// Content-Security-Policy is deliberately not set here: a generic policy
/// would break backend applications, so it belongs to the deployment.
pub async fn security_headers(
    State(state): State<Arc<GatewayState>>,
    req: Request,
    next: Next,
) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("SAMEORIGIN"));
    // Explicitly disable the legacy XSS auditor in older browsers.
    headers.insert("x-xss-protection", HeaderValue::from_static("0"));

    if state.tls_enabled {
        headers.insert(
            "strict-transport-security",
            HeaderValue::from_static("max-age=31536000; includeSubDomains"),
        );
    }

    response
}
