use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::header::{CONTENT_LENGTH, CONTENT_TYPE},
    http::{Method, Uri},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio_util::io::StreamReader;
use tracing::{debug, error};

use super::json_scan::find_json_end;
use super::peek::PeekReader;
use crate::config::EncryptionProfile;
use crate::crypto;
use crate::error::GatewayError;
use crate::gateway::GatewayState;
use crate::observability::metrics;

/// Window sizes for classification and envelope parsing.
const CLASSIFY_PEEK_BYTES: usize = 100;
const ENVELOPE_PEEK_BYTES: usize = 8 * 1024;

/// Wire shape of the symmetric-profile envelope.
#[derive(Deserialize)]
struct EncryptedPayload {
    #[serde(default)]
    token: String,
    #[serde(default)]
    encrypted: String,
}

/// Wire shape of the ECDH-profile envelope.
#[derive(Deserialize)]
struct EcdhEncryptedPayload {
    #[serde(default)]
    version: String,
    #[serde(default, rename = "sessionId")]
    session_id: String,
    #[serde(default, rename = "encryptedData")]
    encrypted_data: String,
}

/// Decide from a peeked prefix whether the body looks like an encrypted
/// envelope for the active profile. The peek never consumes bytes.
fn classify(peeked: &[u8], profile: EncryptionProfile) -> bool {
    let trimmed = trim_ascii_start(peeked);
    if trimmed.is_empty() || trimmed[0] != b'{' {
        return false;
    }

    match profile {
        EncryptionProfile::Symmetric => {
            contains(trimmed, b"\"token\"") && contains(trimmed, b"\"encrypted\"")
        }
        EncryptionProfile::Ecdh => {
            contains(trimmed, b"\"sessionId\"") && contains(trimmed, b"\"encryptedData\"")
        }
    }
}

fn trim_ascii_start(data: &[u8]) -> &[u8] {
    let mut i = 0;
    while i < data.len() && data[i].is_ascii_whitespace() {
        i += 1;
    }
    &data[i..]
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.len() >= needle.len() && haystack.windows(needle.len()).any(|w| w == needle)
}

fn security_event(reason: &'static str, peer: &SocketAddr, uri: &Uri, token: Option<&str>) {
    error!(
        event_type = "security",
        reason,
        client_ip = %peer.ip(),
        uri = %uri,
        token = token.unwrap_or(""),
        "request rejected by decryption pipeline"
    );
    metrics::record_security_event(reason);
}

/// Request-body decryption middleware. Classifies POST bodies by a
/// non-consuming peek, enforces the per-route mandatory-encryption policy,
/// and hands every downstream handler plaintext with the original
/// Content-Type restored.
pub async fn decryption(
    State(state): State<Arc<GatewayState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    let content_type = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let is_json = content_type.contains("application/json");
    let is_form = content_type.contains("application/x-www-form-urlencoded");

    // Only POST bodies of these types can carry the envelope. Everything
    // else is plain, but still subject to the must-encrypt policy.
    if req.method() != Method::POST || (!is_json && !is_form) {
        if let Some(rejection) = reject_plain_if_mandatory(&state, &req, &peer) {
            return rejection;
        }
        return next.run(req).await;
    }

    let (mut parts, body) = req.into_parts();

    let stream =
        futures_util::TryStreamExt::map_err(body.into_data_stream(), std::io::Error::other);
    let mut peek_reader = PeekReader::new(StreamReader::new(stream));

    let peeked = match peek_reader.peek(CLASSIFY_PEEK_BYTES).await {
        Ok(peeked) => peeked,
        Err(e) => {
            error!(error = %e, client_ip = %peer.ip(), "failed to read request body");
            return GatewayError::Internal("failed to read request body".into()).into_response();
        }
    };

    let encrypted = classify(peeked, state.config.encryption.profile);
    metrics::record_classification(encrypted);

    if !encrypted {
        // Plain body. Enforce policy, then fully drain and re-wrap: the
        // peeked prefix and the original stream must be recombined into one
        // fresh body before anything downstream reads it.
        if state.is_must_encrypt_path(parts.uri.path()) {
            security_event("plaintext_request_to_sensitive_route", &peer, &parts.uri, None);
            return GatewayError::EncryptionRequired.into_response();
        }

        let mut buffered = Vec::new();
        if let Err(e) = peek_reader.read_to_end(&mut buffered).await {
            error!(error = %e, client_ip = %peer.ip(), "failed to buffer plain request body");
            return GatewayError::Internal("failed to read request body".into()).into_response();
        }

        debug!(uri = %parts.uri, "plain request, decryption skipped");
        set_content_length(&mut parts.headers, buffered.len());
        let req = Request::from_parts(parts, Body::from(buffered));
        return next.run(req).await;
    }

    // Encrypted path: the complete envelope must be observable in the peek
    // window.
    let window = match peek_reader.peek(ENVELOPE_PEEK_BYTES).await {
        Ok(window) => window,
        Err(e) => {
            error!(error = %e, client_ip = %peer.ip(), "failed to read encrypted envelope");
            return GatewayError::Internal("failed to read request body".into()).into_response();
        }
    };

    let end = match find_json_end(window) {
        Some(end) => end,
        None => {
            security_event("malformed_payload", &peer, &parts.uri, None);
            metrics::record_decrypt_failure("malformed_payload");
            return GatewayError::MalformedPayload(
                "no complete JSON envelope in request body".into(),
            )
            .into_response();
        }
    };
    let envelope = &window[..=end];

    let result = match state.config.encryption.profile {
        EncryptionProfile::Symmetric => {
            decrypt_symmetric(&state, envelope, &peer, &parts.uri).await
        }
        EncryptionProfile::Ecdh => decrypt_ecdh(&state, envelope, &peer, &parts.uri),
    };

    let (original_content_type, original_body) = match result {
        Ok(recovered) => recovered,
        Err(e) => return e.into_response(),
    };

    match original_content_type.parse() {
        Ok(value) => {
            parts.headers.insert(CONTENT_TYPE, value);
        }
        Err(_) => {
            security_event("malformed_frame", &peer, &parts.uri, None);
            metrics::record_decrypt_failure("malformed_frame");
            return GatewayError::MalformedPayload("invalid recovered content-type".into())
                .into_response();
        }
    }
    set_content_length(&mut parts.headers, original_body.len());

    debug!(uri = %parts.uri, content_type = %original_content_type, "request decrypted");
    let req = Request::from_parts(parts, Body::from(original_body));
    next.run(req).await
}

/// Policy check shared by every plain-classified branch.
fn reject_plain_if_mandatory(
    state: &GatewayState,
    req: &Request,
    peer: &SocketAddr,
) -> Option<Response> {
    if state.is_must_encrypt_path(req.uri().path()) {
        security_event("plaintext_request_to_sensitive_route", peer, req.uri(), None);
        return Some(GatewayError::EncryptionRequired.into_response());
    }
    None
}

async fn decrypt_symmetric(
    state: &GatewayState,
    envelope: &[u8],
    peer: &SocketAddr,
    uri: &Uri,
) -> Result<(String, Vec<u8>), GatewayError> {
    let payload: EncryptedPayload = serde_json::from_slice(envelope).map_err(|_| {
        security_event("malformed_payload", peer, uri, None);
        metrics::record_decrypt_failure("malformed_payload");
        GatewayError::MalformedPayload("envelope is not a valid JSON object".into())
    })?;

    if payload.token.is_empty() || payload.encrypted.is_empty() {
        security_event("incomplete_payload", peer, uri, None);
        metrics::record_decrypt_failure("malformed_payload");
        return Err(GatewayError::IncompletePayload);
    }

    let key = state.key_cache.get(&payload.token).await.ok_or_else(|| {
        security_event("invalid_or_expired_token", peer, uri, Some(&payload.token));
        metrics::record_decrypt_failure("invalid_token");
        GatewayError::InvalidToken
    })?;

    let encrypted_data = STANDARD.decode(&payload.encrypted).map_err(|_| {
        security_event("base64_decode_error", peer, uri, Some(&payload.token));
        metrics::record_decrypt_failure("base64_decode_error");
        GatewayError::MalformedPayload("invalid base64 in encrypted field".into())
    })?;

    let plaintext = crypto::decrypt_aes256_gcm(&key, &encrypted_data).map_err(|_| {
        security_event("decryption_error", peer, uri, Some(&payload.token));
        metrics::record_decrypt_failure("decryption_error");
        GatewayError::DecryptionFailed
    })?;

    crypto::parse_framed(&plaintext).map_err(|_| {
        security_event("payload_corrupted", peer, uri, Some(&payload.token));
        metrics::record_decrypt_failure("malformed_frame");
        GatewayError::MalformedPayload("corrupted decrypted payload".into())
    })
}

fn decrypt_ecdh(
    state: &GatewayState,
    envelope: &[u8],
    peer: &SocketAddr,
    uri: &Uri,
) -> Result<(String, Vec<u8>), GatewayError> {
    let sessions = state
        .sessions
        .as_ref()
        .ok_or_else(|| GatewayError::Internal("session manager not configured".into()))?;

    let payload: EcdhEncryptedPayload = serde_json::from_slice(envelope).map_err(|_| {
        security_event("malformed_payload", peer, uri, None);
        metrics::record_decrypt_failure("malformed_payload");
        GatewayError::MalformedPayload("envelope is not a valid JSON object".into())
    })?;

    if payload.version != "1.0" || payload.session_id.is_empty() || payload.encrypted_data.is_empty()
    {
        security_event("incomplete_payload", peer, uri, None);
        metrics::record_decrypt_failure("malformed_payload");
        return Err(GatewayError::IncompletePayload);
    }

    let session = sessions.get(&payload.session_id).ok_or_else(|| {
        security_event("invalid_or_expired_session", peer, uri, Some(&payload.session_id));
        metrics::record_decrypt_failure("invalid_session");
        GatewayError::InvalidSession
    })?;

    let encrypted_data = STANDARD.decode(&payload.encrypted_data).map_err(|_| {
        security_event("base64_decode_error", peer, uri, Some(&payload.session_id));
        metrics::record_decrypt_failure("base64_decode_error");
        GatewayError::MalformedPayload("invalid base64 in encryptedData field".into())
    })?;

    let plaintext = crypto::decrypt_aes256_gcm(&session.request_key, &encrypted_data).map_err(|_| {
        security_event("decryption_error", peer, uri, Some(&payload.session_id));
        metrics::record_decrypt_failure("decryption_error");
        GatewayError::DecryptionFailed
    })?;

    crypto::parse_framed(&plaintext).map_err(|_| {
        security_event("payload_corrupted", peer, uri, Some(&payload.session_id));
        metrics::record_decrypt_failure("malformed_frame");
        GatewayError::MalformedPayload("corrupted decrypted payload".into())
    })
}

fn set_content_length(headers: &mut axum::http::HeaderMap, len: usize) {
    headers.remove(CONTENT_LENGTH);
    if let Ok(value) = len.to_string().parse() {
        headers.insert(CONTENT_LENGTH, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, KeyUsage};
    use crate::keycache::{InMemoryKeyCache, KeyCacher};
    use axum::extract::connect_info::MockConnectInfo;
    use axum::routing::post;
    use axum::Router;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    #[test]
    fn classification_corpus() {
        let sym = EncryptionProfile::Symmetric;
        assert!(classify(br#"{"token":"t","encrypted":"e"}"#, sym));
        assert!(classify(br#"  {"encrypted":"e","token":"t"}"#, sym));
        assert!(!classify(br#"{"username":"admin","password":"p"}"#, sym));
        assert!(!classify(br#"["token","encrypted"]"#, sym));
        assert!(!classify(b"username=admin&password=p", sym));
        assert!(!classify(b"", sym));
        assert!(!classify(b"   ", sym));

        let ecdh = EncryptionProfile::Ecdh;
        assert!(classify(br#"{"sessionId":"s","encryptedData":"d"}"#, ecdh));
        assert!(!classify(br#"{"token":"t","encrypted":"e"}"#, ecdh));
    }

    async fn echo_handler(req: Request) -> Response {
        let (parts, body) = req.into_parts();
        let content_type = parts
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let bytes = body.collect().await.unwrap().to_bytes();
        Response::builder()
            .header("x-upstream-content-type", content_type)
            .body(Body::from(bytes))
            .unwrap()
    }

    fn test_state(must_encrypt: Vec<String>) -> Arc<GatewayState> {
        let mut config = Config {
            backend_url: "http://localhost:3000".into(),
            ..Config::default()
        };
        config.encryption.must_encrypt_routes = must_encrypt;

        let cache = KeyCacher::InProcess(InMemoryKeyCache::new(
            Duration::from_secs(60),
            KeyUsage::OneShot,
        ));
        GatewayState::for_tests(config, Arc::new(cache))
    }

    fn test_app(state: Arc<GatewayState>) -> Router {
        Router::new()
            .route("/api/login", post(echo_handler))
            .fallback(echo_handler)
            .layer(axum::middleware::from_fn_with_state(state, decryption))
            .layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))))
    }

    fn envelope(token: &str, key: &[u8], content_type: &str, body: &[u8]) -> String {
        let framed = crypto::encode_framed(content_type, body).unwrap();
        let sealed = crypto::encrypt_aes256_gcm(key, &framed).unwrap();
        serde_json::json!({
            "token": token,
            "encrypted": STANDARD.encode(sealed),
        })
        .to_string()
    }

    fn post_json(uri: &str, body: String) -> Request {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn encrypted_request_is_restored_for_the_upstream() {
        let state = test_state(vec![]);
        let mut key = [0u8; 32];
        crypto::random_bytes(&mut key);
        state
            .key_cache
            .set("tok-1", &key, Duration::from_secs(300))
            .await;

        let body = envelope(
            "tok-1",
            &key,
            "application/x-www-form-urlencoded",
            b"username=admin&password=password",
        );
        let response = test_app(state)
            .oneshot(post_json("/api/login", body))
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        assert_eq!(
            response.headers().get("x-upstream-content-type").unwrap(),
            "application/x-www-form-urlencoded"
        );
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(bytes, &b"username=admin&password=password"[..]);
    }

    #[tokio::test]
    async fn one_shot_token_fails_on_second_use() {
        let state = test_state(vec![]);
        let mut key = [0u8; 32];
        crypto::random_bytes(&mut key);
        state
            .key_cache
            .set("tok-1", &key, Duration::from_secs(300))
            .await;

        let body = envelope("tok-1", &key, "text/plain", b"one");
        let app = test_app(state);

        let first = app
            .clone()
            .oneshot(post_json("/api/login", body.clone()))
            .await
            .unwrap();
        assert_eq!(first.status(), 200);

        let second = app.oneshot(post_json("/api/login", body)).await.unwrap();
        assert_eq!(second.status(), 401);
    }

    #[tokio::test]
    async fn invalid_token_is_unauthorized() {
        let state = test_state(vec![]);
        let mut key = [0u8; 32];
        crypto::random_bytes(&mut key);

        let body = envelope("invalid-or-expired-token", &key, "text/plain", b"x");
        let response = test_app(state)
            .oneshot(post_json("/api/login", body))
            .await
            .unwrap();

        assert_eq!(response.status(), 401);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed["error"]["code"], "INVALID_TOKEN");
    }

    #[tokio::test]
    async fn tampered_ciphertext_is_rejected() {
        let state = test_state(vec![]);
        let mut key = [0u8; 32];
        crypto::random_bytes(&mut key);
        state
            .key_cache
            .set("tok-1", &key, Duration::from_secs(300))
            .await;

        let framed = crypto::encode_framed("text/plain", b"x").unwrap();
        let mut sealed = crypto::encrypt_aes256_gcm(&key, &framed).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        let body = serde_json::json!({
            "token": "tok-1",
            "encrypted": STANDARD.encode(sealed),
        })
        .to_string();

        let response = test_app(state)
            .oneshot(post_json("/api/login", body))
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed["error"]["code"], "DECRYPTION_FAILED");
    }

    #[tokio::test]
    async fn plain_post_to_must_encrypt_route_is_rejected() {
        let state = test_state(vec!["^/api/login$".to_string()]);
        let response = test_app(state)
            .oneshot(post_json(
                "/api/login",
                r#"{"username":"admin","password":"p"}"#.to_string(),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), 422);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed["error"]["code"], "ENCRYPTION_REQUIRED");
    }

    #[tokio::test]
    async fn plain_post_elsewhere_passes_body_intact() {
        let state = test_state(vec!["^/api/login$".to_string()]);
        let response = test_app(state)
            .oneshot(post_json(
                "/api/other",
                r#"{"username":"admin","password":"password"}"#.to_string(),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(bytes, &br#"{"username":"admin","password":"password"}"#[..]);
    }

    #[tokio::test]
    async fn get_requests_pass_through_untouched() {
        let state = test_state(vec![]);
        let req = Request::builder()
            .method(Method::GET)
            .uri("/page")
            .body(Body::empty())
            .unwrap();
        let response = test_app(state).oneshot(req).await.unwrap();
        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn incomplete_envelope_is_rejected() {
        let state = test_state(vec![]);
        // Classified encrypted by the substring probe, but a field is empty.
        let response = test_app(state)
            .oneshot(post_json(
                "/api/login",
                r#"{"token":"","encrypted":""}"#.to_string(),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), 400);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed["error"]["code"], "INCOMPLETE_PAYLOAD");
    }

    #[tokio::test]
    async fn unterminated_envelope_is_malformed() {
        let state = test_state(vec![]);
        let response = test_app(state)
            .oneshot(post_json(
                "/api/login",
                r#"{"token":"t","encrypted":"x""#.to_string(),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), 400);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed["error"]["code"], "MALFORMED_PAYLOAD");
    }
}
