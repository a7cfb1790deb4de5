pub mod proxy;
pub mod rewriter;
pub mod websocket;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header::CONTENT_TYPE, Method},
    middleware::from_fn,
    middleware::from_fn_with_state,
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE},
    Engine as _,
};
use http_body_util::BodyExt;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha384};
use tower_http::catch_panic::CatchPanicLayer;
use tracing::{debug, error, info, warn};

use crate::config::{Config, EncryptionProfile};
use crate::error::GatewayError;
use crate::keycache::KeyCacher;
use crate::middleware::decryption::decryption;
use crate::middleware::health::health_check;
use crate::middleware::logging::access_log;
use crate::middleware::request_id::request_id;
use crate::middleware::security_headers::security_headers;
use crate::observability::metrics;
use crate::session::SessionManager;

/// Script tag prepared at startup, with the URL route and local file of the
/// asset it references.
pub struct PreparedScript {
    pub tag: Vec<u8>,
    pub route: String,
    pub file: PathBuf,
}

/// Shared state behind every handler and middleware.
pub struct GatewayState {
    pub config: Arc<Config>,
    pub key_cache: Arc<KeyCacher>,
    pub sessions: Option<Arc<SessionManager>>,
    pub proxy: proxy::ReverseProxy,
    pub script: Arc<Vec<u8>>,
    pub script_route: String,
    pub script_file: PathBuf,
    pub must_encrypt: Vec<Regex>,
    pub websocket_origins: HashSet<String>,
    pub tls_enabled: bool,
    pub key_ttl: Duration,
}

impl GatewayState {
    pub fn new(
        config: Config,
        key_cache: Arc<KeyCacher>,
        sessions: Option<Arc<SessionManager>>,
        prepared: PreparedScript,
    ) -> Result<Arc<Self>> {
        let proxy = proxy::ReverseProxy::new(&config.backend_url)
            .context("failed to initialize reverse proxy")?;

        let must_encrypt = compile_must_encrypt(&config.encryption.must_encrypt_routes);
        let websocket_origins = config
            .websocket
            .allowed_origins
            .iter()
            .map(|o| o.to_ascii_lowercase())
            .collect();

        let tls_enabled =
            !config.server.tls_cert_path.is_empty() && !config.server.tls_key_path.is_empty();
        let key_ttl = Duration::from_secs(config.key_cache.ttl_seconds);

        Ok(Arc::new(Self {
            config: Arc::new(config),
            key_cache,
            sessions,
            proxy,
            script: Arc::new(prepared.tag),
            script_route: prepared.route,
            script_file: prepared.file,
            must_encrypt,
            websocket_origins,
            tls_enabled,
            key_ttl,
        }))
    }

    pub fn is_must_encrypt_path(&self, path: &str) -> bool {
        self.must_encrypt.iter().any(|re| re.is_match(path))
    }

    #[cfg(test)]
    pub fn for_tests(config: Config, key_cache: Arc<KeyCacher>) -> Arc<Self> {
        let prepared = PreparedScript {
            tag: config.script_injection.script_content.clone().into_bytes(),
            route: "/goga-crypto.min.js".to_string(),
            file: PathBuf::from("static/goga-crypto.min.js"),
        };
        let sessions = match config.encryption.profile {
            EncryptionProfile::Ecdh => Some(Arc::new(SessionManager::new(Duration::from_secs(
                config.session_cache.ttl_seconds,
            )))),
            EncryptionProfile::Symmetric => None,
        };
        Self::new(config, key_cache, sessions, prepared).expect("test state")
    }
}

/// Compile the must-encrypt route patterns. Invalid patterns are logged and
/// skipped; they never abort startup.
fn compile_must_encrypt(patterns: &[String]) -> Vec<Regex> {
    let mut compiled = Vec::with_capacity(patterns.len());
    for pattern in patterns {
        match Regex::new(pattern) {
            Ok(re) => compiled.push(re),
            Err(e) => {
                error!(%pattern, error = %e, "invalid must-encrypt route pattern, ignored");
            }
        }
    }
    compiled
}

/// Augment the configured script tag with a Subresource Integrity hash of
/// the referenced asset. Runs once at startup; any failure is fatal.
pub fn prepare_script(
    config: &crate::config::ScriptInjectionConfig,
) -> Result<PreparedScript> {
    let tag = &config.script_content;

    let src_re = Regex::new(r#"src="([^"]+)""#).expect("static pattern");
    let route = src_re
        .captures(tag)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .with_context(|| format!("no src attribute in script_injection.script_content: {tag}"))?;

    if !route.starts_with('/') {
        anyhow::bail!("script src must be an absolute path: {route}");
    }

    let file = PathBuf::from(&config.asset_dir).join(route.trim_start_matches('/'));
    let content = std::fs::read(&file)
        .with_context(|| format!("cannot read script asset {}", file.display()))?;

    let digest = Sha384::digest(&content);
    let sri = format!("sha384-{}", STANDARD.encode(digest));

    let insertion_point = tag
        .find('>')
        .with_context(|| format!("malformed script tag: {tag}"))?;
    let prepared = format!(
        r#"{} integrity="{}" crossorigin="anonymous"{}"#,
        &tag[..insertion_point],
        sri,
        &tag[insertion_point..],
    );

    info!(%route, "script tag prepared with SRI hash");
    Ok(PreparedScript {
        tag: prepared.into_bytes(),
        route,
        file,
    })
}

/// Variant used when encryption is disabled: no injection happens, so the
/// tag is kept as configured and a missing asset is not fatal.
pub fn prepare_script_unverified(
    config: &crate::config::ScriptInjectionConfig,
) -> PreparedScript {
    let src_re = Regex::new(r#"src="([^"]+)""#).expect("static pattern");
    let route = src_re
        .captures(&config.script_content)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|r| r.starts_with('/'))
        .unwrap_or_else(|| "/goga-crypto.min.js".to_string());
    let file = PathBuf::from(&config.asset_dir).join(route.trim_start_matches('/'));

    PreparedScript {
        tag: config.script_content.clone().into_bytes(),
        route,
        file,
    }
}

#[derive(Serialize)]
struct KeyResponse {
    key: String,
    token: String,
    ttl: u64,
}

/// `GET /goga/api/v1/key`: mint a one-time key and token, cache the pair,
/// return both to the client.
async fn key_distribution(State(state): State<Arc<GatewayState>>, req: Request) -> Response {
    if req.method() != Method::GET {
        warn!(
            event_type = "security",
            method = %req.method(),
            "key distribution endpoint received non-GET request"
        );
        return GatewayError::MethodNotAllowed("this endpoint only supports GET".into())
            .into_response();
    }

    let mut key = [0u8; 32];
    let mut token_bytes = [0u8; 32];
    if crate::crypto::try_random_bytes(&mut key).is_err()
        || crate::crypto::try_random_bytes(&mut token_bytes).is_err()
    {
        error!("system randomness unavailable for key generation");
        return GatewayError::KeyGenerationFailed.into_response();
    }

    let token = URL_SAFE.encode(token_bytes);
    state.key_cache.set(&token, &key, state.key_ttl).await;
    metrics::record_key_issued();
    debug!(%token, "one-time key generated and cached");

    Json(KeyResponse {
        key: STANDARD.encode(key),
        token,
        ttl: state.key_ttl.as_secs(),
    })
    .into_response()
}

#[derive(Deserialize)]
struct KeyExchangeRequest {
    #[serde(default, rename = "clientPublicKey")]
    client_public_key: String,
}

#[derive(Serialize)]
struct KeyExchangeResponse {
    #[serde(rename = "serverPublicKey")]
    server_public_key: String,
    #[serde(rename = "sessionId")]
    session_id: String,
    salt: String,
    ttl: u64,
}

/// `POST /goga/api/v1/key-exchange`: ECDH handshake for the session
/// profile. The HKDF salt is returned so the client derives matching keys.
async fn key_exchange(State(state): State<Arc<GatewayState>>, req: Request) -> Response {
    if req.method() != Method::POST {
        warn!(
            event_type = "security",
            method = %req.method(),
            "key exchange endpoint received non-POST request"
        );
        return GatewayError::MethodNotAllowed("this endpoint only supports POST".into())
            .into_response();
    }

    let sessions = match &state.sessions {
        Some(sessions) => sessions.clone(),
        None => {
            return GatewayError::Internal("session manager not configured".into()).into_response()
        }
    };

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            error!(error = %e, "failed to read key exchange request body");
            return GatewayError::Internal("failed to read request body".into()).into_response();
        }
    };

    let request: KeyExchangeRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(_) => {
            return GatewayError::MalformedPayload("invalid key exchange request".into())
                .into_response()
        }
    };

    if request.client_public_key.is_empty() {
        return GatewayError::MalformedPayload("clientPublicKey is required".into()).into_response();
    }

    let handshake = match sessions.create_session(&request.client_public_key) {
        Ok(handshake) => handshake,
        Err(e) => {
            warn!(error = %e, "rejected client public key in key exchange");
            return GatewayError::MalformedPayload("invalid client public key".into())
                .into_response();
        }
    };

    debug!(session_id = %handshake.session.session_id, "key exchange completed");

    Json(KeyExchangeResponse {
        server_public_key: handshake.server_public_key,
        session_id: handshake.session.session_id.clone(),
        salt: handshake.salt,
        ttl: state.config.session_cache.ttl_seconds,
    })
    .into_response()
}

/// Serve the client-side crypto script referenced by the injected tag.
async fn serve_script(State(state): State<Arc<GatewayState>>) -> Response {
    match tokio::fs::read(&state.script_file).await {
        Ok(content) => {
            let mut response = Response::new(Body::from(content));
            response.headers_mut().insert(
                CONTENT_TYPE,
                "application/javascript; charset=utf-8".parse().expect("static header"),
            );
            response
        }
        Err(e) => {
            error!(file = %state.script_file.display(), error = %e, "script asset unavailable");
            GatewayError::NotFound.into_response()
        }
    }
}

async fn proxy_handler(
    State(state): State<Arc<GatewayState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    match state.proxy.handle(&state, peer, req).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

fn handle_panic(err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "unknown panic".to_string()
    };
    error!(panic = %detail, "handler panicked");
    GatewayError::Internal("internal server error".into()).into_response()
}

/// Compose the full handler chain. Layer order, outermost first: recovery,
/// websocket hijack, security headers, request ID, access log, health
/// check, decryption, router.
pub fn build_app(state: Arc<GatewayState>) -> Router {
    let mut routes = Router::new().route("/goga/api/v1/key", any(key_distribution));

    if state.config.encryption.profile == EncryptionProfile::Ecdh {
        routes = routes.route("/goga/api/v1/key-exchange", any(key_exchange));
    }

    let routes = routes
        .route(&state.script_route, get(serve_script))
        .fallback(proxy_handler)
        .with_state(state.clone());

    let mut app = routes;
    if state.config.encryption.enabled {
        app = app.layer(from_fn_with_state(state.clone(), decryption));
    } else {
        warn!("encryption disabled, running as a plain reverse proxy");
    }

    app.layer(from_fn(health_check))
        .layer(from_fn(access_log))
        .layer(from_fn(request_id))
        .layer(from_fn_with_state(state.clone(), security_headers))
        .layer(from_fn_with_state(state, websocket::websocket_layer))
        .layer(CatchPanicLayer::custom(handle_panic))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeyUsage;
    use crate::keycache::InMemoryKeyCache;
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::StatusCode;
    use tower::ServiceExt;

    fn test_state() -> Arc<GatewayState> {
        let config = Config {
            backend_url: "http://localhost:3000".into(),
            ..Config::default()
        };
        let cache = KeyCacher::InProcess(InMemoryKeyCache::new(
            Duration::from_secs(60),
            KeyUsage::OneShot,
        ));
        GatewayState::for_tests(config, Arc::new(cache))
    }

    fn key_route_app(state: Arc<GatewayState>) -> Router {
        Router::new()
            .route("/goga/api/v1/key", any(key_distribution))
            .with_state(state)
            .layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))))
    }

    #[tokio::test]
    async fn key_distribution_returns_key_token_ttl() {
        let state = test_state();
        let response = key_route_app(state.clone())
            .oneshot(
                Request::builder()
                    .method(Method::GET)
                    .uri("/goga/api/v1/key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        let key = STANDARD.decode(parsed["key"].as_str().unwrap()).unwrap();
        assert_eq!(key.len(), 32);
        let token = parsed["token"].as_str().unwrap();
        assert_eq!(URL_SAFE.decode(token).unwrap().len(), 32);
        assert_eq!(parsed["ttl"].as_u64().unwrap(), 300);

        // The minted key is retrievable under its token.
        let cached = state.key_cache.get(token).await.unwrap();
        assert_eq!(cached, key);
    }

    #[tokio::test]
    async fn key_distribution_rejects_other_methods() {
        let response = key_route_app(test_state())
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/goga/api/v1/key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed["error"]["code"], "METHOD_NOT_ALLOWED");
    }

    #[tokio::test]
    async fn key_exchange_round_trip() {
        let mut config = Config {
            backend_url: "http://localhost:3000".into(),
            ..Config::default()
        };
        config.encryption.profile = EncryptionProfile::Ecdh;
        let cache = KeyCacher::InProcess(InMemoryKeyCache::new(
            Duration::from_secs(60),
            KeyUsage::OneShot,
        ));
        let state = GatewayState::for_tests(config, Arc::new(cache));

        let (_, client_public) = crate::crypto::ecdh::generate_keypair();
        let body = serde_json::json!({
            "clientPublicKey": crate::crypto::ecdh::export_public_key(&client_public),
        })
        .to_string();

        let app = Router::new()
            .route("/goga/api/v1/key-exchange", any(key_exchange))
            .with_state(state.clone())
            .layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))));

        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/goga/api/v1/key-exchange")
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        let session_id = parsed["sessionId"].as_str().unwrap();
        assert!(state.sessions.as_ref().unwrap().get(session_id).is_some());
        assert!(!parsed["serverPublicKey"].as_str().unwrap().is_empty());
        assert!(!parsed["salt"].as_str().unwrap().is_empty());
    }

    #[test]
    fn invalid_must_encrypt_patterns_are_skipped() {
        let compiled = compile_must_encrypt(&[
            "^/api/login$".to_string(),
            "([unclosed".to_string(),
            "^/api/payment".to_string(),
        ]);
        assert_eq!(compiled.len(), 2);
    }

    #[test]
    fn sri_preparation_rewrites_the_tag() {
        let dir = std::env::temp_dir().join(format!("goga-sri-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("goga-crypto.min.js"), b"console.log('goga');").unwrap();

        let config = crate::config::ScriptInjectionConfig {
            script_content: r#"<script src="/goga-crypto.min.js" defer></script>"#.to_string(),
            asset_dir: dir.to_string_lossy().into_owned(),
        };

        let prepared = prepare_script(&config).unwrap();
        let tag = String::from_utf8(prepared.tag).unwrap();

        assert!(tag.contains(r#"integrity="sha384-"#));
        assert!(tag.contains(r#"crossorigin="anonymous""#));
        assert!(tag.ends_with("></script>"));
        assert_eq!(prepared.route, "/goga-crypto.min.js");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn sri_preparation_fails_without_asset() {
        let config = crate::config::ScriptInjectionConfig {
            script_content: r#"<script src="/missing.js"></script>"#.to_string(),
            asset_dir: "/nonexistent-dir".to_string(),
        };
        assert!(prepare_script(&config).is_err());
    }
}
