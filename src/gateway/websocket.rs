use std::collections::HashSet;
use std::io::{self, Cursor};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::header::{CONNECTION, HOST, UPGRADE},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use super::GatewayState;
use crate::error::GatewayError;
use crate::middleware::buffer_pool::{GLOBAL_BUFFER_POOL, LARGE_BUFFER_SIZE};
use crate::observability::metrics;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_HANDSHAKE_HEAD: usize = 16 * 1024;

trait Io: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}
type BoxedIo = Box<dyn Io>;

/// Outermost middleware: WebSocket upgrade requests are hijacked and
/// relayed to the backend over raw sockets; everything else continues down
/// the chain untouched.
pub async fn websocket_layer(
    State(state): State<Arc<GatewayState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    if !is_websocket_upgrade(req.headers()) {
        return next.run(req).await;
    }

    debug!(uri = %req.uri(), "websocket upgrade request detected");
    match proxy_websocket(state, peer, req).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

/// A request is a WebSocket upgrade iff Connection contains "upgrade" and
/// Upgrade equals "websocket", both case-insensitive.
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let connection = headers
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let upgrade = headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    connection.to_ascii_lowercase().contains("upgrade") && upgrade.eq_ignore_ascii_case("websocket")
}

/// Origin allowlist check. `*` admits everything, including requests with
/// no Origin header; otherwise a missing Origin is rejected.
pub fn is_origin_allowed(headers: &HeaderMap, allowed: &HashSet<String>) -> bool {
    if allowed.contains("*") {
        return true;
    }
    match headers.get("origin").and_then(|v| v.to_str().ok()) {
        Some(origin) => allowed.contains(&origin.to_ascii_lowercase()),
        None => false,
    }
}

async fn proxy_websocket(
    state: Arc<GatewayState>,
    peer: SocketAddr,
    mut req: Request,
) -> Result<Response, GatewayError> {
    if !is_origin_allowed(req.headers(), &state.websocket_origins) {
        warn!(
            event_type = "security",
            client_ip = %peer.ip(),
            uri = %req.uri(),
            "websocket origin rejected"
        );
        metrics::record_security_event("forbidden_origin");
        return Err(GatewayError::ForbiddenOrigin);
    }

    // Take ownership of the client transport. Absence means the HTTP engine
    // cannot hand over the connection.
    let on_upgrade = req
        .extensions_mut()
        .remove::<hyper::upgrade::OnUpgrade>()
        .ok_or(GatewayError::HijackNotSupported)?;

    let backend = state.proxy.backend();
    let host = backend
        .host_str()
        .ok_or_else(|| GatewayError::Config("backend URL has no host".into()))?
        .to_string();
    let port = backend
        .port_or_known_default()
        .ok_or_else(|| GatewayError::Config("backend URL has no port".into()))?;
    let authority = match backend.port() {
        Some(p) => format!("{host}:{p}"),
        None => host.clone(),
    };

    let tcp = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect((host.as_str(), port)))
        .await
        .map_err(|_| GatewayError::BadGateway("websocket upstream dial timed out".into()))?
        .map_err(|e| GatewayError::BadGateway(format!("websocket upstream dial failed: {e}")))?;
    let _ = tcp.set_nodelay(true);

    let mut upstream: BoxedIo = if backend.scheme() == "https" {
        debug!(%host, "connecting to websocket backend over TLS");
        let connector = tls_connector(state.config.websocket.insecure_skip_verify);
        let server_name = ServerName::try_from(host.clone())
            .map_err(|_| GatewayError::BadGateway("invalid backend host for TLS".into()))?;
        let tls = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| GatewayError::BadGateway(format!("TLS handshake with upstream failed: {e}")))?;
        Box::new(tls)
    } else {
        Box::new(tcp)
    };

    // Relay the original handshake request verbatim, with Host rewritten to
    // the upstream authority.
    let head = serialize_request_head(&req, &authority);
    upstream
        .write_all(&head)
        .await
        .map_err(|e| GatewayError::BadGateway(format!("failed to send handshake upstream: {e}")))?;

    let (status, headers, leftover) = read_response_head(&mut upstream).await?;

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(status = status.as_u16(), "websocket handshake refused by upstream");
        let mut response = Response::new(Body::from(leftover));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        return Ok(response);
    }

    metrics::record_websocket_session();
    let uri = req.uri().clone();

    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let client = TokioIo::new(upgraded);
                relay_streams(client, upstream, leftover, &uri.to_string()).await;
            }
            Err(e) => {
                debug!(error = %e, "client connection upgrade failed");
            }
        }
    });

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    *response.headers_mut() = headers;
    Ok(response)
}

fn tls_connector(insecure_skip_verify: bool) -> TlsConnector {
    use tokio_rustls::rustls::{ClientConfig, RootCertStore};

    let config = if insecure_skip_verify {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoVerification::new()))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };

    TlsConnector::from(Arc::new(config))
}

/// Serialize the request line and headers for the upstream handshake.
fn serialize_request_head(req: &Request, authority: &str) -> Vec<u8> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut head = Vec::with_capacity(512);
    head.extend_from_slice(req.method().as_str().as_bytes());
    head.push(b' ');
    head.extend_from_slice(path.as_bytes());
    head.extend_from_slice(b" HTTP/1.1\r\nHost: ");
    head.extend_from_slice(authority.as_bytes());
    head.extend_from_slice(b"\r\n");

    for (name, value) in req.headers() {
        if *name == HOST {
            continue;
        }
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head
}

/// Read and parse the upstream's handshake response head. Returns the
/// status, headers, and any bytes the upstream sent past the head.
async fn read_response_head(
    upstream: &mut BoxedIo,
) -> Result<(StatusCode, HeaderMap, Vec<u8>), GatewayError> {
    let mut buf: Vec<u8> = Vec::with_capacity(4096);

    loop {
        let read = upstream
            .read_buf(&mut buf)
            .await
            .map_err(|e| GatewayError::BadGateway(format!("failed to read upstream handshake: {e}")))?;
        if read == 0 {
            return Err(GatewayError::BadGateway(
                "upstream closed during websocket handshake".into(),
            ));
        }

        if let Some((head_len, status, headers)) = parse_response_head(&buf)? {
            let leftover = buf.split_off(head_len);
            return Ok((status, headers, leftover));
        }

        if buf.len() > MAX_HANDSHAKE_HEAD {
            return Err(GatewayError::BadGateway(
                "upstream handshake response head too large".into(),
            ));
        }
    }
}

fn parse_response_head(
    buf: &[u8],
) -> Result<Option<(usize, StatusCode, HeaderMap)>, GatewayError> {
    let mut header_storage = [httparse::EMPTY_HEADER; 64];
    let mut response = httparse::Response::new(&mut header_storage);

    match response.parse(buf) {
        Ok(httparse::Status::Partial) => Ok(None),
        Ok(httparse::Status::Complete(head_len)) => {
            let code = response
                .code
                .ok_or_else(|| GatewayError::BadGateway("upstream response missing status".into()))?;
            let status = StatusCode::from_u16(code)
                .map_err(|_| GatewayError::BadGateway("invalid upstream status code".into()))?;

            let mut headers = HeaderMap::new();
            for h in response.headers.iter() {
                if let (Ok(name), Ok(value)) = (
                    HeaderName::from_bytes(h.name.as_bytes()),
                    HeaderValue::from_bytes(h.value),
                ) {
                    headers.append(name, value);
                }
            }
            Ok(Some((head_len, status, headers)))
        }
        Err(e) => Err(GatewayError::BadGateway(format!(
            "invalid upstream handshake response: {e}"
        ))),
    }
}

/// Bidirectional copy between the hijacked client stream and the upstream
/// socket. Bytes the upstream sent past its handshake head are prepended to
/// the upstream read side. Either direction ending tears both down.
async fn relay_streams<C>(client: C, upstream: BoxedIo, leftover: Vec<u8>, uri: &str)
where
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);
    let upstream_read = Cursor::new(leftover).chain(upstream_read);

    let client_to_upstream = copy_pooled(client_read, upstream_write);
    let upstream_to_client = copy_pooled(upstream_read, client_write);

    let result = tokio::select! {
        r = client_to_upstream => ("client->upstream", r),
        r = upstream_to_client => ("upstream->client", r),
    };

    match result {
        (direction, Err(e)) if !is_closing_error(&e) => {
            warn!(uri, direction, error = %e, "websocket stream copy failed");
        }
        _ => debug!(uri, "websocket connection closed"),
    }
}

async fn copy_pooled<R, W>(mut reader: R, mut writer: W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = GLOBAL_BUFFER_POOL.get_large();
    buf.resize(LARGE_BUFFER_SIZE, 0);

    let result = async {
        let mut total = 0u64;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                let _ = writer.shutdown().await;
                return Ok(total);
            }
            writer.write_all(&buf[..n]).await?;
            total += n as u64;
        }
    }
    .await;

    GLOBAL_BUFFER_POOL.put(buf);
    result
}

/// Errors that are the expected consequence of one side closing.
fn is_closing_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    ) || e.to_string().contains("closed")
}

mod danger {
    use tokio_rustls::rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use tokio_rustls::rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
    use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use tokio_rustls::rustls::{DigitallySignedStruct, Error, SignatureScheme};

    /// Certificate verifier that accepts everything. Only reachable through
    /// the `websocket.insecure_skip_verify` configuration flag.
    #[derive(Debug)]
    pub struct NoVerification {
        provider: CryptoProvider,
    }

    impl NoVerification {
        pub fn new() -> Self {
            Self {
                provider: tokio_rustls::rustls::crypto::ring::default_provider(),
            }
        }
    }

    impl ServerCertVerifier for NoVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            verify_tls12_signature(
                message,
                cert,
                dss,
                &self.provider.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            verify_tls13_signature(
                message,
                cert,
                dss,
                &self.provider.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.provider
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}
