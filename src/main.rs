use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpListener;
use tokio_rustls::rustls::pki_types::PrivateKeyDer;
use tokio_rustls::rustls::ServerConfig as RustlsServerConfig;
use tokio_rustls::TlsAcceptor;
use tower::{Service, ServiceExt};
use tracing::{debug, error, info, warn};
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod config;
mod crypto;
mod error;
mod gateway;
mod keycache;
mod middleware;
mod observability;
mod session;

use config::{Config, EncryptionProfile};
use gateway::GatewayState;
use session::SessionManager;

#[derive(Parser, Debug)]
#[command(name = "goga")]
#[command(about = "Transparent reverse proxy adding confidentiality to POST bodies")]
struct Args {
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    #[arg(long)]
    validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config).await?;

    init_tracing(&config.log)?;
    info!(config_file = %args.config, "configuration loaded");

    if args.validate_config {
        info!("configuration is valid");
        return Ok(());
    }

    observability::metrics::init(&config.metrics).await?;

    // Prepare the injected script tag. With encryption on, the SRI hash of
    // the referenced asset is embedded; a missing or unreadable asset is
    // fatal here rather than at the first rewritten response.
    let prepared = if config.encryption.enabled {
        gateway::prepare_script(&config.script_injection)?
    } else {
        gateway::prepare_script_unverified(&config.script_injection)
    };

    let key_cache = Arc::new(
        keycache::new_key_cacher(&config.key_cache, config.encryption.key_usage)
            .await
            .context("failed to initialize key cache")?,
    );

    let sessions = match config.encryption.profile {
        EncryptionProfile::Ecdh => {
            info!("ecdh session profile enabled");
            Some(Arc::new(SessionManager::new(Duration::from_secs(
                config.session_cache.ttl_seconds,
            ))))
        }
        EncryptionProfile::Symmetric => None,
    };

    let addr: SocketAddr = ([0, 0, 0, 0], config.server.port).into();
    let tls_paths = if !config.server.tls_cert_path.is_empty() {
        Some((
            config.server.tls_cert_path.clone(),
            config.server.tls_key_path.clone(),
        ))
    } else {
        None
    };

    let state = GatewayState::new(config, key_cache.clone(), sessions.clone(), prepared)?;
    let app = gateway::build_app(state);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    match tls_paths {
        Some((cert_path, key_path)) => {
            info!(%addr, "goga gateway starting (HTTPS)");
            serve_tls(listener, app, &cert_path, &key_path).await?;
        }
        None => {
            info!(%addr, "goga gateway starting (HTTP)");
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        }
    }

    info!("cleaning up remaining resources");
    key_cache.stop().await;
    if let Some(sessions) = sessions {
        sessions.stop();
    }

    info!("goga gateway shut down cleanly");
    Ok(())
}

/// Initialize tracing with the configured level and output sinks. Multiple
/// outputs are combined; a file that cannot be opened is skipped with a
/// warning on stderr.
fn init_tracing(config: &config::LogConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.level));

    let mut writer: Option<BoxMakeWriter> = None;
    let paths = if config.output_paths.is_empty() {
        vec!["stdout".to_string()]
    } else {
        config.output_paths.clone()
    };

    for path in &paths {
        let next = match path.as_str() {
            "stdout" => BoxMakeWriter::new(std::io::stdout),
            "stderr" => BoxMakeWriter::new(std::io::stderr),
            file_path => {
                match std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(file_path)
                {
                    Ok(file) => BoxMakeWriter::new(Arc::new(file)),
                    Err(e) => {
                        eprintln!("cannot open log file {file_path}: {e}");
                        continue;
                    }
                }
            }
        };
        writer = Some(match writer {
            None => next,
            Some(previous) => BoxMakeWriter::new(previous.and(next)),
        });
    }

    let writer = writer.unwrap_or_else(|| BoxMakeWriter::new(std::io::stdout));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(writer))
        .init();

    Ok(())
}

/// TLS accept loop serving the app per connection, with upgrade support so
/// the WebSocket hijack works over HTTPS as well.
async fn serve_tls(
    listener: TcpListener,
    app: axum::Router,
    cert_path: &str,
    key_path: &str,
) -> Result<()> {
    let acceptor = build_tls_acceptor(cert_path, key_path)?;
    let mut make_service = app.into_make_service_with_connect_info::<SocketAddr>();

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping TLS listener");
                return Ok(());
            }
        };

        let (tcp, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "failed to accept connection");
                continue;
            }
        };

        let service = match make_service.call(peer).await {
            Ok(service) => service,
            Err(never) => match never {},
        };
        let acceptor = acceptor.clone();

        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(tcp).await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!(%peer, error = %e, "TLS handshake failed");
                    return;
                }
            };

            let io = TokioIo::new(tls_stream);
            let hyper_service = hyper::service::service_fn(move |req| service.clone().oneshot(req));

            if let Err(e) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                .serve_connection_with_upgrades(io, hyper_service)
                .await
            {
                debug!(%peer, error = %e, "connection closed with error");
            }
        });
    }
}

fn build_tls_acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor> {
    let cert_file = std::fs::File::open(cert_path)
        .with_context(|| format!("cannot open TLS certificate {cert_path}"))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut std::io::BufReader::new(cert_file))
        .collect::<std::result::Result<_, _>>()
        .context("failed to parse TLS certificate")?;

    let key_file = std::fs::File::open(key_path)
        .with_context(|| format!("cannot open TLS private key {key_path}"))?;
    let key: PrivateKeyDer = rustls_pemfile::private_key(&mut std::io::BufReader::new(key_file))
        .context("failed to parse TLS private key")?
        .context("no private key found in key file")?;

    let server_config = RustlsServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid TLS certificate or key")?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => warn!("received interrupt signal, shutting down"),
        _ = terminate => warn!("received terminate signal, shutting down"),
    }
}
