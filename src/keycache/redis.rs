use std::time::Duration;

use anyhow::{Context, Result};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::{debug, error, info};

use crate::config::{KeyUsage, RemoteCacheConfig};

/// Key cache backed by a remote Redis instance. Expiry is delegated to the
/// store's native TTL; the one-shot policy maps to `GETDEL`.
pub struct RedisKeyCache {
    conn: MultiplexedConnection,
    usage: KeyUsage,
}

impl RedisKeyCache {
    /// Connect and validate the backend with a bounded `PING`. Failure here
    /// is fatal at startup.
    pub async fn connect(config: &RemoteCacheConfig, usage: KeyUsage) -> Result<Self> {
        let (host, port) = config
            .addr
            .rsplit_once(':')
            .with_context(|| format!("invalid redis address (expected host:port): {}", config.addr))?;
        let port: u16 = port
            .parse()
            .with_context(|| format!("invalid redis port in address: {}", config.addr))?;

        let info = redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(host.to_string(), port),
            redis: redis::RedisConnectionInfo {
                db: config.db,
                username: None,
                password: if config.password.is_empty() {
                    None
                } else {
                    Some(config.password.clone())
                },
            },
        };

        let client = redis::Client::open(info).context("invalid redis connection parameters")?;
        let mut conn = tokio::time::timeout(
            Duration::from_secs(5),
            client.get_multiplexed_tokio_connection(),
        )
        .await
        .context("timed out connecting to redis")?
        .context("failed to connect to redis")?;

        let pong: String = tokio::time::timeout(
            Duration::from_secs(5),
            redis::cmd("PING").query_async(&mut conn),
        )
        .await
        .context("timed out validating redis connection")?
        .context("redis connection validation failed")?;
        debug!(%pong, "redis connection validated");

        Ok(Self { conn, usage })
    }

    pub async fn set(&self, token: &str, key: &[u8], ttl: Duration) {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = conn
            .set_ex(token, key, ttl.as_secs().max(1))
            .await;
        match result {
            Ok(()) => debug!(token, ttl_secs = ttl.as_secs(), "remote key cached"),
            // Non-fatal: the client obtains a fresh key on its next request.
            Err(e) => error!(token, error = %e, "remote key cache set failed"),
        }
    }

    pub async fn get(&self, token: &str) -> Option<Vec<u8>> {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<Option<Vec<u8>>> = match self.usage {
            KeyUsage::OneShot => redis::cmd("GETDEL").arg(token).query_async(&mut conn).await,
            KeyUsage::Reusable => conn.get(token).await,
        };

        match result {
            Ok(Some(key)) => {
                debug!(token, "remote key cache hit");
                Some(key)
            }
            Ok(None) => {
                debug!(token, "remote key cache miss or expired");
                None
            }
            Err(e) => {
                // Backend failures degrade to a miss; the request fails with
                // an invalid-token error rather than an internal error.
                error!(token, error = %e, "remote key cache get failed");
                None
            }
        }
    }

    pub fn stop(&self) {
        info!("remote key cache connection released");
    }
}
