pub mod memory;
pub mod redis;

use std::time::Duration;

use anyhow::Result;
use tracing::info;

use crate::config::{KeyCacheConfig, KeyUsage};

pub use memory::InMemoryKeyCache;
pub use redis::RedisKeyCache;

/// The key cache behind the gateway's `{set, get, stop}` capability set.
/// Two interchangeable variants; nothing backend-specific leaks into the
/// request path.
pub enum KeyCacher {
    InProcess(InMemoryKeyCache),
    Remote(RedisKeyCache),
}

impl KeyCacher {
    /// Store `key` under `token` for `ttl`. Backend errors are logged by the
    /// variant and treated as non-fatal; the client retries on its next
    /// request.
    pub async fn set(&self, token: &str, key: &[u8], ttl: Duration) {
        match self {
            KeyCacher::InProcess(c) => c.set(token, key, ttl).await,
            KeyCacher::Remote(c) => c.set(token, key, ttl).await,
        }
    }

    /// Look up the key for `token`. Never returns an expired key. Under the
    /// one-shot policy a successful lookup atomically removes the entry.
    pub async fn get(&self, token: &str) -> Option<Vec<u8>> {
        match self {
            KeyCacher::InProcess(c) => c.get(token).await,
            KeyCacher::Remote(c) => c.get(token).await,
        }
    }

    /// Stop background work and release backend resources.
    pub async fn stop(&self) {
        match self {
            KeyCacher::InProcess(c) => c.stop(),
            KeyCacher::Remote(c) => c.stop(),
        }
    }
}

/// Build the configured cache variant. Remote connection validation happens
/// here; a failure is fatal at startup.
pub async fn new_key_cacher(config: &KeyCacheConfig, usage: KeyUsage) -> Result<KeyCacher> {
    match config.cache_type.as_str() {
        "in-process" => {
            info!("initializing in-process key cache");
            let sweep_interval = Duration::from_secs(config.ttl_seconds);
            Ok(KeyCacher::InProcess(InMemoryKeyCache::new(
                sweep_interval,
                usage,
            )))
        }
        "remote" => {
            info!(addr = %config.remote.addr, db = config.remote.db, "initializing remote key cache");
            let cache = RedisKeyCache::connect(&config.remote, usage).await?;
            Ok(KeyCacher::Remote(cache))
        }
        other => anyhow::bail!("unsupported key_cache type: {}", other),
    }
}
