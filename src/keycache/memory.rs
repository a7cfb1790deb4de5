use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use tokio::sync::{watch, RwLock};
use tracing::debug;

use crate::config::KeyUsage;

struct CacheEntry {
    key: Vec<u8>,
    expires_at: Instant,
}

/// TTL-bounded in-process key cache. Reads fast-path under the shared lock;
/// expiry-driven deletion upgrades to the exclusive lock and re-checks. A
/// background sweeper deletes expired entries until `stop` is called.
pub struct InMemoryKeyCache {
    items: Arc<RwLock<HashMap<String, CacheEntry>>>,
    usage: KeyUsage,
    stop_tx: watch::Sender<bool>,
}

impl InMemoryKeyCache {
    pub fn new(sweep_interval: Duration, usage: KeyUsage) -> Self {
        let items: Arc<RwLock<HashMap<String, CacheEntry>>> = Arc::new(RwLock::new(HashMap::new()));
        let (stop_tx, mut stop_rx) = watch::channel(false);

        if sweep_interval > Duration::ZERO {
            let items = items.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(sweep_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                // The first tick completes immediately; skip it.
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            Self::delete_expired(&items).await;
                        }
                        _ = stop_rx.changed() => {
                            debug!("key cache sweeper stopped");
                            return;
                        }
                    }
                }
            });
        }

        Self {
            items,
            usage,
            stop_tx,
        }
    }

    pub async fn set(&self, token: &str, key: &[u8], ttl: Duration) {
        let entry = CacheEntry {
            key: key.to_vec(),
            expires_at: Instant::now() + ttl,
        };
        self.items.write().await.insert(token.to_string(), entry);
        debug!(token, ttl_secs = ttl.as_secs(), "key cached");
    }

    pub async fn get(&self, token: &str) -> Option<Vec<u8>> {
        {
            let items = self.items.read().await;
            let entry = match items.get(token) {
                Some(entry) => entry,
                None => {
                    debug!(token, "key cache miss");
                    return None;
                }
            };

            if entry.expires_at > Instant::now() && self.usage == KeyUsage::Reusable {
                debug!(token, "key cache hit");
                return Some(entry.key.clone());
            }
        }

        // Either the entry looked expired, or the one-shot policy requires
        // removal. Re-check under the exclusive lock: another task may have
        // taken or replaced the entry while we upgraded.
        let mut items = self.items.write().await;
        let live = match items.get(token) {
            Some(entry) => entry.expires_at > Instant::now(),
            None => return None,
        };

        if !live {
            items.remove(token);
            debug!(token, "expired key observed on read, deleted");
            return None;
        }

        match self.usage {
            KeyUsage::OneShot => {
                debug!(token, "key cache hit, one-shot entry consumed");
                items.remove(token).map(|entry| entry.key)
            }
            KeyUsage::Reusable => {
                debug!(token, "key cache hit");
                items.get(token).map(|entry| entry.key.clone())
            }
        }
    }

    /// Stop the background sweeper. Idempotent.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    async fn delete_expired(items: &RwLock<HashMap<String, CacheEntry>>) {
        let now = Instant::now();
        let mut items = items.write().await;
        let before = items.len();
        items.retain(|_, entry| entry.expires_at > now);
        let deleted = before - items.len();
        if deleted > 0 {
            debug!(deleted, "key cache sweep completed");
        }
    }
}

impl Drop for InMemoryKeyCache {
    fn drop(&mut self) {
        self.stop();
    }
}
