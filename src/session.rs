use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use base64::{engine::general_purpose::URL_SAFE, Engine as _};
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::debug;

use crate::crypto::{ecdh, kdf};

/// One established ECDH session: identifier plus the three derived keys.
pub struct Session {
    pub session_id: String,
    pub request_key: [u8; 32],
    pub response_key: [u8; 32],
    pub mac_key: [u8; 32],
    pub created_at: Instant,
    pub expires_at: Instant,
}

/// Everything the key-exchange endpoint returns to the client.
pub struct SessionHandshake {
    pub session: Arc<Session>,
    pub server_public_key: String,
    pub salt: String,
}

/// Concurrent session store with TTL expiry and a periodic sweeper.
pub struct SessionManager {
    sessions: Arc<DashMap<String, Arc<Session>>>,
    ttl: Duration,
    stop_tx: watch::Sender<bool>,
}

impl SessionManager {
    pub fn new(ttl: Duration) -> Self {
        let sessions: Arc<DashMap<String, Arc<Session>>> = Arc::new(DashMap::new());
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let sweep_interval = ttl.min(Duration::from_secs(300)).max(Duration::from_secs(1));
        {
            let sessions = sessions.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(sweep_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let now = Instant::now();
                            let before = sessions.len();
                            sessions.retain(|_, s| s.expires_at > now);
                            let removed = before - sessions.len();
                            if removed > 0 {
                                debug!(removed, "expired sessions cleaned up");
                            }
                        }
                        _ = stop_rx.changed() => return,
                    }
                }
            });
        }

        Self {
            sessions,
            ttl,
            stop_tx,
        }
    }

    /// Perform the server side of the key exchange: generate an ephemeral
    /// key pair, compute the shared secret against the client public key,
    /// derive the session keys, and store the session.
    pub fn create_session(
        &self,
        client_public_key: &str,
    ) -> Result<SessionHandshake, ecdh::EcdhError> {
        let client_key = ecdh::import_public_key(client_public_key)?;
        let (server_secret, server_public) = ecdh::generate_keypair();
        let shared = ecdh::shared_secret(server_secret, &client_key);
        let keys = kdf::derive_session_keys(&shared);

        let mut id_bytes = [0u8; 16];
        crate::crypto::random_bytes(&mut id_bytes);
        let session_id = URL_SAFE.encode(id_bytes);

        let now = Instant::now();
        let session = Arc::new(Session {
            session_id: session_id.clone(),
            request_key: keys.request_key,
            response_key: keys.response_key,
            mac_key: keys.mac_key,
            created_at: now,
            expires_at: now + self.ttl,
        });

        self.sessions.insert(session_id.clone(), session.clone());
        debug!(%session_id, "ecdh session created");

        Ok(SessionHandshake {
            session,
            server_public_key: ecdh::export_public_key(&server_public),
            salt: base64::engine::general_purpose::STANDARD.encode(keys.salt),
        })
    }

    /// Fetch a live session. An expired session observed on read is removed.
    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        let session = self.sessions.get(session_id)?.clone();
        if session.expires_at <= Instant::now() {
            self.sessions.remove(session_id);
            debug!(session_id, "expired session observed on read, deleted");
            return None;
        }
        Some(session)
    }

    pub fn delete(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    /// Stop the background sweeper. Idempotent.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ecdh::{export_public_key, generate_keypair};

    #[tokio::test]
    async fn create_and_get_session() {
        let manager = SessionManager::new(Duration::from_secs(60));
        let (_, client_public) = generate_keypair();

        let handshake = manager
            .create_session(&export_public_key(&client_public))
            .unwrap();
        assert!(!handshake.server_public_key.is_empty());
        assert!(!handshake.salt.is_empty());

        let fetched = manager.get(&handshake.session.session_id).unwrap();
        assert_eq!(fetched.request_key, handshake.session.request_key);
    }

    #[tokio::test]
    async fn client_can_derive_the_same_keys() {
        use base64::engine::general_purpose::STANDARD;

        let manager = SessionManager::new(Duration::from_secs(60));
        let (client_secret, client_public) = generate_keypair();

        let handshake = manager
            .create_session(&export_public_key(&client_public))
            .unwrap();

        // Client side: shared secret from the server public key + the
        // transmitted salt must reproduce the session keys.
        let server_public =
            crate::crypto::ecdh::import_public_key(&handshake.server_public_key).unwrap();
        let shared = crate::crypto::ecdh::shared_secret(client_secret, &server_public);
        let salt_bytes = STANDARD.decode(&handshake.salt).unwrap();
        let mut salt = [0u8; kdf::SALT_LEN];
        salt.copy_from_slice(&salt_bytes);

        let keys = kdf::derive_session_keys_with_salt(&shared, salt);
        assert_eq!(keys.request_key, handshake.session.request_key);
        assert_eq!(keys.response_key, handshake.session.response_key);
    }

    #[tokio::test]
    async fn rejects_invalid_client_key() {
        let manager = SessionManager::new(Duration::from_secs(60));
        assert!(manager.create_session("garbage!!").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_session_is_invisible() {
        let manager = SessionManager::new(Duration::from_millis(10));
        let (_, client_public) = generate_keypair();
        let handshake = manager
            .create_session(&export_public_key(&client_public))
            .unwrap();

        tokio::time::advance(Duration::from_millis(20)).await;
        assert!(manager.get(&handshake.session.session_id).is_none());
    }

    #[tokio::test]
    async fn delete_removes_the_session() {
        let manager = SessionManager::new(Duration::from_secs(60));
        let (_, client_public) = generate_keypair();
        let handshake = manager
            .create_session(&export_public_key(&client_public))
            .unwrap();

        manager.delete(&handshake.session.session_id);
        assert!(manager.get(&handshake.session.session_id).is_none());
    }
}
