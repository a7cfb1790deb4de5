use hkdf::Hkdf;
use sha2::Sha256;

use super::random_bytes;

/// Length of the random HKDF salt generated per session.
pub const SALT_LEN: usize = 16;

/// The three keys derived for one session, plus the salt they were derived
/// with. The salt is sent to the peer so both sides reach the same keys.
pub struct SessionKeys {
    pub request_key: [u8; 32],
    pub response_key: [u8; 32],
    pub mac_key: [u8; 32],
    pub salt: [u8; SALT_LEN],
}

/// Derive the session keys from an ECDH shared secret with a fresh salt.
pub fn derive_session_keys(shared_secret: &[u8]) -> SessionKeys {
    let mut salt = [0u8; SALT_LEN];
    random_bytes(&mut salt);
    derive_session_keys_with_salt(shared_secret, salt)
}

/// HKDF-SHA256 derivation with per-role info strings (RFC 5869).
pub fn derive_session_keys_with_salt(shared_secret: &[u8], salt: [u8; SALT_LEN]) -> SessionKeys {
    let hk = Hkdf::<Sha256>::new(Some(&salt), shared_secret);

    let mut keys = SessionKeys {
        request_key: [0u8; 32],
        response_key: [0u8; 32],
        mac_key: [0u8; 32],
        salt,
    };

    // Output length 32 is always valid for HKDF-SHA256; expand cannot fail.
    hk.expand(b"goga v1 request key", &mut keys.request_key)
        .expect("hkdf expand");
    hk.expand(b"goga v1 response key", &mut keys.response_key)
        .expect("hkdf expand");
    hk.expand(b"goga v1 mac key", &mut keys.mac_key)
        .expect("hkdf expand");

    keys
}
