use base64::{engine::general_purpose::STANDARD, Engine as _};
use p256::{
    ecdh::EphemeralSecret,
    elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint},
    pkcs8::DecodePublicKey,
    EncodedPoint, PublicKey,
};
use rand::rngs::OsRng;
use thiserror::Error;

/// Length of an uncompressed P-256 point: 0x04 marker + X + Y.
const UNCOMPRESSED_POINT_LEN: usize = 65;

#[derive(Error, Debug)]
pub enum EcdhError {
    #[error("failed to decode base64 public key: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("invalid public key encoding: expected a 65-byte uncompressed point or SPKI DER")]
    InvalidEncoding,
}

/// Generate a fresh ephemeral P-256 key pair for one key exchange.
pub fn generate_keypair() -> (EphemeralSecret, PublicKey) {
    let secret = EphemeralSecret::random(&mut OsRng);
    let public = secret.public_key();
    (secret, public)
}

/// Export a public key in the format browser WebCrypto produces:
/// base64 of the 65-byte uncompressed point `0x04 || X || Y`.
pub fn export_public_key(public: &PublicKey) -> String {
    let point = public.to_encoded_point(false);
    STANDARD.encode(point.as_bytes())
}

/// Import a peer public key from base64. Accepts the 65-byte uncompressed
/// point form or SPKI DER.
pub fn import_public_key(encoded: &str) -> Result<PublicKey, EcdhError> {
    let data = STANDARD.decode(encoded.trim())?;

    if data.len() == UNCOMPRESSED_POINT_LEN && data[0] == 0x04 {
        let point = EncodedPoint::from_bytes(&data).map_err(|_| EcdhError::InvalidEncoding)?;
        let key = PublicKey::from_encoded_point(&point);
        return Option::<PublicKey>::from(key).ok_or(EcdhError::InvalidEncoding);
    }

    PublicKey::from_public_key_der(&data).map_err(|_| EcdhError::InvalidEncoding)
}

/// Compute the ECDH shared secret (the X coordinate, 32 bytes).
pub fn shared_secret(secret: EphemeralSecret, peer: &PublicKey) -> [u8; 32] {
    let shared = secret.diffie_hellman(peer);
    let mut out = [0u8; 32];
    out.copy_from_slice(shared.raw_secret_bytes().as_slice());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::pkcs8::EncodePublicKey;

    #[test]
    fn export_import_round_trip() {
        let (_, public) = generate_keypair();
        let encoded = export_public_key(&public);
        let imported = import_public_key(&encoded).unwrap();
        assert_eq!(imported, public);
    }

    #[test]
    fn accepts_spki_der_encoding() {
        let (_, public) = generate_keypair();
        let der = public.to_public_key_der().unwrap();
        let encoded = STANDARD.encode(der.as_bytes());
        let imported = import_public_key(&encoded).unwrap();
        assert_eq!(imported, public);
    }

    #[test]
    fn both_sides_derive_the_same_secret() {
        let (client_secret, client_public) = generate_keypair();
        let (server_secret, server_public) = generate_keypair();

        let a = shared_secret(client_secret, &server_public);
        let b = shared_secret(server_secret, &client_public);
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_garbage_keys() {
        assert!(import_public_key("not base64!!!").is_err());
        assert!(import_public_key(&STANDARD.encode([0u8; 65])).is_err());
        assert!(import_public_key(&STANDARD.encode([4u8; 10])).is_err());
    }
}
