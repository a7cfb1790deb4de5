pub mod ecdh;
pub mod kdf;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;

/// Key size required by AES-256 (32 bytes).
pub const AES256_KEY_SIZE: usize = 32;
/// Nonce size used by AES-GCM (12 bytes).
pub const NONCE_SIZE: usize = 12;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("invalid key size: must be {AES256_KEY_SIZE} bytes")]
    InvalidKeySize,

    #[error("ciphertext too short")]
    CiphertextTooShort,

    #[error("decryption failed")]
    AeadFailure,

    #[error("framed payload too short")]
    FrameTooShort,

    #[error("framed payload corrupted: declared content-type length exceeds payload")]
    FrameCorrupted,

    #[error("content-type is not valid UTF-8")]
    FrameContentType,

    #[error("content-type exceeds 255 bytes")]
    ContentTypeTooLong,
}

/// Fill `buf` from the operating system CSPRNG.
pub fn random_bytes(buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
}

/// Fallible variant for paths that must answer a request instead of
/// aborting when system randomness is unavailable.
pub fn try_random_bytes(buf: &mut [u8]) -> Result<(), rand::Error> {
    OsRng.try_fill_bytes(buf)
}

/// Encrypt `plaintext` with AES-256-GCM. The returned bytes carry the
/// random 12-byte nonce as a prefix, followed by ciphertext and tag.
pub fn encrypt_aes256_gcm(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if key.len() != AES256_KEY_SIZE {
        return Err(CryptoError::InvalidKeySize);
    }

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeySize)?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    random_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::AeadFailure)?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt AES-256-GCM output produced by [`encrypt_aes256_gcm`]: the input
/// must carry the nonce as a prefix. Authentication failure is reported as
/// [`CryptoError::AeadFailure`] without further detail.
pub fn decrypt_aes256_gcm(key: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if key.len() != AES256_KEY_SIZE {
        return Err(CryptoError::InvalidKeySize);
    }
    if data.len() < NONCE_SIZE {
        return Err(CryptoError::CiphertextTooShort);
    }

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeySize)?;
    let (nonce, ciphertext) = data.split_at(NONCE_SIZE);

    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::AeadFailure)
}

/// Encode the authenticated plaintext frame:
/// `[u8 len][len bytes content-type][body]`.
pub fn encode_framed(content_type: &str, body: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let ct = content_type.as_bytes();
    if ct.len() > u8::MAX as usize {
        return Err(CryptoError::ContentTypeTooLong);
    }

    let mut out = Vec::with_capacity(1 + ct.len() + body.len());
    out.push(ct.len() as u8);
    out.extend_from_slice(ct);
    out.extend_from_slice(body);
    Ok(out)
}

/// Parse the authenticated plaintext frame back into the original
/// content-type and body bytes.
pub fn parse_framed(data: &[u8]) -> Result<(String, Vec<u8>), CryptoError> {
    if data.is_empty() {
        return Err(CryptoError::FrameTooShort);
    }

    let ct_len = data[0] as usize;
    let body_offset = 1 + ct_len;
    if data.len() < body_offset {
        return Err(CryptoError::FrameCorrupted);
    }

    let content_type = std::str::from_utf8(&data[1..body_offset])
        .map_err(|_| CryptoError::FrameContentType)?
        .to_string();

    Ok((content_type, data[body_offset..].to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn random_key() -> [u8; AES256_KEY_SIZE] {
        let mut key = [0u8; AES256_KEY_SIZE];
        random_bytes(&mut key);
        key
    }

    #[test]
    fn seal_open_round_trip() {
        let key = random_key();
        let plaintext = b"username=admin&password=password";

        let sealed = encrypt_aes256_gcm(&key, plaintext).unwrap();
        assert!(sealed.len() > NONCE_SIZE + plaintext.len());

        let opened = decrypt_aes256_gcm(&key, &sealed).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let key = random_key();
        let other = random_key();
        let sealed = encrypt_aes256_gcm(&key, b"secret").unwrap();

        assert!(matches!(
            decrypt_aes256_gcm(&other, &sealed),
            Err(CryptoError::AeadFailure)
        ));
    }

    #[test]
    fn tampered_ciphertext_fails_authentication() {
        let key = random_key();
        let mut sealed = encrypt_aes256_gcm(&key, b"secret").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;

        assert!(decrypt_aes256_gcm(&key, &sealed).is_err());
    }

    #[test]
    fn rejects_bad_key_size_and_short_input() {
        assert!(matches!(
            encrypt_aes256_gcm(&[0u8; 16], b"x"),
            Err(CryptoError::InvalidKeySize)
        ));
        assert!(matches!(
            decrypt_aes256_gcm(&random_key(), &[0u8; 4]),
            Err(CryptoError::CiphertextTooShort)
        ));
    }

    #[test]
    fn frame_round_trip() {
        let framed = encode_framed("application/x-www-form-urlencoded", b"a=1&b=2").unwrap();
        let (ct, body) = parse_framed(&framed).unwrap();
        assert_eq!(ct, "application/x-www-form-urlencoded");
        assert_eq!(body, b"a=1&b=2");
    }

    #[test]
    fn frame_allows_empty_content_type_and_body() {
        let framed = encode_framed("", b"").unwrap();
        assert_eq!(framed, vec![0u8]);
        let (ct, body) = parse_framed(&framed).unwrap();
        assert!(ct.is_empty());
        assert!(body.is_empty());
    }

    #[test]
    fn frame_rejects_truncated_payload() {
        // Declares a 10-byte content-type but carries only 3 bytes.
        let data = [10u8, b'a', b'b', b'c'];
        assert!(matches!(parse_framed(&data), Err(CryptoError::FrameCorrupted)));
        assert!(matches!(parse_framed(&[]), Err(CryptoError::FrameTooShort)));
    }

    #[test]
    fn frame_rejects_oversized_content_type() {
        let ct = "x".repeat(256);
        assert!(matches!(
            encode_framed(&ct, b""),
            Err(CryptoError::ContentTypeTooLong)
        ));
    }
}
