//! Envelope sealing: ChaCha20-Poly1305 keyed by the per-connection shared
//! secret. The key-derivation input is the shared secret's own bytes (the
//! base64 form is what callers pass around and log-redact; decoding it
//! recovers the raw 32-byte key material).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};

use crate::protocol::{ErrorCode, ProtocolError};

const NONCE_LEN: usize = 12;

pub fn key_from_shared_secret(shared_secret: &[u8; 32]) -> Key {
    *Key::from_slice(shared_secret)
}

pub fn key_from_base64(shared_secret_b64: &str) -> Result<Key, ProtocolError> {
    let bytes = BASE64
        .decode(shared_secret_b64)
        .map_err(|e| ProtocolError::new(ErrorCode::InvalidMessage, format!("bad shared secret encoding: {e}")))?;
    if bytes.len() != 32 {
        return Err(ProtocolError::new(ErrorCode::InvalidMessage, "shared secret must be 32 bytes"));
    }
    Ok(*Key::from_slice(&bytes))
}

/// Seal `plaintext` into `nonce || ciphertext || tag`.
pub fn seal(key: &Key, plaintext: &[u8]) -> Vec<u8> {
    let cipher = ChaCha20Poly1305::new(key);
    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
    let mut out = Vec::with_capacity(NONCE_LEN + plaintext.len() + 16);
    out.extend_from_slice(&nonce);
    // generate_nonce produces exactly NONCE_LEN bytes for this cipher.
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .expect("chacha20poly1305 encryption does not fail for in-memory buffers");
    out.extend_from_slice(&ciphertext);
    out
}

/// Open a blob produced by [`seal`]. Returns `None` on any malformed input
/// or authentication failure — callers must treat this as "drop the
/// message", never as a reason to tear down the connection.
pub fn open(key: &Key, sealed: &[u8]) -> Option<Vec<u8>> {
    if sealed.len() < NONCE_LEN {
        return None;
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);
    let cipher = ChaCha20Poly1305::new(key);
    cipher.decrypt(nonce, ciphertext).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_then_open_round_trips() {
        let key = key_from_shared_secret(&[7u8; 32]);
        let sealed = seal(&key, b"hello peer");
        let opened = open(&key, &sealed).unwrap();
        assert_eq!(opened, b"hello peer");
    }

    #[test]
    fn wrong_key_fails_to_open() {
        let key_a = key_from_shared_secret(&[1u8; 32]);
        let key_b = key_from_shared_secret(&[2u8; 32]);
        let sealed = seal(&key_a, b"secret");
        assert!(open(&key_b, &sealed).is_none());
    }

    #[test]
    fn truncated_blob_fails_to_open() {
        let key = key_from_shared_secret(&[3u8; 32]);
        assert!(open(&key, &[0u8; 4]).is_none());
    }

    #[test]
    fn base64_key_round_trips_with_raw_key() {
        let raw = [9u8; 32];
        let encoded = BASE64.encode(raw);
        let from_b64 = key_from_base64(&encoded).unwrap();
        let from_raw = key_from_shared_secret(&raw);
        assert_eq!(from_b64.as_slice(), from_raw.as_slice());
    }
}
