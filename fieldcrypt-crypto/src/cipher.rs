//! ChaCha20-Poly1305 primitives.

use crate::error::{CryptoError, CryptoResult};
use crate::key::FieldKey;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;

pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;

/// Encrypts `plaintext` under `key`, binding `aad`. Returns `(nonce, ciphertext || tag)`.
pub(crate) fn seal(
    key: &FieldKey,
    plaintext: &[u8],
    aad: &[u8],
) -> CryptoResult<([u8; NONCE_SIZE], Vec<u8>)> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));

    let mut nonce = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    Ok((nonce, ciphertext))
}

/// Authenticates and decrypts. Any bit flip in nonce, aad or ciphertext fails.
pub(crate) fn open(
    key: &FieldKey,
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
    aad: &[u8],
) -> CryptoResult<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::Decryption("authentication failed".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let key = FieldKey::generate();
        let (nonce, ct) = seal(&key, b"hello", b"hdr").unwrap();
        assert_eq!(ct.len(), 5 + TAG_SIZE);
        assert_eq!(open(&key, &nonce, &ct, b"hdr").unwrap(), b"hello");
    }

    #[test]
    fn aad_mismatch_fails() {
        let key = FieldKey::generate();
        let (nonce, ct) = seal(&key, b"hello", b"hdr").unwrap();
        assert!(open(&key, &nonce, &ct, b"other").is_err());
    }

    #[test]
    fn wrong_key_fails() {
        let (nonce, ct) = seal(&FieldKey::generate(), b"hello", b"").unwrap();
        assert!(open(&FieldKey::generate(), &nonce, &ct, b"").is_err());
    }

    #[test]
    fn nonces_are_unique() {
        let key = FieldKey::generate();
        let (n1, _) = seal(&key, b"x", b"").unwrap();
        let (n2, _) = seal(&key, b"x", b"").unwrap();
        assert_ne!(n1, n2);
    }
}
