//! Key material: raw 256-bit keys, passphrase derivation and fingerprints.

use crate::error::{CryptoError, CryptoResult};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Size of a field encryption key in bytes.
pub const KEY_SIZE: usize = 32;

/// Minimum salt length accepted by Argon2.
pub const MIN_SALT_SIZE: usize = 8;

/// Application-wide salt used when an installation does not configure its own.
///
/// Deterministic so that a remembered passphrase always yields the same key.
const DEFAULT_SALT: &[u8] = b"fieldcrypt.kdf.salt.v1";

/// Argon2id cost parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }
}

/// Salt fed to Argon2id when key material is a passphrase.
#[derive(Clone, PartialEq, Eq)]
pub struct Salt(Vec<u8>);

impl Salt {
    /// The fixed application-wide salt.
    pub fn application_default() -> Self {
        Self(DEFAULT_SALT.to_vec())
    }

    /// An installation-specific salt. Must be at least [`MIN_SALT_SIZE`] bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> CryptoResult<Self> {
        let bytes = bytes.into();
        if bytes.len() < MIN_SALT_SIZE {
            return Err(CryptoError::Configuration(format!(
                "kdf salt must be at least {MIN_SALT_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Default for Salt {
    fn default() -> Self {
        Self::application_default()
    }
}

impl fmt::Debug for Salt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Salt({} bytes)", self.0.len())
    }
}

/// A 256-bit symmetric key. Zeroized on drop, never printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct FieldKey {
    bytes: [u8; KEY_SIZE],
}

impl FieldKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Builds a key from a byte slice that must be exactly [`KEY_SIZE`] long.
    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; KEY_SIZE];
        arr.copy_from_slice(bytes);
        Ok(Self::from_bytes(arr))
    }

    /// Generates a fresh random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Interprets configured key material.
    ///
    /// Material that URL-safe-base64-decodes to exactly 32 bytes is used as
    /// the key verbatim. Anything else is a passphrase and goes through
    /// Argon2id with `salt`, so the same passphrase always yields the same key.
    pub fn from_material(material: &str, salt: &Salt, params: &KdfParams) -> CryptoResult<Self> {
        let material = material.trim();
        if material.is_empty() {
            return Err(CryptoError::Configuration("key material is empty".into()));
        }

        if let Ok(decoded) = URL_SAFE.decode(material) {
            let decoded = Zeroizing::new(decoded);
            if decoded.len() == KEY_SIZE {
                return Self::from_slice(&decoded);
            }
        }

        derive_key(material, salt, params)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// One-way identifier for audit records: hex SHA-256 of the raw key.
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(self.bytes))
    }

    /// Encodes the key as installable configuration material.
    pub fn to_material(&self) -> Zeroizing<String> {
        Zeroizing::new(URL_SAFE.encode(self.bytes))
    }
}

impl PartialEq for FieldKey {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for FieldKey {}

impl fmt::Debug for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fp = self.fingerprint();
        write!(f, "FieldKey({}…)", &fp[..12])
    }
}

/// Derives a key from a passphrase using Argon2id.
pub fn derive_key(passphrase: &str, salt: &Salt, params: &KdfParams) -> CryptoResult<FieldKey> {
    let params = Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut out = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(passphrase.as_bytes(), salt.as_bytes(), &mut out)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

    let key = FieldKey::from_bytes(out);
    out.zeroize();
    Ok(key)
}

/// Produces new random key material for an operator to install before rotating.
pub fn generate_key() -> Zeroizing<String> {
    FieldKey::generate().to_material()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_params() -> KdfParams {
        KdfParams {
            memory_kib: 1024,
            iterations: 1,
            parallelism: 1,
        }
    }

    #[test]
    fn raw_material_is_used_verbatim() {
        let key = FieldKey::generate();
        let material = key.to_material();
        let parsed = FieldKey::from_material(&material, &Salt::default(), &fast_params()).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn passphrase_derivation_is_deterministic() {
        let salt = Salt::default();
        let a = FieldKey::from_material("correct horse battery", &salt, &fast_params()).unwrap();
        let b = FieldKey::from_material("correct horse battery", &salt, &fast_params()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn installation_salt_changes_derived_key() {
        let a = FieldKey::from_material("passphrase", &Salt::default(), &fast_params()).unwrap();
        let salt = Salt::new(b"site-specific-salt".to_vec()).unwrap();
        let b = FieldKey::from_material("passphrase", &salt, &fast_params()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn short_salt_rejected() {
        assert!(matches!(
            Salt::new(b"short".to_vec()),
            Err(CryptoError::Configuration(_))
        ));
    }

    #[test]
    fn empty_material_is_configuration_error() {
        let err = FieldKey::from_material("   ", &Salt::default(), &fast_params()).unwrap_err();
        assert!(matches!(err, CryptoError::Configuration(_)));
    }

    #[test]
    fn base64_of_wrong_length_is_treated_as_passphrase() {
        // "c2hvcnQ=" decodes to 5 bytes, so it must be derived, not rejected
        let key = FieldKey::from_material("c2hvcnQ=", &Salt::default(), &fast_params()).unwrap();
        assert_eq!(key.as_bytes().len(), KEY_SIZE);
    }

    #[test]
    fn fingerprint_is_hex_sha256_and_stable() {
        let key = FieldKey::from_bytes([7u8; KEY_SIZE]);
        let fp = key.fingerprint();
        assert_eq!(fp.len(), 64);
        assert_eq!(fp, key.clone().fingerprint());
        assert!(!fp.contains(&hex::encode([7u8; KEY_SIZE])));
    }

    #[test]
    fn debug_does_not_expose_key_bytes() {
        let key = FieldKey::from_bytes([0xAB; KEY_SIZE]);
        let dbg = format!("{key:?}");
        assert!(!dbg.contains("abab"));
        assert!(dbg.starts_with("FieldKey("));
    }

    #[test]
    fn generated_material_is_url_safe() {
        let material = generate_key();
        assert_eq!(material.len(), 44);
        assert!(
            material
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '=')
        );
    }
}
