//! Error types for the cipher engine.

use thiserror::Error;

/// Result type for cipher engine operations.
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Errors produced by key handling and envelope encryption.
///
/// Messages never carry plaintext, key material or envelope text.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Primary key missing or structurally invalid. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    /// No configured key could authenticate the envelope.
    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },
}

impl CryptoError {
    /// Whether this error means a stored value could not be opened.
    pub fn is_decryption(&self) -> bool {
        matches!(self, CryptoError::Decryption(_))
    }
}
