//! Rotation and verification error types.

use fieldcrypt_crypto::CryptoError;
use fieldcrypt_storage::StorageError;
use thiserror::Error;

pub type RotationResult<T> = Result<T, RotationError>;

#[derive(Debug, Error)]
pub enum RotationError {
    /// Another rotation holds the guard. The request is rejected, not queued.
    #[error("a key rotation is already in progress")]
    InProgress,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(
        "legacy keys are still needed: {failed} failed, {legacy_only} legacy-only, {plaintext} plaintext values"
    )]
    LegacyRetirementUnsafe {
        failed: usize,
        legacy_only: usize,
        plaintext: usize,
    },

    /// The background re-encryption task panicked or was aborted.
    #[error("background rotation task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
