//! Storage and interception error types.

use crate::registry::FieldKind;
use fieldcrypt_crypto::CryptoError;
use thiserror::Error;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] duckdb::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// The same field was declared twice with different kinds. Fatal at startup.
    #[error(
        "field {entity_type}.{field} registered as {existing:?}, conflicting declaration {requested:?}"
    )]
    RegistrationConflict {
        entity_type: String,
        field: String,
        existing: FieldKind,
        requested: FieldKind,
    },

    #[error("invalid field registration: {0}")]
    InvalidRegistration(String),

    /// A protected field could not be opened by any configured key.
    #[error("cannot decrypt {entity_type}.{field} on entity {entity_id}")]
    Decryption {
        entity_type: String,
        entity_id: String,
        field: String,
    },

    #[error("{entity_type}.{field} on entity {entity_id} must hold a string value")]
    InvalidFieldValue {
        entity_type: String,
        entity_id: String,
        field: String,
    },

    #[error("storage lock poisoned")]
    LockPoisoned,
}

impl StorageError {
    /// Whether a stored value failed to decrypt. Boundaries should report
    /// these as a generic configuration failure.
    pub fn is_decryption(&self) -> bool {
        match self {
            StorageError::Decryption { .. } => true,
            StorageError::Crypto(e) => e.is_decryption(),
            _ => false,
        }
    }

    /// Whether this error must stop the process before it serves traffic.
    pub fn is_fatal_configuration(&self) -> bool {
        matches!(
            self,
            StorageError::RegistrationConflict { .. }
                | StorageError::InvalidRegistration(_)
                | StorageError::Crypto(CryptoError::Configuration(_))
        )
    }
}
