//! Cipher engine for transparent field-level encryption at rest.
//!
//! Provides:
//! - ChaCha20-Poly1305 authenticated encryption of individual field values
//! - Self-describing, versioned envelopes stored as URL-safe base64 text
//! - Argon2id derivation when configured key material is a passphrase
//! - A keyring with one primary key and ordered legacy keys for rotation
//!
//! # Envelope lifecycle
//!
//! New values are always sealed with the primary key. Decryption tries the
//! primary first, then each legacy key, most recent first. Authentication
//! failure under every key is a [`CryptoError::Decryption`], never garbage
//! plaintext.
//!
//! Raw key material never leaves this crate except through
//! [`generate_key`] and [`FieldKey::to_material`]; everything else refers to
//! keys by [`FieldKey::fingerprint`].

mod cipher;
pub mod config;
pub mod envelope;
mod error;
mod key;
mod keyring;

pub use cipher::{NONCE_SIZE, TAG_SIZE};
pub use config::CipherConfig;
pub use envelope::{is_damaged_envelope, is_encrypted, Envelope, Protected, MIN_ENVELOPE_SIZE, VERSION_MARKER};
pub use error::{CryptoError, CryptoResult};
pub use key::{derive_key, generate_key, FieldKey, KdfParams, Salt, KEY_SIZE};
pub use keyring::{FieldCipher, KeyChangeGuard, KeySet, KeySlot};
