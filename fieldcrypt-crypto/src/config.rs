//! Key configuration read at process start.

use crate::error::{CryptoError, CryptoResult};
use serde::{Deserialize, Serialize};

pub const PRIMARY_KEY_VAR: &str = "FIELDCRYPT_PRIMARY_KEY";
pub const LEGACY_KEYS_VAR: &str = "FIELDCRYPT_LEGACY_KEYS";
pub const KDF_SALT_VAR: &str = "FIELDCRYPT_KDF_SALT";

/// Key material for the cipher engine.
///
/// Each entry is either URL-safe base64 of a 32-byte key or a passphrase.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct CipherConfig {
    /// Key used for every new encryption.
    pub primary_key: Option<String>,

    /// Retired keys, most recent first. Used only to decrypt.
    #[serde(default)]
    pub legacy_keys: Vec<String>,

    /// Per-installation salt for passphrase derivation. Falls back to the
    /// application-wide salt when unset.
    #[serde(default)]
    pub kdf_salt: Option<String>,
}

impl CipherConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> CryptoResult<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Reads the configuration through an arbitrary variable lookup.
    pub fn from_vars<F>(lookup: F) -> CryptoResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let primary_key = lookup(PRIMARY_KEY_VAR).filter(|v| !v.trim().is_empty());
        if primary_key.is_none() {
            return Err(CryptoError::Configuration(format!(
                "{PRIMARY_KEY_VAR} is not set"
            )));
        }

        let legacy_keys = lookup(LEGACY_KEYS_VAR)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let kdf_salt = lookup(KDF_SALT_VAR).filter(|v| !v.is_empty());

        Ok(Self {
            primary_key,
            legacy_keys,
            kdf_salt,
        })
    }
}

impl std::fmt::Debug for CipherConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherConfig")
            .field("primary_key", &self.primary_key.as_ref().map(|_| "<redacted>"))
            .field("legacy_keys", &self.legacy_keys.len())
            .field("kdf_salt", &self.kdf_salt.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn reads_primary_and_ordered_legacy_keys() {
        let config = CipherConfig::from_vars(lookup(&[
            (PRIMARY_KEY_VAR, "primary-pass"),
            (LEGACY_KEYS_VAR, "newer, older ,,"),
        ]))
        .unwrap();
        assert_eq!(config.primary_key.as_deref(), Some("primary-pass"));
        assert_eq!(config.legacy_keys, vec!["newer", "older"]);
        assert!(config.kdf_salt.is_none());
    }

    #[test]
    fn missing_primary_fails_fast() {
        let err = CipherConfig::from_vars(lookup(&[(LEGACY_KEYS_VAR, "old")])).unwrap_err();
        assert!(matches!(err, CryptoError::Configuration(_)));
    }

    #[test]
    fn blank_primary_fails_fast() {
        assert!(CipherConfig::from_vars(lookup(&[(PRIMARY_KEY_VAR, "  ")])).is_err());
    }

    #[test]
    fn debug_redacts_key_material() {
        let config = CipherConfig::from_vars(lookup(&[(PRIMARY_KEY_VAR, "hunter2-secret")])).unwrap();
        assert!(!format!("{config:?}").contains("hunter2"));
    }

    #[test]
    fn deserializes_from_json() {
        let config: CipherConfig =
            serde_json::from_str(r#"{"primary_key":"k","legacy_keys":["a"]}"#).unwrap();
        assert_eq!(config.legacy_keys, vec!["a"]);
    }
}
