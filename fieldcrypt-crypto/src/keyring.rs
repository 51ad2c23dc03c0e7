//! The cipher engine: one primary key for new envelopes, legacy keys for fallback.

use crate::config::CipherConfig;
use crate::envelope::{Envelope, Protected};
use crate::error::{CryptoError, CryptoResult};
use crate::key::{FieldKey, KdfParams, Salt};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, TryLockError};
use zeroize::Zeroizing;

/// Which configured key opened an envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeySlot {
    Primary,
    /// Index into the legacy list, most recent first.
    Legacy(usize),
}

/// Immutable snapshot of the configured keys.
#[derive(Clone, Debug)]
pub struct KeySet {
    primary: FieldKey,
    legacy: Vec<FieldKey>,
}

impl KeySet {
    pub fn new(primary: FieldKey, legacy: Vec<FieldKey>) -> Self {
        Self { primary, legacy }
    }

    pub fn primary(&self) -> &FieldKey {
        &self.primary
    }

    pub fn legacy(&self) -> &[FieldKey] {
        &self.legacy
    }
}

/// Exclusive right to change the keyring, held across a whole rotation.
pub struct KeyChangeGuard<'a> {
    _lock: MutexGuard<'a, ()>,
}

/// Thread-safe cipher engine.
///
/// Readers clone an `Arc<KeySet>` snapshot, so encrypt/decrypt never observe
/// a half-installed key. Only [`FieldCipher::install_primary`] and
/// [`FieldCipher::retire_legacy`] replace the snapshot. Callers that change
/// keys serialize through [`FieldCipher::try_begin_key_change`].
pub struct FieldCipher {
    keys: RwLock<Arc<KeySet>>,
    key_change: Mutex<()>,
    kdf_salt: Salt,
}

impl FieldCipher {
    pub fn new(primary: FieldKey, legacy: Vec<FieldKey>) -> Self {
        Self {
            keys: RwLock::new(Arc::new(KeySet::new(primary, legacy))),
            key_change: Mutex::new(()),
            kdf_salt: Salt::application_default(),
        }
    }

    /// Salt used to derive keys from passphrase material.
    pub fn with_kdf_salt(mut self, salt: Salt) -> Self {
        self.kdf_salt = salt;
        self
    }

    pub fn kdf_salt(&self) -> &Salt {
        &self.kdf_salt
    }

    /// Parses key material the same way the configured keys were parsed.
    pub fn key_from_material(&self, material: &str) -> CryptoResult<FieldKey> {
        FieldKey::from_material(material, &self.kdf_salt, &KdfParams::default())
    }

    /// Claims the single key-change slot. `None` while another holder has it.
    pub fn try_begin_key_change(&self) -> Option<KeyChangeGuard<'_>> {
        let lock = match self.key_change.try_lock() {
            Ok(lock) => lock,
            Err(TryLockError::WouldBlock) => return None,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };
        Some(KeyChangeGuard { _lock: lock })
    }

    /// Builds the keyring from configuration. A missing primary key is fatal.
    pub fn from_config(config: &CipherConfig) -> CryptoResult<Self> {
        let salt = match &config.kdf_salt {
            Some(s) => Salt::new(s.as_bytes().to_vec())?,
            None => Salt::application_default(),
        };
        let params = KdfParams::default();

        let primary_material = config
            .primary_key
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(|| CryptoError::Configuration("primary key is not configured".into()))?;
        let primary = FieldKey::from_material(primary_material, &salt, &params)?;

        let legacy = config
            .legacy_keys
            .iter()
            .filter(|m| !m.trim().is_empty())
            .map(|m| FieldKey::from_material(m, &salt, &params))
            .collect::<CryptoResult<Vec<_>>>()?;

        Ok(Self::new(primary, legacy).with_kdf_salt(salt))
    }

    /// Current key snapshot.
    pub fn snapshot(&self) -> Arc<KeySet> {
        match self.keys.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Encrypts under the primary key.
    pub fn encrypt(&self, plaintext: &[u8]) -> CryptoResult<Envelope> {
        Envelope::seal(self.snapshot().primary(), plaintext)
    }

    /// Tries the primary key, then each legacy key in recency order.
    pub fn decrypt(&self, envelope: &Envelope) -> CryptoResult<Vec<u8>> {
        self.decrypt_with_slot(envelope).map(|(plaintext, _)| plaintext)
    }

    /// Like [`FieldCipher::decrypt`] but also reports which key succeeded.
    pub fn decrypt_with_slot(&self, envelope: &Envelope) -> CryptoResult<(Vec<u8>, KeySlot)> {
        let keys = self.snapshot();

        if let Ok(plaintext) = envelope.open(keys.primary()) {
            return Ok((plaintext, KeySlot::Primary));
        }
        for (idx, key) in keys.legacy().iter().enumerate() {
            if let Ok(plaintext) = envelope.open(key) {
                return Ok((plaintext, KeySlot::Legacy(idx)));
            }
        }

        Err(CryptoError::Decryption(format!(
            "no configured key authenticates this envelope ({} tried)",
            1 + keys.legacy().len()
        )))
    }

    /// Decrypts text, which must be an envelope.
    pub fn decrypt_text(&self, text: &str) -> CryptoResult<Vec<u8>> {
        let envelope = Envelope::parse(text)
            .ok_or_else(|| CryptoError::Decryption("value is not an envelope".into()))?;
        self.decrypt(&envelope)
    }

    /// Write-path entry point: plain values are encrypted, envelopes pass through.
    pub fn seal(&self, value: Protected) -> CryptoResult<Envelope> {
        match value {
            Protected::Sealed(envelope) => Ok(envelope),
            Protected::Plain(plain) => {
                let plain = Zeroizing::new(plain);
                self.encrypt(plain.as_bytes())
            }
        }
    }

    /// Encrypts a string for use outside the persistence path.
    pub fn encrypt_value(&self, plaintext: &str) -> CryptoResult<String> {
        self.encrypt(plaintext.as_bytes()).map(Envelope::into_string)
    }

    /// Decrypts a raw stored value for use outside the persistence path.
    ///
    /// Values that are not envelopes are returned unchanged, since storage
    /// may still hold plaintext written before encryption was enabled.
    pub fn decrypt_value(&self, raw: &str) -> CryptoResult<String> {
        match Protected::classify(raw) {
            Protected::Plain(plain) => Ok(plain),
            Protected::Sealed(envelope) => {
                let bytes = self.decrypt(&envelope)?;
                String::from_utf8(bytes)
                    .map_err(|_| CryptoError::Decryption("plaintext is not valid UTF-8".into()))
            }
        }
    }

    /// Makes `new_primary` the primary key. The displaced primary becomes the
    /// most recent legacy key. Returns the replaced snapshot.
    pub fn install_primary(&self, new_primary: FieldKey) -> Arc<KeySet> {
        let mut guard = match self.keys.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let previous = guard.clone();

        let mut legacy = Vec::with_capacity(previous.legacy().len() + 1);
        legacy.push(previous.primary().clone());
        legacy.extend(previous.legacy().iter().cloned());
        legacy.retain(|k| *k != new_primary);

        *guard = Arc::new(KeySet::new(new_primary, legacy));
        previous
    }

    /// Drops every legacy key. Envelopes only those keys could open become
    /// permanently unreadable.
    pub fn retire_legacy(&self) -> usize {
        let mut guard = match self.keys.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let retired = guard.legacy().len();
        let primary = guard.primary().clone();
        *guard = Arc::new(KeySet::new(primary, Vec::new()));
        retired
    }

    /// Fingerprint of the current primary key.
    pub fn primary_fingerprint(&self) -> String {
        self.snapshot().primary().fingerprint()
    }

    pub fn legacy_count(&self) -> usize {
        self.snapshot().legacy().len()
    }
}

impl std::fmt::Debug for FieldCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys = self.snapshot();
        f.debug_struct("FieldCipher")
            .field("primary", keys.primary())
            .field("legacy", &keys.legacy().len())
            .finish()
    }
}
