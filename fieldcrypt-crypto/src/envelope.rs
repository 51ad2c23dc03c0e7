//! Self-describing ciphertext envelopes.
//!
//! Binary layout, URL-safe base64 encoded for storage in text columns:
//!
//! ```text
//! marker (4) | issued_at u64 BE (8) | nonce (12) | ciphertext + Poly1305 tag
//! ```
//!
//! The marker and timestamp form the associated data, so the whole envelope
//! is authenticated. Detecting whether a stored value is an envelope needs
//! nothing but the text itself.

use crate::cipher::{self, NONCE_SIZE, TAG_SIZE};
use crate::error::{CryptoError, CryptoResult};
use crate::key::FieldKey;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use chrono::{DateTime, Utc};
use std::fmt;

/// Leading bytes of every version-1 envelope.
pub const VERSION_MARKER: [u8; 4] = *b"FCE\x01";

const HEADER_SIZE: usize = VERSION_MARKER.len() + 8;

/// Smallest decoded envelope: header, nonce and tag around an empty message.
pub const MIN_ENVELOPE_SIZE: usize = HEADER_SIZE + NONCE_SIZE + TAG_SIZE;

/// Text every envelope starts with: the marker's first three bytes, base64 encoded.
const MARKER_TEXT_PREFIX: &str = "RkNF";

/// Returns true when `value` decodes as URL-safe base64 and carries a known
/// version marker. Total: never panics, never errors.
pub fn is_encrypted(value: &str) -> bool {
    decode(value).is_some()
}

/// Returns true when `value` starts like an envelope and is made of base64
/// text, yet is not a valid envelope: a truncated or otherwise damaged
/// stored value that must not be mistaken for plaintext.
pub fn is_damaged_envelope(value: &str) -> bool {
    value.starts_with(MARKER_TEXT_PREFIX)
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'='))
        && !is_encrypted(value)
}

fn decode(value: &str) -> Option<Vec<u8>> {
    let bytes = URL_SAFE.decode(value.as_bytes()).ok()?;
    if bytes.len() < MIN_ENVELOPE_SIZE || bytes[..VERSION_MARKER.len()] != VERSION_MARKER {
        return None;
    }
    Some(bytes)
}

/// Text form of an encrypted value. Only obtainable by encrypting or by
/// parsing text that passes [`is_encrypted`].
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Envelope(String);

impl Envelope {
    /// Wraps stored text if it is an envelope.
    pub fn parse(text: impl Into<String>) -> Option<Self> {
        let text = text.into();
        is_encrypted(&text).then_some(Self(text))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// When the envelope was produced, as recorded in its authenticated header.
    pub fn issued_at(&self) -> Option<DateTime<Utc>> {
        let bytes = decode(&self.0)?;
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&bytes[VERSION_MARKER.len()..HEADER_SIZE]);
        DateTime::from_timestamp(u64::from_be_bytes(ts) as i64, 0)
    }

    pub(crate) fn seal(key: &FieldKey, plaintext: &[u8]) -> CryptoResult<Self> {
        let issued_at = Utc::now().timestamp().max(0) as u64;

        let mut header = [0u8; HEADER_SIZE];
        header[..VERSION_MARKER.len()].copy_from_slice(&VERSION_MARKER);
        header[VERSION_MARKER.len()..].copy_from_slice(&issued_at.to_be_bytes());

        let (nonce, ciphertext) = cipher::seal(key, plaintext, &header)?;

        let mut out = Vec::with_capacity(HEADER_SIZE + NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(Self(URL_SAFE.encode(out)))
    }

    pub(crate) fn open(&self, key: &FieldKey) -> CryptoResult<Vec<u8>> {
        let bytes = decode(&self.0)
            .ok_or_else(|| CryptoError::Decryption("value is not an envelope".into()))?;
        let (header, rest) = bytes.split_at(HEADER_SIZE);
        let (nonce, ciphertext) = rest.split_at(NONCE_SIZE);

        let mut nonce_arr = [0u8; NONCE_SIZE];
        nonce_arr.copy_from_slice(nonce);
        cipher::open(key, &nonce_arr, ciphertext, header)
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Envelope({} chars)", self.0.len())
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A field value tagged with its protection state.
///
/// The write path turns `Plain` into `Sealed` and leaves `Sealed` alone,
/// so an envelope is never wrapped a second time.
#[derive(Clone, PartialEq, Eq)]
pub enum Protected {
    Plain(String),
    Sealed(Envelope),
}

impl Protected {
    /// Classifies a raw value by inspecting it.
    pub fn classify(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        if is_encrypted(&raw) {
            Protected::Sealed(Envelope(raw))
        } else {
            Protected::Plain(raw)
        }
    }

    pub fn is_sealed(&self) -> bool {
        matches!(self, Protected::Sealed(_))
    }
}

impl fmt::Debug for Protected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protected::Plain(p) => write!(f, "Plain(<{} bytes redacted>)", p.len()),
            Protected::Sealed(e) => write!(f, "Sealed({e:?})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sealed_text_is_detected() {
        let key = FieldKey::generate();
        let env = Envelope::seal(&key, b"sk-abc123").unwrap();
        assert!(is_encrypted(env.as_str()));
        assert!(Envelope::parse(env.as_str()).is_some());
    }

    #[test]
    fn plain_strings_are_not_envelopes() {
        for s in ["", "sk-abc123", "hello world", "AAAA", "{\"a\":1}", "ü∑ß"] {
            assert!(!is_encrypted(s), "{s:?} misdetected");
        }
    }

    #[test]
    fn base64_without_marker_is_not_envelope() {
        let text = URL_SAFE.encode([0u8; 64]);
        assert!(!is_encrypted(&text));
    }

    #[test]
    fn truncated_envelope_is_not_envelope() {
        let mut bytes = VERSION_MARKER.to_vec();
        bytes.extend_from_slice(&[0u8; 8]);
        assert!(!is_encrypted(&URL_SAFE.encode(bytes)));
    }

    #[test]
    fn marker_prefix_matches_encoded_marker() {
        assert_eq!(&URL_SAFE.encode(&VERSION_MARKER[..3]), MARKER_TEXT_PREFIX);
    }

    #[test]
    fn truncated_envelope_text_is_damaged() {
        let env = Envelope::seal(&FieldKey::generate(), b"sk-abc123").unwrap();
        assert!(!is_damaged_envelope(env.as_str()));
        assert!(is_damaged_envelope(&env.as_str()[..20]));
        assert!(!is_damaged_envelope("sk-abc123"));
        assert!(!is_damaged_envelope("RkNF is a plain sentence"));
    }

    #[test]
    fn issued_at_is_recent() {
        let env = Envelope::seal(&FieldKey::generate(), b"x").unwrap();
        let ts = env.issued_at().unwrap();
        assert!((Utc::now() - ts).num_seconds().abs() < 60);
    }

    #[test]
    fn header_tamper_fails_authentication() {
        let key = FieldKey::generate();
        let env = Envelope::seal(&key, b"value").unwrap();
        let mut bytes = URL_SAFE.decode(env.as_str()).unwrap();
        bytes[VERSION_MARKER.len()] ^= 0x01;
        let tampered = Envelope::parse(URL_SAFE.encode(bytes)).unwrap();
        assert!(tampered.open(&key).unwrap_err().is_decryption());
    }

    #[test]
    fn classify_separates_plain_and_sealed() {
        let env = Envelope::seal(&FieldKey::generate(), b"v").unwrap();
        assert!(Protected::classify(env.into_string()).is_sealed());
        assert!(!Protected::classify("plain").is_sealed());
    }

    #[test]
    fn debug_redacts_plaintext() {
        let dbg = format!("{:?}", Protected::Plain("sk-abc123".into()));
        assert!(!dbg.contains("sk-abc123"));
    }
}
