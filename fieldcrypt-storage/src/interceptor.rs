//! Persistence hooks that keep registered fields encrypted at rest.
//!
//! The store calls [`PersistenceHook::before_persist`] on a copy of every
//! entity it writes and [`PersistenceHook::after_load`] on every entity it
//! reads. Collaborators only ever see plaintext; storage only ever sees
//! envelopes for registered fields.

use crate::entity::Entity;
use crate::error::{StorageError, StorageResult};
use crate::registry::{FieldKind, FieldRegistration, FieldRegistry};
use fieldcrypt_crypto::{is_damaged_envelope, is_encrypted, FieldCipher, Protected};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// Explicit interception interface invoked by the store's save/load paths.
pub trait PersistenceHook: Send + Sync {
    /// Rewrites `entity` into its at-rest form.
    fn before_persist(&self, entity: &mut Entity) -> StorageResult<()>;

    /// Rewrites a freshly loaded `entity` into its in-memory form.
    fn after_load(&self, entity: &mut Entity) -> StorageResult<()>;
}

/// Hook for stores that hold no protected fields.
pub struct NoopHook;

impl PersistenceHook for NoopHook {
    fn before_persist(&self, _entity: &mut Entity) -> StorageResult<()> {
        Ok(())
    }

    fn after_load(&self, _entity: &mut Entity) -> StorageResult<()> {
        Ok(())
    }
}

/// Encrypts and decrypts the fields declared in a [`FieldRegistry`].
#[derive(Clone)]
pub struct FieldInterceptor {
    registry: Arc<FieldRegistry>,
    cipher: Arc<FieldCipher>,
}

impl FieldInterceptor {
    pub fn new(registry: Arc<FieldRegistry>, cipher: Arc<FieldCipher>) -> Self {
        Self { registry, cipher }
    }

    pub fn registry(&self) -> &Arc<FieldRegistry> {
        &self.registry
    }

    pub fn cipher(&self) -> &Arc<FieldCipher> {
        &self.cipher
    }

    /// Classifies a stored value. `None` means there is nothing to protect
    /// (missing, null or empty string).
    pub fn classify(
        &self,
        value: &Value,
        entity_id: &str,
        field: &FieldRegistration,
    ) -> StorageResult<Option<Protected>> {
        match (field.kind, value) {
            (_, Value::Null) => Ok(None),
            (_, Value::String(s)) if s.is_empty() => Ok(None),
            (_, Value::String(s)) if is_encrypted(s) => Ok(Some(Protected::classify(s.as_str()))),
            (FieldKind::Text, Value::String(s)) => Ok(Some(Protected::Plain(s.clone()))),
            (FieldKind::Json, other) => Ok(Some(Protected::Plain(serde_json::to_string(other)?))),
            (FieldKind::Text, _) => Err(StorageError::InvalidFieldValue {
                entity_type: field.entity_type.clone(),
                entity_id: entity_id.to_string(),
                field: field.field_name.clone(),
            }),
        }
    }

    /// Classifies a value read back from storage.
    ///
    /// Unlike [`FieldInterceptor::classify`], text that looks like a damaged
    /// envelope is a [`StorageError::Decryption`] rather than plaintext, so
    /// corrupted ciphertext is never handed out or re-sealed as data.
    pub fn inspect(
        &self,
        value: &Value,
        entity_id: &str,
        field: &FieldRegistration,
    ) -> StorageResult<Option<Protected>> {
        if let Value::String(stored) = value {
            if is_damaged_envelope(stored) {
                warn!(
                    entity_type = %field.entity_type,
                    entity_id = %entity_id,
                    field = %field.field_name,
                    "stored value looks like a damaged envelope"
                );
                return Err(decryption_error(entity_id, field));
            }
        }
        self.classify(value, entity_id, field)
    }

    /// Turns an in-memory value into its at-rest form. Envelopes pass through
    /// unchanged; `None` when there is nothing to protect.
    pub fn protect(
        &self,
        value: &Value,
        entity_id: &str,
        field: &FieldRegistration,
    ) -> StorageResult<Option<Value>> {
        let Some(protected) = self.classify(value, entity_id, field)? else {
            return Ok(None);
        };
        if protected.is_sealed() {
            return Ok(None);
        }
        let envelope = self.cipher.seal(protected)?;
        Ok(Some(Value::String(envelope.into_string())))
    }

    /// Turns a stored envelope back into its in-memory value. `None` when the
    /// stored value is not an envelope (pre-migration plaintext or empty).
    pub fn reveal(
        &self,
        value: &Value,
        entity_id: &str,
        field: &FieldRegistration,
    ) -> StorageResult<Option<Value>> {
        if !matches!(value, Value::String(_)) {
            return Ok(None);
        }
        let Some(Protected::Sealed(envelope)) = self.inspect(value, entity_id, field)? else {
            return Ok(None);
        };

        let failed = || decryption_error(entity_id, field);

        let plaintext = self
            .cipher
            .decrypt(&envelope)
            .map_err(|_| failed())?;

        let revealed = match field.kind {
            FieldKind::Text => {
                Value::String(String::from_utf8(plaintext).map_err(|_| failed())?)
            }
            FieldKind::Json => serde_json::from_slice(&plaintext).map_err(|_| failed())?,
        };
        Ok(Some(revealed))
    }
}

fn decryption_error(entity_id: &str, field: &FieldRegistration) -> StorageError {
    StorageError::Decryption {
        entity_type: field.entity_type.clone(),
        entity_id: entity_id.to_string(),
        field: field.field_name.clone(),
    }
}

impl PersistenceHook for FieldInterceptor {
    fn before_persist(&self, entity: &mut Entity) -> StorageResult<()> {
        let fields = self.registry.fields_for(&entity.entity_type);
        if fields.is_empty() {
            return Ok(());
        }
        let Some(obj) = entity.data.as_object_mut() else {
            return Ok(());
        };

        for field in fields {
            let Some(value) = obj.get_mut(&field.field_name) else {
                continue;
            };
            if let Some(sealed) = self.protect(value, &entity.id, field)? {
                *value = sealed;
                debug!(
                    entity_type = %field.entity_type,
                    field = %field.field_name,
                    entity_id = %entity.id,
                    "sealed protected field"
                );
            }
        }
        Ok(())
    }

    fn after_load(&self, entity: &mut Entity) -> StorageResult<()> {
        let fields = self.registry.fields_for(&entity.entity_type);
        if fields.is_empty() {
            return Ok(());
        }
        let Some(obj) = entity.data.as_object_mut() else {
            return Ok(());
        };

        for field in fields {
            let Some(value) = obj.get_mut(&field.field_name) else {
                continue;
            };
            if let Some(revealed) = self.reveal(value, &entity.id, field)? {
                *value = revealed;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldcrypt_crypto::FieldKey;
    use serde_json::json;

    fn interceptor() -> FieldInterceptor {
        let mut b = FieldRegistry::builder();
        b.register("Widget", "secret").unwrap();
        b.register_json("Widget", "oauth").unwrap();
        FieldInterceptor::new(
            Arc::new(b.build()),
            Arc::new(FieldCipher::new(FieldKey::generate(), vec![])),
        )
    }

    #[test]
    fn write_hook_encrypts_registered_fields_only() {
        let hook = interceptor();
        let mut e = Entity::new("Widget", json!({"secret": "sk-abc123", "name": "w1"}));
        hook.before_persist(&mut e).unwrap();

        let stored = e.get_str("secret").unwrap();
        assert_ne!(stored, "sk-abc123");
        assert!(is_encrypted(stored));
        assert_eq!(e.get_str("name"), Some("w1"));
    }

    #[test]
    fn write_hook_is_idempotent_on_envelopes() {
        let hook = interceptor();
        let mut e = Entity::new("Widget", json!({"secret": "sk-abc123"}));
        hook.before_persist(&mut e).unwrap();
        let first = e.data.clone();
        hook.before_persist(&mut e).unwrap();
        assert_eq!(e.data, first);
    }

    #[test]
    fn json_fields_roundtrip() {
        let hook = interceptor();
        let token = json!({"access": "a", "refresh": "r", "expires": 3600});
        let mut e = Entity::new("Widget", json!({"oauth": token.clone()}));

        hook.before_persist(&mut e).unwrap();
        assert!(is_encrypted(e.get_str("oauth").unwrap()));

        hook.after_load(&mut e).unwrap();
        assert_eq!(e.get("oauth"), Some(&token));
    }

    #[test]
    fn json_string_values_roundtrip() {
        let hook = interceptor();
        let mut e = Entity::new("Widget", json!({"oauth": "plain-token"}));
        hook.before_persist(&mut e).unwrap();
        hook.after_load(&mut e).unwrap();
        assert_eq!(e.get_str("oauth"), Some("plain-token"));
    }

    #[test]
    fn null_and_empty_values_untouched() {
        let hook = interceptor();
        let mut e = Entity::new("Widget", json!({"secret": "", "oauth": null}));
        hook.before_persist(&mut e).unwrap();
        assert_eq!(e.data, json!({"secret": "", "oauth": null}));
    }

    #[test]
    fn non_string_text_field_is_rejected() {
        let hook = interceptor();
        let mut e = Entity::new("Widget", json!({"secret": 42}));
        let err = hook.before_persist(&mut e).unwrap_err();
        assert!(matches!(err, StorageError::InvalidFieldValue { .. }));
    }

    #[test]
    fn read_hook_leaves_plaintext_rows_alone() {
        let hook = interceptor();
        let mut e = Entity::new("Widget", json!({"secret": "legacy-plain"}));
        hook.after_load(&mut e).unwrap();
        assert_eq!(e.get_str("secret"), Some("legacy-plain"));
    }

    #[test]
    fn read_hook_surfaces_decryption_error() {
        let hook = interceptor();
        let foreign = FieldCipher::new(FieldKey::generate(), vec![])
            .encrypt_value("sk-abc123")
            .unwrap();
        let mut e = Entity::new("Widget", json!({"secret": foreign}));

        let err = hook.after_load(&mut e).unwrap_err();
        assert!(err.is_decryption());
        assert!(!err.to_string().contains("sk-abc123"));
    }

    #[test]
    fn read_hook_rejects_truncated_envelope() {
        let hook = interceptor();
        let mut e = Entity::new("Widget", json!({"secret": "sk-abc123"}));
        hook.before_persist(&mut e).unwrap();
        let truncated = e.get_str("secret").unwrap()[..24].to_string();
        e.set("secret", truncated.clone());

        let err = hook.after_load(&mut e).unwrap_err();
        assert!(err.is_decryption());
        assert!(!err.to_string().contains(&truncated));
    }

    #[test]
    fn unregistered_types_pass_through() {
        let hook = interceptor();
        let mut e = Entity::new("Comment", json!({"secret": "visible"}));
        hook.before_persist(&mut e).unwrap();
        assert_eq!(e.get_str("secret"), Some("visible"));
    }
}
