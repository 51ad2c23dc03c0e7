//! Declarations of which `(entity_type, field)` pairs are encrypted at rest.
//!
//! Collaborators declare fields on a [`FieldRegistryBuilder`] during startup.
//! `build()` freezes the set; the resulting [`FieldRegistry`] is shared by
//! reference with the interceptor and the batch services and never changes.

use crate::error::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// How a protected value is turned into bytes before encryption.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldKind {
    /// A string, encrypted as UTF-8.
    Text,
    /// Any JSON value, serialized before encryption and parsed after.
    Json,
}

/// One protected field.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldRegistration {
    pub entity_type: String,
    pub field_name: String,
    pub kind: FieldKind,
}

#[derive(Debug, Default)]
pub struct FieldRegistryBuilder {
    fields: BTreeMap<(String, String), FieldKind>,
}

impl FieldRegistryBuilder {
    /// Declares a text field. Re-declaring the same pair is a no-op.
    pub fn register(&mut self, entity_type: &str, field_name: &str) -> StorageResult<&mut Self> {
        self.register_kind(entity_type, field_name, FieldKind::Text)
    }

    /// Declares a JSON-valued field.
    pub fn register_json(
        &mut self,
        entity_type: &str,
        field_name: &str,
    ) -> StorageResult<&mut Self> {
        self.register_kind(entity_type, field_name, FieldKind::Json)
    }

    pub fn register_kind(
        &mut self,
        entity_type: &str,
        field_name: &str,
        kind: FieldKind,
    ) -> StorageResult<&mut Self> {
        if entity_type.trim().is_empty() || field_name.trim().is_empty() {
            return Err(StorageError::InvalidRegistration(format!(
                "entity type and field name must be non-empty (got {entity_type:?}.{field_name:?})"
            )));
        }

        let slot = (entity_type.to_string(), field_name.to_string());
        match self.fields.get(&slot) {
            Some(existing) if *existing == kind => {}
            Some(existing) => {
                return Err(StorageError::RegistrationConflict {
                    entity_type: slot.0,
                    field: slot.1,
                    existing: *existing,
                    requested: kind,
                });
            }
            None => {
                self.fields.insert(slot, kind);
            }
        }
        Ok(self)
    }

    pub fn build(self) -> FieldRegistry {
        let mut by_type: HashMap<String, Vec<FieldRegistration>> = HashMap::new();
        for ((entity_type, field_name), kind) in &self.fields {
            by_type
                .entry(entity_type.clone())
                .or_default()
                .push(FieldRegistration {
                    entity_type: entity_type.clone(),
                    field_name: field_name.clone(),
                    kind: *kind,
                });
        }
        FieldRegistry {
            fields: self.fields,
            by_type,
        }
    }
}

/// Immutable set of protected fields.
#[derive(Debug, Default)]
pub struct FieldRegistry {
    fields: BTreeMap<(String, String), FieldKind>,
    by_type: HashMap<String, Vec<FieldRegistration>>,
}

impl FieldRegistry {
    pub fn builder() -> FieldRegistryBuilder {
        FieldRegistryBuilder::default()
    }

    pub fn is_registered(&self, entity_type: &str, field_name: &str) -> bool {
        self.kind_of(entity_type, field_name).is_some()
    }

    pub fn kind_of(&self, entity_type: &str, field_name: &str) -> Option<FieldKind> {
        self.fields
            .get(&(entity_type.to_string(), field_name.to_string()))
            .copied()
    }

    /// Protected fields of one entity type, ordered by field name.
    pub fn fields_for(&self, entity_type: &str) -> &[FieldRegistration] {
        self.by_type
            .get(entity_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Every registered field, ordered by entity type then field name.
    pub fn all_registered(&self) -> Vec<FieldRegistration> {
        self.fields
            .iter()
            .map(|((entity_type, field_name), kind)| FieldRegistration {
                entity_type: entity_type.clone(),
                field_name: field_name.clone(),
                kind: *kind,
            })
            .collect()
    }

    /// Distinct entity types with at least one protected field, sorted.
    pub fn entity_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.by_type.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}
