//! Generic entity record owned by collaborators.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A stored entity. `data` is a JSON object; protected fields are top-level
/// keys declared in the [`crate::FieldRegistry`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub entity_type: String,
    pub data: Value,
    pub created_at: i64,
    pub modified_at: i64,
}

impl Entity {
    /// Creates an entity with a time-ordered id and current timestamps.
    pub fn new(entity_type: impl Into<String>, data: Value) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            entity_type: entity_type.into(),
            data,
            created_at: now,
            modified_at: now,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.data.get(field).and_then(Value::as_str)
    }

    /// Sets a top-level field, turning `data` into an object if needed.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        if !self.data.is_object() {
            self.data = Value::Object(serde_json::Map::new());
        }
        if let Some(obj) = self.data.as_object_mut() {
            obj.insert(field.into(), value.into());
        }
        self.modified_at = chrono::Utc::now().timestamp_millis();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_and_get() {
        let mut e = Entity::new("Widget", json!({}));
        e.set("secret", "sk-abc123");
        assert_eq!(e.get_str("secret"), Some("sk-abc123"));
    }

    #[test]
    fn set_on_non_object_replaces_data() {
        let mut e = Entity::new("Widget", Value::Null);
        e.set("name", "w");
        assert_eq!(e.data, json!({"name": "w"}));
    }

    #[test]
    fn ids_are_unique() {
        let a = Entity::new("Widget", json!({}));
        let b = Entity::new("Widget", json!({}));
        assert_ne!(a.id, b.id);
    }
}
