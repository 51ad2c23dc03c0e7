//! Entity store with transparent field encryption.
//!
//! Every write goes through the configured [`PersistenceHook`] on a copy of
//! the caller's entity, every read goes through it before the entity is
//! returned. The batch primitives at the bottom bypass the hook: they are
//! for the rotation and verification jobs, which handle envelopes directly.

use crate::entity::Entity;
use crate::error::{StorageError, StorageResult};
use crate::interceptor::{NoopHook, PersistenceHook};
use crate::key_metadata::{initialize_key_metadata_schema, KeyMetadataStore};
use duckdb::{params, Connection};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Raw stored row as seen by batch jobs: data is in its at-rest form.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredRow {
    pub id: String,
    pub entity_type: String,
    pub data: Value,
    stored_json: String,
}

impl StoredRow {
    /// Replacement for this row's data, applied only if the row still holds
    /// exactly what was scanned.
    pub fn update(&self, data: Value) -> RowUpdate {
        RowUpdate {
            id: self.id.clone(),
            expected_json: self.stored_json.clone(),
            data,
        }
    }
}

/// Conditional rewrite produced by [`StoredRow::update`].
#[derive(Clone, Debug, PartialEq)]
pub struct RowUpdate {
    id: String,
    expected_json: String,
    data: Value,
}

impl RowUpdate {
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Result of [`EntityStore::write_batch`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchWrite {
    pub written: usize,
    /// Rows saved or deleted by someone else since they were scanned.
    pub conflicted: Vec<String>,
}

/// Generic entity store backed by DuckDB.
#[derive(Clone)]
pub struct EntityStore {
    conn: Arc<Mutex<Connection>>,
    hook: Arc<dyn PersistenceHook>,
}

impl EntityStore {
    /// Opens or creates a store at `path` with no protected fields.
    pub fn open(path: &Path) -> StorageResult<Self> {
        Self::open_with_hook(path, Arc::new(NoopHook))
    }

    /// Opens an in-memory store with no protected fields.
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::open_in_memory_with_hook(Arc::new(NoopHook))
    }

    /// Opens a store whose save/load paths run through `hook`.
    pub fn open_with_hook(path: &Path, hook: Arc<dyn PersistenceHook>) -> StorageResult<Self> {
        let conn = crate::open_duckdb(path, "256MB", 2)?;
        Self::from_connection(conn, hook)
    }

    pub fn open_in_memory_with_hook(hook: Arc<dyn PersistenceHook>) -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, hook)
    }

    fn from_connection(conn: Connection, hook: Arc<dyn PersistenceHook>) -> StorageResult<Self> {
        initialize_entity_schema(&conn)?;
        initialize_key_metadata_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            hook,
        })
    }

    /// Key metadata store sharing this store's database.
    pub fn key_metadata(&self) -> KeyMetadataStore {
        KeyMetadataStore::new(self.conn.clone())
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }

    /// Saves (upserts) an entity. The caller's value is never modified.
    pub fn save(&self, entity: &Entity) -> StorageResult<()> {
        let mut at_rest = entity.clone();
        self.hook.before_persist(&mut at_rest)?;
        let data_json = serde_json::to_string(&at_rest.data)?;

        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO entities (id, entity_type, data_json, created_at, modified_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
            params![
                at_rest.id,
                at_rest.entity_type,
                data_json,
                at_rest.created_at,
                at_rest.modified_at,
            ],
        )?;
        Ok(())
    }

    /// Loads an entity by id with protected fields decrypted.
    pub fn get(&self, id: &str) -> StorageResult<Option<Entity>> {
        let conn = self.lock()?;
        let result = conn.query_row(
            "SELECT id, entity_type, data_json, created_at, modified_at FROM entities WHERE id = ?",
            params![id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            },
        );

        match result {
            Ok(row) => {
                drop(conn);
                self.load_row(row).map(Some)
            }
            Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Lists entities of a type, oldest first.
    ///
    /// Fails on the first entity whose protected fields cannot be decrypted.
    pub fn list(
        &self,
        entity_type: &str,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> StorageResult<Vec<Entity>> {
        let mut sql = String::from(
            "SELECT id, entity_type, data_json, created_at, modified_at FROM entities \
             WHERE entity_type = ? ORDER BY created_at ASC, id ASC",
        );
        if let Some(lim) = limit {
            sql.push_str(&format!(" LIMIT {lim}"));
        }
        if let Some(off) = offset {
            sql.push_str(&format!(" OFFSET {off}"));
        }

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![entity_type], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(conn);

        rows.into_iter().map(|row| self.load_row(row)).collect()
    }

    fn load_row(
        &self,
        (id, entity_type, data_json, created_at, modified_at): (String, String, String, i64, i64),
    ) -> StorageResult<Entity> {
        let mut entity = Entity {
            id,
            entity_type,
            data: serde_json::from_str(&data_json)?,
            created_at,
            modified_at,
        };
        self.hook.after_load(&mut entity)?;
        Ok(entity)
    }

    /// Deletes an entity. Deleting a missing id is not an error.
    pub fn delete(&self, id: &str) -> StorageResult<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM entities WHERE id = ?", params![id])?;
        Ok(())
    }

    /// Number of stored entities of a type.
    pub fn count(&self, entity_type: &str) -> StorageResult<usize> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM entities WHERE entity_type = ?",
            params![entity_type],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    /// At-rest value of one field, bypassing the hook.
    pub fn stored_field(&self, id: &str, field: &str) -> StorageResult<Option<Value>> {
        let conn = self.lock()?;
        let result = conn.query_row(
            "SELECT data_json FROM entities WHERE id = ?",
            params![id],
            |row| row.get::<_, String>(0),
        );
        match result {
            Ok(data_json) => {
                let data: Value = serde_json::from_str(&data_json)?;
                Ok(data.get(field).cloned())
            }
            Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    // ── Batch primitives ─────────────────────────────────────────

    /// Next page of raw rows of `entity_type` with id greater than `after_id`.
    ///
    /// Keyset pagination by id keeps pages stable while earlier pages are
    /// being rewritten.
    pub fn scan_batch(
        &self,
        entity_type: &str,
        after_id: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<StoredRow>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT id, entity_type, data_json FROM entities \
             WHERE entity_type = ? AND id > ? ORDER BY id ASC LIMIT {limit}"
        ))?;
        let rows = stmt
            .query_map(params![entity_type, after_id.unwrap_or("")], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, entity_type, stored_json)| {
                Ok(StoredRow {
                    id,
                    entity_type,
                    data: serde_json::from_str(&stored_json)?,
                    stored_json,
                })
            })
            .collect()
    }

    /// Applies updates in one transaction. `modified_at` is left alone.
    ///
    /// A row changed since it was scanned is not overwritten; its id is
    /// reported in [`BatchWrite::conflicted`].
    pub fn write_batch(&self, updates: &[RowUpdate]) -> StorageResult<BatchWrite> {
        let mut outcome = BatchWrite::default();
        if updates.is_empty() {
            return Ok(outcome);
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for update in updates {
            let data_json = serde_json::to_string(&update.data)?;
            let changed = tx.execute(
                "UPDATE entities SET data_json = ? WHERE id = ? AND data_json = ?",
                params![data_json, update.id, update.expected_json],
            )?;
            if changed == 0 {
                outcome.conflicted.push(update.id.clone());
            } else {
                outcome.written += changed;
            }
        }
        tx.commit()?;
        Ok(outcome)
    }
}

fn initialize_entity_schema(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS entities (
            id VARCHAR PRIMARY KEY,
            entity_type VARCHAR NOT NULL,
            data_json TEXT NOT NULL,
            created_at BIGINT NOT NULL,
            modified_at BIGINT NOT NULL
        );
        "#,
    )?;
    Ok(())
}
