//! Append-only audit trail of key versions.
//!
//! Records hold a one-way hash of each key, never the key itself. Rows are
//! inserted once per rotation and never updated or deleted.

use crate::error::{StorageError, StorageResult};
use chrono::{DateTime, Utc};
use duckdb::{params, Connection, OptionalExt};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};

/// Reason recorded for the first key of a fresh installation.
pub const INITIAL_KEY_REASON: &str = "initial key";

/// Reason recorded when the running key differs from the latest recorded one.
pub const ADOPTED_KEY_REASON: &str = "running key adopted";

/// One key version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyVersion {
    pub version: i64,
    /// Hex SHA-256 of the raw key.
    pub key_hash: String,
    pub created_at: DateTime<Utc>,
    pub rotation_reason: String,
    /// Version this key replaced; `None` for the first key.
    pub rotated_from: Option<i64>,
}

#[derive(Clone)]
pub struct KeyMetadataStore {
    conn: Arc<Mutex<Connection>>,
}

impl KeyMetadataStore {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Opens a standalone in-memory metadata store.
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_key_metadata_schema(&conn)?;
        Ok(Self::new(Arc::new(Mutex::new(conn))))
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }

    /// Appends a new version chained to the latest one.
    pub fn record(&self, key_hash: &str, reason: &str) -> StorageResult<KeyVersion> {
        let conn = self.lock()?;

        let previous: Option<i64> =
            conn.query_row("SELECT MAX(version) FROM key_versions", [], |row| row.get(0))?;
        let version = previous.map_or(1, |v| v + 1);
        let created_at = Utc::now();

        conn.execute(
            "INSERT INTO key_versions (version, key_hash, created_at, rotation_reason, rotated_from)
             VALUES (?, ?, ?, ?, ?)",
            params![
                version,
                key_hash,
                created_at.timestamp_millis(),
                reason,
                previous,
            ],
        )?;

        Ok(KeyVersion {
            version,
            key_hash: key_hash.to_string(),
            created_at: truncate_to_millis(created_at),
            rotation_reason: reason.to_string(),
            rotated_from: previous,
        })
    }

    /// Records version 1 for `key_hash` on a fresh installation; otherwise
    /// returns the latest version untouched.
    pub fn ensure_initial(&self, key_hash: &str) -> StorageResult<KeyVersion> {
        match self.latest()? {
            Some(latest) => Ok(latest),
            None => self.record(key_hash, INITIAL_KEY_REASON),
        }
    }

    /// Version describing the running primary key `key_hash`.
    ///
    /// Returns the latest version when it matches. Otherwise (fresh install,
    /// or a restart with a different configured key) records the running
    /// key so later rotations chain from it.
    pub fn ensure_current(&self, key_hash: &str) -> StorageResult<KeyVersion> {
        match self.latest()? {
            Some(latest) if latest.key_hash == key_hash => Ok(latest),
            Some(_) => self.record(key_hash, ADOPTED_KEY_REASON),
            None => self.record(key_hash, INITIAL_KEY_REASON),
        }
    }

    /// All versions, oldest first.
    pub fn list(&self) -> StorageResult<Vec<KeyVersion>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT version, key_hash, created_at, rotation_reason, rotated_from
             FROM key_versions ORDER BY version ASC",
        )?;
        let rows = stmt
            .query_map([], row_to_version)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn latest(&self) -> StorageResult<Option<KeyVersion>> {
        let conn = self.lock()?;
        let version = conn
            .query_row(
                "SELECT version, key_hash, created_at, rotation_reason, rotated_from
                 FROM key_versions ORDER BY version DESC LIMIT 1",
                [],
                row_to_version,
            )
            .optional()?;
        Ok(version)
    }

    /// Most recent version recorded for a key hash.
    pub fn find_by_hash(&self, key_hash: &str) -> StorageResult<Option<KeyVersion>> {
        let conn = self.lock()?;
        let version = conn
            .query_row(
                "SELECT version, key_hash, created_at, rotation_reason, rotated_from
                 FROM key_versions WHERE key_hash = ? ORDER BY version DESC LIMIT 1",
                params![key_hash],
                row_to_version,
            )
            .optional()?;
        Ok(version)
    }
}

fn row_to_version(row: &duckdb::Row<'_>) -> duckdb::Result<KeyVersion> {
    let millis: i64 = row.get(2)?;
    Ok(KeyVersion {
        version: row.get(0)?,
        key_hash: row.get(1)?,
        created_at: DateTime::from_timestamp_millis(millis).unwrap_or_default(),
        rotation_reason: row.get(3)?,
        rotated_from: row.get(4)?,
    })
}

fn truncate_to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ts.timestamp_millis()).unwrap_or(ts)
}

pub(crate) fn initialize_key_metadata_schema(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS key_versions (
            version BIGINT PRIMARY KEY,
            key_hash VARCHAR NOT NULL,
            created_at BIGINT NOT NULL,
            rotation_reason VARCHAR NOT NULL,
            rotated_from BIGINT
        );
        "#,
    )?;
    Ok(())
}
