//! Persistence side of fieldcrypt.
//!
//! Provides the pieces that sit between collaborators and DuckDB:
//!
//! - [`FieldRegistry`]: which `(entity_type, field)` pairs are protected
//! - [`FieldInterceptor`]: a [`PersistenceHook`] that encrypts registered
//!   fields on write and decrypts them on load
//! - [`EntityStore`]: entity persistence that invokes the hook explicitly,
//!   plus raw batch access for the rotation and verification jobs
//! - [`KeyMetadataStore`]: append-only key version audit trail
//!
//! # Invariants
//!
//! - A registered field never reaches storage as plaintext through `save`.
//! - A collaborator never receives an envelope from `get`/`list`; a value
//!   that cannot be decrypted surfaces as [`StorageError::Decryption`].

mod entity;
mod entity_store;
mod error;
mod interceptor;
mod key_metadata;
mod registry;

pub use entity::Entity;
pub use entity_store::{BatchWrite, EntityStore, RowUpdate, StoredRow};
pub use error::{StorageError, StorageResult};
pub use interceptor::{FieldInterceptor, NoopHook, PersistenceHook};
pub use key_metadata::{KeyMetadataStore, KeyVersion, ADOPTED_KEY_REASON, INITIAL_KEY_REASON};
pub use registry::{FieldKind, FieldRegistration, FieldRegistry, FieldRegistryBuilder};

use std::path::{Path, PathBuf};
use tracing::warn;

/// Opens a DuckDB database file and applies memory and thread limits.
///
/// A failed open is returned as is. The write-ahead log next to the file
/// may hold committed rotation batches and key version rows, so it is
/// never removed here; its presence is only reported.
pub fn open_duckdb(path: &Path, memory_limit: &str, threads: u32) -> StorageResult<duckdb::Connection> {
    let conn = duckdb::Connection::open(path).map_err(|err| {
        let wal = wal_path(path);
        if wal.exists() {
            warn!(
                db = %path.display(),
                wal = %wal.display(),
                "DuckDB open failed with a write-ahead log present; leaving it for manual recovery"
            );
        }
        StorageError::from(err)
    })?;

    conn.execute_batch(&format!(
        "PRAGMA memory_limit='{memory_limit}'; PRAGMA threads={threads};"
    ))?;
    Ok(conn)
}

fn wal_path(path: &Path) -> PathBuf {
    let mut wal = path.as_os_str().to_owned();
    wal.push(".wal");
    PathBuf::from(wal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wal_sits_next_to_database() {
        assert_eq!(
            wal_path(Path::new("/data/fields.duckdb")),
            PathBuf::from("/data/fields.duckdb.wal")
        );
    }

    #[test]
    fn failed_open_keeps_wal() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("fields.duckdb");
        std::fs::write(&db, b"definitely not a duckdb file, just some bytes").unwrap();
        let wal = wal_path(&db);
        std::fs::write(&wal, b"pending").unwrap();

        assert!(open_duckdb(&db, "64MB", 1).is_err());
        assert!(wal.exists());
    }
}
