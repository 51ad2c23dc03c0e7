//! Rotation service: install a new primary key, then rewrite every protected
//! value under it in committed batches.

use crate::error::{RotationError, RotationResult};
use crate::options::{CancelFlag, RotationOptions};
use crate::report::RotationReport;
use crate::walker::walk_batches;
use fieldcrypt_crypto::{CryptoError, FieldCipher, FieldKey, KeyChangeGuard, KeySlot, Protected};
use fieldcrypt_storage::{
    EntityStore, FieldInterceptor, FieldRegistration, KeyMetadataStore, KeyVersion, RowUpdate,
    StoredRow,
};
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use zeroize::Zeroizing;

/// Result of installing a new primary key.
pub struct KeyInstall {
    pub version: KeyVersion,
    /// Material of a key generated by the service. Present only when no
    /// material was supplied; it is not stored anywhere else.
    pub generated_material: Option<Zeroizing<String>>,
}

impl std::fmt::Debug for KeyInstall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyInstall")
            .field("version", &self.version)
            .field(
                "generated_material",
                &self.generated_material.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

/// Held for the duration of any operation that changes keys. The slot
/// belongs to the keyring, so every service sharing it is serialized.
pub struct RotationGuard<'a> {
    _keys: KeyChangeGuard<'a>,
}

/// What happened to one row during a rewrite.
#[derive(Default)]
struct RowTally {
    scanned: usize,
    reencrypted: usize,
    migrated_plaintext: usize,
    already_current: usize,
    failed: usize,
}

pub struct RotationService {
    store: EntityStore,
    interceptor: Arc<FieldInterceptor>,
    metadata: KeyMetadataStore,
}

impl RotationService {
    /// `interceptor` must be the hook the store was opened with, so both
    /// share one keyring.
    pub fn new(store: EntityStore, interceptor: Arc<FieldInterceptor>) -> Self {
        let metadata = store.key_metadata();
        Self {
            store,
            interceptor,
            metadata,
        }
    }

    pub fn cipher(&self) -> &Arc<FieldCipher> {
        self.interceptor.cipher()
    }

    pub fn metadata(&self) -> &KeyMetadataStore {
        &self.metadata
    }

    /// Claims the keyring's single-writer slot, failing fast if it is held.
    pub fn exclusive(&self) -> RotationResult<RotationGuard<'_>> {
        let keys = self
            .cipher()
            .try_begin_key_change()
            .ok_or(RotationError::InProgress)?;
        Ok(RotationGuard { _keys: keys })
    }

    /// Installs a new primary key and records its version.
    ///
    /// Existing envelopes stay readable through the legacy list until
    /// [`RotationService::reencrypt_all`] rewrites them.
    pub fn rotate_key(&self, reason: &str, material: Option<&str>) -> RotationResult<KeyInstall> {
        let _guard = self.exclusive()?;
        self.rotate_key_locked(reason, material)
    }

    fn rotate_key_locked(&self, reason: &str, material: Option<&str>) -> RotationResult<KeyInstall> {
        let (new_key, generated_material) = match material {
            Some(material) => (self.cipher().key_from_material(material)?, None),
            None => {
                let key = FieldKey::generate();
                let material = key.to_material();
                (key, Some(material))
            }
        };

        let cipher = self.cipher();
        let current = cipher.primary_fingerprint();
        let new_hash = new_key.fingerprint();
        if new_hash == current {
            return Err(
                CryptoError::Configuration("new key is the current primary key".into()).into(),
            );
        }

        let previous = self.metadata.ensure_current(&current)?;
        let version = self.metadata.record(&new_hash, reason)?;
        cipher.install_primary(new_key);

        info!(
            version = version.version,
            rotated_from = previous.version,
            legacy_keys = cipher.legacy_count(),
            "installed new primary key"
        );

        Ok(KeyInstall {
            version,
            generated_material,
        })
    }

    /// Rewrites every registered value under the current primary key.
    pub fn reencrypt_all(
        &self,
        options: &RotationOptions,
        cancel: &CancelFlag,
    ) -> RotationResult<RotationReport> {
        let _guard = self.exclusive()?;
        self.reencrypt_locked(options, cancel)
    }

    /// [`RotationService::rotate_key`] followed by
    /// [`RotationService::reencrypt_all`] without releasing the guard.
    pub fn rotate(
        &self,
        reason: &str,
        material: Option<&str>,
        options: &RotationOptions,
        cancel: &CancelFlag,
    ) -> RotationResult<(KeyInstall, RotationReport)> {
        let _guard = self.exclusive()?;
        let install = self.rotate_key_locked(reason, material)?;
        let report = self.reencrypt_locked(options, cancel)?;
        Ok((install, report))
    }

    /// Runs [`RotationService::reencrypt_all`] on the blocking pool.
    pub fn spawn_reencrypt(
        self: &Arc<Self>,
        options: RotationOptions,
        cancel: CancelFlag,
    ) -> JoinHandle<RotationResult<RotationReport>> {
        let service = Arc::clone(self);
        tokio::task::spawn_blocking(move || service.reencrypt_all(&options, &cancel))
    }

    fn reencrypt_locked(
        &self,
        options: &RotationOptions,
        cancel: &CancelFlag,
    ) -> RotationResult<RotationReport> {
        let registry = self.interceptor.registry();
        let mut report = RotationReport::default();

        info!(
            entity_types = registry.entity_types().len(),
            fields = registry.len(),
            batch_size = options.effective_batch_size(),
            force = options.force,
            "re-encryption started"
        );

        let stopped = walk_batches(&self.store, registry, options, cancel, |fields, batch| {
            self.reencrypt_batch(fields, &batch, options.force, &mut report)
        })?;
        report.stopped = stopped;

        info!(
            scanned = report.scanned,
            reencrypted = report.reencrypted,
            migrated_plaintext = report.migrated_plaintext,
            already_current = report.already_current,
            failed = report.failed,
            stopped = ?report.stopped,
            "re-encryption finished"
        );
        Ok(report)
    }

    /// Rewrites one scanned batch and commits it.
    ///
    /// Rows saved or deleted since the scan are left alone and counted as
    /// `conflicted`; the next run picks up whatever they still need.
    fn reencrypt_batch(
        &self,
        fields: &[FieldRegistration],
        batch: &[StoredRow],
        force: bool,
        report: &mut RotationReport,
    ) -> RotationResult<()> {
        let mut updates: Vec<RowUpdate> = Vec::new();
        let mut tallies: Vec<(&str, RowTally)> = Vec::with_capacity(batch.len());

        for row in batch {
            let (data, tally) = self.reencrypt_row(row, fields, force);
            if let Some(data) = data {
                updates.push(row.update(data));
            }
            tallies.push((row.id.as_str(), tally));
        }

        let outcome = self.store.write_batch(&updates)?;
        if outcome.written > 0 {
            report.batches_committed += 1;
        }

        for (id, tally) in tallies {
            if outcome.conflicted.iter().any(|c| c == id) {
                report.conflicted += 1;
                continue;
            }
            report.scanned += tally.scanned;
            report.reencrypted += tally.reencrypted;
            report.migrated_plaintext += tally.migrated_plaintext;
            report.already_current += tally.already_current;
            report.failed += tally.failed;
        }

        info!(
            scanned = report.scanned,
            reencrypted = report.reencrypted,
            failed = report.failed,
            conflicted = outcome.conflicted.len(),
            "re-encryption batch committed"
        );
        Ok(())
    }

    /// New data for one row, or `None` when nothing in it changes.
    fn reencrypt_row(
        &self,
        row: &StoredRow,
        fields: &[FieldRegistration],
        force: bool,
    ) -> (Option<Value>, RowTally) {
        let mut tally = RowTally::default();
        let mut data = row.data.clone();
        let mut changed = false;
        let cipher = self.cipher();

        let Some(obj) = data.as_object_mut() else {
            return (None, tally);
        };

        for field in fields {
            let Some(value) = obj.get_mut(&field.field_name) else {
                continue;
            };

            let protected = match self.interceptor.inspect(value, &row.id, field) {
                Ok(Some(protected)) => protected,
                Ok(None) => continue,
                Err(err) => {
                    tally.scanned += 1;
                    tally.failed += 1;
                    warn!(
                        entity_type = %field.entity_type,
                        entity_id = %row.id,
                        field = %field.field_name,
                        error = %err,
                        "skipping unreadable protected value"
                    );
                    continue;
                }
            };
            tally.scanned += 1;

            let sealed = match protected {
                Protected::Plain(plain) => {
                    let plain = Zeroizing::new(plain);
                    cipher.encrypt(plain.as_bytes()).map(|envelope| {
                        tally.migrated_plaintext += 1;
                        envelope
                    })
                }
                Protected::Sealed(envelope) => match cipher.decrypt_with_slot(&envelope) {
                    Ok((_, KeySlot::Primary)) if !force => {
                        tally.already_current += 1;
                        continue;
                    }
                    Ok((plaintext, _)) => {
                        let plaintext = Zeroizing::new(plaintext);
                        cipher.encrypt(&plaintext).map(|envelope| {
                            tally.reencrypted += 1;
                            envelope
                        })
                    }
                    Err(err) => Err(err),
                },
            };

            match sealed {
                Ok(envelope) => {
                    *value = Value::String(envelope.into_string());
                    changed = true;
                }
                Err(err) => {
                    tally.failed += 1;
                    warn!(
                        entity_type = %field.entity_type,
                        entity_id = %row.id,
                        field = %field.field_name,
                        error = %err,
                        "failed to re-encrypt protected value"
                    );
                }
            }
        }

        (changed.then_some(data), tally)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{CancelFlag, RotationOptions};
    use fieldcrypt_storage::{Entity, FieldRegistry};
    use serde_json::json;

    fn service() -> RotationService {
        let mut b = FieldRegistry::builder();
        b.register("Widget", "secret").unwrap();
        let cipher = Arc::new(FieldCipher::new(FieldKey::generate(), vec![]));
        let interceptor = Arc::new(FieldInterceptor::new(Arc::new(b.build()), cipher));
        let store = EntityStore::open_in_memory_with_hook(interceptor.clone()).unwrap();
        RotationService::new(store, interceptor)
    }

    fn save_widget(service: &RotationService, secret: &str) -> Entity {
        let e = Entity::new("Widget", json!({"secret": secret}));
        service.store.save(&e).unwrap();
        e
    }

    fn scan_and_rewrite(service: &RotationService, rows: &[StoredRow]) -> RotationReport {
        let fields = service.interceptor.registry().fields_for("Widget");
        let mut report = RotationReport::default();
        service
            .reencrypt_batch(fields, rows, false, &mut report)
            .unwrap();
        report
    }

    #[test]
    fn rows_changed_after_scan_are_reported_as_conflicts() {
        let service = service();
        let mut edited = save_widget(&service, "a");
        let deleted = save_widget(&service, "b");
        let untouched = save_widget(&service, "c");
        service.rotate_key("r", None).unwrap();

        let rows = service.store.scan_batch("Widget", None, 10).unwrap();
        edited.set("secret", "a2");
        service.store.save(&edited).unwrap();
        service.store.delete(&deleted.id).unwrap();

        let report = scan_and_rewrite(&service, &rows);
        assert_eq!(report.conflicted, 2);
        assert_eq!(report.scanned, 1);
        assert_eq!(report.reencrypted, 1);
        assert_eq!(report.already_current, 0);

        let rerun = service
            .reencrypt_all(&RotationOptions::default(), &CancelFlag::new())
            .unwrap();
        assert_eq!(rerun.conflicted, 0);
        assert_eq!(rerun.already_current, 2);
        assert_eq!(
            service.store.get(&untouched.id).unwrap().unwrap().get_str("secret"),
            Some("c")
        );
        assert_eq!(
            service.store.get(&edited.id).unwrap().unwrap().get_str("secret"),
            Some("a2")
        );
    }

    #[test]
    fn conflicting_save_under_old_key_is_rewritten_on_next_run() {
        let service = service();
        let mut widget = save_widget(&service, "before");

        let rows = service.store.scan_batch("Widget", None, 10).unwrap();
        // sealed under the old primary, then the key changes
        widget.set("secret", "after");
        service.store.save(&widget).unwrap();
        service.rotate_key("r", None).unwrap();

        let report = scan_and_rewrite(&service, &rows);
        assert_eq!(report.conflicted, 1);
        assert_eq!(report.already_current, 0);

        let rerun = service
            .reencrypt_all(&RotationOptions::default(), &CancelFlag::new())
            .unwrap();
        assert_eq!(rerun.reencrypted, 1);

        service.cipher().retire_legacy();
        assert_eq!(
            service.store.get(&widget.id).unwrap().unwrap().get_str("secret"),
            Some("after")
        );
    }
}
