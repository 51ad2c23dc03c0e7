//! Read-only health scan of every protected value.

use crate::error::RotationResult;
use crate::options::{CancelFlag, RotationOptions};
use crate::report::VerificationReport;
use crate::walker::walk_batches;
use fieldcrypt_crypto::{KeySlot, Protected};
use fieldcrypt_storage::{EntityStore, FieldInterceptor};
use std::sync::Arc;
use tracing::{info, warn};

pub struct VerificationService {
    store: EntityStore,
    interceptor: Arc<FieldInterceptor>,
}

impl VerificationService {
    pub fn new(store: EntityStore, interceptor: Arc<FieldInterceptor>) -> Self {
        Self { store, interceptor }
    }

    /// Tallies how every stored protected value decrypts. Writes nothing.
    pub fn verify(&self, options: &RotationOptions) -> RotationResult<VerificationReport> {
        self.verify_until(options, &CancelFlag::new())
    }

    /// Like [`VerificationService::verify`], stopping early when `cancel` is set.
    pub fn verify_until(
        &self,
        options: &RotationOptions,
        cancel: &CancelFlag,
    ) -> RotationResult<VerificationReport> {
        let registry = self.interceptor.registry();
        let cipher = self.interceptor.cipher();
        let mut report = VerificationReport::default();

        let stopped = walk_batches(&self.store, registry, options, cancel, |fields, batch| {
            for row in &batch {
                for field in fields {
                    let Some(value) = row.data.get(&field.field_name) else {
                        continue;
                    };
                    let protected = match self.interceptor.inspect(value, &row.id, field) {
                        Ok(Some(protected)) => protected,
                        Ok(None) => continue,
                        Err(err) => {
                            report.total += 1;
                            report.failed += 1;
                            warn!(
                                entity_type = %field.entity_type,
                                entity_id = %row.id,
                                field = %field.field_name,
                                error = %err,
                                "protected value is unreadable"
                            );
                            continue;
                        }
                    };
                    report.total += 1;

                    match protected {
                        Protected::Plain(_) => report.plaintext += 1,
                        Protected::Sealed(envelope) => match cipher.decrypt_with_slot(&envelope) {
                            Ok((_, KeySlot::Primary)) => report.decrypted_primary += 1,
                            Ok((_, KeySlot::Legacy(_))) => report.decrypted_legacy += 1,
                            Err(_) => {
                                report.failed += 1;
                                warn!(
                                    entity_type = %field.entity_type,
                                    entity_id = %row.id,
                                    field = %field.field_name,
                                    "no configured key opens protected value"
                                );
                            }
                        },
                    }
                }
            }
            Ok(())
        })?;
        report.stopped = stopped;

        info!(
            total = report.total,
            decrypted_primary = report.decrypted_primary,
            decrypted_legacy = report.decrypted_legacy,
            plaintext = report.plaintext,
            failed = report.failed,
            stopped = ?report.stopped,
            "verification finished"
        );
        Ok(report)
    }
}
