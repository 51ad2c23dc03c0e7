//! Operator surface over key metadata, rotation and verification.
//!
//! Everything returned here is metadata or counts. The only secret that
//! ever leaves is freshly generated key material, handed back once so the
//! operator can put it into configuration.

use crate::error::{RotationError, RotationResult};
use crate::options::{CancelFlag, RotationOptions};
use crate::report::{RotationReport, VerificationReport};
use crate::rotation::RotationService;
use crate::verification::VerificationService;
use fieldcrypt_storage::{EntityStore, FieldInterceptor, KeyVersion};
use std::sync::Arc;
use tracing::info;
use zeroize::Zeroizing;

/// Outcome of [`KeyAdmin::rotate`].
pub struct RotationOutcome {
    pub version: i64,
    /// Set when the admin generated the new key itself.
    pub generated_key: Option<Zeroizing<String>>,
    pub report: RotationReport,
}

impl std::fmt::Debug for RotationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotationOutcome")
            .field("version", &self.version)
            .field("generated_key", &self.generated_key.as_ref().map(|_| "[REDACTED]"))
            .field("report", &self.report)
            .finish()
    }
}

pub struct KeyAdmin {
    rotation: Arc<RotationService>,
    verification: VerificationService,
    options: RotationOptions,
}

impl KeyAdmin {
    /// Records the running primary key unless it is already the latest version.
    pub fn new(store: EntityStore, interceptor: Arc<FieldInterceptor>) -> RotationResult<Self> {
        let rotation = RotationService::new(store.clone(), interceptor.clone());
        Self::from_parts(Arc::new(rotation), VerificationService::new(store, interceptor))
    }

    pub fn from_parts(
        rotation: Arc<RotationService>,
        verification: VerificationService,
    ) -> RotationResult<Self> {
        let fingerprint = rotation.cipher().primary_fingerprint();
        rotation.metadata().ensure_current(&fingerprint)?;
        Ok(Self {
            rotation,
            verification,
            options: RotationOptions::default(),
        })
    }

    /// Options used by `rotate`, `status` and `retire_legacy_keys`.
    pub fn with_options(mut self, options: RotationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn rotation_service(&self) -> &Arc<RotationService> {
        &self.rotation
    }

    /// Key versions, oldest first. Hashes only.
    pub fn list_key_versions(&self) -> RotationResult<Vec<KeyVersion>> {
        Ok(self.rotation.metadata().list()?)
    }

    /// Rotates to a freshly generated key and rewrites all protected data.
    pub fn rotate(&self, reason: &str) -> RotationResult<RotationOutcome> {
        self.rotate_with(reason, None, &CancelFlag::new())
    }

    /// Rotates to `material` (or a generated key when `None`).
    pub fn rotate_with(
        &self,
        reason: &str,
        material: Option<&str>,
        cancel: &CancelFlag,
    ) -> RotationResult<RotationOutcome> {
        let (install, report) = self.rotation.rotate(reason, material, &self.options, cancel)?;
        Ok(RotationOutcome {
            version: install.version.version,
            generated_key: install.generated_material,
            report,
        })
    }

    /// Current decryption health.
    pub fn status(&self) -> RotationResult<VerificationReport> {
        self.verification.verify(&self.options)
    }

    /// New random key material for the operator to configure.
    pub fn generate_key(&self) -> Zeroizing<String> {
        fieldcrypt_crypto::generate_key()
    }

    /// Drops every legacy key after a verification pass shows none of them
    /// is still needed. Returns how many keys were dropped.
    pub fn retire_legacy_keys(&self) -> RotationResult<usize> {
        let _guard = self.rotation.exclusive()?;

        let report = self.verification.verify(&self.options)?;
        if !report.safe_to_retire_legacy() {
            return Err(RotationError::LegacyRetirementUnsafe {
                failed: report.failed,
                legacy_only: report.decrypted_legacy,
                plaintext: report.plaintext,
            });
        }

        let retired = self.rotation.cipher().retire_legacy();
        info!(retired, "retired legacy keys");
        Ok(retired)
    }
}
