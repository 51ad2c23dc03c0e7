//! Key rotation and verification for fieldcrypt.
//!
//! - [`RotationService`]: installs a new primary key and rewrites every
//!   registered value under it, one committed batch at a time
//! - [`VerificationService`]: read-only scan reporting how stored values
//!   decrypt
//! - [`KeyAdmin`]: the operator surface on top of both
//!
//! Only one key-changing operation runs at a time; a concurrent request
//! fails with [`RotationError::InProgress`]. Both jobs stop between batches
//! when cancelled or out of time budget, keeping committed progress.

mod admin;
mod error;
mod options;
mod report;
mod rotation;
mod verification;
mod walker;

pub use admin::{KeyAdmin, RotationOutcome};
pub use error::{RotationError, RotationResult};
pub use options::{CancelFlag, RotationOptions, DEFAULT_BATCH_SIZE};
pub use report::{RotationReport, StopReason, VerificationReport};
pub use rotation::{KeyInstall, RotationGuard, RotationService};
pub use verification::VerificationService;
