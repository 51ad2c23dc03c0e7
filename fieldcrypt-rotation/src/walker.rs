//! Enumeration shared by the rotation and verification jobs.

use crate::error::RotationResult;
use crate::options::{CancelFlag, RotationOptions};
use crate::report::StopReason;
use fieldcrypt_storage::{EntityStore, FieldRegistration, FieldRegistry, StoredRow};
use std::time::Instant;

/// Visits every stored row of every entity type that has protected fields,
/// one bounded batch at a time.
///
/// Cancellation and the time budget are checked before each batch, so a
/// batch is either fully handed to `visit` or not fetched at all.
pub(crate) fn walk_batches<F>(
    store: &EntityStore,
    registry: &FieldRegistry,
    options: &RotationOptions,
    cancel: &CancelFlag,
    mut visit: F,
) -> RotationResult<Option<StopReason>>
where
    F: FnMut(&[FieldRegistration], Vec<StoredRow>) -> RotationResult<()>,
{
    let started = Instant::now();
    let batch_size = options.effective_batch_size();

    for entity_type in registry.entity_types() {
        let fields = registry.fields_for(entity_type);
        let mut cursor: Option<String> = None;

        loop {
            if cancel.is_cancelled() {
                return Ok(Some(StopReason::Cancelled));
            }
            if options.budget_exhausted(started) {
                return Ok(Some(StopReason::BudgetExhausted));
            }

            let batch = store.scan_batch(entity_type, cursor.as_deref(), batch_size)?;
            if batch.is_empty() {
                break;
            }
            let last_page = batch.len() < batch_size;
            cursor = batch.last().map(|row| row.id.clone());

            visit(fields, batch)?;

            if last_page {
                break;
            }
        }
    }

    Ok(None)
}
