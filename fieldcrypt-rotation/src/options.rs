//! Batch job options and cooperative cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Knobs for the rotation and verification walks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RotationOptions {
    /// Rows fetched and committed per batch.
    pub batch_size: usize,
    /// Wall-clock budget for one invocation. Checked between batches.
    pub time_budget: Option<Duration>,
    /// Re-encrypt values the primary key already opens.
    pub force: bool,
}

impl Default for RotationOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            time_budget: None,
            force: false,
        }
    }
}

impl RotationOptions {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_time_budget(mut self, budget: Duration) -> Self {
        self.time_budget = Some(budget);
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    pub(crate) fn effective_batch_size(&self) -> usize {
        self.batch_size.max(1)
    }

    pub(crate) fn budget_exhausted(&self, started: Instant) -> bool {
        self.time_budget
            .is_some_and(|budget| started.elapsed() >= budget)
    }
}

/// Shared flag an operator flips to stop a walk at the next batch boundary.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
