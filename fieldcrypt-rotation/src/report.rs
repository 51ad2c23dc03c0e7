//! Structured results of the batch jobs. Counts only, never values.

use serde::Serialize;

/// Why a walk ended before covering every row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Cancelled,
    BudgetExhausted,
}

/// Outcome of a bulk re-encryption.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RotationReport {
    /// Non-empty protected values visited.
    pub scanned: usize,
    /// Envelopes re-sealed under the primary key.
    pub reencrypted: usize,
    /// Plaintext values found in storage and sealed.
    pub migrated_plaintext: usize,
    /// Values the primary key already opened, left as they were.
    pub already_current: usize,
    pub failed: usize,
    /// Rows saved or deleted by someone else between scan and commit.
    /// Not rewritten; a later run covers them.
    pub conflicted: usize,
    pub batches_committed: usize,
    pub stopped: Option<StopReason>,
}

impl RotationReport {
    pub fn is_complete(&self) -> bool {
        self.stopped.is_none()
    }
}

/// Outcome of a read-only health scan.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    /// Non-empty protected values present.
    pub total: usize,
    pub decrypted_primary: usize,
    /// Values only a legacy key could open.
    pub decrypted_legacy: usize,
    /// Values stored unencrypted (written before protection was enabled).
    pub plaintext: usize,
    pub failed: usize,
    pub stopped: Option<StopReason>,
}

impl VerificationReport {
    pub fn decrypted(&self) -> usize {
        self.decrypted_primary + self.decrypted_legacy
    }

    pub fn is_healthy(&self) -> bool {
        self.failed == 0
    }

    /// True when dropping every legacy key loses nothing.
    pub fn safe_to_retire_legacy(&self) -> bool {
        self.stopped.is_none()
            && self.failed == 0
            && self.decrypted_legacy == 0
            && self.plaintext == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_values_block_retirement() {
        let report = VerificationReport {
            total: 3,
            decrypted_primary: 2,
            decrypted_legacy: 1,
            ..Default::default()
        };
        assert!(report.is_healthy());
        assert!(!report.safe_to_retire_legacy());
        assert_eq!(report.decrypted(), 3);
    }

    #[test]
    fn incomplete_scan_blocks_retirement() {
        let report = VerificationReport {
            stopped: Some(StopReason::Cancelled),
            ..Default::default()
        };
        assert!(!report.safe_to_retire_legacy());
    }

    #[test]
    fn reports_serialize_as_counts() {
        let report = RotationReport {
            scanned: 2,
            reencrypted: 2,
            stopped: Some(StopReason::BudgetExhausted),
            ..Default::default()
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["scanned"], 2);
        assert_eq!(json["stopped"], "budget_exhausted");
    }
}
