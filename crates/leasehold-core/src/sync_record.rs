//! Per-agreement reconciliation cursor.
//!
//! A [`SyncRecord`] tracks what the ledger last reported for one agreement
//! and whether the backend mirror has acknowledged it. Observations are only
//! ever committed through [`SyncRecord::observe`], which enforces status and
//! period monotonicity: a regressive observation is rejected and leaves the
//! record untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agreement::{AgreementStatus, StatusTransition};

/// An inconsistency between successive ledger observations.
///
/// Never corrected automatically: applying or "repairing" the update could
/// hide a real divergence between ledger and cache.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum InvariantViolation {
    /// The status moved backwards, or out of a terminal status.
    #[error("status regression from {from} to {to}")]
    StatusRegression {
        /// Last observed status.
        from: AgreementStatus,
        /// Rejected status.
        to: AgreementStatus,
    },

    /// The settled period moved backwards.
    #[error("settled period regression from {from} to {to}")]
    PeriodRegression {
        /// Last observed period.
        from: u32,
        /// Rejected period.
        to: u32,
    },

    /// More grace periods were used than the terms allow.
    #[error("grace usage {used} exceeds allowance {allowance}")]
    GraceExceeded {
        /// Grace periods used.
        used: u32,
        /// Contractual allowance.
        allowance: u32,
    },

    /// The settled period lies beyond the schedule.
    #[error("settled period {period} beyond duration {duration}")]
    PeriodOutOfRange {
        /// Reported period.
        period: u32,
        /// Schedule length.
        duration: u32,
    },
}

impl InvariantViolation {
    /// Short label for metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::StatusRegression { .. } => "status_regression",
            Self::PeriodRegression { .. } => "period_regression",
            Self::GraceExceeded { .. } => "grace_exceeded",
            Self::PeriodOutOfRange { .. } => "period_out_of_range",
        }
    }
}

/// One ledger-confirmed reading of an agreement's progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    /// Reported status.
    pub status: AgreementStatus,
    /// Reported last settled period.
    pub period: u32,
    /// Block height of the read.
    pub block: u64,
}

/// Result of committing an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservationOutcome {
    /// Status and period match the record.
    Unchanged,
    /// Status or period advanced.
    Changed {
        /// Status before the observation (`None` on first observation).
        previous_status: Option<AgreementStatus>,
        /// Period before the observation.
        previous_period: u32,
    },
}

impl ObservationOutcome {
    /// Returns `true` for [`ObservationOutcome::Changed`].
    #[must_use]
    pub const fn is_changed(&self) -> bool {
        matches!(self, Self::Changed { .. })
    }
}

/// Reconciliation bookkeeping for one agreement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    /// Last status the ledger reported.
    pub last_observed_status: Option<AgreementStatus>,
    /// Last settled period the ledger reported.
    pub last_observed_period: u32,
    /// Highest block height observed.
    pub last_observed_block: u64,
    /// Time of the last successful backend write.
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Whether the backend has acknowledged the current observation.
    pub backend_acked: bool,
    /// Failed backend attempts for the current write, capped at the
    /// configured attempt bound.
    pub pending_retry_count: u32,
    /// Set once retries are exhausted; cleared by a later successful write.
    pub needs_reconciliation: bool,
}

impl Default for SyncRecord {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncRecord {
    /// A record that has observed nothing yet.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            last_observed_status: None,
            last_observed_period: 0,
            last_observed_block: 0,
            last_synced_at: None,
            backend_acked: false,
            pending_retry_count: 0,
            needs_reconciliation: false,
        }
    }

    /// Checks that moving to `status` would not regress the record.
    ///
    /// # Errors
    ///
    /// Returns [`InvariantViolation::StatusRegression`] otherwise.
    pub const fn check_status(&self, status: AgreementStatus) -> Result<(), InvariantViolation> {
        let Some(current) = self.last_observed_status else {
            return Ok(());
        };
        match current.transition_to(status) {
            StatusTransition::Regression => Err(InvariantViolation::StatusRegression {
                from: current,
                to: status,
            }),
            StatusTransition::Unchanged
            | StatusTransition::Forward
            | StatusTransition::Absorbing => Ok(()),
        }
    }

    /// Classifies `observation` without committing it.
    ///
    /// # Errors
    ///
    /// Returns an [`InvariantViolation`] for a regressive status or period.
    pub const fn classify(
        &self,
        observation: &Observation,
    ) -> Result<ObservationOutcome, InvariantViolation> {
        if let Err(violation) = self.check_status(observation.status) {
            return Err(violation);
        }
        if observation.period < self.last_observed_period {
            return Err(InvariantViolation::PeriodRegression {
                from: self.last_observed_period,
                to: observation.period,
            });
        }
        let same_status = match self.last_observed_status {
            Some(current) => current.ledger_code() == observation.status.ledger_code(),
            None => false,
        };
        if same_status && observation.period == self.last_observed_period {
            Ok(ObservationOutcome::Unchanged)
        } else {
            Ok(ObservationOutcome::Changed {
                previous_status: self.last_observed_status,
                previous_period: self.last_observed_period,
            })
        }
    }

    /// Commits `observation` if it does not regress the record.
    ///
    /// A change resets the acknowledgement state: the backend has not seen
    /// the new values yet.
    ///
    /// # Errors
    ///
    /// Returns an [`InvariantViolation`] and leaves the record untouched.
    pub fn observe(
        &mut self,
        observation: &Observation,
    ) -> Result<ObservationOutcome, InvariantViolation> {
        let outcome = self.classify(observation)?;
        self.last_observed_block = self.last_observed_block.max(observation.block);
        if outcome.is_changed() {
            self.last_observed_status = Some(observation.status);
            self.last_observed_period = observation.period;
            self.backend_acked = false;
            self.pending_retry_count = 0;
        }
        Ok(outcome)
    }

    /// Records a failed backend attempt. The count saturates at `limit`,
    /// the configured attempt bound.
    pub fn record_backend_failure(&mut self, limit: u32) {
        self.pending_retry_count = self.pending_retry_count.saturating_add(1).min(limit.max(1));
        self.backend_acked = false;
    }

    /// Records a successful backend write.
    pub fn record_backend_success(&mut self, at: DateTime<Utc>) {
        self.backend_acked = true;
        self.pending_retry_count = 0;
        self.needs_reconciliation = false;
        self.last_synced_at = Some(at);
    }

    /// Marks the record stale after retries were exhausted.
    pub const fn mark_degraded(&mut self) {
        self.backend_acked = false;
        self.needs_reconciliation = true;
    }
}
