//! Schedule Calculator.
//!
//! Pure functions that derive the installment schedule of an agreement from
//! its terms. Every amount is computed on ledger base units with the same
//! integer arithmetic the ledger contract uses, so a computed value can be
//! compared for exact equality with a ledger-reported one:
//!
//! ```text
//! total = principal * (10000 + rate_bps) / 10000     (floor)
//! per   = total / duration                          (floor)
//! last  = total - per * (duration - 1)              (absorbs the remainder)
//! ```
//!
//! Identical inputs always yield identical outputs.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agreement::{Agreement, AgreementKind, AgreementStatus, Terms};
use crate::amount::Amount;

/// Upper bound on installments per schedule.
pub const MAX_DURATION: u32 = 10_000;

/// Fixed-point scale of percentages returned by [`progress`]: six
/// fractional digits.
const PERCENT_FRACTION_DIGITS: u32 = 6;

/// `100 * 10^PERCENT_FRACTION_DIGITS`.
const PERCENT_SCALE: u128 = 100_000_000;

// =============================================================================
// Errors
// =============================================================================

/// Errors produced when computing a schedule.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ScheduleError {
    /// The agreement has no periods.
    #[error("duration must be at least one period")]
    ZeroDuration,

    /// The duration exceeds [`MAX_DURATION`].
    #[error("duration {duration} exceeds maximum of {max} periods")]
    DurationTooLong {
        /// Requested duration.
        duration: u32,
        /// Maximum duration.
        max: u32,
    },

    /// An intermediate value overflowed.
    #[error("schedule arithmetic overflowed")]
    Overflow,
}

/// Which ledger aggregate disagreed with the computed schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchField {
    /// Total repayment.
    Total,
    /// Regular installment amount.
    Installment,
}

/// A computed schedule disagrees with the ledger's own aggregates.
///
/// Points at a terms or rounding bug. Never corrected automatically.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("schedule mismatch on {field:?}: computed {computed}, ledger reports {reported}")]
pub struct ScheduleMismatch {
    /// The aggregate that disagreed.
    pub field: MismatchField,
    /// Locally computed value.
    pub computed: Amount,
    /// Ledger-reported value.
    pub reported: Amount,
}

// =============================================================================
// Installment and Schedule
// =============================================================================

/// One scheduled payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Installment {
    /// Position in the schedule, `1..=duration`.
    pub sequence_number: u32,
    /// Amount due.
    pub due_amount: Amount,
    /// Unix timestamp the installment falls due, once the agreement started.
    pub due_at: Option<u64>,
    /// Whether the ledger reports this installment as settled.
    pub paid: bool,
    /// Transaction that settled the installment, when known.
    pub settling_tx_ref: Option<String>,
}

/// An ordered installment schedule with its totals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    installments: Vec<Installment>,
    total: Amount,
    per_installment: Amount,
}

impl Schedule {
    /// Installments in sequence order.
    #[must_use]
    pub fn installments(&self) -> &[Installment] {
        &self.installments
    }

    /// Total repayment.
    #[must_use]
    pub const fn total(&self) -> Amount {
        self.total
    }

    /// Regular installment amount (every installment but the last).
    #[must_use]
    pub const fn per_installment(&self) -> Amount {
        self.per_installment
    }

    /// Sum of paid installments.
    #[must_use]
    pub fn paid_amount(&self) -> Amount {
        paid_amount(&self.installments)
    }

    /// Amount still outstanding.
    #[must_use]
    pub fn remaining(&self) -> Amount {
        self.total.saturating_sub(self.paid_amount())
    }

    /// Percentage paid. See [`progress`].
    #[must_use]
    pub fn progress(&self) -> Decimal {
        progress(&self.installments)
    }

    /// The installment currently due. See [`next_due`].
    #[must_use]
    pub fn next_due(&self, last_settled_period: u32) -> Option<&Installment> {
        next_due(&self.installments, last_settled_period)
    }

    /// Records the transaction that settled `period`. Unknown periods are
    /// ignored.
    pub fn attach_settlement(&mut self, period: u32, tx_ref: impl Into<String>) {
        if let Some(installment) = self
            .installments
            .iter_mut()
            .find(|i| i.sequence_number == period)
        {
            installment.settling_tx_ref = Some(tx_ref.into());
        }
    }

    /// Cross-checks the schedule against ledger-reported aggregates.
    ///
    /// # Errors
    ///
    /// Returns the first aggregate that differs.
    pub fn verify_against(
        &self,
        ledger_total: Amount,
        ledger_installment: Amount,
    ) -> Result<(), ScheduleMismatch> {
        if self.total != ledger_total {
            return Err(ScheduleMismatch {
                field: MismatchField::Total,
                computed: self.total,
                reported: ledger_total,
            });
        }
        if self.per_installment != ledger_installment {
            return Err(ScheduleMismatch {
                field: MismatchField::Installment,
                computed: self.per_installment,
                reported: ledger_installment,
            });
        }
        Ok(())
    }
}

// =============================================================================
// Computation
// =============================================================================

/// Computes the full schedule for `terms`.
///
/// `last_settled_period` marks installments `1..=last_settled_period` paid.
/// Due dates are only known once `started_at` is; each consumed grace
/// period pushes every unsettled installment back by one period.
///
/// # Errors
///
/// Returns [`ScheduleError`] for a zero or oversized duration and on
/// arithmetic overflow.
pub fn compute_schedule(
    terms: &Terms,
    started_at: Option<u64>,
    last_settled_period: u32,
    grace_used: u32,
) -> Result<Schedule, ScheduleError> {
    let duration = terms.duration;
    if duration == 0 {
        return Err(ScheduleError::ZeroDuration);
    }
    if duration > MAX_DURATION {
        return Err(ScheduleError::DurationTooLong {
            duration,
            max: MAX_DURATION,
        });
    }

    let total = terms
        .rate
        .apply_markup(terms.principal)
        .map_err(|_| ScheduleError::Overflow)?;
    let per = total
        .checked_div(u128::from(duration))
        .ok_or(ScheduleError::Overflow)?;
    let regular_sum = per
        .checked_mul(u128::from(duration - 1))
        .ok_or(ScheduleError::Overflow)?;
    let last = total
        .checked_sub(regular_sum)
        .ok_or(ScheduleError::Overflow)?;

    let mut installments = Vec::with_capacity(duration as usize);
    for n in 1..=duration {
        let paid = n <= last_settled_period;
        let due_at = match started_at {
            Some(start) => {
                let offset = if paid {
                    u64::from(n)
                } else {
                    u64::from(n) + u64::from(grace_used)
                };
                Some(
                    offset
                        .checked_mul(terms.period_secs)
                        .and_then(|secs| start.checked_add(secs))
                        .ok_or(ScheduleError::Overflow)?,
                )
            },
            None => None,
        };
        installments.push(Installment {
            sequence_number: n,
            due_amount: if n == duration { last } else { per },
            due_at,
            paid,
            settling_tx_ref: None,
        });
    }

    Ok(Schedule {
        installments,
        total,
        per_installment: per,
    })
}

fn paid_amount(installments: &[Installment]) -> Amount {
    Amount::from_base_units(
        installments
            .iter()
            .filter(|i| i.paid)
            .fold(0u128, |acc, i| acc.saturating_add(i.due_amount.base_units())),
    )
}

/// Percentage of the scheduled total that is paid, clamped to `[0, 100]`.
///
/// Floored to six fractional digits using integer arithmetic. An empty or
/// zero-valued schedule reports `0`.
#[must_use]
pub fn progress(installments: &[Installment]) -> Decimal {
    let total = installments
        .iter()
        .fold(0u128, |acc, i| acc.saturating_add(i.due_amount.base_units()));
    percent_of(paid_amount(installments).base_units(), total)
}

/// The installment immediately following `last_settled_period`, or `None`
/// when every installment is settled.
#[must_use]
pub fn next_due(installments: &[Installment], last_settled_period: u32) -> Option<&Installment> {
    let sequence = last_settled_period.checked_add(1)?;
    installments.iter().find(|i| i.sequence_number == sequence)
}

/// `numerator / denominator * 100`, floored, clamped to `[0, 100]`.
fn percent_of(numerator: u128, denominator: u128) -> Decimal {
    if denominator == 0 {
        return Decimal::ZERO;
    }
    let numerator = numerator.min(denominator);
    let scaled = numerator.checked_mul(PERCENT_SCALE).map_or_else(
        // Only reachable for very large values, where dropping the low
        // digits of the denominator costs nothing visible.
        || numerator / (denominator / PERCENT_SCALE).max(1),
        |product| product / denominator,
    );
    let scaled = i64::try_from(scaled.min(PERCENT_SCALE)).unwrap_or(i64::MAX);
    Decimal::new(scaled, PERCENT_FRACTION_DIGITS).normalize()
}

// =============================================================================
// Rental economics
// =============================================================================

/// Part of a security deposit that may be pledged as collateral while two
/// periods of rent stay protected: `max(0, deposit - 2 * rent)`.
#[must_use]
pub fn available_collateral(deposit: Amount, rent: Amount) -> Amount {
    rent.checked_mul(2)
        .map_or(Amount::ZERO, |reserved| deposit.saturating_sub(reserved))
}

/// Number of whole rent periods a deposit covers. Zero rent covers nothing.
#[must_use]
pub fn grace_periods_covered(deposit: Amount, rent: Amount) -> u32 {
    if rent.is_zero() {
        return 0;
    }
    u32::try_from(deposit.base_units() / rent.base_units()).unwrap_or(u32::MAX)
}

/// Aggregate figures over a set of agreements.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortfolioSummary {
    /// Agreements counted.
    pub agreements: usize,
    /// Agreements in `Completed`.
    pub completed: usize,
    /// Agreements in `Defaulted`.
    pub defaulted: usize,
    /// Sum of rental security deposits.
    pub total_deposits: Amount,
    /// Sum of deposit amounts that could be pledged as collateral.
    pub pledgeable_collateral: Amount,
}

impl PortfolioSummary {
    /// Summarizes `agreements`.
    pub fn from_agreements<'a>(agreements: impl IntoIterator<Item = &'a Agreement>) -> Self {
        let mut summary = Self::default();
        for agreement in agreements {
            summary.agreements += 1;
            match agreement.status {
                AgreementStatus::Completed => summary.completed += 1,
                AgreementStatus::Defaulted => summary.defaulted += 1,
                AgreementStatus::Initialized
                | AgreementStatus::Ready
                | AgreementStatus::Active
                | AgreementStatus::Settling => {},
            }
            if agreement.parties.kind == AgreementKind::Rental && agreement.terms.duration > 0 {
                let deposit = agreement.terms.collateral;
                let rent = agreement
                    .terms
                    .principal
                    .checked_div(u128::from(agreement.terms.duration))
                    .unwrap_or(Amount::ZERO);
                summary.total_deposits = Amount::from_base_units(
                    summary
                        .total_deposits
                        .base_units()
                        .saturating_add(deposit.base_units()),
                );
                summary.pledgeable_collateral = Amount::from_base_units(
                    summary
                        .pledgeable_collateral
                        .base_units()
                        .saturating_add(available_collateral(deposit, rent).base_units()),
                );
            }
        }
        summary
    }

    /// Pledgeable collateral as a percentage of deposits.
    #[must_use]
    pub fn capital_efficiency(&self) -> Decimal {
        percent_of(
            self.pledgeable_collateral.base_units(),
            self.total_deposits.base_units(),
        )
    }

    /// Defaulted agreements as a percentage of finished ones.
    #[must_use]
    pub fn default_rate(&self) -> Decimal {
        percent_of(
            self.defaulted as u128,
            (self.completed + self.defaulted) as u128,
        )
    }
}
