//! Agreement domain model.
//!
//! An agreement is a loan or rental contract instance deployed on the ledger.
//! Its identity is the contract [`Address`]; everything else (parties, terms,
//! status, settlement progress) is read back from the ledger and never
//! guessed locally.
//!
//! # Status Machine
//!
//! ```text
//! Initialized -> Ready -> Active -> Settling -> Completed
//!      \           \        \          \
//!       +-----------+--------+----------+----> Defaulted (absorbing)
//! ```
//!
//! Forward jumps that skip intermediate states are valid (an observer can
//! miss intermediate confirmations). `Completed` and `Defaulted` are
//! terminal. Every other change is a regression.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::amount::{Amount, AmountError, Rate};
use crate::schedule::grace_periods_covered;
use crate::sync_record::InvariantViolation;

/// Default period length: 30 days.
pub const DEFAULT_PERIOD_SECS: u64 = 30 * 24 * 60 * 60;

/// Length of an address in hex digits, excluding the `0x` prefix.
const ADDRESS_HEX_LEN: usize = 40;

// =============================================================================
// Address
// =============================================================================

/// Errors produced when parsing an [`Address`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum AddressError {
    /// The `0x` prefix is missing.
    #[error("address must start with 0x: {0}")]
    MissingPrefix(String),

    /// The hex body has the wrong length.
    #[error("address must have {ADDRESS_HEX_LEN} hex digits, got {0}")]
    InvalidLength(usize),

    /// The hex body contains a non-hex character.
    #[error("address contains non-hex characters: {0}")]
    InvalidHex(String),
}

/// A ledger address (contract or principal), normalized to lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    /// Parses and normalizes an address.
    ///
    /// # Errors
    ///
    /// Returns [`AddressError`] if the input is not `0x` followed by 40 hex
    /// digits.
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        let body = input
            .strip_prefix("0x")
            .or_else(|| input.strip_prefix("0X"))
            .ok_or_else(|| AddressError::MissingPrefix(input.to_string()))?;
        if body.len() != ADDRESS_HEX_LEN {
            return Err(AddressError::InvalidLength(body.len()));
        }
        hex::decode(body).map_err(|_| AddressError::InvalidHex(input.to_string()))?;
        Ok(Self(format!("0x{}", body.to_ascii_lowercase())))
    }

    /// Returns the normalized textual form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.0
    }
}

// =============================================================================
// Kind, Roles and Parties
// =============================================================================

/// The kind of agreement deployed at an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgreementKind {
    /// A collateralized loan between a lender and a borrower.
    Loan,
    /// A rental between a landlord and a tenant.
    Rental,
}

impl AgreementKind {
    /// Decodes the ledger's kind code.
    #[must_use]
    pub const fn from_ledger_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Loan),
            1 => Some(Self::Rental),
            _ => None,
        }
    }

    /// Returns the ledger's kind code.
    #[must_use]
    pub const fn ledger_code(self) -> u8 {
        match self {
            Self::Loan => 0,
            Self::Rental => 1,
        }
    }

    /// Returns the kind as a string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Loan => "loan",
            Self::Rental => "rental",
        }
    }
}

/// Which side of the agreement a role sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    /// The party that provides value up front and is repaid.
    Creditor,
    /// The party that repays.
    Debtor,
}

/// A party's role in an agreement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Creditor of a loan.
    Lender,
    /// Debtor of a loan.
    Borrower,
    /// Creditor of a rental.
    Landlord,
    /// Debtor of a rental.
    Tenant,
}

impl Role {
    /// Returns the side this role sits on.
    #[must_use]
    pub const fn side(self) -> Side {
        match self {
            Self::Lender | Self::Landlord => Side::Creditor,
            Self::Borrower | Self::Tenant => Side::Debtor,
        }
    }

    /// Returns the role as a string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Lender => "lender",
            Self::Borrower => "borrower",
            Self::Landlord => "landlord",
            Self::Tenant => "tenant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two principals bound to an agreement, with fixed roles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parties {
    /// Agreement kind; decides the role names.
    pub kind: AgreementKind,
    /// Lender or landlord.
    pub creditor: Address,
    /// Borrower or tenant.
    pub debtor: Address,
}

impl Parties {
    /// Returns the role held by `principal`, if it is a party at all.
    #[must_use]
    pub fn role_of(&self, principal: &Address) -> Option<Role> {
        let side = if *principal == self.creditor {
            Side::Creditor
        } else if *principal == self.debtor {
            Side::Debtor
        } else {
            return None;
        };
        Some(match (self.kind, side) {
            (AgreementKind::Loan, Side::Creditor) => Role::Lender,
            (AgreementKind::Loan, Side::Debtor) => Role::Borrower,
            (AgreementKind::Rental, Side::Creditor) => Role::Landlord,
            (AgreementKind::Rental, Side::Debtor) => Role::Tenant,
        })
    }
}

// =============================================================================
// AgreementStatus
// =============================================================================

/// Lifecycle status of an agreement, as reported by the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgreementStatus {
    /// Deployed, awaiting funding.
    Initialized,
    /// Funded by the creditor, awaiting activation.
    Ready,
    /// Activated; installments are accruing.
    Active,
    /// At least one installment settled; repayment in progress.
    Settling,
    /// All installments settled. Terminal.
    Completed,
    /// Defaulted. Terminal and absorbing.
    Defaulted,
}

/// Classification of a status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusTransition {
    /// Same status.
    Unchanged,
    /// Non-decreasing move along the main progression.
    Forward,
    /// Move into `Defaulted` from a non-terminal status.
    Absorbing,
    /// Any other change. Never valid.
    Regression,
}

impl AgreementStatus {
    /// All statuses in ledger code order.
    pub const ALL: [Self; 6] = [
        Self::Initialized,
        Self::Ready,
        Self::Active,
        Self::Settling,
        Self::Completed,
        Self::Defaulted,
    ];

    /// Decodes the ledger's status code.
    #[must_use]
    pub const fn from_ledger_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Initialized),
            1 => Some(Self::Ready),
            2 => Some(Self::Active),
            3 => Some(Self::Settling),
            4 => Some(Self::Completed),
            5 => Some(Self::Defaulted),
            _ => None,
        }
    }

    /// Returns the ledger's status code.
    #[must_use]
    pub const fn ledger_code(self) -> u8 {
        match self {
            Self::Initialized => 0,
            Self::Ready => 1,
            Self::Active => 2,
            Self::Settling => 3,
            Self::Completed => 4,
            Self::Defaulted => 5,
        }
    }

    /// Position along the main progression. `Defaulted` has no position.
    const fn progression(self) -> Option<u8> {
        match self {
            Self::Initialized => Some(0),
            Self::Ready => Some(1),
            Self::Active => Some(2),
            Self::Settling => Some(3),
            Self::Completed => Some(4),
            Self::Defaulted => None,
        }
    }

    /// Returns `true` for `Completed` and `Defaulted`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Defaulted)
    }

    /// Classifies a change from `self` to `next`.
    #[must_use]
    pub const fn transition_to(self, next: Self) -> StatusTransition {
        if self.ledger_code() == next.ledger_code() {
            return StatusTransition::Unchanged;
        }
        if self.is_terminal() {
            return StatusTransition::Regression;
        }
        match (self.progression(), next.progression()) {
            (_, None) => StatusTransition::Absorbing,
            (Some(from), Some(to)) if to > from => StatusTransition::Forward,
            _ => StatusTransition::Regression,
        }
    }

    /// Returns the status as a string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Ready => "ready",
            Self::Active => "active",
            Self::Settling => "settling",
            Self::Completed => "completed",
            Self::Defaulted => "defaulted",
        }
    }
}

impl fmt::Display for AgreementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Terms
// =============================================================================

/// Contractual terms of an agreement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Terms {
    /// Principal (loan amount, or total rent for a rental).
    pub principal: Amount,
    /// Simple markup applied once to the principal.
    pub rate: Rate,
    /// Number of installment periods.
    pub duration: u32,
    /// Number of periods that may be skipped without default.
    pub grace_allowance: u32,
    /// Length of one period in seconds.
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,
    /// Collateral (loan) or security deposit (rental) posted on activation.
    #[serde(default)]
    pub collateral: Amount,
}

const fn default_period_secs() -> u64 {
    DEFAULT_PERIOD_SECS
}

impl Terms {
    /// Loan terms with the default period length and no collateral.
    #[must_use]
    pub const fn loan(principal: Amount, rate: Rate, duration: u32, grace_allowance: u32) -> Self {
        Self {
            principal,
            rate,
            duration,
            grace_allowance,
            period_secs: DEFAULT_PERIOD_SECS,
            collateral: Amount::ZERO,
        }
    }

    /// Rental terms: the principal is the rent over the whole lease and the
    /// grace allowance is the number of rent periods the deposit covers.
    ///
    /// # Errors
    ///
    /// Returns [`AmountError::Overflow`] if the total rent overflows.
    pub fn rental(
        monthly_rent: Amount,
        months: u32,
        security_deposit: Amount,
    ) -> Result<Self, AmountError> {
        let principal = monthly_rent
            .checked_mul(u128::from(months))
            .ok_or(AmountError::Overflow)?;
        Ok(Self {
            principal,
            rate: Rate::default(),
            duration: months,
            grace_allowance: grace_periods_covered(security_deposit, monthly_rent),
            period_secs: DEFAULT_PERIOD_SECS,
            collateral: security_deposit,
        })
    }

    /// Sets the period length.
    #[must_use]
    pub const fn with_period_secs(mut self, period_secs: u64) -> Self {
        self.period_secs = period_secs;
        self
    }

    /// Sets the collateral.
    #[must_use]
    pub const fn with_collateral(mut self, collateral: Amount) -> Self {
        self.collateral = collateral;
        self
    }
}

// =============================================================================
// Agreement
// =============================================================================

/// A ledger-confirmed agreement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agreement {
    /// Contract address (identity).
    pub address: Address,
    /// Bound principals.
    pub parties: Parties,
    /// Contractual terms.
    pub terms: Terms,
    /// Current status.
    pub status: AgreementStatus,
    /// Highest installment sequence number settled so far (0 = none).
    pub last_settled_period: u32,
    /// Grace periods consumed by skips.
    pub grace_used: u32,
    /// Ledger timestamp (unix seconds) of activation, once active.
    pub started_at: Option<u64>,
    /// Collateral currently held by the contract.
    pub collateral_held: Amount,
}

impl Agreement {
    /// Returns the role of `principal`, if it is a party.
    #[must_use]
    pub fn role_of(&self, principal: &Address) -> Option<Role> {
        self.parties.role_of(principal)
    }

    /// Grace periods still available.
    #[must_use]
    pub const fn grace_remaining(&self) -> u32 {
        self.terms.grace_allowance.saturating_sub(self.grace_used)
    }

    /// Checks the invariants a single observation must satisfy on its own.
    ///
    /// # Errors
    ///
    /// Returns [`InvariantViolation::GraceExceeded`] when more grace was used
    /// than allowed, and [`InvariantViolation::PeriodOutOfRange`] when the
    /// settled period lies beyond the schedule.
    pub const fn check_invariants(&self) -> Result<(), InvariantViolation> {
        if self.grace_used > self.terms.grace_allowance {
            return Err(InvariantViolation::GraceExceeded {
                used: self.grace_used,
                allowance: self.terms.grace_allowance,
            });
        }
        if self.last_settled_period > self.terms.duration {
            return Err(InvariantViolation::PeriodOutOfRange {
                period: self.last_settled_period,
                duration: self.terms.duration,
            });
        }
        Ok(())
    }
}
