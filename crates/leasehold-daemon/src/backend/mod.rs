//! Backend Store boundary.
//!
//! The backend is a queryable mirror of ledger state. The synchronizer is
//! its only writer. Every write is an idempotent upsert keyed by agreement
//! address (and period for payments), so a retried or repeated write never
//! duplicates a record.
//!
//! Two implementations exist: [`http::HttpBackendStore`] talks to the REST
//! service, [`memory::InMemoryBackendStore`] keeps records in process and
//! supports fault injection for tests.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use leasehold_core::agreement::{Address, Agreement, AgreementKind, AgreementStatus};
use leasehold_core::amount::{Amount, Rate};
use leasehold_core::retry::Retryable;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The mirrored agreement record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgreementRecord {
    /// Contract address.
    pub address: Address,
    /// Loan or rental.
    pub kind: AgreementKind,
    /// Lender or landlord.
    pub creditor: Address,
    /// Borrower or tenant.
    pub debtor: Address,
    /// Principal amount.
    pub principal: Amount,
    /// Interest or markup rate.
    pub rate: Rate,
    /// Number of periods.
    pub duration: u32,
    /// Grace periods allowed.
    pub grace_allowance: u32,
    /// Mirrored status.
    pub status: AgreementStatus,
    /// Mirrored last settled period.
    pub period: u32,
}

impl AgreementRecord {
    /// Builds the record mirroring `agreement`.
    #[must_use]
    pub fn from_agreement(agreement: &Agreement) -> Self {
        Self {
            address: agreement.address.clone(),
            kind: agreement.parties.kind,
            creditor: agreement.parties.creditor.clone(),
            debtor: agreement.parties.debtor.clone(),
            principal: agreement.terms.principal,
            rate: agreement.terms.rate,
            duration: agreement.terms.duration,
            grace_allowance: agreement.terms.grace_allowance,
            status: agreement.status,
            period: agreement.last_settled_period,
        }
    }
}

/// Body of a status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    /// New status.
    pub status: AgreementStatus,
    /// New last settled period.
    pub period: u32,
}

/// A settled installment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecord {
    /// Settled period.
    pub period: u32,
    /// Amount paid.
    pub amount: Amount,
    /// Settling transaction, when known.
    pub tx_ref: Option<String>,
}

/// Failure of a backend call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum BackendWriteError {
    /// Worth retrying: timeouts, throttling, server errors, network.
    #[error("transient backend error: {0}")]
    Transient(String),

    /// Retrying will not help: the request itself was refused.
    #[error("permanent backend error: {0}")]
    Permanent(String),
}

impl Retryable for BackendWriteError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// The off-chain mirror.
#[async_trait]
pub trait BackendStore: Send + Sync {
    /// Fetches the record for `address`, `None` when absent.
    async fn get_agreement(
        &self,
        address: &Address,
    ) -> Result<Option<AgreementRecord>, BackendWriteError>;

    /// Creates or replaces the record for `record.address`.
    async fn create_agreement(&self, record: &AgreementRecord) -> Result<(), BackendWriteError>;

    /// Sets the mirrored status and period.
    async fn update_status(
        &self,
        address: &Address,
        update: &StatusUpdate,
    ) -> Result<(), BackendWriteError>;

    /// Upserts the payment for `payment.period`.
    async fn record_payment(
        &self,
        address: &Address,
        payment: &PaymentRecord,
    ) -> Result<(), BackendWriteError>;
}

#[cfg(test)]
mod tests {
    use leasehold_core::agreement::{Parties, Terms};

    use super::*;

    #[test]
    fn test_record_mirrors_agreement() {
        let creditor = Address::parse(&format!("0x{}", "11".repeat(20))).unwrap();
        let debtor = Address::parse(&format!("0x{}", "22".repeat(20))).unwrap();
        let agreement = Agreement {
            address: Address::parse(&format!("0x{}", "ab".repeat(20))).unwrap(),
            parties: Parties {
                kind: AgreementKind::Rental,
                creditor: creditor.clone(),
                debtor,
            },
            terms: Terms::loan("1.5".parse().unwrap(), Rate::from_bps(250).unwrap(), 6, 1),
            status: AgreementStatus::Active,
            last_settled_period: 2,
            grace_used: 0,
            started_at: Some(10),
            collateral_held: Amount::ZERO,
        };
        let record = AgreementRecord::from_agreement(&agreement);
        assert_eq!(record.creditor, creditor);
        assert_eq!(record.kind, AgreementKind::Rental);
        assert_eq!(record.period, 2);
        assert_eq!(record.rate.bps(), 250);
    }

    #[test]
    fn test_only_transient_errors_retry() {
        assert!(BackendWriteError::Transient("503".to_string()).is_retryable());
        assert!(!BackendWriteError::Permanent("400".to_string()).is_retryable());
    }
}
