//! Ledger Gateway.
//!
//! [`LedgerGateway`] is the typed accessor over a deployed agreement
//! contract. It converts the ledger's native encodings (status codes, base
//! unit integers, basis points, hex addresses) into domain values and back,
//! and bounds every call with a timeout.
//!
//! The gateway never retries. It reports exactly what the ledger reported;
//! retry policy belongs to the synchronizer and orchestrator.
//!
//! The raw transport is abstracted by [`LedgerTransport`]. The in-process
//! [`simulated::SimulatedLedger`] implements it for tests and the simulation
//! binary.

pub mod simulated;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use leasehold_core::agreement::{
    Address, Agreement, AgreementKind, AgreementStatus, Parties, Terms,
};
use leasehold_core::amount::{Amount, Rate};
use leasehold_core::config::LedgerConfig;
use leasehold_core::retry::Retryable;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

// =============================================================================
// Raw Transport Types
// =============================================================================

/// A state-changing contract call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Creditor provides the principal.
    Fund,
    /// Debtor posts collateral and starts the schedule.
    Activate,
    /// Debtor settles the currently due installment.
    Repay,
    /// Debtor defers the currently due installment using grace.
    Skip,
}

impl Operation {
    /// Returns the operation as a string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fund => "fund",
            Self::Activate => "activate",
            Self::Repay => "repay",
            Self::Skip => "skip",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Agreement fields exactly as the contract stores them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawAgreementFields {
    /// Kind code (`0` loan, `1` rental).
    pub kind: u8,
    /// Creditor address.
    pub creditor: String,
    /// Debtor address.
    pub debtor: String,
    /// Status code.
    pub status: u8,
    /// Principal in base units.
    pub principal: u128,
    /// Rate in basis points.
    pub rate_bps: u32,
    /// Number of periods.
    pub duration: u32,
    /// Grace periods allowed.
    pub grace_allowance: u32,
    /// Grace periods used.
    pub grace_used: u32,
    /// Period length in seconds.
    pub period_secs: u64,
    /// Required collateral in base units.
    pub collateral: u128,
    /// Collateral currently held in base units.
    pub collateral_held: u128,
    /// Highest settled period.
    pub last_settled_period: u32,
    /// Activation timestamp, `0` before activation.
    pub started_at: u64,
    /// Contract-computed total repayment in base units.
    pub total_repayment: u128,
    /// Contract-computed regular installment in base units.
    pub installment_amount: u128,
    /// Block height the fields were read at.
    pub block_number: u64,
}

/// Arguments of a contract call in ledger encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCallArgs {
    /// Signing principal.
    pub caller: String,
    /// Value attached to the call, in base units.
    pub value: u128,
}

/// Event emitted when the status changes. Payload: `{from, to}` status codes.
pub const EVENT_STATUS_CHANGED: &str = "StatusChanged";
/// Event emitted per settled installment. Payload: `{period, amount}`.
pub const EVENT_PAYMENT_SETTLED: &str = "PaymentSettled";
/// Event emitted when collateral enters or leaves the contract. Payload:
/// `{amount, to}`.
pub const EVENT_COLLATERAL_MOVED: &str = "CollateralMoved";
/// Event emitted when a grace period is consumed. Payload: `{grace_used}`.
pub const EVENT_PERIOD_SKIPPED: &str = "PeriodSkipped";

/// A confirmed contract event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Emitting contract.
    pub address: String,
    /// Event name.
    pub name: String,
    /// Event arguments.
    pub payload: serde_json::Value,
    /// Transaction that emitted the event.
    pub tx_ref: String,
    /// Position of the event within its transaction.
    pub log_index: u32,
    /// Block the transaction was confirmed in.
    pub block_number: u64,
}

/// Confirmation of a submitted call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReceipt {
    /// Transaction reference.
    pub tx_ref: String,
    /// Confirmation block.
    pub block_number: u64,
}

/// Failures reported by a [`LedgerTransport`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransportError {
    /// No agreement is deployed at the address.
    #[error("no agreement deployed at address")]
    NotFound,

    /// The transport gave up waiting.
    #[error("ledger request timed out")]
    Timeout,

    /// The signer refused to sign.
    #[error("signature rejected by user")]
    UserRejected,

    /// The caller cannot cover the attached value.
    #[error("insufficient funds")]
    InsufficientFunds,

    /// The contract reverted the call.
    #[error("reverted: {0}")]
    Reverted(String),

    /// The event stream or connection dropped.
    #[error("disconnected")]
    Disconnected,

    /// Any other network failure.
    #[error("network error: {0}")]
    Network(String),
}

/// Raw access to a ledger.
///
/// A subscription is the receiving half of a channel: dropping or closing it
/// releases the underlying stream, and a closed channel signals disconnect.
#[async_trait]
pub trait LedgerTransport: Send + Sync {
    /// Reads the current fields of the agreement at `address`.
    async fn read_fields(&self, address: &str) -> Result<RawAgreementFields, TransportError>;

    /// Submits `operation` and waits for confirmation or rejection.
    async fn submit(
        &self,
        address: &str,
        operation: Operation,
        args: RawCallArgs,
    ) -> Result<SubmitReceipt, TransportError>;

    /// Streams confirmed events of `address`, replaying those at or above
    /// `from_block` before live delivery.
    async fn subscribe(
        &self,
        address: &str,
        from_block: u64,
    ) -> Result<mpsc::Receiver<RawEvent>, TransportError>;
}

// =============================================================================
// Gateway Errors
// =============================================================================

/// Failure to read agreement state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum LedgerReadError {
    /// No agreement is deployed at the address.
    #[error("no agreement deployed at {0}")]
    NotFound(Address),

    /// The read exceeded its timeout.
    #[error("ledger read timed out after {0:?}")]
    Timeout(Duration),

    /// Network failure.
    #[error("ledger network error: {0}")]
    Network(String),

    /// A field could not be decoded.
    #[error("cannot decode ledger field: {0}")]
    Decode(String),
}

impl Retryable for LedgerReadError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Network(_))
    }
}

/// Failure of a state-changing submission.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SubmissionError {
    /// The signer refused to sign. Always terminal.
    #[error("signature rejected by user")]
    UserRejected,

    /// The caller cannot cover the attached value.
    #[error("insufficient funds")]
    InsufficientFunds,

    /// The contract reverted the call.
    #[error("transaction reverted: {reason}")]
    Reverted {
        /// Revert reason reported by the contract.
        reason: String,
    },

    /// No confirmation within the timeout. The transaction may still land.
    #[error("submission timed out after {0:?}")]
    Timeout(Duration),

    /// Network failure before confirmation.
    #[error("submission network error: {0}")]
    Network(String),
}

impl SubmissionError {
    /// Returns `true` when the ledger gave a definitive rejection.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::UserRejected | Self::InsufficientFunds | Self::Reverted { .. }
        )
    }

    /// Short label for notifications and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::UserRejected => "user_rejected",
            Self::InsufficientFunds => "insufficient_funds",
            Self::Reverted { .. } => "reverted",
            Self::Timeout(_) => "timeout",
            Self::Network(_) => "network",
        }
    }
}

impl Retryable for SubmissionError {
    fn is_retryable(&self) -> bool {
        !self.is_terminal()
    }
}

// =============================================================================
// Gateway Types
// =============================================================================

/// The result of one state-changing call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOutcome {
    /// Whether the ledger confirmed the call.
    pub success: bool,
    /// Transaction reference, when one was assigned.
    pub tx_ref: Option<String>,
    /// Confirmation block.
    pub confirmed_at_block: Option<u64>,
    /// Why the call failed.
    pub failure_reason: Option<String>,
}

impl TransactionOutcome {
    /// A confirmed call.
    #[must_use]
    pub fn confirmed(receipt: SubmitReceipt) -> Self {
        Self {
            success: true,
            tx_ref: Some(receipt.tx_ref),
            confirmed_at_block: Some(receipt.block_number),
            failure_reason: None,
        }
    }

    /// A failed call.
    #[must_use]
    pub fn failed(error: &SubmissionError) -> Self {
        Self {
            success: false,
            tx_ref: None,
            confirmed_at_block: None,
            failure_reason: Some(error.to_string()),
        }
    }
}

/// A decoded agreement read together with the ledger's own aggregates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgreementSnapshot {
    /// Decoded agreement.
    pub agreement: Agreement,
    /// Contract-computed total repayment.
    pub ledger_total: Amount,
    /// Contract-computed regular installment.
    pub ledger_installment: Amount,
    /// Block height of the read.
    pub block_number: u64,
}

/// A live event stream for one address.
///
/// Dropping the subscription releases the transport stream.
#[derive(Debug)]
pub struct EventSubscription {
    address: Address,
    receiver: mpsc::Receiver<RawEvent>,
}

impl EventSubscription {
    /// The subscribed address.
    #[must_use]
    pub const fn address(&self) -> &Address {
        &self.address
    }

    /// Waits for the next event. `None` means the stream disconnected.
    pub async fn next(&mut self) -> Option<RawEvent> {
        self.receiver.recv().await
    }

    /// Cancels the subscription and releases the stream.
    pub fn cancel(mut self) {
        self.receiver.close();
        debug!(address = %self.address, "subscription cancelled");
    }
}

// =============================================================================
// LedgerGateway
// =============================================================================

/// Typed, time-bounded access to agreement contracts.
#[derive(Clone)]
pub struct LedgerGateway {
    transport: Arc<dyn LedgerTransport>,
    read_timeout: Duration,
    submit_timeout: Duration,
}

impl fmt::Debug for LedgerGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LedgerGateway")
            .field("read_timeout", &self.read_timeout)
            .field("submit_timeout", &self.submit_timeout)
            .finish_non_exhaustive()
    }
}

impl LedgerGateway {
    /// Creates a gateway over `transport`.
    #[must_use]
    pub fn new(transport: Arc<dyn LedgerTransport>, config: &LedgerConfig) -> Self {
        Self {
            transport,
            read_timeout: config.read_timeout,
            submit_timeout: config.submit_timeout,
        }
    }

    /// Reads and decodes the agreement at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerReadError`] on a missing contract, timeout, network
    /// failure or undecodable field.
    pub async fn read(&self, address: &Address) -> Result<AgreementSnapshot, LedgerReadError> {
        let raw = tokio::time::timeout(
            self.read_timeout,
            self.transport.read_fields(address.as_str()),
        )
        .await
        .map_err(|_| LedgerReadError::Timeout(self.read_timeout))?
        .map_err(|e| match e {
            TransportError::NotFound => LedgerReadError::NotFound(address.clone()),
            TransportError::Timeout => LedgerReadError::Timeout(self.read_timeout),
            other => LedgerReadError::Network(other.to_string()),
        })?;
        decode_snapshot(address, raw)
    }

    /// Submits `operation` on behalf of `caller` with `value` attached and
    /// waits for confirmation.
    ///
    /// # Errors
    ///
    /// Returns [`SubmissionError`] describing the rejection or timeout.
    pub async fn submit(
        &self,
        address: &Address,
        operation: Operation,
        caller: &Address,
        value: Amount,
    ) -> Result<TransactionOutcome, SubmissionError> {
        let args = RawCallArgs {
            caller: caller.to_string(),
            value: value.base_units(),
        };
        let receipt = tokio::time::timeout(
            self.submit_timeout,
            self.transport.submit(address.as_str(), operation, args),
        )
        .await
        .map_err(|_| SubmissionError::Timeout(self.submit_timeout))?
        .map_err(|e| match e {
            TransportError::UserRejected => SubmissionError::UserRejected,
            TransportError::InsufficientFunds => SubmissionError::InsufficientFunds,
            TransportError::Reverted(reason) => SubmissionError::Reverted { reason },
            TransportError::NotFound => SubmissionError::Reverted {
                reason: "no agreement deployed at address".to_string(),
            },
            TransportError::Timeout => SubmissionError::Timeout(self.submit_timeout),
            TransportError::Disconnected => SubmissionError::Network("disconnected".to_string()),
            TransportError::Network(msg) => SubmissionError::Network(msg),
        })?;
        debug!(
            address = %address,
            operation = %operation,
            tx_ref = %receipt.tx_ref,
            block = receipt.block_number,
            "submission confirmed"
        );
        Ok(TransactionOutcome::confirmed(receipt))
    }

    /// Opens an event stream for `address` starting at `from_block`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerReadError`] if the stream cannot be opened.
    pub async fn subscribe(
        &self,
        address: &Address,
        from_block: u64,
    ) -> Result<EventSubscription, LedgerReadError> {
        let receiver = tokio::time::timeout(
            self.read_timeout,
            self.transport.subscribe(address.as_str(), from_block),
        )
        .await
        .map_err(|_| LedgerReadError::Timeout(self.read_timeout))?
        .map_err(|e| match e {
            TransportError::NotFound => LedgerReadError::NotFound(address.clone()),
            TransportError::Timeout => LedgerReadError::Timeout(self.read_timeout),
            other => LedgerReadError::Network(other.to_string()),
        })?;
        Ok(EventSubscription {
            address: address.clone(),
            receiver,
        })
    }
}

fn decode_snapshot(
    address: &Address,
    raw: RawAgreementFields,
) -> Result<AgreementSnapshot, LedgerReadError> {
    let kind = AgreementKind::from_ledger_code(raw.kind)
        .ok_or_else(|| LedgerReadError::Decode(format!("unknown agreement kind {}", raw.kind)))?;
    let status = AgreementStatus::from_ledger_code(raw.status)
        .ok_or_else(|| LedgerReadError::Decode(format!("unknown status code {}", raw.status)))?;
    let creditor = Address::parse(&raw.creditor)
        .map_err(|e| LedgerReadError::Decode(format!("creditor: {e}")))?;
    let debtor = Address::parse(&raw.debtor)
        .map_err(|e| LedgerReadError::Decode(format!("debtor: {e}")))?;
    let rate = Rate::from_bps(raw.rate_bps).map_err(|e| LedgerReadError::Decode(e.to_string()))?;
    if raw.duration == 0 {
        warn!(address = %address, "ledger reports zero duration");
    }

    let agreement = Agreement {
        address: address.clone(),
        parties: Parties {
            kind,
            creditor,
            debtor,
        },
        terms: Terms {
            principal: Amount::from_base_units(raw.principal),
            rate,
            duration: raw.duration,
            grace_allowance: raw.grace_allowance,
            period_secs: raw.period_secs,
            collateral: Amount::from_base_units(raw.collateral),
        },
        status,
        last_settled_period: raw.last_settled_period,
        grace_used: raw.grace_used,
        started_at: (raw.started_at != 0).then_some(raw.started_at),
        collateral_held: Amount::from_base_units(raw.collateral_held),
    };
    Ok(AgreementSnapshot {
        agreement,
        ledger_total: Amount::from_base_units(raw.total_repayment),
        ledger_installment: Amount::from_base_units(raw.installment_amount),
        block_number: raw.block_number,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_fields() -> RawAgreementFields {
        RawAgreementFields {
            kind: 0,
            creditor: format!("0x{}", "11".repeat(20)),
            debtor: format!("0x{}", "22".repeat(20)),
            status: 2,
            principal: 2_500_000_000_000_000_000,
            rate_bps: 550,
            duration: 12,
            grace_allowance: 2,
            grace_used: 1,
            period_secs: 60,
            collateral: 1_000,
            collateral_held: 1_000,
            last_settled_period: 3,
            started_at: 1_700_000_000,
            total_repayment: 2_637_500_000_000_000_000,
            installment_amount: 219_791_666_666_666_666,
            block_number: 42,
        }
    }

    fn address() -> Address {
        Address::parse(&format!("0x{}", "ab".repeat(20))).unwrap()
    }

    #[test]
    fn test_decode_snapshot() {
        let snapshot = decode_snapshot(&address(), raw_fields()).unwrap();
        let agreement = &snapshot.agreement;
        assert_eq!(agreement.status, AgreementStatus::Active);
        assert_eq!(agreement.parties.kind, AgreementKind::Loan);
        assert_eq!(agreement.terms.rate.bps(), 550);
        assert_eq!(agreement.terms.principal, "2.5".parse().unwrap());
        assert_eq!(agreement.started_at, Some(1_700_000_000));
        assert_eq!(snapshot.ledger_total, "2.6375".parse().unwrap());
        assert_eq!(snapshot.block_number, 42);
    }

    #[test]
    fn test_decode_rejects_unknown_codes() {
        let mut raw = raw_fields();
        raw.status = 9;
        assert!(matches!(
            decode_snapshot(&address(), raw),
            Err(LedgerReadError::Decode(_))
        ));

        let mut raw = raw_fields();
        raw.creditor = "nope".to_string();
        assert!(matches!(
            decode_snapshot(&address(), raw),
            Err(LedgerReadError::Decode(_))
        ));
    }

    #[test]
    fn test_unstarted_agreement_has_no_start() {
        let mut raw = raw_fields();
        raw.started_at = 0;
        let snapshot = decode_snapshot(&address(), raw).unwrap();
        assert_eq!(snapshot.agreement.started_at, None);
    }

    #[test]
    fn test_submission_error_classification() {
        assert!(SubmissionError::UserRejected.is_terminal());
        assert!(SubmissionError::InsufficientFunds.is_terminal());
        assert!(
            SubmissionError::Reverted {
                reason: "x".to_string()
            }
            .is_terminal()
        );
        assert!(!SubmissionError::Timeout(Duration::from_secs(1)).is_terminal());
        assert!(SubmissionError::Network("x".to_string()).is_retryable());
        assert_eq!(SubmissionError::UserRejected.kind(), "user_rejected");
    }

    #[test]
    fn test_transaction_outcome_constructors() {
        let ok = TransactionOutcome::confirmed(SubmitReceipt {
            tx_ref: "0x01".to_string(),
            block_number: 7,
        });
        assert!(ok.success);
        assert_eq!(ok.confirmed_at_block, Some(7));

        let failed = TransactionOutcome::failed(&SubmissionError::InsufficientFunds);
        assert!(!failed.success);
        assert_eq!(failed.failure_reason.as_deref(), Some("insufficient funds"));
    }
}
