//! Action Orchestrator.
//!
//! Sequences the state-changing operations as a saga: validate the caller
//! against the current view, mark the view pending, submit and await
//! confirmation, then reconcile. Ledger success is reported even when the
//! follow-up backend sync degrades; the degradation travels as a warning.

use std::sync::Arc;

use leasehold_core::agreement::{Address, AgreementStatus, Role, Side};
use leasehold_core::amount::Amount;
use leasehold_core::retry::Retryable;
use thiserror::Error;
use tracing::{info, warn};

use crate::ledger::{LedgerGateway, Operation, SubmissionError, TransactionOutcome};
use crate::notifier::{Notification, Notifier};
use crate::synchronizer::{AgreementView, Freshness, ReconcileOutcome, StateSynchronizer, SyncError};

/// Why an operation was refused or failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ActionError {
    /// The caller is neither creditor nor debtor.
    #[error("{caller} is not a party to this agreement")]
    NotAParty {
        /// Rejected caller.
        caller: Address,
    },

    /// The caller sits on the wrong side for the operation.
    #[error("{operation} cannot be performed by the {role}")]
    WrongRole {
        /// Requested operation.
        operation: Operation,
        /// The caller's role.
        role: Role,
    },

    /// The agreement is not in a status that permits the operation.
    #[error("{operation} is not allowed while the agreement is {status}")]
    InvalidStatus {
        /// Requested operation.
        operation: Operation,
        /// Current status.
        status: AgreementStatus,
    },

    /// Skipping would exceed the grace allowance.
    #[error("grace allowance exhausted ({used} of {allowance} used)")]
    GraceExhausted {
        /// Periods already skipped.
        used: u32,
        /// Contractual allowance.
        allowance: u32,
    },

    /// Every installment is settled.
    #[error("no installment is due")]
    NothingDue,

    /// The current view could not be established.
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// The ledger rejected or did not confirm the submission.
    #[error(transparent)]
    Submission(#[from] SubmissionError),
}

impl Retryable for ActionError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Submission(e) => e.is_retryable(),
            Self::NotAParty { .. }
            | Self::WrongRole { .. }
            | Self::InvalidStatus { .. }
            | Self::GraceExhausted { .. }
            | Self::NothingDue
            | Self::Sync(_) => false,
        }
    }
}

/// Result of a confirmed operation.
#[derive(Debug, Clone)]
pub struct ActionReport {
    /// The operation performed.
    pub operation: Operation,
    /// Ledger confirmation.
    pub outcome: TransactionOutcome,
    /// View after the follow-up reconciliation, if it succeeded.
    pub view: Option<AgreementView>,
    /// Set when the follow-up sync did not complete.
    pub sync_warning: Option<String>,
}

impl ActionReport {
    /// Returns `true` when the backend mirror reflects the operation.
    #[must_use]
    pub const fn is_fully_synchronized(&self) -> bool {
        self.sync_warning.is_none()
    }
}

/// Runs fund, activate, repay and skip against the ledger.
#[derive(Debug, Clone)]
pub struct ActionOrchestrator {
    gateway: LedgerGateway,
    synchronizer: Arc<StateSynchronizer>,
    notifier: Notifier,
}

impl ActionOrchestrator {
    /// Creates an orchestrator.
    #[must_use]
    pub const fn new(
        gateway: LedgerGateway,
        synchronizer: Arc<StateSynchronizer>,
        notifier: Notifier,
    ) -> Self {
        Self {
            gateway,
            synchronizer,
            notifier,
        }
    }

    /// Creditor funds the principal.
    ///
    /// # Errors
    ///
    /// See [`ActionError`].
    pub async fn fund(&self, address: &Address, caller: &Address) -> Result<ActionReport, ActionError> {
        self.execute(address, Operation::Fund, caller).await
    }

    /// Debtor activates, posting the collateral.
    ///
    /// # Errors
    ///
    /// See [`ActionError`].
    pub async fn activate(
        &self,
        address: &Address,
        caller: &Address,
    ) -> Result<ActionReport, ActionError> {
        self.execute(address, Operation::Activate, caller).await
    }

    /// Debtor pays the installment currently due.
    ///
    /// # Errors
    ///
    /// See [`ActionError`].
    pub async fn repay(&self, address: &Address, caller: &Address) -> Result<ActionReport, ActionError> {
        self.execute(address, Operation::Repay, caller).await
    }

    /// Debtor defers the installment currently due by one period.
    ///
    /// # Errors
    ///
    /// See [`ActionError`].
    pub async fn skip(&self, address: &Address, caller: &Address) -> Result<ActionReport, ActionError> {
        self.execute(address, Operation::Skip, caller).await
    }

    /// Runs `operation` for `caller`.
    ///
    /// # Errors
    ///
    /// See [`ActionError`].
    pub async fn execute(
        &self,
        address: &Address,
        operation: Operation,
        caller: &Address,
    ) -> Result<ActionReport, ActionError> {
        let view = self.synchronizer.ensure_view(address).await?;
        let value = authorize(&view, operation, caller)?;

        self.synchronizer.set_pending(address, Some(operation));
        info!(
            address = %address,
            operation = %operation,
            caller = %caller,
            value = %value,
            "submitting"
        );

        let outcome = match self.gateway.submit(address, operation, caller, value).await {
            Ok(outcome) => outcome,
            Err(error) => {
                self.synchronizer.set_pending(address, None);
                if matches!(error, SubmissionError::Timeout(_)) {
                    // The transaction may still land; pick up whatever did.
                    if let Err(e) = self.synchronizer.reconcile(address).await {
                        warn!(address = %address, error = %e, "reconcile after timeout failed");
                    }
                }
                warn!(
                    address = %address,
                    operation = %operation,
                    kind = error.kind(),
                    error = %error,
                    "submission failed"
                );
                self.notifier.notify(Notification::OperationFailed {
                    address: address.clone(),
                    operation,
                    outcome: TransactionOutcome::failed(&error),
                    retryable: error.is_retryable(),
                });
                return Err(error.into());
            },
        };

        if operation == Operation::Repay {
            if let Some(tx_ref) = &outcome.tx_ref {
                let period = view.agreement.last_settled_period.saturating_add(1);
                self.synchronizer
                    .note_settlement(address, period, tx_ref.clone())
                    .await;
            }
        }

        let reconciled = self.synchronizer.reconcile(address).await;
        self.synchronizer.set_pending(address, None);

        let mut sync_warning = match &reconciled {
            Ok(ReconcileOutcome::Degraded { reason, attempts }) => Some(format!(
                "backend sync degraded after {attempts} attempts: {reason}"
            )),
            Ok(ReconcileOutcome::Unchanged | ReconcileOutcome::Synchronized { .. }) => None,
            Err(e) => Some(format!("reconciliation failed: {e}")),
        };
        let view = reconciled
            .ok()
            .and_then(|_| self.synchronizer.snapshot(address));
        if sync_warning.is_none() {
            if let Some(Freshness::Degraded { reason }) = view.as_ref().map(|v| &v.freshness) {
                sync_warning = Some(format!("backend sync degraded: {reason}"));
            }
        }

        info!(
            address = %address,
            operation = %operation,
            tx_ref = ?outcome.tx_ref,
            block = ?outcome.confirmed_at_block,
            synchronized = sync_warning.is_none(),
            "operation confirmed"
        );
        Ok(ActionReport {
            operation,
            outcome,
            view,
            sync_warning,
        })
    }
}

/// Checks `caller` may perform `operation` and returns the value to attach.
fn authorize(
    view: &AgreementView,
    operation: Operation,
    caller: &Address,
) -> Result<Amount, ActionError> {
    let agreement = &view.agreement;
    let role = agreement
        .role_of(caller)
        .ok_or_else(|| ActionError::NotAParty {
            caller: caller.clone(),
        })?;
    let status = agreement.status;
    let invalid = || ActionError::InvalidStatus { operation, status };
    let wrong_role = || ActionError::WrongRole { operation, role };

    match operation {
        Operation::Fund => {
            if role.side() != Side::Creditor {
                return Err(wrong_role());
            }
            if status != AgreementStatus::Initialized {
                return Err(invalid());
            }
            Ok(agreement.terms.principal)
        },
        Operation::Activate => {
            if role.side() != Side::Debtor {
                return Err(wrong_role());
            }
            if status != AgreementStatus::Ready {
                return Err(invalid());
            }
            Ok(agreement.terms.collateral)
        },
        Operation::Repay => {
            if role.side() != Side::Debtor {
                return Err(wrong_role());
            }
            if !matches!(status, AgreementStatus::Active | AgreementStatus::Settling) {
                return Err(invalid());
            }
            view.next_due
                .as_ref()
                .map(|i| i.due_amount)
                .ok_or(ActionError::NothingDue)
        },
        Operation::Skip => {
            if role.side() != Side::Debtor {
                return Err(wrong_role());
            }
            if !matches!(status, AgreementStatus::Active | AgreementStatus::Settling) {
                return Err(invalid());
            }
            if agreement.grace_used >= agreement.terms.grace_allowance {
                return Err(ActionError::GraceExhausted {
                    used: agreement.grace_used,
                    allowance: agreement.terms.grace_allowance,
                });
            }
            Ok(Amount::ZERO)
        },
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use leasehold_core::agreement::{AgreementKind, Parties, Terms};
    use leasehold_core::amount::Rate;
    use leasehold_core::config::{LedgerConfig, SyncConfig};
    use leasehold_core::retry::RetryPolicy;

    use super::*;
    use crate::backend::memory::InMemoryBackendStore;
    use crate::ledger::TransportError;
    use crate::ledger::simulated::SimulatedLedger;
    use crate::metrics::MetricsRegistry;

    fn principal(byte: u8) -> Address {
        Address::parse(&format!("0x{}", format!("{byte:02x}").repeat(20))).unwrap()
    }

    struct Fixture {
        ledger: Arc<SimulatedLedger>,
        backend: Arc<InMemoryBackendStore>,
        notifier: Notifier,
        orchestrator: ActionOrchestrator,
        address: Address,
        creditor: Address,
        debtor: Address,
    }

    fn fixture(ledger_config: &LedgerConfig) -> Fixture {
        let ledger = Arc::new(SimulatedLedger::new());
        let creditor = principal(1);
        let debtor = principal(2);
        let parties = Parties {
            kind: AgreementKind::Loan,
            creditor: creditor.clone(),
            debtor: debtor.clone(),
        };
        let terms = Terms::loan(
            "10".parse().unwrap(),
            Rate::from_bps(300).unwrap(),
            10,
            2,
        )
        .with_collateral("1".parse().unwrap());
        let address = ledger.deploy(&parties, &terms).unwrap();
        ledger.credit(&creditor, "10".parse().unwrap());
        ledger.credit(&debtor, "2".parse().unwrap());

        let backend = Arc::new(InMemoryBackendStore::new());
        let notifier = Notifier::new(64);
        let metrics = MetricsRegistry::new().unwrap();
        let gateway = LedgerGateway::new(ledger.clone(), ledger_config);
        let config = SyncConfig {
            retry: RetryPolicy::fixed(3, Duration::from_millis(50)),
            backend_timeout: Duration::from_secs(2),
            ..SyncConfig::default()
        };
        let synchronizer = Arc::new(StateSynchronizer::new(
            gateway.clone(),
            backend.clone(),
            notifier.clone(),
            metrics.sync_metrics().clone(),
            &config,
        ));
        Fixture {
            ledger,
            backend,
            orchestrator: ActionOrchestrator::new(gateway, synchronizer, notifier.clone()),
            notifier,
            address,
            creditor,
            debtor,
        }
    }

    #[tokio::test]
    async fn test_lifecycle_moves_funds() {
        let f = fixture(&LedgerConfig::default());
        let report = f.orchestrator.fund(&f.address, &f.creditor).await.unwrap();
        assert!(report.outcome.success);
        assert!(report.is_fully_synchronized());
        assert_eq!(
            report.view.unwrap().agreement.status,
            AgreementStatus::Ready
        );

        let report = f
            .orchestrator
            .activate(&f.address, &f.debtor)
            .await
            .unwrap();
        assert_eq!(
            report.view.unwrap().agreement.status,
            AgreementStatus::Active
        );
        assert_eq!(f.ledger.balance_of(&f.debtor), "11".parse().unwrap());

        let report = f.orchestrator.repay(&f.address, &f.debtor).await.unwrap();
        let view = report.view.unwrap();
        assert_eq!(view.agreement.last_settled_period, 1);
        assert_eq!(view.agreement.status, AgreementStatus::Settling);
        assert!(view.schedule.installments()[0].paid);
        assert_eq!(
            view.schedule.installments()[0].settling_tx_ref,
            report.outcome.tx_ref
        );
        assert!(!view.is_pending());
        assert_eq!(f.backend.payments(&f.address).len(), 1);
    }

    #[tokio::test]
    async fn test_role_and_status_checks() {
        let f = fixture(&LedgerConfig::default());
        let block = f.ledger.current_block();
        let stranger = principal(9);
        assert_eq!(
            f.orchestrator.fund(&f.address, &stranger).await.unwrap_err(),
            ActionError::NotAParty { caller: stranger }
        );
        assert_eq!(
            f.orchestrator.fund(&f.address, &f.debtor).await.unwrap_err(),
            ActionError::WrongRole {
                operation: Operation::Fund,
                role: Role::Borrower,
            }
        );
        assert_eq!(
            f.orchestrator
                .repay(&f.address, &f.debtor)
                .await
                .unwrap_err(),
            ActionError::InvalidStatus {
                operation: Operation::Repay,
                status: AgreementStatus::Initialized,
            }
        );
        assert_eq!(f.ledger.current_block(), block);
    }

    #[tokio::test]
    async fn test_skip_refused_beyond_allowance() {
        let f = fixture(&LedgerConfig::default());
        f.orchestrator.fund(&f.address, &f.creditor).await.unwrap();
        f.orchestrator.activate(&f.address, &f.debtor).await.unwrap();
        f.orchestrator.skip(&f.address, &f.debtor).await.unwrap();
        let report = f.orchestrator.skip(&f.address, &f.debtor).await.unwrap();
        assert_eq!(report.view.unwrap().agreement.grace_used, 2);

        assert_eq!(
            f.orchestrator.skip(&f.address, &f.debtor).await.unwrap_err(),
            ActionError::GraceExhausted {
                used: 2,
                allowance: 2,
            }
        );
    }

    #[tokio::test]
    async fn test_rejection_notifies_and_clears_pending() {
        let f = fixture(&LedgerConfig::default());
        let mut notifications = f.notifier.subscribe();
        f.ledger
            .reject_next_submission(TransportError::UserRejected);

        let err = f
            .orchestrator
            .fund(&f.address, &f.creditor)
            .await
            .unwrap_err();
        assert_eq!(err, ActionError::Submission(SubmissionError::UserRejected));
        assert!(!err.is_retryable());

        let failed = std::iter::from_fn(|| notifications.try_recv().ok())
            .find(|n| matches!(n, Notification::OperationFailed { .. }))
            .unwrap();
        assert_eq!(
            failed,
            Notification::OperationFailed {
                address: f.address.clone(),
                operation: Operation::Fund,
                outcome: TransactionOutcome::failed(&SubmissionError::UserRejected),
                retryable: false,
            }
        );
        if let Notification::OperationFailed { outcome, .. } = &failed {
            assert!(!outcome.success);
            assert!(outcome.tx_ref.is_none());
        }
        let view = f.orchestrator.synchronizer.snapshot(&f.address).unwrap();
        assert!(!view.is_pending());
        assert_eq!(view.agreement.status, AgreementStatus::Initialized);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retryable_and_reconciles() {
        let config = LedgerConfig {
            submit_timeout: Duration::from_secs(1),
            ..LedgerConfig::default()
        };
        let f = fixture(&config);
        f.ledger.set_submit_delay(Some(Duration::from_secs(5)));

        let err = f
            .orchestrator
            .fund(&f.address, &f.creditor)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ActionError::Submission(SubmissionError::Timeout(_))
        ));
        assert!(err.is_retryable());

        // The call was applied before the delay, so the reconcile saw it.
        let view = f.orchestrator.synchronizer.snapshot(&f.address).unwrap();
        assert_eq!(view.agreement.status, AgreementStatus::Ready);
        assert!(!view.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_sync_is_a_warning() {
        let f = fixture(&LedgerConfig::default());
        f.orchestrator.fund(&f.address, &f.creditor).await.unwrap();
        f.backend
            .fail_always(crate::backend::BackendWriteError::Transient("503".to_string()));

        let report = f
            .orchestrator
            .activate(&f.address, &f.debtor)
            .await
            .unwrap();
        assert!(report.outcome.success);
        let warning = report.sync_warning.unwrap();
        assert!(warning.contains("3 attempts"), "{warning}");
        assert_eq!(
            report.view.unwrap().agreement.status,
            AgreementStatus::Active
        );
    }
}
