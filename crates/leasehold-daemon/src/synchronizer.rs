//! State Synchronizer.
//!
//! Owns the canonical in-memory view of every agreement and is the only
//! writer of the backend mirror. A reconciliation pass:
//!
//! 1. reads ledger truth through the gateway,
//! 2. recomputes the schedule and cross-checks it against the ledger's own
//!    aggregates,
//! 3. commits the observation to the agreement's [`SyncRecord`], rejecting
//!    regressions,
//! 4. on a change, writes through to the backend with bounded retry.
//!
//! Passes for one address are serialized by a per-address async mutex. The
//! latest view is published behind a `std::sync::RwLock` so
//! [`StateSynchronizer::current_view`] never waits on an in-flight pass.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use leasehold_core::agreement::{Address, Agreement, AgreementStatus, StatusTransition};
use leasehold_core::config::SyncConfig;
use leasehold_core::retry::{RetryError, RetryPolicy, retry_with_backoff};
use leasehold_core::schedule::{
    Installment, Schedule, ScheduleError, ScheduleMismatch, compute_schedule,
};
use leasehold_core::sync_record::{InvariantViolation, Observation, ObservationOutcome, SyncRecord};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::backend::{AgreementRecord, BackendStore, BackendWriteError, PaymentRecord, StatusUpdate};
use crate::cursor_store::CursorStore;
use crate::ledger::{AgreementSnapshot, LedgerGateway, LedgerReadError, Operation};
use crate::listener::{LedgerEvent, ListenerEvent};
use crate::metrics::SyncMetrics;
use crate::notifier::{Notification, Notifier};

// =============================================================================
// Types
// =============================================================================

/// Why a reconciliation pass failed. Nothing was applied.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SyncError {
    /// Ledger truth could not be read.
    #[error(transparent)]
    Ledger(#[from] LedgerReadError),

    /// The schedule could not be computed from the reported terms.
    #[error("schedule computation failed: {0}")]
    Schedule(#[from] ScheduleError),

    /// The computed schedule disagrees with the ledger.
    #[error(transparent)]
    Mismatch(#[from] ScheduleMismatch),

    /// The observation contradicts an earlier one or the terms.
    #[error("invariant violation: {0}")]
    Invariant(#[from] InvariantViolation),
}

/// Result of a successful reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Ledger state matches the last observation; nothing was written.
    Unchanged,
    /// The backend acknowledged every pending write.
    Synchronized {
        /// Writes acknowledged during this pass.
        writes: usize,
    },
    /// The backend write was abandoned; the record is flagged for
    /// background reconciliation.
    Degraded {
        /// Last backend error.
        reason: String,
        /// Attempts made.
        attempts: u32,
    },
}

/// Whether the view is mirrored in the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Freshness {
    /// The backend holds the observed state.
    Synchronized,
    /// The backend is stale.
    Degraded {
        /// Last backend error.
        reason: String,
    },
}

/// The merged current view of an agreement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgreementView {
    /// Ledger-confirmed agreement.
    pub agreement: Agreement,
    /// Derived schedule.
    pub schedule: Schedule,
    /// Percentage of the total paid.
    pub progress: Decimal,
    /// The installment currently due.
    pub next_due: Option<Installment>,
    /// Reconciliation bookkeeping.
    pub record: SyncRecord,
    /// Block height of the observation.
    pub observed_block: u64,
    /// Backend mirror state.
    pub freshness: Freshness,
    /// Operation submitted but not yet reconciled.
    pub pending: Option<Operation>,
}

impl AgreementView {
    /// Returns `true` while an operation awaits reconciliation.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Returns `true` when the backend holds the observed state.
    #[must_use]
    pub const fn is_synchronized(&self) -> bool {
        matches!(self.freshness, Freshness::Synchronized)
    }
}

// =============================================================================
// Per-address State
// =============================================================================

/// What the backend is known to hold.
#[derive(Debug, Clone, Copy)]
struct Mirror {
    status: AgreementStatus,
    period: u32,
    payments: u32,
}

#[derive(Debug, Default)]
struct SlotState {
    record: SyncRecord,
    restored: bool,
    mirror: Option<Mirror>,
    settlement_refs: BTreeMap<u32, String>,
    degraded_reason: Option<String>,
    announced_due: Option<(u32, Option<u64>)>,
}

#[derive(Debug, Default)]
struct Slot {
    state: tokio::sync::Mutex<SlotState>,
    snapshot: RwLock<Option<Arc<AgreementView>>>,
    pending: Mutex<Option<Operation>>,
    first_pass_started: AtomicBool,
}

impl Slot {
    fn published(&self) -> Option<Arc<AgreementView>> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn pending(&self) -> Option<Operation> {
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn merged(&self, view: &AgreementView) -> AgreementView {
        let mut merged = view.clone();
        merged.pending = self.pending();
        merged
    }
}

enum WriteResult {
    Written(usize),
    Degraded { reason: String, attempts: u32 },
}

// =============================================================================
// StateSynchronizer
// =============================================================================

/// Reconciles ledger truth into the in-memory view and the backend mirror.
pub struct StateSynchronizer {
    gateway: LedgerGateway,
    backend: Arc<dyn BackendStore>,
    notifier: Notifier,
    metrics: SyncMetrics,
    cursor_store: Option<CursorStore>,
    retry: RetryPolicy,
    backend_timeout: Duration,
    slots: Mutex<HashMap<Address, Arc<Slot>>>,
}

impl std::fmt::Debug for StateSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateSynchronizer")
            .field("retry", &self.retry)
            .field("backend_timeout", &self.backend_timeout)
            .finish_non_exhaustive()
    }
}

impl StateSynchronizer {
    /// Creates a synchronizer.
    #[must_use]
    pub fn new(
        gateway: LedgerGateway,
        backend: Arc<dyn BackendStore>,
        notifier: Notifier,
        metrics: SyncMetrics,
        config: &SyncConfig,
    ) -> Self {
        Self {
            gateway,
            backend,
            notifier,
            metrics,
            cursor_store: None,
            retry: config.retry.clone(),
            backend_timeout: config.backend_timeout,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Restores and persists sync records through `store`.
    #[must_use]
    pub fn with_cursor_store(mut self, store: CursorStore) -> Self {
        self.cursor_store = Some(store);
        self
    }

    fn slot(&self, address: &Address) -> Arc<Slot> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(address.clone()).or_default())
    }

    fn existing_slot(&self, address: &Address) -> Option<Arc<Slot>> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .cloned()
    }

    // ------------------------------------------------------------------------
    // Triggers
    // ------------------------------------------------------------------------

    /// Runs one reconciliation pass for `address`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError`] when ledger truth cannot be read or is rejected.
    pub async fn reconcile(&self, address: &Address) -> Result<ReconcileOutcome, SyncError> {
        self.pass(address, false).await.map(|(outcome, _)| outcome)
    }

    /// Poll-tick pass: a regular reconciliation that also re-attempts a
    /// flagged backend write once.
    ///
    /// # Errors
    ///
    /// Same as [`Self::reconcile`].
    pub async fn poll_tick(&self, address: &Address) -> Result<ReconcileOutcome, SyncError> {
        self.pass(address, true).await.map(|(outcome, _)| outcome)
    }

    /// Applies a listener event, then reconciles.
    ///
    /// A status event that would move the record backwards is discarded and
    /// reported as an [`InvariantViolation`], whatever block it came from.
    ///
    /// # Errors
    ///
    /// Returns the violation, or any error of [`Self::reconcile`].
    pub async fn handle_event(&self, event: &ListenerEvent) -> Result<ReconcileOutcome, SyncError> {
        let address = &event.address;
        {
            let slot = self.slot(address);
            let mut state = slot.state.lock().await;
            self.restore(address, &mut state).await;
            match &event.event {
                LedgerEvent::StatusChanged { to, .. } => {
                    if let Some(current) = state.record.last_observed_status {
                        if current.transition_to(*to) == StatusTransition::Regression {
                            debug!(
                                address = %address,
                                block = event.block_number,
                                observed_block = state.record.last_observed_block,
                                to = %to,
                                "regressive status event discarded"
                            );
                            return Err(self.violation(
                                address,
                                InvariantViolation::StatusRegression {
                                    from: current,
                                    to: *to,
                                },
                            ));
                        }
                    }
                },
                LedgerEvent::PaymentSettled { period, tx_ref, .. } => {
                    state.settlement_refs.insert(*period, tx_ref.clone());
                },
                LedgerEvent::CollateralMoved { .. } | LedgerEvent::GraceConsumed { .. } => {},
            }
        }
        self.reconcile(address).await
    }

    /// Remembers the transaction that settled `period`, so the backend
    /// payment record carries it.
    pub async fn note_settlement(&self, address: &Address, period: u32, tx_ref: String) {
        let slot = self.slot(address);
        slot.state.lock().await.settlement_refs.insert(period, tx_ref);
    }

    // ------------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------------

    /// The latest reconciled view merged with the pending flag.
    ///
    /// Never waits. Returns `None` until a pass for `address` has
    /// succeeded, starting one if none is running. A failed first pass is
    /// retried on the next call.
    #[must_use]
    pub fn current_view(self: &Arc<Self>, address: &Address) -> Option<AgreementView> {
        let slot = self.slot(address);
        if let Some(view) = slot.published() {
            return Some(slot.merged(&view));
        }
        if !slot.first_pass_started.swap(true, Ordering::SeqCst) {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let this = Arc::clone(self);
                let address = address.clone();
                handle.spawn(async move {
                    if let Err(e) = this.reconcile(&address).await {
                        warn!(address = %address, error = %e, "initial reconciliation failed");
                    }
                });
            } else {
                slot.first_pass_started.store(false, Ordering::SeqCst);
            }
        }
        None
    }

    /// The latest reconciled view, without starting a pass.
    #[must_use]
    pub fn snapshot(&self, address: &Address) -> Option<AgreementView> {
        let slot = self.existing_slot(address)?;
        slot.published().map(|view| slot.merged(&view))
    }

    /// The latest view, reconciling first if none exists yet.
    ///
    /// # Errors
    ///
    /// Returns the error of the reconciliation pass.
    pub async fn ensure_view(&self, address: &Address) -> Result<AgreementView, SyncError> {
        if let Some(view) = self.snapshot(address) {
            return Ok(view);
        }
        let (_, view) = self.pass(address, false).await?;
        Ok(self.slot(address).merged(&view))
    }

    /// Sets or clears the pending-operation flag.
    pub fn set_pending(&self, address: &Address, operation: Option<Operation>) {
        let slot = self.slot(address);
        *slot.pending.lock().unwrap_or_else(PoisonError::into_inner) = operation;
    }

    // ------------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------------

    async fn pass(
        &self,
        address: &Address,
        background: bool,
    ) -> Result<(ReconcileOutcome, Arc<AgreementView>), SyncError> {
        let slot = self.slot(address);
        slot.first_pass_started.store(true, Ordering::SeqCst);
        let mut state = slot.state.lock().await;
        let result = self.pass_locked(address, &slot, &mut state, background).await;
        if result.is_err() && slot.published().is_none() {
            // Let the next current_view call start another first pass.
            slot.first_pass_started.store(false, Ordering::SeqCst);
        }
        let label = match &result {
            Ok((ReconcileOutcome::Unchanged, _)) => "unchanged",
            Ok((ReconcileOutcome::Synchronized { .. }, _)) => "changed",
            Ok((ReconcileOutcome::Degraded { .. }, _)) => "degraded",
            Err(_) => "failed",
        };
        self.metrics.reconcile_completed(label);
        result
    }

    async fn pass_locked(
        &self,
        address: &Address,
        slot: &Slot,
        state: &mut SlotState,
        background: bool,
    ) -> Result<(ReconcileOutcome, Arc<AgreementView>), SyncError> {
        self.restore(address, state).await;

        let AgreementSnapshot {
            agreement,
            ledger_total,
            ledger_installment,
            block_number,
        } = self.gateway.read(address).await?;

        agreement
            .check_invariants()
            .map_err(|v| self.violation(address, v))?;

        let mut schedule = compute_schedule(
            &agreement.terms,
            agreement.started_at,
            agreement.last_settled_period,
            agreement.grace_used,
        )?;
        if let Err(mismatch) = schedule.verify_against(ledger_total, ledger_installment) {
            error!(address = %address, error = %mismatch, "schedule disagrees with ledger");
            return Err(mismatch.into());
        }
        for (period, tx_ref) in &state.settlement_refs {
            schedule.attach_settlement(*period, tx_ref.clone());
        }

        let observation = Observation {
            status: agreement.status,
            period: agreement.last_settled_period,
            block: block_number,
        };
        let outcome = state
            .record
            .observe(&observation)
            .map_err(|v| self.violation(address, v))?;

        let written = match outcome {
            ObservationOutcome::Changed {
                previous_status, ..
            } => {
                if previous_status != Some(agreement.status) {
                    info!(
                        address = %address,
                        from = ?previous_status,
                        to = %agreement.status,
                        block = block_number,
                        "status changed"
                    );
                    self.notifier.notify(Notification::StatusChanged {
                        address: address.clone(),
                        from: previous_status,
                        to: agreement.status,
                    });
                }
                Some(
                    self.write_through(address, &agreement, &schedule, state, &self.retry, true)
                        .await,
                )
            },
            ObservationOutcome::Unchanged if background && state.record.needs_reconciliation => {
                debug!(address = %address, "re-attempting flagged backend write");
                let single = self.retry.clone().with_max_attempts(1);
                Some(
                    self.write_through(address, &agreement, &schedule, state, &single, false)
                        .await,
                )
            },
            ObservationOutcome::Unchanged => None,
        };

        self.announce_due(address, &agreement, &schedule, state);
        let view = Self::publish(slot, state, agreement, schedule);
        if written.is_some() {
            self.persist(address, &state.record).await;
        }

        let outcome = match written {
            None => ReconcileOutcome::Unchanged,
            Some(WriteResult::Written(writes)) => ReconcileOutcome::Synchronized { writes },
            Some(WriteResult::Degraded { reason, attempts }) => {
                ReconcileOutcome::Degraded { reason, attempts }
            },
        };
        Ok((outcome, view))
    }

    /// Brings the backend up to the observed state: creates the record on
    /// first sight, posts payments for newly settled periods, then updates
    /// status and period.
    async fn write_through(
        &self,
        address: &Address,
        agreement: &Agreement,
        schedule: &Schedule,
        state: &mut SlotState,
        policy: &RetryPolicy,
        announce: bool,
    ) -> WriteResult {
        let backend = &*self.backend;
        let target_status = agreement.status;
        let target_period = agreement.last_settled_period;
        let mut writes = 0;

        let mut mirror = if let Some(mirror) = state.mirror {
            mirror
        } else {
            let existing = match self
                .backend_call(address, state, policy, "get_agreement", move || {
                    backend.get_agreement(address)
                })
                .await
            {
                Ok(existing) => existing,
                Err(e) => return self.degrade(address, state, e, announce),
            };
            let mirror = if let Some(existing) = existing {
                Mirror {
                    status: existing.status,
                    period: existing.period,
                    payments: existing.period,
                }
            } else {
                let record = AgreementRecord::from_agreement(agreement);
                let record = &record;
                if let Err(e) = self
                    .backend_call(address, state, policy, "create_agreement", move || {
                        backend.create_agreement(record)
                    })
                    .await
                {
                    return self.degrade(address, state, e, announce);
                }
                writes += 1;
                Mirror {
                    status: target_status,
                    period: target_period,
                    payments: 0,
                }
            };
            state.mirror = Some(mirror);
            mirror
        };

        for period in (mirror.payments + 1)..=target_period {
            let Some(installment) = schedule
                .installments()
                .iter()
                .find(|i| i.sequence_number == period)
            else {
                break;
            };
            let payment = PaymentRecord {
                period,
                amount: installment.due_amount,
                tx_ref: state.settlement_refs.get(&period).cloned(),
            };
            let payment = &payment;
            if let Err(e) = self
                .backend_call(address, state, policy, "record_payment", move || {
                    backend.record_payment(address, payment)
                })
                .await
            {
                return self.degrade(address, state, e, announce);
            }
            writes += 1;
            mirror.payments = period;
            state.mirror = Some(mirror);
        }

        if mirror.status != target_status || mirror.period != target_period {
            let update = StatusUpdate {
                status: target_status,
                period: target_period,
            };
            let update = &update;
            if let Err(e) = self
                .backend_call(address, state, policy, "update_status", move || {
                    backend.update_status(address, update)
                })
                .await
            {
                return self.degrade(address, state, e, announce);
            }
            writes += 1;
            mirror.status = target_status;
            mirror.period = target_period;
            state.mirror = Some(mirror);
        }

        if state.record.needs_reconciliation {
            info!(address = %address, "backend mirror caught up");
        }
        state.record.record_backend_success(Utc::now());
        state.degraded_reason = None;
        WriteResult::Written(writes)
    }

    /// One backend call under the retry policy, each attempt bounded by the
    /// backend timeout.
    async fn backend_call<T, F, Fut>(
        &self,
        address: &Address,
        state: &mut SlotState,
        policy: &RetryPolicy,
        call_name: &'static str,
        call: F,
    ) -> Result<T, RetryError<BackendWriteError>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, BackendWriteError>>,
    {
        let timeout = self.backend_timeout;
        let limit = self.retry.max_attempts;
        let metrics = &self.metrics;
        let record = &mut state.record;
        let result = retry_with_backoff(
            policy,
            |_| {
                let attempt = call();
                async move {
                    tokio::time::timeout(timeout, attempt)
                        .await
                        .unwrap_or_else(|_| {
                            Err(BackendWriteError::Transient(format!(
                                "backend call timed out after {timeout:?}"
                            )))
                        })
                }
            },
            |attempt, error| {
                record.record_backend_failure(limit);
                metrics.backend_write_attempt("failure");
                warn!(
                    address = %address,
                    call = call_name,
                    attempt,
                    error = %error,
                    "backend call failed"
                );
            },
        )
        .await;
        result.map(|retried| {
            metrics.backend_write_attempt("success");
            if retried.attempts > 1 {
                info!(
                    address = %address,
                    call = call_name,
                    attempts = retried.attempts,
                    "backend call succeeded after retry"
                );
            }
            retried.value
        })
    }

    fn degrade(
        &self,
        address: &Address,
        state: &mut SlotState,
        error: RetryError<BackendWriteError>,
        announce: bool,
    ) -> WriteResult {
        let attempts = error.attempts();
        let reason = error.into_inner().to_string();
        state.record.mark_degraded();
        state.degraded_reason = Some(reason.clone());
        if announce {
            error!(address = %address, attempts, reason = %reason, "backend sync degraded");
            self.metrics.sync_degraded();
            self.notifier.notify(Notification::SyncDegraded {
                address: address.clone(),
                reason: reason.clone(),
                attempts,
            });
        } else {
            debug!(address = %address, reason = %reason, "background backend write failed");
        }
        WriteResult::Degraded { reason, attempts }
    }

    fn violation(&self, address: &Address, violation: InvariantViolation) -> SyncError {
        error!(
            address = %address,
            kind = violation.kind(),
            violation = %violation,
            "InvariantViolation: observation discarded"
        );
        self.metrics.invariant_violation(violation.kind());
        SyncError::Invariant(violation)
    }

    fn announce_due(
        &self,
        address: &Address,
        agreement: &Agreement,
        schedule: &Schedule,
        state: &mut SlotState,
    ) {
        if !matches!(
            agreement.status,
            AgreementStatus::Active | AgreementStatus::Settling
        ) {
            return;
        }
        let due = schedule.next_due(agreement.last_settled_period);
        let key = due.map(|i| (i.sequence_number, i.due_at));
        if key == state.announced_due {
            return;
        }
        state.announced_due = key;
        if let Some(installment) = due {
            self.notifier.notify(Notification::PaymentDue {
                address: address.clone(),
                installment: installment.clone(),
            });
        }
    }

    fn publish(
        slot: &Slot,
        state: &SlotState,
        agreement: Agreement,
        schedule: Schedule,
    ) -> Arc<AgreementView> {
        let freshness = if state.record.needs_reconciliation {
            Freshness::Degraded {
                reason: state
                    .degraded_reason
                    .clone()
                    .unwrap_or_else(|| "backend write pending".to_string()),
            }
        } else {
            Freshness::Synchronized
        };
        let view = Arc::new(AgreementView {
            progress: schedule.progress(),
            next_due: schedule.next_due(agreement.last_settled_period).cloned(),
            agreement,
            schedule,
            record: state.record.clone(),
            observed_block: state.record.last_observed_block,
            freshness,
            pending: None,
        });
        *slot
            .snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&view));
        view
    }

    async fn restore(&self, address: &Address, state: &mut SlotState) {
        if state.restored {
            return;
        }
        state.restored = true;
        let Some(store) = &self.cursor_store else {
            return;
        };
        let target = address.clone();
        match store.run_blocking(move |s| s.load_record(&target)).await {
            Ok(Some(record)) => {
                info!(
                    address = %address,
                    status = ?record.last_observed_status,
                    period = record.last_observed_period,
                    "sync record restored"
                );
                state.record = record;
            },
            Ok(None) => {},
            Err(e) => warn!(address = %address, error = %e, "failed to restore sync record"),
        }
    }

    async fn persist(&self, address: &Address, record: &SyncRecord) {
        let Some(store) = &self.cursor_store else {
            return;
        };
        let target = address.clone();
        let record = record.clone();
        if let Err(e) = store
            .run_blocking(move |s| s.save_record(&target, &record))
            .await
        {
            warn!(address = %address, error = %e, "failed to persist sync record");
        }
    }
}

#[cfg(test)]
#[allow(clippy::float_cmp)]
mod tests {
    use leasehold_core::agreement::{AgreementKind, Parties, Terms};
    use leasehold_core::amount::{Amount, Rate};
    use leasehold_core::config::LedgerConfig;
    use serde_json::json;

    use super::*;
    use crate::backend::memory::{BackendWrite, InMemoryBackendStore};
    use crate::ledger::simulated::SimulatedLedger;
    use crate::ledger::{EVENT_STATUS_CHANGED, LedgerTransport, RawCallArgs};
    use crate::metrics::MetricsRegistry;

    fn principal(byte: u8) -> Address {
        Address::parse(&format!("0x{}", format!("{byte:02x}").repeat(20))).unwrap()
    }

    struct Fixture {
        ledger: Arc<SimulatedLedger>,
        backend: Arc<InMemoryBackendStore>,
        notifier: Notifier,
        metrics: MetricsRegistry,
        sync: Arc<StateSynchronizer>,
        address: Address,
    }

    fn fixture(terms: &Terms) -> Fixture {
        let ledger = Arc::new(SimulatedLedger::new());
        let parties = Parties {
            kind: AgreementKind::Loan,
            creditor: principal(1),
            debtor: principal(2),
        };
        let address = ledger.deploy(&parties, terms).unwrap();
        ledger.credit(&principal(1), "100".parse().unwrap());
        ledger.credit(&principal(2), "100".parse().unwrap());
        let backend = Arc::new(InMemoryBackendStore::new());
        let notifier = Notifier::new(64);
        let metrics = MetricsRegistry::new().unwrap();
        let config = SyncConfig {
            retry: RetryPolicy::fixed(5, Duration::from_millis(100)),
            backend_timeout: Duration::from_secs(1),
            ..SyncConfig::default()
        };
        let sync = Arc::new(StateSynchronizer::new(
            LedgerGateway::new(ledger.clone(), &LedgerConfig::default()),
            backend.clone(),
            notifier.clone(),
            metrics.sync_metrics().clone(),
            &config,
        ));
        Fixture {
            ledger,
            backend,
            notifier,
            metrics,
            sync,
            address,
        }
    }

    fn simple_terms() -> Terms {
        Terms::loan("3".parse().unwrap(), Rate::default(), 3, 1)
    }

    async fn submit(f: &Fixture, op: Operation, caller: u8, value: &str) {
        f.ledger
            .submit(
                f.address.as_str(),
                op,
                RawCallArgs {
                    caller: principal(caller).to_string(),
                    value: value.parse::<Amount>().unwrap().base_units(),
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_first_observation_creates_record() {
        let f = fixture(&simple_terms());
        let outcome = f.sync.reconcile(&f.address).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Synchronized { writes: 1 });
        assert_eq!(f.backend.writes(), vec![BackendWrite::Create(f.address.clone())]);

        let view = f.sync.snapshot(&f.address).unwrap();
        assert_eq!(view.agreement.status, AgreementStatus::Initialized);
        assert!(view.is_synchronized());
        assert!(view.record.backend_acked);
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let f = fixture(&simple_terms());
        f.sync.reconcile(&f.address).await.unwrap();
        let writes = f.backend.write_count();
        assert_eq!(
            f.sync.reconcile(&f.address).await.unwrap(),
            ReconcileOutcome::Unchanged
        );
        assert_eq!(
            f.sync.reconcile(&f.address).await.unwrap(),
            ReconcileOutcome::Unchanged
        );
        assert_eq!(f.backend.write_count(), writes);
    }

    #[tokio::test]
    async fn test_payments_then_status() {
        let f = fixture(&simple_terms());
        f.sync.reconcile(&f.address).await.unwrap();
        submit(&f, Operation::Fund, 1, "3").await;
        submit(&f, Operation::Activate, 2, "0").await;
        submit(&f, Operation::Repay, 2, "1").await;
        submit(&f, Operation::Repay, 2, "1").await;

        let outcome = f.sync.reconcile(&f.address).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Synchronized { writes: 3 });
        let writes = f.backend.writes();
        assert!(matches!(&writes[1], BackendWrite::Payment { payment, .. } if payment.period == 1));
        assert!(matches!(&writes[2], BackendWrite::Payment { payment, .. } if payment.period == 2));
        assert!(matches!(
            &writes[3],
            BackendWrite::Status { update, .. }
                if update.status == AgreementStatus::Settling && update.period == 2
        ));
        let record = f.backend.agreement(&f.address).unwrap();
        assert_eq!(record.period, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_retried_until_success() {
        let f = fixture(&simple_terms());
        f.sync.reconcile(&f.address).await.unwrap();
        submit(&f, Operation::Fund, 1, "3").await;

        f.backend
            .fail_next(3, &BackendWriteError::Transient("503".to_string()));
        let outcome = f.sync.reconcile(&f.address).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Synchronized { writes: 1 });

        let view = f.sync.snapshot(&f.address).unwrap();
        assert!(view.record.backend_acked);
        assert_eq!(view.record.pending_retry_count, 0);
        assert_eq!(
            f.backend
                .writes()
                .iter()
                .filter(|w| matches!(w, BackendWrite::Status { .. }))
                .count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_degrade_and_tick_recovers() {
        let f = fixture(&simple_terms());
        let mut notifications = f.notifier.subscribe();
        f.sync.reconcile(&f.address).await.unwrap();
        submit(&f, Operation::Fund, 1, "3").await;

        f.backend
            .fail_always(BackendWriteError::Transient("503".to_string()));
        let outcome = f.sync.reconcile(&f.address).await.unwrap();
        assert!(matches!(
            outcome,
            ReconcileOutcome::Degraded { attempts: 5, .. }
        ));
        let view = f.sync.snapshot(&f.address).unwrap();
        assert!(!view.record.backend_acked);
        assert!(view.record.needs_reconciliation);
        assert!(!view.is_synchronized());
        assert_eq!(f.metrics.sync_metrics().sync_degraded_count(), 1.0);

        let mut saw_degraded = false;
        while let Ok(n) = notifications.try_recv() {
            saw_degraded |= matches!(n, Notification::SyncDegraded { attempts: 5, .. });
        }
        assert!(saw_degraded);

        // Plain reconciles never retry a flagged write.
        assert_eq!(
            f.sync.reconcile(&f.address).await.unwrap(),
            ReconcileOutcome::Unchanged
        );

        f.backend.clear_failures();
        let outcome = f.sync.poll_tick(&f.address).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Synchronized { writes: 1 });
        let view = f.sync.snapshot(&f.address).unwrap();
        assert!(view.is_synchronized());
        assert!(!view.record.needs_reconciliation);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_count_stays_bounded_while_backend_is_down() {
        let f = fixture(&simple_terms());
        f.sync.reconcile(&f.address).await.unwrap();
        submit(&f, Operation::Fund, 1, "3").await;

        f.backend
            .fail_always(BackendWriteError::Transient("503".to_string()));
        f.sync.reconcile(&f.address).await.unwrap();
        let view = f.sync.snapshot(&f.address).unwrap();
        assert_eq!(view.record.pending_retry_count, 5);

        for _ in 0..20 {
            let outcome = f.sync.poll_tick(&f.address).await.unwrap();
            assert!(matches!(
                outcome,
                ReconcileOutcome::Degraded { attempts: 1, .. }
            ));
        }
        let view = f.sync.snapshot(&f.address).unwrap();
        assert_eq!(view.record.pending_retry_count, 5);
        assert!(view.record.needs_reconciliation);
        // Background failures are not announced again.
        assert_eq!(f.metrics.sync_metrics().sync_degraded_count(), 1.0);
    }

    #[tokio::test]
    async fn test_permanent_error_stops_immediately() {
        let f = fixture(&simple_terms());
        f.backend
            .fail_always(BackendWriteError::Permanent("400".to_string()));
        let outcome = f.sync.reconcile(&f.address).await.unwrap();
        assert!(matches!(
            outcome,
            ReconcileOutcome::Degraded { attempts: 1, .. }
        ));
        assert_eq!(f.backend.attempt_count(), 1);
    }

    #[tokio::test]
    async fn test_late_regressive_event_is_rejected() {
        let f = fixture(&simple_terms());
        submit(&f, Operation::Fund, 1, "3").await;
        f.sync.reconcile(&f.address).await.unwrap();

        let receipt = f.ledger.inject_event(
            &f.address,
            EVENT_STATUS_CHANGED,
            json!({"from": 1, "to": 0}),
        );
        let event = ListenerEvent {
            address: f.address.clone(),
            event: LedgerEvent::StatusChanged {
                from: AgreementStatus::Ready,
                to: AgreementStatus::Initialized,
            },
            tx_ref: receipt.tx_ref,
            log_index: 0,
            block_number: receipt.block_number,
        };
        let err = f.sync.handle_event(&event).await.unwrap_err();
        assert_eq!(
            err,
            SyncError::Invariant(InvariantViolation::StatusRegression {
                from: AgreementStatus::Ready,
                to: AgreementStatus::Initialized,
            })
        );
        let view = f.sync.snapshot(&f.address).unwrap();
        assert_eq!(view.record.last_observed_status, Some(AgreementStatus::Ready));
        assert_eq!(
            f.metrics
                .sync_metrics()
                .invariant_violation_count("status_regression"),
            1.0
        );
    }

    #[tokio::test]
    async fn test_event_from_older_block_is_reported_and_discarded() {
        let f = fixture(&simple_terms());
        let initial = f.sync.ensure_view(&f.address).await.unwrap();
        submit(&f, Operation::Fund, 1, "3").await;
        f.sync.reconcile(&f.address).await.unwrap();
        let observed_block = f.sync.snapshot(&f.address).unwrap().observed_block;
        assert!(initial.observed_block < observed_block);

        // Delivered late: carries the block of the deployment.
        let event = ListenerEvent {
            address: f.address.clone(),
            event: LedgerEvent::StatusChanged {
                from: AgreementStatus::Ready,
                to: AgreementStatus::Initialized,
            },
            tx_ref: "0xdeadbeef".to_string(),
            log_index: 0,
            block_number: initial.observed_block,
        };
        let writes = f.backend.write_count();
        let err = f.sync.handle_event(&event).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Invariant(InvariantViolation::StatusRegression { .. })
        ));
        assert_eq!(
            f.metrics
                .sync_metrics()
                .invariant_violation_count("status_regression"),
            1.0
        );
        let view = f.sync.snapshot(&f.address).unwrap();
        assert_eq!(view.record.last_observed_status, Some(AgreementStatus::Ready));
        assert_eq!(view.observed_block, observed_block);
        assert_eq!(f.backend.write_count(), writes);
    }

    #[tokio::test]
    async fn test_current_view_retries_after_failed_first_pass() {
        let f = fixture(&simple_terms());
        f.ledger.fail_next_reads(1);
        assert!(f.sync.current_view(&f.address).is_none());

        let mut view = None;
        for _ in 0..100 {
            view = f.sync.current_view(&f.address);
            if view.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let view = view.expect("view after a retried first pass");
        assert_eq!(view.agreement.status, AgreementStatus::Initialized);
        assert_eq!(f.metrics.sync_metrics().reconcile_count("failed"), 1.0);
    }

    #[tokio::test]
    async fn test_schedule_mismatch_is_hard_error() {
        let f = fixture(&simple_terms());
        f.ledger.tamper_installment(&f.address, 1);
        let err = f.sync.reconcile(&f.address).await.unwrap_err();
        assert!(matches!(err, SyncError::Mismatch(_)));
        assert!(f.sync.snapshot(&f.address).is_none());
        assert_eq!(f.backend.write_count(), 0);
    }

    #[tokio::test]
    async fn test_payment_due_follows_schedule() {
        let f = fixture(&simple_terms());
        let mut notifications = f.notifier.subscribe();
        submit(&f, Operation::Fund, 1, "3").await;
        submit(&f, Operation::Activate, 2, "0").await;
        f.sync.reconcile(&f.address).await.unwrap();
        submit(&f, Operation::Skip, 2, "0").await;
        f.sync.reconcile(&f.address).await.unwrap();

        let dues: Vec<Installment> = std::iter::from_fn(|| notifications.try_recv().ok())
            .filter_map(|n| match n {
                Notification::PaymentDue { installment, .. } => Some(installment),
                _ => None,
            })
            .collect();
        assert_eq!(dues.len(), 2);
        assert_eq!(dues[0].sequence_number, 1);
        assert_eq!(dues[1].sequence_number, 1);
        assert!(dues[1].due_at > dues[0].due_at);
    }

    #[tokio::test]
    async fn test_current_view_spawns_first_pass() {
        let f = fixture(&simple_terms());
        assert!(f.sync.current_view(&f.address).is_none());
        for _ in 0..100 {
            if f.sync.current_view(&f.address).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let view = f.sync.current_view(&f.address).unwrap();
        assert_eq!(view.agreement.status, AgreementStatus::Initialized);

        f.sync.set_pending(&f.address, Some(Operation::Fund));
        assert_eq!(
            f.sync.current_view(&f.address).unwrap().pending,
            Some(Operation::Fund)
        );
    }

    #[tokio::test]
    async fn test_settlement_ref_reaches_backend() {
        let f = fixture(&simple_terms());
        f.sync.reconcile(&f.address).await.unwrap();
        submit(&f, Operation::Fund, 1, "3").await;
        submit(&f, Operation::Activate, 2, "0").await;
        submit(&f, Operation::Repay, 2, "1").await;
        f.sync
            .note_settlement(&f.address, 1, "0xfeed".to_string())
            .await;
        f.sync.reconcile(&f.address).await.unwrap();
        let payments = f.backend.payments(&f.address);
        assert_eq!(payments[0].tx_ref.as_deref(), Some("0xfeed"));
        let view = f.sync.snapshot(&f.address).unwrap();
        assert_eq!(
            view.schedule.installments()[0].settling_tx_ref.as_deref(),
            Some("0xfeed")
        );
    }

    #[tokio::test]
    async fn test_record_restored_from_cursor_store() {
        let f = fixture(&simple_terms());
        let store = CursorStore::open_in_memory().unwrap();
        let mut record = SyncRecord::new();
        record.last_observed_status = Some(AgreementStatus::Initialized);
        record.backend_acked = true;
        store.save_record(&f.address, &record).unwrap();

        let sync = StateSynchronizer::new(
            LedgerGateway::new(f.ledger.clone(), &LedgerConfig::default()),
            f.backend.clone(),
            Notifier::default(),
            f.metrics.sync_metrics().clone(),
            &SyncConfig::default(),
        )
        .with_cursor_store(store);
        assert_eq!(
            sync.reconcile(&f.address).await.unwrap(),
            ReconcileOutcome::Unchanged
        );
        assert_eq!(f.backend.write_count(), 0);
    }
}
