//! End-to-end acceptance runs through [`SyncEngine`] on the simulated
//! ledger: schedule figures, rejected regressions, backend retry and
//! degradation, idempotent reconciliation.

#![allow(clippy::float_cmp)]

use std::sync::Arc;
use std::time::Duration;

use leasehold_core::agreement::{Address, AgreementKind, AgreementStatus, Parties, Terms};
use leasehold_core::amount::{Amount, Rate};
use leasehold_core::config::EngineConfig;
use leasehold_core::retry::RetryPolicy;
use leasehold_daemon::backend::BackendWriteError;
use leasehold_daemon::backend::memory::{BackendWrite, InMemoryBackendStore};
use leasehold_daemon::ledger::EVENT_STATUS_CHANGED;
use leasehold_daemon::ledger::simulated::SimulatedLedger;
use leasehold_daemon::{Notification, ReconcileOutcome, SyncEngine};
use serde_json::json;
use tokio::sync::broadcast;

fn principal(byte: u8) -> Address {
    Address::parse(&format!("0x{}", format!("{byte:02x}").repeat(20))).unwrap()
}

fn amount(s: &str) -> Amount {
    s.parse().unwrap()
}

struct Harness {
    ledger: Arc<SimulatedLedger>,
    backend: Arc<InMemoryBackendStore>,
    engine: SyncEngine,
    address: Address,
    lender: Address,
    borrower: Address,
}

fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.sync.retry = RetryPolicy::fixed(5, Duration::from_millis(10));
    config
}

fn harness(config: EngineConfig, terms: &Terms) -> Harness {
    let ledger = Arc::new(SimulatedLedger::new());
    let lender = principal(0x11);
    let borrower = principal(0x22);
    let address = ledger
        .deploy(
            &Parties {
                kind: AgreementKind::Loan,
                creditor: lender.clone(),
                debtor: borrower.clone(),
            },
            terms,
        )
        .unwrap();
    ledger.credit(&lender, amount("10"));
    ledger.credit(&borrower, amount("1"));
    let backend = Arc::new(InMemoryBackendStore::new());
    let engine = SyncEngine::start(config, ledger.clone(), backend.clone()).unwrap();
    Harness {
        ledger,
        backend,
        engine,
        address,
        lender,
        borrower,
    }
}

fn loan_terms() -> Terms {
    Terms::loan(amount("2.5"), Rate::from_bps(550).unwrap(), 12, 1)
}

async fn wait_for(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

fn drain(receiver: &mut broadcast::Receiver<Notification>) -> Vec<Notification> {
    std::iter::from_fn(|| receiver.try_recv().ok()).collect()
}

#[tokio::test]
async fn schedule_matches_ledger_arithmetic() {
    let h = harness(config(), &loan_terms());
    let view = h.engine.observe(&h.address).await.unwrap();

    assert_eq!(view.schedule.total(), amount("2.6375"));
    let installments = view.schedule.installments();
    assert_eq!(installments.len(), 12);
    for installment in &installments[..11] {
        assert_eq!(installment.due_amount, amount("0.219791666666666666"));
    }
    assert_eq!(installments[11].due_amount, amount("0.219791666666666674"));
    assert!(installments.iter().all(|i| i.due_at.is_none()));
    h.engine.shutdown().await;
}

#[tokio::test]
async fn late_regressive_event_is_discarded() {
    let h = harness(config(), &loan_terms());
    h.engine.observe(&h.address).await.unwrap();
    wait_for(|| h.ledger.subscriber_count(&h.address) == 1).await;
    h.engine
        .orchestrator()
        .fund(&h.address, &h.lender)
        .await
        .unwrap();

    h.ledger
        .inject_event(&h.address, EVENT_STATUS_CHANGED, json!({"from": 1, "to": 0}));

    let metrics = h.engine.metrics().sync_metrics().clone();
    wait_for(|| metrics.invariant_violation_count("status_regression") == 1.0).await;
    let view = h.engine.current_view(&h.address).unwrap();
    assert_eq!(view.agreement.status, AgreementStatus::Ready);
    assert_eq!(view.record.last_observed_status, Some(AgreementStatus::Ready));
    h.engine.shutdown().await;
}

#[tokio::test]
async fn backend_recovers_on_fourth_attempt() {
    let h = harness(config(), &loan_terms());
    h.engine.observe(&h.address).await.unwrap();

    h.backend
        .fail_next(3, &BackendWriteError::Transient("503 Service Unavailable".to_string()));
    let report = h
        .engine
        .orchestrator()
        .fund(&h.address, &h.lender)
        .await
        .unwrap();
    assert!(report.outcome.success);
    assert!(report.is_fully_synchronized());

    let view = h.engine.current_view(&h.address).unwrap();
    assert!(view.record.backend_acked);
    assert_eq!(view.record.pending_retry_count, 0);
    assert!(view.is_synchronized());

    let status_writes: Vec<BackendWrite> = h
        .backend
        .writes()
        .into_iter()
        .filter(|w| matches!(w, BackendWrite::Status { .. }))
        .collect();
    assert_eq!(status_writes.len(), 1);
    assert_eq!(
        h.engine
            .metrics()
            .sync_metrics()
            .backend_write_attempt_count("failure"),
        3.0
    );
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn repay_succeeds_while_backend_times_out() {
    let mut config = config();
    config.sync.backend_timeout = Duration::from_secs(1);
    config.sync.retry = RetryPolicy::fixed(2, Duration::from_millis(100));
    let h = harness(config, &loan_terms().with_collateral(amount("0.5")));
    h.engine.observe(&h.address).await.unwrap();
    let orchestrator = h.engine.orchestrator();
    orchestrator.fund(&h.address, &h.lender).await.unwrap();
    orchestrator.activate(&h.address, &h.borrower).await.unwrap();

    let mut notifications = h.engine.subscribe();
    h.backend.set_latency(Some(Duration::from_secs(5)));
    let report = orchestrator.repay(&h.address, &h.borrower).await.unwrap();

    assert!(report.outcome.success);
    assert!(report.outcome.tx_ref.is_some());
    assert!(report.sync_warning.is_some());
    let view = report.view.unwrap();
    assert_eq!(view.agreement.last_settled_period, 1);
    assert!(!view.is_synchronized());
    assert!(view.record.needs_reconciliation);

    let degraded = drain(&mut notifications)
        .into_iter()
        .filter(|n| matches!(n, Notification::SyncDegraded { .. }))
        .count();
    assert_eq!(degraded, 1);
    assert!(h.backend.payments(&h.address).is_empty());

    // Once the backend responds again a poll tick catches up.
    h.backend.set_latency(None);
    let outcome = h
        .engine
        .synchronizer()
        .poll_tick(&h.address)
        .await
        .unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Synchronized { .. }));
    assert_eq!(h.backend.payments(&h.address).len(), 1);
    h.engine.shutdown().await;
}

#[tokio::test]
async fn repeated_reconciliation_writes_nothing() {
    let h = harness(config(), &loan_terms());
    h.engine.observe(&h.address).await.unwrap();
    h.engine
        .orchestrator()
        .fund(&h.address, &h.lender)
        .await
        .unwrap();
    let writes = h.backend.write_count();

    let synchronizer = h.engine.synchronizer();
    for _ in 0..3 {
        assert_eq!(
            synchronizer.reconcile(&h.address).await.unwrap(),
            ReconcileOutcome::Unchanged
        );
    }
    assert_eq!(h.backend.write_count(), writes);
    h.engine.shutdown().await;
}

#[tokio::test]
async fn operations_on_completed_loan_are_refused() {
    let terms = Terms::loan(amount("1"), Rate::default(), 1, 0);
    let h = harness(config(), &terms);
    h.engine.observe(&h.address).await.unwrap();
    let orchestrator = h.engine.orchestrator();
    orchestrator.fund(&h.address, &h.lender).await.unwrap();
    orchestrator.activate(&h.address, &h.borrower).await.unwrap();
    let report = orchestrator.repay(&h.address, &h.borrower).await.unwrap();
    let view = report.view.unwrap();
    assert_eq!(view.agreement.status, AgreementStatus::Completed);
    assert!(view.next_due.is_none());
    assert_eq!(view.progress, rust_decimal::Decimal::ONE_HUNDRED);

    assert!(orchestrator.repay(&h.address, &h.borrower).await.is_err());
    h.engine.shutdown().await;
}
