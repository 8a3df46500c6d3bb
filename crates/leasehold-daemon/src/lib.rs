#![allow(clippy::doc_markdown)]
#![allow(clippy::too_long_first_doc_paragraph)]

//! leasehold-daemon - agreement-state synchronization engine
//!
//! Keeps a local view of ledger-backed loan and rental agreements
//! consistent with ledger truth, mirrors that view into an external backend
//! store, and orchestrates the state-changing operations (fund, activate,
//! repay, skip) against the ledger.
//!
//! The ledger is the sole authority. Every trigger (a poll tick, a ledger
//! event, a confirmed operation) leads to a fresh read of ledger truth;
//! events only say *when* to look.
//!
//! # Runtime Requirements
//!
//! Components spawn tasks and must be created inside a Tokio runtime. The
//! binary builds a multi-threaded runtime explicitly.
//!
//! ```rust,ignore
//! let engine = SyncEngine::start(config, transport, backend)?;
//! engine.observe(&address).await?;
//! let report = engine.orchestrator().repay(&address, &borrower).await?;
//! ```
//!
//! # Modules
//!
//! - [`ledger`]: Ledger Gateway over a [`ledger::LedgerTransport`], plus the
//!   in-process [`ledger::simulated::SimulatedLedger`]
//! - [`listener`]: Event Listener with de-duplication and reconnection
//! - [`synchronizer`]: State Synchronizer and the merged agreement view
//! - [`orchestrator`]: Action Orchestrator sagas
//! - [`backend`]: Backend Store boundary, HTTP and in-memory adapters
//! - [`notifier`]: broadcast notifications
//! - [`cursor_store`]: SQLite persistence of sync records and watermarks
//! - [`metrics`]: Prometheus metrics
//! - [`engine`]: [`SyncEngine`] application root
//! - [`scenario`]: scripted runs against the simulated ledger

pub mod backend;
pub mod cursor_store;
pub mod engine;
pub mod ledger;
pub mod listener;
pub mod metrics;
pub mod notifier;
pub mod orchestrator;
pub mod scenario;
pub mod synchronizer;

pub use backend::{BackendStore, BackendWriteError};
pub use engine::{EngineError, SyncEngine};
pub use ledger::{LedgerGateway, LedgerTransport, Operation, SubmissionError, TransactionOutcome};
pub use listener::{EventListener, LedgerEvent, ListenerEvent};
pub use notifier::{Notification, Notifier};
pub use orchestrator::{ActionError, ActionOrchestrator, ActionReport};
pub use synchronizer::{AgreementView, Freshness, ReconcileOutcome, StateSynchronizer, SyncError};
