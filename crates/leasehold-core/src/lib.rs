#![allow(clippy::doc_markdown)]
#![allow(clippy::too_long_first_doc_paragraph)]

//! leasehold-core - domain model for ledger-backed agreements
//!
//! This crate holds everything about loan and rental agreements that can be
//! decided without I/O: fixed-point amounts, the status machine, the
//! installment schedule, the per-agreement reconciliation cursor, the retry
//! primitive and the engine configuration. The `leasehold-daemon` crate wires
//! these into the ledger, the backend mirror and the async runtime.
//!
//! # Modules
//!
//! - [`amount`]: ledger fixed-point [`Amount`] and basis-point [`Rate`]
//! - [`agreement`]: addresses, parties and roles, terms, [`AgreementStatus`]
//! - [`schedule`]: Schedule Calculator and rental economics
//! - [`sync_record`]: [`SyncRecord`] monotonic observation tracking
//! - [`retry`]: bounded retry with backoff and jitter
//! - [`config`]: TOML engine configuration

pub mod agreement;
pub mod amount;
pub mod config;
pub mod retry;
pub mod schedule;
pub mod sync_record;

pub use agreement::{
    Address, Agreement, AgreementKind, AgreementStatus, Parties, Role, Side, StatusTransition,
    Terms,
};
pub use amount::{Amount, AmountError, Rate};
pub use config::{ConfigError, EngineConfig};
pub use retry::{BackoffConfig, RetryError, RetryPolicy, Retryable, retry_with_backoff};
pub use schedule::{
    Installment, PortfolioSummary, Schedule, ScheduleError, ScheduleMismatch, compute_schedule,
};
pub use sync_record::{InvariantViolation, Observation, ObservationOutcome, SyncRecord};
