//! Notifications for presentation layers.
//!
//! The [`Notifier`] fans notifications out over a `tokio::sync::broadcast`
//! channel. Sending never blocks: with no subscribers a notification is
//! dropped, and a subscriber that lags loses the oldest entries.

use leasehold_core::agreement::{Address, AgreementStatus};
use leasehold_core::schedule::Installment;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::ledger::{Operation, TransactionOutcome};

/// Default broadcast buffer.
pub const DEFAULT_NOTIFIER_CAPACITY: usize = 1024;

/// Something a user of an agreement should hear about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    /// The ledger-confirmed status changed.
    StatusChanged {
        /// Agreement address.
        address: Address,
        /// Previous status, `None` on first observation.
        from: Option<AgreementStatus>,
        /// New status.
        to: AgreementStatus,
    },

    /// A new installment became the one currently due.
    PaymentDue {
        /// Agreement address.
        address: Address,
        /// The installment now due.
        installment: Installment,
    },

    /// The backend mirror could not be updated and is stale.
    SyncDegraded {
        /// Agreement address.
        address: Address,
        /// Last backend error.
        reason: String,
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// A state-changing operation failed on the ledger.
    OperationFailed {
        /// Agreement address.
        address: Address,
        /// Failed operation.
        operation: Operation,
        /// Outcome carrying the failure reason.
        outcome: TransactionOutcome,
        /// Whether resubmitting may succeed.
        retryable: bool,
    },
}

impl Notification {
    /// The agreement the notification concerns.
    #[must_use]
    pub const fn address(&self) -> &Address {
        match self {
            Self::StatusChanged { address, .. }
            | Self::PaymentDue { address, .. }
            | Self::SyncDegraded { address, .. }
            | Self::OperationFailed { address, .. } => address,
        }
    }

    /// Short label for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::StatusChanged { .. } => "status_changed",
            Self::PaymentDue { .. } => "payment_due",
            Self::SyncDegraded { .. } => "sync_degraded",
            Self::OperationFailed { .. } => "operation_failed",
        }
    }
}

/// Broadcasts [`Notification`]s.
#[derive(Debug, Clone)]
pub struct Notifier {
    sender: broadcast::Sender<Notification>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(DEFAULT_NOTIFIER_CAPACITY)
    }
}

impl Notifier {
    /// Creates a notifier buffering up to `capacity` entries per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribes to notifications sent from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }

    /// Sends `notification`, returning how many subscribers received it.
    pub fn notify(&self, notification: Notification) -> usize {
        trace!(
            address = %notification.address(),
            kind = notification.kind(),
            "notification"
        );
        self.sender.send(notification).unwrap_or(0)
    }
}
