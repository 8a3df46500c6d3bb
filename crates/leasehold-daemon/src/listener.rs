//! Event Listener.
//!
//! Keeps exactly one ledger subscription per observed address. Observers
//! share it through [`EventListener::open`] / [`EventListener::close`]
//! reference counting; the last close cancels the subscription task.
//!
//! Each task decodes raw events into [`LedgerEvent`]s, drops redeliveries
//! by `(tx_ref, log_index)` and forwards the rest onto the shared sink. When
//! the stream drops, the task reconnects with backoff and asks for events
//! from the last processed block again. Re-requesting that block is safe
//! because of de-duplication.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use leasehold_core::agreement::{Address, AgreementStatus};
use leasehold_core::amount::Amount;
use leasehold_core::config::ListenerConfig;
use leasehold_core::retry::jittered;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cursor_store::CursorStore;
use crate::ledger::{
    EVENT_COLLATERAL_MOVED, EVENT_PAYMENT_SETTLED, EVENT_PERIOD_SKIPPED, EVENT_STATUS_CHANGED,
    LedgerGateway, LedgerReadError, RawEvent,
};
use crate::metrics::SyncMetrics;

// =============================================================================
// Domain Events
// =============================================================================

/// A decoded ledger event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    /// The contract changed status.
    StatusChanged {
        /// Previous status.
        from: AgreementStatus,
        /// New status.
        to: AgreementStatus,
    },
    /// An installment was settled.
    PaymentSettled {
        /// Settled period.
        period: u32,
        /// Amount paid.
        amount: Amount,
        /// Settling transaction.
        tx_ref: String,
    },
    /// Collateral entered or left the contract.
    CollateralMoved {
        /// Amount moved.
        amount: Amount,
    },
    /// A grace period was consumed.
    GraceConsumed {
        /// Grace periods used so far.
        grace_used: u32,
    },
}

/// A decoded event with its ledger coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerEvent {
    /// Emitting agreement.
    pub address: Address,
    /// Decoded payload.
    pub event: LedgerEvent,
    /// Emitting transaction.
    pub tx_ref: String,
    /// Position within the transaction.
    pub log_index: u32,
    /// Confirmation block.
    pub block_number: u64,
}

/// Decodes `raw`. `Ok(None)` means the event name is not one we track.
///
/// # Errors
///
/// Returns a description of the malformed payload.
pub fn decode_event(raw: &RawEvent) -> Result<Option<LedgerEvent>, String> {
    let payload = &raw.payload;
    let event = match raw.name.as_str() {
        EVENT_STATUS_CHANGED => LedgerEvent::StatusChanged {
            from: status_field(payload, "from")?,
            to: status_field(payload, "to")?,
        },
        EVENT_PAYMENT_SETTLED => LedgerEvent::PaymentSettled {
            period: u32_field(payload, "period")?,
            amount: amount_field(payload, "amount")?,
            tx_ref: raw.tx_ref.clone(),
        },
        EVENT_COLLATERAL_MOVED => LedgerEvent::CollateralMoved {
            amount: amount_field(payload, "amount")?,
        },
        EVENT_PERIOD_SKIPPED => LedgerEvent::GraceConsumed {
            grace_used: u32_field(payload, "grace_used")?,
        },
        _ => return Ok(None),
    };
    Ok(Some(event))
}

fn u32_field(payload: &serde_json::Value, key: &str) -> Result<u32, String> {
    payload
        .get(key)
        .and_then(serde_json::Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| format!("missing or invalid `{key}`"))
}

fn status_field(payload: &serde_json::Value, key: &str) -> Result<AgreementStatus, String> {
    let code = payload
        .get(key)
        .and_then(serde_json::Value::as_u64)
        .and_then(|v| u8::try_from(v).ok())
        .ok_or_else(|| format!("missing or invalid `{key}`"))?;
    AgreementStatus::from_ledger_code(code).ok_or_else(|| format!("unknown status code {code}"))
}

fn amount_field(payload: &serde_json::Value, key: &str) -> Result<Amount, String> {
    let units = payload
        .get(key)
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| format!("missing `{key}`"))?
        .parse::<u128>()
        .map_err(|e| format!("invalid `{key}`: {e}"))?;
    Ok(Amount::from_base_units(units))
}

// =============================================================================
// De-duplication
// =============================================================================

/// Bounded memory of recently seen event identities.
#[derive(Debug)]
pub struct DedupeWindow {
    capacity: usize,
    order: VecDeque<(String, u32)>,
    seen: HashSet<(String, u32)>,
}

impl DedupeWindow {
    /// Creates a window remembering up to `capacity` identities.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// Records `(tx_ref, log_index)`; returns `false` if it was already seen.
    pub fn insert(&mut self, tx_ref: &str, log_index: u32) -> bool {
        let key = (tx_ref.to_string(), log_index);
        if self.seen.contains(&key) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(key.clone());
        self.seen.insert(key);
        true
    }

    /// Number of remembered identities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns `true` when nothing is remembered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

// =============================================================================
// EventListener
// =============================================================================

struct Registration {
    refcount: usize,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Everything a subscription task needs.
#[derive(Clone)]
struct StreamContext {
    gateway: LedgerGateway,
    config: ListenerConfig,
    sink: mpsc::Sender<ListenerEvent>,
    cursor_store: Option<CursorStore>,
    metrics: Option<SyncMetrics>,
}

/// Reference-counted registry of per-address subscription tasks.
pub struct EventListener {
    context: StreamContext,
    registrations: Mutex<HashMap<Address, Registration>>,
}

impl std::fmt::Debug for EventListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventListener")
            .field("open", &self.lock().len())
            .finish_non_exhaustive()
    }
}

impl EventListener {
    /// Creates a listener forwarding decoded events to `sink`.
    #[must_use]
    pub fn new(
        gateway: LedgerGateway,
        config: ListenerConfig,
        sink: mpsc::Sender<ListenerEvent>,
    ) -> Self {
        Self {
            context: StreamContext {
                gateway,
                config,
                sink,
                cursor_store: None,
                metrics: None,
            },
            registrations: Mutex::new(HashMap::new()),
        }
    }

    /// Persists processed-block watermarks to `store`.
    #[must_use]
    pub fn with_cursor_store(mut self, store: CursorStore) -> Self {
        self.context.cursor_store = Some(store);
        self
    }

    /// Records event dispositions and reconnects in `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: SyncMetrics) -> Self {
        self.context.metrics = Some(metrics);
        self
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Address, Registration>> {
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds an observer of `address`, starting the subscription from
    /// `from_block` if none is running. Returns `true` when a new
    /// subscription task was started.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(&self, address: &Address, from_block: u64) -> bool {
        let mut registrations = self.lock();
        if let Some(registration) = registrations.get_mut(address) {
            if !registration.handle.is_finished() {
                registration.refcount += 1;
                debug!(address = %address, refcount = registration.refcount, "listener shared");
                return false;
            }
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_stream(
            self.context.clone(),
            address.clone(),
            from_block,
            cancel.clone(),
        ));
        let refcount = registrations
            .remove(address)
            .map_or(0, |stale| stale.refcount);
        registrations.insert(
            address.clone(),
            Registration {
                refcount: refcount + 1,
                cancel,
                handle,
            },
        );
        info!(address = %address, from_block, "listener opened");
        true
    }

    /// Removes an observer of `address`. Returns `true` when it was the last
    /// one and the subscription was cancelled.
    pub fn close(&self, address: &Address) -> bool {
        let mut registrations = self.lock();
        let Some(registration) = registrations.get_mut(address) else {
            return false;
        };
        registration.refcount = registration.refcount.saturating_sub(1);
        if registration.refcount > 0 {
            return false;
        }
        if let Some(registration) = registrations.remove(address) {
            registration.cancel.cancel();
        }
        info!(address = %address, "listener closed");
        true
    }

    /// Number of observers of `address`.
    #[must_use]
    pub fn refcount(&self, address: &Address) -> usize {
        self.lock().get(address).map_or(0, |r| r.refcount)
    }

    /// Returns `true` while a subscription task for `address` is running.
    #[must_use]
    pub fn is_open(&self, address: &Address) -> bool {
        self.lock()
            .get(address)
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Cancels every subscription and waits for the tasks to exit.
    pub async fn shutdown(&self) {
        let registrations: Vec<(Address, Registration)> = self.lock().drain().collect();
        for (address, registration) in registrations {
            registration.cancel.cancel();
            if let Err(e) = registration.handle.await {
                warn!(address = %address, error = %e, "listener task ended abnormally");
            }
        }
    }
}

/// Why a stream loop returned.
enum StreamEnd {
    Disconnected { received: bool },
    Cancelled,
    SinkClosed,
}

async fn run_stream(
    ctx: StreamContext,
    address: Address,
    from_block: u64,
    cancel: CancellationToken,
) {
    let mut dedupe = DedupeWindow::new(ctx.config.dedupe_window);
    let mut next_block = from_block;
    let mut failures: u32 = 0;

    loop {
        let opened = tokio::select! {
            () = cancel.cancelled() => return,
            result = ctx.gateway.subscribe(&address, next_block) => result,
        };
        match opened {
            Ok(mut subscription) => {
                if failures > 0 {
                    info!(address = %address, from_block = next_block, "event stream reconnected");
                }
                match ctx
                    .pump(&mut subscription, &mut dedupe, &mut next_block, &cancel)
                    .await
                {
                    StreamEnd::Cancelled => {
                        subscription.cancel();
                        return;
                    },
                    StreamEnd::SinkClosed => {
                        debug!(address = %address, "event sink closed, stopping listener");
                        return;
                    },
                    StreamEnd::Disconnected { received } => {
                        if received {
                            failures = 0;
                        }
                        warn!(address = %address, resume_block = next_block, "event stream disconnected");
                    },
                }
            },
            Err(LedgerReadError::NotFound(_)) => {
                error!(address = %address, "no agreement at address, listener stopped");
                return;
            },
            Err(e) => {
                warn!(address = %address, error = %e, "event stream could not be opened");
            },
        }

        failures = failures.saturating_add(1);
        let delay = jittered(
            ctx.config.reconnect.delay_for_attempt(failures),
            ctx.config.reconnect_jitter,
        );
        debug!(address = %address, attempt = failures, ?delay, "reconnecting event stream");
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(delay) => {},
        }
        if let Some(metrics) = &ctx.metrics {
            metrics.listener_reconnected();
        }
    }
}

impl StreamContext {
    fn record(&self, disposition: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.listener_event(disposition);
        }
    }

    async fn pump(
        &self,
        subscription: &mut crate::ledger::EventSubscription,
        dedupe: &mut DedupeWindow,
        next_block: &mut u64,
        cancel: &CancellationToken,
    ) -> StreamEnd {
        let address = subscription.address().clone();
        let mut received = false;
        loop {
            let raw = tokio::select! {
                () = cancel.cancelled() => return StreamEnd::Cancelled,
                raw = subscription.next() => raw,
            };
            let Some(raw) = raw else {
                return StreamEnd::Disconnected { received };
            };
            received = true;

            if dedupe.insert(&raw.tx_ref, raw.log_index) {
                match decode_event(&raw) {
                    Ok(Some(event)) => {
                        let forwarded = ListenerEvent {
                            address: address.clone(),
                            event,
                            tx_ref: raw.tx_ref.clone(),
                            log_index: raw.log_index,
                            block_number: raw.block_number,
                        };
                        if self.sink.send(forwarded).await.is_err() {
                            return StreamEnd::SinkClosed;
                        }
                        self.record("forwarded");
                    },
                    Ok(None) => {
                        debug!(address = %address, name = %raw.name, "unknown event skipped");
                        self.record("unknown");
                    },
                    Err(reason) => {
                        warn!(address = %address, name = %raw.name, tx_ref = %raw.tx_ref, reason = %reason, "undecodable event skipped");
                        self.record("undecodable");
                    },
                }
            } else {
                debug!(address = %address, tx_ref = %raw.tx_ref, log_index = raw.log_index, "duplicate event dropped");
                self.record("duplicate");
            }

            if raw.block_number > *next_block {
                *next_block = raw.block_number;
                self.persist_watermark(&address, raw.block_number).await;
            }
        }
    }

    async fn persist_watermark(&self, address: &Address, block: u64) {
        let Some(store) = &self.cursor_store else {
            return;
        };
        let target = address.clone();
        if let Err(e) = store
            .run_blocking(move |s| s.save_watermark(&target, block))
            .await
        {
            warn!(address = %address, block, error = %e, "failed to persist watermark");
        }
    }
}
