//! Application root.
//!
//! [`SyncEngine`] owns every component and the per-address observation
//! registry. Observing an address:
//!
//! - establishes the first view,
//! - opens the listener subscription from the persisted watermark (or just
//!   past the first view's block),
//! - spawns a worker that serializes poll ticks and routed ledger events
//!   into the synchronizer.
//!
//! A single dispatcher task drains the listener sink and routes each event
//! to the worker of its address.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use leasehold_core::agreement::Address;
use leasehold_core::config::EngineConfig;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::BackendStore;
use crate::cursor_store::{CursorStore, CursorStoreError};
use crate::ledger::{LedgerGateway, LedgerTransport};
use crate::listener::{EventListener, ListenerEvent};
use crate::metrics::{MetricsError, SharedMetricsRegistry, new_shared_registry};
use crate::notifier::{Notification, Notifier};
use crate::orchestrator::ActionOrchestrator;
use crate::synchronizer::{AgreementView, StateSynchronizer, SyncError};

/// Per-worker queue of routed events.
const WORKER_QUEUE: usize = 64;

/// Errors from starting the engine or observing an agreement.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// The cursor store could not be opened.
    #[error(transparent)]
    Cursor(#[from] CursorStoreError),

    /// Metrics registration failed.
    #[error(transparent)]
    Metrics(#[from] MetricsError),

    /// The first view of an agreement could not be established.
    #[error(transparent)]
    Sync(#[from] SyncError),
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

type Routes = Arc<Mutex<HashMap<Address, mpsc::Sender<ListenerEvent>>>>;

fn lock_routes(routes: &Routes) -> MutexGuard<'_, HashMap<Address, mpsc::Sender<ListenerEvent>>> {
    routes.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns the components and the set of observed agreements.
pub struct SyncEngine {
    config: EngineConfig,
    metrics: SharedMetricsRegistry,
    cursor_store: Option<CursorStore>,
    gateway: LedgerGateway,
    notifier: Notifier,
    synchronizer: Arc<StateSynchronizer>,
    orchestrator: ActionOrchestrator,
    listener: Arc<EventListener>,
    routes: Routes,
    workers: Mutex<HashMap<Address, Worker>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("observed", &self.observed())
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    /// Wires the components over `transport` and `backend`.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the cursor store cannot be opened or metrics
    /// fail to register.
    pub fn start(
        config: EngineConfig,
        transport: Arc<dyn LedgerTransport>,
        backend: Arc<dyn BackendStore>,
    ) -> Result<Self, EngineError> {
        let metrics = new_shared_registry()?;
        let cursor_store = config
            .storage
            .cursor_db
            .as_deref()
            .map(CursorStore::open)
            .transpose()?;

        let gateway = LedgerGateway::new(transport, &config.ledger);
        let notifier = Notifier::default();

        let mut synchronizer = StateSynchronizer::new(
            gateway.clone(),
            backend,
            notifier.clone(),
            metrics.sync_metrics().clone(),
            &config.sync,
        );
        if let Some(store) = &cursor_store {
            synchronizer = synchronizer.with_cursor_store(store.clone());
        }
        let synchronizer = Arc::new(synchronizer);
        let orchestrator =
            ActionOrchestrator::new(gateway.clone(), Arc::clone(&synchronizer), notifier.clone());

        let (sink, events) = mpsc::channel(config.listener.channel_capacity.max(1));
        let mut listener = EventListener::new(gateway.clone(), config.listener.clone(), sink)
            .with_metrics(metrics.sync_metrics().clone());
        if let Some(store) = &cursor_store {
            listener = listener.with_cursor_store(store.clone());
        }

        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = CancellationToken::new();
        let dispatcher = tokio::spawn(dispatch(events, Arc::clone(&routes), shutdown.clone()));

        info!(
            poll_interval = ?config.sync.poll_interval,
            max_attempts = config.sync.retry.max_attempts,
            persistent = cursor_store.is_some(),
            "sync engine started"
        );
        Ok(Self {
            config,
            metrics,
            cursor_store,
            gateway,
            notifier,
            synchronizer,
            orchestrator,
            listener: Arc::new(listener),
            routes,
            workers: Mutex::new(HashMap::new()),
            dispatcher: Mutex::new(Some(dispatcher)),
            shutdown,
        })
    }

    fn workers(&self) -> MutexGuard<'_, HashMap<Address, Worker>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    /// The operation entry point.
    #[must_use]
    pub const fn orchestrator(&self) -> &ActionOrchestrator {
        &self.orchestrator
    }

    /// The synchronizer, for view queries.
    #[must_use]
    pub const fn synchronizer(&self) -> &Arc<StateSynchronizer> {
        &self.synchronizer
    }

    /// The ledger gateway.
    #[must_use]
    pub const fn gateway(&self) -> &LedgerGateway {
        &self.gateway
    }

    /// Subscribes to notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifier.subscribe()
    }

    /// The metrics registry.
    #[must_use]
    pub const fn metrics(&self) -> &SharedMetricsRegistry {
        &self.metrics
    }

    /// The non-blocking current view of `address`.
    #[must_use]
    pub fn current_view(&self, address: &Address) -> Option<AgreementView> {
        self.synchronizer.current_view(address)
    }

    /// Observed addresses, sorted.
    #[must_use]
    pub fn observed(&self) -> Vec<Address> {
        let mut observed: Vec<Address> = self.workers().keys().cloned().collect();
        observed.sort();
        observed
    }

    /// Returns `true` while `address` is observed.
    #[must_use]
    pub fn is_observed(&self, address: &Address) -> bool {
        self.workers().contains_key(address)
    }

    // ------------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------------

    /// Starts observing `address` and returns its first view. Observing an
    /// already observed address only returns the view.
    ///
    /// # Errors
    ///
    /// Returns an error if the agreement cannot be read or is rejected.
    pub async fn observe(&self, address: &Address) -> Result<AgreementView, EngineError> {
        let view = self.synchronizer.ensure_view(address).await?;
        if self.is_observed(address) {
            return Ok(view);
        }

        let from_block = match self.watermark(address).await {
            Some(block) => block,
            None => view.observed_block.saturating_add(1),
        };

        let (route, inbox) = mpsc::channel(WORKER_QUEUE);
        let cancel = self.shutdown.child_token();
        let handle = tokio::spawn(run_worker(
            Arc::clone(&self.synchronizer),
            address.clone(),
            self.config.sync.poll_interval,
            inbox,
            cancel.clone(),
        ));

        {
            let mut workers = self.workers();
            if workers.contains_key(address) {
                // Lost a race with a concurrent observe.
                cancel.cancel();
                return Ok(view);
            }
            workers.insert(address.clone(), Worker { cancel, handle });
            lock_routes(&self.routes).insert(address.clone(), route);
            self.metrics
                .sync_metrics()
                .set_observed_agreements(workers.len());
        }
        self.listener.open(address, from_block);
        info!(address = %address, from_block, status = %view.agreement.status, "agreement observed");
        Ok(view)
    }

    /// Stops observing `address`. Returns `false` if it was not observed.
    ///
    /// In-flight operations on the agreement are not cancelled.
    pub fn unobserve(&self, address: &Address) -> bool {
        let removed = {
            let mut workers = self.workers();
            let removed = workers.remove(address);
            self.metrics
                .sync_metrics()
                .set_observed_agreements(workers.len());
            removed
        };
        let Some(worker) = removed else {
            return false;
        };
        worker.cancel.cancel();
        lock_routes(&self.routes).remove(address);
        self.listener.close(address);
        info!(address = %address, "agreement unobserved");
        true
    }

    async fn watermark(&self, address: &Address) -> Option<u64> {
        let store = self.cursor_store.as_ref()?;
        let target = address.clone();
        match store.run_blocking(move |s| s.load_watermark(&target)).await {
            Ok(block) => block,
            Err(e) => {
                warn!(address = %address, error = %e, "failed to load watermark");
                None
            },
        }
    }

    /// Stops every worker, the listener and the dispatcher.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let workers: Vec<(Address, Worker)> = self.workers().drain().collect();
        for (address, worker) in workers {
            if let Err(e) = worker.handle.await {
                warn!(address = %address, error = %e, "worker ended abnormally");
            }
        }
        lock_routes(&self.routes).clear();
        self.listener.shutdown().await;
        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = dispatcher {
            if let Err(e) = handle.await {
                warn!(error = %e, "dispatcher ended abnormally");
            }
        }
        self.metrics.sync_metrics().set_observed_agreements(0);
        info!("sync engine stopped");
    }
}

/// Routes listener events to per-address workers.
///
/// Routing never waits on a worker: when a worker's queue is full the event
/// is dropped with a warning and the next poll tick reconciles the agreement
/// from the ledger.
async fn dispatch(
    mut events: mpsc::Receiver<ListenerEvent>,
    routes: Routes,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = shutdown.cancelled() => return,
            event = events.recv() => event,
        };
        let Some(event) = event else {
            return;
        };
        let route = lock_routes(&routes).get(&event.address).cloned();
        match route {
            Some(route) => match route.try_send(event) {
                Ok(()) => {},
                Err(mpsc::error::TrySendError::Full(event)) => warn!(
                    address = %event.address,
                    block = event.block_number,
                    "worker queue full, event dropped until next poll tick"
                ),
                Err(mpsc::error::TrySendError::Closed(_)) => debug!("worker gone, event dropped"),
            },
            None => debug!(address = %event.address, "event for unobserved agreement dropped"),
        }
    }
}

/// Serializes poll ticks and routed events for one agreement.
async fn run_worker(
    synchronizer: Arc<StateSynchronizer>,
    address: Address,
    poll_interval: Duration,
    mut inbox: mpsc::Receiver<ListenerEvent>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + poll_interval, poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = synchronizer.poll_tick(&address).await {
                    warn!(address = %address, error = %e, "poll reconciliation failed");
                }
            },
            event = inbox.recv() => {
                let Some(event) = event else { break };
                if let Err(e) = synchronizer.handle_event(&event).await {
                    warn!(
                        address = %address,
                        tx_ref = %event.tx_ref,
                        error = %e,
                        "event reconciliation failed"
                    );
                }
            },
        }
    }
    debug!(address = %address, "worker stopped");
}
