//! Prometheus metrics for synchronization health.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `leasehold_reconcile_total` | Counter | `outcome` |
//! | `leasehold_backend_write_attempts_total` | Counter | `result` |
//! | `leasehold_sync_degraded_total` | Counter | |
//! | `leasehold_invariant_violations_total` | Counter | `kind` |
//! | `leasehold_listener_events_total` | Counter | `disposition` |
//! | `leasehold_listener_reconnects_total` | Counter | |
//! | `leasehold_observed_agreements` | Gauge | |
//!
//! ```rust,ignore
//! let registry = MetricsRegistry::new()?;
//! registry.sync_metrics().reconcile_completed("changed");
//! let output = registry.encode_text()?;
//! ```

use std::sync::Arc;

use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};
use thiserror::Error;

/// Errors that can occur during metrics operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MetricsError {
    /// Failed to register a metric with Prometheus.
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    /// Failed to encode metrics output.
    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

/// Result type for metrics operations.
pub type MetricsResult<T> = Result<T, MetricsError>;

/// Synchronization metrics.
///
/// All metrics use interior mutability; the struct is cheap to clone and
/// safe to share across tasks.
#[derive(Clone)]
pub struct SyncMetrics {
    reconcile_total: CounterVec,
    backend_write_attempts_total: CounterVec,
    sync_degraded_total: Counter,
    invariant_violations_total: CounterVec,
    listener_events_total: CounterVec,
    listener_reconnects_total: Counter,
    observed_agreements: Gauge,
}

impl SyncMetrics {
    /// Creates the metrics and registers them with `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error if any metric fails to register (e.g., duplicate name).
    pub fn new(registry: &Registry) -> MetricsResult<Self> {
        let reconcile_total = CounterVec::new(
            Opts::new(
                "leasehold_reconcile_total",
                "Reconciliation passes by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(reconcile_total.clone()))?;

        let backend_write_attempts_total = CounterVec::new(
            Opts::new(
                "leasehold_backend_write_attempts_total",
                "Backend write attempts by result",
            ),
            &["result"],
        )?;
        registry.register(Box::new(backend_write_attempts_total.clone()))?;

        let sync_degraded_total = Counter::with_opts(Opts::new(
            "leasehold_sync_degraded_total",
            "Writes abandoned after exhausting retries",
        ))?;
        registry.register(Box::new(sync_degraded_total.clone()))?;

        let invariant_violations_total = CounterVec::new(
            Opts::new(
                "leasehold_invariant_violations_total",
                "Rejected ledger observations by violation kind",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(invariant_violations_total.clone()))?;

        let listener_events_total = CounterVec::new(
            Opts::new(
                "leasehold_listener_events_total",
                "Ledger events by listener disposition",
            ),
            &["disposition"],
        )?;
        registry.register(Box::new(listener_events_total.clone()))?;

        let listener_reconnects_total = Counter::with_opts(Opts::new(
            "leasehold_listener_reconnects_total",
            "Event stream reconnections",
        ))?;
        registry.register(Box::new(listener_reconnects_total.clone()))?;

        let observed_agreements = Gauge::with_opts(Opts::new(
            "leasehold_observed_agreements",
            "Agreements currently observed",
        ))?;
        registry.register(Box::new(observed_agreements.clone()))?;

        Ok(Self {
            reconcile_total,
            backend_write_attempts_total,
            sync_degraded_total,
            invariant_violations_total,
            listener_events_total,
            listener_reconnects_total,
            observed_agreements,
        })
    }

    // ========================================================================
    // Synchronizer
    // ========================================================================

    /// Records a finished reconciliation (`unchanged`, `changed`, `failed`).
    pub fn reconcile_completed(&self, outcome: &str) {
        self.reconcile_total.with_label_values(&[outcome]).inc();
    }

    /// Returns reconciliations recorded with `outcome`.
    #[must_use]
    pub fn reconcile_count(&self, outcome: &str) -> f64 {
        self.reconcile_total.with_label_values(&[outcome]).get()
    }

    /// Records one backend write attempt (`success`, `failure`).
    pub fn backend_write_attempt(&self, result: &str) {
        self.backend_write_attempts_total
            .with_label_values(&[result])
            .inc();
    }

    /// Returns backend write attempts recorded with `result`.
    #[must_use]
    pub fn backend_write_attempt_count(&self, result: &str) -> f64 {
        self.backend_write_attempts_total
            .with_label_values(&[result])
            .get()
    }

    /// Records an abandoned write.
    pub fn sync_degraded(&self) {
        self.sync_degraded_total.inc();
    }

    /// Returns abandoned writes.
    #[must_use]
    pub fn sync_degraded_count(&self) -> f64 {
        self.sync_degraded_total.get()
    }

    /// Records a rejected observation.
    pub fn invariant_violation(&self, kind: &str) {
        self.invariant_violations_total
            .with_label_values(&[kind])
            .inc();
    }

    /// Returns rejected observations of `kind`.
    #[must_use]
    pub fn invariant_violation_count(&self, kind: &str) -> f64 {
        self.invariant_violations_total
            .with_label_values(&[kind])
            .get()
    }

    // ========================================================================
    // Listener
    // ========================================================================

    /// Records a raw event (`forwarded`, `duplicate`, `undecodable`,
    /// `unknown`).
    pub fn listener_event(&self, disposition: &str) {
        self.listener_events_total
            .with_label_values(&[disposition])
            .inc();
    }

    /// Returns raw events recorded with `disposition`.
    #[must_use]
    pub fn listener_event_count(&self, disposition: &str) -> f64 {
        self.listener_events_total
            .with_label_values(&[disposition])
            .get()
    }

    /// Records a stream reconnection.
    pub fn listener_reconnected(&self) {
        self.listener_reconnects_total.inc();
    }

    /// Returns stream reconnections.
    #[must_use]
    pub fn listener_reconnect_count(&self) -> f64 {
        self.listener_reconnects_total.get()
    }

    // ========================================================================
    // Engine
    // ========================================================================

    /// Sets the number of observed agreements.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_observed_agreements(&self, count: usize) {
        self.observed_agreements.set(count as f64);
    }

    /// Returns the number of observed agreements.
    #[must_use]
    pub fn observed_agreements(&self) -> f64 {
        self.observed_agreements.get()
    }
}

/// Holds the Prometheus registry and the metrics registered with it.
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Registry,
    sync_metrics: SyncMetrics,
}

impl MetricsRegistry {
    /// Creates a registry with all synchronization metrics registered.
    ///
    /// # Errors
    ///
    /// Returns an error if metric registration fails.
    pub fn new() -> MetricsResult<Self> {
        let registry = Registry::new();
        let sync_metrics = SyncMetrics::new(&registry)?;
        Ok(Self {
            registry,
            sync_metrics,
        })
    }

    /// Returns the synchronization metrics.
    #[must_use]
    pub const fn sync_metrics(&self) -> &SyncMetrics {
        &self.sync_metrics
    }

    /// Encodes all metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode_text(&self) -> MetricsResult<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
    }
}

/// Shared metrics registry.
pub type SharedMetricsRegistry = Arc<MetricsRegistry>;

/// Creates a new shared metrics registry.
///
/// # Errors
///
/// Returns an error if metric registration fails.
pub fn new_shared_registry() -> MetricsResult<SharedMetricsRegistry> {
    Ok(Arc::new(MetricsRegistry::new()?))
}
