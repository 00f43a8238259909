//! Metrics collection for observability
//!
//! Each engine owns a private Prometheus registry so several engines (and
//! parallel tests) never collide on global registration.
//!
//! # Metrics
//!
//! - `escrow_invocations_total{entry_point}` - Guarded invocations started
//! - `escrow_invocation_failures_total{kind}` - Rolled-back invocations by error class
//! - `escrow_transitions_total{to_state}` - Committed SRP state transitions
//! - `escrow_transfers_total` - Token transfers performed by the core
//! - `escrow_batch_size` - Histogram of batch item counts

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Invocations by entry point
    pub invocations: IntCounterVec,

    /// Failures by error kind
    pub failures: IntCounterVec,

    /// Transitions by target state
    pub transitions: IntCounterVec,

    /// Token transfers
    pub transfers: IntCounter,

    /// Batch size histogram
    pub batch_size: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("transfers", &self.transfers.get())
            .finish()
    }
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> crate::Result<Self> {
        let registry = Arc::new(Registry::new());

        let invocations = IntCounterVec::new(
            Opts::new("escrow_invocations_total", "Guarded invocations started"),
            &["entry_point"],
        )?;
        registry.register(Box::new(invocations.clone()))?;

        let failures = IntCounterVec::new(
            Opts::new(
                "escrow_invocation_failures_total",
                "Rolled-back invocations by error class",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(failures.clone()))?;

        let transitions = IntCounterVec::new(
            Opts::new("escrow_transitions_total", "Committed SRP state transitions"),
            &["to_state"],
        )?;
        registry.register(Box::new(transitions.clone()))?;

        let transfers = IntCounter::new("escrow_transfers_total", "Token transfers performed")?;
        registry.register(Box::new(transfers.clone()))?;

        let batch_size = Histogram::with_opts(
            HistogramOpts::new("escrow_batch_size", "Histogram of batch item counts")
                .buckets(vec![1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0]),
        )?;
        registry.register(Box::new(batch_size.clone()))?;

        Ok(Self {
            invocations,
            failures,
            transitions,
            transfers,
            batch_size,
            registry,
        })
    }

    /// Record invocation start
    pub fn record_invocation(&self, entry_point: &str) {
        self.invocations.with_label_values(&[entry_point]).inc();
    }

    /// Record rolled-back invocation
    pub fn record_failure(&self, kind: crate::ErrorKind) {
        self.failures.with_label_values(&[kind.as_str()]).inc();
    }

    /// Record committed transition
    pub fn record_transition(&self, to_state: crate::types::SrpState) {
        self.transitions.with_label_values(&[to_state.as_str()]).inc();
    }

    /// Record token transfer
    pub fn record_transfer(&self) {
        self.transfers.inc();
    }

    /// Record batch size
    pub fn record_batch(&self, items: usize) {
        self.batch_size.observe(items as f64);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
