//! Metrics collection for observability
//!
//! Prometheus metrics on a private registry, so several engines (or tests)
//! can live in one process.
//!
//! # Metrics
//!
//! - `treasury_blocks_appended_total` - Ledger blocks written
//! - `treasury_votes_cast_total` - Ballots accepted
//! - `treasury_proposals_resolved_total{outcome}` - Proposals leaving `voting`
//! - `treasury_payments_credited_total` - Orders credited exactly once
//! - `treasury_duplicate_callbacks_total` - Re-delivered settlement callbacks
//! - `treasury_rejected_callbacks_total` - Callbacks with a bad signature
//! - `treasury_chain_verifications_total{result}` - Ledger audits
//! - `treasury_sweep_duration_seconds` - Deadline sweep latency

use crate::types::ProposalStatus;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Ledger blocks written
    pub blocks_appended: IntCounter,

    /// Ballots accepted
    pub votes_cast: IntCounter,

    /// Proposals resolved, by outcome
    pub proposals_resolved: IntCounterVec,

    /// Orders credited
    pub payments_credited: IntCounter,

    /// Re-delivered callbacks ignored
    pub duplicate_callbacks: IntCounter,

    /// Callbacks rejected for a bad signature
    pub rejected_callbacks: IntCounter,

    /// Chain verifications, by result
    pub chain_verifications: IntCounterVec,

    /// Sweep duration histogram
    pub sweep_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("blocks_appended", &self.blocks_appended.get())
            .field("votes_cast", &self.votes_cast.get())
            .field("payments_credited", &self.payments_credited.get())
            .finish_non_exhaustive()
    }
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let blocks_appended = IntCounter::new(
            "treasury_blocks_appended_total",
            "Total number of ledger blocks appended",
        )?;
        registry.register(Box::new(blocks_appended.clone()))?;

        let votes_cast = IntCounter::new("treasury_votes_cast_total", "Total ballots accepted")?;
        registry.register(Box::new(votes_cast.clone()))?;

        let proposals_resolved = IntCounterVec::new(
            Opts::new(
                "treasury_proposals_resolved_total",
                "Proposals resolved, by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(proposals_resolved.clone()))?;

        let payments_credited = IntCounter::new(
            "treasury_payments_credited_total",
            "Payment orders credited to a balance",
        )?;
        registry.register(Box::new(payments_credited.clone()))?;

        let duplicate_callbacks = IntCounter::new(
            "treasury_duplicate_callbacks_total",
            "Settlement callbacks for already-credited orders",
        )?;
        registry.register(Box::new(duplicate_callbacks.clone()))?;

        let rejected_callbacks = IntCounter::new(
            "treasury_rejected_callbacks_total",
            "Callbacks rejected for an invalid signature",
        )?;
        registry.register(Box::new(rejected_callbacks.clone()))?;

        let chain_verifications = IntCounterVec::new(
            Opts::new(
                "treasury_chain_verifications_total",
                "Ledger verifications, by result",
            ),
            &["result"],
        )?;
        registry.register(Box::new(chain_verifications.clone()))?;

        let sweep_duration = Histogram::with_opts(
            HistogramOpts::new(
                "treasury_sweep_duration_seconds",
                "Histogram of deadline sweep latencies",
            )
            .buckets(vec![0.001, 0.005, 0.010, 0.050, 0.100, 0.500, 1.0, 5.0]),
        )?;
        registry.register(Box::new(sweep_duration.clone()))?;

        Ok(Self {
            blocks_appended,
            votes_cast,
            proposals_resolved,
            payments_credited,
            duplicate_callbacks,
            rejected_callbacks,
            chain_verifications,
            sweep_duration,
            registry,
        })
    }

    /// Record block append
    pub fn record_block_appended(&self) {
        self.blocks_appended.inc();
    }

    /// Record accepted ballot
    pub fn record_vote(&self) {
        self.votes_cast.inc();
    }

    /// Record proposal resolution
    pub fn record_resolution(&self, outcome: ProposalStatus) {
        self.proposals_resolved
            .with_label_values(&[outcome.as_str()])
            .inc();
    }

    /// Record credited payment
    pub fn record_payment_credited(&self) {
        self.payments_credited.inc();
    }

    /// Record duplicate callback
    pub fn record_duplicate_callback(&self) {
        self.duplicate_callbacks.inc();
    }

    /// Record rejected callback
    pub fn record_rejected_callback(&self) {
        self.rejected_callbacks.inc();
    }

    /// Record chain verification
    pub fn record_verification(&self, valid: bool) {
        let result = if valid { "valid" } else { "invalid" };
        self.chain_verifications.with_label_values(&[result]).inc();
    }

    /// Record sweep duration
    pub fn record_sweep_duration(&self, duration_seconds: f64) {
        self.sweep_duration.observe(duration_seconds);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
