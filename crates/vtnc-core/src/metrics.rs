//! ---
//! vtnc_section: "06-reconciliation-engines"
//! vtnc_subsection: "module"
//! vtnc_type: "source"
//! vtnc_scope: "code"
//! vtnc_description: "Commit, audit and import engines and the transaction coordinator."
//! vtnc_version: "v0.0.0-prealpha"
//! vtnc_owner: "tbd"
//! ---
use std::sync::Arc;

use prometheus::{self, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

use crate::Result;

/// Metrics published by the reconciliation engines.
#[derive(Clone)]
pub struct EngineMetrics {
    commit_records: IntCounterVec,
    dispatch_failures: IntCounterVec,
    audit_passes: IntCounterVec,
    settlements: IntCounterVec,
    transaction_duration: HistogramVec,
    #[allow(dead_code)]
    registry: Arc<Registry>,
}

impl EngineMetrics {
    /// Register all engine metrics with the provided registry.
    pub fn new(registry: Arc<Registry>) -> Result<Self> {
        let commit_records = IntCounterVec::new(
            Opts::new(
                "vtnc_commit_records_total",
                "Records promoted from CANDIDATE to RUNNING, by entity, operation and result",
            ),
            &["entity", "op", "result"],
        )?;
        registry.register(Box::new(commit_records.clone()))?;

        let dispatch_failures = IntCounterVec::new(
            Opts::new(
                "vtnc_dispatch_failures_total",
                "Records a controller rejected or could not receive",
            ),
            &["controller", "service"],
        )?;
        registry.register(Box::new(dispatch_failures.clone()))?;

        let audit_passes = IntCounterVec::new(
            Opts::new(
                "vtnc_audit_passes_total",
                "Completed controller audits, by aggregate outcome",
            ),
            &["controller", "outcome"],
        )?;
        registry.register(Box::new(audit_passes.clone()))?;

        let settlements = IntCounterVec::new(
            Opts::new(
                "vtnc_label_settlements_total",
                "Allocator scopes settled at the end of a transaction",
            ),
            &["phase"],
        )?;
        registry.register(Box::new(settlements.clone()))?;

        let histogram_opts = HistogramOpts::new(
            "vtnc_transaction_duration_seconds",
            "Duration of commit and abort transactions",
        )
        .buckets(prometheus::exponential_buckets(0.001, 2.0, 12)?);
        let transaction_duration = HistogramVec::new(histogram_opts, &["kind"])?;
        registry.register(Box::new(transaction_duration.clone()))?;

        Ok(Self {
            commit_records,
            dispatch_failures,
            audit_passes,
            settlements,
            transaction_duration,
            registry,
        })
    }

    pub fn record_commit(&self, entity: &str, op: &str, result: &str) {
        self.commit_records
            .with_label_values(&[entity, op, result])
            .inc();
    }

    pub fn record_dispatch_failure(&self, controller: &str, service: &str) {
        self.dispatch_failures
            .with_label_values(&[controller, service])
            .inc();
    }

    pub fn record_audit(&self, controller: &str, outcome: &str) {
        self.audit_passes
            .with_label_values(&[controller, outcome])
            .inc();
    }

    pub fn record_settlement(&self, phase: &str) {
        self.settlements.with_label_values(&[phase]).inc();
    }

    pub fn observe_transaction(&self, kind: &str, seconds: f64) {
        self.transaction_duration
            .with_label_values(&[kind])
            .observe(seconds);
    }

    #[cfg(test)]
    pub(crate) fn commit_count(&self, entity: &str, op: &str, result: &str) -> u64 {
        self.commit_records
            .with_label_values(&[entity, op, result])
            .get()
    }

    #[cfg(test)]
    pub(crate) fn dispatch_failure_count(&self, controller: &str, service: &str) -> u64 {
        self.dispatch_failures
            .with_label_values(&[controller, service])
            .get()
    }
}

impl std::fmt::Debug for EngineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineMetrics").finish_non_exhaustive()
    }
}
