//! Reconciliation metrics
//!
//! Lightweight metrics using the `metrics` crate. Any recorder can be
//! installed by the host process (the CLI installs the Prometheus exporter).
//!
//! # Feature Flags
//!
//! ```toml
//! shardkeeper = { version = "0.1", default-features = false }  # no metrics
//! ```
//!
//! With the `metrics` feature disabled every function here is a no-op.

use std::time::Duration;

// ============================================================================
// Reconcile Metrics
// ============================================================================

/// Orchestrator, executor and waiter metrics
pub struct ReconcileMetrics;

impl ReconcileMetrics {
    // ---- Counters ----

    /// Reconciliations started
    pub fn increment_reconciliations() {
        #[cfg(feature = "metrics")]
        metrics::counter!("shardkeeper_reconciliations_total").increment(1);
    }

    /// Reconciliations that failed, by error kind
    pub fn increment_errors(kind: &'static str) {
        #[cfg(feature = "metrics")]
        metrics::counter!("shardkeeper_reconcile_errors_total", "kind" => kind).increment(1);
        #[cfg(not(feature = "metrics"))]
        let _ = kind;
    }

    /// Steps issued, by step kind
    pub fn increment_steps(kind: &'static str) {
        #[cfg(feature = "metrics")]
        metrics::counter!("shardkeeper_steps_total", "kind" => kind).increment(1);
        #[cfg(not(feature = "metrics"))]
        let _ = kind;
    }

    /// Retries of a transient step failure
    pub fn increment_step_retries(operation: &str) {
        #[cfg(feature = "metrics")]
        metrics::counter!("shardkeeper_step_retries_total", "operation" => operation.to_string())
            .increment(1);
        #[cfg(not(feature = "metrics"))]
        let _ = operation;
    }

    /// Polls performed by the convergence waiter
    pub fn increment_waiter_polls() {
        #[cfg(feature = "metrics")]
        metrics::counter!("shardkeeper_waiter_polls_total").increment(1);
    }

    /// Post-plan verification mismatches
    pub fn increment_drift() {
        #[cfg(feature = "metrics")]
        metrics::counter!("shardkeeper_drift_detected_total").increment(1);
    }

    /// Members that disappeared since the caller's last known count
    pub fn add_vanished_members(count: usize) {
        #[cfg(feature = "metrics")]
        metrics::counter!("shardkeeper_vanished_members_total").increment(count as u64);
        #[cfg(not(feature = "metrics"))]
        let _ = count;
    }

    // ---- Gauges ----

    /// Steps in the plan currently being executed
    pub fn set_plan_steps(steps: usize) {
        #[cfg(feature = "metrics")]
        metrics::gauge!("shardkeeper_plan_steps").set(steps as f64);
        #[cfg(not(feature = "metrics"))]
        let _ = steps;
    }

    // ---- Histograms ----

    /// End-to-end reconciliation latency
    pub fn record_reconcile_duration(duration: Duration) {
        #[cfg(feature = "metrics")]
        metrics::histogram!("shardkeeper_reconcile_duration_seconds")
            .record(duration.as_secs_f64());
        #[cfg(not(feature = "metrics"))]
        let _ = duration;
    }

    /// Time from issuing a step until the resource was stable again
    pub fn record_step_duration(kind: &'static str, duration: Duration) {
        #[cfg(feature = "metrics")]
        metrics::histogram!("shardkeeper_step_duration_seconds", "kind" => kind)
            .record(duration.as_secs_f64());
        #[cfg(not(feature = "metrics"))]
        let _ = (kind, duration);
    }
}
