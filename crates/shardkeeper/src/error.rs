//! Reconciliation error types

use crate::client::ClientError;
use crate::topology::Topology;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type for reconciliation operations
pub type Result<T> = std::result::Result<T, ReconcileError>;

/// Reconciliation errors
#[derive(Debug, Error)]
pub enum ReconcileError {
    // ==================== Input Errors ====================
    #[error("invalid desired shape: {0}")]
    InvalidShape(String),

    #[error("invalid observed topology: {0}")]
    InvalidTopology(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("cannot move from {observed} to {desired} incrementally: requires replacement")]
    TopologyClassChange {
        observed: &'static str,
        desired: &'static str,
    },

    // ==================== Remote Call Errors ====================
    #[error("{operation} failed (retryable): {source}")]
    TransientClient {
        operation: &'static str,
        #[source]
        source: ClientError,
    },

    #[error("{operation} failed: {source}")]
    FatalClient {
        operation: &'static str,
        #[source]
        source: ClientError,
    },

    #[error("not found: {0}")]
    NotFound(String),

    // ==================== Convergence Errors ====================
    #[error("unexpected state '{state}', wanted target '{}'", expected.join(", "))]
    UnexpectedState { state: String, expected: Vec<String> },

    #[error(
        "timeout while waiting for state to become '{}' (last state: '{}', timeout: {timeout:?})",
        expected.join(", "),
        last_state.as_deref().unwrap_or("")
    )]
    Timeout {
        last_state: Option<String>,
        expected: Vec<String>,
        timeout: Duration,
    },

    #[error("canceled")]
    Canceled,

    // ==================== Verification Errors ====================
    #[error("topology drifted after plan execution: expected {expected}, observed {observed}")]
    Drift { expected: String, observed: String },
}

impl ReconcileError {
    /// Check if the failed operation may be retried as-is
    pub fn is_retriable(&self) -> bool {
        matches!(self, ReconcileError::TransientClient { .. })
    }

    /// Check if the only way forward is to replace the resource
    pub fn requires_replacement(&self) -> bool {
        matches!(self, ReconcileError::TopologyClassChange { .. })
    }

    /// Check if the target is gone (callers may treat this as "already deleted")
    pub fn is_not_found(&self) -> bool {
        matches!(self, ReconcileError::NotFound(_))
    }

    /// Short, stable label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ReconcileError::InvalidShape(_) => "invalid_shape",
            ReconcileError::InvalidTopology(_) => "invalid_topology",
            ReconcileError::InvalidConfig(_) => "invalid_config",
            ReconcileError::TopologyClassChange { .. } => "topology_class_change",
            ReconcileError::TransientClient { .. } => "transient_client",
            ReconcileError::FatalClient { .. } => "fatal_client",
            ReconcileError::NotFound(_) => "not_found",
            ReconcileError::UnexpectedState { .. } => "unexpected_state",
            ReconcileError::Timeout { .. } => "timeout",
            ReconcileError::Canceled => "canceled",
            ReconcileError::Drift { .. } => "drift",
        }
    }
}

/// A failed reconciliation, with how far it got and what was last seen
#[derive(Debug)]
pub struct ReconcileFailure {
    /// What went wrong
    pub error: ReconcileError,
    /// Steps that were executed and converged before the failure
    pub completed_steps: usize,
    /// Steps in the plan (0 if planning itself failed)
    pub total_steps: usize,
    /// Most recent topology read from the remote system, if any
    pub last_observed: Option<Box<Topology>>,
}

impl ReconcileFailure {
    pub(crate) fn new(error: ReconcileError) -> Self {
        Self {
            error,
            completed_steps: 0,
            total_steps: 0,
            last_observed: None,
        }
    }

    pub(crate) fn with_progress(mut self, completed: usize, total: usize) -> Self {
        self.completed_steps = completed;
        self.total_steps = total;
        self
    }

    pub(crate) fn with_observed(mut self, topology: Option<Topology>) -> Self {
        self.last_observed = topology.map(Box::new);
        self
    }

    /// Check if some, but not all, steps were applied
    pub fn is_partial(&self) -> bool {
        self.completed_steps > 0 && self.completed_steps < self.total_steps
    }
}

impl fmt::Display for ReconcileFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} of {} steps completed)",
            self.error, self.completed_steps, self.total_steps
        )
    }
}

impl std::error::Error for ReconcileFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl From<ReconcileError> for ReconcileFailure {
    fn from(error: ReconcileError) -> Self {
        ReconcileFailure::new(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_errors() {
        let transient = ReconcileError::TransientClient {
            operation: "add_replicas",
            source: ClientError::new("Throttling", "slow down"),
        };
        assert!(transient.is_retriable());
        assert!(!ReconcileError::Canceled.is_retriable());
        assert!(!ReconcileError::InvalidShape("x".into()).is_retriable());
    }

    #[test]
    fn test_replacement_and_not_found() {
        let err = ReconcileError::TopologyClassChange {
            observed: "flat",
            desired: "clustered",
        };
        assert!(err.requires_replacement());
        assert!(err.to_string().contains("requires replacement"));
        assert!(ReconcileError::NotFound("rg".into()).is_not_found());
    }

    #[test]
    fn test_timeout_display() {
        let err = ReconcileError::Timeout {
            last_state: Some("modifying".into()),
            expected: vec!["available".into()],
            timeout: Duration::from_secs(1),
        };
        let msg = err.to_string();
        assert!(msg.contains("available"));
        assert!(msg.contains("modifying"));
    }

    #[test]
    fn test_failure_reports_progress() {
        let failure = ReconcileFailure::new(ReconcileError::Canceled).with_progress(2, 5);
        assert_eq!(failure.to_string(), "canceled (2 of 5 steps completed)");
        assert!(failure.is_partial());

        let planning = ReconcileFailure::from(ReconcileError::InvalidShape("both".into()));
        assert!(!planning.is_partial());
        assert_eq!(planning.total_steps, 0);
    }
}
