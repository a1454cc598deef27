//! Reconciliation configuration

use crate::error::{ReconcileError, Result};
use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::{Validate, ValidationError};

/// Caller-supplied timings and policy for the orchestrator
///
/// Durations are stored as milliseconds so the config reads naturally from
/// YAML/JSON; use the accessor methods to get [`Duration`]s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_poll_bounds"))]
pub struct ReconcileConfig {
    /// End-to-end budget for one reconciliation
    #[validate(range(min = 1, message = "timeout_ms must be positive"))]
    pub timeout_ms: u64,

    /// Poll interval floor
    #[validate(range(min = 1, message = "min_poll_interval_ms must be positive"))]
    pub min_poll_interval_ms: u64,

    /// Poll interval ceiling
    pub max_poll_interval_ms: u64,

    /// Grace period before the first poll after each step
    pub initial_delay_ms: u64,

    /// Consecutive not-found polls tolerated
    pub not_found_checks: u32,

    /// Consecutive stable polls required before a step counts as converged
    #[validate(range(min = 1, message = "continuous_target_occurrence must be at least 1"))]
    pub continuous_target_occurrence: u32,

    /// Log a post-plan mismatch instead of failing
    pub allowed_drift: bool,

    /// Retry policy for transient step failures
    #[validate(nested)]
    pub step_retry: RetryConfig,
}

fn validate_poll_bounds(config: &ReconcileConfig) -> std::result::Result<(), ValidationError> {
    if config.max_poll_interval_ms < config.min_poll_interval_ms {
        return Err(ValidationError::new("invalid_poll_bounds").with_message(
            "max_poll_interval_ms must not be lower than min_poll_interval_ms".into(),
        ));
    }
    Ok(())
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 40 * 60 * 1000,
            min_poll_interval_ms: 10_000,
            max_poll_interval_ms: 60_000,
            initial_delay_ms: 30_000,
            not_found_checks: 20,
            continuous_target_occurrence: 1,
            allowed_drift: false,
            step_retry: RetryConfig::default(),
        }
    }
}

impl ReconcileConfig {
    /// Check the configuration, mapping failures to [`ReconcileError::InvalidConfig`]
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| ReconcileError::InvalidConfig(e.to_string()))
    }

    /// End-to-end budget
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Poll interval floor
    pub fn min_poll_interval(&self) -> Duration {
        Duration::from_millis(self.min_poll_interval_ms)
    }

    /// Poll interval ceiling
    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_millis(self.max_poll_interval_ms)
    }

    /// Grace period before the first poll
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    /// Set timeout (builder pattern)
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set poll interval floor (builder pattern)
    pub fn with_min_poll_interval(mut self, interval: Duration) -> Self {
        self.min_poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set poll interval ceiling (builder pattern)
    pub fn with_max_poll_interval(mut self, interval: Duration) -> Self {
        self.max_poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set initial delay (builder pattern)
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Set tolerated not-found polls (builder pattern)
    pub fn with_not_found_checks(mut self, checks: u32) -> Self {
        self.not_found_checks = checks;
        self
    }

    /// Set consecutive stable polls required (builder pattern)
    pub fn with_continuous_target_occurrence(mut self, occurrences: u32) -> Self {
        self.continuous_target_occurrence = occurrences;
        self
    }

    /// Tolerate post-plan drift (builder pattern)
    pub fn with_allowed_drift(mut self, allowed: bool) -> Self {
        self.allowed_drift = allowed;
        self
    }

    /// Set step retry policy (builder pattern)
    pub fn with_step_retry(mut self, retry: RetryConfig) -> Self {
        self.step_retry = retry;
        self
    }
}

/// Per-call overrides
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOptions {
    /// Overrides [`ReconcileConfig::timeout_ms`] for this call
    pub timeout: Option<Duration>,
    /// Member count the caller last asked for, if it remembers one
    ///
    /// Only used to report members that vanished out-of-band. Planning always
    /// starts from the live topology.
    pub last_known_members: Option<usize>,
}

impl ReconcileOptions {
    /// Set timeout override (builder pattern)
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set last known member count (builder pattern)
    pub fn with_last_known_members(mut self, members: usize) -> Self {
        self.last_known_members = Some(members);
        self
    }
}
