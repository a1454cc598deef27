//! Bounded retries for transient step failures
//!
//! Only [`ReconcileError::TransientClient`] is retried, and only the single
//! step that failed. Backoff is exponential and capped; sleeps race the
//! cancellation token.

use crate::error::Result;
use crate::observability::ReconcileMetrics;
use crate::waiter::sleep_or_cancel;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use validator::Validate;

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including the initial attempt)
    #[validate(range(max = 20, message = "max_retries must be at most 20"))]
    pub max_retries: u32,
    /// Initial delay between retries, in milliseconds
    pub initial_delay_ms: u64,
    /// Maximum delay between retries, in milliseconds
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff (2.0 doubles the delay each retry)
    #[validate(range(min = 1.0, max = 10.0, message = "backoff_multiplier must be between 1 and 10"))]
    pub backoff_multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    #[validate(range(min = 0.0, max = 1.0, message = "jitter_factor must be between 0 and 1"))]
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }
}

impl RetryConfig {
    /// Create a retry config with no retries (fail immediately)
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Set max retries (builder pattern)
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set initial delay (builder pattern)
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Set max delay (builder pattern)
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Set backoff multiplier (builder pattern)
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Set jitter factor (builder pattern)
    pub fn with_jitter(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `attempt` (1-indexed; 0 means no delay)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        // cap the exponent to keep powi well-behaved
        let capped_attempt = attempt.min(30);
        let base_delay =
            self.initial_delay_ms as f64 * self.backoff_multiplier.powi(capped_attempt as i32 - 1);
        let capped_delay = base_delay.min(self.max_delay_ms as f64);

        // deterministic jitter keyed on the attempt number
        let jitter = if self.jitter_factor > 0.0 {
            let spread = capped_delay * self.jitter_factor;
            let position = (attempt as f64 * 0.618033988749895) % 1.0;
            spread * (position - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((capped_delay + jitter).max(0.0) as u64)
    }
}

/// Run `operation`, retrying retriable failures up to `config.max_retries` times
pub async fn retry<T, F, Fut>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempts = 0u32;

    loop {
        attempts += 1;

        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retriable() && attempts <= config.max_retries => {
                let delay = config.delay_for_attempt(attempts);
                warn!(
                    operation = %operation_name,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                ReconcileMetrics::increment_step_retries(operation_name);
                sleep_or_cancel(cancel, delay).await?;
            }
            Err(e) => return Err(e),
        }
    }
}
