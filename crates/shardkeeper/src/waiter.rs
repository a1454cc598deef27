//! Convergence waiter
//!
//! One generic polling loop reused for every "wait until the remote side
//! settles" situation. A [`StateChangeConf`] names the status strings that
//! mean "keep waiting" (`pending`) and "done" (`target`); the caller supplies a
//! refresh function that performs a single poll.
//!
//! ```text
//!   [delay] -> poll -> target   (x continuous_target_occurrence) -> Ok
//!               |  -> pending  -> sleep(min_timeout * attempt) -> poll
//!               |  -> other    -> UnexpectedState
//!               |  -> missing  -> tolerated up to not_found_checks, then NotFound
//!               |                 (success when target is empty)
//!               +-- deadline   -> Timeout      cancel -> Canceled
//! ```
//!
//! Sleeps and polls race the cancellation token, so cancellation is observed
//! promptly and is reported distinctly from a timeout.

use crate::config::ReconcileConfig;
use crate::error::{ReconcileError, Result};
use crate::observability::ReconcileMetrics;
use std::future::Future;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// Result of a single poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Refreshed<T> {
    /// The resource exists and reports `status`
    Found { resource: T, status: String },
    /// The resource does not exist (yet, or any more)
    NotFound,
}

impl<T> Refreshed<T> {
    /// Shorthand for [`Refreshed::Found`]
    pub fn found(resource: T, status: impl Into<String>) -> Self {
        Refreshed::Found {
            resource,
            status: status.into(),
        }
    }
}

/// Polling configuration
#[derive(Debug, Clone)]
pub struct StateChangeConf {
    /// Statuses that mean "still converging"
    pub pending: Vec<String>,
    /// Statuses that mean "converged"; empty means "converged once gone"
    pub target: Vec<String>,
    /// Overall budget, initial delay included
    pub timeout: Duration,
    /// Poll interval floor; the interval grows linearly from here
    pub min_timeout: Duration,
    /// Poll interval ceiling
    pub max_interval: Duration,
    /// Grace period before the first poll
    pub delay: Duration,
    /// Consecutive not-found polls tolerated before giving up
    pub not_found_checks: u32,
    /// Consecutive target polls required before declaring success
    pub continuous_target_occurrence: u32,
    /// What is being waited on (diagnostics only)
    pub subject: String,
}

impl StateChangeConf {
    /// Create a waiter with default timings
    pub fn new(pending: Vec<String>, target: Vec<String>) -> Self {
        Self {
            pending,
            target,
            timeout: Duration::from_secs(40 * 60),
            min_timeout: Duration::from_secs(10),
            max_interval: Duration::from_secs(60),
            delay: Duration::ZERO,
            not_found_checks: 20,
            continuous_target_occurrence: 1,
            subject: "resource".to_string(),
        }
    }

    /// Create a waiter using the timings from a reconcile configuration
    pub fn from_config(config: &ReconcileConfig, pending: Vec<String>, target: Vec<String>) -> Self {
        Self {
            timeout: config.timeout(),
            min_timeout: config.min_poll_interval(),
            max_interval: config.max_poll_interval(),
            delay: config.initial_delay(),
            not_found_checks: config.not_found_checks,
            continuous_target_occurrence: config.continuous_target_occurrence,
            ..Self::new(pending, target)
        }
    }

    /// Set overall timeout (builder pattern)
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set poll interval floor (builder pattern)
    pub fn with_min_timeout(mut self, min_timeout: Duration) -> Self {
        self.min_timeout = min_timeout;
        self
    }

    /// Set poll interval ceiling (builder pattern)
    pub fn with_max_interval(mut self, max_interval: Duration) -> Self {
        self.max_interval = max_interval;
        self
    }

    /// Set initial delay (builder pattern)
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Set tolerated not-found polls (builder pattern)
    pub fn with_not_found_checks(mut self, checks: u32) -> Self {
        self.not_found_checks = checks;
        self
    }

    /// Set consecutive target polls required (builder pattern)
    pub fn with_continuous_target_occurrence(mut self, occurrences: u32) -> Self {
        self.continuous_target_occurrence = occurrences.max(1);
        self
    }

    /// Set diagnostic subject (builder pattern)
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    /// Sleep before poll number `attempt + 1`
    fn interval(&self, attempt: u32) -> Duration {
        self.min_timeout
            .checked_mul(attempt)
            .unwrap_or(self.max_interval)
            .min(self.max_interval)
            .max(Duration::from_millis(1))
    }

    fn timeout_error(&self, last_state: Option<String>) -> ReconcileError {
        ReconcileError::Timeout {
            last_state,
            expected: self.target.clone(),
            timeout: self.timeout,
        }
    }

    /// Poll until the target state, a terminal state, the deadline, or cancellation
    ///
    /// Returns the last refreshed resource, or `None` when the target set is
    /// empty and the resource disappeared.
    #[instrument(skip_all, fields(subject = %self.subject, timeout = ?self.timeout))]
    pub async fn wait<T, F, Fut>(&self, cancel: &CancellationToken, mut refresh: F) -> Result<Option<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Refreshed<T>>>,
    {
        let deadline = Instant::now() + self.timeout;
        let required = self.continuous_target_occurrence.max(1);
        let mut last_state: Option<String> = None;
        let mut not_found = 0u32;
        let mut target_seen = 0u32;
        let mut attempt = 0u32;

        if !self.delay.is_zero() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            sleep_or_cancel(cancel, self.delay.min(remaining)).await?;
        }

        loop {
            if cancel.is_cancelled() {
                return Err(ReconcileError::Canceled);
            }
            if Instant::now() >= deadline {
                return Err(self.timeout_error(last_state));
            }

            attempt += 1;
            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ReconcileError::Canceled),
                polled = timeout_at(deadline, refresh()) => match polled {
                    Ok(polled) => polled?,
                    Err(_) => return Err(self.timeout_error(last_state)),
                },
            };
            ReconcileMetrics::increment_waiter_polls();

            match polled {
                Refreshed::NotFound => {
                    target_seen = 0;
                    if self.target.is_empty() {
                        debug!(attempt, "Resource gone");
                        return Ok(None);
                    }
                    not_found += 1;
                    debug!(attempt, not_found, "Resource not found");
                    if not_found > self.not_found_checks {
                        return Err(ReconcileError::NotFound(format!(
                            "{} (not found after {} checks)",
                            self.subject, not_found
                        )));
                    }
                }
                Refreshed::Found { resource, status } => {
                    not_found = 0;
                    debug!(attempt, status = %status, "Polled");
                    if self.target.contains(&status) {
                        target_seen += 1;
                        if target_seen >= required {
                            return Ok(Some(resource));
                        }
                    } else if self.pending.contains(&status) {
                        target_seen = 0;
                    } else {
                        return Err(ReconcileError::UnexpectedState {
                            state: status,
                            expected: self.target.clone(),
                        });
                    }
                    last_state = Some(status);
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(self.timeout_error(last_state));
            }
            sleep_or_cancel(cancel, self.interval(attempt).min(remaining)).await?;
        }
    }
}

/// Sleep unless cancelled first
pub(crate) async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> Result<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ReconcileError::Canceled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn conf() -> StateChangeConf {
        StateChangeConf::new(vec!["modifying".into()], vec!["available".into()])
            .with_timeout(Duration::from_secs(1))
            .with_min_timeout(Duration::from_millis(10))
    }

    #[test]
    fn test_interval_grows_linearly_and_caps() {
        let conf = conf().with_max_interval(Duration::from_millis(35));
        assert_eq!(conf.interval(1), Duration::from_millis(10));
        assert_eq!(conf.interval(3), Duration::from_millis(30));
        assert_eq!(conf.interval(4), Duration::from_millis(35));
        assert_eq!(conf.interval(u32::MAX), Duration::from_millis(35));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaches_target() {
        let polls = AtomicU32::new(0);
        let result = conf()
            .wait(&CancellationToken::new(), || {
                let n = polls.fetch_add(1, Ordering::SeqCst);
                async move {
                    let status = if n < 3 { "modifying" } else { "available" };
                    Ok(Refreshed::found(n, status))
                }
            })
            .await
            .unwrap();
        assert_eq!(result, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_state_fails_fast() {
        let err = conf()
            .wait(&CancellationToken::new(), || async {
                Ok(Refreshed::found((), "create-failed"))
            })
            .await
            .unwrap_err();
        match err {
            ReconcileError::UnexpectedState { state, expected } => {
                assert_eq!(state, "create-failed");
                assert_eq!(expected, vec!["available".to_string()]);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_while_pending() {
        let start = Instant::now();
        let err = conf()
            .wait(&CancellationToken::new(), || async {
                Ok(Refreshed::found((), "modifying"))
            })
            .await
            .unwrap_err();
        match err {
            ReconcileError::Timeout { last_state, .. } => {
                assert_eq!(last_state.as_deref(), Some("modifying"))
            }
            other => panic!("unexpected error {other}"),
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_millis(1100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_delay_counts_against_timeout() {
        let polls = AtomicU32::new(0);
        let err = conf()
            .with_delay(Duration::from_secs(5))
            .wait(&CancellationToken::new(), || {
                polls.fetch_add(1, Ordering::SeqCst);
                async { Ok(Refreshed::found((), "available")) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Timeout { .. }));
        assert_eq!(polls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_tolerated_then_fatal() {
        let polls = AtomicU32::new(0);
        let result = conf()
            .with_not_found_checks(2)
            .wait(&CancellationToken::new(), || {
                let n = polls.fetch_add(1, Ordering::SeqCst);
                async move {
                    Ok(if n < 2 {
                        Refreshed::NotFound
                    } else {
                        Refreshed::found(n, "available")
                    })
                }
            })
            .await
            .unwrap();
        assert_eq!(result, Some(2));

        let err = conf()
            .with_not_found_checks(2)
            .wait(&CancellationToken::new(), || async {
                Ok(Refreshed::<()>::NotFound)
            })
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_target_means_gone() {
        let conf = StateChangeConf::new(vec!["deleting".into()], vec![])
            .with_min_timeout(Duration::from_millis(10));
        let polls = AtomicU32::new(0);
        let result = conf
            .wait(&CancellationToken::new(), || {
                let n = polls.fetch_add(1, Ordering::SeqCst);
                async move {
                    Ok(if n < 2 {
                        Refreshed::found(n, "deleting")
                    } else {
                        Refreshed::NotFound
                    })
                }
            })
            .await
            .unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_target_occurrence() {
        let statuses = ["available", "modifying", "available", "available"];
        let polls = AtomicU32::new(0);
        let result = conf()
            .with_continuous_target_occurrence(2)
            .wait(&CancellationToken::new(), || {
                let n = polls.fetch_add(1, Ordering::SeqCst);
                async move { Ok(Refreshed::found(n, statuses[n as usize])) }
            })
            .await
            .unwrap();
        assert_eq!(result, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_is_not_timeout() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = conf()
            .wait(&token, || async { Ok(Refreshed::found((), "modifying")) })
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Canceled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_error_propagates() {
        let err = conf()
            .wait(&CancellationToken::new(), || async {
                Err::<Refreshed<()>, _>(ReconcileError::InvalidTopology("broken".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidTopology(_)));
    }
}
