//! Reconciliation orchestrator
//!
//! [`Reconciler`] composes planner, executor and waiter into the end-to-end
//! "move this resource to the desired shape" operation:
//!
//! 1. Observe the live topology (waiting first if a change is already in flight)
//! 2. Plan; an empty plan returns the observation with zero mutations
//! 3. For each step: execute (retrying transient failures), then wait until the
//!    resource is stable again. Each step gets the remaining budget divided by
//!    the remaining step count.
//! 4. Re-observe and verify the result matches the desired shape exactly
//!
//! A failure at any point stops the run. Nothing is rolled back; the returned
//! [`ReconcileFailure`] says how many steps completed and carries the last
//! topology seen, and the caller re-reconciles from a fresh observation.

use crate::client::ControlPlane;
use crate::config::{ReconcileConfig, ReconcileOptions};
use crate::error::{ReconcileError, ReconcileFailure, Result};
use crate::executor::{self, classify, ErrorClass};
use crate::observability::ReconcileMetrics;
use crate::plan::{Plan, Step};
use crate::planner;
use crate::retry::retry;
use crate::shape::DesiredShape;
use crate::status::Status;
use crate::topology::{validate_resource_id, Topology};
use crate::waiter::{Refreshed, StateChangeConf};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Drives one resource to a desired shape through a [`ControlPlane`]
///
/// Holds no per-resource state; one `Reconciler` can serve concurrent
/// reconciliations of different resources.
pub struct Reconciler<C: ?Sized> {
    client: Arc<C>,
    config: ReconcileConfig,
}

impl<C> Reconciler<C>
where
    C: ControlPlane + ?Sized,
{
    /// Create a reconciler; fails if the configuration is invalid
    pub fn new(client: Arc<C>, config: ReconcileConfig) -> Result<Self> {
        config.check()?;
        Ok(Self { client, config })
    }

    /// Active configuration
    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Injected control-plane client
    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    /// Move `resource_id` to `desired`
    #[instrument(skip_all, fields(resource_id = %resource_id))]
    pub async fn reconcile(
        &self,
        cancel: &CancellationToken,
        resource_id: &str,
        desired: &DesiredShape,
        opts: &ReconcileOptions,
    ) -> std::result::Result<Topology, ReconcileFailure> {
        let started = Instant::now();
        ReconcileMetrics::increment_reconciliations();

        let result = self.run(cancel, resource_id, desired, opts).await;

        ReconcileMetrics::record_reconcile_duration(started.elapsed());
        match &result {
            Ok(topology) => info!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                shape = %topology.summary(),
                "Reconciliation complete"
            ),
            Err(failure) => {
                ReconcileMetrics::increment_errors(failure.error.kind());
                debug!(error = %failure, "Reconciliation failed");
            }
        }
        result
    }

    async fn run(
        &self,
        cancel: &CancellationToken,
        resource_id: &str,
        desired: &DesiredShape,
        opts: &ReconcileOptions,
    ) -> std::result::Result<Topology, ReconcileFailure> {
        validate_resource_id(resource_id)?;
        let layout = desired.layout()?;

        let budget = opts.timeout.unwrap_or_else(|| self.config.timeout());
        let deadline = Instant::now() + budget;
        info!(desired = %layout, budget_ms = budget.as_millis() as u64, "Reconciling");

        let observed = self.observe_stable(cancel, resource_id, deadline).await?;

        if let Some(last_known) = opts.last_known_members {
            let live = observed.member_count();
            if live < last_known {
                info!(
                    last_known,
                    live,
                    "Members disappeared out-of-band, planning from live topology"
                );
                ReconcileMetrics::add_vanished_members(last_known - live);
            }
        }

        let plan = match planner::plan(&observed, desired) {
            Ok(plan) => plan,
            Err(e) => return Err(ReconcileFailure::new(e).with_observed(Some(observed))),
        };
        if plan.is_empty() {
            debug!(shape = %observed.summary(), "Topology already matches");
            return Ok(observed);
        }

        let total = plan.len();
        ReconcileMetrics::set_plan_steps(total);
        info!(steps = total, plan = %plan, "Executing plan");

        let mut last_observed = observed;
        for (index, step) in plan.iter().enumerate() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let step_budget = remaining / (total - index) as u32;
            match self
                .apply_step(cancel, resource_id, index, step, step_budget)
                .await
            {
                Ok(topology) => last_observed = topology,
                Err(e) => {
                    return Err(ReconcileFailure::new(e)
                        .with_progress(index, total)
                        .with_observed(Some(last_observed)))
                }
            }
        }

        let final_topology = match self
            .bounded(cancel, deadline, budget, self.observe(cancel, resource_id))
            .await
        {
            Ok(topology) => topology,
            Err(e) => {
                return Err(ReconcileFailure::new(e)
                    .with_progress(total, total)
                    .with_observed(Some(last_observed)))
            }
        };

        let primary = desired.primary_member.as_deref();
        if !final_topology.satisfies(&layout, primary) {
            ReconcileMetrics::increment_drift();
            let expected = match primary {
                Some(primary) => format!("{} with primary {}", layout, primary),
                None => layout.to_string(),
            };
            let observed = final_topology.summary();
            if !self.config.allowed_drift {
                return Err(ReconcileFailure::new(ReconcileError::Drift { expected, observed })
                    .with_progress(total, total)
                    .with_observed(Some(final_topology)));
            }
            warn!(
                expected = %expected,
                observed = %observed,
                "Topology drifted after plan execution, continuing"
            );
        }

        Ok(final_topology)
    }

    /// Execute one step, then wait for the resource to settle
    #[instrument(skip_all, fields(step = index + 1, kind = step.kind(), budget_ms = budget.as_millis() as u64))]
    async fn apply_step(
        &self,
        cancel: &CancellationToken,
        resource_id: &str,
        index: usize,
        step: &Step,
        budget: Duration,
    ) -> Result<Topology> {
        let started = Instant::now();
        let step_deadline = started + budget;
        ReconcileMetrics::increment_steps(step.kind());

        let outcome = self
            .bounded(
                cancel,
                step_deadline,
                budget,
                retry(&self.config.step_retry, cancel, step.kind(), || {
                    executor::execute(self.client.as_ref(), resource_id, step)
                }),
            )
            .await?;
        info!(step = %step, outcome = ?outcome, "Step accepted");

        let remaining = step_deadline.saturating_duration_since(Instant::now());
        let topology = self
            .await_stable(
                cancel,
                resource_id,
                remaining,
                format!("{} after {}", resource_id, step.kind()),
            )
            .await?;

        ReconcileMetrics::record_step_duration(step.kind(), started.elapsed());
        Ok(topology)
    }

    /// Observe, waiting out any change that is already in flight
    ///
    /// A failure carries the last topology read before it.
    async fn observe_stable(
        &self,
        cancel: &CancellationToken,
        resource_id: &str,
        deadline: Instant,
    ) -> std::result::Result<Topology, ReconcileFailure> {
        let budget = deadline.saturating_duration_since(Instant::now());
        let observed = self
            .bounded(cancel, deadline, budget, self.observe(cancel, resource_id))
            .await?;

        let status = observed.stability_status();
        if status.is_available() {
            return Ok(observed);
        }
        if !status.is_transitional() {
            return Err(ReconcileFailure::new(ReconcileError::UnexpectedState {
                state: status.to_string(),
                expected: Status::available_target(),
            })
            .with_observed(Some(observed)));
        }

        debug!(status = %status, "Change already in flight, waiting before planning");
        let remaining = deadline.saturating_duration_since(Instant::now());
        let last_seen = Mutex::new(observed);
        let waited = {
            let last_seen = &last_seen;
            self.stable_conf(remaining, resource_id.to_string())
                .wait(cancel, move || async move {
                    let refreshed = self.refresh(cancel, resource_id).await?;
                    if let Refreshed::Found { resource, .. } = &refreshed {
                        *last_seen.lock() = resource.clone();
                    }
                    Ok::<_, ReconcileError>(refreshed)
                })
                .await
        };
        match waited {
            Ok(Some(topology)) => Ok(topology),
            Ok(None) => Err(ReconcileError::NotFound(resource_id.to_string()).into()),
            Err(e) => Err(ReconcileFailure::new(e).with_observed(Some(last_seen.into_inner()))),
        }
    }

    fn stable_conf(&self, timeout: Duration, subject: String) -> StateChangeConf {
        StateChangeConf::from_config(&self.config, Status::stabilizing(), Status::available_target())
            .with_timeout(timeout)
            .with_subject(subject)
    }

    async fn await_stable(
        &self,
        cancel: &CancellationToken,
        resource_id: &str,
        timeout: Duration,
        subject: String,
    ) -> Result<Topology> {
        self.stable_conf(timeout, subject)
            .wait(cancel, || self.refresh(cancel, resource_id))
            .await?
            .ok_or_else(|| ReconcileError::NotFound(resource_id.to_string()))
    }

    /// Wait until the resource is available
    #[instrument(skip(self, cancel))]
    pub async fn await_available(
        &self,
        cancel: &CancellationToken,
        resource_id: &str,
    ) -> Result<Topology> {
        validate_resource_id(resource_id)?;
        self.await_stable(
            cancel,
            resource_id,
            self.config.timeout(),
            resource_id.to_string(),
        )
        .await
    }

    /// Wait until the resource no longer exists
    #[instrument(skip(self, cancel))]
    pub async fn await_deletion(&self, cancel: &CancellationToken, resource_id: &str) -> Result<()> {
        validate_resource_id(resource_id)?;
        let conf = StateChangeConf::from_config(&self.config, Status::vanishing(), Vec::new())
            .with_subject(resource_id);
        conf.wait(cancel, || self.refresh(cancel, resource_id))
            .await
            .map(|_| ())
    }

    /// Observe and plan without changing anything
    #[instrument(skip(self, cancel, desired))]
    pub async fn plan(
        &self,
        cancel: &CancellationToken,
        resource_id: &str,
        desired: &DesiredShape,
    ) -> Result<(Topology, Plan)> {
        validate_resource_id(resource_id)?;
        desired.layout()?;
        let budget = self.config.timeout();
        let observed = self
            .bounded(
                cancel,
                Instant::now() + budget,
                budget,
                self.observe(cancel, resource_id),
            )
            .await?;
        let plan = planner::plan(&observed, desired)?;
        Ok((observed, plan))
    }

    /// One observation, retrying transient read failures
    async fn observe(&self, cancel: &CancellationToken, resource_id: &str) -> Result<Topology> {
        retry(&self.config.step_retry, cancel, "describe_topology", || {
            self.describe(resource_id)
        })
        .await
    }

    /// Poll used by the waiter
    async fn refresh(&self, cancel: &CancellationToken, resource_id: &str) -> Result<Refreshed<Topology>> {
        match self.observe(cancel, resource_id).await {
            Ok(topology) => {
                let status = topology.stability_status().to_string();
                Ok(Refreshed::found(topology, status))
            }
            Err(e) if e.is_not_found() => Ok(Refreshed::NotFound),
            Err(e) => Err(e),
        }
    }

    async fn describe(&self, resource_id: &str) -> Result<Topology> {
        self.client
            .describe_topology(resource_id)
            .await
            .map_err(|source| match classify(&source) {
                ErrorClass::NotFound => {
                    ReconcileError::NotFound(format!("{}: {}", resource_id, source))
                }
                ErrorClass::Transient => ReconcileError::TransientClient {
                    operation: "describe_topology",
                    source,
                },
                ErrorClass::Fatal => ReconcileError::FatalClient {
                    operation: "describe_topology",
                    source,
                },
            })
    }

    /// Run `fut` until it completes, `deadline` passes, or `cancel` fires
    async fn bounded<T, F>(
        &self,
        cancel: &CancellationToken,
        deadline: Instant,
        budget: Duration,
        fut: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ReconcileError::Canceled),
            result = timeout_at(deadline, fut) => match result {
                Ok(result) => result,
                Err(_) => Err(ReconcileError::Timeout {
                    last_state: None,
                    expected: Status::available_target(),
                    timeout: budget,
                }),
            },
        }
    }
}
