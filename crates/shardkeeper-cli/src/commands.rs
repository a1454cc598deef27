//! `plan` and `simulate` subcommands

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::de::DeserializeOwned;
use serde::Serialize;
use shardkeeper::planner;
use shardkeeper::{
    DesiredShape, MemoryControlPlane, Plan, ReconcileConfig, ReconcileOptions, Reconciler,
    Topology,
};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Output format
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Yaml,
    Json,
}

/// Inputs shared by all subcommands
#[derive(clap::Args, Debug)]
pub struct InputArgs {
    /// Observed topology (YAML or JSON)
    #[arg(long)]
    pub observed: PathBuf,

    /// Desired shape (YAML or JSON)
    #[arg(long)]
    pub desired: PathBuf,

    /// Output format
    #[arg(long, value_enum, default_value = "yaml")]
    pub output: OutputFormat,
}

#[derive(clap::Args, Debug)]
pub struct PlanArgs {
    #[command(flatten)]
    pub input: InputArgs,
}

#[derive(clap::Args, Debug)]
pub struct SimulateArgs {
    #[command(flatten)]
    pub input: InputArgs,

    /// Reconcile configuration file (YAML or JSON)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// End-to-end timeout override
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Poll interval floor override
    #[arg(long)]
    pub poll_interval_ms: Option<u64>,

    /// Initial delay before each poll loop override
    #[arg(long)]
    pub initial_delay_ms: Option<u64>,

    /// Polls a simulated change stays in flight
    #[arg(long, default_value_t = 2)]
    pub settle_polls: u32,

    /// Tolerate post-plan drift
    #[arg(long)]
    pub allow_drift: bool,

    /// Prometheus exporter address
    #[arg(long, env = "METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,
}

#[derive(Serialize)]
struct PlanReport<'a> {
    resource_id: &'a str,
    observed: String,
    plan: &'a Plan,
    projected: &'a Topology,
}

#[derive(Serialize)]
struct SimulationReport<'a> {
    resource_id: &'a str,
    mutations: usize,
    topology: &'a Topology,
}

/// Read a YAML or JSON file
fn load<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}

fn render<T: Serialize>(value: &T, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Yaml => serde_yaml::to_string(value).context("Failed to render YAML"),
        OutputFormat::Json => serde_json::to_string_pretty(value)
            .map(|json| json + "\n")
            .context("Failed to render JSON"),
    }
}

/// Plan without touching anything
pub fn plan(args: &PlanArgs) -> Result<String> {
    let observed: Topology = load(&args.input.observed)?;
    let desired: DesiredShape = load(&args.input.desired)?;

    let plan = planner::plan(&observed, &desired).context("Planning failed")?;
    let projected = plan.project(&observed).context("Plan does not apply")?;
    info!(steps = plan.len(), plan = %plan, "Planned");

    render(
        &PlanReport {
            resource_id: &observed.resource_id,
            observed: observed.summary(),
            plan: &plan,
            projected: &projected,
        },
        args.input.output,
    )
}

/// Simulation timings: the in-memory plane settles by poll count, not wall time
fn simulation_config() -> ReconcileConfig {
    ReconcileConfig::default()
        .with_min_poll_interval(Duration::from_millis(100))
        .with_max_poll_interval(Duration::from_secs(1))
        .with_initial_delay(Duration::ZERO)
}

fn build_config(args: &SimulateArgs) -> Result<ReconcileConfig> {
    let mut config = match &args.config {
        Some(path) => load(path)?,
        None => simulation_config(),
    };
    if let Some(timeout_ms) = args.timeout_ms {
        config.timeout_ms = timeout_ms;
    }
    if let Some(interval_ms) = args.poll_interval_ms {
        config.min_poll_interval_ms = interval_ms;
        config.max_poll_interval_ms = config.max_poll_interval_ms.max(interval_ms);
    }
    if let Some(delay_ms) = args.initial_delay_ms {
        config.initial_delay_ms = delay_ms;
    }
    if args.allow_drift {
        config.allowed_drift = true;
    }
    config.check().context("Invalid configuration")?;
    Ok(config)
}

/// Reconcile against a simulated control plane seeded with the observed topology
pub async fn simulate(args: &SimulateArgs, cancel: &CancellationToken) -> Result<String> {
    let observed: Topology = load(&args.input.observed)?;
    let desired: DesiredShape = load(&args.input.desired)?;
    let config = build_config(args)?;
    debug!(config = ?config, "Simulation configuration");

    let resource_id = observed.resource_id.clone();
    let plane = MemoryControlPlane::new().with_settle_polls(args.settle_polls);
    plane.insert(observed);

    let reconciler =
        Reconciler::new(Arc::new(plane.clone()), config).context("Invalid configuration")?;
    let topology = reconciler
        .reconcile(cancel, &resource_id, &desired, &ReconcileOptions::default())
        .await
        .context("Reconciliation failed")?;

    let mutations = plane.calls().iter().filter(|c| c.is_mutation()).count();
    render(
        &SimulationReport {
            resource_id: &resource_id,
            mutations,
            topology: &topology,
        },
        args.input.output,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn observed_file(topology: &Topology) -> NamedTempFile {
        file(&serde_yaml::to_string(topology).unwrap())
    }

    fn input(observed: &NamedTempFile, desired: &NamedTempFile, output: OutputFormat) -> InputArgs {
        InputArgs {
            observed: observed.path().to_path_buf(),
            desired: desired.path().to_path_buf(),
            output,
        }
    }

    fn simulate_args(input: InputArgs) -> SimulateArgs {
        SimulateArgs {
            input,
            config: None,
            timeout_ms: Some(10_000),
            poll_interval_ms: Some(5),
            initial_delay_ms: None,
            settle_polls: 1,
            allow_drift: false,
            metrics_addr: None,
        }
    }

    #[test]
    fn test_plan_command_json() {
        let observed = observed_file(&Topology::clustered("cache", 3, 2));
        let desired = file("num_node_groups: 2\nreplicas_per_node_group: 1\n");

        let output = plan(&PlanArgs {
            input: input(&observed, &desired, OutputFormat::Json),
        })
        .unwrap();

        let report: serde_json::Value = serde_json::from_str(&output).unwrap();
        let steps = report["plan"].as_array().unwrap();
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[2]["op"], "remove_node_groups");
        assert_eq!(report["projected"]["node_groups"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_plan_command_reports_invalid_shape() {
        let observed = observed_file(&Topology::flat("cache", 2));
        let desired = file("total_members: 2\nnum_node_groups: 2\n");

        let err = plan(&PlanArgs {
            input: input(&observed, &desired, OutputFormat::Yaml),
        })
        .unwrap_err();
        assert!(format!("{err:#}").contains("mutually exclusive"));
    }

    #[test]
    fn test_load_reports_missing_file() {
        let err = load::<Topology>(Path::new("/nonexistent/observed.yaml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read"));
    }

    #[test]
    fn test_build_config_overrides() {
        let observed = observed_file(&Topology::flat("cache", 2));
        let desired = file("total_members: 3\n");
        let config_file = file("timeout_ms: 60000\nmin_poll_interval_ms: 2000\nmax_poll_interval_ms: 4000\n");

        let mut args = simulate_args(input(&observed, &desired, OutputFormat::Yaml));
        args.config = Some(config_file.path().to_path_buf());
        args.poll_interval_ms = Some(8000);
        args.allow_drift = true;

        let config = build_config(&args).unwrap();
        assert_eq!(config.timeout_ms, 10_000);
        assert_eq!(config.min_poll_interval_ms, 8000);
        assert_eq!(config.max_poll_interval_ms, 8000);
        assert!(config.allowed_drift);
    }

    #[tokio::test]
    async fn test_simulate_command() {
        let observed = observed_file(&Topology::flat("cache", 2));
        let desired = file("{\"total_members\": 4}");

        let output = simulate(
            &simulate_args(input(&observed, &desired, OutputFormat::Yaml)),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let report: serde_yaml::Value = serde_yaml::from_str(&output).unwrap();
        assert_eq!(report["mutations"], serde_yaml::Value::from(1));
        assert_eq!(
            report["topology"]["node_groups"][0]["members"]
                .as_sequence()
                .unwrap()
                .len(),
            4
        );
    }

    #[tokio::test]
    async fn test_simulate_cancelled() {
        let observed = observed_file(&Topology::flat("cache", 2));
        let desired = file("total_members: 3\n");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = simulate(
            &simulate_args(input(&observed, &desired, OutputFormat::Yaml)),
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(format!("{err:#}").contains("canceled"));
    }
}
