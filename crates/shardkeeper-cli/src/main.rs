//! Shardkeeper CLI
//!
//! Offline planning and simulated reconciliation of cache cluster topologies.
//! Inputs are YAML (or JSON) files holding an observed [`Topology`] and a
//! [`DesiredShape`].
//!
//! [`Topology`]: shardkeeper::Topology
//! [`DesiredShape`]: shardkeeper::DesiredShape

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{PlanArgs, SimulateArgs};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;

/// Shardkeeper
#[derive(Parser, Debug)]
#[command(name = "shardkeeper")]
#[command(about = "Plan and simulate cache cluster topology reconciliation")]
#[command(version)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: Level,

    /// Enable JSON log format
    #[arg(long, env = "LOG_JSON", default_value = "false", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the plan that moves the observed topology to the desired shape
    Plan(PlanArgs),
    /// Run a full reconciliation against a simulated control plane
    Simulate(SimulateArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let output = match args.command {
        Command::Plan(plan) => commands::plan(&plan)?,
        Command::Simulate(simulate) => {
            if let Some(addr) = simulate.metrics_addr {
                start_metrics_exporter(addr)?;
            }

            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, cancelling reconciliation");
                    trigger.cancel();
                }
            });

            commands::simulate(&simulate, &cancel).await?
        }
    };

    print!("{}", output);
    Ok(())
}

/// Initialize logging subsystem
fn init_logging(args: &Args) {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_writer(std::io::stderr);

    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Install the Prometheus exporter with its HTTP listener
fn start_metrics_exporter(addr: std::net::SocketAddr) -> Result<()> {
    use anyhow::Context;
    use metrics_exporter_prometheus::PrometheusBuilder;

    info!(address = %addr, "Starting metrics exporter");
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plan() {
        let args = Args::try_parse_from([
            "shardkeeper",
            "plan",
            "--observed",
            "observed.yaml",
            "--desired",
            "desired.yaml",
            "--output",
            "json",
        ])
        .unwrap();
        assert_eq!(args.log_level, Level::INFO);
        match args.command {
            Command::Plan(plan) => {
                assert_eq!(plan.input.observed.to_str(), Some("observed.yaml"));
                assert_eq!(plan.input.output, commands::OutputFormat::Json);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_simulate_with_global_flags() {
        let args = Args::try_parse_from([
            "shardkeeper",
            "simulate",
            "--observed",
            "o.yaml",
            "--desired",
            "d.yaml",
            "--timeout-ms",
            "500",
            "--settle-polls",
            "4",
            "--allow-drift",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(args.log_level, Level::DEBUG);
        match args.command {
            Command::Simulate(simulate) => {
                assert_eq!(simulate.timeout_ms, Some(500));
                assert_eq!(simulate.settle_polls, 4);
                assert!(simulate.allow_drift);
                assert!(simulate.metrics_addr.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_missing_inputs_rejected() {
        assert!(Args::try_parse_from(["shardkeeper", "plan", "--observed", "o.yaml"]).is_err());
        assert!(Args::try_parse_from(["shardkeeper"]).is_err());
    }
}
