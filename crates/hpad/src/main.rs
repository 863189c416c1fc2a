//! hpad — the horizontal autoscaler daemon.
//!
//! Assembles the decision engine and the controller loop:
//! - `validate` checks a controller config file
//! - `simulate` replays a scenario on a manual clock, one JSON line per decision
//! - `run` drives the live controller against a scenario's in-memory world
//!
//! # Usage
//!
//! ```text
//! hpad validate --config hpad.toml
//! hpad simulate --config hpad.toml --scenario scenarios/burst.toml
//! hpad run --scenario scenarios/burst.toml
//! ```

mod scenario;
mod simulate;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use hpa_controller::Controller;
use hpa_core::ControllerConfig;
use hpa_core::duration::format_duration;
use hpa_engine::SystemClock;

use crate::scenario::Scenario;
use crate::simulate::World;

#[derive(Parser)]
#[command(name = "hpad", about = "Horizontal autoscaler daemon")]
struct Cli {
    /// Emit logs as JSON.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check a controller config file and print the effective settings.
    Validate {
        /// Controller config (TOML).
        #[arg(long)]
        config: PathBuf,
    },

    /// Replay a scenario through the reconciler on a simulated clock.
    Simulate {
        /// Controller config (TOML); defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Scenario file (TOML).
        #[arg(long)]
        scenario: PathBuf,

        /// Autoscalers reconciled concurrently per step; defaults to the
        /// config's worker count.
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Run the controller in real time against a scenario's world.
    Run {
        /// Controller config (TOML); defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Scenario file (TOML). Step offsets are applied in wall-clock time.
        #[arg(long)]
        scenario: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Validate { config } => validate(&config),
        Command::Simulate {
            config,
            scenario,
            workers,
        } => run_simulation(config.as_deref(), &scenario, workers).await,
        Command::Run { config, scenario } => run_live(config.as_deref(), &scenario).await,
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,hpad=debug,hpa=debug"));
    // Logs go to stderr so simulate output stays machine-readable.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<ControllerConfig> {
    match path {
        Some(path) => ControllerConfig::from_file(path)
            .with_context(|| format!("invalid config {}", path.display())),
        None => Ok(ControllerConfig::default()),
    }
}

fn validate(path: &Path) -> anyhow::Result<()> {
    let config = load_config(Some(path))?;
    info!(path = %path.display(), "config is valid");
    print!("{}", config.to_toml_string()?);
    Ok(())
}

async fn run_simulation(
    config: Option<&Path>,
    scenario: &Path,
    workers: Option<usize>,
) -> anyhow::Result<()> {
    let config = load_config(config)?;
    let scenario = Scenario::from_file(scenario)?;
    let workers = workers.unwrap_or(config.workers);
    info!(
        autoscalers = scenario.autoscalers.len(),
        steps = scenario.steps.len(),
        workers,
        "simulation starting"
    );

    let decisions = simulate::simulate(config, &scenario, workers).await?;
    for decision in &decisions {
        println!("{}", serde_json::to_string(decision)?);
    }
    info!(decisions = decisions.len(), "simulation finished");
    Ok(())
}

async fn run_live(config: Option<&Path>, scenario: &Path) -> anyhow::Result<()> {
    let config = Arc::new(load_config(config)?);
    let scenario = Scenario::from_file(scenario)?;
    let sync_period = config.sync_period;

    let world = World::seed(config, &scenario, Arc::new(SystemClock)).await;
    let controller = Arc::new(Controller::new(world.reconciler.clone(), world.plane.clone()));

    // ── Shutdown signal ────────────────────────────────────────

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
        }
        signal.cancel();
    });

    let handle = tokio::spawn(controller.run(shutdown.clone()));

    // ── Feed the timeline ──────────────────────────────────────

    let started = tokio::time::Instant::now();
    for step in &scenario.steps {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep_until(started + step.at) => {}
        }
        for reading in &step.readings {
            world
                .metrics
                .set(&reading.autoscaler, &reading.metric, reading.to_reading()?)
                .await;
        }
        info!(at = %format_duration(step.at), readings = step.readings.len(), "step applied");
    }

    // Give the last readings one resync before stopping on our own.
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::time::sleep(sync_period + Duration::from_secs(1)) => shutdown.cancel(),
    }

    handle.await?;
    for a in &scenario.autoscalers {
        let replicas = world
            .plane
            .scale_of(a.key.namespace(), &a.spec.scale_target_ref)
            .await;
        info!(autoscaler = %a.key, ?replicas, "final scale");
    }
    Ok(())
}
