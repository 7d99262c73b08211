mod config;
mod images;
mod lifecycle;
mod markers;
mod ports;
mod queue;
mod resources;
mod runtime;
mod scheduler;

#[cfg(test)]
mod fakes;
#[cfg(test)]
mod scheduler_tests;

use anyhow::{Context, Result};
use campaign_common::config::{validate_desired_runs, CampaignConfig};
use clap::{Parser, Subcommand};
use images::ImageRegistry;
use lifecycle::RunContext;
use ports::PortAllocator;
use resources::{ProcHost, ResourceMonitor};
use runtime::{DockerRuntime, SandboxRuntime};
use scheduler::Scheduler;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "campaign-runner")]
#[command(about = "Run paired service/tool sandbox experiments under a host resource gate", long_about = None)]
struct Cli {
    /// Configuration file (defaults to config/campaign.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines (and the plan as a JSON document)
    #[arg(long, global = true, default_value = "false")]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute every run still owed to each (service, tool) pair
    Run {
        /// Desired completed runs per pair (1-20)
        #[arg(short = 'n', long)]
        runs: u32,
    },

    /// Show per-pair progress and missing images without launching anything
    Plan {
        /// Desired completed runs per pair (1-20)
        #[arg(short = 'n', long)]
        runs: u32,
    },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let config = match &cli.config {
        Some(path) => config::load(path),
        None => config::load_default(),
    }
    .map_err(|e| {
        error!("Failed to load campaign configuration: {:#}", e);
        e
    })?;

    match cli.command {
        Commands::Run { runs } => run_batch(config, validate_desired_runs(runs)?).await,
        Commands::Plan { runs } => print_plan(config, validate_desired_runs(runs)?, cli.json).await,
    }
}

async fn connect(config: &CampaignConfig) -> Result<Arc<dyn SandboxRuntime>> {
    let docker = DockerRuntime::connect(config.sandbox.stop_timeout_secs)?;
    docker.ping().await.map_err(|e| {
        error!("Docker daemon not reachable: {:#}", e);
        e
    })?;
    info!("Connected to Docker daemon");
    Ok(Arc::new(docker))
}

/// Absolute results root; service sandboxes bind-mount it
fn results_root(config: &CampaignConfig) -> Result<PathBuf> {
    std::fs::create_dir_all(&config.results_dir)
        .with_context(|| format!("Failed to create {}", config.results_dir.display()))?;
    config
        .results_dir
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", config.results_dir.display()))
}

fn build_scheduler(
    config: CampaignConfig,
    runtime: Arc<dyn SandboxRuntime>,
    shutdown: CancellationToken,
) -> Result<Scheduler> {
    let results_root = results_root(&config)?;
    let monitor = ResourceMonitor::new(Arc::new(ProcHost), config.gate.clone());

    let ctx = Arc::new(RunContext {
        images: ImageRegistry::new(runtime.clone(), config.image_prefix.clone()),
        runtime,
        ports: PortAllocator::new(config.ports.clone()),
        config: Arc::new(config),
        results_root,
        shutdown,
    });
    Ok(Scheduler::new(ctx, monitor))
}

async fn run_batch(config: CampaignConfig, runs: u32) -> Result<()> {
    info!("Campaign runner booting...");
    info!(
        tools = ?config.tools,
        max_attempts = config.max_attempts,
        memory_gib = config.sandbox.memory_limit_bytes / (1024 * 1024 * 1024),
        cpus = config.sandbox.cpus(),
        "Loaded campaign configuration"
    );

    let runtime = connect(&config).await?;
    let shutdown = CancellationToken::new();
    let scheduler = build_scheduler(config, runtime, shutdown.clone())?;

    // First Ctrl-C drains gracefully, a second one exits at once
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_err() {
            warn!("Could not install Ctrl-C handler");
            return;
        }
        warn!("Received shutdown signal, stopping admission and in-flight runs...");
        shutdown.cancel();

        if signal::ctrl_c().await.is_ok() {
            error!("Second shutdown signal, exiting without cleanup");
            std::process::exit(130);
        }
    });

    let summary = scheduler.execute(runs).await?;
    if summary.aborted > 0 || summary.interrupted > 0 {
        warn!(
            aborted = summary.aborted,
            interrupted = summary.interrupted,
            "Some runs did not complete; relaunch to resume"
        );
    }

    info!("Campaign runner shutdown complete");
    Ok(())
}

async fn print_plan(config: CampaignConfig, runs: u32, json: bool) -> Result<()> {
    let runtime = connect(&config).await?;
    let scheduler = build_scheduler(config, runtime, CancellationToken::new())?;

    let plan = scheduler.plan(runs).await;
    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }
    if plan.is_empty() {
        println!("No (service, tool) pairs found.");
        return Ok(());
    }

    println!("{:<32} {:<24} {:>9} {:>9}  note", "service", "tool", "completed", "remaining");
    let mut owed = 0;
    for entry in &plan {
        let note = if entry.image_missing { "image missing, skipped" } else { "" };
        if !entry.image_missing {
            owed += entry.progress.remaining;
        }
        println!(
            "{:<32} {:<24} {:>9} {:>9}  {}",
            entry.unit.service, entry.unit.tool, entry.progress.completed, entry.progress.remaining, note
        );
    }
    println!("\n{} run(s) would be dispatched.", owed);
    Ok(())
}
