//! pipelined - phase pipeline daemon
//!
//! Main entry point for the daemon binary.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::path::{Path, PathBuf};

use clap::Parser;
use pipeline_core::Config;
use pipelined::command_phase::command_registry;
use pipelined::orchestrator::StopReason;
use pipelined::{default_state_dir, load_task_seeds, Daemon, DEFAULT_CONFIG_PATH};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "pipelined", about = "Phase pipeline daemon", version)]
struct Cli {
    /// Config file (default: .pipeline/config when present)
    #[arg(short, long, env = "PIPELINE_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for the state snapshot and event log
    #[arg(long, env = "PIPELINE_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Stop after this many iterations (0 = unlimited)
    #[arg(long)]
    max_iterations: Option<u64>,

    /// JSON array of tasks to queue before running
    #[arg(long)]
    tasks: Option<PathBuf>,

    /// Skip a task by id, then exit
    #[arg(long, value_name = "TASK_ID")]
    skip: Option<String>,

    /// Reason recorded with --skip
    #[arg(long, requires = "skip")]
    reason: Option<String>,

    /// Return a task handed to a human to automatic selection, then exit
    #[arg(long, value_name = "TASK_ID", conflicts_with = "skip")]
    release: Option<String>,

    /// Phase the released task resumes in
    #[arg(long, value_name = "PHASE", requires = "release")]
    release_phase: Option<String>,

    /// Print the state summary as JSON, then exit
    #[arg(long)]
    summary: bool,
}

impl Cli {
    /// Operator commands act on the checkpoint without running phases.
    fn is_admin(&self) -> bool {
        self.skip.is_some() || self.release.is_some() || self.summary
    }
}

/// Load the config file and apply CLI overrides.
fn load_config(cli: &Cli) -> eyre::Result<Config> {
    let default_path = Path::new(DEFAULT_CONFIG_PATH);
    let config_path = match &cli.config {
        Some(path) => Some(path.clone()),
        None if default_path.exists() => Some(default_path.to_path_buf()),
        None => None,
    };

    let mut config = match &config_path {
        Some(path) => {
            let mut config = Config::from_file(path)?;
            // Relative paths resolve against the directory holding `.pipeline/`.
            let root = path
                .parent()
                .and_then(Path::parent)
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            config.resolve_paths(root);
            config
        }
        None => Config {
            state_dir: default_state_dir(),
            ..Config::default()
        },
    };

    if let Some(state_dir) = &cli.state_dir {
        config.state_dir.clone_from(state_dir);
    }
    if let Some(max_iterations) = cli.max_iterations {
        config.max_iterations = max_iterations;
    }
    Ok(config)
}

async fn run(cli: Cli) -> eyre::Result<()> {
    let config = load_config(&cli)?;
    let registry = command_registry(&config);
    let daemon = Daemon::new(config, registry).await?;

    if let Some(path) = &cli.tasks {
        let added = daemon.seed(load_task_seeds(path)?).await?;
        info!(added, "queued tasks from {}", path.display());
    }

    if let Some(task_id) = &cli.skip {
        let reason = cli.reason.as_deref().unwrap_or("skipped by operator");
        daemon.skip(task_id, reason).await?;
    }
    if let Some(task_id) = &cli.release {
        if !daemon.release(task_id, cli.release_phase.as_deref()).await? {
            warn!(task_id = %task_id, "task was not awaiting a human");
        }
    }
    if cli.summary {
        println!("{}", serde_json::to_string_pretty(&daemon.summary().await)?);
    }
    if cli.is_admin() {
        return Ok(());
    }

    let pipeline = daemon.run();
    tokio::pin!(pipeline);

    #[cfg(unix)]
    let result = {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            result = &mut pipeline => result,
            _ = sigint.recv() => {
                info!("received SIGINT, initiating graceful shutdown");
                daemon.shutdown();
                pipeline.await
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, initiating graceful shutdown");
                daemon.shutdown();
                pipeline.await
            }
        }
    };

    #[cfg(not(unix))]
    let result = {
        tokio::select! {
            result = &mut pipeline => result,
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, initiating graceful shutdown");
                daemon.shutdown();
                pipeline.await
            }
        }
    };

    let summary = result?;
    info!(
        iterations = summary.iterations,
        awaiting_human = summary.awaiting_human.len(),
        "pipeline stopped: {}",
        match summary.reason {
            StopReason::Finished => "no pending tasks",
            StopReason::MaxIterations => "iteration limit reached",
            StopReason::Shutdown => "shutdown",
        }
    );
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    // Initialize tracing.
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    if let Err(e) = runtime.block_on(run(cli)) {
        error!("pipelined failed: {e:#}");
        std::process::exit(1);
    }
}
