//! pipelined - phase pipeline daemon
//!
//! Library components for the daemon process.

pub mod command_phase;
pub mod event_log;
pub mod orchestrator;
pub mod phase;

use std::path::{Path, PathBuf};

use event_log::{EventLog, EVENT_LOG_FILE};
use orchestrator::{Orchestrator, RunSummary};
use phase::PhaseRegistry;
use pipeline_core::snapshot::StateSummary;
use pipeline_core::{Config, Id, StateStore, Task};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default config file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = ".pipeline/config";

/// Get the fallback state directory (~/.local/share/pipelined).
pub fn default_state_dir() -> PathBuf {
    let data_dir = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".local/share")
        });
    data_dir.join("pipelined")
}

/// A task as listed in a seed file.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskSeed {
    pub description: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub priority: i32,
}

impl TaskSeed {
    pub fn into_task(self) -> Task {
        let task = Task::new(self.description, self.target, self.priority);
        match self.phase {
            Some(phase) => task.with_phase(phase),
            None => task,
        }
    }
}

/// Read a JSON array of task seeds.
pub fn load_task_seeds(path: &Path) -> eyre::Result<Vec<TaskSeed>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| eyre::eyre!("failed to read task file {}: {e}", path.display()))?;
    let seeds = serde_json::from_str(&content)
        .map_err(|e| eyre::eyre!("invalid task file {}: {e}", path.display()))?;
    Ok(seeds)
}

/// Daemon state.
#[derive(Debug)]
pub struct Daemon {
    orchestrator: Mutex<Orchestrator>,
    shutdown: CancellationToken,
}

impl Daemon {
    /// Build the orchestrator from `config` and `registry`, open the state
    /// directory and recover the last checkpoint.
    pub async fn new(config: Config, registry: PhaseRegistry) -> eyre::Result<Self> {
        let state_dir = config.state_dir.clone();
        std::fs::create_dir_all(&state_dir).map_err(|e| {
            eyre::eyre!("failed to create state dir {}: {e}", state_dir.display())
        })?;

        let event_log = if config.event_log {
            let log = EventLog::new(&state_dir.join(EVENT_LOG_FILE)).await?;
            log.migrate_embedded().await?;
            Some(log)
        } else {
            None
        };

        let store = StateStore::new(&state_dir);
        if config.backup_on_start {
            if let Some(path) = store.backup()? {
                info!(backup = %path.display(), "backed up previous checkpoint");
            }
        }

        let mut orchestrator = Orchestrator::new(config, registry)?.with_store(store);
        if let Some(log) = event_log {
            orchestrator = orchestrator.with_event_log(log);
        }

        if orchestrator.resume().await? {
            info!(state_dir = %state_dir.display(), "resumed from checkpoint");
        }

        Ok(Self {
            orchestrator: Mutex::new(orchestrator),
            shutdown: CancellationToken::new(),
        })
    }

    /// Queue tasks that are not already known by description and target,
    /// live or archived.
    pub async fn seed(&self, seeds: Vec<TaskSeed>) -> eyre::Result<usize> {
        let mut orchestrator = self.orchestrator.lock().await;
        let archived = orchestrator.archived_tasks()?;
        let mut added = 0;
        for seed in seeds {
            let known = orchestrator
                .state()
                .tasks
                .values()
                .chain(archived.iter())
                .any(|t| t.description == seed.description && t.target == seed.target);
            if known {
                continue;
            }
            orchestrator.add_task(seed.into_task())?;
            added += 1;
        }
        if added > 0 {
            orchestrator.checkpoint()?;
        }
        Ok(added)
    }

    /// Run the pipeline until it finishes, hits the iteration limit or is
    /// shut down.
    pub async fn run(&self) -> eyre::Result<RunSummary> {
        let mut orchestrator = self.orchestrator.lock().await;
        {
            let config = orchestrator.config();
            info!("pipelined starting");
            info!("state dir: {}", config.state_dir.display());
            info!("initial phase: {}", config.initial_phase);
            if config.max_iterations > 0 {
                info!("max iterations: {}", config.max_iterations);
            }
        }

        let summary = orchestrator.run(&self.shutdown).await?;
        for task_id in &summary.awaiting_human {
            if let Some(task) = orchestrator.state().task(task_id) {
                warn!(task_id = %task_id, phase = %task.phase, "task awaiting human: {}", task.description);
            }
        }
        let state = orchestrator.state().summary();
        for (phase, totals) in &state.phases {
            info!(
                phase = %phase,
                runs = totals.runs,
                successes = totals.successes,
                failures = totals.failures,
                "phase totals"
            );
        }
        info!(total_tasks = state.total_tasks, counts = ?state.status_counts, "task totals");
        Ok(summary)
    }

    /// Skip a live task for good.
    pub async fn skip(&self, task_id: &str, reason: &str) -> eyre::Result<()> {
        let mut orchestrator = self.orchestrator.lock().await;
        orchestrator
            .skip_task(&Id::from_string(task_id), reason)
            .await?;
        Ok(())
    }

    /// Return a task handed to a human to automatic selection.
    pub async fn release(&self, task_id: &str, phase: Option<&str>) -> eyre::Result<bool> {
        let mut orchestrator = self.orchestrator.lock().await;
        Ok(orchestrator.release_task(&Id::from_string(task_id), phase)?)
    }

    pub async fn summary(&self) -> StateSummary {
        self.orchestrator.lock().await.state().summary()
    }

    /// Request graceful shutdown. The in-flight phase is cancelled and its
    /// outcome recorded before `run` returns.
    pub fn shutdown(&self) {
        info!("shutdown requested");
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
