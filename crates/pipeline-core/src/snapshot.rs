//! Pipeline state aggregate and its atomic JSON snapshot.
//!
//! `PipelineState` is the single owned root of everything the orchestrator
//! mutates. `StateStore` writes it to a temporary file in the target
//! directory and renames it into place, so a crash leaves either the old or
//! the new snapshot, never a torn one.
//!
//! Terminal tasks leave the live map and are appended to `archive.jsonl`;
//! the snapshot keeps only per-status counts for them. Startup backups go
//! to `backups/`.

use crate::actions::ActionTracker;
use crate::config::Config;
use crate::history::RunHistoryStore;
use crate::intervention::InterventionState;
use crate::types::{Id, Task, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const SNAPSHOT_VERSION: u32 = 1;
pub const SNAPSHOT_FILE: &str = "state.json";
pub const ARCHIVE_FILE: &str = "archive.jsonl";
pub const BACKUP_DIR: &str = "backups";

/// Backups kept in `BACKUP_DIR`; older ones are removed.
pub const MAX_BACKUPS: usize = 10;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to replace snapshot: {0}")]
    Persist(#[from] tempfile::PersistError),
    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u32),
}

pub type Result<T> = std::result::Result<T, SnapshotError>;

/// A forced transition decided after a run, applied at the next resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTransition {
    pub from: String,
    pub to: String,
    pub reason: String,
}

/// Marker for a phase invocation that has started but not been recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InFlight {
    pub task_id: Id,
    pub phase: String,
    pub started_at: DateTime<Utc>,
}

fn snapshot_version() -> u32 {
    SNAPSHOT_VERSION
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineState {
    #[serde(default = "snapshot_version")]
    pub version: u32,
    pub iteration: u64,
    /// Next task creation sequence number.
    pub next_seq: u64,
    pub tasks: BTreeMap<Id, Task>,
    pub history: RunHistoryStore,
    pub actions: ActionTracker,
    /// Consecutive "no work found" reports per phase.
    pub no_work_counts: BTreeMap<String, u32>,
    pub interventions: BTreeMap<String, InterventionState>,
    pub pending_transition: Option<PendingTransition>,
    pub in_flight: Option<InFlight>,
    /// Tasks moved to the archive, by final status.
    pub archived: BTreeMap<TaskStatus, u64>,
}

/// Run totals for one phase.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseSummary {
    pub runs: u64,
    pub successes: u64,
    pub failures: u64,
    pub success_rate: f64,
}

/// Point-in-time overview of the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateSummary {
    pub iteration: u64,
    /// Live and archived tasks.
    pub total_tasks: u64,
    pub status_counts: BTreeMap<TaskStatus, u64>,
    pub awaiting_human: usize,
    pub phases: BTreeMap<String, PhaseSummary>,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            iteration: 0,
            next_seq: 0,
            tasks: BTreeMap::new(),
            history: RunHistoryStore::default(),
            actions: ActionTracker::default(),
            no_work_counts: BTreeMap::new(),
            interventions: BTreeMap::new(),
            pending_transition: None,
            in_flight: None,
            archived: BTreeMap::new(),
        }
    }
}

impl PipelineState {
    pub fn new(config: &Config) -> Self {
        let mut state = Self::default();
        state.apply_limits(config);
        state
    }

    /// Re-apply configured capacities, e.g. after restoring a snapshot.
    pub fn apply_limits(&mut self, config: &Config) {
        self.history.set_max_history(config.max_history);
        self.actions
            .set_limits(config.loop_window_seconds, config.max_action_events);
    }

    /// Insert a task, assigning its creation sequence.
    pub fn add_task(&mut self, mut task: Task) -> Id {
        task.seq = self.next_seq;
        self.next_seq += 1;
        let id = task.id.clone();
        self.tasks.insert(id.clone(), task);
        id
    }

    pub fn task(&self, id: &Id) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn task_mut(&mut self, id: &Id) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    /// Highest priority pending task, oldest first among equals.
    pub fn next_task(&self) -> Option<&Task> {
        self.tasks
            .values()
            .filter(|t| t.is_pending())
            .min_by_key(|t| (Reverse(t.priority), t.seq))
    }

    /// Tasks handed off to a human.
    pub fn awaiting_human(&self) -> impl Iterator<Item = &Task> {
        self.tasks
            .values()
            .filter(|t| t.requires_human && !t.status.is_terminal())
    }

    /// No task is left for automatic processing.
    pub fn is_finished(&self) -> bool {
        self.next_task().is_none()
    }

    pub fn no_work_count(&self, phase: &str) -> u32 {
        self.no_work_counts.get(phase).copied().unwrap_or(0)
    }

    pub fn intervention(&mut self, phase: &str) -> &mut InterventionState {
        self.interventions.entry(phase.to_string()).or_default()
    }

    /// Remove completed and skipped tasks from the live map.
    ///
    /// The removed tasks are returned for the caller to persist; only their
    /// counts stay in the state.
    pub fn archive_terminal(&mut self) -> Vec<Task> {
        let done: Vec<Id> = self
            .tasks
            .values()
            .filter(|t| t.status.is_terminal())
            .map(|t| t.id.clone())
            .collect();
        let mut archived = Vec::with_capacity(done.len());
        for id in done {
            if let Some(task) = self.tasks.remove(&id) {
                *self.archived.entry(task.status).or_insert(0) += 1;
                archived.push(task);
            }
        }
        archived
    }

    pub fn archived_count(&self, status: TaskStatus) -> u64 {
        self.archived.get(&status).copied().unwrap_or(0)
    }

    pub fn summary(&self) -> StateSummary {
        let mut status_counts = self.archived.clone();
        for task in self.tasks.values() {
            *status_counts.entry(task.status).or_insert(0) += 1;
        }
        let phases = self
            .history
            .phases()
            .map(|(name, state)| {
                let summary = PhaseSummary {
                    runs: state.runs,
                    successes: state.successes,
                    failures: state.failures,
                    success_rate: state.success_rate(),
                };
                (name.to_string(), summary)
            })
            .collect();
        StateSummary {
            iteration: self.iteration,
            total_tasks: status_counts.values().sum(),
            status_counts,
            awaiting_human: self.awaiting_human().count(),
            phases,
        }
    }
}

/// Atomic snapshot file at `<state_dir>/state.json`.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(SNAPSHOT_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    pub fn archive_path(&self) -> PathBuf {
        self.dir().join(ARCHIVE_FILE)
    }

    /// Write to a sibling temporary file, then rename over the snapshot.
    pub fn save(&self, state: &PipelineState) -> Result<()> {
        let dir = self.dir();
        std::fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, state)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)?;
        Ok(())
    }

    /// Load the last snapshot, if one exists.
    pub fn load(&self) -> Result<Option<PipelineState>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let state: PipelineState = serde_json::from_str(&content)?;
        if state.version > SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(state.version));
        }
        Ok(Some(state))
    }

    /// Append tasks to the archive, one JSON object per line.
    pub fn archive(&self, tasks: &[Task]) -> Result<()> {
        if tasks.is_empty() {
            return Ok(());
        }
        std::fs::create_dir_all(self.dir())?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.archive_path())?;
        let mut lines = Vec::new();
        for task in tasks {
            serde_json::to_writer(&mut lines, task)?;
            lines.push(b'\n');
        }
        file.write_all(&lines)?;
        file.sync_data()?;
        Ok(())
    }

    /// Archived tasks in archive order. A task archived twice (a crash
    /// between archiving and checkpointing) appears once, at its last entry.
    pub fn load_archive(&self) -> Result<Vec<Task>> {
        let file = match std::fs::File::open(self.archive_path()) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut tasks: Vec<Task> = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let task: Task = serde_json::from_str(&line)?;
            tasks.retain(|t| t.id != task.id);
            tasks.push(task);
        }
        Ok(tasks)
    }

    /// Copy the current snapshot to `backups/state_<timestamp>.json`,
    /// keeping the newest `MAX_BACKUPS`. Returns `None` when there is no
    /// snapshot yet.
    pub fn backup(&self) -> Result<Option<PathBuf>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let backup_dir = self.dir().join(BACKUP_DIR);
        std::fs::create_dir_all(&backup_dir)?;
        let stamp = Utc::now().format("%Y%m%d_%H%M%S_%3f");
        let target = backup_dir.join(format!("state_{stamp}.json"));
        std::fs::copy(&self.path, &target)?;

        let mut backups: Vec<PathBuf> = std::fs::read_dir(&backup_dir)?
            .filter_map(std::result::Result::ok)
            .map(|entry| entry.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("state_") && n.ends_with(".json"))
            })
            .collect();
        backups.sort();
        let excess = backups.len().saturating_sub(MAX_BACKUPS);
        for old in &backups[..excess] {
            std::fs::remove_file(old)?;
        }
        Ok(Some(target))
    }
}
