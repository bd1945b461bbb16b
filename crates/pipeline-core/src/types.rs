//! Core types for the phase pipeline.
//!
//! Tasks, run records, action events and phase outcomes shared by the
//! decision layer and the executor.

use crate::history::TrendSummary;
use crate::intervention::ActionHints;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier for tasks and events.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Enumerations ---

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    #[default]
    New,
    InProgress,
    Completed,
    Failed,
    AwaitingReview,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::AwaitingReview => "AWAITING_REVIEW",
            Self::Skipped => "SKIPPED",
        }
    }

    /// Completed and skipped tasks never run again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    /// Statuses the orchestrator may pick up automatically.
    ///
    /// `AwaitingReview` is parked: it waits for an external reviewer.
    pub fn is_selectable(&self) -> bool {
        matches!(self, Self::New | Self::InProgress | Self::Failed)
    }

    /// Whether moving into this status counts as forward progress.
    pub fn is_advance(&self) -> bool {
        matches!(self, Self::Completed | Self::AwaitingReview)
    }

    /// Transition graph:
    /// New -> InProgress -> {Completed, Failed, AwaitingReview},
    /// Failed -> InProgress, any non-terminal -> Skipped.
    pub fn can_transition_to(&self, next: Self) -> bool {
        match (self, next) {
            (Self::New | Self::Failed, Self::InProgress) => true,
            (Self::InProgress, Self::Completed | Self::Failed | Self::AwaitingReview) => true,
            (from, Self::Skipped) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What counts as observable forward progress for a successful run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressPolicy {
    /// Touched artifacts or an advanced task status.
    #[default]
    Either,
    /// Touched artifacts and an advanced task status.
    Both,
}

impl ProgressPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Either => "either",
            Self::Both => "both",
        }
    }
}

/// Kind of fine-grained action a phase reports.
///
/// Common agent tool names deserialize to their kind. Anything unrecognised
/// is kept as `Other` rather than rejecting the whole outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    #[serde(alias = "read_file")]
    Read,
    #[serde(alias = "search_code", alias = "list_directory")]
    Search,
    #[serde(alias = "str_replace", alias = "full_file_rewrite")]
    Modify,
    #[serde(alias = "create_file")]
    Create,
    #[serde(alias = "delete_file")]
    Delete,
    #[serde(alias = "execute_command")]
    Execute,
    #[serde(alias = "ask", alias = "consult_specialist")]
    Request,
    #[serde(other)]
    Other,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Search => "search",
            Self::Modify => "modify",
            Self::Create => "create",
            Self::Delete => "delete",
            Self::Execute => "execute",
            Self::Request => "request",
            Self::Other => "other",
        }
    }

    /// Kinds that change the target artifact.
    pub fn is_modification(&self) -> bool {
        matches!(self, Self::Modify | Self::Create | Self::Delete)
    }
}

/// Loop detector that produced a detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopType {
    ActionRepeat,
    ModificationRepeat,
    RequestRepeat,
    PatternCycle,
}

impl LoopType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ActionRepeat => "action_repeat",
            Self::ModificationRepeat => "modification_repeat",
            Self::RequestRepeat => "request_repeat",
            Self::PatternCycle => "pattern_cycle",
        }
    }
}

/// Detection severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Severity for a repetition count.
    pub fn from_count(count: usize) -> Self {
        match count {
            n if n >= 10 => Self::Critical,
            n if n >= 7 => Self::High,
            n if n >= 5 => Self::Medium,
            _ => Self::Low,
        }
    }

    /// Severity for a number of back-to-back cycles.
    pub fn from_cycles(cycles: usize) -> Self {
        match cycles {
            n if n >= 5 => Self::Critical,
            4 => Self::High,
            3 => Self::Medium,
            _ => Self::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// Corrective action chosen by the intervention ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterventionAction {
    Continue,
    RetryWithGuidance,
    ConsultAlternateStrategy,
    RequireHuman,
}

impl InterventionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Continue => "CONTINUE",
            Self::RetryWithGuidance => "RETRY_WITH_GUIDANCE",
            Self::ConsultAlternateStrategy => "CONSULT_ALTERNATE_STRATEGY",
            Self::RequireHuman => "REQUIRE_HUMAN",
        }
    }
}

// --- Core Types ---

#[derive(Debug, Error)]
#[error("invalid task transition for {task_id}: {from} -> {to}")]
pub struct TransitionError {
    pub task_id: Id,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// One entry of a task's error history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    /// Phase that reported the error.
    pub phase: String,
}

/// A unit of work routed through phases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Id,
    #[serde(default)]
    pub description: String,
    /// Opaque reference to what the task works on (file, module, ticket).
    #[serde(default)]
    pub target: String,
    /// Phase the task is currently routed to. Empty means the initial phase.
    #[serde(default)]
    pub phase: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub priority: i32,
    /// Creation order, used for deterministic tie-breaking.
    #[serde(default)]
    pub seq: u64,
    #[serde(default)]
    pub requires_human: bool,
    #[serde(default)]
    pub errors: Vec<TaskError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(description: impl Into<String>, target: impl Into<String>, priority: i32) -> Self {
        let now = Utc::now();
        Self {
            id: Id::new(),
            description: description.into(),
            target: target.into(),
            phase: String::new(),
            status: TaskStatus::New,
            attempts: 0,
            priority,
            seq: 0,
            requires_human: false,
            errors: Vec::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Route the task to a specific phase.
    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = phase.into();
        self
    }

    /// Whether the orchestrator may pick this task up automatically.
    pub fn is_pending(&self) -> bool {
        self.status.is_selectable() && !self.requires_human
    }

    /// Move to `next` if the transition graph allows it.
    pub fn transition(&mut self, next: TaskStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                task_id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        let now = Utc::now();
        if next == TaskStatus::InProgress {
            self.attempts += 1;
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    pub fn record_error(&mut self, phase: &str, message: impl Into<String>) {
        let now = Utc::now();
        self.errors.push(TaskError {
            timestamp: now,
            message: message.into(),
            phase: phase.to_string(),
        });
        self.updated_at = now;
    }

    /// Last `n` errors, oldest first.
    pub fn recent_errors(&self, n: usize) -> Vec<TaskError> {
        let start = self.errors.len().saturating_sub(n);
        self.errors[start..].to_vec()
    }
}

/// Immutable record of one phase invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRunRecord {
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    #[serde(default)]
    pub task_id: Option<Id>,
    #[serde(default)]
    pub touched_artifacts: BTreeSet<String>,
    /// The run moved its task into an advancing status.
    #[serde(default)]
    pub status_advanced: bool,
}

impl PhaseRunRecord {
    /// Successful and observably effective under `policy`.
    pub fn made_progress(&self, policy: ProgressPolicy) -> bool {
        if !self.success {
            return false;
        }
        let touched = !self.touched_artifacts.is_empty();
        match policy {
            ProgressPolicy::Either => touched || self.status_advanced,
            ProgressPolicy::Both => touched && self.status_advanced,
        }
    }
}

/// An action as reported by a phase, before normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionReport {
    /// Agent within the phase that performed the action.
    #[serde(default = "default_actor")]
    pub actor: String,
    pub kind: ActionKind,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub params: serde_json::Value,
}

fn default_actor() -> String {
    "main".to_string()
}

impl ActionReport {
    pub fn new(kind: ActionKind, target: Option<&str>) -> Self {
        Self {
            actor: default_actor(),
            kind,
            target: target.map(str::to_string),
            params: serde_json::Value::Null,
        }
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }
}

/// A normalized action kept in the tracker's sliding window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEvent {
    pub timestamp: DateTime<Utc>,
    pub phase: String,
    pub actor: String,
    pub kind: ActionKind,
    #[serde(default)]
    pub target: Option<String>,
    /// Hash of the normalized parameters.
    pub fingerprint: String,
    #[serde(default)]
    pub task_id: Option<Id>,
}

impl ActionEvent {
    /// Stable identity used by the repeat and cycle detectors.
    pub fn signature(&self) -> String {
        format!(
            "{}:{}:{}({})#{}",
            self.phase,
            self.actor,
            self.kind.as_str(),
            self.target.as_deref().unwrap_or("-"),
            self.fingerprint
        )
    }
}

/// A loop found by one detector pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopDetection {
    pub loop_type: LoopType,
    pub severity: Severity,
    pub description: String,
    /// Events that matched.
    pub evidence: Vec<ActionEvent>,
}

/// Structured result of one phase invocation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseOutcome {
    pub success: bool,
    pub message: String,
    pub touched_artifacts: Vec<String>,
    pub actions: Vec<ActionReport>,
    pub next_phase_hint: Option<String>,
    pub requires_human: bool,
    /// Status the phase moved its task to, if any.
    pub task_status: Option<TaskStatus>,
    /// The phase found nothing to do.
    pub no_work: bool,
}

impl PhaseOutcome {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn no_work(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            no_work: true,
            ..Default::default()
        }
    }

    pub fn with_touched<I, S>(mut self, artifacts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.touched_artifacts = artifacts.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_action(mut self, action: ActionReport) -> Self {
        self.actions.push(action);
        self
    }

    pub fn with_next_phase(mut self, phase: impl Into<String>) -> Self {
        self.next_phase_hint = Some(phase.into());
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.task_status = Some(status);
        self
    }
}

/// Read-only snapshot handed to a phase with its task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseContext {
    pub iteration: u64,
    pub phase: String,
    pub trend: TrendSummary,
    /// Corrective context from the intervention ladder.
    pub guidance: Option<String>,
    /// Alternate strategy the phase should switch to.
    pub strategy: Option<String>,
    /// Action kinds to prefer or avoid after a loop.
    #[serde(default)]
    pub hints: ActionHints,
    /// Most recent task errors, oldest first.
    pub recent_errors: Vec<TaskError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_generates_unique_values() {
        let id1 = Id::new();
        let id2 = Id::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn task_status_serializes_correctly() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::AwaitingReview).unwrap(),
            "\"AWAITING_REVIEW\""
        );
        assert_eq!(
            serde_json::to_string(&TaskStatus::InProgress).unwrap(),
            "\"IN_PROGRESS\""
        );
    }

    #[test]
    fn transition_graph_allows_documented_edges() {
        use TaskStatus::*;
        assert!(New.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(Failed));
        assert!(InProgress.can_transition_to(AwaitingReview));
        assert!(Failed.can_transition_to(InProgress));
        assert!(AwaitingReview.can_transition_to(Skipped));
        assert!(New.can_transition_to(Skipped));
    }

    #[test]
    fn transition_graph_rejects_other_edges() {
        use TaskStatus::*;
        assert!(!New.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(InProgress));
        assert!(!Completed.can_transition_to(Skipped));
        assert!(!Skipped.can_transition_to(Skipped));
        assert!(!AwaitingReview.can_transition_to(InProgress));
    }

    #[test]
    fn task_transition_counts_attempts() {
        let mut task = Task::new("write parser", "src/parser.rs", 1);
        task.transition(TaskStatus::InProgress).unwrap();
        task.transition(TaskStatus::Failed).unwrap();
        task.transition(TaskStatus::InProgress).unwrap();
        assert_eq!(task.attempts, 2);
        assert!(task.completed_at.is_none());

        task.transition(TaskStatus::Completed).unwrap();
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn invalid_transition_leaves_task_unchanged() {
        let mut task = Task::new("write parser", "src/parser.rs", 1);
        let err = task.transition(TaskStatus::Completed).unwrap_err();
        assert_eq!(err.from, TaskStatus::New);
        assert_eq!(err.to, TaskStatus::Completed);
        assert_eq!(task.status, TaskStatus::New);
        assert_eq!(task.attempts, 0);
    }

    #[test]
    fn recent_errors_returns_tail() {
        let mut task = Task::new("t", "a", 0);
        for i in 0..7 {
            task.record_error("coding", format!("error {i}"));
        }
        let recent = task.recent_errors(5);
        assert_eq!(recent.len(), 5);
        assert_eq!(recent[0].message, "error 2");
        assert_eq!(recent[4].message, "error 6");
    }

    #[test]
    fn progress_requires_success() {
        let record = PhaseRunRecord {
            timestamp: Utc::now(),
            success: false,
            task_id: None,
            touched_artifacts: BTreeSet::from(["a.rs".to_string()]),
            status_advanced: true,
        };
        assert!(!record.made_progress(ProgressPolicy::Either));
    }

    #[test]
    fn progress_policy_either_and_both() {
        let mut record = PhaseRunRecord {
            timestamp: Utc::now(),
            success: true,
            task_id: None,
            touched_artifacts: BTreeSet::from(["a.rs".to_string()]),
            status_advanced: false,
        };
        assert!(record.made_progress(ProgressPolicy::Either));
        assert!(!record.made_progress(ProgressPolicy::Both));

        record.status_advanced = true;
        assert!(record.made_progress(ProgressPolicy::Both));

        record.touched_artifacts.clear();
        assert!(record.made_progress(ProgressPolicy::Either));
        assert!(!record.made_progress(ProgressPolicy::Both));
    }

    #[test]
    fn phase_outcome_defaults_missing_fields() {
        let outcome: PhaseOutcome =
            serde_json::from_str(r#"{"success": true, "message": "ok", "extra": 1}"#).unwrap();
        assert!(outcome.success);
        assert!(outcome.touched_artifacts.is_empty());
        assert!(outcome.next_phase_hint.is_none());
        assert!(!outcome.requires_human);
        assert!(!outcome.no_work);
    }

    #[test]
    fn action_report_defaults_actor() {
        let report: ActionReport =
            serde_json::from_str(r#"{"kind": "modify", "target": "a.rs"}"#).unwrap();
        assert_eq!(report.actor, "main");
        assert_eq!(report.kind, ActionKind::Modify);
        assert!(report.params.is_null());
    }

    #[test]
    fn tool_names_map_to_action_kinds() {
        let kinds: Vec<ActionKind> = serde_json::from_str(
            r#"["read_file", "str_replace", "list_directory", "ask", "execute"]"#,
        )
        .unwrap();
        assert_eq!(
            kinds,
            vec![
                ActionKind::Read,
                ActionKind::Modify,
                ActionKind::Search,
                ActionKind::Request,
                ActionKind::Execute,
            ]
        );
    }

    #[test]
    fn unknown_action_kind_does_not_reject_outcome() {
        let outcome: PhaseOutcome = serde_json::from_str(
            r#"{"success": true, "actions": [
                {"kind": "browse_web", "target": "https://docs.rs"},
                {"kind": "modify", "target": "a.rs"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(outcome.actions.len(), 2);
        assert_eq!(outcome.actions[0].kind, ActionKind::Other);
        assert_eq!(outcome.actions[1].kind, ActionKind::Modify);
    }

    #[test]
    fn severity_scales_with_count() {
        assert_eq!(Severity::from_count(3), Severity::Low);
        assert_eq!(Severity::from_count(5), Severity::Medium);
        assert_eq!(Severity::from_count(7), Severity::High);
        assert_eq!(Severity::from_count(12), Severity::Critical);
        assert_eq!(Severity::from_cycles(2), Severity::Low);
        assert_eq!(Severity::from_cycles(4), Severity::High);
        assert!(Severity::Critical > Severity::Low);
    }
}
