//! Observability events emitted by the orchestrator.
//!
//! Every event is logged through `tracing` and, when an event log is
//! configured, appended as a JSON payload keyed by its `EventType`.

use crate::types::{
    ActionEvent, Id, InterventionAction, LoopType, Severity, TaskStatus,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    PhaseStarted,
    PhaseCompleted,
    LoopDetected,
    InterventionEscalated,
    ForcedTransition,
    HumanRequired,
    TaskStatusChanged,
    /// An interrupted in-flight run was recovered on restart.
    PipelineResumed,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PhaseStarted => "PHASE_STARTED",
            Self::PhaseCompleted => "PHASE_COMPLETED",
            Self::LoopDetected => "LOOP_DETECTED",
            Self::InterventionEscalated => "INTERVENTION_ESCALATED",
            Self::ForcedTransition => "FORCED_TRANSITION",
            Self::HumanRequired => "HUMAN_REQUIRED",
            Self::TaskStatusChanged => "TASK_STATUS_CHANGED",
            Self::PipelineResumed => "PIPELINE_RESUMED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseStartedPayload {
    pub iteration: u64,
    pub phase: String,
    pub task_id: Id,
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseCompletedPayload {
    pub iteration: u64,
    pub phase: String,
    pub task_id: Id,
    pub success: bool,
    pub message: String,
    pub duration_ms: u64,
    pub timed_out: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopDetectedPayload {
    pub phase: String,
    pub loop_type: LoopType,
    pub severity: Severity,
    pub description: String,
    pub evidence: Vec<ActionEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterventionEscalatedPayload {
    pub phase: String,
    pub task_id: Id,
    /// Ladder level after the escalation.
    pub level: u32,
    pub action: InterventionAction,
    pub strategy: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForcedTransitionPayload {
    pub from: String,
    pub to: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanRequiredPayload {
    pub task_id: Id,
    pub phase: String,
    pub reason: String,
    pub evidence: Vec<ActionEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusChangedPayload {
    pub task_id: Id,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResumedPayload {
    pub task_id: Id,
    pub phase: String,
    pub interrupted_at: chrono::DateTime<chrono::Utc>,
}

/// Union type for all event payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    PhaseStarted(PhaseStartedPayload),
    PhaseCompleted(PhaseCompletedPayload),
    LoopDetected(LoopDetectedPayload),
    InterventionEscalated(InterventionEscalatedPayload),
    ForcedTransition(ForcedTransitionPayload),
    HumanRequired(HumanRequiredPayload),
    TaskStatusChanged(TaskStatusChangedPayload),
    PipelineResumed(PipelineResumedPayload),
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::PhaseStarted(_) => EventType::PhaseStarted,
            Self::PhaseCompleted(_) => EventType::PhaseCompleted,
            Self::LoopDetected(_) => EventType::LoopDetected,
            Self::InterventionEscalated(_) => EventType::InterventionEscalated,
            Self::ForcedTransition(_) => EventType::ForcedTransition,
            Self::HumanRequired(_) => EventType::HumanRequired,
            Self::TaskStatusChanged(_) => EventType::TaskStatusChanged,
            Self::PipelineResumed(_) => EventType::PipelineResumed,
        }
    }

    /// Task the event refers to, when there is one.
    pub fn task_id(&self) -> Option<&Id> {
        match self {
            Self::PhaseStarted(p) => Some(&p.task_id),
            Self::PhaseCompleted(p) => Some(&p.task_id),
            Self::InterventionEscalated(p) => Some(&p.task_id),
            Self::HumanRequired(p) => Some(&p.task_id),
            Self::TaskStatusChanged(p) => Some(&p.task_id),
            Self::PipelineResumed(p) => Some(&p.task_id),
            Self::LoopDetected(_) | Self::ForcedTransition(_) => None,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
