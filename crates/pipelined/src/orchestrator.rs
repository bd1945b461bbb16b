//! Orchestrator state machine.
//!
//! Key responsibilities:
//! - Select the next pending task and resolve the phase it runs in
//! - Invoke the phase under a timeout with cooperative cancellation
//! - Record the run into history and its actions into the tracker
//! - Decide forced transitions, scan for loops, climb the intervention ladder
//! - Route the task to its next phase, archive finished tasks and checkpoint
//! - Apply operator decisions: skip a task or release a human handoff
//!
//! The orchestrator is the only writer of `PipelineState`.

use crate::event_log::{EventLog, EventLogError};
use crate::phase::{PhaseError, PhaseRegistry};
use chrono::Utc;
use pipeline_core::config::ConfigError;
use pipeline_core::events::{
    EventPayload, ForcedTransitionPayload, HumanRequiredPayload, InterventionEscalatedPayload,
    LoopDetectedPayload, PhaseCompletedPayload, PhaseStartedPayload, PipelineResumedPayload,
    TaskStatusChangedPayload,
};
use pipeline_core::intervention::Trouble;
use pipeline_core::snapshot::{InFlight, PendingTransition, SnapshotError};
use pipeline_core::{
    ActionEvent, Config, Id, InterventionAction, InterventionLadder, LoopDetection, LoopDetector,
    PhaseContext, PhaseOutcome, PhaseRunRecord, PipelineState, StateStore, Task, TaskStatus,
    TransitionError,
};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Time a cancelled phase gets to hand back a partial outcome.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Task errors included in the phase context.
const CONTEXT_ERRORS: usize = 5;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error("event log error: {0}")]
    EventLog(#[from] EventLogError),
    #[error("task {task_id} is routed to unregistered phase '{phase}'")]
    UnknownPhase { task_id: Id, phase: String },
    #[error("no live task {0}")]
    UnknownTask(Id),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// What a single iteration did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationOutcome {
    /// A phase ran against a task.
    Ran {
        task_id: Id,
        phase: String,
        success: bool,
    },
    /// No task is left for automatic processing.
    Finished,
    /// Shutdown was requested before a phase started.
    Stopped,
}

/// Why a pipeline run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Finished,
    MaxIterations,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub iterations: u64,
    pub reason: StopReason,
    /// Tasks handed off to a human.
    pub awaiting_human: Vec<Id>,
}

/// Why an invocation was cut short.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Timeout,
    Shutdown,
}

/// Forced-transition policy for the phase that just ran.
///
/// Rules in order: progress clears, repeated no-work forces, improving
/// clears, then consecutive failures, oscillation and a low lifetime success
/// rate each force. Resets the no-work counter when rule (a) or (b) fires.
pub fn forced_transition_reason(
    config: &Config,
    state: &mut PipelineState,
    phase: &str,
) -> Option<String> {
    let made_progress = state
        .history
        .last_record(phase)
        .is_some_and(|r| r.made_progress(config.progress_policy));
    if made_progress {
        state.no_work_counts.remove(phase);
        return None;
    }

    let no_work = state.no_work_count(phase);
    if no_work >= config.no_work_threshold {
        state.no_work_counts.remove(phase);
        return Some(format!("no work reported {no_work} consecutive times"));
    }

    if state.history.is_improving(phase, config.trend_window) {
        return None;
    }

    let failures = state.history.consecutive_failures(phase);
    if failures >= config.consecutive_failure_threshold as usize {
        return Some(format!("{failures} consecutive failures"));
    }

    if state.history.is_oscillating(phase, config.oscillation_threshold) {
        return Some("outcomes are oscillating".to_string());
    }

    let runs = state.history.phase(phase).map_or(0, |s| s.runs);
    let rate = state.history.success_rate(phase);
    if runs >= u64::from(config.low_success_min_runs) && rate < config.low_success_rate {
        return Some(format!("success rate {rate:.2} over {runs} runs"));
    }

    None
}

#[derive(Debug)]
pub struct Orchestrator {
    config: Config,
    registry: PhaseRegistry,
    state: PipelineState,
    store: Option<StateStore>,
    event_log: Option<EventLog>,
    detector: LoopDetector,
    ladder: InterventionLadder,
    phase_timeout: Duration,
    grace_period: Duration,
}

impl Orchestrator {
    /// Validate `config` against the registry and start from an empty state.
    pub fn new(config: Config, registry: PhaseRegistry) -> Result<Self> {
        config.validate(&registry.names())?;
        Ok(Self {
            state: PipelineState::new(&config),
            detector: LoopDetector::from_config(&config),
            ladder: InterventionLadder::from_config(&config),
            phase_timeout: Duration::from_secs(config.phase_timeout_seconds),
            grace_period: DEFAULT_GRACE_PERIOD,
            store: None,
            event_log: None,
            config,
            registry,
        })
    }

    /// Checkpoint to `store` after every iteration.
    pub fn with_store(mut self, store: StateStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_event_log(mut self, event_log: EventLog) -> Self {
        self.event_log = Some(event_log);
        self
    }

    pub fn with_phase_timeout(mut self, timeout: Duration) -> Self {
        self.phase_timeout = timeout;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn event_log(&self) -> Option<&EventLog> {
        self.event_log.as_ref()
    }

    /// Reload the last checkpoint, if any, and recover an interrupted run.
    ///
    /// Returns whether a checkpoint was found.
    pub async fn resume(&mut self) -> Result<bool> {
        let Some(store) = &self.store else {
            return Ok(false);
        };
        let Some(mut state) = store.load()? else {
            return Ok(false);
        };
        state.apply_limits(&self.config);
        info!(
            iteration = state.iteration,
            tasks = state.tasks.len(),
            "restored pipeline state"
        );
        self.state = state;

        if let Some(in_flight) = self.state.in_flight.take() {
            self.recover_interrupted(in_flight).await;
        }
        self.archive_finished()?;
        self.checkpoint()?;
        Ok(true)
    }

    /// A run that never recorded its outcome counts as a failed attempt.
    async fn recover_interrupted(&mut self, in_flight: InFlight) {
        let InFlight {
            task_id,
            phase,
            started_at,
        } = in_flight;
        warn!(task_id = %task_id, phase = %phase, "recovering interrupted phase run as failure");

        let message = format!("interrupted while running phase {phase}");
        let mut status_change = None;
        if let Some(task) = self.state.task_mut(&task_id) {
            task.record_error(&phase, &message);
            if task.status == TaskStatus::InProgress && task.transition(TaskStatus::Failed).is_ok() {
                status_change = Some((TaskStatus::InProgress, TaskStatus::Failed));
            }
        }
        self.state.history.record(
            &phase,
            PhaseRunRecord::new(false, Some(task_id.clone()), Vec::<String>::new()),
        );

        if let Some((from, to)) = status_change {
            self.emit(EventPayload::TaskStatusChanged(TaskStatusChangedPayload {
                task_id: task_id.clone(),
                from,
                to,
            }))
            .await;
        }
        self.emit(EventPayload::PipelineResumed(PipelineResumedPayload {
            task_id,
            phase,
            interrupted_at: started_at,
        }))
        .await;
    }

    /// Add a task, routing it to the initial phase when it names none.
    pub fn add_task(&mut self, mut task: Task) -> Result<Id> {
        if task.phase.is_empty() {
            task.phase.clone_from(&self.config.initial_phase);
        }
        if !self.registry.contains(&task.phase) {
            return Err(OrchestratorError::UnknownPhase {
                task_id: task.id,
                phase: task.phase,
            });
        }
        Ok(self.state.add_task(task))
    }

    pub fn checkpoint(&self) -> Result<()> {
        if let Some(store) = &self.store {
            store.save(&self.state)?;
        }
        Ok(())
    }

    /// Move completed and skipped tasks out of the live state.
    ///
    /// They are appended to the store's archive before the next checkpoint
    /// drops them from the snapshot. Without a store only the counts remain.
    fn archive_finished(&mut self) -> Result<()> {
        let done = self.state.archive_terminal();
        if done.is_empty() {
            return Ok(());
        }
        if let Some(store) = &self.store {
            store.archive(&done)?;
        }
        for task in &done {
            info!(task_id = %task.id, status = %task.status, attempts = task.attempts, "task archived");
        }
        Ok(())
    }

    /// Archived tasks, oldest first. Empty without a store.
    pub fn archived_tasks(&self) -> Result<Vec<Task>> {
        match &self.store {
            Some(store) => Ok(store.load_archive()?),
            None => Ok(Vec::new()),
        }
    }

    /// Operator override: take a task out of the pipeline for good.
    ///
    /// Works for any live task, including one handed to a human or parked
    /// for review. The reason is kept in the task's error history.
    pub async fn skip_task(&mut self, task_id: &Id, reason: &str) -> Result<()> {
        let task = self
            .state
            .task_mut(task_id)
            .ok_or_else(|| OrchestratorError::UnknownTask(task_id.clone()))?;
        let from = task.status;
        task.transition(TaskStatus::Skipped)?;
        let phase = task.phase.clone();
        task.record_error(&phase, format!("skipped: {reason}"));
        task.requires_human = false;
        info!(task_id = %task_id, phase = %phase, reason = %reason, "task skipped");

        self.state.actions.forget_task(task_id);
        self.emit(EventPayload::TaskStatusChanged(TaskStatusChangedPayload {
            task_id: task_id.clone(),
            from,
            to: TaskStatus::Skipped,
        }))
        .await;
        self.archive_finished()?;
        self.checkpoint()
    }

    /// Operator decision on a human handoff: return the task to automatic
    /// selection, optionally in another phase.
    ///
    /// Returns whether the task was awaiting a human. A task parked in
    /// `AwaitingReview` stays parked; skipping is the way out for it.
    pub fn release_task(&mut self, task_id: &Id, phase: Option<&str>) -> Result<bool> {
        if let Some(phase) = phase {
            if !self.registry.contains(phase) {
                return Err(OrchestratorError::UnknownPhase {
                    task_id: task_id.clone(),
                    phase: phase.to_string(),
                });
            }
        }
        let task = self
            .state
            .task_mut(task_id)
            .ok_or_else(|| OrchestratorError::UnknownTask(task_id.clone()))?;
        if !task.requires_human {
            return Ok(false);
        }
        task.requires_human = false;
        task.updated_at = Utc::now();
        if let Some(phase) = phase {
            task.phase = phase.to_string();
        }
        info!(task_id = %task_id, phase = %task.phase, status = %task.status, "human handoff released");
        self.checkpoint()?;
        Ok(true)
    }

    /// Log an event and append it to the event log when one is configured.
    async fn emit(&self, payload: EventPayload) {
        let event_type = payload.event_type().as_str();
        match &payload {
            EventPayload::HumanRequired(p) => {
                warn!(event = event_type, task_id = %p.task_id, phase = %p.phase, reason = %p.reason, "human intervention required");
            }
            EventPayload::LoopDetected(p) => {
                warn!(event = event_type, phase = %p.phase, loop_type = p.loop_type.as_str(), severity = p.severity.as_str(), "{}", p.description);
            }
            EventPayload::ForcedTransition(p) => {
                info!(event = event_type, from = %p.from, to = %p.to, reason = %p.reason, "forced transition");
            }
            _ => debug!(event = event_type, task_id = ?payload.task_id(), "pipeline event"),
        }
        if let Some(log) = &self.event_log {
            if let Err(err) = log.append(&payload).await {
                warn!(event = event_type, error = %err, "failed to append event");
            }
        }
    }

    /// Phase the task runs in, after applying a pending forced transition.
    fn resolve_phase(&mut self, task_id: &Id) -> Result<String> {
        let Some(task) = self.state.task(task_id) else {
            return Err(OrchestratorError::UnknownPhase {
                task_id: task_id.clone(),
                phase: String::new(),
            });
        };
        let mut phase = if task.phase.is_empty() {
            self.config.initial_phase.clone()
        } else {
            task.phase.clone()
        };

        if let Some(pending) = self.state.pending_transition.take() {
            if pending.from == phase && self.registry.contains(&pending.to) {
                debug!(task_id = %task_id, from = %pending.from, to = %pending.to, "applying pending transition");
                phase = pending.to;
            }
        }

        if !self.registry.contains(&phase) {
            warn!(task_id = %task_id, phase = %phase, "task routed to unregistered phase; using initial phase");
            phase.clone_from(&self.config.initial_phase);
        }
        if let Some(task) = self.state.task_mut(task_id) {
            task.phase.clone_from(&phase);
        }
        Ok(phase)
    }

    /// Move a task through the transition graph and emit the change.
    async fn transition_task(&mut self, task_id: &Id, next: TaskStatus) -> bool {
        let Some(task) = self.state.task_mut(task_id) else {
            return false;
        };
        let from = task.status;
        if from == next {
            return false;
        }
        if let Err(err) = task.transition(next) {
            warn!(error = %err, "rejected task status change");
            return false;
        }
        self.emit(EventPayload::TaskStatusChanged(TaskStatusChangedPayload {
            task_id: task_id.clone(),
            from,
            to: next,
        }))
        .await;
        true
    }

    fn context_for(&self, task: &Task, phase: &str) -> PhaseContext {
        let intervention = self.state.interventions.get(phase);
        PhaseContext {
            iteration: self.state.iteration,
            phase: phase.to_string(),
            trend: self.state.history.trend(
                phase,
                self.config.trend_window,
                self.config.oscillation_threshold,
            ),
            guidance: intervention.and_then(|i| i.guidance.clone()),
            strategy: intervention.and_then(|i| i.strategy.clone()),
            hints: intervention.map(|i| i.hints.clone()).unwrap_or_default(),
            recent_errors: task.recent_errors(CONTEXT_ERRORS),
        }
    }

    /// Run the phase, cancelling it on timeout or shutdown.
    async fn invoke(
        &self,
        phase_name: &str,
        task: &Task,
        context: &PhaseContext,
        shutdown: &CancellationToken,
    ) -> (PhaseOutcome, Option<Interrupt>) {
        let Some(phase) = self.registry.get(phase_name) else {
            return (
                PhaseOutcome::failure(format!("phase {phase_name} is not registered")),
                None,
            );
        };
        let cancel = shutdown.child_token();
        let mut fut = phase.run(task, context, cancel.clone());

        let first = tokio::select! {
            result = &mut fut => Ok(result),
            () = tokio::time::sleep(self.phase_timeout) => Err(Interrupt::Timeout),
            () = shutdown.cancelled() => Err(Interrupt::Shutdown),
        };

        let (result, interrupt) = match first {
            Ok(result) => (result, None),
            Err(interrupt) => {
                cancel.cancel();
                let result = match tokio::time::timeout(self.grace_period, &mut fut).await {
                    Ok(result) => result,
                    Err(_) => Err(PhaseError::Cancelled),
                };
                (result, Some(interrupt))
            }
        };

        let mut outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => PhaseOutcome::failure(err.to_string()),
        };
        if let Some(interrupt) = interrupt {
            let what = match interrupt {
                Interrupt::Timeout => format!("timed out after {}s", self.phase_timeout.as_secs()),
                Interrupt::Shutdown => "cancelled by shutdown".to_string(),
            };
            outcome.success = false;
            outcome.message = if outcome.message.is_empty() {
                what
            } else {
                format!("{what}: {}", outcome.message)
            };
        }
        (outcome, interrupt)
    }

    /// Run one iteration.
    pub async fn run_iteration(&mut self, shutdown: &CancellationToken) -> Result<IterationOutcome> {
        if shutdown.is_cancelled() {
            return Ok(IterationOutcome::Stopped);
        }
        let Some(task_id) = self.state.next_task().map(|t| t.id.clone()) else {
            return Ok(IterationOutcome::Finished);
        };

        self.state.iteration += 1;
        let iteration = self.state.iteration;
        let phase = self.resolve_phase(&task_id)?;

        if self
            .state
            .task(&task_id)
            .is_some_and(|t| matches!(t.status, TaskStatus::New | TaskStatus::Failed))
        {
            self.transition_task(&task_id, TaskStatus::InProgress).await;
        }

        let Some(task) = self.state.task(&task_id).cloned() else {
            return Ok(IterationOutcome::Finished);
        };
        let context = self.context_for(&task, &phase);

        self.state.in_flight = Some(InFlight {
            task_id: task_id.clone(),
            phase: phase.clone(),
            started_at: Utc::now(),
        });
        self.checkpoint()?;

        info!(iteration, phase = %phase, task_id = %task_id, attempt = task.attempts, "phase started");
        self.emit(EventPayload::PhaseStarted(PhaseStartedPayload {
            iteration,
            phase: phase.clone(),
            task_id: task_id.clone(),
            attempt: task.attempts,
        }))
        .await;

        let started = Instant::now();
        let (outcome, interrupt) = self.invoke(&phase, &task, &context, shutdown).await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.state.in_flight = None;

        info!(
            iteration,
            phase = %phase,
            task_id = %task_id,
            success = outcome.success,
            duration_ms,
            "phase completed: {}",
            outcome.message
        );
        self.emit(EventPayload::PhaseCompleted(PhaseCompletedPayload {
            iteration,
            phase: phase.clone(),
            task_id: task_id.clone(),
            success: outcome.success,
            message: outcome.message.clone(),
            duration_ms,
            timed_out: interrupt == Some(Interrupt::Timeout),
        }))
        .await;

        self.record_outcome(&task_id, &phase, &outcome).await;
        self.archive_finished()?;
        self.checkpoint()?;

        Ok(IterationOutcome::Ran {
            task_id,
            phase,
            success: outcome.success,
        })
    }

    /// Everything that happens between a phase returning and the checkpoint.
    async fn record_outcome(&mut self, task_id: &Id, phase: &str, outcome: &PhaseOutcome) {
        let status_advanced = self.apply_task_status(task_id, phase, outcome).await;

        let record = PhaseRunRecord::new(
            outcome.success,
            Some(task_id.clone()),
            outcome.touched_artifacts.iter().cloned(),
        )
        .with_status_advanced(status_advanced);
        let made_progress = record.made_progress(self.config.progress_policy);
        self.state.history.record(phase, record);

        let new_events: Vec<ActionEvent> = outcome
            .actions
            .iter()
            .map(|report| self.state.actions.track(phase, report, Some(task_id)))
            .collect();

        if outcome.no_work {
            *self.state.no_work_counts.entry(phase.to_string()).or_insert(0) += 1;
        } else {
            self.state.no_work_counts.remove(phase);
        }

        let forced = self.decide_forced_transition(phase).await;

        let detections: Vec<LoopDetection> = self
            .detector
            .detect_all(&mut self.state.actions, Utc::now())
            .into_iter()
            .filter(|d| d.evidence.iter().any(|e| new_events.contains(e)))
            .collect();
        for detection in &detections {
            self.emit(EventPayload::LoopDetected(LoopDetectedPayload {
                phase: phase.to_string(),
                loop_type: detection.loop_type,
                severity: detection.severity,
                description: detection.description.clone(),
                evidence: detection.evidence.clone(),
            }))
            .await;
        }

        let ladder_action = self
            .climb_ladder(task_id, phase, outcome, &detections, made_progress)
            .await;

        if outcome.requires_human {
            self.hand_off(task_id, phase, "phase requested human review", Vec::new())
                .await;
        }

        self.route_task(task_id, phase, outcome, forced.as_deref(), ladder_action);
    }

    /// Apply the outcome's status (or the failure default). Returns whether
    /// the task moved into an advancing status.
    ///
    /// A failed run cannot advance its task, and no phase may skip one.
    async fn apply_task_status(&mut self, task_id: &Id, phase: &str, outcome: &PhaseOutcome) -> bool {
        let before = self.state.task(task_id).map(|t| t.status);

        if !outcome.success {
            if let Some(task) = self.state.task_mut(task_id) {
                task.record_error(phase, &outcome.message);
            }
        }

        let requested = outcome.task_status.filter(|&status| {
            let allowed = status != TaskStatus::Skipped && (outcome.success || !status.is_advance());
            if !allowed {
                warn!(task_id = %task_id, phase = %phase, status = %status, success = outcome.success, "ignoring task status the phase may not set");
            }
            allowed
        });

        let mut applied = false;
        if let Some(status) = requested {
            applied = self.transition_task(task_id, status).await;
            if !applied && before != Some(status) {
                warn!(task_id = %task_id, phase = %phase, status = %status, "ignoring invalid task status from phase");
            }
        }
        if !applied && !outcome.success {
            self.transition_task(task_id, TaskStatus::Failed).await;
        }

        let after = self.state.task(task_id).map(|t| t.status);
        after != before && after.is_some_and(|s| s.is_advance())
    }

    async fn decide_forced_transition(&mut self, phase: &str) -> Option<String> {
        let reason = forced_transition_reason(&self.config, &mut self.state, phase)?;
        let Some(target) = self.config.fallback_for(phase).map(str::to_string) else {
            warn!(phase = %phase, reason = %reason, "forced transition wanted but no fallback configured");
            return None;
        };
        if target == phase {
            warn!(phase = %phase, reason = %reason, "fallback equals current phase; ignoring forced transition");
            return None;
        }

        self.state.pending_transition = Some(PendingTransition {
            from: phase.to_string(),
            to: target.clone(),
            reason: reason.clone(),
        });
        self.emit(EventPayload::ForcedTransition(ForcedTransitionPayload {
            from: phase.to_string(),
            to: target.clone(),
            reason,
        }))
        .await;
        Some(target)
    }

    /// Escalate on loops or repeated failures, reset on real progress.
    async fn climb_ladder(
        &mut self,
        task_id: &Id,
        phase: &str,
        outcome: &PhaseOutcome,
        detections: &[LoopDetection],
        made_progress: bool,
    ) -> Option<InterventionAction> {
        let failures = self.state.history.consecutive_failures(phase);
        let troubled = !detections.is_empty()
            || failures >= self.config.consecutive_failure_threshold as usize;

        if !troubled {
            if made_progress {
                let state = self.state.intervention(phase);
                if state.count > 0 {
                    debug!(phase = %phase, level = state.count, "progress made; resetting intervention ladder");
                }
                InterventionLadder::reset(state);
            }
            return None;
        }

        let trouble = Trouble {
            last_failure: (!outcome.success).then_some(outcome.message.as_str()),
            consecutive_failures: failures,
            detections,
        };
        let decision = self
            .ladder
            .escalate(self.state.intervention(phase), &trouble);
        info!(
            phase = %phase,
            task_id = %task_id,
            level = decision.level,
            action = decision.action.as_str(),
            strategy = ?decision.strategy,
            "intervention escalated"
        );
        self.emit(EventPayload::InterventionEscalated(InterventionEscalatedPayload {
            phase: phase.to_string(),
            task_id: task_id.clone(),
            level: decision.level,
            action: decision.action,
            strategy: decision.strategy.clone(),
        }))
        .await;

        if decision.action == InterventionAction::RequireHuman {
            let evidence = detections
                .iter()
                .flat_map(|d| d.evidence.iter().cloned())
                .collect();
            let recent_rate = self
                .state
                .history
                .recent_success_rate(phase, self.config.trend_window);
            let reason = format!(
                "intervention ladder exhausted after {} escalations \
                 ({failures} consecutive failures, recent success rate {recent_rate:.2})",
                decision.level
            );
            self.hand_off(task_id, phase, &reason, evidence).await;
            InterventionLadder::reset(self.state.intervention(phase));
            let forgotten = self.state.actions.forget_task(task_id);
            debug!(task_id = %task_id, forgotten, "dropped action events of handed-off task");
        }
        Some(decision.action)
    }

    async fn hand_off(
        &mut self,
        task_id: &Id,
        phase: &str,
        reason: &str,
        evidence: Vec<ActionEvent>,
    ) {
        let Some(task) = self.state.task_mut(task_id) else {
            return;
        };
        if task.requires_human {
            return;
        }
        task.requires_human = true;
        task.updated_at = Utc::now();
        self.emit(EventPayload::HumanRequired(HumanRequiredPayload {
            task_id: task_id.clone(),
            phase: phase.to_string(),
            reason: reason.to_string(),
            evidence,
        }))
        .await;
    }

    /// Next phase for the task that just ran.
    ///
    /// Precedence: human handoff > forced transition > ladder pin > hint.
    fn route_task(
        &mut self,
        task_id: &Id,
        phase: &str,
        outcome: &PhaseOutcome,
        forced: Option<&str>,
        ladder_action: Option<InterventionAction>,
    ) {
        let hint = outcome.next_phase_hint.as_deref().filter(|hint| {
            let known = self.registry.contains(hint);
            if !known {
                warn!(phase = %phase, hint = %hint, "ignoring unknown next phase hint");
            }
            known
        });
        let pinned = matches!(
            ladder_action,
            Some(InterventionAction::RetryWithGuidance | InterventionAction::ConsultAlternateStrategy)
        );

        let Some(task) = self.state.task_mut(task_id) else {
            return;
        };
        if task.requires_human {
            return;
        }
        let next = match (forced, pinned, hint) {
            (Some(target), _, _) => target,
            (None, true, _) => phase,
            (None, false, Some(hint)) => hint,
            (None, false, None) => phase,
        };
        if next != task.phase {
            debug!(task_id = %task_id, from = %task.phase, to = %next, "routing task");
        }
        task.phase = next.to_string();
    }

    /// Run iterations until finished, the iteration limit, or shutdown.
    pub async fn run(&mut self, shutdown: &CancellationToken) -> Result<RunSummary> {
        let mut iterations = 0;
        let reason = loop {
            if self.config.max_iterations > 0 && iterations >= self.config.max_iterations {
                break StopReason::MaxIterations;
            }
            match self.run_iteration(shutdown).await? {
                IterationOutcome::Ran { .. } => iterations += 1,
                IterationOutcome::Finished => break StopReason::Finished,
                IterationOutcome::Stopped => break StopReason::Shutdown,
            }
        };

        let awaiting_human: Vec<Id> = self.state.awaiting_human().map(|t| t.id.clone()).collect();
        info!(
            iterations,
            reason = ?reason,
            awaiting_human = awaiting_human.len(),
            "pipeline run ended"
        );
        Ok(RunSummary {
            iterations,
            reason,
            awaiting_human,
        })
    }
}
