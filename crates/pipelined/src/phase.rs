//! Phase contract and name-keyed registry.
//!
//! A phase is an external worker the orchestrator invokes once per
//! iteration. It receives the task and a read-only context and returns a
//! structured outcome. Phases must watch the cancellation token and return
//! promptly once it fires.

use async_trait::async_trait;
use pipeline_core::{PhaseContext, PhaseOutcome, Task};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode phase input: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("phase produced no outcome (exit code {exit_code:?})")]
    NoOutcome { exit_code: Option<i32> },
    #[error("cancelled")]
    Cancelled,
    #[error("{0}")]
    Failed(String),
}

pub type Result<T> = std::result::Result<T, PhaseError>;

#[async_trait]
pub trait Phase: Send + Sync {
    /// Run once against `task`.
    ///
    /// An `Err` is recorded as a failed run with the error as its message.
    async fn run(
        &self,
        task: &Task,
        context: &PhaseContext,
        cancel: CancellationToken,
    ) -> Result<PhaseOutcome>;
}

/// Phases keyed by name.
#[derive(Clone, Default)]
pub struct PhaseRegistry {
    phases: BTreeMap<String, Arc<dyn Phase>>,
}

impl std::fmt::Debug for PhaseRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhaseRegistry")
            .field("phases", &self.names())
            .finish()
    }
}

impl PhaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `phase` under `name`, replacing any previous registration.
    pub fn register(&mut self, name: impl Into<String>, phase: Arc<dyn Phase>) {
        self.phases.insert(name.into(), phase);
    }

    pub fn with(mut self, name: impl Into<String>, phase: Arc<dyn Phase>) -> Self {
        self.register(name, phase);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Phase>> {
        self.phases.get(name).map(Arc::clone)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.phases.contains_key(name)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.phases.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(bool);

    #[async_trait]
    impl Phase for Fixed {
        async fn run(
            &self,
            _task: &Task,
            _context: &PhaseContext,
            _cancel: CancellationToken,
        ) -> Result<PhaseOutcome> {
            if self.0 {
                Ok(PhaseOutcome::success("done"))
            } else {
                Err(PhaseError::Failed("boom".to_string()))
            }
        }
    }

    #[test]
    fn registry_lists_sorted_names() {
        let registry = PhaseRegistry::new()
            .with("review", Arc::new(Fixed(true)))
            .with("coding", Arc::new(Fixed(true)));
        assert_eq!(registry.names(), vec!["coding", "review"]);
        assert!(registry.contains("coding"));
        assert!(registry.get("docs").is_none());
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn registered_phase_is_invocable() {
        let registry = PhaseRegistry::new().with("coding", Arc::new(Fixed(false)));
        let phase = registry.get("coding").unwrap();
        let task = Task::new("t", "a", 0);
        let context = PhaseContext {
            iteration: 1,
            phase: "coding".to_string(),
            trend: pipeline_core::TrendSummary::default(),
            guidance: None,
            strategy: None,
            hints: pipeline_core::ActionHints::default(),
            recent_errors: Vec::new(),
        };
        let err = phase
            .run(&task, &context, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }
}
