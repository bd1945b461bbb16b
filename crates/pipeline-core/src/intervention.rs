//! Bounded escalation ladder.
//!
//! Each phase climbs one rung per troubled iteration:
//!
//! | level | action |
//! |---|---|
//! | 1 | `CONTINUE` |
//! | 2 .. limit-3 | `RETRY_WITH_GUIDANCE` |
//! | limit-2, limit-1 | `CONSULT_ALTERNATE_STRATEGY` (first, second) |
//! | >= limit | `REQUIRE_HUMAN` |
//!
//! With the default limit of 5 this is continue, retry, consult, consult,
//! human. Lower limits drop the retry rung first, then the first consult.
//!
//! Guidance rungs also carry action hints derived from the detected loops:
//! kinds of action to prefer and kinds to avoid on the next attempt.

use crate::config::Config;
use crate::types::{ActionKind, InterventionAction, LoopDetection, LoopType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Per-phase ladder position.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InterventionState {
    pub count: u32,
    pub last_action: Option<InterventionAction>,
    /// Guidance for the next invocation of the phase.
    pub guidance: Option<String>,
    pub strategy: Option<String>,
    pub hints: ActionHints,
}

/// Advisory action kinds for the next invocation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionHints {
    pub suggested: Vec<ActionKind>,
    pub blocked: Vec<ActionKind>,
}

impl ActionHints {
    /// Hints for a set of detections. A kind blocked by one loop is never
    /// suggested by another.
    pub fn for_detections(detections: &[LoopDetection]) -> Self {
        let mut suggested = BTreeSet::new();
        let mut blocked = BTreeSet::new();
        for detection in detections {
            match detection.loop_type {
                LoopType::ActionRepeat => {
                    suggested.extend([ActionKind::Read, ActionKind::Search, ActionKind::Request]);
                    blocked.extend(detection.evidence.first().map(|e| e.kind));
                }
                LoopType::ModificationRepeat => {
                    suggested.extend([ActionKind::Read, ActionKind::Request]);
                    blocked.insert(ActionKind::Modify);
                }
                LoopType::RequestRepeat => {
                    suggested.extend([ActionKind::Read, ActionKind::Modify]);
                    blocked.insert(ActionKind::Request);
                }
                LoopType::PatternCycle => {
                    suggested.insert(ActionKind::Request);
                }
            }
        }
        Self {
            suggested: suggested.difference(&blocked).copied().collect(),
            blocked: blocked.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.suggested.is_empty() && self.blocked.is_empty()
    }
}

/// One escalation step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterventionDecision {
    pub level: u32,
    pub action: InterventionAction,
    pub strategy: Option<String>,
    /// Corrective context for the next invocation.
    pub guidance: Option<String>,
    pub hints: ActionHints,
}

/// What went wrong on the iteration that triggered an escalation.
#[derive(Debug, Clone, Copy, Default)]
pub struct Trouble<'a> {
    pub last_failure: Option<&'a str>,
    pub consecutive_failures: usize,
    pub detections: &'a [LoopDetection],
}

#[derive(Debug, Clone)]
pub struct InterventionLadder {
    max_before_human: u32,
    strategies: Vec<String>,
}

impl Default for InterventionLadder {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl InterventionLadder {
    pub fn new(max_before_human: u32, strategies: Vec<String>) -> Self {
        Self {
            max_before_human,
            strategies,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.max_interventions_before_human,
            config.alternate_strategies.clone(),
        )
    }

    /// Climb one rung and describe the action to take.
    pub fn escalate(&self, state: &mut InterventionState, trouble: &Trouble<'_>) -> InterventionDecision {
        state.count += 1;
        let (action, strategy) = self.action_for(state.count);
        let (guidance, hints) = match action {
            InterventionAction::Continue | InterventionAction::RequireHuman => {
                (None, ActionHints::default())
            }
            InterventionAction::RetryWithGuidance | InterventionAction::ConsultAlternateStrategy => {
                let hints = ActionHints::for_detections(trouble.detections);
                (Some(guidance(trouble, strategy.as_deref(), &hints)), hints)
            }
        };
        state.last_action = Some(action);
        state.guidance.clone_from(&guidance);
        state.strategy.clone_from(&strategy);
        state.hints.clone_from(&hints);

        InterventionDecision {
            level: state.count,
            action,
            strategy,
            guidance,
            hints,
        }
    }

    pub fn reset(state: &mut InterventionState) {
        *state = InterventionState::default();
    }

    /// Action and strategy for a ladder level.
    pub fn action_for(&self, level: u32) -> (InterventionAction, Option<String>) {
        let limit = self.max_before_human;
        if level >= limit {
            return (InterventionAction::RequireHuman, None);
        }
        let first_consult = limit.saturating_sub(2);
        let second_consult = limit.saturating_sub(1);
        let both_consults = first_consult >= 2;

        if level == second_consult && level >= 2 {
            let index = usize::from(both_consults);
            return (InterventionAction::ConsultAlternateStrategy, self.strategy(index));
        }
        if level == first_consult && level >= 2 {
            return (InterventionAction::ConsultAlternateStrategy, self.strategy(0));
        }
        if level >= 2 {
            return (InterventionAction::RetryWithGuidance, None);
        }
        (InterventionAction::Continue, None)
    }

    /// The `index`th distinct alternate strategy.
    fn strategy(&self, index: usize) -> Option<String> {
        match (self.strategies.get(index), self.strategies.first()) {
            (Some(s), _) => Some(s.clone()),
            (None, Some(first)) => Some(format!("{first}#{}", index + 1)),
            (None, None) => None,
        }
    }
}

fn loop_hint(loop_type: LoopType) -> &'static str {
    match loop_type {
        LoopType::ActionRepeat => "check the result of the repeated action before trying it again",
        LoopType::ModificationRepeat => "review the whole change instead of patching the same target again",
        LoopType::RequestRepeat => "use the answers already received or change the request",
        LoopType::PatternCycle => "break the cycle with a different sequence of steps",
    }
}

fn kind_list(kinds: &[ActionKind]) -> String {
    kinds
        .iter()
        .map(ActionKind::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Corrective context summarising the prior attempt.
pub fn guidance(trouble: &Trouble<'_>, strategy: Option<&str>, hints: &ActionHints) -> String {
    let mut text = String::from("The previous attempt did not make progress.");
    if let Some(message) = trouble.last_failure {
        text.push_str(&format!(" Last failure: {message}."));
    }
    if trouble.consecutive_failures > 0 {
        text.push_str(&format!(
            " Consecutive failures: {}.",
            trouble.consecutive_failures
        ));
    }
    for detection in trouble.detections {
        text.push_str(&format!(
            " Loop detected ({}, {}): {}; {}.",
            detection.loop_type.as_str(),
            detection.severity.as_str(),
            detection.description,
            loop_hint(detection.loop_type)
        ));
    }
    if !hints.blocked.is_empty() {
        text.push_str(&format!(" Avoid: {}.", kind_list(&hints.blocked)));
    }
    if !hints.suggested.is_empty() {
        text.push_str(&format!(" Prefer: {}.", kind_list(&hints.suggested)));
    }
    if let Some(strategy) = strategy {
        text.push_str(&format!(" Switch strategy: {strategy}."));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Severity;

    fn ladder(limit: u32) -> InterventionLadder {
        InterventionLadder::new(
            limit,
            vec!["root_cause_analysis".to_string(), "incremental_rewrite".to_string()],
        )
    }

    #[test]
    fn default_ladder_climbs_five_rungs() {
        let ladder = InterventionLadder::default();
        let mut state = InterventionState::default();
        let trouble = Trouble::default();
        let actions: Vec<_> = (0..5)
            .map(|_| ladder.escalate(&mut state, &trouble))
            .map(|d| (d.level, d.action, d.strategy))
            .collect();
        assert_eq!(
            actions,
            vec![
                (1, InterventionAction::Continue, None),
                (2, InterventionAction::RetryWithGuidance, None),
                (3, InterventionAction::ConsultAlternateStrategy, Some("root_cause_analysis".to_string())),
                (4, InterventionAction::ConsultAlternateStrategy, Some("incremental_rewrite".to_string())),
                (5, InterventionAction::RequireHuman, None),
            ]
        );
        assert_eq!(state.last_action, Some(InterventionAction::RequireHuman));
    }

    #[test]
    fn lower_limits_compress_rungs() {
        let four = ladder(4);
        assert_eq!(four.action_for(1).0, InterventionAction::Continue);
        assert_eq!(four.action_for(2).1.as_deref(), Some("root_cause_analysis"));
        assert_eq!(four.action_for(3).1.as_deref(), Some("incremental_rewrite"));
        assert_eq!(four.action_for(4).0, InterventionAction::RequireHuman);

        let three = ladder(3);
        assert_eq!(three.action_for(2).1.as_deref(), Some("root_cause_analysis"));
        assert_eq!(three.action_for(3).0, InterventionAction::RequireHuman);

        let two = ladder(2);
        assert_eq!(two.action_for(1).0, InterventionAction::Continue);
        assert_eq!(two.action_for(2).0, InterventionAction::RequireHuman);

        assert_eq!(ladder(1).action_for(1).0, InterventionAction::RequireHuman);
    }

    #[test]
    fn higher_limits_add_retry_rungs() {
        let seven = ladder(7);
        for level in 2..=4 {
            assert_eq!(seven.action_for(level).0, InterventionAction::RetryWithGuidance);
        }
        assert_eq!(seven.action_for(5).1.as_deref(), Some("root_cause_analysis"));
        assert_eq!(seven.action_for(6).1.as_deref(), Some("incremental_rewrite"));
    }

    #[test]
    fn single_strategy_stays_distinct() {
        let ladder = InterventionLadder::new(5, vec!["bisect".to_string()]);
        assert_eq!(ladder.action_for(3).1.as_deref(), Some("bisect"));
        assert_eq!(ladder.action_for(4).1.as_deref(), Some("bisect#2"));
    }

    #[test]
    fn reset_returns_to_ground() {
        let ladder = InterventionLadder::default();
        let mut state = InterventionState::default();
        ladder.escalate(&mut state, &Trouble::default());
        ladder.escalate(&mut state, &Trouble::default());
        InterventionLadder::reset(&mut state);
        assert_eq!(state, InterventionState::default());
        let decision = ladder.escalate(&mut state, &Trouble::default());
        assert_eq!(decision.action, InterventionAction::Continue);
    }

    #[test]
    fn retry_guidance_describes_prior_attempt() {
        let ladder = InterventionLadder::default();
        let mut state = InterventionState {
            count: 1,
            last_action: Some(InterventionAction::Continue),
            ..InterventionState::default()
        };
        let detections = vec![LoopDetection {
            loop_type: LoopType::ModificationRepeat,
            severity: Severity::Low,
            description: "a.rs modified 4 times".to_string(),
            evidence: Vec::new(),
        }];
        let trouble = Trouble {
            last_failure: Some("tests failed"),
            consecutive_failures: 3,
            detections: &detections,
        };
        let decision = ladder.escalate(&mut state, &trouble);
        assert_eq!(decision.action, InterventionAction::RetryWithGuidance);
        let text = decision.guidance.unwrap();
        assert!(text.contains("tests failed"));
        assert!(text.contains("Consecutive failures: 3"));
        assert!(text.contains("a.rs modified 4 times"));
        assert!(text.contains("Avoid: modify."));
        assert!(text.contains("Prefer: read, request."));
        assert_eq!(state.hints.blocked, vec![ActionKind::Modify]);
        assert_eq!(decision.hints, state.hints);
    }

    #[test]
    fn hints_block_the_repeated_kind_and_never_suggest_it() {
        let event = |kind| crate::types::ActionEvent {
            timestamp: chrono::Utc::now(),
            phase: "coding".to_string(),
            actor: "main".to_string(),
            kind,
            target: Some("a.rs".to_string()),
            fingerprint: String::new(),
            task_id: None,
        };
        let detections = vec![
            LoopDetection {
                loop_type: LoopType::ActionRepeat,
                severity: Severity::Low,
                description: "read repeated".to_string(),
                evidence: vec![event(ActionKind::Read)],
            },
            LoopDetection {
                loop_type: LoopType::RequestRepeat,
                severity: Severity::Low,
                description: "same request".to_string(),
                evidence: vec![event(ActionKind::Request)],
            },
        ];
        let hints = ActionHints::for_detections(&detections);
        assert_eq!(hints.blocked, vec![ActionKind::Read, ActionKind::Request]);
        assert_eq!(hints.suggested, vec![ActionKind::Search, ActionKind::Modify]);
        assert!(ActionHints::for_detections(&[]).is_empty());
    }

    #[test]
    fn hints_are_cleared_on_reset_and_at_human_rung() {
        let ladder = ladder(2);
        let detections = vec![LoopDetection {
            loop_type: LoopType::PatternCycle,
            severity: Severity::Low,
            description: "cycle".to_string(),
            evidence: Vec::new(),
        }];
        let trouble = Trouble {
            detections: &detections,
            ..Trouble::default()
        };
        let mut state = InterventionState {
            hints: ActionHints::for_detections(&detections),
            ..InterventionState::default()
        };
        assert_eq!(state.hints.suggested, vec![ActionKind::Request]);
        ladder.escalate(&mut state, &trouble);
        let decision = ladder.escalate(&mut state, &trouble);
        assert_eq!(decision.action, InterventionAction::RequireHuman);
        assert!(decision.hints.is_empty());
        assert!(state.hints.is_empty());
    }

    #[test]
    fn consult_guidance_names_strategy() {
        let ladder = InterventionLadder::default();
        let mut state = InterventionState {
            count: 2,
            last_action: Some(InterventionAction::RetryWithGuidance),
            ..InterventionState::default()
        };
        let decision = ladder.escalate(&mut state, &Trouble::default());
        assert_eq!(state.strategy.as_deref(), Some("root_cause_analysis"));
        assert_eq!(state.guidance, decision.guidance);
        assert!(decision
            .guidance
            .unwrap()
            .contains("Switch strategy: root_cause_analysis"));
    }
}
