//! Bounded per-phase run history and trend analysis.
//!
//! Each phase keeps a ring of its most recent `PhaseRunRecord`s plus lifetime
//! counters. Trend queries read only the ring, so they follow recent behavior
//! even for long-lived phases. Unknown phases answer as an empty history.

use crate::types::{Id, PhaseRunRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

pub const DEFAULT_MAX_HISTORY: usize = 20;

impl PhaseRunRecord {
    pub fn new<I, S>(success: bool, task_id: Option<Id>, touched: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            timestamp: Utc::now(),
            success,
            task_id,
            touched_artifacts: touched.into_iter().map(Into::into).collect::<BTreeSet<_>>(),
            status_advanced: false,
        }
    }

    pub fn with_status_advanced(mut self, advanced: bool) -> Self {
        self.status_advanced = advanced;
        self
    }
}

/// Trend summary handed to phases as part of their context.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrendSummary {
    pub runs: u64,
    pub consecutive_failures: usize,
    pub consecutive_successes: usize,
    pub recent_success_rate: f64,
    pub improving: bool,
    pub degrading: bool,
    pub oscillating: bool,
}

/// Counters and bounded history for one phase.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseState {
    pub runs: u64,
    pub successes: u64,
    pub failures: u64,
    history: VecDeque<PhaseRunRecord>,
    pub last_run: Option<DateTime<Utc>>,
}

impl PhaseState {
    /// Append a record, evicting the oldest entries beyond `capacity`.
    pub fn record(&mut self, record: PhaseRunRecord, capacity: usize) {
        self.runs += 1;
        if record.success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        self.last_run = Some(record.timestamp);
        self.history.push_back(record);
        self.truncate(capacity);
    }

    fn truncate(&mut self, capacity: usize) {
        while self.history.len() > capacity {
            self.history.pop_front();
        }
    }

    /// Records oldest first.
    pub fn history(&self) -> impl Iterator<Item = &PhaseRunRecord> {
        self.history.iter()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn last_record(&self) -> Option<&PhaseRunRecord> {
        self.history.back()
    }

    pub fn consecutive_failures(&self) -> usize {
        self.history.iter().rev().take_while(|r| !r.success).count()
    }

    pub fn consecutive_successes(&self) -> usize {
        self.history.iter().rev().take_while(|r| r.success).count()
    }

    /// Success fraction of the last `n` entries (or fewer). 0.0 when empty.
    pub fn recent_success_rate(&self, n: usize) -> f64 {
        let start = self.history.len().saturating_sub(n);
        Self::rate(self.history.range(start..))
    }

    /// Lifetime success fraction. 0.0 when no runs.
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        if self.runs == 0 {
            return 0.0;
        }
        self.successes as f64 / self.runs as f64
    }

    /// Last `window` entries succeed strictly more often than the `window`
    /// entries before them.
    pub fn is_improving(&self, window: usize) -> bool {
        self.compare_windows(window)
            .is_some_and(|(earlier, later)| later > earlier)
    }

    /// Last `window` entries succeed strictly less often than the `window`
    /// entries before them.
    pub fn is_degrading(&self, window: usize) -> bool {
        self.compare_windows(window)
            .is_some_and(|(earlier, later)| later < earlier)
    }

    /// At least `threshold` outcome flips within the last `2 * threshold` entries.
    pub fn is_oscillating(&self, threshold: usize) -> bool {
        let span = threshold * 2;
        if threshold == 0 || self.history.len() < span {
            return false;
        }
        let tail: Vec<bool> = self
            .history
            .range(self.history.len() - span..)
            .map(|r| r.success)
            .collect();
        let flips = tail.windows(2).filter(|pair| pair[0] != pair[1]).count();
        flips >= threshold
    }

    pub fn trend(&self, window: usize, oscillation_threshold: usize) -> TrendSummary {
        TrendSummary {
            runs: self.runs,
            consecutive_failures: self.consecutive_failures(),
            consecutive_successes: self.consecutive_successes(),
            recent_success_rate: self.recent_success_rate(window),
            improving: self.is_improving(window),
            degrading: self.is_degrading(window),
            oscillating: self.is_oscillating(oscillation_threshold),
        }
    }

    fn compare_windows(&self, window: usize) -> Option<(f64, f64)> {
        let len = self.history.len();
        if window == 0 || len < window * 2 {
            return None;
        }
        let earlier = Self::rate(self.history.range(len - window * 2..len - window));
        let later = Self::rate(self.history.range(len - window..));
        Some((earlier, later))
    }

    #[allow(clippy::cast_precision_loss)]
    fn rate<'a>(records: impl Iterator<Item = &'a PhaseRunRecord>) -> f64 {
        let (total, ok) = records.fold((0usize, 0usize), |(total, ok), r| {
            (total + 1, ok + usize::from(r.success))
        });
        if total == 0 {
            return 0.0;
        }
        ok as f64 / total as f64
    }
}

/// Per-phase histories keyed by phase name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunHistoryStore {
    max_history: usize,
    phases: BTreeMap<String, PhaseState>,
}

impl Default for RunHistoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HISTORY)
    }
}

impl RunHistoryStore {
    pub fn new(max_history: usize) -> Self {
        Self {
            max_history,
            phases: BTreeMap::new(),
        }
    }

    pub fn max_history(&self) -> usize {
        self.max_history
    }

    /// Apply a new capacity, trimming histories that exceed it.
    pub fn set_max_history(&mut self, max_history: usize) {
        self.max_history = max_history;
        for state in self.phases.values_mut() {
            state.truncate(max_history);
        }
    }

    pub fn record(&mut self, phase: &str, record: PhaseRunRecord) {
        let capacity = self.max_history;
        self.phases
            .entry(phase.to_string())
            .or_default()
            .record(record, capacity);
    }

    pub fn phase(&self, phase: &str) -> Option<&PhaseState> {
        self.phases.get(phase)
    }

    pub fn phases(&self) -> impl Iterator<Item = (&str, &PhaseState)> {
        self.phases.iter().map(|(name, state)| (name.as_str(), state))
    }

    pub fn last_record(&self, phase: &str) -> Option<&PhaseRunRecord> {
        self.phases.get(phase).and_then(PhaseState::last_record)
    }

    pub fn consecutive_failures(&self, phase: &str) -> usize {
        self.phases.get(phase).map_or(0, PhaseState::consecutive_failures)
    }

    pub fn consecutive_successes(&self, phase: &str) -> usize {
        self.phases.get(phase).map_or(0, PhaseState::consecutive_successes)
    }

    pub fn is_improving(&self, phase: &str, window: usize) -> bool {
        self.phases.get(phase).is_some_and(|s| s.is_improving(window))
    }

    pub fn is_degrading(&self, phase: &str, window: usize) -> bool {
        self.phases.get(phase).is_some_and(|s| s.is_degrading(window))
    }

    pub fn is_oscillating(&self, phase: &str, threshold: usize) -> bool {
        self.phases.get(phase).is_some_and(|s| s.is_oscillating(threshold))
    }

    pub fn recent_success_rate(&self, phase: &str, n: usize) -> f64 {
        self.phases.get(phase).map_or(0.0, |s| s.recent_success_rate(n))
    }

    pub fn success_rate(&self, phase: &str) -> f64 {
        self.phases.get(phase).map_or(0.0, PhaseState::success_rate)
    }

    pub fn trend(&self, phase: &str, window: usize, oscillation_threshold: usize) -> TrendSummary {
        self.phases
            .get(phase)
            .map(|s| s.trend(window, oscillation_threshold))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(outcomes: &[bool]) -> RunHistoryStore {
        let mut store = RunHistoryStore::default();
        for &success in outcomes {
            store.record("coding", PhaseRunRecord::new(success, None, ["a.rs"]));
        }
        store
    }

    const S: bool = true;
    const F: bool = false;

    #[test]
    fn counters_stay_consistent() {
        let store = store_with(&[S, F, F, S, S, F]);
        let state = store.phase("coding").unwrap();
        assert_eq!(state.runs, 6);
        assert_eq!(state.successes + state.failures, state.runs);
        assert_eq!(state.successes, 3);
        assert!(state.last_run.is_some());
    }

    #[test]
    fn history_is_bounded_with_fifo_eviction() {
        let mut store = RunHistoryStore::new(3);
        for i in 0..5 {
            let record = PhaseRunRecord::new(true, None, [format!("file{i}")]);
            store.record("coding", record);
        }
        let state = store.phase("coding").unwrap();
        assert_eq!(state.len(), 3);
        assert_eq!(state.runs, 5);
        let first = state.history().next().unwrap();
        assert!(first.touched_artifacts.contains("file2"));
    }

    #[test]
    fn shrinking_capacity_trims_existing_history() {
        let mut store = store_with(&[S; 10]);
        store.set_max_history(4);
        assert_eq!(store.phase("coding").unwrap().len(), 4);
        assert_eq!(store.phase("coding").unwrap().runs, 10);
    }

    #[test]
    fn consecutive_failures_counts_tail_only() {
        assert_eq!(store_with(&[S, S, F, F, F]).consecutive_failures("coding"), 3);
        assert_eq!(store_with(&[F, S, F, S, F]).consecutive_failures("coding"), 1);
        assert_eq!(store_with(&[F, F, S]).consecutive_failures("coding"), 0);
        assert_eq!(store_with(&[F, F, S, S]).consecutive_successes("coding"), 2);
    }

    #[test]
    fn oscillation_requires_enough_flips() {
        assert!(store_with(&[S, F, S, F, S, F]).is_oscillating("coding", 3));
        assert!(!store_with(&[S; 6]).is_oscillating("coding", 3));
        assert!(!store_with(&[F; 6]).is_oscillating("coding", 3));
        assert!(!store_with(&[S, F, S, F]).is_oscillating("coding", 3));
    }

    #[test]
    fn improving_compares_adjacent_windows() {
        let store = store_with(&[S, S, F, F, F, S, S, S, S, S]);
        assert!(store.is_improving("coding", 5));
        assert!(!store.is_degrading("coding", 5));

        let store = store_with(&[S; 10]);
        assert!(!store.is_improving("coding", 5));
        assert!(!store.is_degrading("coding", 5));
    }

    #[test]
    fn improving_needs_two_full_windows() {
        let store = store_with(&[F, F, F, F, S, S, S, S, S]);
        assert!(!store.is_improving("coding", 5));
    }

    #[test]
    fn degrading_is_symmetric() {
        let store = store_with(&[S, S, S, S, S, S, F, F, F, S]);
        assert!(store.is_degrading("coding", 5));
        assert!(!store.is_improving("coding", 5));
    }

    #[test]
    fn recent_success_rate_handles_short_history() {
        assert!((store_with(&[S, F]).recent_success_rate("coding", 5) - 0.5).abs() < f64::EPSILON);
        assert!(store_with(&[]).recent_success_rate("coding", 5).abs() < f64::EPSILON);
        let store = store_with(&[F, F, F, S, S, S, S, F]);
        assert!((store.recent_success_rate("coding", 5) - 0.8).abs() < 1e-9);
    }

    #[test]
    fn unknown_phase_answers_empty() {
        let store = RunHistoryStore::default();
        assert_eq!(store.consecutive_failures("missing"), 0);
        assert!(!store.is_improving("missing", 5));
        assert!(!store.is_oscillating("missing", 3));
        assert!(store.success_rate("missing").abs() < f64::EPSILON);
        assert!(store.last_record("missing").is_none());
        assert_eq!(store.trend("missing", 5, 3), TrendSummary::default());
    }

    #[test]
    fn trend_summarizes_state() {
        let store = store_with(&[S, F, F, F]);
        let trend = store.trend("coding", 5, 3);
        assert_eq!(trend.runs, 4);
        assert_eq!(trend.consecutive_failures, 3);
        assert!((trend.recent_success_rate - 0.25).abs() < f64::EPSILON);
        assert!(!trend.oscillating);
    }
}
