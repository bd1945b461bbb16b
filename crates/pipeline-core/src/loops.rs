//! Loop detection over the action tracker's window.
//!
//! Four independent detectors run on every pass:
//! - `action_repeat`: the same action signature repeated.
//! - `modification_repeat`: the same target modified, whatever the parameters.
//! - `request_repeat`: outbound requests with identical content.
//! - `pattern_cycle`: a block of two or more signatures repeating back-to-back
//!   within the most recent events.
//!
//! Read-only detections spanning several targets are dropped for phases
//! configured as exploratory.

use crate::actions::ActionTracker;
use crate::config::Config;
use crate::types::{ActionEvent, ActionKind, LoopDetection, LoopType, Severity};
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};

/// Most recent events considered by the cycle detector.
pub const CYCLE_SCAN_LIMIT: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopThresholds {
    pub action_repeat: usize,
    pub modification_repeat: usize,
    pub request_repeat: usize,
    pub cycle_repeat: usize,
}

impl Default for LoopThresholds {
    fn default() -> Self {
        Self {
            action_repeat: 3,
            modification_repeat: 4,
            request_repeat: 3,
            cycle_repeat: 2,
        }
    }
}

impl LoopThresholds {
    pub fn from_config(config: &Config) -> Self {
        Self {
            action_repeat: config.action_repeat_threshold,
            modification_repeat: config.modification_repeat_threshold,
            request_repeat: config.request_repeat_threshold,
            cycle_repeat: config.cycle_repeat_threshold,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoopDetector {
    thresholds: LoopThresholds,
    exploratory_phases: Vec<String>,
}

impl LoopDetector {
    pub fn new(thresholds: LoopThresholds) -> Self {
        Self {
            thresholds,
            exploratory_phases: Vec::new(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(LoopThresholds::from_config(config))
            .with_exploratory_phases(config.exploratory_phases.iter().cloned())
    }

    pub fn with_exploratory_phases<I, S>(mut self, phases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exploratory_phases = phases.into_iter().map(Into::into).collect();
        self
    }

    /// Prune the tracker, then run every detector over what remains.
    ///
    /// Results are ordered most severe first.
    pub fn detect_all(&self, tracker: &mut ActionTracker, now: DateTime<Utc>) -> Vec<LoopDetection> {
        tracker.prune(now);
        let events: Vec<&ActionEvent> = tracker.events().collect();

        let mut detections = Vec::new();
        detections.extend(self.action_repeats(&events));
        detections.extend(self.modification_repeats(&events));
        detections.extend(self.request_repeats(&events));
        detections.extend(self.pattern_cycle(&events));
        detections.retain(|d| !self.is_exploration(d));
        detections.sort_by(|a, b| b.severity.cmp(&a.severity));
        detections
    }

    fn action_repeats(&self, events: &[&ActionEvent]) -> Vec<LoopDetection> {
        group_by(events, |e| Some(e.signature()))
            .into_iter()
            .filter(|(_, group)| group.len() >= self.thresholds.action_repeat)
            .map(|(_, group)| {
                let first = group[0];
                repeat_detection(
                    LoopType::ActionRepeat,
                    format!(
                        "{} by {} in {} repeated {} times on {}",
                        first.kind.as_str(),
                        first.actor,
                        first.phase,
                        group.len(),
                        first.target.as_deref().unwrap_or("-"),
                    ),
                    &group,
                )
            })
            .collect()
    }

    fn modification_repeats(&self, events: &[&ActionEvent]) -> Vec<LoopDetection> {
        group_by(events, |e| {
            if e.kind.is_modification() {
                e.target.clone()
            } else {
                None
            }
        })
        .into_iter()
        .filter(|(_, group)| group.len() >= self.thresholds.modification_repeat)
        .map(|(target, group)| {
            repeat_detection(
                LoopType::ModificationRepeat,
                format!("{target} modified {} times", group.len()),
                &group,
            )
        })
        .collect()
    }

    fn request_repeats(&self, events: &[&ActionEvent]) -> Vec<LoopDetection> {
        group_by(events, |e| {
            (e.kind == ActionKind::Request)
                .then(|| format!("{}:{}#{}", e.phase, e.actor, e.fingerprint))
        })
        .into_iter()
        .filter(|(_, group)| group.len() >= self.thresholds.request_repeat)
        .map(|(_, group)| {
            let first = group[0];
            repeat_detection(
                LoopType::RequestRepeat,
                format!(
                    "{} in {} sent the same request {} times",
                    first.actor,
                    first.phase,
                    group.len()
                ),
                &group,
            )
        })
        .collect()
    }

    /// A block of two or more signatures repeating back-to-back anywhere in
    /// the last `CYCLE_SCAN_LIMIT` events.
    ///
    /// The most repeated block wins. Ties go to the shorter block, then to
    /// the one closest to the newest event.
    fn pattern_cycle(&self, events: &[&ActionEvent]) -> Option<LoopDetection> {
        let threshold = self.thresholds.cycle_repeat.max(2);
        let tail = &events[events.len().saturating_sub(CYCLE_SCAN_LIMIT)..];
        let signatures: Vec<String> = tail.iter().map(|e| e.signature()).collect();
        let n = signatures.len();

        // (cycles, block, start)
        let mut best: Option<(usize, usize, usize)> = None;
        for block in 2..=n / threshold {
            for start in 0..=n - block * threshold {
                let pattern = &signatures[start..start + block];
                if pattern.iter().all(|s| *s == pattern[0]) {
                    continue;
                }
                let cycles = signatures[start..]
                    .chunks_exact(block)
                    .take_while(|chunk| *chunk == pattern)
                    .count();
                if cycles < threshold {
                    continue;
                }
                let better = match best {
                    None => true,
                    Some((c, b, s)) => (cycles, Reverse(block), start) > (c, Reverse(b), s),
                };
                if better {
                    best = Some((cycles, block, start));
                }
            }
        }

        let (cycles, block, start) = best?;
        let evidence: Vec<ActionEvent> = tail[start..start + block * cycles]
            .iter()
            .map(|e| (*e).clone())
            .collect();
        Some(LoopDetection {
            loop_type: LoopType::PatternCycle,
            severity: Severity::from_cycles(cycles),
            description: format!(
                "block of {block} actions repeated {cycles} times: {}",
                signatures[start..start + block].join(" -> ")
            ),
            evidence,
        })
    }

    /// Broad reading across several targets is expected in exploratory
    /// phases and is not treated as a loop there.
    fn is_exploration(&self, detection: &LoopDetection) -> bool {
        if self.exploratory_phases.is_empty() {
            return false;
        }
        let read_only = detection.evidence.iter().all(|e| {
            matches!(e.kind, ActionKind::Read | ActionKind::Search)
                && self.exploratory_phases.contains(&e.phase)
        });
        let targets: BTreeSet<Option<&str>> = detection
            .evidence
            .iter()
            .map(|e| e.target.as_deref())
            .collect();
        read_only && targets.len() > 1
    }
}

fn group_by<'a, F>(events: &[&'a ActionEvent], key: F) -> BTreeMap<String, Vec<&'a ActionEvent>>
where
    F: Fn(&ActionEvent) -> Option<String>,
{
    let mut groups: BTreeMap<String, Vec<&'a ActionEvent>> = BTreeMap::new();
    for &event in events {
        if let Some(k) = key(event) {
            groups.entry(k).or_default().push(event);
        }
    }
    groups
}

fn repeat_detection(loop_type: LoopType, description: String, group: &[&ActionEvent]) -> LoopDetection {
    LoopDetection {
        loop_type,
        severity: Severity::from_count(group.len()),
        description,
        evidence: group.iter().map(|e| (*e).clone()).collect(),
    }
}
