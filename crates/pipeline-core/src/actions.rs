//! Sliding-window log of normalized action events.
//!
//! Key responsibilities:
//! - Normalize reported parameters so that volatile values (timestamps,
//!   request ids, nonces) do not defeat repetition matching.
//! - Fingerprint the normalized parameters.
//! - Keep events only within the retention window and the count cap.

use crate::types::{ActionEvent, ActionReport, Id};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;

pub const DEFAULT_WINDOW_SECONDS: u64 = 300;
pub const DEFAULT_MAX_EVENTS: usize = 500;

const VOLATILE_KEYS: &[&str] = &[
    "timestamp",
    "time",
    "ts",
    "id",
    "uuid",
    "request_id",
    "nonce",
    "seed",
];
const UUID_PLACEHOLDER: &str = "<uuid>";
const TIMESTAMP_PLACEHOLDER: &str = "<timestamp>";

fn is_volatile_key(key: &str) -> bool {
    VOLATILE_KEYS.contains(&key) || key.ends_with("_at") || key.ends_with("_id")
}

/// Strip volatile keys and mask volatile string values, recursively.
pub fn normalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| !is_volatile_key(key))
                .map(|(key, v)| (key.clone(), normalize(v)))
                .collect::<Map<String, Value>>(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        Value::String(s) if uuid::Uuid::try_parse(s).is_ok() => {
            Value::String(UUID_PLACEHOLDER.to_string())
        }
        Value::String(s) if DateTime::parse_from_rfc3339(s).is_ok() => {
            Value::String(TIMESTAMP_PLACEHOLDER.to_string())
        }
        other => other.clone(),
    }
}

/// SHA-256 of the canonical normalized form, first 16 hex characters.
pub fn fingerprint(params: &Value) -> String {
    // serde_json maps are key-sorted, so to_string is canonical.
    let canonical = normalize(params).to_string();
    let digest = Sha256::digest(canonical.as_bytes());
    digest.iter().take(8).map(|b| format!("{b:02x}")).collect()
}

impl ActionEvent {
    pub fn from_report(
        phase: &str,
        report: &ActionReport,
        task_id: Option<&Id>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            timestamp,
            phase: phase.to_string(),
            actor: report.actor.clone(),
            kind: report.kind,
            target: report.target.clone(),
            fingerprint: fingerprint(&report.params),
            task_id: task_id.cloned(),
        }
    }
}

/// Time-windowed, count-capped action log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionTracker {
    window_seconds: u64,
    max_events: usize,
    events: VecDeque<ActionEvent>,
}

impl Default for ActionTracker {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SECONDS, DEFAULT_MAX_EVENTS)
    }
}

impl ActionTracker {
    pub fn new(window_seconds: u64, max_events: usize) -> Self {
        Self {
            window_seconds,
            max_events,
            events: VecDeque::new(),
        }
    }

    /// Apply new retention limits. Takes effect at the next prune.
    pub fn set_limits(&mut self, window_seconds: u64, max_events: usize) {
        self.window_seconds = window_seconds;
        self.max_events = max_events;
    }

    pub fn window_seconds(&self) -> u64 {
        self.window_seconds
    }

    /// Normalize and append a reported action, stamped now.
    pub fn track(&mut self, phase: &str, report: &ActionReport, task_id: Option<&Id>) -> ActionEvent {
        let event = ActionEvent::from_report(phase, report, task_id, Utc::now());
        self.record(event.clone());
        event
    }

    /// Append an already normalized event.
    pub fn record(&mut self, event: ActionEvent) {
        self.events.push_back(event);
        self.enforce_cap();
    }

    /// Drop events older than the window, then the oldest above the cap.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let window = TimeDelta::seconds(i64::try_from(self.window_seconds).unwrap_or(i64::MAX));
        let cutoff = now.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.events.retain(|e| e.timestamp >= cutoff);
        self.enforce_cap();
    }

    fn enforce_cap(&mut self) {
        while self.events.len() > self.max_events {
            self.events.pop_front();
        }
    }

    /// Drop every event reported under `task_id`.
    pub fn forget_task(&mut self, task_id: &Id) -> usize {
        let before = self.events.len();
        self.events.retain(|e| e.task_id.as_ref() != Some(task_id));
        before - self.events.len()
    }

    /// Events oldest first.
    pub fn events(&self) -> impl Iterator<Item = &ActionEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
