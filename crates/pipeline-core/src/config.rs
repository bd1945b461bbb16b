//! Configuration parsing for the pipeline daemon.
//!
//! Reads the key=value format of `.pipeline/config`.
//! Precedence: CLI flags > `--config` file > `.pipeline/config` > defaults.
//!
//! Two key families are open-ended:
//! - `phase.<name>=<command>` registers a command-backed phase.
//! - `fallback.<name>=<phase>` overrides `fallback_phase` for one phase.

use crate::types::ProgressPolicy;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("invalid number value for {key}: {value}")]
    InvalidFloat { key: String, value: String },
    #[error("invalid value for {key}: {reason}")]
    InvalidThreshold { key: String, reason: String },
    #[error("no phases registered")]
    NoPhases,
    #[error("{key} refers to unregistered phase '{phase}'")]
    UnknownPhase { key: String, phase: String },
    #[error("no fallback phase configured for '{0}'")]
    MissingFallback(String),
    #[error("initial_phase is not set")]
    MissingInitialPhase,
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Pipeline configuration.
///
/// Field names match the config file keys.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    // Run history
    pub max_history: usize,
    pub trend_window: usize,
    pub oscillation_threshold: usize,

    // Action tracking and loop detection
    pub loop_window_seconds: u64,
    pub max_action_events: usize,
    pub action_repeat_threshold: usize,
    pub modification_repeat_threshold: usize,
    pub request_repeat_threshold: usize,
    pub cycle_repeat_threshold: usize,
    /// Phases where read-only sweeps over several targets are not loops.
    pub exploratory_phases: Vec<String>,

    // Forced transitions
    pub consecutive_failure_threshold: u32,
    pub no_work_threshold: u32,
    pub low_success_rate: f64,
    pub low_success_min_runs: u32,
    pub fallback_phase: Option<String>,
    /// Per-phase overrides from `fallback.<phase>` keys.
    pub fallbacks: BTreeMap<String, String>,

    // Intervention ladder
    pub max_interventions_before_human: u32,
    pub alternate_strategies: Vec<String>,
    pub progress_policy: ProgressPolicy,

    // Execution
    pub initial_phase: String,
    pub phase_timeout_seconds: u64,
    /// Zero means unlimited.
    pub max_iterations: u64,
    /// Commands for command-backed phases, from `phase.<name>` keys.
    pub phase_commands: BTreeMap<String, String>,
    pub phase_workdir: Option<PathBuf>,

    // Persistence
    pub state_dir: PathBuf,
    /// Append observability events to `<state_dir>/events.db`.
    pub event_log: bool,
    /// Copy the previous snapshot to `<state_dir>/backups/` on startup.
    pub backup_on_start: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_history: 20,
            trend_window: 5,
            oscillation_threshold: 3,
            loop_window_seconds: 300,
            max_action_events: 500,
            action_repeat_threshold: 3,
            modification_repeat_threshold: 4,
            request_repeat_threshold: 3,
            cycle_repeat_threshold: 2,
            exploratory_phases: Vec::new(),
            consecutive_failure_threshold: 3,
            no_work_threshold: 3,
            low_success_rate: 0.3,
            low_success_min_runs: 3,
            fallback_phase: None,
            fallbacks: BTreeMap::new(),
            max_interventions_before_human: 5,
            alternate_strategies: vec![
                "root_cause_analysis".to_string(),
                "incremental_rewrite".to_string(),
            ],
            progress_policy: ProgressPolicy::Either,
            initial_phase: String::new(),
            phase_timeout_seconds: 600,
            max_iterations: 0,
            phase_commands: BTreeMap::new(),
            phase_workdir: None,
            state_dir: PathBuf::from(".pipeline"),
            event_log: true,
            backup_on_start: true,
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Parse config content (key=value format).
    pub fn parse_content(&mut self, content: &str) -> Result<()> {
        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    /// Apply a single config value.
    fn apply_value(&mut self, key: &str, value: &str) -> Result<()> {
        if let Some(phase) = key.strip_prefix("phase.") {
            self.phase_commands.insert(phase.to_string(), value.to_string());
            return Ok(());
        }
        if let Some(phase) = key.strip_prefix("fallback.") {
            self.fallbacks.insert(phase.to_string(), value.to_string());
            return Ok(());
        }

        match key {
            "max_history" => self.max_history = Self::parse_int(key, value)?,
            "trend_window" => self.trend_window = Self::parse_int(key, value)?,
            "oscillation_threshold" => self.oscillation_threshold = Self::parse_int(key, value)?,
            "loop_window_seconds" => self.loop_window_seconds = Self::parse_int(key, value)?,
            "max_action_events" => self.max_action_events = Self::parse_int(key, value)?,
            "action_repeat_threshold" => {
                self.action_repeat_threshold = Self::parse_int(key, value)?;
            }
            "modification_repeat_threshold" => {
                self.modification_repeat_threshold = Self::parse_int(key, value)?;
            }
            "request_repeat_threshold" => {
                self.request_repeat_threshold = Self::parse_int(key, value)?;
            }
            "cycle_repeat_threshold" => self.cycle_repeat_threshold = Self::parse_int(key, value)?,
            "exploratory_phases" => self.exploratory_phases = Self::parse_list(value),
            "consecutive_failure_threshold" => {
                self.consecutive_failure_threshold = Self::parse_int(key, value)?;
            }
            "no_work_threshold" => self.no_work_threshold = Self::parse_int(key, value)?,
            "low_success_rate" => {
                self.low_success_rate = value.parse().map_err(|_| ConfigError::InvalidFloat {
                    key: key.to_string(),
                    value: value.to_string(),
                })?;
            }
            "low_success_min_runs" => self.low_success_min_runs = Self::parse_int(key, value)?,
            "fallback_phase" => {
                self.fallback_phase = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            "max_interventions_before_human" => {
                self.max_interventions_before_human = Self::parse_int(key, value)?;
            }
            "alternate_strategies" => self.alternate_strategies = Self::parse_list(value),
            "progress_policy" => {
                self.progress_policy = match value {
                    "either" => ProgressPolicy::Either,
                    "both" => ProgressPolicy::Both,
                    _ => {
                        return Err(ConfigError::InvalidLine(format!(
                            "progress_policy must be 'either' or 'both', got '{value}'"
                        )))
                    }
                }
            }
            "initial_phase" => self.initial_phase = value.to_string(),
            "phase_timeout_seconds" => self.phase_timeout_seconds = Self::parse_int(key, value)?,
            "max_iterations" => self.max_iterations = Self::parse_int(key, value)?,
            "phase_workdir" => {
                self.phase_workdir = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                }
            }
            "state_dir" => self.state_dir = PathBuf::from(value),
            "event_log" => self.event_log = Self::parse_bool(key, value)?,
            "backup_on_start" => self.backup_on_start = Self::parse_bool(key, value)?,
            _ => {
                tracing::warn!(key, "unknown config key, ignoring");
            }
        }
        Ok(())
    }

    fn parse_int<T: FromStr>(key: &str, value: &str) -> Result<T> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Comma-separated list, blanks dropped.
    fn parse_list(value: &str) -> Vec<String> {
        value
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Parse a boolean value.
    fn parse_bool(key: &str, value: &str) -> Result<bool> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Resolve relative paths against a workspace root.
    pub fn resolve_paths(&mut self, workspace_root: &Path) {
        if self.state_dir.is_relative() {
            self.state_dir = workspace_root.join(&self.state_dir);
        }
        if let Some(ref workdir) = self.phase_workdir {
            if workdir.is_relative() {
                self.phase_workdir = Some(workspace_root.join(workdir));
            }
        }
    }

    /// Fallback target for `phase`: `fallback.<phase>` first, then `fallback_phase`.
    pub fn fallback_for(&self, phase: &str) -> Option<&str> {
        self.fallbacks
            .get(phase)
            .map(String::as_str)
            .or(self.fallback_phase.as_deref())
    }

    /// Startup checks against the set of registered phase names.
    ///
    /// Fallbacks are only required when more than one phase is registered;
    /// a single-phase pipeline has nowhere to force a transition to.
    pub fn validate<S: AsRef<str>>(&self, phases: &[S]) -> Result<()> {
        let registered = |name: &str| phases.iter().any(|p| p.as_ref() == name);

        for (key, value) in [
            ("max_history", self.max_history),
            ("trend_window", self.trend_window),
            ("oscillation_threshold", self.oscillation_threshold),
            ("max_action_events", self.max_action_events),
            ("action_repeat_threshold", self.action_repeat_threshold),
            ("modification_repeat_threshold", self.modification_repeat_threshold),
            ("request_repeat_threshold", self.request_repeat_threshold),
        ] {
            if value == 0 {
                return Err(Self::threshold(key, "must be at least 1"));
            }
        }
        for (key, value) in [
            ("consecutive_failure_threshold", self.consecutive_failure_threshold),
            ("no_work_threshold", self.no_work_threshold),
            ("max_interventions_before_human", self.max_interventions_before_human),
        ] {
            if value == 0 {
                return Err(Self::threshold(key, "must be at least 1"));
            }
        }
        if self.cycle_repeat_threshold < 2 {
            return Err(Self::threshold("cycle_repeat_threshold", "must be at least 2"));
        }
        if self.loop_window_seconds == 0 {
            return Err(Self::threshold("loop_window_seconds", "must be positive"));
        }
        if self.phase_timeout_seconds == 0 {
            return Err(Self::threshold("phase_timeout_seconds", "must be positive"));
        }
        if !(0.0..=1.0).contains(&self.low_success_rate) {
            return Err(Self::threshold("low_success_rate", "must be between 0 and 1"));
        }
        if self.alternate_strategies.is_empty() {
            return Err(Self::threshold(
                "alternate_strategies",
                "at least one strategy is required",
            ));
        }

        if phases.is_empty() {
            return Err(ConfigError::NoPhases);
        }
        if self.initial_phase.is_empty() {
            return Err(ConfigError::MissingInitialPhase);
        }
        if !registered(&self.initial_phase) {
            return Err(ConfigError::UnknownPhase {
                key: "initial_phase".to_string(),
                phase: self.initial_phase.clone(),
            });
        }
        if let Some(fallback) = &self.fallback_phase {
            if !registered(fallback) {
                return Err(ConfigError::UnknownPhase {
                    key: "fallback_phase".to_string(),
                    phase: fallback.clone(),
                });
            }
        }
        for (phase, target) in &self.fallbacks {
            for name in [phase, target] {
                if !registered(name) {
                    return Err(ConfigError::UnknownPhase {
                        key: format!("fallback.{phase}"),
                        phase: name.clone(),
                    });
                }
            }
        }
        if phases.len() > 1 {
            for phase in phases {
                if self.fallback_for(phase.as_ref()).is_none() {
                    return Err(ConfigError::MissingFallback(phase.as_ref().to_string()));
                }
            }
        }
        Ok(())
    }

    fn threshold(key: &str, reason: &str) -> ConfigError {
        ConfigError::InvalidThreshold {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_phase_config() -> Config {
        Config {
            initial_phase: "coding".to_string(),
            fallback_phase: Some("review".to_string()),
            ..Config::default()
        }
    }

    #[test]
    fn default_config_has_expected_values() {
        let config = Config::default();
        assert_eq!(config.max_history, 20);
        assert_eq!(config.loop_window_seconds, 300);
        assert_eq!(config.action_repeat_threshold, 3);
        assert_eq!(config.modification_repeat_threshold, 4);
        assert_eq!(config.request_repeat_threshold, 3);
        assert_eq!(config.cycle_repeat_threshold, 2);
        assert_eq!(config.consecutive_failure_threshold, 3);
        assert_eq!(config.no_work_threshold, 3);
        assert_eq!(config.max_interventions_before_human, 5);
        assert_eq!(config.max_action_events, 500);
        assert_eq!(config.progress_policy, ProgressPolicy::Either);
        assert_eq!(config.max_iterations, 0);
        assert_eq!(config.state_dir, PathBuf::from(".pipeline"));
        assert!(config.fallback_phase.is_none());
    }

    #[test]
    fn parse_simple_config() {
        let mut config = Config::default();
        let content = r#"
# thresholds
max_history=50
loop_window_seconds = 120
low_success_rate=0.25
progress_policy="both"
fallback_phase='review'
event_log=off
"#;
        config.parse_content(content).unwrap();
        assert_eq!(config.max_history, 50);
        assert_eq!(config.loop_window_seconds, 120);
        assert!((config.low_success_rate - 0.25).abs() < f64::EPSILON);
        assert_eq!(config.progress_policy, ProgressPolicy::Both);
        assert_eq!(config.fallback_phase.as_deref(), Some("review"));
        assert!(!config.event_log);
    }

    #[test]
    fn parse_phase_and_fallback_keys() {
        let mut config = Config::default();
        let content = r#"
phase.coding="./bin/code --fast"
phase.review=./bin/review
fallback.coding=review
"#;
        config.parse_content(content).unwrap();
        assert_eq!(config.phase_commands.len(), 2);
        assert_eq!(config.phase_commands["coding"], "./bin/code --fast");
        assert_eq!(config.fallback_for("coding"), Some("review"));
        assert_eq!(config.fallback_for("review"), None);
    }

    #[test]
    fn per_phase_fallback_overrides_global() {
        let mut config = two_phase_config();
        config.fallbacks.insert("coding".to_string(), "docs".to_string());
        assert_eq!(config.fallback_for("coding"), Some("docs"));
        assert_eq!(config.fallback_for("review"), Some("review"));
    }

    #[test]
    fn parse_alternate_strategies() {
        let mut config = Config::default();
        config
            .parse_content("alternate_strategies=bisect, minimal_patch ,")
            .unwrap();
        assert_eq!(config.alternate_strategies, vec!["bisect", "minimal_patch"]);
    }

    #[test]
    fn parse_exploratory_phases_and_backup_flag() {
        let mut config = Config::default();
        assert!(config.exploratory_phases.is_empty());
        assert!(config.backup_on_start);
        config
            .parse_content("exploratory_phases=qa, investigation\nbackup_on_start=no")
            .unwrap();
        assert_eq!(config.exploratory_phases, vec!["qa", "investigation"]);
        assert!(!config.backup_on_start);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut config = Config::default();
        assert!(matches!(
            config.parse_content("max_history=lots"),
            Err(ConfigError::InvalidInt { .. })
        ));
        assert!(matches!(
            config.parse_content("event_log=maybe"),
            Err(ConfigError::InvalidBool { .. })
        ));
        assert!(matches!(
            config.parse_content("progress_policy=sometimes"),
            Err(ConfigError::InvalidLine(_))
        ));
        assert!(matches!(
            config.parse_content("no equals sign"),
            Err(ConfigError::InvalidLine(_))
        ));
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let mut config = Config::default();
        config.parse_content("colour=blue").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn unquote_removes_quotes() {
        assert_eq!(Config::unquote("\"hello\""), "hello");
        assert_eq!(Config::unquote("'world'"), "world");
        assert_eq!(Config::unquote("noquotes"), "noquotes");
        assert_eq!(Config::unquote("\""), "\"");
    }

    #[test]
    fn parse_bool_accepts_variants() {
        assert!(Config::parse_bool("test", "true").unwrap());
        assert!(Config::parse_bool("test", "YES").unwrap());
        assert!(!Config::parse_bool("test", "0").unwrap());
        assert!(!Config::parse_bool("test", "off").unwrap());
    }

    #[test]
    fn validate_accepts_registered_phases() {
        two_phase_config().validate(&["coding", "review"]).unwrap();
    }

    #[test]
    fn validate_rejects_unregistered_fallback() {
        let mut config = two_phase_config();
        config.fallback_phase = Some("deploy".to_string());
        assert!(matches!(
            config.validate(&["coding", "review"]),
            Err(ConfigError::UnknownPhase { .. })
        ));
    }

    #[test]
    fn validate_requires_fallback_for_multi_phase() {
        let mut config = two_phase_config();
        config.fallback_phase = None;
        assert!(matches!(
            config.validate(&["coding", "review"]),
            Err(ConfigError::MissingFallback(_))
        ));

        config.fallback_phase = None;
        config.validate(&["coding"]).unwrap();
    }

    #[test]
    fn validate_rejects_zero_thresholds() {
        let mut config = two_phase_config();
        config.max_interventions_before_human = 0;
        assert!(matches!(
            config.validate(&["coding", "review"]),
            Err(ConfigError::InvalidThreshold { .. })
        ));

        let mut config = two_phase_config();
        config.cycle_repeat_threshold = 1;
        assert!(config.validate(&["coding", "review"]).is_err());

        let mut config = two_phase_config();
        config.low_success_rate = 1.5;
        assert!(config.validate(&["coding", "review"]).is_err());
    }

    #[test]
    fn validate_requires_initial_phase() {
        let config = Config {
            initial_phase: String::new(),
            ..two_phase_config()
        };
        assert!(matches!(
            config.validate(&["coding", "review"]),
            Err(ConfigError::MissingInitialPhase)
        ));
        let none: [&str; 0] = [];
        assert!(matches!(config.validate(&none), Err(ConfigError::NoPhases)));
    }

    #[test]
    fn resolve_paths_joins_relative() {
        let mut config = Config {
            phase_workdir: Some(PathBuf::from("work")),
            ..Config::default()
        };
        config.resolve_paths(Path::new("/repo"));
        assert_eq!(config.state_dir, PathBuf::from("/repo/.pipeline"));
        assert_eq!(config.phase_workdir, Some(PathBuf::from("/repo/work")));
    }
}
