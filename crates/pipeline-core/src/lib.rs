pub mod actions;
pub mod config;
pub mod events;
pub mod history;
pub mod intervention;
pub mod loops;
pub mod snapshot;
pub mod types;

pub use actions::ActionTracker;
pub use config::Config;
pub use history::{PhaseState, RunHistoryStore, TrendSummary};
pub use intervention::{ActionHints, InterventionDecision, InterventionLadder, InterventionState};
pub use loops::LoopDetector;
pub use snapshot::{PipelineState, StateStore};
pub use types::*;
