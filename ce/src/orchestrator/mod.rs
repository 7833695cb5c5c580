//! Conversation orchestration: the per-turn state machine and the
//! auto-loop planner that can chain follow-up turns.

mod engine;
mod planner;

pub use engine::{CANCEL_MARKER, Orchestrator, TurnReport, TurnStatus};
pub use planner::STOP_SENTINEL;
