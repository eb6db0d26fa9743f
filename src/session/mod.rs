//! Interpreter sessions.
//!
//! This module tracks which interpreter session commands are sent to:
//! the coordinator state machine, identity snapshots taken by the probe
//! command, and the session stack that follows entered processes and
//! debugged sessions.

mod details;
mod id;
mod stack;
mod state;

pub use details::SessionDetails;
pub use id::SessionId;
pub use stack::{
    SessionContext, SessionInfo, SessionLocation, SessionStack, SessionSummary, SessionTransition,
};
pub use state::CoordinatorState;
