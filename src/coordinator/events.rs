//! Notifications raised by the coordinator.

use serde::Serialize;

use crate::engine::{BreakpointUpdate, DebuggerStopEvent, ResumeAction};
use crate::session::SessionSummary;

/// Progress of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Aborted,
}

/// Why the current session changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunspaceChangeAction {
    Enter,
    Exit,
    Shutdown,
}

/// Event delivered to every subscriber of
/// [`ExecutionCoordinator::subscribe`](super::ExecutionCoordinator::subscribe).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum CoordinatorEvent {
    /// A session was pushed or popped.
    RunspaceChanged {
        action: RunspaceChangeAction,
        /// The session that is current after the change.
        session: SessionSummary,
    },
    /// An execution started or finished.
    ExecutionStatusChanged {
        status: ExecutionStatus,
        had_errors: bool,
    },
    /// The debugger stopped.
    DebuggerStop(DebuggerStopEvent),
    /// The debugger resumed.
    DebuggerResumed { action: ResumeAction },
    /// A breakpoint changed inside the engine.
    BreakpointUpdated(BreakpointUpdate),
    /// The debugger stopped while no debugging client is attached.
    StartDebuggerRequested,
}

impl CoordinatorEvent {
    pub(crate) fn status(status: ExecutionStatus, had_errors: bool) -> Self {
        Self::ExecutionStatusChanged { status, had_errors }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_event_json() {
        let event = CoordinatorEvent::status(ExecutionStatus::Completed, true);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "executionStatusChanged");
        assert_eq!(json["status"], "Completed");
        assert_eq!(json["had_errors"], true);
    }

    #[test]
    fn test_debugger_stop_event_json() {
        let event = CoordinatorEvent::DebuggerStop(DebuggerStopEvent::at("script.ps1", 4).with_breakpoints([2]));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "debuggerStop");
        assert_eq!(json["scriptPath"], "script.ps1");
        assert_eq!(json["line"], 4);
        assert_eq!(json["breakpointIds"][0], 2);
    }

    #[test]
    fn test_resumed_event_json() {
        let event = CoordinatorEvent::DebuggerResumed {
            action: ResumeAction::StepOver,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "debuggerResumed");
        assert_eq!(json["action"], "StepOver");
    }
}
