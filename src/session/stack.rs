//! Stack of interpreter sessions and context-transition detection.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use super::{SessionDetails, SessionId};
use crate::engine::{EngineVersion, Runspace};

/// Where a session runs relative to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SessionLocation {
    Local,
    Remote,
}

/// How a session came to be current.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SessionContext {
    /// Created or explicitly pushed by the host.
    Original,
    /// A command entered another process on the same machine.
    EnteredProcess,
    /// The debugger stopped inside a different session.
    DebuggedSession,
}

/// One entry on the session stack.
#[derive(Clone)]
pub struct SessionInfo {
    pub id: SessionId,
    pub location: SessionLocation,
    pub context: SessionContext,
    pub version: EngineVersion,
    /// Connection string for remote sessions.
    pub connection_string: Option<String>,
    /// Identity snapshot taken when the session became current.
    pub details: SessionDetails,
    /// Runspace commands are sent to while this session is current.
    pub runspace: Arc<dyn Runspace>,
    /// Close the runspace when the session is popped.
    pub owns_runspace: bool,
}

impl SessionInfo {
    /// Describe a local original session.
    pub fn local(runspace: Arc<dyn Runspace>, details: SessionDetails, owns_runspace: bool) -> Self {
        Self {
            id: SessionId::next(),
            location: SessionLocation::Local,
            context: SessionContext::Original,
            version: runspace.version(),
            connection_string: None,
            details,
            runspace,
            owns_runspace,
        }
    }

    /// Describe a remote original session.
    pub fn remote(
        runspace: Arc<dyn Runspace>,
        details: SessionDetails,
        connection_string: impl Into<String>,
    ) -> Self {
        Self {
            location: SessionLocation::Remote,
            connection_string: Some(connection_string.into()),
            ..Self::local(runspace, details, true)
        }
    }

    /// Whether engine event hooks move with this session.
    pub fn owns_event_hooks(&self) -> bool {
        matches!(
            (self.location, self.context),
            (SessionLocation::Local, SessionContext::Original)
                | (SessionLocation::Local, SessionContext::EnteredProcess)
                | (SessionLocation::Remote, SessionContext::Original)
        )
    }

    /// Whether commands leave the host process.
    pub fn is_out_of_process(&self) -> bool {
        self.location == SessionLocation::Remote || self.context != SessionContext::Original
    }

    /// Serializable view for notifications.
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.to_string(),
            location: self.location,
            context: self.context,
            version: self.version.to_string(),
            connection_string: self.connection_string.clone(),
            details: self.details.clone(),
        }
    }
}

impl fmt::Debug for SessionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionInfo")
            .field("id", &self.id)
            .field("location", &self.location)
            .field("context", &self.context)
            .field("version", &self.version)
            .field("connection_string", &self.connection_string)
            .field("details", &self.details)
            .field("owns_runspace", &self.owns_runspace)
            .finish_non_exhaustive()
    }
}

/// Session description carried by runspace-changed notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub location: SessionLocation,
    pub context: SessionContext,
    pub version: String,
    pub connection_string: Option<String>,
    pub details: SessionDetails,
}

/// A change to apply after an identity probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionTransition {
    /// Pop the current session.
    Pop,
    /// Push a session created by a context change.
    Push {
        context: SessionContext,
        location: SessionLocation,
    },
}

/// Stack of sessions. The bottom entry is the original session and is
/// never popped.
#[derive(Debug)]
pub struct SessionStack {
    sessions: Vec<SessionInfo>,
}

impl SessionStack {
    /// Create a stack holding the original session.
    pub fn new(original: SessionInfo) -> Self {
        Self {
            sessions: vec![original],
        }
    }

    /// Push a session and make it current.
    pub fn push(&mut self, session: SessionInfo) {
        self.sessions.push(session);
    }

    /// Pop the current session. Returns `None` for the original session.
    pub fn pop(&mut self) -> Option<SessionInfo> {
        if self.sessions.len() > 1 {
            self.sessions.pop()
        } else {
            None
        }
    }

    /// The current session.
    pub fn current(&self) -> &SessionInfo {
        // Never empty: `pop` keeps the original session.
        &self.sessions[self.sessions.len() - 1]
    }

    /// The original session.
    pub fn original(&self) -> &SessionInfo {
        &self.sessions[0]
    }

    /// Number of sessions, original included.
    pub fn depth(&self) -> usize {
        self.sessions.len()
    }

    /// Work out which pushes and pops bring the stack in line with `probe`.
    ///
    /// Sessions created by context changes that no longer match are popped
    /// first; the remaining top is then compared against the probe.
    pub fn plan_transitions(
        &self,
        probe: &SessionDetails,
        debugger_stopped: bool,
    ) -> Vec<SessionTransition> {
        let mut plan = Vec::new();
        let mut depth = self.sessions.len();

        while depth > 1 {
            let top = &self.sessions[depth - 1];
            if top.context == SessionContext::Original || top.details.matches(probe) {
                break;
            }
            plan.push(SessionTransition::Pop);
            depth -= 1;
        }

        let top = &self.sessions[depth - 1];
        if top.details.matches(probe) {
            return plan;
        }

        if probe.process_id != top.details.process_id && top.details.same_machine(probe) {
            plan.push(SessionTransition::Push {
                context: SessionContext::EnteredProcess,
                location: top.location,
            });
        } else if debugger_stopped {
            let location = if self.original().details.same_machine(probe) {
                SessionLocation::Local
            } else {
                SessionLocation::Remote
            };
            plan.push(SessionTransition::Push {
                context: SessionContext::DebuggedSession,
                location,
            });
        }

        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LoopbackEngine;

    fn original() -> SessionInfo {
        let engine = Arc::new(LoopbackEngine::new());
        SessionInfo::local(engine, SessionDetails::new(100, "orig", "HOST"), false)
    }

    fn derived(base: &SessionInfo, context: SessionContext, details: SessionDetails) -> SessionInfo {
        SessionInfo {
            id: SessionId::next(),
            context,
            details,
            owns_runspace: false,
            ..base.clone()
        }
    }

    #[test]
    fn test_original_is_never_popped() {
        let mut stack = SessionStack::new(original());
        assert!(stack.pop().is_none());
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn test_push_pop() {
        let base = original();
        let mut stack = SessionStack::new(base.clone());
        let entered = derived(&base, SessionContext::EnteredProcess, SessionDetails::new(200, "e", "HOST"));
        stack.push(entered);
        assert_eq!(stack.depth(), 2);
        assert_eq!(stack.current().context, SessionContext::EnteredProcess);
        assert_eq!(stack.pop().unwrap().details.process_id, 200);
        assert_eq!(stack.current().id, base.id);
    }

    #[test]
    fn test_matching_probe_plans_nothing() {
        let stack = SessionStack::new(original());
        let probe = SessionDetails::new(100, "orig", "HOST");
        assert!(stack.plan_transitions(&probe, false).is_empty());
        assert!(stack.plan_transitions(&probe, true).is_empty());
    }

    #[test]
    fn test_machine_name_case_is_not_an_identity_change() {
        let stack = SessionStack::new(original());
        let probe = SessionDetails::new(100, "orig", "host");
        assert!(stack.plan_transitions(&probe, true).is_empty());
    }

    #[test]
    fn test_new_process_pushes_entered_process() {
        let stack = SessionStack::new(original());
        let probe = SessionDetails::new(200, "other", "HOST");
        assert_eq!(
            stack.plan_transitions(&probe, false),
            vec![SessionTransition::Push {
                context: SessionContext::EnteredProcess,
                location: SessionLocation::Local,
            }]
        );
    }

    #[test]
    fn test_new_instance_needs_stopped_debugger() {
        let stack = SessionStack::new(original());
        let probe = SessionDetails::new(100, "runspace-2", "HOST");
        assert!(stack.plan_transitions(&probe, false).is_empty());
        assert_eq!(
            stack.plan_transitions(&probe, true),
            vec![SessionTransition::Push {
                context: SessionContext::DebuggedSession,
                location: SessionLocation::Local,
            }]
        );
    }

    #[test]
    fn test_debugged_session_on_other_machine_is_remote() {
        let stack = SessionStack::new(original());
        let probe = SessionDetails::new(9, "far", "SERVER");
        assert_eq!(
            stack.plan_transitions(&probe, true),
            vec![SessionTransition::Push {
                context: SessionContext::DebuggedSession,
                location: SessionLocation::Remote,
            }]
        );
    }

    #[test]
    fn test_returning_to_original_pops_once() {
        let base = original();
        let mut stack = SessionStack::new(base.clone());
        stack.push(derived(&base, SessionContext::EnteredProcess, SessionDetails::new(200, "e", "HOST")));

        let probe = base.details.clone();
        assert_eq!(stack.plan_transitions(&probe, false), vec![SessionTransition::Pop]);
        stack.pop();
        assert!(stack.plan_transitions(&probe, false).is_empty());
    }

    #[test]
    fn test_pop_then_push_when_moving_between_processes() {
        let base = original();
        let mut stack = SessionStack::new(base.clone());
        stack.push(derived(&base, SessionContext::EnteredProcess, SessionDetails::new(200, "e", "HOST")));

        let probe = SessionDetails::new(300, "f", "HOST");
        assert_eq!(
            stack.plan_transitions(&probe, false),
            vec![
                SessionTransition::Pop,
                SessionTransition::Push {
                    context: SessionContext::EnteredProcess,
                    location: SessionLocation::Local,
                },
            ]
        );
    }

    #[test]
    fn test_explicit_remote_session_is_not_popped() {
        let base = original();
        let mut stack = SessionStack::new(base.clone());
        let remote = SessionInfo::remote(
            Arc::clone(&base.runspace),
            SessionDetails::new(5, "r", "SERVER"),
            "server.example",
        );
        stack.push(remote);

        let probe = base.details.clone();
        let plan = stack.plan_transitions(&probe, false);
        assert!(!plan.contains(&SessionTransition::Pop));
    }

    #[test]
    fn test_hook_ownership() {
        let base = original();
        assert!(base.owns_event_hooks());
        assert!(!base.is_out_of_process());

        let entered = derived(&base, SessionContext::EnteredProcess, base.details.clone());
        assert!(entered.owns_event_hooks());
        assert!(entered.is_out_of_process());

        let debugged = derived(&base, SessionContext::DebuggedSession, base.details.clone());
        assert!(!debugged.owns_event_hooks());

        let remote = SessionInfo::remote(Arc::clone(&base.runspace), base.details.clone(), "srv");
        assert!(remote.owns_event_hooks());
        assert!(remote.is_out_of_process());

        let remote_entered = SessionInfo {
            context: SessionContext::EnteredProcess,
            ..remote
        };
        assert!(!remote_entered.owns_event_hooks());
    }

    #[test]
    fn test_summary_serializes() {
        let json = serde_json::to_value(original().summary()).unwrap();
        assert_eq!(json["location"], "Local");
        assert_eq!(json["context"], "Original");
        assert_eq!(json["details"]["processId"], 100);
    }
}
