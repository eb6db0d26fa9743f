//! Interfaces to the interpreter engine and the host.
//!
//! The coordinator never talks to an interpreter directly. It goes through:
//!
//! - [`Runspace`]: one interpreter session (invoke, stop, event hooks)
//! - [`EngineCapabilities`]: the fixed set of version-dependent operations,
//!   selected once when the coordinator is initialized
//! - [`EngineEvents`]: callbacks the engine raises on its own thread
//!   (debugger stops, nested prompts, breakpoint changes)
//! - [`HostCallbacks`]: the user-facing host (output, read loop)
//!
//! [`LoopbackEngine`] is a scriptable in-process implementation used by the
//! demo binary and the tests.

mod loopback;

pub use loopback::{Behavior, LoopbackCapabilities, LoopbackEngine};

use std::any::Any;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;
use crate::execution::Command;

/// Engine version as `major.minor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EngineVersion {
    /// Major version.
    pub major: u32,
    /// Minor version.
    pub minor: u32,
}

impl EngineVersion {
    /// Create a new version.
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for EngineVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for EngineVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = s.trim().split_once('.').unwrap_or((s.trim(), "0"));
        let major = major
            .parse()
            .map_err(|_| format!("invalid engine version: '{s}'"))?;
        let minor = minor
            .parse()
            .map_err(|_| format!("invalid engine version: '{s}'"))?;
        Ok(Self { major, minor })
    }
}

impl TryFrom<String> for EngineVersion {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EngineVersion> for String {
    fn from(version: EngineVersion) -> Self {
        version.to_string()
    }
}

/// Whether a runspace can currently accept work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunspaceAvailability {
    /// Idle and ready.
    #[default]
    Available,
    /// Running a command; nested commands may still be accepted.
    Busy,
    /// Broken, closed, or disconnected.
    Unavailable,
}

impl RunspaceAvailability {
    /// Check if the session can still be used at all.
    pub fn is_usable(&self) -> bool {
        !matches!(self, RunspaceAvailability::Unavailable)
    }
}

/// Directive that unblocks a stopped debugger frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResumeAction {
    Continue,
    StepInto,
    StepOver,
    StepOut,
    Stop,
}

/// Details of a native debugger stop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DebuggerStopEvent {
    /// Script being executed, if any.
    pub script_path: Option<String>,
    /// Line of the current statement.
    pub line: Option<u32>,
    /// Breakpoints that triggered the stop.
    pub breakpoint_ids: Vec<u32>,
}

impl DebuggerStopEvent {
    /// Stop at a script location.
    pub fn at(script_path: impl Into<String>, line: u32) -> Self {
        Self {
            script_path: Some(script_path.into()),
            line: Some(line),
            breakpoint_ids: Vec::new(),
        }
    }

    /// Attach the ids of the breakpoints that were hit.
    pub fn with_breakpoints(mut self, ids: impl IntoIterator<Item = u32>) -> Self {
        self.breakpoint_ids.extend(ids);
        self
    }
}

/// Kind of breakpoint change reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BreakpointUpdateKind {
    Set,
    Removed,
    Enabled,
    Disabled,
}

/// A breakpoint changed inside the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointUpdate {
    pub breakpoint_id: u32,
    pub kind: BreakpointUpdateKind,
}

/// Stream a piece of host output belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Normal,
    Error,
    Warning,
    Verbose,
    Debug,
}

/// An error reported by the interpreter for one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Human-readable message.
    pub message: String,
    /// Error category (e.g. `ObjectNotFound`).
    pub category: String,
    /// Fully-qualified error id.
    pub fully_qualified_error_id: String,
    /// Script position where the error was raised.
    pub position: Option<String>,
    /// Underlying cause, if any.
    pub cause: Option<Box<ErrorRecord>>,
}

impl ErrorRecord {
    /// Create an error record with a message and category.
    pub fn new(message: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            category: category.into(),
            fully_qualified_error_id: String::new(),
            position: None,
            cause: None,
        }
    }

    /// Set the fully-qualified error id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.fully_qualified_error_id = id.into();
        self
    }

    /// Set the script position.
    pub fn at(mut self, position: impl Into<String>) -> Self {
        self.position = Some(position.into());
        self
    }

    /// Set the underlying cause.
    pub fn caused_by(mut self, cause: ErrorRecord) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }
}

/// How a command should be invoked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvocationSettings {
    /// Merge the error stream into the output stream.
    pub merge_errors_into_output: bool,
    /// Invoke as a nested pipeline on the current thread.
    pub nested: bool,
}

/// Output of one pipeline invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Invocation {
    /// Result objects.
    pub output: Vec<Value>,
    /// Errors written to the error stream.
    pub errors: Vec<ErrorRecord>,
}

impl Invocation {
    /// Invocation with output only.
    pub fn output(output: Vec<Value>) -> Self {
        Self {
            output,
            errors: Vec::new(),
        }
    }
}

/// Output of a command evaluated at a debugger prompt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DebuggerInvocation {
    /// Result objects.
    pub output: Vec<Value>,
    /// Set when the command resumed the debugger (e.g. `continue`).
    pub resume_action: Option<ResumeAction>,
}

/// One interpreter session.
///
/// Implementations must be safe to call from any thread; the coordinator
/// guarantees that at most one invocation per frame is in flight.
pub trait Runspace: Send + Sync {
    /// Engine version of this session.
    fn version(&self) -> EngineVersion;

    /// Current availability.
    fn availability(&self) -> RunspaceAvailability;

    /// Invoke a command to completion.
    fn invoke(
        &self,
        command: &Command,
        settings: &InvocationSettings,
    ) -> Result<Invocation, EngineError>;

    /// Stop the running pipeline, if any.
    fn stop(&self);

    /// Record a command in the session history.
    fn add_to_history(&self, command: &str);

    /// Subscribe the coordinator to engine events.
    fn register_events(&self, events: Arc<dyn EngineEvents>);

    /// Remove the coordinator's subscription.
    fn unregister_events(&self);

    /// Close the session.
    fn close(&self);

    /// Downcast support for capability implementations.
    fn as_any(&self) -> &dyn Any;
}

/// Version-dependent engine operations.
pub trait EngineCapabilities: Send + Sync {
    /// Whether the debugger of `runspace` is stopped at a breakpoint.
    fn is_debugger_stopped(&self, runspace: &dyn Runspace) -> bool;

    /// One-time debugger setup after initialization.
    fn configure_debugger(&self, runspace: &dyn Runspace);

    /// Evaluate a command at the debugger prompt.
    fn execute_command_in_debugger(
        &self,
        runspace: &dyn Runspace,
        command: &Command,
    ) -> Result<DebuggerInvocation, EngineError>;

    /// Stop the command currently running in the debugger.
    fn stop_command_in_debugger(&self, runspace: &dyn Runspace);

    /// Break into the debugger at the next statement.
    fn pause_debugger(&self, runspace: &dyn Runspace);

    /// Tell the engine to leave its current nested prompt.
    fn exit_nested_prompt(&self, runspace: &dyn Runspace);
}

/// Callbacks raised by the engine, usually on the pipeline thread.
pub trait EngineEvents: Send + Sync {
    /// The debugger stopped. Blocks until the user resumes.
    fn debugger_stopped(&self, event: DebuggerStopEvent) -> ResumeAction;

    /// The engine entered a nested prompt. Blocks until it is exited.
    fn enter_nested_prompt(&self);

    /// A breakpoint was set, removed, enabled, or disabled.
    fn breakpoint_updated(&self, update: BreakpointUpdate);

    /// The session availability changed.
    fn availability_changed(&self, availability: RunspaceAvailability);
}

/// The engine's idle callback, driven by the foreground interactive loop.
pub trait IdlePump {
    /// Run queued idle work. Returns how many items ran.
    fn pump(&self) -> usize;
}

/// The user-facing host. Exactly one implementation is active.
pub trait HostCallbacks: Send + Sync {
    /// Write text to the host.
    fn write_output(&self, text: &str, newline: bool, kind: OutputKind);

    /// Write an error report to the host.
    fn write_error(&self, text: &str) {
        self.write_output(text, true, OutputKind::Error);
    }

    /// (Re)start the foreground interactive read loop.
    fn start_read_loop(&self);

    /// Ask the foreground interactive read loop to stop.
    fn stop_read_loop(&self);

    /// Read one line of input. Implementations call `idle.pump()` while
    /// waiting so background work can run on this thread.
    fn read_line(&self, idle: &dyn IdlePump) -> Option<String>;
}
