//! Scriptable in-process engine.
//!
//! `LoopbackEngine` answers commands from a table of scripted behaviors
//! and echoes anything it does not know. It raises debugger stops and
//! nested prompts on the invoking thread the way a real interpreter does,
//! which makes it suitable for driving the coordinator end to end.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use serde_json::{json, Value};
use tracing::{debug, trace};

use super::{
    DebuggerInvocation, DebuggerStopEvent, EngineCapabilities, EngineEvents, EngineVersion,
    ErrorRecord, Invocation, InvocationSettings, ResumeAction, Runspace, RunspaceAvailability,
};
use crate::error::EngineError;
use crate::execution::Command;
use crate::session::SessionDetails;

/// What the loopback engine does when it sees a command.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Return these objects.
    Output(Vec<Value>),
    /// Write an error record and return no output.
    Fail(ErrorRecord),
    /// Fail the invocation with a runtime error.
    Throw(String),
    /// Fail the invocation with an unrecoverable error.
    Fatal(String),
    /// Run until the pipeline is stopped.
    Block,
    /// Run until [`LoopbackEngine::release_held`] is called, ignoring stop
    /// requests, then report the pipeline as stopped.
    Hold,
    /// Hit a breakpoint and wait for the debugger to resume.
    Break(DebuggerStopEvent),
    /// Enter a nested prompt and wait for it to be exited.
    NestedPrompt,
    /// Change the identity reported by the probe (entering a process).
    SwitchIdentity(SessionDetails),
    /// Break the session.
    Unavailable,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Counters {
    invocations: usize,
    stop_calls: usize,
    registrations: usize,
    unregistrations: usize,
    debugger_stop_commands: usize,
    pause_calls: usize,
    exit_nested_calls: usize,
    configure_calls: usize,
}

struct State {
    version: EngineVersion,
    details: SessionDetails,
    availability: RunspaceAvailability,
    scripts: HashMap<String, Behavior>,
    history: Vec<String>,
    events: Option<Arc<dyn EngineEvents>>,
    active: usize,
    blocked: usize,
    stopped_depth: usize,
    stop_requested: bool,
    hold_released: bool,
    hold_next_probe: bool,
    closed: bool,
    counters: Counters,
}

/// In-process engine driven by scripted behaviors.
pub struct LoopbackEngine {
    state: Mutex<State>,
    changed: Condvar,
}

impl LoopbackEngine {
    /// Create an engine reporting version 7.4 on a local machine.
    pub fn new() -> Self {
        let details = SessionDetails::new(std::process::id(), "loopback-0", "localhost");
        Self {
            state: Mutex::new(State {
                version: EngineVersion::new(7, 4),
                details,
                availability: RunspaceAvailability::Available,
                scripts: HashMap::new(),
                history: Vec::new(),
                events: None,
                active: 0,
                blocked: 0,
                stopped_depth: 0,
                stop_requested: false,
                hold_released: false,
                hold_next_probe: false,
                closed: false,
                counters: Counters::default(),
            }),
            changed: Condvar::new(),
        }
    }

    /// Report a different engine version.
    pub fn with_version(self, version: EngineVersion) -> Self {
        self.lock().version = version;
        self
    }

    /// Report a different identity.
    pub fn with_details(self, details: SessionDetails) -> Self {
        self.lock().details = details;
        self
    }

    /// Script a behavior for a command text.
    pub fn with_script(self, text: impl Into<String>, behavior: Behavior) -> Self {
        self.set_script(text, behavior);
        self
    }

    /// Script a behavior on a shared engine.
    pub fn set_script(&self, text: impl Into<String>, behavior: Behavior) {
        self.lock().scripts.insert(text.into(), behavior);
    }

    /// Current identity.
    pub fn details(&self) -> SessionDetails {
        self.lock().details.clone()
    }

    /// Replace the identity reported by the probe.
    pub fn set_details(&self, details: SessionDetails) {
        self.lock().details = details;
    }

    /// Commands recorded in history, oldest first.
    pub fn history(&self) -> Vec<String> {
        self.lock().history.clone()
    }

    /// How many times `stop` was called.
    pub fn stop_calls(&self) -> usize {
        self.lock().counters.stop_calls
    }

    /// How many invocations started.
    pub fn invocations(&self) -> usize {
        self.lock().counters.invocations
    }

    /// How many times event hooks were registered.
    pub fn registrations(&self) -> usize {
        self.lock().counters.registrations
    }

    /// How many times event hooks were removed.
    pub fn unregistrations(&self) -> usize {
        self.lock().counters.unregistrations
    }

    /// Whether event hooks are currently registered.
    pub fn has_event_hooks(&self) -> bool {
        self.lock().events.is_some()
    }

    /// How many times the debugger command was stopped.
    pub fn debugger_stop_commands(&self) -> usize {
        self.lock().counters.debugger_stop_commands
    }

    /// How many times the engine was told to exit a nested prompt.
    pub fn exit_nested_calls(&self) -> usize {
        self.lock().counters.exit_nested_calls
    }

    /// How many times the debugger was configured.
    pub fn configure_calls(&self) -> usize {
        self.lock().counters.configure_calls
    }

    /// How many times a pause was requested.
    pub fn pause_calls(&self) -> usize {
        self.lock().counters.pause_calls
    }

    /// Whether the session was closed.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Make the next identity probe wait for [`release_held`](Self::release_held)
    /// before answering.
    pub fn hold_next_probe(&self) {
        self.lock().hold_next_probe = true;
    }

    /// Let one `Hold` command or held probe finish.
    pub fn release_held(&self) {
        self.lock().hold_released = true;
        self.changed.notify_all();
    }

    /// Whether a `Block` or `Hold` command or a held probe is currently waiting.
    pub fn is_blocked(&self) -> bool {
        self.lock().blocked > 0
    }

    /// Whether a breakpoint is being serviced.
    pub fn is_stopped_in_debugger(&self) -> bool {
        self.lock().stopped_depth > 0
    }

    /// Change availability and notify the registered hooks.
    pub fn set_availability(&self, availability: RunspaceAvailability) {
        let events = {
            let mut state = self.lock();
            state.availability = availability;
            state.events.clone()
        };
        if let Some(events) = events {
            events.availability_changed(availability);
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // Plain bookkeeping; a panicking test thread must not wedge the rest.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn events(&self) -> Option<Arc<dyn EngineEvents>> {
        self.lock().events.clone()
    }

    fn run(&self, command: &Command) -> Result<Invocation, EngineError> {
        if command.is_probe() {
            let held = std::mem::take(&mut self.lock().hold_next_probe);
            if held {
                self.wait_for_release();
            }
            let details = self.details();
            return Ok(Invocation::output(vec![json!({
                "processId": details.process_id,
                "instanceId": details.instance_id,
                "machineName": details.machine_name,
            })]));
        }

        let behavior = self.lock().scripts.get(&command.text).cloned();
        let Some(behavior) = behavior else {
            return Ok(Invocation::output(vec![Value::String(command.text.clone())]));
        };

        match behavior {
            Behavior::Output(values) => Ok(Invocation::output(values)),
            Behavior::Fail(record) => Ok(Invocation {
                output: Vec::new(),
                errors: vec![record],
            }),
            Behavior::Throw(message) => Err(EngineError::Runtime(message)),
            Behavior::Fatal(message) => Err(EngineError::Fatal(message)),
            Behavior::Block => self.block_until_stopped(),
            Behavior::Hold => self.hold_until_released(),
            Behavior::Break(event) => self.hit_breakpoint(event),
            Behavior::NestedPrompt => {
                if let Some(events) = self.events() {
                    events.enter_nested_prompt();
                }
                Ok(Invocation::default())
            }
            Behavior::SwitchIdentity(details) => {
                debug!(process_id = details.process_id, "loopback identity switched");
                self.set_details(details);
                Ok(Invocation::default())
            }
            Behavior::Unavailable => {
                self.set_availability(RunspaceAvailability::Unavailable);
                Ok(Invocation::default())
            }
        }
    }

    fn block_until_stopped(&self) -> Result<Invocation, EngineError> {
        let mut state = self.lock();
        state.blocked += 1;
        self.changed.notify_all();
        while !state.stop_requested {
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
        state.blocked -= 1;
        Err(EngineError::Stopped)
    }

    fn hold_until_released(&self) -> Result<Invocation, EngineError> {
        self.wait_for_release();
        Err(EngineError::Stopped)
    }

    fn wait_for_release(&self) {
        let mut state = self.lock();
        state.blocked += 1;
        self.changed.notify_all();
        while !state.hold_released {
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
        state.hold_released = false;
        state.blocked -= 1;
    }

    fn hit_breakpoint(&self, event: DebuggerStopEvent) -> Result<Invocation, EngineError> {
        let Some(events) = self.events() else {
            return Ok(Invocation::default());
        };

        self.lock().stopped_depth += 1;
        let action = events.debugger_stopped(event);
        self.lock().stopped_depth -= 1;

        trace!(?action, "loopback breakpoint resumed");
        match action {
            ResumeAction::Stop => Err(EngineError::Stopped),
            _ => Ok(Invocation::default()),
        }
    }
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Runspace for LoopbackEngine {
    fn version(&self) -> EngineVersion {
        self.lock().version
    }

    fn availability(&self) -> RunspaceAvailability {
        self.lock().availability
    }

    fn invoke(
        &self,
        command: &Command,
        settings: &InvocationSettings,
    ) -> Result<Invocation, EngineError> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(EngineError::Fatal("runspace is closed".to_string()));
            }
            if state.active == 0 {
                state.stop_requested = false;
            }
            state.active += 1;
            state.counters.invocations += 1;
        }
        trace!(command = %command.text, nested = settings.nested, "loopback invoke");

        let mut result = self.run(command);
        if settings.merge_errors_into_output {
            if let Ok(invocation) = &mut result {
                let errors = std::mem::take(&mut invocation.errors);
                invocation
                    .output
                    .extend(errors.into_iter().map(|e| Value::String(e.message)));
            }
        }

        self.lock().active -= 1;
        result
    }

    fn stop(&self) {
        let mut state = self.lock();
        state.counters.stop_calls += 1;
        state.stop_requested = true;
        self.changed.notify_all();
    }

    fn add_to_history(&self, command: &str) {
        self.lock().history.push(command.to_string());
    }

    fn register_events(&self, events: Arc<dyn EngineEvents>) {
        let mut state = self.lock();
        state.events = Some(events);
        state.counters.registrations += 1;
    }

    fn unregister_events(&self) {
        let mut state = self.lock();
        if state.events.take().is_some() {
            state.counters.unregistrations += 1;
        }
    }

    fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.availability = RunspaceAvailability::Unavailable;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Capabilities for runspaces backed by [`LoopbackEngine`].
///
/// Operations on any other runspace type report "not stopped" or fail.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoopbackCapabilities;

impl LoopbackCapabilities {
    fn engine(runspace: &dyn Runspace) -> Option<&LoopbackEngine> {
        runspace.as_any().downcast_ref::<LoopbackEngine>()
    }

    fn resume_action(text: &str) -> Option<ResumeAction> {
        match text.trim() {
            "c" | "continue" => Some(ResumeAction::Continue),
            "s" | "stepInto" => Some(ResumeAction::StepInto),
            "v" | "stepOver" => Some(ResumeAction::StepOver),
            "o" | "stepOut" => Some(ResumeAction::StepOut),
            "q" | "quit" => Some(ResumeAction::Stop),
            _ => None,
        }
    }
}

impl EngineCapabilities for LoopbackCapabilities {
    fn is_debugger_stopped(&self, runspace: &dyn Runspace) -> bool {
        Self::engine(runspace).is_some_and(|e| e.is_stopped_in_debugger())
    }

    fn configure_debugger(&self, runspace: &dyn Runspace) {
        if let Some(engine) = Self::engine(runspace) {
            engine.lock().counters.configure_calls += 1;
        }
    }

    fn execute_command_in_debugger(
        &self,
        runspace: &dyn Runspace,
        command: &Command,
    ) -> Result<DebuggerInvocation, EngineError> {
        let engine = Self::engine(runspace)
            .ok_or_else(|| EngineError::Fatal("unsupported runspace".to_string()))?;
        if !engine.is_stopped_in_debugger() {
            return Err(EngineError::Runtime("the debugger is not stopped".to_string()));
        }

        if let Some(action) = Self::resume_action(&command.text) {
            return Ok(DebuggerInvocation {
                output: Vec::new(),
                resume_action: Some(action),
            });
        }

        let invocation = engine.invoke(
            command,
            &InvocationSettings {
                merge_errors_into_output: true,
                nested: true,
            },
        )?;
        Ok(DebuggerInvocation {
            output: invocation.output,
            resume_action: None,
        })
    }

    fn stop_command_in_debugger(&self, runspace: &dyn Runspace) {
        if let Some(engine) = Self::engine(runspace) {
            engine.lock().counters.debugger_stop_commands += 1;
        }
    }

    fn pause_debugger(&self, runspace: &dyn Runspace) {
        if let Some(engine) = Self::engine(runspace) {
            engine.lock().counters.pause_calls += 1;
        }
    }

    fn exit_nested_prompt(&self, runspace: &dyn Runspace) {
        if let Some(engine) = Self::engine(runspace) {
            engine.lock().counters.exit_nested_calls += 1;
        }
    }
}
