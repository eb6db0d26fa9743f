//! The execution coordinator.
//!
//! [`ExecutionCoordinator`] owns the frame stack, the session stack and the
//! idle queue, and is the only way callers reach the interpreter. It is
//! cheap to clone; every clone shares the same state.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use runspace_coordinator::coordinator::{CoordinatorConfig, ExecutionCoordinator};
//! use runspace_coordinator::engine::{HostCallbacks, IdlePump, LoopbackCapabilities, LoopbackEngine, OutputKind};
//! use runspace_coordinator::execution::{Command, ExecutionOptions};
//!
//! struct Quiet;
//!
//! impl HostCallbacks for Quiet {
//!     fn write_output(&self, _: &str, _: bool, _: OutputKind) {}
//!     fn start_read_loop(&self) {}
//!     fn stop_read_loop(&self) {}
//!     fn read_line(&self, _: &dyn IdlePump) -> Option<String> { None }
//! }
//!
//! # async fn run() -> runspace_coordinator::Result<()> {
//! let coordinator = ExecutionCoordinator::initialize(
//!     Arc::new(LoopbackEngine::new()),
//!     true,
//!     Arc::new(Quiet),
//!     Arc::new(LoopbackCapabilities),
//!     CoordinatorConfig::default(),
//! )
//! .await?;
//!
//! let result = coordinator
//!     .execute(Command::new("Get-Date"), ExecutionOptions::default())
//!     .await?;
//! println!("{:?}", result.output);
//! coordinator.dispose().await;
//! # Ok(())
//! # }
//! ```

mod debugger;
mod events;
mod execute;

pub use events::{CoordinatorEvent, ExecutionStatus, RunspaceChangeAction};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures_util::stream::{self, Stream};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, info, warn};

use crate::engine::{
    DebuggerStopEvent, EngineCapabilities, EngineEvents, EngineVersion, HostCallbacks,
    InvocationSettings, ResumeAction, Runspace, RunspaceAvailability,
};
use crate::error::CoordinatorError;
use crate::execution::{Command, InvocationEventQueue};
use crate::frames::{Frame, FrameKind, FrameStack, ThreadController};
use crate::session::{
    CoordinatorState, SessionDetails, SessionId, SessionInfo, SessionStack, SessionTransition,
};
use crate::Result;
use debugger::EventBridge;

/// Runtime settings of a coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Oldest engine version accepted by `initialize`.
    pub minimum_engine_version: EngineVersion,
    /// Re-probe session identity after each request.
    pub probe_after_execution: bool,
    /// Restart an interrupted read loop once the debugger resumes.
    pub restart_read_loop_after_resume: bool,
    /// Capacity of the event channel.
    pub event_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            minimum_engine_version: EngineVersion::new(5, 1),
            probe_after_execution: true,
            restart_read_loop_after_resume: true,
            event_capacity: 256,
        }
    }
}

struct Inner {
    runtime: Handle,
    config: CoordinatorConfig,
    events: broadcast::Sender<CoordinatorEvent>,
    state: Mutex<CoordinatorState>,
    frames: FrameStack,
    sessions: Mutex<SessionStack>,
    idle: InvocationEventQueue,
    host: Arc<dyn HostCallbacks>,
    capabilities: Arc<dyn EngineCapabilities>,
    resume_gate: tokio::sync::Mutex<()>,
    debugger_stop: Mutex<Option<DebuggerStopEvent>>,
    debugger_attached: AtomicBool,
    abort_reported: AtomicBool,
    availability: watch::Sender<RunspaceAvailability>,
    bridge: Arc<EventBridge>,
}

/// Exclusive, thread-affine access to one interpreter session for many
/// concurrent callers.
#[derive(Clone)]
pub struct ExecutionCoordinator {
    inner: Arc<Inner>,
}

impl ExecutionCoordinator {
    /// Validate the engine, probe the session identity, hook engine
    /// events, and move to `Ready`.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn initialize(
        runspace: Arc<dyn Runspace>,
        owns_runspace: bool,
        host: Arc<dyn HostCallbacks>,
        capabilities: Arc<dyn EngineCapabilities>,
        config: CoordinatorConfig,
    ) -> Result<Self> {
        let found = runspace.version();
        if found < config.minimum_engine_version {
            return Err(CoordinatorError::UnsupportedEngineVersion {
                found,
                minimum: config.minimum_engine_version,
            });
        }

        let details = {
            let runspace = Arc::clone(&runspace);
            tokio::task::spawn_blocking(move || probe_session(&*runspace))
                .await
                .map_err(|e| CoordinatorError::Worker(e.to_string()))??
        };

        let original = SessionInfo::local(Arc::clone(&runspace), details, owns_runspace);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| Inner {
            runtime: Handle::current(),
            events,
            state: Mutex::new(CoordinatorState::NotStarted),
            frames: FrameStack::new(),
            sessions: Mutex::new(SessionStack::new(original.clone())),
            idle: InvocationEventQueue::new(),
            host,
            capabilities,
            resume_gate: tokio::sync::Mutex::new(()),
            debugger_stop: Mutex::new(None),
            debugger_attached: AtomicBool::new(false),
            abort_reported: AtomicBool::new(false),
            availability: watch::Sender::new(runspace.availability()),
            bridge: Arc::new(EventBridge::new(weak.clone())),
            config,
        });

        let coordinator = Self { inner };
        if original.owns_event_hooks() {
            runspace.register_events(coordinator.hooks());
        }
        coordinator.inner.capabilities.configure_debugger(&*runspace);
        coordinator.set_state(CoordinatorState::Ready);

        info!(
            version = %found,
            process_id = original.details.process_id,
            "coordinator initialized"
        );
        Ok(coordinator)
    }

    /// Subscribe to coordinator events.
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.inner.events.subscribe()
    }

    /// Coordinator events as a stream. Events missed by a slow consumer
    /// are skipped with a warning; the stream ends when the coordinator is
    /// dropped.
    pub fn event_stream(&self) -> impl Stream<Item = CoordinatorEvent> + Send + 'static {
        stream::unfold(self.subscribe(), |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
    }

    /// Current state.
    pub fn state(&self) -> CoordinatorState {
        *self.lock_state()
    }

    /// Number of frames, top level included.
    pub fn frame_depth(&self) -> usize {
        self.inner.frames.depth()
    }

    /// Number of nested prompts on the frame stack.
    pub fn nested_prompt_level(&self) -> usize {
        self.inner.frames.nested_prompt_level()
    }

    /// Whether a debugger stop is being serviced.
    pub fn is_debugger_stopped(&self) -> bool {
        self.lock_debugger_stop().is_some()
    }

    /// The debugger stop being serviced, if any.
    pub fn debugger_stop_event(&self) -> Option<DebuggerStopEvent> {
        self.lock_debugger_stop().clone()
    }

    /// The session commands are currently sent to.
    pub fn current_session(&self) -> SessionInfo {
        self.lock_sessions().current().clone()
    }

    /// Number of sessions, original included.
    pub fn session_depth(&self) -> usize {
        self.lock_sessions().depth()
    }

    /// Record whether a debugging client is attached. Without one, a
    /// debugger stop raises [`CoordinatorEvent::StartDebuggerRequested`].
    pub fn set_debugger_attached(&self, attached: bool) {
        self.inner.debugger_attached.store(attached, Ordering::SeqCst);
    }

    /// Request that the engine break into the debugger at the next
    /// statement.
    pub fn pause_debugger(&self) {
        let runspace = self.current_runspace();
        self.inner.capabilities.pause_debugger(&*runspace);
    }

    /// Stop the running command.
    ///
    /// With `should_abort_debug_session`, a stopped debugger is resumed with
    /// [`ResumeAction::Stop`] after unwinding any nested prompts; otherwise
    /// the pipeline is stopped. Ignored while already aborting or after
    /// dispose.
    pub fn abort(&self, should_abort_debug_session: bool) {
        let (was, debug_abort) = {
            let mut state = self.lock_state();
            if state.ignores_abort() || *state == CoordinatorState::NotStarted {
                debug!(state = ?*state, "abort ignored");
                return;
            }
            let was = *state;
            *state = CoordinatorState::Aborting;
            let debug_abort = should_abort_debug_session && self.inner.frames.contains_debug();
            // Flag before stopping so the stopped invocation always sees it.
            if was == CoordinatorState::Running || debug_abort {
                self.inner.abort_reported.store(true, Ordering::SeqCst);
            }
            (was, debug_abort)
        };
        info!(debug_session = should_abort_debug_session, "aborting execution");

        let runspace = self.current_runspace();
        if debug_abort {
            self.unwind_nested_prompts();
            self.inner.capabilities.stop_command_in_debugger(&*runspace);
            self.complete_debug_exit(ResumeAction::Stop);
        } else {
            runspace.stop();
        }

        self.emit(CoordinatorEvent::status(ExecutionStatus::Aborted, false));

        if was != CoordinatorState::Running {
            self.set_state(CoordinatorState::Ready);
        }
    }

    /// Enter a nested prompt and service requests on its own thread until
    /// [`exit_nested_prompt`](Self::exit_nested_prompt) is called.
    pub async fn enter_nested_prompt(&self) -> Result<()> {
        self.ensure_live()?;
        let remote = self.current_session().is_out_of_process();
        let frame = self.inner.frames.push(FrameKind::NestedPrompt, remote);
        let (tx, rx) = oneshot::channel();

        let spawned = {
            let this = self.clone();
            let frame = Arc::clone(&frame);
            std::thread::Builder::new()
                .name(format!("nested-prompt-{}", frame.id()))
                .spawn(move || {
                    let action = this.run_frame_loop(&frame);
                    this.inner.frames.pop_frame(frame.id());
                    let _ = tx.send(action);
                })
        };
        if let Err(e) = spawned {
            self.inner.frames.pop_frame(frame.id());
            return Err(e.into());
        }

        info!(level = self.nested_prompt_level(), "entered nested prompt");
        let action = rx
            .await
            .map_err(|_| CoordinatorError::Worker("nested prompt thread exited".to_string()))?;
        debug!(?action, "nested prompt exited");
        Ok(())
    }

    /// Leave the current nested prompt and wait for its frame to be torn
    /// down. Returns `false` when the current frame is not a nested prompt.
    pub async fn exit_nested_prompt(&self) -> bool {
        if !self.inner.frames.is_in_nested_prompt() {
            warn!("exit requested outside a nested prompt");
            return false;
        }

        let runspace = self.current_runspace();
        let capabilities = Arc::clone(&self.inner.capabilities);
        self.inner
            .frames
            .wait_for_current_frame_exit(|frame| {
                capabilities.exit_nested_prompt(&*runspace);
                if let Some(controller) = frame.controller() {
                    controller.try_complete_exit(ResumeAction::Continue);
                }
            })
            .await
            .is_some()
    }

    /// Make `session` current, moving engine event hooks to it if it owns
    /// them.
    pub fn push_session(&self, session: SessionInfo) {
        let previous = {
            let mut sessions = self.lock_sessions();
            let previous = sessions.current().clone();
            sessions.push(session.clone());
            previous
        };

        if session.owns_event_hooks() {
            if previous.owns_event_hooks() {
                previous.runspace.unregister_events();
            }
            session.runspace.register_events(self.hooks());
        }

        info!(
            session = %session.id,
            context = ?session.context,
            location = ?session.location,
            "session pushed"
        );
        self.emit(CoordinatorEvent::RunspaceChanged {
            action: RunspaceChangeAction::Enter,
            session: session.summary(),
        });
    }

    /// Pop the current session. The original session is never popped.
    pub fn pop_session(&self) -> Option<SessionInfo> {
        self.pop_session_with(RunspaceChangeAction::Exit)
    }

    /// Tear everything down: abort, unwind every frame, pop and close every
    /// session except an externally-owned original.
    pub async fn dispose(&self) {
        if self.state() == CoordinatorState::Disposed {
            return;
        }
        info!("disposing coordinator");
        self.abort(true);

        let mut running = Vec::new();
        for frame in self.inner.frames.snapshot().iter().rev() {
            let Some(controller) = frame.controller() else {
                continue;
            };
            controller.try_complete_exit(ResumeAction::Stop);
            if controller.has_loop_thread() {
                running.push(Arc::clone(controller));
            } else {
                self.inner.frames.pop_frame(frame.id());
            }
        }
        for controller in running {
            controller.wait_for_finish().await;
        }

        while self.pop_session_with(RunspaceChangeAction::Shutdown).is_some() {}

        let original = self.lock_sessions().original().clone();
        if original.owns_event_hooks() {
            original.runspace.unregister_events();
        }
        if original.owns_runspace {
            original.runspace.close();
        }

        self.inner.idle.set_foreground_active(false);
        self.set_state(CoordinatorState::Disposed);
    }

    fn pop_session_with(&self, action: RunspaceChangeAction) -> Option<SessionInfo> {
        let (popped, current) = {
            let mut sessions = self.lock_sessions();
            let popped = sessions.pop()?;
            (popped, sessions.current().clone())
        };

        if popped.owns_event_hooks() {
            popped.runspace.unregister_events();
            if current.owns_event_hooks() {
                current.runspace.register_events(self.hooks());
            }
        }
        if popped.owns_runspace {
            popped.runspace.close();
        }

        info!(session = %popped.id, context = ?popped.context, ?action, "session popped");
        self.emit(CoordinatorEvent::RunspaceChanged {
            action,
            session: current.summary(),
        });
        Some(popped)
    }

    /// Compare a fresh identity snapshot against the session stack and
    /// push or pop sessions to match.
    fn apply_probe(&self, details: &SessionDetails) {
        let stopped = self.is_debugger_stopped();
        let plan = self.lock_sessions().plan_transitions(details, stopped);
        for step in plan {
            match step {
                SessionTransition::Pop => {
                    self.pop_session();
                }
                SessionTransition::Push { context, location } => {
                    let base = self.current_session();
                    self.push_session(SessionInfo {
                        id: SessionId::next(),
                        location,
                        context,
                        version: base.version,
                        connection_string: base.connection_string.clone(),
                        details: details.clone(),
                        runspace: Arc::clone(&base.runspace),
                        owns_runspace: false,
                    });
                }
            }
        }
    }

    /// Probe the session identity on the calling thread and update the
    /// session stack. Failures are logged and ignored.
    fn refresh_session(&self, runspace: &Arc<dyn Runspace>, in_debugger: bool) {
        let probed = if in_debugger {
            self.inner
                .capabilities
                .execute_command_in_debugger(&**runspace, &Command::probe())
                .map_err(CoordinatorError::from)
                .and_then(|invocation| SessionDetails::from_probe_output(&invocation.output))
        } else {
            probe_session(&**runspace)
        };

        match probed {
            Ok(details) => self.apply_probe(&details),
            Err(e) => warn!(error = %e, "identity probe failed"),
        }
    }

    /// Complete the exit of every nested prompt above the nearest
    /// non-nested frame. Returns their controllers.
    fn unwind_nested_prompts(&self) -> Vec<Arc<ThreadController>> {
        let runspace = self.current_runspace();
        let mut unwound = Vec::new();
        for frame in self.inner.frames.snapshot().iter().rev() {
            if frame.kind() != FrameKind::NestedPrompt {
                break;
            }
            self.inner.capabilities.exit_nested_prompt(&*runspace);
            if let Some(controller) = frame.controller() {
                controller.try_complete_exit(ResumeAction::Continue);
                unwound.push(Arc::clone(controller));
            }
        }
        if !unwound.is_empty() {
            debug!(count = unwound.len(), "unwinding nested prompts");
        }
        unwound
    }

    /// Resolve the exit of the nearest debug frame, skipping nested prompts
    /// above it.
    fn complete_debug_exit(&self, action: ResumeAction) -> Option<Arc<ThreadController>> {
        let frame = self
            .inner
            .frames
            .snapshot()
            .into_iter()
            .rev()
            .find(|f| f.kind() != FrameKind::NestedPrompt)?;
        if frame.kind() != FrameKind::Debug {
            return None;
        }
        let controller = Arc::clone(frame.controller()?);
        controller.try_complete_exit(action).then_some(controller)
    }

    /// Service requests for `frame` on the calling thread until it exits.
    fn run_frame_loop(&self, frame: &Arc<Frame>) -> ResumeAction {
        let Some(controller) = frame.controller() else {
            return ResumeAction::Continue;
        };
        controller.run_message_loop(|request| self.service_request(frame, request))
    }

    fn current_runspace(&self) -> Arc<dyn Runspace> {
        Arc::clone(&self.lock_sessions().current().runspace)
    }

    fn hooks(&self) -> Arc<dyn EngineEvents> {
        Arc::clone(&self.inner.bridge) as Arc<dyn EngineEvents>
    }

    fn emit(&self, event: CoordinatorEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    fn ensure_live(&self) -> Result<()> {
        if self.state() == CoordinatorState::Disposed {
            Err(CoordinatorError::Disposed)
        } else {
            Ok(())
        }
    }

    /// Move to `target`, logging instead of failing when the transition is
    /// not allowed.
    fn set_state(&self, target: CoordinatorState) -> bool {
        let mut state = self.lock_state();
        if *state == target {
            return true;
        }
        if state.is_terminal() {
            warn!(?target, "coordinator disposed; state change ignored");
            return false;
        }
        match state.transition_to(target) {
            Ok(()) => {
                debug!(state = ?target, "state changed");
                true
            }
            Err(e) => {
                debug!(error = %e, "state change ignored");
                false
            }
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, CoordinatorState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_sessions(&self) -> MutexGuard<'_, SessionStack> {
        self.inner.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_debugger_stop(&self) -> MutexGuard<'_, Option<DebuggerStopEvent>> {
        self.inner
            .debugger_stop
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for ExecutionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionCoordinator")
            .field("state", &self.state())
            .field("frame_depth", &self.frame_depth())
            .field("session_depth", &self.session_depth())
            .finish()
    }
}

/// Run the identity probe as a nested pipeline on the calling thread.
fn probe_session(runspace: &dyn Runspace) -> Result<SessionDetails> {
    let invocation = runspace.invoke(
        &Command::probe(),
        &InvocationSettings {
            merge_errors_into_output: false,
            nested: true,
        },
    )?;
    SessionDetails::from_probe_output(&invocation.output)
}
