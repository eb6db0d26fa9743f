//! Engine callbacks: debugger stops and engine-initiated nested prompts.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use tracing::{debug, info, warn};

use super::{CoordinatorEvent, ExecutionCoordinator, Inner};
use crate::engine::{
    BreakpointUpdate, DebuggerStopEvent, EngineEvents, ResumeAction, RunspaceAvailability,
};
use crate::frames::{FrameKind, ThreadController};
use crate::session::{CoordinatorState, SessionContext};

/// The object registered with the engine. Holds the coordinator weakly so
/// a runspace that outlives it does not keep it alive.
pub(super) struct EventBridge {
    inner: Weak<Inner>,
}

impl EventBridge {
    pub(super) fn new(inner: Weak<Inner>) -> Self {
        Self { inner }
    }

    fn coordinator(&self) -> Option<ExecutionCoordinator> {
        self.inner
            .upgrade()
            .map(|inner| ExecutionCoordinator { inner })
    }
}

impl EngineEvents for EventBridge {
    fn debugger_stopped(&self, event: DebuggerStopEvent) -> ResumeAction {
        match self.coordinator() {
            Some(coordinator) => coordinator.on_debugger_stop(event),
            None => ResumeAction::Continue,
        }
    }

    fn enter_nested_prompt(&self) {
        if let Some(coordinator) = self.coordinator() {
            coordinator.run_engine_nested_prompt();
        }
    }

    fn breakpoint_updated(&self, update: BreakpointUpdate) {
        if let Some(coordinator) = self.coordinator() {
            debug!(breakpoint = update.breakpoint_id, kind = ?update.kind, "breakpoint updated");
            coordinator.emit(CoordinatorEvent::BreakpointUpdated(update));
        }
    }

    fn availability_changed(&self, availability: RunspaceAvailability) {
        if let Some(coordinator) = self.coordinator() {
            debug!(?availability, "runspace availability changed");
            coordinator.inner.availability.send_replace(availability);
        }
    }
}

impl ExecutionCoordinator {
    /// Resume a stopped debugger.
    ///
    /// Nested prompts above the debug frame are unwound first. With `wait`,
    /// returns once the stop loop has observed the resume and the debug
    /// frame is torn down. Returns `false` when no stop is pending.
    pub async fn resume_debugger(&self, action: ResumeAction, wait: bool) -> bool {
        let _gate = self.inner.resume_gate.lock().await;

        for controller in self.unwind_nested_prompts() {
            controller.wait_for_finish().await;
        }

        let Some(controller) = self.complete_debug_exit(action) else {
            warn!(?action, "resume requested with no debugger stop pending");
            return false;
        };
        info!(?action, "resuming debugger");

        if wait {
            controller.wait_for_finish().await;
        }
        true
    }

    /// Service a debugger stop on the engine's thread until it is resumed.
    pub(super) fn on_debugger_stop(&self, event: DebuggerStopEvent) -> ResumeAction {
        info!(
            script = event.script_path.as_deref().unwrap_or("<none>"),
            line = ?event.line,
            "debugger stopped"
        );
        *self.lock_debugger_stop() = Some(event.clone());

        if !self.inner.debugger_attached.load(Ordering::SeqCst) {
            self.emit(CoordinatorEvent::StartDebuggerRequested);
        }

        let interrupted_read_loop = self.inner.idle.is_foreground_active();
        if interrupted_read_loop {
            debug!("stopping the foreground read loop for the debugger");
            self.inner.host.stop_read_loop();
        }

        let session = self.current_session();
        let frame = self
            .inner
            .frames
            .push(FrameKind::Debug, session.is_out_of_process());

        if let Some(controller) = frame.controller() {
            if interrupted_read_loop && self.inner.config.restart_read_loop_after_resume {
                self.arm_read_loop_watchdog(Arc::clone(controller));
            }
        }

        if self.inner.config.probe_after_execution {
            match frame.acquire_lease_blocking(Arc::clone(&session.runspace), false) {
                Ok(lease) => {
                    self.refresh_session(lease.runspace(), true);
                    drop(lease);
                }
                Err(e) => debug!(error = %e, "skipping probe at debugger stop"),
            }
        }

        if !frame.controller().is_some_and(|c| c.has_exited()) {
            self.emit(CoordinatorEvent::DebuggerStop(event));
        }

        let action = self.run_frame_loop(&frame);

        *self.lock_debugger_stop() = None;
        info!(?action, "debugger resumed");
        self.emit(CoordinatorEvent::DebuggerResumed { action });

        if action == ResumeAction::Stop {
            if self.current_session().context == SessionContext::DebuggedSession {
                self.pop_session();
            }
        } else {
            self.set_state(CoordinatorState::Running);
        }

        self.inner.frames.pop_frame(frame.id());
        action
    }

    /// Service a nested prompt the engine entered on its own thread.
    pub(super) fn run_engine_nested_prompt(&self) {
        let remote = self.current_session().is_out_of_process();
        let frame = self.inner.frames.push(FrameKind::NestedPrompt, remote);
        info!(level = self.nested_prompt_level(), "engine entered nested prompt");

        let action = self.run_frame_loop(&frame);
        self.inner.frames.pop_frame(frame.id());
        debug!(?action, "engine nested prompt exited");
    }

    /// Restart the foreground read loop once the debug frame is gone and
    /// the session is usable again.
    fn arm_read_loop_watchdog(&self, controller: Arc<ThreadController>) {
        let this = self.clone();
        self.inner.runtime.spawn(async move {
            controller.wait_for_finish().await;

            let mut availability = this.inner.availability.subscribe();
            while !this.current_runspace().availability().is_usable() {
                if availability.changed().await.is_err() {
                    return;
                }
            }

            if this.state() != CoordinatorState::Disposed {
                debug!("restarting the foreground read loop");
                this.inner.host.start_read_loop();
            }
        });
    }
}
