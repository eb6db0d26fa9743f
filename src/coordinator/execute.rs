//! Request routing and invocation.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use super::{CoordinatorEvent, ExecutionCoordinator, ExecutionStatus};
use crate::engine::{Invocation, InvocationSettings, OutputKind, Runspace};
use crate::error::{CoordinatorError, EngineError};
use crate::execution::{
    report, Command, DispatchContext, ExecutionDispatcher, ExecutionOptions, ExecutionResult,
    ExecutionTarget,
};
use crate::frames::{ExecutionRequest, Frame, FrameKind};
use crate::session::CoordinatorState;
use crate::Result;

impl ExecutionCoordinator {
    /// Run a command and wait for its result.
    ///
    /// Errors reported by the command itself are returned inside the
    /// [`ExecutionResult`]; `Err` is reserved for failures of the engine or
    /// the coordinator.
    pub async fn execute(
        &self,
        command: Command,
        options: ExecutionOptions,
    ) -> Result<ExecutionResult> {
        self.execute_cancellable(command, options, &CancellationToken::new())
            .await
    }

    /// Run a command, appending any formatted error text to `errors`.
    pub async fn execute_with_errors(
        &self,
        command: Command,
        options: ExecutionOptions,
        errors: &mut String,
    ) -> Result<Vec<Value>> {
        let result = self.execute(command, options).await?;
        if !result.error_messages.is_empty() {
            if !errors.is_empty() && !errors.ends_with('\n') {
                errors.push('\n');
            }
            errors.push_str(&result.error_messages);
        }
        Ok(result.output)
    }

    /// Run a command. `cancel` is honored while waiting for the session.
    pub async fn execute_cancellable(
        &self,
        command: Command,
        options: ExecutionOptions,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        self.ensure_live()?;

        if options.add_to_history {
            self.current_runspace().add_to_history(&command.text);
        }

        let interrupt = options.interrupt_command_prompt;
        if interrupt {
            debug!("interrupting the foreground read loop");
            self.inner.host.stop_read_loop();
        }

        let result = self.route(command, options, cancel).await;

        if interrupt && self.state() != CoordinatorState::Disposed {
            self.inner.host.start_read_loop();
        }
        result
    }

    /// Run `action` on the thread that owns the pipeline.
    ///
    /// Goes through the idle callback while a foreground read loop is
    /// active; otherwise runs under a lease on a worker thread.
    pub async fn invoke_on_pipeline_thread<F, R>(&self, action: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.ensure_live()?;
        let action = Arc::new(Mutex::new(Some(action)));

        if self.inner.idle.can_execute_on_idle() {
            let slot = Arc::clone(&action);
            let ran = self
                .inner
                .idle
                .execute_on_idle(move || take(&*slot).map(|f| f()))
                .await
                .flatten();
            if let Some(value) = ran {
                return Ok(value);
            }
            debug!("idle callback unavailable; running under a lease");
        }

        let Some(action) = take(&*action) else {
            return Err(CoordinatorError::Misuse(
                "pipeline action already consumed".to_string(),
            ));
        };
        let lease = self
            .inner
            .frames
            .current()
            .acquire_lease(self.current_runspace(), false, &CancellationToken::new())
            .await?;
        tokio::task::spawn_blocking(move || {
            let value = action();
            drop(lease);
            value
        })
        .await
        .map_err(|e| CoordinatorError::Worker(e.to_string()))
    }

    /// Run the host's read loop for one line under a read-line lease.
    ///
    /// Idle work scheduled while the host waits for input runs on the read
    /// loop's thread. Returns `None` when the read loop was stopped.
    pub async fn read_line(&self, cancel: &CancellationToken) -> Result<Option<String>> {
        self.ensure_live()?;
        let lease = self
            .inner
            .frames
            .current()
            .acquire_lease(self.current_runspace(), true, cancel)
            .await?;

        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            this.inner.idle.set_foreground_active(true);
            let line = this.inner.host.read_line(&this.inner.idle);
            this.inner.idle.set_foreground_active(false);
            drop(lease);
            line
        })
        .await
        .map_err(|e| CoordinatorError::Worker(e.to_string()))
    }

    pub(super) fn dispatch_context(&self, frame: &Frame) -> DispatchContext {
        let session = self.current_session();
        DispatchContext {
            frame_kind: frame.kind(),
            remote: frame.is_remote() || session.is_out_of_process(),
            debugger_stopped: self
                .inner
                .capabilities
                .is_debugger_stopped(&*session.runspace),
            foreground_active: self.inner.idle.is_foreground_active(),
            foreground_invoking: self.inner.idle.is_invoking(),
            controller_on_other_thread: frame
                .controller()
                .is_some_and(|c| !c.is_current_thread()),
        }
    }

    async fn route(
        &self,
        command: Command,
        options: ExecutionOptions,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        loop {
            let frame = self.inner.frames.current();
            let context = self.dispatch_context(&frame);
            let target = ExecutionDispatcher::select(&options, &context);
            debug!(frame = frame.id(), ?target, command = %command.text, "routing request");

            let outcome = match target {
                ExecutionTarget::Background => {
                    match self.run_on_idle(&frame, command.clone(), options.clone()).await {
                        Some(result) => result,
                        None => {
                            debug!("foreground loop ended before running idle work");
                            self.run_leased(
                                Arc::clone(&frame),
                                command.clone(),
                                options.clone(),
                                ExecutionTarget::DirectPipeline,
                                cancel,
                            )
                            .await
                        }
                    }
                }
                ExecutionTarget::ThreadController => match frame.controller() {
                    Some(controller) => {
                        let outcome = controller
                            .request_execution(command.clone(), options.clone())
                            .await;
                        if matches!(outcome, Err(CoordinatorError::FrameExited)) {
                            controller.wait_for_finish().await;
                        }
                        outcome
                    }
                    None => Err(CoordinatorError::FrameExited),
                },
                ExecutionTarget::Debugger | ExecutionTarget::DirectPipeline => {
                    self.run_leased(
                        Arc::clone(&frame),
                        command.clone(),
                        options.clone(),
                        target,
                        cancel,
                    )
                    .await
                }
            };

            match outcome {
                Err(CoordinatorError::FrameExited) => {
                    self.ensure_live()?;
                    debug!(frame = frame.id(), "frame exited before servicing request; retrying");
                }
                other => return other,
            }
        }
    }

    async fn run_leased(
        &self,
        frame: Arc<Frame>,
        command: Command,
        options: ExecutionOptions,
        target: ExecutionTarget,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let lease = frame
            .acquire_lease(self.current_runspace(), options.is_read_line, cancel)
            .await?;

        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            let runspace = Arc::clone(lease.runspace());
            let result =
                this.run_invocation(lease.frame(), &runspace, &command, &options, target);
            drop(lease);
            result
        })
        .await
        .map_err(|e| CoordinatorError::Worker(e.to_string()))?
    }

    async fn run_on_idle(
        &self,
        frame: &Arc<Frame>,
        command: Command,
        options: ExecutionOptions,
    ) -> Option<Result<ExecutionResult>> {
        let this = self.clone();
        let frame = Arc::clone(frame);
        let runspace = self.current_runspace();
        self.inner
            .idle
            .execute_on_idle(move || {
                // The read loop holds the frame's lease while it pumps.
                this.run_invocation(
                    &frame,
                    &runspace,
                    &command,
                    &options,
                    ExecutionTarget::Background,
                )
            })
            .await
    }

    /// Service one request on a frame's loop thread.
    pub(super) fn service_request(&self, frame: &Arc<Frame>, request: ExecutionRequest) {
        let command = request.command().clone();
        let options = request.options().clone();
        trace!(frame = frame.id(), command = %command.text, "servicing request on loop thread");

        let result = frame
            .acquire_lease_blocking(self.current_runspace(), options.is_read_line)
            .and_then(|lease| {
                let runspace = Arc::clone(lease.runspace());
                let context = self.dispatch_context(frame);
                let target = if ExecutionDispatcher::debugger_eligible(&options, &context) {
                    ExecutionTarget::Debugger
                } else {
                    ExecutionTarget::DirectPipeline
                };
                let result = self.run_invocation(frame, &runspace, &command, &options, target);
                drop(lease);
                result
            });

        request.complete(result);
    }

    /// Run one command while the caller holds the frame's lease.
    pub(super) fn run_invocation(
        &self,
        frame: &Arc<Frame>,
        runspace: &Arc<dyn Runspace>,
        command: &Command,
        options: &ExecutionOptions,
        target: ExecutionTarget,
    ) -> Result<ExecutionResult> {
        let started = Instant::now();
        self.begin_running();

        if options.write_input_to_host {
            self.inner
                .host
                .write_output(&command.text, true, OutputKind::Normal);
        }

        let in_debugger = target == ExecutionTarget::Debugger;
        let outcome = if in_debugger {
            self.inner
                .capabilities
                .execute_command_in_debugger(&**runspace, command)
                .map(|invocation| {
                    if let Some(action) = invocation.resume_action {
                        debug!(?action, "debugger command resumed execution");
                        if let Some(controller) = frame.controller() {
                            controller.try_complete_exit(action);
                        }
                    }
                    Invocation::output(invocation.output)
                })
        } else {
            let settings = InvocationSettings {
                merge_errors_into_output: options.merge_errors_into_output,
                nested: frame.kind() != FrameKind::TopLevel
                    || target == ExecutionTarget::Background,
            };
            runspace.invoke(command, &settings)
        };

        let mut result = ExecutionResult::default();
        let mut status = ExecutionStatus::Completed;
        let mut failure = None;
        match outcome {
            Ok(invocation) => {
                result.output = invocation.output;
                if !invocation.errors.is_empty() {
                    let text = report::format_errors(&invocation.errors);
                    self.report_error_text(&text, options);
                    result.push_error_text(&text);
                    result.errors = invocation.errors;
                }
            }
            Err(EngineError::Runtime(message)) => {
                warn!(command = %command.text, error = %message, "runtime error during invocation");
                self.report_error_text(&message, options);
                result.push_error_text(&message);
            }
            Err(EngineError::Stopped) => {
                debug!(command = %command.text, "pipeline stopped; partial results dropped");
                result = ExecutionResult::stopped(started.elapsed());
                status = ExecutionStatus::Aborted;
            }
            Err(e @ EngineError::Fatal(_)) => {
                error!(command = %command.text, error = %e, "invocation failed");
                status = ExecutionStatus::Failed;
                failure = Some(e);
            }
        }

        if options.write_output_to_host {
            for line in result.output_lines() {
                self.inner.host.write_output(&line, true, OutputKind::Normal);
            }
        }

        let mut unavailable = false;
        if !runspace.availability().is_usable() {
            warn!(command = %command.text, "session became unavailable; forcing abort");
            unavailable = true;
            self.abort(false);
            self.pop_session();
        } else if self.inner.config.probe_after_execution
            && !command.is_probe()
            && !result.aborted
            && failure.is_none()
            && !frame.controller().is_some_and(|c| c.has_exited())
        {
            self.refresh_session(runspace, in_debugger);
        }

        result.duration = started.elapsed();
        self.finish_running(status, result.had_errors);

        if unavailable {
            return Err(CoordinatorError::SessionUnavailable(format!(
                "session became unavailable while running '{}'",
                command.text
            )));
        }
        match failure {
            Some(e) => Err(e.into()),
            None => Ok(result),
        }
    }

    fn report_error_text(&self, text: &str, options: &ExecutionOptions) {
        if options.write_errors_to_host {
            self.inner.host.write_error(text);
        }
    }

    fn begin_running(&self) {
        self.set_state(CoordinatorState::Running);
        self.emit(CoordinatorEvent::status(ExecutionStatus::Running, false));
    }

    fn finish_running(&self, status: ExecutionStatus, had_errors: bool) {
        let was = {
            let mut state = self.lock_state();
            let was = *state;
            if state.can_transition_to(CoordinatorState::Ready) {
                *state = CoordinatorState::Ready;
            }
            was
        };

        if was == CoordinatorState::Aborting {
            // Abort already reported the outcome.
            self.inner.abort_reported.store(false, Ordering::SeqCst);
            return;
        }
        if was == CoordinatorState::Disposed {
            return;
        }
        if status == ExecutionStatus::Aborted
            && self.inner.abort_reported.swap(false, Ordering::SeqCst)
        {
            return;
        }
        self.emit(CoordinatorEvent::status(status, had_errors));
    }
}

fn take<F>(slot: &Mutex<Option<F>>) -> Option<F> {
    slot.lock().unwrap_or_else(|e| e.into_inner()).take()
}
