//! Routing policy: decides where a request runs.

use super::command::ExecutionOptions;
use crate::frames::FrameKind;

/// Where a request is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionTarget {
    /// Acquire a lease and invoke the pipeline.
    DirectPipeline,
    /// Schedule through the foreground loop's idle callback.
    Background,
    /// Evaluate at the stopped debugger's prompt.
    Debugger,
    /// Hand off to the current frame's thread controller.
    ThreadController,
}

/// Snapshot of coordinator state taken when a request is routed.
///
/// The snapshot is not linearizable with concurrent frame or read-loop
/// transitions; a stale decision is corrected by the caller retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchContext {
    /// Kind of the current frame.
    pub frame_kind: FrameKind,
    /// Current frame is tagged remote, or the current session is remote.
    pub remote: bool,
    /// The engine reports its debugger stopped.
    pub debugger_stopped: bool,
    /// A foreground interactive loop owns the pipeline thread.
    pub foreground_active: bool,
    /// The foreground loop is itself running a command.
    pub foreground_invoking: bool,
    /// The current frame has a controller whose loop runs on another thread.
    pub controller_on_other_thread: bool,
}

impl Default for DispatchContext {
    fn default() -> Self {
        Self {
            frame_kind: FrameKind::TopLevel,
            remote: false,
            debugger_stopped: false,
            foreground_active: false,
            foreground_invoking: false,
            controller_on_other_thread: false,
        }
    }
}

/// Stateless routing policy.
pub struct ExecutionDispatcher;

impl ExecutionDispatcher {
    /// Whether the request may run through the idle callback.
    pub fn background_eligible(options: &ExecutionOptions, ctx: &DispatchContext) -> bool {
        ctx.foreground_active
            && !ctx.foreground_invoking
            && !ctx.remote
            && !options.demands_foreground()
    }

    /// Whether the request may run at the debugger prompt.
    pub fn debugger_eligible(options: &ExecutionOptions, ctx: &DispatchContext) -> bool {
        ctx.debugger_stopped
            && ctx.frame_kind == FrameKind::Debug
            && !(options.is_read_line && ctx.remote)
    }

    /// Pick the target for a request.
    pub fn select(options: &ExecutionOptions, ctx: &DispatchContext) -> ExecutionTarget {
        if Self::debugger_eligible(options, ctx) {
            ExecutionTarget::Debugger
        } else if Self::background_eligible(options, ctx) {
            ExecutionTarget::Background
        } else if ctx.controller_on_other_thread {
            ExecutionTarget::ThreadController
        } else {
            ExecutionTarget::DirectPipeline
        }
    }
}
