//! Nested execution frames.
//!
//! Every context the interpreter can be stopped in gets a [`Frame`]: the
//! top-level frame, each nested prompt, and each debugger stop. Frames
//! form a stack; only the top one accepts work. Frames above the top
//! level carry a [`ThreadController`] so callers on other threads can
//! hand commands to the thread that owns the frame.
//!
//! Each frame also owns the lock behind [`RunspaceHandle`], so at most one
//! lease per frame is outstanding at any time.

mod controller;
mod lease;

pub use controller::{ExecutionRequest, ThreadController};
pub use lease::RunspaceHandle;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::engine::{ResumeAction, Runspace};
use crate::Result;
use lease::LeaseGate;

/// What kind of context a frame represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    TopLevel,
    NestedPrompt,
    Debug,
}

/// One entry on the frame stack.
pub struct Frame {
    id: u64,
    kind: FrameKind,
    remote: bool,
    controller: Option<Arc<ThreadController>>,
    gate: LeaseGate,
}

impl Frame {
    fn new(id: u64, kind: FrameKind, remote: bool, with_controller: bool) -> Self {
        Self {
            id,
            kind,
            remote,
            controller: with_controller.then(|| Arc::new(ThreadController::new())),
            gate: LeaseGate::default(),
        }
    }

    /// Frame id, unique per stack.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Kind of the frame.
    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    /// Whether the frame runs against an out-of-process session.
    pub fn is_remote(&self) -> bool {
        self.remote
    }

    /// The frame's controller, if it has one.
    pub fn controller(&self) -> Option<&Arc<ThreadController>> {
        self.controller.as_ref()
    }

    /// Whether a lease on this frame is outstanding.
    pub fn is_leased(&self) -> bool {
        self.gate.is_held()
    }

    pub(crate) fn gate(&self) -> &LeaseGate {
        &self.gate
    }

    /// Wait for exclusive access to the frame's session.
    pub async fn acquire_lease(
        self: &Arc<Self>,
        runspace: Arc<dyn Runspace>,
        is_read_line: bool,
        cancel: &CancellationToken,
    ) -> Result<RunspaceHandle> {
        self.gate.acquire(cancel).await?;
        Ok(RunspaceHandle::new(Arc::clone(self), runspace, is_read_line))
    }

    /// Blocking variant for the frame's own loop thread.
    pub fn acquire_lease_blocking(
        self: &Arc<Self>,
        runspace: Arc<dyn Runspace>,
        is_read_line: bool,
    ) -> Result<RunspaceHandle> {
        self.gate.acquire_blocking()?;
        Ok(RunspaceHandle::new(Arc::clone(self), runspace, is_read_line))
    }

    fn tear_down(&self) {
        if let Some(controller) = &self.controller {
            controller.dispose();
        }
        self.gate.close();
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("remote", &self.remote)
            .field("has_controller", &self.controller.is_some())
            .finish()
    }
}

/// Stack of frames. The top-level frame is created with the stack and is
/// never popped.
#[derive(Debug)]
pub struct FrameStack {
    frames: Mutex<Vec<Arc<Frame>>>,
    next_id: AtomicU64,
}

impl FrameStack {
    /// Create a stack holding only the top-level frame.
    pub fn new() -> Self {
        Self {
            frames: Mutex::new(vec![Arc::new(Frame::new(0, FrameKind::TopLevel, false, false))]),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<Frame>>> {
        self.frames.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Push a frame and make it current.
    ///
    /// The frame gets a controller if it is not top-level or if any frame
    /// below already has one.
    pub fn push(&self, kind: FrameKind, remote: bool) -> Arc<Frame> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut frames = self.lock();
        let with_controller =
            kind != FrameKind::TopLevel || frames.iter().any(|f| f.controller.is_some());
        let frame = Arc::new(Frame::new(id, kind, remote, with_controller));
        frames.push(Arc::clone(&frame));
        debug!(frame = id, ?kind, remote, depth = frames.len(), "frame pushed");
        frame
    }

    /// Pop the current frame. The top-level frame is never popped.
    pub fn pop(&self) -> Option<Arc<Frame>> {
        let frame = {
            let mut frames = self.lock();
            if frames.len() <= 1 {
                return None;
            }
            frames.pop()?
        };
        frame.tear_down();
        debug!(frame = frame.id, kind = ?frame.kind, "frame popped");
        Some(frame)
    }

    /// Pop the frame with `id` together with anything still above it.
    /// Returns `false` if the frame is no longer on the stack.
    pub fn pop_frame(&self, id: u64) -> bool {
        let removed: Vec<Arc<Frame>> = {
            let mut frames = self.lock();
            let Some(index) = frames.iter().position(|f| f.id == id) else {
                return false;
            };
            if index == 0 {
                return false;
            }
            frames.drain(index..).rev().collect()
        };
        for frame in &removed {
            frame.tear_down();
            debug!(frame = frame.id, kind = ?frame.kind, "frame popped");
        }
        true
    }

    /// The current frame.
    pub fn current(&self) -> Arc<Frame> {
        let frames = self.lock();
        // Never empty: the top-level frame is not popped.
        Arc::clone(&frames[frames.len() - 1])
    }

    /// Frames from the top level up to the current one.
    pub fn snapshot(&self) -> Vec<Arc<Frame>> {
        self.lock().clone()
    }

    /// Number of frames, top-level included.
    pub fn depth(&self) -> usize {
        self.lock().len()
    }

    /// Number of nested-prompt frames.
    pub fn nested_prompt_level(&self) -> usize {
        self.lock()
            .iter()
            .filter(|f| f.kind == FrameKind::NestedPrompt)
            .count()
    }

    /// Whether the current frame is a debugger stop.
    pub fn is_in_debugger(&self) -> bool {
        self.current().kind == FrameKind::Debug
    }

    /// Whether any frame is a debugger stop.
    pub fn contains_debug(&self) -> bool {
        self.lock().iter().any(|f| f.kind == FrameKind::Debug)
    }

    /// Whether the current frame is a nested prompt.
    pub fn is_in_nested_prompt(&self) -> bool {
        self.current().kind == FrameKind::NestedPrompt
    }

    /// Run `trigger`, then wait until the current frame's exit signal
    /// resolves and the frame is torn down.
    ///
    /// Returns `None` without running `trigger` when the current frame has
    /// no controller.
    pub async fn wait_for_current_frame_exit<F>(&self, trigger: F) -> Option<ResumeAction>
    where
        F: FnOnce(&Arc<Frame>),
    {
        let frame = self.current();
        let controller = Arc::clone(frame.controller.as_ref()?);
        trigger(&frame);
        let action = controller.wait_for_exit().await;
        controller.wait_for_finish().await;
        Some(action)
    }
}

impl Default for FrameStack {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LoopbackEngine;
    use crate::error::CoordinatorError;
    use std::time::Duration;

    #[test]
    fn test_top_level_only() {
        let stack = FrameStack::new();
        assert_eq!(stack.depth(), 1);
        assert_eq!(stack.current().kind(), FrameKind::TopLevel);
        assert!(stack.current().controller().is_none());
        assert!(stack.pop().is_none());
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn test_balanced_push_pop() {
        let stack = FrameStack::new();
        stack.push(FrameKind::NestedPrompt, false);
        stack.push(FrameKind::Debug, false);
        stack.push(FrameKind::NestedPrompt, false);
        assert_eq!(stack.depth(), 4);
        assert_eq!(stack.nested_prompt_level(), 2);
        assert!(stack.contains_debug());
        assert!(stack.is_in_nested_prompt());

        for _ in 0..3 {
            assert!(stack.pop().is_some());
        }
        assert_eq!(stack.depth(), 1);
        assert_eq!(stack.nested_prompt_level(), 0);
        assert!(!stack.contains_debug());
    }

    #[test]
    fn test_pushed_frames_get_controllers() {
        let stack = FrameStack::new();
        let nested = stack.push(FrameKind::NestedPrompt, false);
        assert!(nested.controller().is_some());
        let debug = stack.push(FrameKind::Debug, true);
        assert!(debug.controller().is_some());
        assert!(debug.is_remote());
        assert!(stack.is_in_debugger());
    }

    #[test]
    fn test_pop_disposes_controller_and_gate() {
        let stack = FrameStack::new();
        let frame = stack.push(FrameKind::Debug, false);
        let controller = Arc::clone(frame.controller().unwrap());

        stack.pop();
        assert!(controller.is_finished());
        let engine: Arc<dyn Runspace> = Arc::new(LoopbackEngine::new());
        assert!(matches!(
            frame.acquire_lease_blocking(engine, false),
            Err(CoordinatorError::FrameExited)
        ));
    }

    #[test]
    fn test_pop_frame_removes_frames_above() {
        let stack = FrameStack::new();
        let debug = stack.push(FrameKind::Debug, false);
        let nested = stack.push(FrameKind::NestedPrompt, false);

        assert!(stack.pop_frame(debug.id()));
        assert_eq!(stack.depth(), 1);
        assert!(nested.controller().unwrap().is_finished());
        assert!(!stack.pop_frame(debug.id()));
        assert!(!stack.pop_frame(0));
    }

    #[test]
    fn test_one_lease_per_frame() {
        let stack = FrameStack::new();
        let frame = stack.current();
        let engine: Arc<dyn Runspace> = Arc::new(LoopbackEngine::new());

        let lease = frame.acquire_lease_blocking(Arc::clone(&engine), false).unwrap();
        assert!(frame.is_leased());
        assert!(lease.is_session_available());

        let cancel = CancellationToken::new();
        let mut second = tokio_test::task::spawn(frame.acquire_lease(Arc::clone(&engine), true, &cancel));
        tokio_test::assert_pending!(second.poll());

        drop(lease);
        let second = tokio_test::assert_ready!(second.poll()).unwrap();
        assert!(second.is_read_line());
        second.release();
        assert!(!frame.is_leased());
    }

    #[test]
    fn test_leases_are_per_frame() {
        let stack = FrameStack::new();
        let engine: Arc<dyn Runspace> = Arc::new(LoopbackEngine::new());
        let _top = stack
            .current()
            .acquire_lease_blocking(Arc::clone(&engine), false)
            .unwrap();

        let debug = stack.push(FrameKind::Debug, false);
        let inner = debug.acquire_lease_blocking(engine, false).unwrap();
        assert!(inner.frame().is_leased());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_wait_for_current_frame_exit() {
        let stack = Arc::new(FrameStack::new());
        let frame = stack.push(FrameKind::NestedPrompt, false);

        let looper = {
            let stack = Arc::clone(&stack);
            let frame = Arc::clone(&frame);
            std::thread::spawn(move || {
                let action = frame
                    .controller()
                    .map(|c| c.run_message_loop(|_| {}))
                    .unwrap_or(ResumeAction::Continue);
                stack.pop_frame(frame.id());
                action
            })
        };

        let action = tokio::time::timeout(
            Duration::from_secs(5),
            stack.wait_for_current_frame_exit(|frame| {
                if let Some(controller) = frame.controller() {
                    controller.try_complete_exit(ResumeAction::StepOut);
                }
            }),
        )
        .await
        .unwrap();

        assert_eq!(action, Some(ResumeAction::StepOut));
        assert_eq!(looper.join().unwrap(), ResumeAction::StepOut);
        assert_eq!(stack.depth(), 1);
    }

    #[tokio::test]
    async fn test_wait_without_controller_skips_trigger() {
        let stack = FrameStack::new();
        let mut ran = false;
        let action = stack.wait_for_current_frame_exit(|_| ran = true).await;
        assert_eq!(action, None);
        assert!(!ran);
    }
}
