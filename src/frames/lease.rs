//! Exclusive access to a frame's interpreter session.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use super::Frame;
use crate::engine::Runspace;
use crate::error::CoordinatorError;
use crate::Result;

#[derive(Debug, Default)]
struct GateState {
    held: bool,
    closed: bool,
}

/// Per-frame lock handing out at most one lease at a time.
///
/// A lease is not tied to the thread that took it: async callers acquire
/// on a runtime worker and release on the blocking thread that ran the
/// invocation.
///
/// Loop threads wait on the condition variable; async callers wait on
/// the `Notify`. Every release wakes both kinds of waiter.
#[derive(Debug, Default)]
pub(crate) struct LeaseGate {
    state: Mutex<GateState>,
    released: Condvar,
    notify: Notify,
}

impl LeaseGate {
    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn try_take(&self) -> Result<bool> {
        let mut state = self.lock();
        if state.closed {
            return Err(CoordinatorError::FrameExited);
        }
        if state.held {
            return Ok(false);
        }
        state.held = true;
        Ok(true)
    }

    /// Wait until the gate is free or `cancel` fires.
    pub(crate) async fn acquire(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.try_take()? {
                return Ok(());
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(CoordinatorError::Cancelled),
                _ = &mut notified => {}
            }
        }
    }

    /// Block the calling thread until the gate is free.
    pub(crate) fn acquire_blocking(&self) -> Result<()> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(CoordinatorError::FrameExited);
            }
            if !state.held {
                state.held = true;
                return Ok(());
            }
            state = self
                .released
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    pub(crate) fn release(&self, frame: u64) {
        {
            let mut state = self.lock();
            if !state.held {
                warn!(frame, "lease released with no outstanding acquire");
                return;
            }
            state.held = false;
        }
        self.released.notify_all();
        self.notify.notify_waiters();
    }

    /// Fail every current and future acquire with `FrameExited`.
    pub(crate) fn close(&self) {
        self.lock().closed = true;
        self.released.notify_all();
        self.notify.notify_waiters();
    }

    pub(crate) fn is_held(&self) -> bool {
        self.lock().held
    }
}

/// Scoped ticket for exclusive use of one frame's session.
///
/// Dropping the handle releases it.
pub struct RunspaceHandle {
    frame: Arc<Frame>,
    runspace: Arc<dyn Runspace>,
    is_read_line: bool,
    released: bool,
}

impl RunspaceHandle {
    pub(crate) fn new(frame: Arc<Frame>, runspace: Arc<dyn Runspace>, is_read_line: bool) -> Self {
        trace!(frame = frame.id(), is_read_line, "lease acquired");
        Self {
            frame,
            runspace,
            is_read_line,
            released: false,
        }
    }

    /// The session this lease grants access to.
    pub fn runspace(&self) -> &Arc<dyn Runspace> {
        &self.runspace
    }

    /// The frame that owns the session.
    pub fn frame(&self) -> &Arc<Frame> {
        &self.frame
    }

    /// Whether the lease was taken by the interactive read loop.
    pub fn is_read_line(&self) -> bool {
        self.is_read_line
    }

    /// Whether the session can still accept work.
    pub fn is_session_available(&self) -> bool {
        self.runspace.availability().is_usable()
    }

    /// Release the lease now.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.frame.gate().release(self.frame.id());
            trace!(frame = self.frame.id(), "lease released");
        }
    }
}

impl Drop for RunspaceHandle {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl fmt::Debug for RunspaceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunspaceHandle")
            .field("frame", &self.frame.id())
            .field("is_read_line", &self.is_read_line)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn test_second_acquire_waits() {
        let gate = LeaseGate::default();
        let cancel = CancellationToken::new();

        let mut first = task::spawn(gate.acquire(&cancel));
        assert_ready!(first.poll()).unwrap();
        drop(first);

        let mut second = task::spawn(gate.acquire(&cancel));
        assert_pending!(second.poll());

        gate.release(0);
        assert!(second.is_woken());
        assert_ready!(second.poll()).unwrap();
        assert!(gate.is_held());
    }

    #[test]
    fn test_cancelled_acquire() {
        let gate = LeaseGate::default();
        let cancel = CancellationToken::new();
        gate.acquire_blocking().unwrap();

        let mut waiter = task::spawn(gate.acquire(&cancel));
        assert_pending!(waiter.poll());
        cancel.cancel();
        assert!(matches!(
            assert_ready!(waiter.poll()),
            Err(CoordinatorError::Cancelled)
        ));
        assert!(gate.is_held());
    }

    #[test]
    fn test_closed_gate_rejects() {
        let gate = LeaseGate::default();
        gate.close();
        assert!(matches!(gate.acquire_blocking(), Err(CoordinatorError::FrameExited)));

        let cancel = CancellationToken::new();
        let mut waiter = task::spawn(gate.acquire(&cancel));
        assert!(matches!(
            assert_ready!(waiter.poll()),
            Err(CoordinatorError::FrameExited)
        ));
    }

    #[test]
    fn test_close_wakes_waiters() {
        let gate = LeaseGate::default();
        let cancel = CancellationToken::new();
        gate.acquire_blocking().unwrap();

        let mut waiter = task::spawn(gate.acquire(&cancel));
        assert_pending!(waiter.poll());
        gate.close();
        assert!(waiter.is_woken());
        assert!(matches!(
            assert_ready!(waiter.poll()),
            Err(CoordinatorError::FrameExited)
        ));
    }

    #[test]
    fn test_release_without_acquire_is_harmless() {
        let gate = LeaseGate::default();
        gate.release(0);
        assert!(!gate.is_held());
        gate.acquire_blocking().unwrap();
        assert!(gate.is_held());
    }

    #[test]
    fn test_blocking_waiter_wakes_on_release() {
        let gate = Arc::new(LeaseGate::default());
        gate.acquire_blocking().unwrap();

        let waiter = {
            let gate = Arc::clone(&gate);
            std::thread::spawn(move || {
                gate.acquire_blocking().unwrap();
                gate.release(0);
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        gate.release(0);
        waiter.join().unwrap();
        assert!(!gate.is_held());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_lease_released_on_another_thread() {
        let gate = Arc::new(LeaseGate::default());
        let cancel = CancellationToken::new();
        gate.acquire(&cancel).await.unwrap();

        let releaser = Arc::clone(&gate);
        tokio::task::spawn_blocking(move || releaser.release(0))
            .await
            .unwrap();

        assert!(!gate.is_held());
        gate.acquire(&cancel).await.unwrap();
        assert!(gate.is_held());
    }
}
