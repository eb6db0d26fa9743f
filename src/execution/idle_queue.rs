//! Background work scheduled through the foreground loop's idle callback.
//!
//! While an interactive read loop owns the pipeline thread it calls
//! [`IdlePump::pump`] whenever it is waiting for input. Work queued here
//! runs inside that call, on the read loop's thread, so the loop is never
//! preempted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::engine::IdlePump;

type IdleTask = Box<dyn FnOnce() + Send>;

/// Queue of work waiting for the foreground loop to go idle.
pub struct InvocationEventQueue {
    tx: mpsc::UnboundedSender<IdleTask>,
    rx: Mutex<mpsc::UnboundedReceiver<IdleTask>>,
    foreground_active: AtomicBool,
    invoking: AtomicBool,
}

impl InvocationEventQueue {
    /// Create an empty queue with no foreground loop.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            foreground_active: AtomicBool::new(false),
            invoking: AtomicBool::new(false),
        }
    }

    /// Check if a foreground loop owns the pipeline thread.
    pub fn is_foreground_active(&self) -> bool {
        self.foreground_active.load(Ordering::SeqCst)
    }

    /// Check if the foreground loop is running idle work right now.
    pub fn is_invoking(&self) -> bool {
        self.invoking.load(Ordering::SeqCst)
    }

    /// Check if work scheduled now would run on the idle callback.
    pub fn can_execute_on_idle(&self) -> bool {
        self.is_foreground_active() && !self.is_invoking()
    }

    /// Mark the foreground loop as started or stopped.
    ///
    /// Stopping drops work that never ran; its callers observe a closed
    /// channel and fall back to another route.
    pub fn set_foreground_active(&self, active: bool) {
        let was = self.foreground_active.swap(active, Ordering::SeqCst);
        if was != active {
            debug!(active, "foreground loop state changed");
        }
        if !active {
            self.discard_pending();
        }
    }

    /// Queue work for the idle callback. Returns `false` if no foreground
    /// loop is active.
    pub fn schedule<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.is_foreground_active() {
            return false;
        }
        if self.tx.send(Box::new(task)).is_err() {
            return false;
        }
        // The loop may have stopped between the check and the send.
        if !self.is_foreground_active() {
            self.discard_pending();
        }
        true
    }

    /// Run `f` on the idle callback and wait for its result.
    ///
    /// Returns `None` if no foreground loop is active or the loop stopped
    /// before running it.
    pub async fn execute_on_idle<F, R>(&self, f: F) -> Option<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let scheduled = self.schedule(move || {
            let _ = tx.send(f());
        });
        if !scheduled {
            return None;
        }
        rx.await.ok()
    }

    fn discard_pending(&self) {
        let Ok(mut rx) = self.rx.lock() else {
            return;
        };
        let mut dropped = 0usize;
        while rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(dropped, "discarded idle work after the foreground loop stopped");
        }
    }
}

impl Default for InvocationEventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl IdlePump for InvocationEventQueue {
    fn pump(&self) -> usize {
        let mut ran = 0;
        loop {
            // Release the receiver before running the task so it can schedule more.
            let task = match self.rx.lock() {
                Ok(mut rx) => rx.try_recv().ok(),
                Err(_) => None,
            };
            let Some(task) = task else {
                break;
            };
            self.invoking.store(true, Ordering::SeqCst);
            task();
            self.invoking.store(false, Ordering::SeqCst);
            ran += 1;
        }
        if ran > 0 {
            trace!(ran, "idle work processed");
        }
        ran
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_schedule_requires_foreground() {
        let queue = InvocationEventQueue::new();
        assert!(!queue.can_execute_on_idle());
        assert!(!queue.schedule(|| {}));

        queue.set_foreground_active(true);
        assert!(queue.can_execute_on_idle());
        assert!(queue.schedule(|| {}));
        assert_eq!(queue.pump(), 1);
    }

    #[test]
    fn test_pump_runs_in_order() {
        let queue = InvocationEventQueue::new();
        queue.set_foreground_active(true);

        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = Arc::clone(&order);
            queue.schedule(move || order.lock().unwrap().push(i));
        }

        assert_eq!(queue.pump(), 3);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(queue.pump(), 0);
    }

    #[test]
    fn test_invoking_flag_during_task() {
        let queue = Arc::new(InvocationEventQueue::new());
        queue.set_foreground_active(true);

        let observed = Arc::new(AtomicBool::new(false));
        let (q, o) = (Arc::clone(&queue), Arc::clone(&observed));
        queue.schedule(move || o.store(q.is_invoking(), Ordering::SeqCst));

        queue.pump();
        assert!(observed.load(Ordering::SeqCst));
        assert!(!queue.is_invoking());
    }

    #[test]
    fn test_stopping_discards_pending() {
        let queue = InvocationEventQueue::new();
        queue.set_foreground_active(true);

        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        queue.schedule(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });

        queue.set_foreground_active(false);
        queue.set_foreground_active(true);
        assert_eq!(queue.pump(), 0);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_execute_on_idle_without_loop() {
        let queue = InvocationEventQueue::new();
        assert_eq!(queue.execute_on_idle(|| 1).await, None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_execute_on_idle_round_trip() {
        let queue = Arc::new(InvocationEventQueue::new());
        queue.set_foreground_active(true);

        let pump = Arc::clone(&queue);
        let pumper = std::thread::spawn(move || {
            for _ in 0..200 {
                if pump.pump() > 0 {
                    return;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
        });

        let value = tokio::time::timeout(Duration::from_secs(5), queue.execute_on_idle(|| 6 * 7))
            .await
            .unwrap();
        assert_eq!(value, Some(42));
        pumper.join().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_execute_on_idle_dropped_when_loop_stops() {
        let queue = Arc::new(InvocationEventQueue::new());
        queue.set_foreground_active(true);

        let q = Arc::clone(&queue);
        let waiter = tokio::spawn(async move { q.execute_on_idle(|| 1).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.set_foreground_active(false);

        let result = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, None);
    }
}
