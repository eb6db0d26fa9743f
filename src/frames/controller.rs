//! Per-frame mailbox for cross-thread execution requests.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use tokio::sync::{oneshot, watch, Notify, Semaphore};
use tracing::{debug, trace};

use crate::engine::ResumeAction;
use crate::error::CoordinatorError;
use crate::execution::{Command, ExecutionOptions, ExecutionResult};
use crate::Result;

/// A command handed to a frame's loop thread, with the channel its
/// result goes back on.
#[derive(Debug)]
pub struct ExecutionRequest {
    command: Command,
    options: ExecutionOptions,
    responder: oneshot::Sender<Result<ExecutionResult>>,
}

impl ExecutionRequest {
    /// Create a request.
    pub fn new(
        command: Command,
        options: ExecutionOptions,
        responder: oneshot::Sender<Result<ExecutionResult>>,
    ) -> Self {
        Self {
            command,
            options,
            responder,
        }
    }

    /// The command to run.
    pub fn command(&self) -> &Command {
        &self.command
    }

    /// How to run it.
    pub fn options(&self) -> &ExecutionOptions {
        &self.options
    }

    /// Send the outcome back to the submitter.
    pub fn complete(self, result: Result<ExecutionResult>) {
        // The submitter may have gone away; nothing to report to.
        let _ = self.responder.send(result);
    }

    /// Fail the request.
    pub fn fail(self, error: CoordinatorError) {
        self.complete(Err(error));
    }
}

#[derive(Debug, Default)]
struct Mailbox {
    slot: Option<ExecutionRequest>,
    exit: Option<ResumeAction>,
    closed: bool,
    owner: Option<ThreadId>,
}

enum Next {
    Request(ExecutionRequest),
    Exit(ResumeAction),
}

/// Single-slot mailbox plus a one-shot exit signal for one frame.
///
/// The frame's loop thread runs [`ThreadController::run_message_loop`];
/// any other thread submits work with
/// [`ThreadController::request_execution`]. The exit signal carries the
/// directive that resumes the engine once the loop returns.
#[derive(Debug)]
pub struct ThreadController {
    mailbox: Mutex<Mailbox>,
    wake: Condvar,
    submit: Semaphore,
    slot_freed: Notify,
    exit_tx: watch::Sender<Option<ResumeAction>>,
    finished_tx: watch::Sender<bool>,
}

impl ThreadController {
    pub fn new() -> Self {
        Self {
            mailbox: Mutex::new(Mailbox::default()),
            wake: Condvar::new(),
            submit: Semaphore::new(1),
            slot_freed: Notify::new(),
            exit_tx: watch::Sender::new(None),
            finished_tx: watch::Sender::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Mailbox> {
        self.mailbox.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a request for the loop thread and wait for its result.
    ///
    /// Submitters are admitted to the slot in arrival order. Fails with
    /// `FrameExited` if the frame exits before the request is picked up.
    pub async fn request_execution(
        &self,
        command: Command,
        options: ExecutionOptions,
    ) -> Result<ExecutionResult> {
        let (tx, rx) = oneshot::channel();
        let mut request = Some(ExecutionRequest::new(command, options, tx));

        // Closed on exit, which turns every queued submitter away.
        let turn = self
            .submit
            .acquire()
            .await
            .map_err(|_| CoordinatorError::FrameExited)?;

        loop {
            let freed = self.slot_freed.notified();
            tokio::pin!(freed);
            freed.as_mut().enable();

            {
                let mut mailbox = self.lock();
                if mailbox.closed || mailbox.exit.is_some() {
                    return Err(CoordinatorError::FrameExited);
                }
                if mailbox.slot.is_none() {
                    mailbox.slot = request.take();
                    self.wake.notify_all();
                    break;
                }
            }

            freed.await;
        }
        drop(turn);

        trace!("request queued on thread controller");
        rx.await.map_err(|_| CoordinatorError::FrameExited)?
    }

    /// Resolve the exit signal. Returns `false` if it was already resolved.
    pub fn try_complete_exit(&self, action: ResumeAction) -> bool {
        {
            let mut mailbox = self.lock();
            if mailbox.exit.is_some() || mailbox.closed {
                return false;
            }
            mailbox.exit = Some(action);
        }
        debug!(?action, "frame exit requested");
        self.wake.notify_all();
        self.submit.close();
        self.slot_freed.notify_waiters();
        self.exit_tx.send_replace(Some(action));
        true
    }

    /// The resolved exit directive, if any.
    pub fn exit_action(&self) -> Option<ResumeAction> {
        self.lock().exit
    }

    /// Whether the exit signal has been resolved.
    pub fn has_exited(&self) -> bool {
        self.exit_action().is_some()
    }

    /// Whether the frame has been torn down.
    pub fn is_finished(&self) -> bool {
        *self.finished_tx.borrow()
    }

    /// Wait for the exit signal.
    pub async fn wait_for_exit(&self) -> ResumeAction {
        let mut rx = self.exit_tx.subscribe();
        let action = match rx.wait_for(Option::is_some).await {
            Ok(action) => *action,
            Err(_) => None,
        };
        action.unwrap_or(ResumeAction::Continue)
    }

    /// Wait until the frame has been torn down.
    pub async fn wait_for_finish(&self) {
        let mut rx = self.finished_tx.subscribe();
        let _ = rx.wait_for(|finished| *finished).await;
    }

    /// Whether the calling thread is running this controller's loop.
    pub fn is_current_thread(&self) -> bool {
        self.lock().owner == Some(thread::current().id())
    }

    /// Whether a loop thread has attached to this controller.
    pub fn has_loop_thread(&self) -> bool {
        self.lock().owner.is_some()
    }

    /// Service requests on the calling thread until the exit signal
    /// resolves. The exit signal wins over a queued request.
    pub fn run_message_loop<F>(&self, mut service: F) -> ResumeAction
    where
        F: FnMut(ExecutionRequest),
    {
        self.lock().owner = Some(thread::current().id());

        loop {
            let next = {
                let mut mailbox = self.lock();
                loop {
                    if let Some(action) = mailbox.exit {
                        break Next::Exit(action);
                    }
                    if mailbox.closed {
                        break Next::Exit(ResumeAction::Continue);
                    }
                    if let Some(request) = mailbox.slot.take() {
                        break Next::Request(request);
                    }
                    mailbox = self
                        .wake
                        .wait(mailbox)
                        .unwrap_or_else(|e| e.into_inner());
                }
            };

            match next {
                Next::Exit(action) => {
                    trace!(?action, "message loop exiting");
                    return action;
                }
                Next::Request(request) => {
                    self.slot_freed.notify_one();
                    service(request);
                }
            }
        }
    }

    /// Tear the controller down. A request still in the slot is failed
    /// with `FrameExited`.
    pub fn dispose(&self) {
        let pending = {
            let mut mailbox = self.lock();
            if mailbox.closed {
                return;
            }
            mailbox.closed = true;
            if mailbox.exit.is_none() {
                mailbox.exit = Some(ResumeAction::Continue);
                self.exit_tx.send_replace(Some(ResumeAction::Continue));
            }
            mailbox.slot.take()
        };

        self.wake.notify_all();
        self.submit.close();
        self.slot_freed.notify_waiters();
        if let Some(request) = pending {
            debug!(command = %request.command().text, "failing request left on exited frame");
            request.fail(CoordinatorError::FrameExited);
        }
        self.finished_tx.send_replace(true);
    }
}

impl Default for ThreadController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    fn spawn_loop(controller: &Arc<ThreadController>) -> std::thread::JoinHandle<(ResumeAction, Vec<String>)> {
        let controller = Arc::clone(controller);
        std::thread::spawn(move || {
            let mut seen = Vec::new();
            let action = controller.run_message_loop(|request| {
                seen.push(request.command().text.clone());
                let output = vec![serde_json::Value::String(request.command().text.clone())];
                request.complete(Ok(ExecutionResult::new(output, Duration::ZERO)));
            });
            (action, seen)
        })
    }

    #[test]
    fn test_exit_is_single_assignment() {
        let controller = ThreadController::new();
        assert!(!controller.has_exited());
        assert!(controller.try_complete_exit(ResumeAction::StepOver));
        assert!(!controller.try_complete_exit(ResumeAction::Continue));
        assert_eq!(controller.exit_action(), Some(ResumeAction::StepOver));
    }

    #[test]
    fn test_exit_wins_over_queued_request() {
        let controller = ThreadController::new();
        let (tx, _rx) = oneshot::channel();
        controller.lock().slot = Some(ExecutionRequest::new(
            Command::new("queued"),
            ExecutionOptions::default(),
            tx,
        ));
        controller.try_complete_exit(ResumeAction::Stop);

        let mut serviced = 0;
        let action = controller.run_message_loop(|_| serviced += 1);
        assert_eq!(action, ResumeAction::Stop);
        assert_eq!(serviced, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_requests_serviced_in_order_then_exit() {
        let controller = Arc::new(ThreadController::new());
        let worker = spawn_loop(&controller);

        for text in ["one", "two", "three"] {
            let result = timeout(
                Duration::from_secs(5),
                controller.request_execution(Command::new(text), ExecutionOptions::default()),
            )
            .await
            .unwrap()
            .unwrap();
            assert_eq!(result.output, vec![serde_json::json!(text)]);
        }

        assert!(controller.try_complete_exit(ResumeAction::Continue));
        let (action, seen) = worker.join().unwrap();
        assert_eq!(action, ResumeAction::Continue);
        assert_eq!(seen, vec!["one", "two", "three"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_request_after_exit_is_rejected() {
        let controller = ThreadController::new();
        controller.try_complete_exit(ResumeAction::Continue);
        let result = controller
            .request_execution(Command::new("late"), ExecutionOptions::default())
            .await;
        assert!(matches!(result, Err(CoordinatorError::FrameExited)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_dispose_fails_queued_request() {
        let controller = Arc::new(ThreadController::new());
        let submitter = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move {
                controller
                    .request_execution(Command::new("orphan"), ExecutionOptions::default())
                    .await
            })
        };

        // No loop thread: the request sits in the slot until dispose.
        while controller.lock().slot.is_none() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        controller.dispose();

        let result = timeout(Duration::from_secs(5), submitter).await.unwrap().unwrap();
        assert!(matches!(result, Err(CoordinatorError::FrameExited)));
        assert!(controller.is_finished());
        assert_eq!(controller.exit_action(), Some(ResumeAction::Continue));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_waiting_submitters_admitted_in_arrival_order() {
        let controller = Arc::new(ThreadController::new());
        let submit = |text: &'static str| {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move {
                controller
                    .request_execution(Command::new(text), ExecutionOptions::default())
                    .await
            })
        };

        // No loop thread yet: "first" fills the slot, the rest queue up.
        let first = submit("first");
        while controller.lock().slot.is_none() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let second = submit("second");
        tokio::time::sleep(Duration::from_millis(20)).await;
        while controller.submit.available_permits() > 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let mut rest = Vec::new();
        for text in ["third", "fourth", "fifth"] {
            rest.push(submit(text));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let worker = spawn_loop(&controller);
        for handle in std::iter::once(first).chain(std::iter::once(second)).chain(rest) {
            timeout(Duration::from_secs(5), handle)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
        }

        controller.try_complete_exit(ResumeAction::Continue);
        let (_, seen) = worker.join().unwrap();
        assert_eq!(seen, vec!["first", "second", "third", "fourth", "fifth"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_exit_turns_away_queued_submitters() {
        let controller = Arc::new(ThreadController::new());
        let submit = |text: &'static str| {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move {
                controller
                    .request_execution(Command::new(text), ExecutionOptions::default())
                    .await
            })
        };

        let occupant = submit("occupant");
        while controller.lock().slot.is_none() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let waiting = submit("waiting");
        let queued = submit("queued");
        tokio::time::sleep(Duration::from_millis(20)).await;

        controller.try_complete_exit(ResumeAction::Continue);
        controller.dispose();

        for handle in [occupant, waiting, queued] {
            let result = timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
            assert!(matches!(result, Err(CoordinatorError::FrameExited)));
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_wait_for_exit_and_finish() {
        let controller = Arc::new(ThreadController::new());
        let waiter = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move {
                let action = controller.wait_for_exit().await;
                controller.wait_for_finish().await;
                action
            })
        };

        controller.try_complete_exit(ResumeAction::StepInto);
        controller.dispose();
        let action = timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();
        assert_eq!(action, ResumeAction::StepInto);
    }

    #[test]
    fn test_current_thread_tracking() {
        let controller = Arc::new(ThreadController::new());
        assert!(!controller.is_current_thread());
        assert!(!controller.has_loop_thread());

        let inner = Arc::clone(&controller);
        let observed = std::thread::spawn(move || {
            inner.try_complete_exit(ResumeAction::Continue);
            inner.run_message_loop(|_| {});
            inner.is_current_thread()
        })
        .join()
        .unwrap();

        assert!(observed);
        assert!(controller.has_loop_thread());
        assert!(!controller.is_current_thread());
    }
}
