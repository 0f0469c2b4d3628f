//! Per-fingerprint task state and waiter delivery.
//!
//! A `TaskContext` tracks one in-flight operation from `Pending` through
//! `InProgress` to a terminal state, collects the completion callbacks of
//! every caller that coalesced onto it, and replays the single captured
//! outcome to all of them in registration order. Callbacks cancelled before
//! completion are parked on a side list and receive
//! [`RequestOutcome::Cancelled`] when the operation settles, whatever the
//! shared outcome was.
//!
//! Delivery happens with no lock held: the callback maps are taken out
//! under the state lock, the lock is released, and only then are callbacks
//! invoked.

use std::collections::BTreeMap;
use std::fmt;
use std::mem;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::request::{Fingerprint, RequestOutcome};
use crate::sync::Condition;

/// Identifies one registered completion callback within a context.
///
/// Ids are allocated monotonically, so iteration in id order is delivery in
/// registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CallbackId(u64);

/// Lifecycle of a deduplicated operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Created, not yet picked up by the executing task.
    Pending,
    /// The executing task is running.
    InProgress,
    /// Terminal: the payload was delivered.
    Completed,
    /// Terminal: cancellation preempted the operation.
    Cancelled,
    /// Terminal: the fetch collaborator failed.
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Pending => "pending",
            TaskState::InProgress => "in-progress",
            TaskState::Completed => "completed",
            TaskState::Cancelled => "cancelled",
            TaskState::Failed => "failed",
        };
        f.write_str(name)
    }
}

type OutcomeCallback = Box<dyn FnOnce(RequestOutcome) + Send>;

struct ContextState {
    state: TaskState,
    callbacks: BTreeMap<CallbackId, OutcomeCallback>,
    cancelled: Vec<OutcomeCallback>,
    next_callback_id: u64,
    /// Handles that have not cancelled; when the last one cancels, the
    /// shared operation is cancelled with it.
    active_handles: usize,
    outcome: Option<RequestOutcome>,
}

/// Shared state of one in-flight fingerprinted operation.
pub struct TaskContext {
    fingerprint: Fingerprint,
    token: CancelToken,
    done: Condition,
    state: Mutex<ContextState>,
}

impl TaskContext {
    pub(crate) fn new(fingerprint: Fingerprint) -> Self {
        Self {
            fingerprint,
            token: CancelToken::new(),
            done: Condition::new(),
            state: Mutex::new(ContextState {
                state: TaskState::Pending,
                callbacks: BTreeMap::new(),
                cancelled: Vec::new(),
                next_callback_id: 0,
                active_handles: 0,
                outcome: None,
            }),
        }
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// The cancellation token shared with the executing chain.
    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    pub fn state(&self) -> TaskState {
        self.state.lock().state
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// The captured outcome once the context is terminal.
    pub fn outcome(&self) -> Option<RequestOutcome> {
        self.state.lock().outcome.clone()
    }

    /// Request cancellation and block until the operation settles or
    /// `timeout` elapses. Returns whether a terminal state was reached.
    pub fn blocking_cancel(&self, timeout: Duration) -> bool {
        self.token.request_cancel();
        self.done.wait_timeout(timeout)
    }

    /// Block until the operation settles, returning the shared outcome, or
    /// `None` if `timeout` elapses first.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<RequestOutcome> {
        if !self.done.wait_timeout(timeout) {
            return None;
        }
        self.state.lock().outcome.clone()
    }

    /// Move to `InProgress`. Executor-only. Returns `false` when the
    /// operation must not run: cancellation was already requested or the
    /// context left `Pending` some other way.
    pub(crate) fn start(&self) -> bool {
        if self.token.is_cancel_requested() {
            return false;
        }
        let mut state = self.state.lock();
        if state.state == TaskState::Pending {
            state.state = TaskState::InProgress;
            true
        } else {
            false
        }
    }

    /// Ask the shared operation to stop.
    pub(crate) fn cancel_operation(&self) -> bool {
        self.token.request_cancel()
    }

    /// Register a completion callback. If the context is already terminal
    /// the stored outcome is delivered to the callback right away, on the
    /// calling thread.
    pub(crate) fn register_callback(&self, callback: OutcomeCallback) -> CallbackId {
        let (id, immediate) = {
            let mut state = self.state.lock();
            let id = CallbackId(state.next_callback_id);
            state.next_callback_id += 1;
            if let Some(outcome) = state.outcome.clone() {
                (id, Some((callback, outcome)))
            } else {
                state.callbacks.insert(id, callback);
                (id, None)
            }
        };
        if let Some((callback, outcome)) = immediate {
            debug!(
                fingerprint = %self.fingerprint,
                "callback joined a settled request, replaying stored outcome"
            );
            callback(outcome);
        }
        id
    }

    /// Register a callback on behalf of an already-cancelled caller. It will
    /// receive `Cancelled` when the operation settles (immediately, if it
    /// already has).
    pub(crate) fn register_cancelled_callback(&self, callback: OutcomeCallback) -> CallbackId {
        let (id, immediate) = {
            let mut state = self.state.lock();
            let id = CallbackId(state.next_callback_id);
            state.next_callback_id += 1;
            if state.outcome.is_some() {
                (id, Some(callback))
            } else {
                state.cancelled.push(callback);
                (id, None)
            }
        };
        if let Some(callback) = immediate {
            callback(RequestOutcome::Cancelled);
        }
        id
    }

    /// Detach one callback; it moves to the cancelled list and will receive
    /// `Cancelled` at completion time. Returns `false` for an unknown or
    /// already-delivered id.
    pub(crate) fn cancel_callback(&self, id: CallbackId) -> bool {
        let mut state = self.state.lock();
        match state.callbacks.remove(&id) {
            Some(callback) => {
                state.cancelled.push(callback);
                true
            }
            None => {
                warn!(
                    fingerprint = %self.fingerprint,
                    callback_id = id.0,
                    "cancel for unknown or already settled callback"
                );
                false
            }
        }
    }

    pub(crate) fn attach_handle(&self) {
        self.state.lock().active_handles += 1;
    }

    /// Drop one active handle; returns `true` when it was the last.
    pub(crate) fn release_handle(&self) -> bool {
        let mut state = self.state.lock();
        state.active_handles = state.active_handles.saturating_sub(1);
        state.active_handles == 0
    }

    /// Settle the context and deliver the outcome to every waiter.
    ///
    /// A cancellation request that raced the completion wins: all active
    /// callbacks then observe `Cancelled` instead of `outcome`. Cancelled
    /// callbacks observe `Cancelled` regardless. Repeated calls are ignored.
    pub(crate) fn finish(&self, outcome: RequestOutcome) {
        let (callbacks, cancelled, outcome) = {
            let mut state = self.state.lock();
            if state.outcome.is_some() {
                warn!(
                    fingerprint = %self.fingerprint,
                    "finish on a settled context ignored"
                );
                return;
            }
            let outcome = if self.token.finish() {
                outcome
            } else {
                RequestOutcome::Cancelled
            };
            state.state = match &outcome {
                RequestOutcome::Completed(_) => TaskState::Completed,
                RequestOutcome::Failed(_) => TaskState::Failed,
                RequestOutcome::Cancelled => TaskState::Cancelled,
            };
            state.outcome = Some(outcome.clone());
            (
                mem::take(&mut state.callbacks),
                mem::take(&mut state.cancelled),
                outcome,
            )
        };

        debug!(
            fingerprint = %self.fingerprint,
            state = %self.state(),
            waiters = callbacks.len(),
            cancelled_waiters = cancelled.len(),
            "delivering request outcome"
        );

        // BTreeMap iterates in id order, which is registration order.
        for (_, callback) in callbacks {
            callback(outcome.clone());
        }
        for callback in cancelled {
            callback(RequestOutcome::Cancelled);
        }

        self.done.notify();
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TaskContext")
            .field("fingerprint", &self.fingerprint)
            .field("state", &state.state)
            .field("waiters", &state.callbacks.len())
            .field("active_handles", &state.active_handles)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;

    fn create_context() -> TaskContext {
        TaskContext::new(Fingerprint::from_parts("terrain", "100", Some(1)))
    }

    fn completed(payload: &'static [u8]) -> RequestOutcome {
        RequestOutcome::Completed(Bytes::from_static(payload))
    }

    #[test]
    fn new_context_is_pending() {
        let context = create_context();
        assert_eq!(context.state(), TaskState::Pending);
        assert!(!context.is_terminal());
        assert_eq!(context.outcome(), None);
    }

    #[test]
    fn start_moves_to_in_progress_once() {
        let context = create_context();
        assert!(context.start());
        assert_eq!(context.state(), TaskState::InProgress);
        assert!(!context.start());
    }

    #[test]
    fn start_refuses_after_cancel_request() {
        let context = create_context();
        context.token().request_cancel();
        assert!(!context.start());
        assert_eq!(context.state(), TaskState::Pending);
    }

    #[test]
    fn callbacks_fire_in_registration_order() {
        let context = create_context();
        let (tx, rx) = mpsc::channel();
        for label in ["first", "second", "third"] {
            let tx = tx.clone();
            context.register_callback(Box::new(move |_| {
                tx.send(label).unwrap();
            }));
        }

        context.start();
        context.finish(completed(b"data"));

        assert_eq!(rx.try_recv().unwrap(), "first");
        assert_eq!(rx.try_recv().unwrap(), "second");
        assert_eq!(rx.try_recv().unwrap(), "third");
    }

    #[test]
    fn every_callback_sees_the_same_outcome() {
        let context = create_context();
        let (tx, rx) = mpsc::channel();
        for _ in 0..3 {
            let tx = tx.clone();
            context.register_callback(Box::new(move |outcome| {
                tx.send(outcome).unwrap();
            }));
        }

        context.finish(completed(b"shared bytes"));

        for _ in 0..3 {
            assert_eq!(rx.try_recv().unwrap(), completed(b"shared bytes"));
        }
    }

    #[test]
    fn late_registration_replays_the_stored_outcome() {
        let context = create_context();
        context.finish(completed(b"done"));

        let (tx, rx) = mpsc::channel();
        context.register_callback(Box::new(move |outcome| {
            tx.send(outcome).unwrap();
        }));

        assert_eq!(rx.try_recv().unwrap(), completed(b"done"));
    }

    #[test]
    fn cancelled_callback_receives_cancelled_while_others_get_the_result() {
        let context = create_context();
        let (tx, rx) = mpsc::channel();

        let keep_tx = tx.clone();
        context.register_callback(Box::new(move |outcome| {
            keep_tx.send(("kept", outcome)).unwrap();
        }));
        let drop_tx = tx.clone();
        let doomed = context.register_callback(Box::new(move |outcome| {
            drop_tx.send(("cancelled", outcome)).unwrap();
        }));

        assert!(context.cancel_callback(doomed));
        context.finish(completed(b"payload"));

        assert_eq!(rx.try_recv().unwrap(), ("kept", completed(b"payload")));
        assert_eq!(
            rx.try_recv().unwrap(),
            ("cancelled", RequestOutcome::Cancelled)
        );
    }

    #[test]
    fn cancelling_an_unknown_callback_reports_false() {
        let context = create_context();
        let id = context.register_callback(Box::new(|_| {}));
        assert!(context.cancel_callback(id));
        // Already moved to the cancelled list.
        assert!(!context.cancel_callback(id));
    }

    #[test]
    fn cancel_request_overrides_a_racing_completion() {
        let context = create_context();
        let (tx, rx) = mpsc::channel();
        context.register_callback(Box::new(move |outcome| {
            tx.send(outcome).unwrap();
        }));

        context.token().request_cancel();
        context.finish(completed(b"too late"));

        assert_eq!(rx.try_recv().unwrap(), RequestOutcome::Cancelled);
        assert_eq!(context.state(), TaskState::Cancelled);
    }

    #[test]
    fn repeated_finish_is_ignored() {
        let context = create_context();
        let (tx, rx) = mpsc::channel();
        context.register_callback(Box::new(move |outcome| {
            tx.send(outcome).unwrap();
        }));

        context.finish(completed(b"first"));
        context.finish(completed(b"second"));

        assert_eq!(rx.try_recv().unwrap(), completed(b"first"));
        assert!(rx.try_recv().is_err());
        assert_eq!(context.outcome(), Some(completed(b"first")));
    }

    #[test]
    fn blocking_cancel_waits_for_the_operation_to_settle() {
        let context = Arc::new(create_context());
        let worker = {
            let context = Arc::clone(&context);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                // The executing side observes the request and settles.
                assert!(context.token().is_cancel_requested());
                context.finish(RequestOutcome::Cancelled);
            })
        };

        assert!(context.blocking_cancel(Duration::from_secs(5)));
        assert_eq!(context.state(), TaskState::Cancelled);
        worker.join().unwrap();
    }

    #[test]
    fn blocking_cancel_times_out_when_nothing_settles_the_context() {
        let context = create_context();
        assert!(!context.blocking_cancel(Duration::from_millis(30)));
        assert!(context.token().is_cancel_requested());
    }

    #[test]
    fn wait_timeout_returns_the_outcome_once_settled() {
        let context = Arc::new(create_context());
        assert_eq!(context.wait_timeout(Duration::from_millis(20)), None);

        let worker = {
            let context = Arc::clone(&context);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                context.finish(completed(b"late"));
            })
        };

        assert_eq!(
            context.wait_timeout(Duration::from_secs(5)),
            Some(completed(b"late"))
        );
        worker.join().unwrap();
    }

    #[test]
    fn last_handle_release_reports_true() {
        let context = create_context();
        context.attach_handle();
        context.attach_handle();
        assert!(!context.release_handle());
        assert!(context.release_handle());
    }

    #[test]
    fn cancelled_caller_registration_waits_for_settlement() {
        let context = create_context();
        let (tx, rx) = mpsc::channel();
        context.register_cancelled_callback(Box::new(move |outcome| {
            tx.send(outcome).unwrap();
        }));

        // Nothing delivered until the shared operation settles.
        assert!(rx.try_recv().is_err());
        context.finish(completed(b"result"));
        assert_eq!(rx.try_recv().unwrap(), RequestOutcome::Cancelled);
    }
}
