//! Cooperative cancellation: a shared tri-state token plus a waitable
//! result slot.
//!
//! The token moves `Active → CancelRequested` (any holder) or
//! `Active → Finished` (the executing operation only); the two transitions
//! race through a compare-exchange, so exactly one side wins. Requesting
//! cancellation never interrupts running code — executors check the token
//! at their own boundaries and abort cooperatively.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::sync::Condition;

const ACTIVE: u8 = 0;
const CANCEL_REQUESTED: u8 = 1;
const FINISHED: u8 = 2;

/// Observable state of a [`CancelToken`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelState {
    /// The operation may still run to completion.
    Active,
    /// A holder asked for cancellation; the operation has not yet stopped.
    CancelRequested,
    /// The operation finished executing (successfully or after observing
    /// the cancellation request).
    Finished,
}

/// Shared cancellation flag. Clones observe and mutate the same state.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    state: Arc<AtomicU8>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> CancelState {
        match self.state.load(Ordering::Acquire) {
            CANCEL_REQUESTED => CancelState::CancelRequested,
            FINISHED => CancelState::Finished,
            _ => CancelState::Active,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state() == CancelState::Active
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.state() == CancelState::CancelRequested
    }

    pub fn is_finished(&self) -> bool {
        self.state() == CancelState::Finished
    }

    /// Ask the operation to stop. Idempotent; a no-op once the operation
    /// finished. Returns whether this call is the one that requested it.
    pub fn request_cancel(&self) -> bool {
        self.state
            .compare_exchange(
                ACTIVE,
                CANCEL_REQUESTED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Mark the operation finished. Only the executing side calls this.
    ///
    /// Returns `true` when the operation completed unchallenged; `false`
    /// when a cancellation request won the race (the token still ends up
    /// `Finished` — nothing is running anymore either way).
    pub fn finish(&self) -> bool {
        match self
            .state
            .compare_exchange(ACTIVE, FINISHED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(CANCEL_REQUESTED) => {
                self.state.store(FINISHED, Ordering::Release);
                false
            }
            Err(_) => false,
        }
    }
}

/// Outcome of waiting on a [`CancellableFuture`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FutureWait<T> {
    /// The operation delivered a value.
    Completed(T),
    /// The operation was cancelled; no value will arrive.
    Cancelled,
    /// The timeout elapsed first; the operation is still pending.
    TimedOut,
}

struct FutureInner<T> {
    token: CancelToken,
    slot: Mutex<Option<T>>,
    ready: Condition,
}

/// A result slot paired with a cancellation token.
///
/// The producing side calls [`complete`](Self::complete) once; any holder
/// may [`cancel`](Self::cancel). Waiters block on the paired condition and
/// read the value out as a clone, so several holders can wait on the same
/// future. [`try_take`](Self::try_take) moves the value out instead, after
/// which further waits report `Cancelled`.
pub struct CancellableFuture<T> {
    inner: Arc<FutureInner<T>>,
}

impl<T> Clone for CancellableFuture<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for CancellableFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CancellableFuture<T> {
    pub fn new() -> Self {
        Self::with_token(CancelToken::new())
    }

    /// Pair the slot with an existing token (shared with the executor).
    pub fn with_token(token: CancelToken) -> Self {
        Self {
            inner: Arc::new(FutureInner {
                token,
                slot: Mutex::new(None),
                ready: Condition::new(),
            }),
        }
    }

    pub fn token(&self) -> &CancelToken {
        &self.inner.token
    }

    /// Deliver the value and finish the token. If cancellation was
    /// requested first the value is dropped, waiters observe `Cancelled`,
    /// and this returns `false`.
    pub fn complete(&self, value: T) -> bool {
        let won = self.inner.token.finish();
        if won {
            *self.inner.slot.lock() = Some(value);
        }
        self.inner.ready.notify();
        won
    }

    /// Request cancellation and wake waiters. Does not interrupt a running
    /// producer; if it completes anyway the value is discarded.
    pub fn cancel(&self) {
        self.inner.token.request_cancel();
        self.inner.ready.notify();
    }

    /// Move the value out if one was delivered.
    pub fn try_take(&self) -> Option<T> {
        self.inner.slot.lock().take()
    }
}

impl<T: Clone> CancellableFuture<T> {
    /// Block until the operation completes or is cancelled.
    pub fn wait(&self) -> FutureWait<T> {
        self.inner.ready.wait();
        self.snapshot()
    }

    /// Block up to `timeout`. The core imposes no implicit deadline; this
    /// is the caller's own.
    pub fn wait_timeout(&self, timeout: Duration) -> FutureWait<T> {
        if !self.inner.ready.wait_timeout(timeout) {
            return FutureWait::TimedOut;
        }
        self.snapshot()
    }

    fn snapshot(&self) -> FutureWait<T> {
        match self.inner.slot.lock().as_ref() {
            Some(value) => FutureWait::Completed(value.clone()),
            None => FutureWait::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn token_starts_active() {
        let token = CancelToken::new();
        assert!(token.is_active());
        assert_eq!(token.state(), CancelState::Active);
    }

    #[test]
    fn first_cancel_request_wins_repeats_are_noops() {
        let token = CancelToken::new();
        assert!(token.request_cancel());
        assert!(!token.request_cancel());
        assert!(token.is_cancel_requested());
    }

    #[test]
    fn finish_after_cancel_reports_cancellation_won() {
        let token = CancelToken::new();
        token.request_cancel();

        assert!(!token.finish());
        // Terminal either way.
        assert!(token.is_finished());
    }

    #[test]
    fn cancel_after_finish_is_noop() {
        let token = CancelToken::new();
        assert!(token.finish());
        assert!(!token.request_cancel());
        assert!(token.is_finished());
    }

    #[test]
    fn clones_share_state() {
        let token = CancelToken::new();
        let other = token.clone();
        token.request_cancel();
        assert!(other.is_cancel_requested());
    }

    #[test]
    fn complete_then_wait_yields_value() {
        let future = CancellableFuture::new();
        assert!(future.complete(42));
        assert_eq!(future.wait(), FutureWait::Completed(42));
        assert!(future.token().is_finished());
    }

    #[test]
    fn several_holders_observe_the_same_value() {
        let future = CancellableFuture::new();
        let other = future.clone();
        future.complete("shared".to_string());

        assert_eq!(future.wait(), FutureWait::Completed("shared".to_string()));
        assert_eq!(other.wait(), FutureWait::Completed("shared".to_string()));
    }

    #[test]
    fn cancel_makes_wait_report_cancelled() {
        let future: CancellableFuture<u32> = CancellableFuture::new();
        future.cancel();
        assert_eq!(future.wait(), FutureWait::Cancelled);
    }

    #[test]
    fn complete_after_cancel_discards_value() {
        let future = CancellableFuture::new();
        future.cancel();

        assert!(!future.complete(7));
        assert_eq!(future.try_take(), None);
        assert_eq!(future.wait(), FutureWait::Cancelled);
    }

    #[test]
    fn wait_timeout_expires_then_succeeds() {
        let future = CancellableFuture::new();
        let start = Instant::now();
        assert_eq!(
            future.wait_timeout(Duration::from_millis(30)),
            FutureWait::TimedOut
        );
        assert!(start.elapsed() >= Duration::from_millis(30));

        future.complete(5);
        assert_eq!(
            future.wait_timeout(Duration::from_millis(30)),
            FutureWait::Completed(5)
        );
    }

    #[test]
    fn waiter_blocks_until_producer_completes() {
        let future = CancellableFuture::new();
        let producer = future.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.complete(99);
        });

        assert_eq!(future.wait(), FutureWait::Completed(99));
        handle.join().unwrap();
    }

    #[test]
    fn try_take_moves_the_value_out() {
        let future = CancellableFuture::new();
        future.complete(vec![1, 2, 3]);

        assert_eq!(future.try_take(), Some(vec![1, 2, 3]));
        assert_eq!(future.try_take(), None);
    }
}
