//! Continuation chain: sequential steps with shared cancellation and a
//! guaranteed terminal step.
//!
//! A chain is built by appending steps with [`then`](ContinuationChain::then)
//! and at most one terminal step with [`finally`](ContinuationChain::finally).
//! Each step receives the previous step's value and returns a
//! [`StepOutcome`]: advance with a new value, abort with an error, or
//! suspend. A suspending step hands a [`Resumer`] to whatever external event
//! will complete it (a fetch callback, a scheduled task); the chain then
//! advances on whichever thread fires the resumer.
//!
//! One chain instance is never executed from two threads at once. The
//! cancellation token is checked before every step; once cancellation is
//! requested, remaining steps are skipped and the finally step observes
//! [`ChainOutcome::Cancelled`]. The finally step runs exactly once on every
//! path that settles the chain.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::cancel::CancelToken;

type StepFn<T, E> = Box<dyn FnOnce(&mut StepControl<T, E>, T) -> StepOutcome<T, E> + Send>;
type FinallyFn<T, E> = Box<dyn FnOnce(ChainOutcome<T, E>) + Send>;

/// What a step tells the chain to do next.
#[derive(Debug)]
pub enum StepOutcome<T, E> {
    /// Proceed to the next step with this value.
    Advance(T),
    /// Suspend until a [`Resumer`] obtained from the step's [`StepControl`]
    /// fires. A resumer fired before the step returns is stashed and
    /// consumed as soon as it does.
    Pending,
    /// Fail the chain; remaining steps are skipped.
    Abort(E),
}

/// How a chain run settled, as seen by the finally step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainOutcome<T, E> {
    /// Every step advanced; carries the last value.
    Completed(T),
    /// A step aborted, directly or through [`Resumer::abort`].
    Failed(E),
    /// Cancellation was requested before the chain could complete.
    Cancelled,
}

enum Resumption<T, E> {
    Resume(T),
    Abort(E),
}

/// Result of returning [`StepOutcome::Pending`], resolved under the state
/// lock.
enum Suspended<T, E> {
    /// A resumer already fired; continue with its value.
    Resumed(T),
    /// A resumer already aborted.
    Aborted(E),
    /// Genuinely suspended; a live resumer will pick the chain back up.
    Parked,
    /// No live resumer exists, so nothing can ever advance the chain.
    Wedged,
}

struct ChainState<T, E> {
    steps: VecDeque<StepFn<T, E>>,
    finally: Option<FinallyFn<T, E>>,
    /// A drive loop is active on some thread.
    running: bool,
    finished: bool,
    /// Incremented when a step starts; resumers from earlier steps are stale.
    epoch: u64,
    /// Resumers handed out by the current step and not yet fired or dropped.
    live_resumers: usize,
    stash: Option<Resumption<T, E>>,
}

struct ChainCore<T, E> {
    token: CancelToken,
    /// Whether the chain created the token. An externally supplied token
    /// is only read; its `Finished` transition belongs to its owner.
    owns_token: bool,
    state: Mutex<ChainState<T, E>>,
}

impl<T, E> ChainCore<T, E> {
    fn drive(self: &Arc<Self>, mut value: T) {
        loop {
            if self.token.is_cancel_requested() {
                self.finish(ChainOutcome::Cancelled);
                return;
            }
            let Some((step, epoch)) = self.begin_step() else {
                self.finish(ChainOutcome::Completed(value));
                return;
            };
            let mut control = StepControl {
                core: Arc::clone(self),
                epoch,
            };
            match step(&mut control, value) {
                StepOutcome::Advance(next) => value = next,
                StepOutcome::Abort(error) => {
                    self.finish(ChainOutcome::Failed(error));
                    return;
                }
                StepOutcome::Pending => match self.suspend() {
                    Suspended::Resumed(next) => value = next,
                    Suspended::Aborted(error) => {
                        self.finish(ChainOutcome::Failed(error));
                        return;
                    }
                    Suspended::Parked => return,
                    Suspended::Wedged => {
                        debug!("step suspended without a live resumer, cancelling chain");
                        self.finish(ChainOutcome::Cancelled);
                        return;
                    }
                },
            }
        }
    }

    /// Pop the next step and open a new epoch for its resumers.
    fn begin_step(&self) -> Option<(StepFn<T, E>, u64)> {
        let mut state = self.state.lock();
        let step = state.steps.pop_front()?;
        state.epoch += 1;
        state.live_resumers = 0;
        if state.stash.take().is_some() {
            debug!("discarding resumption from a superseded step");
        }
        Some((step, state.epoch))
    }

    /// Decide what happens after a step returned [`StepOutcome::Pending`].
    fn suspend(&self) -> Suspended<T, E> {
        let mut state = self.state.lock();
        if let Some(resumption) = state.stash.take() {
            return match resumption {
                Resumption::Resume(value) => Suspended::Resumed(value),
                Resumption::Abort(error) => Suspended::Aborted(error),
            };
        }
        if state.live_resumers == 0 {
            return Suspended::Wedged;
        }
        state.running = false;
        Suspended::Parked
    }

    /// A resumer fired. Stale and duplicate resumptions are discarded.
    fn deliver(self: &Arc<Self>, epoch: u64, resumption: Resumption<T, E>) {
        let taken_over = {
            let mut state = self.state.lock();
            if state.finished || epoch != state.epoch {
                debug!("resumption arrived after its step was settled, discarding");
                return;
            }
            state.live_resumers -= 1;
            if state.running {
                if state.stash.is_some() {
                    debug!("duplicate resumption discarded");
                } else {
                    state.stash = Some(resumption);
                }
                None
            } else {
                state.running = true;
                Some(resumption)
            }
        };
        match taken_over {
            Some(Resumption::Resume(value)) => self.drive(value),
            Some(Resumption::Abort(error)) => self.finish(ChainOutcome::Failed(error)),
            None => {}
        }
    }

    /// An unfired resumer was dropped. If it was the last way to advance a
    /// parked chain, settle the chain as cancelled instead of wedging.
    fn resumer_dropped(self: &Arc<Self>, epoch: u64) {
        let wedged = {
            let mut state = self.state.lock();
            if state.finished || epoch != state.epoch {
                return;
            }
            state.live_resumers -= 1;
            if state.live_resumers == 0 && !state.running {
                state.running = true;
                true
            } else {
                false
            }
        };
        if wedged {
            debug!("last resumer dropped without firing, cancelling suspended chain");
            self.finish(ChainOutcome::Cancelled);
        }
    }

    fn finish(&self, outcome: ChainOutcome<T, E>) {
        let finally = {
            let mut state = self.state.lock();
            if state.finished {
                return;
            }
            state.finished = true;
            state.running = false;
            state.steps.clear();
            state.finally.take()
        };
        // A cancellation request that raced the final step wins. A token
        // the chain owns is settled here; an external token is left for
        // its owner to settle exactly once.
        let outcome = if self.owns_token {
            if self.token.finish() {
                outcome
            } else {
                ChainOutcome::Cancelled
            }
        } else if self.token.is_cancel_requested() {
            ChainOutcome::Cancelled
        } else {
            outcome
        };
        if let Some(finally) = finally {
            finally(outcome);
        }
    }
}

/// Handed to each step; the step's only way to mint a [`Resumer`].
pub struct StepControl<T, E> {
    core: Arc<ChainCore<T, E>>,
    epoch: u64,
}

impl<T, E> StepControl<T, E> {
    /// Create a resumer for this step. Hand it to the external event that
    /// completes the step, then return [`StepOutcome::Pending`].
    pub fn resumer(&mut self) -> Resumer<T, E> {
        self.core.state.lock().live_resumers += 1;
        Resumer {
            core: Arc::clone(&self.core),
            epoch: self.epoch,
            fired: false,
        }
    }

    /// The chain's cancellation token, for steps that want to bail out of
    /// long work early.
    pub fn token(&self) -> &CancelToken {
        &self.core.token
    }
}

/// Single-use handle that advances or fails a suspended chain.
///
/// Firing a resumer for a step that has already been settled is a no-op.
/// Dropping the last unfired resumer of a suspended step settles the chain
/// as cancelled, since nothing could ever advance it again.
pub struct Resumer<T, E> {
    core: Arc<ChainCore<T, E>>,
    epoch: u64,
    fired: bool,
}

impl<T, E> Resumer<T, E> {
    /// Advance the chain with `value`, driving it on the calling thread.
    pub fn resume(mut self, value: T) {
        self.fired = true;
        self.core.deliver(self.epoch, Resumption::Resume(value));
    }

    /// Fail the chain with `error`.
    pub fn abort(mut self, error: E) {
        self.fired = true;
        self.core.deliver(self.epoch, Resumption::Abort(error));
    }
}

impl<T, E> Drop for Resumer<T, E> {
    fn drop(&mut self) {
        if !self.fired {
            self.core.resumer_dropped(self.epoch);
        }
    }
}

/// Builder for a chain run. Append steps, register the finally step, then
/// [`run`](Self::run) with the initial value.
pub struct ContinuationChain<T, E> {
    steps: VecDeque<StepFn<T, E>>,
    finally: Option<FinallyFn<T, E>>,
    token: CancelToken,
    owns_token: bool,
}

impl<T, E> Default for ContinuationChain<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> ContinuationChain<T, E> {
    /// Chain with its own fresh cancellation token.
    pub fn new() -> Self {
        Self {
            steps: VecDeque::new(),
            finally: None,
            token: CancelToken::new(),
            owns_token: true,
        }
    }

    /// Chain observing an externally owned token. The chain reads the token
    /// to honour cancellation but never settles it; the owner marks it
    /// finished after the outcome is known.
    pub fn with_token(token: CancelToken) -> Self {
        Self {
            steps: VecDeque::new(),
            finally: None,
            token,
            owns_token: false,
        }
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Append a step. Steps run strictly in append order.
    pub fn then<F>(mut self, step: F) -> Self
    where
        F: FnOnce(&mut StepControl<T, E>, T) -> StepOutcome<T, E> + Send + 'static,
    {
        self.steps.push_back(Box::new(step));
        self
    }

    /// Register the terminal step. Runs exactly once with the chain outcome,
    /// whether the chain completed, failed, or was cancelled. A later call
    /// replaces an earlier one.
    pub fn finally<F>(mut self, finally: F) -> Self
    where
        F: FnOnce(ChainOutcome<T, E>) + Send + 'static,
    {
        self.finally = Some(Box::new(finally));
        self
    }

    /// Execute the chain on the calling thread until it completes or a step
    /// suspends. Suspended chains continue on the thread that fires the
    /// resumer.
    pub fn run(self, initial: T) {
        let core = Arc::new(ChainCore {
            token: self.token,
            owns_token: self.owns_token,
            state: Mutex::new(ChainState {
                steps: self.steps,
                finally: self.finally,
                running: true,
                finished: false,
                epoch: 0,
                live_resumers: 0,
                stash: None,
            }),
        });
        core.drive(initial);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    type Outcome = ChainOutcome<i32, String>;

    fn capture() -> (
        mpsc::Sender<Outcome>,
        mpsc::Receiver<Outcome>,
        impl FnOnce(Outcome) + Send + 'static,
    ) {
        let (tx, rx) = mpsc::channel();
        let sender = tx.clone();
        (tx, rx, move |outcome| {
            let _ = sender.send(outcome);
        })
    }

    #[test]
    fn steps_run_in_order_and_thread_the_value() {
        let (_tx, rx, finally) = capture();
        ContinuationChain::new()
            .then(|_, value: i32| StepOutcome::Advance(value + 1))
            .then(|_, value| StepOutcome::Advance(value * 10))
            .then(|_, value| StepOutcome::Advance(value - 3))
            .finally(finally)
            .run(1);

        assert_eq!(rx.recv().unwrap(), ChainOutcome::Completed(17));
    }

    #[test]
    fn empty_chain_completes_with_initial_value() {
        let (_tx, rx, finally) = capture();
        ContinuationChain::new().finally(finally).run(7);
        assert_eq!(rx.recv().unwrap(), ChainOutcome::Completed(7));
    }

    #[test]
    fn abort_skips_remaining_steps() {
        let (_tx, rx, finally) = capture();
        ContinuationChain::new()
            .then(|_, value: i32| StepOutcome::Advance(value))
            .then(|_, _| StepOutcome::Abort("boom".to_string()))
            .then(|_, _| -> StepOutcome<i32, String> {
                panic!("step after abort must not run");
            })
            .finally(finally)
            .run(0);

        assert_eq!(rx.recv().unwrap(), ChainOutcome::Failed("boom".to_string()));
    }

    #[test]
    fn cancel_before_run_goes_straight_to_finally() {
        let (_tx, rx, finally) = capture();
        let chain = ContinuationChain::new()
            .then(|_, _: i32| -> StepOutcome<i32, String> {
                panic!("cancelled chain must not start steps");
            })
            .finally(finally);
        chain.token().request_cancel();
        chain.run(0);

        assert_eq!(rx.recv().unwrap(), ChainOutcome::Cancelled);
    }

    #[test]
    fn cancel_requested_mid_chain_skips_later_steps() {
        let token = CancelToken::new();
        let observer = token.clone();
        let (_tx, rx, finally) = capture();
        ContinuationChain::with_token(token)
            .then(move |_, value: i32| {
                observer.request_cancel();
                StepOutcome::Advance(value)
            })
            .then(|_, _| -> StepOutcome<i32, String> {
                panic!("step after cancellation must not run");
            })
            .finally(finally)
            .run(0);

        assert_eq!(rx.recv().unwrap(), ChainOutcome::Cancelled);
    }

    #[test]
    fn pending_step_resumes_from_another_thread() {
        let (_tx, rx, finally) = capture();
        ContinuationChain::new()
            .then(|control, value: i32| {
                let resumer = control.resumer();
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(20));
                    resumer.resume(value + 100);
                });
                StepOutcome::Pending
            })
            .then(|_, value| StepOutcome::Advance(value * 2))
            .finally(finally)
            .run(1);

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            ChainOutcome::Completed(202)
        );
    }

    #[test]
    fn chain_advances_on_the_resuming_thread() {
        let (id_tx, id_rx) = mpsc::channel();
        let (_tx, rx, finally) = capture();
        ContinuationChain::new()
            .then(|control, value: i32| {
                let resumer = control.resumer();
                thread::spawn(move || resumer.resume(value));
                StepOutcome::Pending
            })
            .then(move |_, value| {
                let _ = id_tx.send(thread::current().id());
                StepOutcome::Advance(value)
            })
            .finally(finally)
            .run(0);

        let step_thread = id_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_ne!(step_thread, thread::current().id());
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            ChainOutcome::Completed(0)
        );
    }

    #[test]
    fn resume_before_pending_return_is_stashed() {
        let (_tx, rx, finally) = capture();
        ContinuationChain::new()
            .then(|control, value: i32| {
                // Fires before the step returns; the chain must pick the
                // value up as soon as Pending comes back.
                control.resumer().resume(value + 5);
                StepOutcome::Pending
            })
            .then(|_, value| StepOutcome::Advance(value))
            .finally(finally)
            .run(10);

        assert_eq!(rx.recv().unwrap(), ChainOutcome::Completed(15));
    }

    #[test]
    fn abort_via_resumer_fails_the_chain() {
        let (_tx, rx, finally) = capture();
        ContinuationChain::new()
            .then(|control, _: i32| {
                let resumer = control.resumer();
                thread::spawn(move || resumer.abort("fetch failed".to_string()));
                StepOutcome::Pending
            })
            .finally(finally)
            .run(0);

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            ChainOutcome::Failed("fetch failed".to_string())
        );
    }

    #[test]
    fn resuming_a_cancelled_chain_reports_cancelled() {
        let token = CancelToken::new();
        let (resumer_tx, resumer_rx) = mpsc::channel();
        let (_tx, rx, finally) = capture();
        ContinuationChain::with_token(token.clone())
            .then(move |control: &mut StepControl<i32, String>, _| {
                let _ = resumer_tx.send(control.resumer());
                StepOutcome::Pending
            })
            .then(|_, _| -> StepOutcome<i32, String> {
                panic!("step after cancellation must not run");
            })
            .finally(finally)
            .run(0);

        let resumer = resumer_rx.recv().unwrap();
        token.request_cancel();
        resumer.resume(42);

        assert_eq!(rx.recv().unwrap(), ChainOutcome::Cancelled);
        assert!(token.is_cancel_requested());
    }

    #[test]
    fn external_token_is_left_for_its_owner_to_settle() {
        let token = CancelToken::new();
        let (_tx, rx, finally) = capture();
        ContinuationChain::with_token(token.clone())
            .then(|_, value: i32| StepOutcome::Advance(value + 1))
            .finally(finally)
            .run(0);

        assert_eq!(rx.recv().unwrap(), ChainOutcome::Completed(1));
        assert!(token.is_active());
        assert!(token.finish());
    }

    #[test]
    fn owned_token_finishes_with_the_chain() {
        let (_tx, rx, finally) = capture();
        let chain = ContinuationChain::new().then(|_, value: i32| StepOutcome::Advance(value));
        let token = chain.token().clone();
        chain.finally(finally).run(7);

        assert_eq!(rx.recv().unwrap(), ChainOutcome::Completed(7));
        assert!(token.is_finished());
    }

    #[test]
    fn dropping_the_last_resumer_cancels_a_parked_chain() {
        let (resumer_tx, resumer_rx) = mpsc::channel();
        let (_tx, rx, finally) = capture();
        ContinuationChain::new()
            .then(move |control: &mut StepControl<i32, String>, _| {
                let _ = resumer_tx.send(control.resumer());
                StepOutcome::Pending
            })
            .finally(finally)
            .run(0);

        drop(resumer_rx.recv().unwrap());
        assert_eq!(rx.recv().unwrap(), ChainOutcome::Cancelled);
    }

    #[test]
    fn finally_runs_exactly_once() {
        let (tx, rx) = mpsc::channel();
        ContinuationChain::new()
            .then(|_, value: i32| StepOutcome::Advance(value))
            .finally(move |outcome: ChainOutcome<i32, String>| {
                tx.send(outcome).unwrap();
            })
            .run(3);

        assert_eq!(rx.recv().unwrap(), ChainOutcome::Completed(3));
        assert!(rx.try_recv().is_err());
    }
}
