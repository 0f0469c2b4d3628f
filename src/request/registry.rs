//! Pending-request registry: coalesces identical in-flight requests.
//!
//! When several callers ask for the same fingerprint concurrently, only the
//! first one executes; the rest attach to the existing [`TaskContext`] and
//! receive the same outcome.
//!
//! ```text
//! Caller A ─┐
//!           │                                  ┌─► executes (one fetch)
//! Caller B ─┼──► RequestRegistry ── handle A ──┘
//!           │          │
//! Caller C ─┘          ├────────── handle B ──┐
//!                      │                      ├─► wait for A's result
//!                      └────────── handle C ──┘
//! ```
//!
//! The registry map is a `DashMap` keyed by fingerprint, so get-or-create
//! is a single atomic entry operation. Outcome delivery never happens under
//! the registry lock: the entry is removed first, then callbacks fire.

use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::request::{CallbackId, Fingerprint, RequestOutcome, TaskContext};
use crate::sync::Guarded;

/// What cancelling one caller's handle does to the shared operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancellationMode {
    /// Detach only that caller; the operation keeps running for the rest.
    /// The last active handle cancelling still cancels the operation, since
    /// nobody is left to receive it.
    #[default]
    DetachWaiter,
    /// Any caller cancelling cancels the shared operation for everyone.
    PropagateToAll,
}

/// Deduplication counters, snapshotted from atomics.
#[derive(Debug, Default, Clone)]
pub struct RegistryStats {
    /// Requests that started a new operation.
    pub created: u64,
    /// Requests that attached to an in-flight operation.
    pub coalesced: u64,
}

impl RegistryStats {
    pub fn total(&self) -> u64 {
        self.created + self.coalesced
    }

    /// Share of requests that avoided duplicate work (0.0 to 1.0).
    pub fn dedup_ratio(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            0.0
        } else {
            self.coalesced as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandleRole {
    Executor,
    Waiter,
}

struct RegistryShared {
    contexts: DashMap<Fingerprint, Arc<TaskContext>>,
    mode: CancellationMode,
    created: AtomicU64,
    coalesced: AtomicU64,
}

impl RegistryShared {
    /// Remove the entry, but only if it still maps to this context; a fresh
    /// context may already have replaced it under the same fingerprint.
    fn detach(&self, context: &Arc<TaskContext>) {
        self.contexts
            .remove_if(context.fingerprint(), |_, existing| {
                Arc::ptr_eq(existing, context)
            });
    }

    fn complete(&self, context: &Arc<TaskContext>, outcome: RequestOutcome) {
        self.detach(context);
        context.finish(outcome);
    }
}

/// Tracks in-flight operations per fingerprint.
///
/// Cloning is cheap and shares the same registry.
#[derive(Clone)]
pub struct RequestRegistry {
    shared: Arc<RegistryShared>,
}

impl Default for RequestRegistry {
    fn default() -> Self {
        Self::new(CancellationMode::default())
    }
}

impl RequestRegistry {
    pub fn new(mode: CancellationMode) -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                contexts: DashMap::new(),
                mode,
                created: AtomicU64::new(0),
                coalesced: AtomicU64::new(0),
            }),
        }
    }

    pub fn mode(&self) -> CancellationMode {
        self.shared.mode
    }

    /// Atomically look up or create the context for `fingerprint`.
    ///
    /// The first caller gets the executor handle and must run the operation
    /// (and eventually [`RequestHandle::complete`] it); everyone else gets a
    /// waiter handle attached to the same context.
    pub fn get_or_create(&self, fingerprint: Fingerprint) -> RequestHandle {
        let (context, role) = match self.shared.contexts.entry(fingerprint) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_terminal() {
                    // Settled but not yet removed by its executor; a new
                    // caller starts fresh rather than joining a corpse.
                    let context = Arc::new(TaskContext::new(entry.key().clone()));
                    entry.insert(Arc::clone(&context));
                    (context, HandleRole::Executor)
                } else {
                    (Arc::clone(entry.get()), HandleRole::Waiter)
                }
            }
            Entry::Vacant(entry) => {
                let context = Arc::new(TaskContext::new(entry.key().clone()));
                entry.insert(Arc::clone(&context));
                (context, HandleRole::Executor)
            }
        };

        context.attach_handle();
        match role {
            HandleRole::Executor => {
                self.shared.created.fetch_add(1, Ordering::Relaxed);
                debug!(fingerprint = %context.fingerprint(), "new request, caller executes");
            }
            HandleRole::Waiter => {
                self.shared.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!(
                    fingerprint = %context.fingerprint(),
                    "coalescing onto in-flight request"
                );
            }
        }

        RequestHandle {
            shared: Arc::clone(&self.shared),
            context,
            role,
            detached: AtomicBool::new(false),
            ids: Guarded::new(Vec::new()),
        }
    }

    /// Settle a context and deliver its outcome; the service's chain calls
    /// this from its finally step.
    pub(crate) fn complete(&self, context: &Arc<TaskContext>, outcome: RequestOutcome) {
        self.shared.complete(context, outcome);
    }

    /// Request cancellation of every in-flight operation. Contexts settle
    /// and leave the registry when their executors observe the request.
    pub fn cancel_all(&self) {
        let mut cancelled = 0usize;
        for entry in self.shared.contexts.iter() {
            if entry.value().cancel_operation() {
                cancelled += 1;
            }
        }
        info!(cancelled, "cancellation requested for all pending requests");
    }

    /// Number of in-flight operations.
    pub fn len(&self) -> usize {
        self.shared.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.contexts.is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            created: self.shared.created.load(Ordering::Relaxed),
            coalesced: self.shared.coalesced.load(Ordering::Relaxed),
        }
    }
}

/// One caller's view of a deduplicated operation.
///
/// Exactly one handle per fingerprint is the executor; it runs the
/// operation and completes the context. All handles can register callbacks,
/// wait, and cancel. Dropping a handle without cancelling leaves the
/// operation running (fire-and-forget is legitimate, e.g. cache warming).
pub struct RequestHandle {
    shared: Arc<RegistryShared>,
    context: Arc<TaskContext>,
    role: HandleRole,
    detached: AtomicBool,
    /// Callbacks this handle registered, detached together on cancel.
    ids: Guarded<Vec<CallbackId>>,
}

impl RequestHandle {
    /// Whether this caller must execute the operation.
    pub fn is_executor(&self) -> bool {
        self.role == HandleRole::Executor
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        self.context.fingerprint()
    }

    /// The underlying context, shared by every handle for this fingerprint.
    pub fn context(&self) -> Arc<TaskContext> {
        Arc::clone(&self.context)
    }

    /// Move the context to `InProgress`. Executor-only; returns `false` if
    /// the operation must not run (already cancelled).
    pub fn start(&self) -> bool {
        self.is_executor() && self.context.start()
    }

    /// Settle the operation and deliver `outcome` to every waiter.
    /// Executor-only; a waiter calling this is ignored.
    pub fn complete(&self, outcome: RequestOutcome) -> bool {
        if !self.is_executor() {
            warn!(
                fingerprint = %self.context.fingerprint(),
                "completion attempted through a waiter handle, ignored"
            );
            return false;
        }
        self.shared.complete(&self.context, outcome);
        true
    }

    /// Register a completion callback. Fires once with this caller's view
    /// of the outcome; if the handle was cancelled, that view is
    /// `Cancelled` whatever the shared operation produced.
    pub fn on_complete<F>(&self, callback: F) -> CallbackId
    where
        F: FnOnce(RequestOutcome) + Send + 'static,
    {
        if self.detached.load(Ordering::Acquire) {
            return self.context.register_cancelled_callback(Box::new(callback));
        }
        let id = self.context.register_callback(Box::new(callback));
        self.ids.locked(|ids| ids.push(id));
        id
    }

    /// Await this caller's view of the outcome.
    ///
    /// Sending the result does not need a runtime, so the executor may
    /// settle the context from any thread. If the context is dropped
    /// without settling, this resolves to `Cancelled`.
    pub async fn join(&self) -> RequestOutcome {
        if self.detached.load(Ordering::Acquire) {
            return RequestOutcome::Cancelled;
        }
        let (tx, rx) = oneshot::channel();
        let id = self.context.register_callback(Box::new(move |outcome| {
            let _ = tx.send(outcome);
        }));
        self.ids.locked(|ids| ids.push(id));
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => RequestOutcome::Cancelled,
        }
    }

    /// Block until the operation settles or `timeout` elapses. A cancelled
    /// handle observes `Cancelled` immediately.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<RequestOutcome> {
        if self.detached.load(Ordering::Acquire) {
            return Some(RequestOutcome::Cancelled);
        }
        self.context.wait_timeout(timeout)
    }

    /// Cancel this caller's interest in the operation.
    ///
    /// The executor handle always propagates cancellation to the shared
    /// operation. A waiter handle only detaches itself, unless the
    /// registry's [`CancellationMode`] propagates or no active handle
    /// remains afterwards. Returns `false` if the handle was already
    /// cancelled.
    pub fn cancel(&self) -> bool {
        if self.detached.swap(true, Ordering::AcqRel) {
            return false;
        }
        match self.role {
            HandleRole::Executor => {
                debug!(
                    fingerprint = %self.context.fingerprint(),
                    "executor handle cancelled, aborting shared operation"
                );
                self.context.cancel_operation();
                self.detach_own_callbacks();
                self.context.release_handle();
            }
            HandleRole::Waiter => {
                if self.shared.mode == CancellationMode::PropagateToAll {
                    debug!(
                        fingerprint = %self.context.fingerprint(),
                        "waiter cancellation propagated to shared operation"
                    );
                    self.context.cancel_operation();
                }
                self.detach_own_callbacks();
                if self.context.release_handle() {
                    debug!(
                        fingerprint = %self.context.fingerprint(),
                        "last active caller cancelled, aborting shared operation"
                    );
                    self.context.cancel_operation();
                    self.shared.detach(&self.context);
                }
            }
        }
        true
    }

    fn detach_own_callbacks(&self) {
        for id in self.ids.locked(mem::take) {
            self.context.cancel_callback(id);
        }
    }
}
