//! Fixed-size thread pool executing prioritized tasks.
//!
//! ```text
//!  schedule()                 SyncQueue<ScheduledTask, PriorityOrder>
//!  schedule_with_priority() ─────────────┐
//!                                        ▼
//!                              ┌──────────────────┐
//!                              │ High ─► FIFO     │
//!                              │ Normal ─► FIFO   │
//!                              │ Low ─► FIFO      │
//!                              └───────┬──────────┘
//!                    pull      ┌───────┴────────┐
//!                              ▼                ▼
//!                        worker-0  ...     worker-N
//! ```
//!
//! Workers pull the highest-priority task (FIFO within a priority level),
//! run it, and loop until the queue closes. Shutdown closes the queue —
//! draining or discarding buffered tasks per [`DrainPolicy`] — and joins
//! every worker.

mod pool;
mod priority;

pub use pool::{DrainPolicy, SchedulerConfig, ThreadPool};
pub use priority::Priority;

use thiserror::Error;

/// Work item accepted by a scheduler.
pub type TaskFn = Box<dyn FnOnce() + Send + 'static>;

/// Scheduling failed; the task was not enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ScheduleError {
    /// The scheduler has been shut down.
    #[error("scheduler is shut down")]
    ShutDown,
}

/// Contract for handing work to a background executor.
///
/// Collaborators hold an `Arc<dyn TaskScheduler>` so the pool can be
/// replaced by an inline executor in tests.
pub trait TaskScheduler: Send + Sync {
    /// Enqueue a task at the given priority.
    fn schedule_with_priority(&self, priority: Priority, task: TaskFn) -> Result<(), ScheduleError>;

    /// Enqueue a task at [`Priority::Normal`].
    fn schedule(&self, task: TaskFn) -> Result<(), ScheduleError> {
        self.schedule_with_priority(Priority::Normal, task)
    }
}
