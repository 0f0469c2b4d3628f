//! Worker pool backed by the blocking sync queue.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use crate::scheduler::priority::{PriorityOrder, ScheduledTask};
use crate::scheduler::{Priority, ScheduleError, TaskFn, TaskScheduler};
use crate::sync::{Guarded, SyncQueue};

/// What happens to tasks still queued when the pool shuts down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DrainPolicy {
    /// Workers finish everything already queued before exiting.
    #[default]
    Drain,
    /// Queued tasks are dropped; workers exit after their current task.
    Discard,
}

/// Thread-pool configuration.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Number of worker threads.
    pub workers: usize,
    /// Shutdown behavior for queued tasks.
    pub drain: DrainPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            drain: DrainPolicy::Drain,
        }
    }
}

impl SchedulerConfig {
    /// Set the worker thread count (minimum 1).
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Set the shutdown drain policy.
    pub fn with_drain_policy(mut self, drain: DrainPolicy) -> Self {
        self.drain = drain;
        self
    }
}

/// Fixed-size pool of named worker threads.
///
/// Each worker loops pulling the highest-priority task from the shared
/// queue and running it. [`shutdown`](ThreadPool::shutdown) (or drop)
/// closes the queue per the configured [`DrainPolicy`] and joins every
/// worker.
pub struct ThreadPool {
    queue: Arc<SyncQueue<ScheduledTask, PriorityOrder>>,
    workers: Guarded<Vec<JoinHandle<()>>>,
    worker_count: usize,
    drain: DrainPolicy,
}

impl ThreadPool {
    /// Spawn a pool with the given configuration.
    pub fn new(config: SchedulerConfig) -> Self {
        let queue = Arc::new(SyncQueue::new());
        let worker_count = config.workers.max(1);
        let mut workers = Vec::with_capacity(worker_count);

        for index in 0..worker_count {
            let queue = Arc::clone(&queue);
            let handle = thread::Builder::new()
                .name(format!("geostrata-worker-{index}"))
                .spawn(move || Self::worker_loop(index, queue))
                .expect("Failed to spawn scheduler worker thread");
            workers.push(handle);
        }

        info!(workers = worker_count, "task scheduler started");

        Self {
            queue,
            workers: Guarded::new(workers),
            worker_count,
            drain: config.drain,
        }
    }

    /// Spawn a pool with default configuration (one worker, drain on
    /// shutdown).
    pub fn with_defaults() -> Self {
        Self::new(SchedulerConfig::default())
    }

    fn worker_loop(index: usize, queue: Arc<SyncQueue<ScheduledTask, PriorityOrder>>) {
        debug!(worker = index, "scheduler worker started");
        while let Some(task) = queue.pull() {
            (task.run)();
        }
        debug!(worker = index, "scheduler worker stopped");
    }

    /// Number of worker threads.
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Number of tasks waiting to be dispatched.
    pub fn queued_tasks(&self) -> usize {
        self.queue.len()
    }

    /// Whether the pool has been shut down.
    pub fn is_shut_down(&self) -> bool {
        self.queue.is_closed()
    }

    /// Stop accepting tasks, apply the drain policy, and join all workers.
    ///
    /// Idempotent; later calls are no-ops.
    pub fn shutdown(&self) {
        match self.drain {
            DrainPolicy::Drain => self.queue.close(),
            DrainPolicy::Discard => self.queue.close_and_discard(),
        }
        let handles = self.workers.locked(|workers| workers.drain(..).collect::<Vec<_>>());
        for handle in handles {
            if let Err(e) = handle.join() {
                warn!("scheduler worker panicked: {:?}", e);
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl TaskScheduler for ThreadPool {
    fn schedule_with_priority(&self, priority: Priority, task: TaskFn) -> Result<(), ScheduleError> {
        self.queue
            .push(ScheduledTask {
                priority,
                run: task,
            })
            .map_err(|_| ScheduleError::ShutDown)
    }
}
