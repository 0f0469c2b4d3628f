//! Blocking multi-producer/multi-consumer queue.
//!
//! [`SyncQueue`] hands items from any number of producers to any number of
//! consumers. `pull` blocks while the queue is empty; `push` blocks while a
//! bounded queue is full. Ordering is pluggable through [`QueueOrder`] so
//! the scheduler can swap the default FIFO buffer for a priority buffer
//! without changing the blocking discipline.
//!
//! Closing the queue unblocks everyone: producers get their item back,
//! consumers drain whatever is left (or nothing, after
//! [`close_and_discard`](SyncQueue::close_and_discard)).

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

/// Buffer discipline for a [`SyncQueue`].
///
/// Implementations decide which queued item `dequeue` yields next; the
/// queue itself only supplies the blocking and close semantics around it.
pub trait QueueOrder<T>: Default {
    /// Add an item to the buffer.
    fn enqueue(&mut self, item: T);
    /// Remove and return the next item, if any.
    fn dequeue(&mut self) -> Option<T>;
    /// Number of buffered items.
    fn len(&self) -> usize;
    /// Whether the buffer is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Drop all buffered items.
    fn clear(&mut self);
}

/// First-in/first-out buffer; the default discipline.
#[derive(Debug)]
pub struct Fifo<T> {
    items: VecDeque<T>,
}

impl<T> Default for Fifo<T> {
    fn default() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }
}

impl<T> QueueOrder<T> for Fifo<T> {
    fn enqueue(&mut self, item: T) {
        self.items.push_back(item);
    }

    fn dequeue(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn clear(&mut self) {
        self.items.clear();
    }
}

/// Why a push did not enqueue. The rejected item is handed back.
pub enum PushError<T> {
    /// The queue was closed before or while waiting for space.
    Closed(T),
    /// A bounded queue stayed full for the whole timeout.
    Timeout(T),
}

impl<T> PushError<T> {
    /// Recover the item that was not enqueued.
    pub fn into_inner(self) -> T {
        match self {
            PushError::Closed(item) | PushError::Timeout(item) => item,
        }
    }
}

// Manual impls: queued items (task closures) are usually not Debug.
impl<T> fmt::Debug for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::Closed(_) => write!(f, "PushError::Closed(..)"),
            PushError::Timeout(_) => write!(f, "PushError::Timeout(..)"),
        }
    }
}

impl<T> fmt::Display for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::Closed(_) => write!(f, "queue closed"),
            PushError::Timeout(_) => write!(f, "queue full past timeout"),
        }
    }
}

impl<T> std::error::Error for PushError<T> {}

/// Why a timed pull returned no item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PullError {
    /// The queue is closed and fully drained.
    #[error("queue closed and drained")]
    Closed,
    /// No item arrived within the timeout.
    #[error("queue empty past timeout")]
    TimedOut,
}

struct QueueState<T, O: QueueOrder<T>> {
    buffer: O,
    closed: bool,
    _marker: std::marker::PhantomData<T>,
}

/// Thread-safe blocking queue with pluggable ordering.
pub struct SyncQueue<T, O: QueueOrder<T> = Fifo<T>> {
    state: Mutex<QueueState<T, O>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: Option<usize>,
}

impl<T, O: QueueOrder<T>> Default for SyncQueue<T, O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, O: QueueOrder<T>> SyncQueue<T, O> {
    /// Create an unbounded queue.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                buffer: O::default(),
                closed: false,
                _marker: std::marker::PhantomData,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity: None,
        }
    }

    /// Create a bounded queue; `push` blocks while `capacity` items are
    /// buffered.
    pub fn bounded(capacity: usize) -> Self {
        let mut queue = Self::new();
        queue.capacity = Some(capacity.max(1));
        queue
    }

    /// Enqueue an item, blocking while a bounded queue is full.
    ///
    /// Exactly one blocked consumer is woken per successful push.
    pub fn push(&self, item: T) -> Result<(), PushError<T>> {
        self.push_inner(item, None)
    }

    /// Enqueue an item, giving up after `timeout` if the queue stays full.
    pub fn push_timeout(&self, item: T, timeout: Duration) -> Result<(), PushError<T>> {
        self.push_inner(item, Some(timeout))
    }

    fn push_inner(&self, item: T, timeout: Option<Duration>) -> Result<(), PushError<T>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(PushError::Closed(item));
            }
            match self.capacity {
                Some(capacity) if state.buffer.len() >= capacity => match deadline {
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            return Err(PushError::Timeout(item));
                        }
                        self.not_full.wait_for(&mut state, deadline - now);
                    }
                    None => self.not_full.wait(&mut state),
                },
                _ => break,
            }
        }
        state.buffer.enqueue(item);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Dequeue the next item, blocking while the queue is empty.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub fn pull(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.buffer.dequeue() {
                self.not_full.notify_one();
                return Some(item);
            }
            if state.closed {
                return None;
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Dequeue the next item, giving up after `timeout` if none arrives.
    pub fn pull_timeout(&self, timeout: Duration) -> Result<T, PullError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.buffer.dequeue() {
                self.not_full.notify_one();
                return Ok(item);
            }
            if state.closed {
                return Err(PullError::Closed);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(PullError::TimedOut);
            }
            self.not_empty.wait_for(&mut state, deadline - now);
        }
    }

    /// Dequeue the next item without blocking.
    pub fn try_pull(&self) -> Option<T> {
        let mut state = self.state.lock();
        let item = state.buffer.dequeue();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Close the queue. Producers are refused; consumers drain what
    /// remains, then observe closure.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Close the queue and drop everything still buffered.
    pub fn close_and_discard(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.buffer.clear();
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Whether the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of buffered items.
    pub fn len(&self) -> usize {
        self.state.lock().buffer.len()
    }

    /// Whether the queue is currently empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capacity bound, if any.
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}
