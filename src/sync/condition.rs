//! One-shot wait/notify latch.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// A latch on which threads wait for a one-time event.
///
/// Once [`notify`](Condition::notify) fires the condition stays signaled:
/// completion of an operation is permanent, so late waiters return
/// immediately. Used for result readiness in `CancellableFuture` and for
/// blocking cancellation in the task context.
#[derive(Debug, Default)]
pub struct Condition {
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl Condition {
    /// Create an unsignaled condition.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal the condition, waking every current and future waiter.
    pub fn notify(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.condvar.notify_all();
    }

    /// Whether the condition has been signaled.
    pub fn is_notified(&self) -> bool {
        *self.signaled.lock()
    }

    /// Block until the condition is signaled.
    pub fn wait(&self) {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            self.condvar.wait(&mut signaled);
        }
    }

    /// Block until the condition is signaled or `timeout` elapses.
    ///
    /// Returns `true` if the condition was signaled, `false` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut signaled = self.signaled.lock();
        while !*signaled {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.condvar.wait_for(&mut signaled, deadline - now);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn notify_wakes_waiter() {
        let condition = Arc::new(Condition::new());
        let waiter = {
            let condition = Arc::clone(&condition);
            thread::spawn(move || condition.wait_timeout(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        condition.notify();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn wait_timeout_expires_without_notify() {
        let condition = Condition::new();
        let start = Instant::now();
        assert!(!condition.wait_timeout(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn late_waiter_returns_immediately() {
        let condition = Condition::new();
        condition.notify();
        assert!(condition.is_notified());
        // Already signaled; must not block.
        condition.wait();
        assert!(condition.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn notify_wakes_multiple_waiters() {
        let condition = Arc::new(Condition::new());
        let mut waiters = Vec::new();
        for _ in 0..4 {
            let condition = Arc::clone(&condition);
            waiters.push(thread::spawn(move || {
                condition.wait_timeout(Duration::from_secs(5))
            }));
        }
        thread::sleep(Duration::from_millis(20));
        condition.notify();
        for waiter in waiters {
            assert!(waiter.join().unwrap());
        }
    }
}
