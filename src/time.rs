//! Clock abstraction for expiry decisions.
//!
//! Cache tiers compare entry expiry against "now". Routing that comparison
//! through a trait lets tests drive time forward deterministically instead
//! of sleeping.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Source of the current wall-clock time.
pub trait Clock: Send + Sync {
    /// Current time.
    fn now(&self) -> SystemTime;
}

/// Production clock backed by [`SystemTime::now`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Shared clock handle used throughout the cache tiers.
pub type SharedClock = Arc<dyn Clock>;

/// Default shared clock.
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

/// Clock that only moves when told to. For tests of expiry behavior.
#[derive(Debug)]
pub struct ManualClock {
    now: parking_lot::Mutex<SystemTime>,
}

impl ManualClock {
    /// Clock frozen at `start`.
    pub fn starting_at(start: SystemTime) -> Arc<Self> {
        Arc::new(Self {
            now: parking_lot::Mutex::new(start),
        })
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock()
    }
}
