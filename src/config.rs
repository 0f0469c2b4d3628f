//! Top-level configuration for the client core.
//!
//! One `CoreConfig` describes everything [`DataClient`](crate::service::DataClient)
//! composes: the tiered cache, the worker pool, and how waiter cancellation
//! propagates. Each part keeps its own builder; this type just groups them.

use crate::cache::TieredCacheConfig;
use crate::request::CancellationMode;
use crate::scheduler::SchedulerConfig;

/// Configuration for the whole client core.
///
/// The default is a memory-only cache, one worker thread, and waiter
/// cancellation that detaches only the cancelling caller.
#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    /// Tiered cache settings (memory capacity, persistent tier, TTL,
    /// write mode).
    pub cache: TieredCacheConfig,
    /// Worker pool settings (thread count, shutdown drain policy).
    pub scheduler: SchedulerConfig,
    /// What cancelling one caller's handle does to a shared operation.
    pub cancellation: CancellationMode,
}

impl CoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cache(mut self, cache: TieredCacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_cancellation_mode(mut self, cancellation: CancellationMode) -> Self {
        self.cancellation = cancellation;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Capacity;
    use crate::scheduler::DrainPolicy;

    #[test]
    fn default_is_memory_only_single_worker() {
        let config = CoreConfig::default();
        assert!(config.cache.persistent.is_none());
        assert_eq!(config.scheduler.workers, 1);
        assert_eq!(config.cancellation, CancellationMode::DetachWaiter);
    }

    #[test]
    fn builders_replace_each_part() {
        let config = CoreConfig::new()
            .with_cache(TieredCacheConfig::memory_only(Capacity::Items(100)))
            .with_scheduler(
                SchedulerConfig::default()
                    .with_workers(4)
                    .with_drain_policy(DrainPolicy::Discard),
            )
            .with_cancellation_mode(CancellationMode::PropagateToAll);

        assert_eq!(config.cache.memory.capacity, Capacity::Items(100));
        assert_eq!(config.scheduler.workers, 4);
        assert_eq!(config.scheduler.drain, DrainPolicy::Discard);
        assert_eq!(config.cancellation, CancellationMode::PropagateToAll);
    }
}
