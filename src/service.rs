//! Client facade: deduplicated, cached, scheduled data requests.
//!
//! `DataClient` composes the pieces the rest of the crate provides into the
//! flow a data-access layer consumes:
//!
//! ```text
//!                 ┌────────────────────────────────────────────────┐
//!                 │                   DataClient                   │
//!                 │                                                │
//! request ───────►│ RequestRegistry ──► ThreadPool ──► chain:      │
//!   │             │   (dedup)            (workers)    cache check  │
//!   handle ◄──────┤                                   └─► fetch    │
//!                 │                                   cache write  │
//!                 │        TieredCache ◄──────────────────┘        │
//!                 └────────────────────────────────────────────────┘
//! ```
//!
//! The first caller for a fingerprint becomes the executor: a continuation
//! chain is scheduled that consults the tiered cache, invokes the fetch
//! collaborator on a miss, writes the fetched payload back, and settles the
//! shared context. Every concurrent caller with the same fingerprint gets a
//! handle onto that one operation; the fetch runs exactly once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::cache::{CacheError, CacheKey, TieredCache};
use crate::chain::{ChainOutcome, ContinuationChain, Resumer, StepControl, StepOutcome};
use crate::config::CoreConfig;
use crate::request::{
    FetchError, Fingerprint, RegistryStats, RequestHandle, RequestOutcome, RequestRegistry,
    TaskContext,
};
use crate::scheduler::{TaskScheduler, ThreadPool};

/// Parameters identifying one piece of layer data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    layer: String,
    partition: String,
    version: Option<u64>,
}

impl FetchRequest {
    /// Request the latest version of a partition.
    pub fn new(layer: impl Into<String>, partition: impl Into<String>) -> Self {
        Self {
            layer: layer.into(),
            partition: partition.into(),
            version: None,
        }
    }

    /// Pin the request to a catalog version.
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    pub fn layer(&self) -> &str {
        &self.layer
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    pub fn version(&self) -> Option<u64> {
        self.version
    }

    /// Identity used for deduplication.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::from_parts(&self.layer, &self.partition, self.version)
    }

    /// Cache key for the payload; same identity as the fingerprint, so
    /// layer-wide invalidation is a prefix removal.
    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(self.fingerprint().as_str())
    }
}

/// Completion port handed to the fetch collaborator.
///
/// Deliver exactly once, from any thread; delivering inline before the
/// collaborator returns is fine. Dropping it undelivered cancels the
/// request, so a collaborator that loses its upstream cannot wedge the
/// waiters.
pub struct FetchCompletion {
    resumer: Resumer<Bytes, FetchError>,
}

impl FetchCompletion {
    /// Deliver the fetch result, advancing or failing the request chain.
    pub fn deliver(self, result: Result<Bytes, FetchError>) {
        match result {
            Ok(data) => self.resumer.resume(data),
            Err(error) => self.resumer.abort(error),
        }
    }
}

/// Deduplicating, caching front door for layer data.
///
/// Owns the tiered cache, the worker pool, and the pending-request
/// registry. Dropping the client cancels in-flight work and shuts the pool
/// down per its drain policy.
pub struct DataClient {
    cache: Arc<TieredCache>,
    scheduler: Arc<ThreadPool>,
    registry: RequestRegistry,
}

impl DataClient {
    pub fn new(config: CoreConfig) -> Result<Self, CacheError> {
        let scheduler = Arc::new(ThreadPool::new(config.scheduler));
        let cache = Arc::new(
            TieredCache::new(config.cache)?
                .with_scheduler(Arc::clone(&scheduler) as Arc<dyn TaskScheduler>),
        );
        let registry = RequestRegistry::new(config.cancellation);
        info!(workers = scheduler.worker_count(), "data client ready");
        Ok(Self {
            cache,
            scheduler,
            registry,
        })
    }

    /// The tiered cache, for direct reads, invalidation, and pinning.
    pub fn cache(&self) -> &TieredCache {
        &self.cache
    }

    /// Request data with a synchronous fetch collaborator.
    ///
    /// Sugar over [`request_with`](Self::request_with) for collaborators
    /// that can produce their result on the worker thread.
    pub fn request<F>(&self, request: FetchRequest, fetcher: F) -> RequestHandle
    where
        F: FnOnce(&FetchRequest) -> Result<Bytes, FetchError> + Send + 'static,
    {
        self.request_with(request, move |request, completion: FetchCompletion| {
            completion.deliver(fetcher(request));
        })
    }

    /// Request data, fetching on a cache miss.
    ///
    /// If an identical request is already in flight the caller coalesces
    /// onto it and no new work starts. Otherwise a chain is scheduled on
    /// the worker pool: consult the cache, invoke `fetcher` on a miss, and
    /// cache what it delivers. The collaborator receives a
    /// [`FetchCompletion`] it may satisfy inline or from another thread
    /// (e.g. a network callback).
    ///
    /// The returned handle observes this caller's view of the outcome;
    /// dropping it does not cancel anything.
    pub fn request_with<F>(&self, request: FetchRequest, fetcher: F) -> RequestHandle
    where
        F: FnOnce(&FetchRequest, FetchCompletion) + Send + 'static,
    {
        let handle = self.registry.get_or_create(request.fingerprint());
        if !handle.is_executor() {
            return handle;
        }

        let context = handle.context();
        let chain = self.build_chain(request, fetcher, &context);

        let task = {
            let context = Arc::clone(&context);
            let registry = self.registry.clone();
            Box::new(move || {
                if context.start() {
                    chain.run(Bytes::new());
                } else {
                    debug!(
                        fingerprint = %context.fingerprint(),
                        "request cancelled before execution"
                    );
                    registry.complete(&context, RequestOutcome::Cancelled);
                }
            })
        };

        if let Err(error) = self.scheduler.schedule(task) {
            warn!(
                fingerprint = %context.fingerprint(),
                error = %error,
                "scheduler rejected request"
            );
            self.registry.complete(&context, RequestOutcome::Cancelled);
        }

        handle
    }

    /// Assemble the cache-check -> fetch -> cache-write chain for one
    /// request. The cache check and the fetch dispatch share a step
    /// because a miss has no value to advance with; the collaborator's
    /// completion port resumes the chain instead.
    fn build_chain<F>(
        &self,
        request: FetchRequest,
        fetcher: F,
        context: &Arc<TaskContext>,
    ) -> ContinuationChain<Bytes, FetchError>
    where
        F: FnOnce(&FetchRequest, FetchCompletion) + Send + 'static,
    {
        let key = request.cache_key();
        let fetched = Arc::new(AtomicBool::new(false));

        let resolve_step = {
            let cache = Arc::clone(&self.cache);
            let key = key.clone();
            let fetched = Arc::clone(&fetched);
            move |control: &mut StepControl<Bytes, FetchError>, _seed: Bytes| {
                if let Some(data) = cache.get(&key) {
                    debug!(key = %key, "request served from cache");
                    return StepOutcome::Advance(data);
                }
                fetched.store(true, Ordering::Release);
                let completion = FetchCompletion {
                    resumer: control.resumer(),
                };
                fetcher(&request, completion);
                StepOutcome::Pending
            }
        };

        let cache_write_step = {
            let cache = Arc::clone(&self.cache);
            move |_control: &mut StepControl<Bytes, FetchError>, data: Bytes| {
                if fetched.load(Ordering::Acquire) {
                    // A refused cache write must not fail the request; the
                    // waiters still get the payload.
                    if let Err(error) = cache.put(key.clone(), data.clone()) {
                        warn!(key = %key, error = %error, "fetched value not cached");
                    }
                }
                StepOutcome::Advance(data)
            }
        };

        let finally = {
            let registry = self.registry.clone();
            let context = Arc::clone(context);
            move |outcome: ChainOutcome<Bytes, FetchError>| {
                let outcome = match outcome {
                    ChainOutcome::Completed(data) => RequestOutcome::Completed(data),
                    ChainOutcome::Failed(error) => RequestOutcome::Failed(error),
                    ChainOutcome::Cancelled => RequestOutcome::Cancelled,
                };
                registry.complete(&context, outcome);
            }
        };

        ContinuationChain::with_token(context.token().clone())
            .then(resolve_step)
            .then(cache_write_step)
            .finally(finally)
    }

    /// Number of operations currently in flight.
    pub fn pending_requests(&self) -> usize {
        self.registry.len()
    }

    /// Deduplication counters for this client.
    pub fn registry_stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    /// Request cancellation of everything in flight.
    pub fn cancel_all(&self) {
        self.registry.cancel_all();
    }

    /// Cancel in-flight work and stop the worker pool per its drain
    /// policy. Idempotent; also runs on drop.
    pub fn shutdown(&self) {
        self.cancel_all();
        self.scheduler.shutdown();
    }
}

impl Drop for DataClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}
