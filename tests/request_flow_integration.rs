//! Integration tests for the request pipeline.
//!
//! These tests verify the complete client workflow including:
//! - Coalescing of identical requests issued from many threads
//! - Outcome delivery to blocking and async waiters
//! - Waiter-detach and propagate cancellation modes
//! - Registry replacement once every caller has cancelled
//! - Cache invalidation forcing a refetch
//! - Client shutdown aborting in-flight work

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use geostrata::cache::{Capacity, TieredCacheConfig};
use geostrata::config::CoreConfig;
use geostrata::request::{CancellationMode, FetchError, RequestOutcome};
use geostrata::scheduler::SchedulerConfig;
use geostrata::service::{DataClient, FetchRequest};

// =============================================================================
// Test Helpers
// =============================================================================

const WAIT: Duration = Duration::from_secs(10);

/// Routes tracing output through the test harness so `--nocapture` shows it.
fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn client() -> DataClient {
    client_with_mode(CancellationMode::DetachWaiter)
}

fn client_with_mode(mode: CancellationMode) -> DataClient {
    init_tracing();
    let config = CoreConfig::new()
        .with_cache(TieredCacheConfig::memory_only(Capacity::Items(64)))
        .with_scheduler(SchedulerConfig::default().with_workers(4))
        .with_cancellation_mode(mode);
    DataClient::new(config).expect("client construction")
}

fn imagery(partition: &str) -> FetchRequest {
    FetchRequest::new("imagery", partition).with_version(12)
}

/// Fetcher that counts invocations and blocks until the gate delivers the
/// result it should return.
fn gated_fetcher(
    calls: &Arc<AtomicUsize>,
    gate: mpsc::Receiver<Result<Bytes, FetchError>>,
) -> impl FnOnce(&FetchRequest) -> Result<Bytes, FetchError> + Send + 'static {
    let calls = Arc::clone(calls);
    move |_| {
        calls.fetch_add(1, Ordering::SeqCst);
        gate.recv()
            .unwrap_or_else(|_| Err(FetchError::Network("gate dropped".to_string())))
    }
}

/// Fetcher for callers that must coalesce; failing loudly if it ever runs.
fn must_not_run(request: &FetchRequest) -> Result<Bytes, FetchError> {
    Err(FetchError::Network(format!(
        "duplicate fetch for {}",
        request.fingerprint()
    )))
}

// =============================================================================
// Integration Tests
// =============================================================================

#[test]
fn test_concurrent_callers_coalesce_onto_one_fetch() {
    let client = client();
    let calls = Arc::new(AtomicUsize::new(0));
    let (release, gate) = mpsc::channel();

    let executor = client.request(imagery("500"), gated_fetcher(&calls, gate));
    assert!(executor.is_executor());

    let mut handles = vec![executor];
    for _ in 0..7 {
        let handle = client.request(imagery("500"), must_not_run);
        assert!(!handle.is_executor());
        handles.push(handle);
    }

    let waiters: Vec<_> = handles
        .into_iter()
        .map(|handle| thread::spawn(move || handle.wait_timeout(WAIT)))
        .collect();

    release.send(Ok(Bytes::from_static(b"tile bytes"))).unwrap();

    for waiter in waiters {
        let outcome = waiter.join().expect("waiter thread");
        assert_eq!(
            outcome,
            Some(RequestOutcome::Completed(Bytes::from_static(b"tile bytes")))
        );
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let stats = client.registry_stats();
    assert_eq!(stats.created, 1);
    assert_eq!(stats.coalesced, 7);
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn test_blocking_and_async_waiters_observe_the_same_outcome() {
    let client = client();
    let calls = Arc::new(AtomicUsize::new(0));
    let (release, gate) = mpsc::channel();

    let executor = client.request(imagery("501"), gated_fetcher(&calls, gate));
    let waiter = client.request(imagery("501"), must_not_run);

    thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        release.send(Ok(Bytes::from_static(b"strata"))).unwrap();
    });

    let (first, second) = tokio::join!(executor.join(), waiter.join());
    assert_eq!(first, RequestOutcome::Completed(Bytes::from_static(b"strata")));
    assert_eq!(second, first);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_waiter_cancellation_detaches_only_that_caller() {
    let client = client();
    let calls = Arc::new(AtomicUsize::new(0));
    let (release, gate) = mpsc::channel();

    let executor = client.request(imagery("502"), gated_fetcher(&calls, gate));
    let waiter = client.request(imagery("502"), must_not_run);

    assert!(waiter.cancel());
    // The cancelled caller observes its own view immediately.
    assert_eq!(waiter.wait_timeout(WAIT), Some(RequestOutcome::Cancelled));

    // The shared operation is unaffected.
    release.send(Ok(Bytes::from_static(b"kept going"))).unwrap();
    assert_eq!(
        executor.wait_timeout(WAIT),
        Some(RequestOutcome::Completed(Bytes::from_static(b"kept going")))
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_propagate_mode_waiter_cancellation_aborts_the_operation() {
    let client = client_with_mode(CancellationMode::PropagateToAll);
    let (started_tx, started_rx) = mpsc::channel();
    let (release, gate) = mpsc::channel::<Result<Bytes, FetchError>>();

    let executor = client.request(imagery("503"), move |_| {
        started_tx.send(()).unwrap();
        gate.recv().unwrap()
    });
    let waiter = client.request(imagery("503"), must_not_run);

    // Cancel only once the fetch is genuinely in flight.
    started_rx.recv().unwrap();
    assert!(waiter.cancel());
    release.send(Ok(Bytes::from_static(b"discarded"))).unwrap();

    assert_eq!(executor.wait_timeout(WAIT), Some(RequestOutcome::Cancelled));
    assert_eq!(waiter.wait_timeout(WAIT), Some(RequestOutcome::Cancelled));
    assert!(!client.cache().contains(&imagery("503").cache_key()));
}

#[test]
fn test_fully_cancelled_request_leaves_the_registry_before_settling() {
    let client = client();
    let calls = Arc::new(AtomicUsize::new(0));
    let (started_tx, started_rx) = mpsc::channel();
    let (old_release, old_gate) = mpsc::channel::<Result<Bytes, FetchError>>();

    let executor = {
        let calls = Arc::clone(&calls);
        client.request(imagery("504"), move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            started_tx.send(()).unwrap();
            old_gate.recv().unwrap()
        })
    };
    let waiter = client.request(imagery("504"), must_not_run);
    started_rx.recv().unwrap();

    // Every caller gives up while the fetch is still blocked.
    assert!(executor.cancel());
    assert!(waiter.cancel());
    assert_eq!(client.pending_requests(), 0);

    // An identical request now starts fresh instead of joining the
    // abandoned operation.
    let (new_release, new_gate) = mpsc::channel();
    let fresh = client.request(imagery("504"), gated_fetcher(&calls, new_gate));
    assert!(fresh.is_executor());

    // The abandoned fetch returning must not disturb the fresh context.
    old_release.send(Ok(Bytes::from_static(b"too late"))).unwrap();
    new_release.send(Ok(Bytes::from_static(b"fresh"))).unwrap();

    assert_eq!(
        fresh.wait_timeout(WAIT),
        Some(RequestOutcome::Completed(Bytes::from_static(b"fresh")))
    );
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_distinct_partitions_fetch_independently() {
    let client = client();
    let (started_a_tx, started_a_rx) = mpsc::channel();
    let (started_b_tx, started_b_rx) = mpsc::channel();
    let (release_a, gate_a) = mpsc::channel::<Result<Bytes, FetchError>>();
    let (release_b, gate_b) = mpsc::channel::<Result<Bytes, FetchError>>();

    let first = client.request(imagery("600"), move |_| {
        started_a_tx.send(()).unwrap();
        gate_a.recv().unwrap()
    });
    let second = client.request(imagery("601"), move |_| {
        started_b_tx.send(()).unwrap();
        gate_b.recv().unwrap()
    });

    // Both fetches run concurrently on the pool; neither blocks the other.
    started_a_rx.recv().unwrap();
    started_b_rx.recv().unwrap();
    release_a.send(Ok(Bytes::from_static(b"a"))).unwrap();
    release_b.send(Ok(Bytes::from_static(b"b"))).unwrap();

    assert_eq!(
        first.wait_timeout(WAIT),
        Some(RequestOutcome::Completed(Bytes::from_static(b"a")))
    );
    assert_eq!(
        second.wait_timeout(WAIT),
        Some(RequestOutcome::Completed(Bytes::from_static(b"b")))
    );

    let stats = client.registry_stats();
    assert_eq!(stats.created, 2);
    assert_eq!(stats.coalesced, 0);
}

#[test]
fn test_layer_invalidation_forces_a_refetch() {
    let client = client();
    let calls = Arc::new(AtomicUsize::new(0));

    let fetch = |calls: &Arc<AtomicUsize>| {
        let calls = Arc::clone(calls);
        move |_: &FetchRequest| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Bytes::from_static(b"versioned tile"))
        }
    };

    for _ in 0..2 {
        let handle = client.request(imagery("700"), fetch(&calls));
        assert!(handle.wait_timeout(WAIT).is_some());
    }
    // Second round trip was a cache hit.
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let removed = client.cache().remove_keys_with_prefix("imagery::");
    assert_eq!(removed, 1);

    let handle = client.request(imagery("700"), fetch(&calls));
    assert_eq!(
        handle.wait_timeout(WAIT),
        Some(RequestOutcome::Completed(Bytes::from_static(b"versioned tile")))
    );
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_shutdown_aborts_inflight_work_and_drains_the_pool() {
    let client = client();
    let (started_tx, started_rx) = mpsc::channel();
    let (release, gate) = mpsc::channel::<Result<Bytes, FetchError>>();

    let handle = client.request(imagery("800"), move |_| {
        started_tx.send(()).unwrap();
        gate.recv().unwrap()
    });
    started_rx.recv().unwrap();

    // The blocked fetch returns shortly after shutdown begins; shutdown
    // must wait for the worker to finish it.
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        release.send(Ok(Bytes::from_static(b"late"))).unwrap();
    });
    client.shutdown();

    assert_eq!(handle.wait_timeout(WAIT), Some(RequestOutcome::Cancelled));
    assert_eq!(client.pending_requests(), 0);
}
