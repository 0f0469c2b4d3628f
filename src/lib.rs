//! Geostrata - Execution and caching core for layered geodata access
//!
//! This library provides the client-side machinery for fetching partitioned
//! layer data: request deduplication, cooperative cancellation, a prioritized
//! worker pool, and a tiered memory/disk cache.
//!
//! # High-Level API
//!
//! For most use cases, the [`service`] module provides a simplified facade:
//!
//! ```ignore
//! use geostrata::config::CoreConfig;
//! use geostrata::service::{DataClient, FetchRequest};
//!
//! let client = DataClient::new(CoreConfig::default())?;
//!
//! // Concurrent identical requests coalesce onto one fetch.
//! let handle = client.request(FetchRequest::new("terrain", "379"), |req| {
//!     fetch_from_backend(req)
//! });
//! let outcome = handle.wait_timeout(std::time::Duration::from_secs(30));
//! ```
//!
//! The pieces compose individually as well: [`cache::TieredCache`] works
//! without a client, [`scheduler::ThreadPool`] runs any boxed task, and
//! [`chain::ContinuationChain`] sequences cancellable multi-stage work.

pub mod cache;
pub mod cancel;
pub mod chain;
pub mod config;
pub mod request;
pub mod scheduler;
pub mod service;
pub mod sync;
pub mod time;

/// Version of the geostrata library.
///
/// The version is defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
