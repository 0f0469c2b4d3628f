//! Request identity, deduplication, and outcome delivery.
//!
//! A request's [`Fingerprint`] keys the [`RequestRegistry`]; identical
//! concurrent requests share one [`TaskContext`] and every caller receives
//! the same [`RequestOutcome`].

mod context;
mod fingerprint;
mod outcome;
mod registry;

pub use context::{CallbackId, TaskContext, TaskState};
pub use fingerprint::Fingerprint;
pub use outcome::{FetchError, RequestOutcome};
pub use registry::{CancellationMode, RegistryStats, RequestHandle, RequestRegistry};
