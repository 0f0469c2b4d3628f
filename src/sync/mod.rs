//! Low-level synchronization primitives.
//!
//! Foundation types used by the scheduler, the cache tiers, and the request
//! layer:
//!
//! - [`Guarded`] / [`RwGuarded`]: lock wrappers with scoped closure access
//! - [`Condition`]: one-shot timed wait/notify
//! - [`SyncQueue`]: blocking multi-producer/multi-consumer queue

mod condition;
mod guard;
mod queue;

pub use condition::Condition;
pub use guard::{Guarded, RwGuarded};
pub use queue::{Fifo, PullError, PushError, QueueOrder, SyncQueue};
