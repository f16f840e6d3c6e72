//! Client runtime for stations consuming the push stream.

pub mod backoff;
pub mod dedup;
pub mod optimistic;
pub mod runtime;
pub mod subscriptions;

/// Dispatched locally when an optimistic update times out unconfirmed.
/// The payload data is the rolled back `OptimisticUpdate`.
pub const OPTIMISTIC_ROLLBACK: &str = "client:optimistic_rollback";

pub use runtime::ClientRuntime;
pub use subscriptions::Subscription;
