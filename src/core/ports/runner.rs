use crate::utils::error::BusResult;
use async_trait::async_trait;

/// A unit of periodic background work.
///
/// The `Runner` trait abstracts maintenance passes that the scheduler invokes on a
/// fixed cadence, independent of request/response cycles: acknowledgment timeouts,
/// queue TTL sweeps, liveness sweeps and metrics snapshots. It takes `&mut self` so
/// an implementation may keep state between passes.
///
/// The trait is marked with `#[cfg_attr(feature = "test-helpers", mockall::automock)]` so that,
/// when enabled, a mock implementation is automatically generated for testing purposes.
#[cfg_attr(feature = "test-helpers", mockall::automock)]
#[async_trait]
pub trait Runner: Send + Sync {
    /// Runs one pass of the job.
    ///
    /// # Returns
    ///
    /// * `Ok(())` if the pass completed.
    /// * An appropriate error variant wrapped in a `BusResult` otherwise. The scheduler
    ///   logs it and keeps the job alive.
    async fn run(&mut self) -> BusResult<()>;
}
