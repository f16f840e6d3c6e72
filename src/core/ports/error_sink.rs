use crate::utils::error::BusResult;
use crate::utils::log_ring::LogEntry;
use async_trait::async_trait;

/// External destination for error-level log entries (an alerting webhook, say).
///
/// Forwarding happens off the emission path; failures are dropped by the caller.
#[cfg_attr(feature = "test-helpers", mockall::automock)]
#[async_trait]
pub trait ErrorSink: Send + Sync {
    async fn forward(&self, entry: &LogEntry) -> BusResult<()>;
}
