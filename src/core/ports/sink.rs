use std::sync::Arc;
use thiserror::Error;

/// Why a frame could not be handed to a connection writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SinkError {
    /// The writer is alive but its buffer is full (backpressure).
    #[error("connection writer buffer is full")]
    Full,
    /// The writer is gone; the connection must be unregistered.
    #[error("connection writer is closed")]
    Closed,
}

/// The write half of one server-side push connection.
///
/// `push` must never block: the router fans a single emission out to many
/// connections and one slow writer may not delay the others. Implementations
/// buffer the line and report `SinkError::Full` when they cannot.
///
/// The trait is marked with `#[cfg_attr(feature = "test-helpers", mockall::automock)]`
/// so that a mock implementation is generated when the `test-helpers` feature is enabled.
#[cfg_attr(feature = "test-helpers", mockall::automock)]
pub trait PushSink: Send + Sync {
    /// Queues one newline-terminated frame for writing.
    fn push(&self, line: Arc<str>) -> Result<(), SinkError>;
}
