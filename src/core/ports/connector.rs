use crate::core::domain::delivery::ClientMessage;
use crate::utils::error::BusResult;
use async_trait::async_trait;
use futures_util::Stream;
use std::pin::Pin;
use tokio::sync::mpsc;

/// Lines read from the push stream, one frame per item.
pub type FrameStream = Pin<Box<dyn Stream<Item = BusResult<String>> + Send>>;

/// An open client-side push stream.
///
/// `frames` yields raw frame lines in arrival order and ends when the server
/// closes the stream. `replies` carries acknowledgments and heartbeats back.
pub struct ClientChannel {
    pub frames: FrameStream,
    pub replies: mpsc::Sender<ClientMessage>,
}

/// Opens push streams for the client runtime.
///
/// The runtime calls `connect` once per attempt and owns the reconnect policy;
/// implementations perform a single attempt and return its error unchanged.
///
/// The trait is marked with `#[cfg_attr(feature = "test-helpers", mockall::automock)]`
/// so that a mock implementation is generated when the `test-helpers` feature is enabled.
#[cfg_attr(feature = "test-helpers", mockall::automock)]
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self) -> BusResult<ClientChannel>;
}
