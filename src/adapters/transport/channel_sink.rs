use crate::core::ports::sink::{PushSink, SinkError};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};

/// [`PushSink`] over a bounded mpsc channel.
///
/// The receiving half belongs to the task that owns the actual socket. A full
/// channel is reported as backpressure, a dropped receiver as a closed writer.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::Sender<Arc<str>>,
}

impl ChannelSink {
    pub fn new(sender: mpsc::Sender<Arc<str>>) -> Self {
        Self { sender }
    }
}

impl PushSink for ChannelSink {
    fn push(&self, line: Arc<str>) -> Result<(), SinkError> {
        self.sender.try_send(line).map_err(|e| match e {
            TrySendError::Full(_) => SinkError::Full,
            TrySendError::Closed(_) => SinkError::Closed,
        })
    }
}

/// Creates a sink and the receiver its frames arrive on.
pub fn channel(capacity: usize) -> (ChannelSink, mpsc::Receiver<Arc<str>>) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (ChannelSink::new(sender), receiver)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_and_closed_are_distinguished() {
        let (sink, receiver) = channel(1);
        assert_eq!(sink.push(Arc::from("a\n")), Ok(()));
        assert_eq!(sink.push(Arc::from("b\n")), Err(SinkError::Full));
        drop(receiver);
        assert_eq!(sink.push(Arc::from("c\n")), Err(SinkError::Closed));
    }
}
