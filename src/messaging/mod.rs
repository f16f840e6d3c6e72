pub mod event_listener;

use crate::core::domain::connection::{ConnectionId, Station};
use crate::utils::error::BusResult;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Lifecycle events published by the notification bus.
///
/// These events let other parts of the process observe what the router is doing
/// (connections coming and going, deliveries that gave up) without sitting on the
/// emission path. They are never sent to stations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BusEvent {
    /// A push stream was registered.
    ConnectionOpened {
        connection_id: ConnectionId,
        tenant_id: String,
        user_id: String,
        station: Station,
    },
    /// A push stream was unregistered, by the client, by a write failure or by
    /// the liveness sweep.
    ConnectionClosed {
        connection_id: ConnectionId,
        tenant_id: String,
        reason: String,
    },
    /// An acknowledgment-required event exhausted its redeliveries.
    DeliveryFailed {
        event_id: String,
        connection_id: Option<ConnectionId>,
        attempts: u32,
        reason: String,
    },
    /// A queued event was discarded because its TTL elapsed.
    QueueExpired {
        event_id: String,
        tenant_id: String,
        user_id: String,
    },
}

impl BusEvent {
    /// `true` for the variants that describe a failed or lost delivery.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            BusEvent::DeliveryFailed { .. } | BusEvent::QueueExpired { .. }
        )
    }
}

/// A simple event publisher based on Tokio's broadcast channel.
///
/// The `Publisher` allows multiple subscribers to receive bus lifecycle events
/// concurrently.
#[derive(Clone)]
pub struct Publisher {
    sender: broadcast::Sender<BusEvent>,
}

impl Publisher {
    /// Creates a new `Publisher` with the specified buffer size.
    ///
    /// The buffer size determines how many events can be queued before slow
    /// subscribers start lagging.
    ///
    /// # Arguments
    ///
    /// * `buffer` - The capacity of the broadcast channel.
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer.max(1));
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// # Returns
    ///
    /// A `BusResult<usize>` with the number of subscribers that received the event,
    /// or an error if nobody is subscribed.
    pub fn publish(&self, event: BusEvent) -> BusResult<usize> {
        self.sender.send(event).map_err(|e| e.into())
    }

    /// Returns a new receiver subscribed to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers_is_an_error() {
        let publisher = Publisher::new(4);
        let result = publisher.publish(BusEvent::QueueExpired {
            event_id: "e1".into(),
            tenant_id: "t1".into(),
            user_id: "u1".into(),
        });
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let publisher = Publisher::new(4);
        let mut receiver = publisher.subscribe();
        let event = BusEvent::ConnectionClosed {
            connection_id: ConnectionId::new(),
            tenant_id: "t1".into(),
            reason: "client".into(),
        };
        assert_eq!(publisher.publish(event.clone()).unwrap(), 1);
        assert_eq!(receiver.recv().await.unwrap(), event);
        assert!(!event.is_failure());
    }
}
