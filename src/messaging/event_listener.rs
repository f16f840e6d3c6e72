use crate::messaging::{BusEvent, Publisher};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::select;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Counters kept by the event listener.
#[derive(Default)]
struct EventStats {
    connections_opened: AtomicUsize,
    connections_closed: AtomicUsize,
    delivery_failures: AtomicUsize,
    queue_expirations: AtomicUsize,
}

/// Snapshot of [`EventListener`] counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerStats {
    pub connections_opened: usize,
    pub connections_closed: usize,
    pub delivery_failures: usize,
    pub queue_expirations: usize,
}

/// Observes bus lifecycle events, keeps running totals and logs failures.
///
/// Failure logs are throttled per event kind and event id so that a flapping
/// station does not flood the log ring.
#[derive(Default)]
pub struct EventListener {
    stats: Arc<EventStats>,
}

impl EventListener {
    /// Creates a new EventListener with zeroed counters.
    pub fn new() -> Self {
        Self {
            stats: Arc::new(EventStats::default()),
        }
    }

    /// Retrieves the current counters.
    pub fn stats(&self) -> ListenerStats {
        ListenerStats {
            connections_opened: self.stats.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.stats.connections_closed.load(Ordering::Relaxed),
            delivery_failures: self.stats.delivery_failures.load(Ordering::Relaxed),
            queue_expirations: self.stats.queue_expirations.load(Ordering::Relaxed),
        }
    }

    fn record(&self, event: &BusEvent) {
        let counter = match event {
            BusEvent::ConnectionOpened { .. } => &self.stats.connections_opened,
            BusEvent::ConnectionClosed { .. } => &self.stats.connections_closed,
            BusEvent::DeliveryFailed { .. } => &self.stats.delivery_failures,
            BusEvent::QueueExpired { .. } => &self.stats.queue_expirations,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Runs the event listener loop until `cancel_token` fires or the publisher is dropped.
///
/// # Arguments
/// * `publisher` - Source of bus lifecycle events
/// * `cancel_token` - Token for graceful shutdown coordination
/// * `listener` - Shared counters updated by the loop
/// * `log_throttle` - Minimum gap between two failure logs with the same key
pub async fn run_event_listener(
    publisher: Arc<Publisher>,
    cancel_token: CancellationToken,
    listener: Arc<EventListener>,
    log_throttle: Duration,
) {
    let mut receiver = publisher.subscribe();
    let mut last_logged: HashMap<String, Instant> = HashMap::new();

    info!("Event listener started");

    loop {
        select! {
            result = receiver.recv() => {
                match result {
                    Ok(event) => {
                        listener.record(&event);
                        match &event {
                            BusEvent::ConnectionOpened { connection_id, station, .. } => {
                                debug!(%connection_id, %station, "connection opened");
                            }
                            BusEvent::ConnectionClosed { connection_id, reason, .. } => {
                                debug!(%connection_id, reason = reason.as_str(), "connection closed");
                            }
                            BusEvent::DeliveryFailed { event_id, attempts, reason, .. } => {
                                if should_log(&mut last_logged, format!("failed:{event_id}"), log_throttle) {
                                    error!(event_id = event_id.as_str(), attempts, "delivery failed: {reason}");
                                }
                            }
                            BusEvent::QueueExpired { event_id, user_id, .. } => {
                                if should_log(&mut last_logged, format!("expired:{user_id}"), log_throttle) {
                                    warn!(event_id = event_id.as_str(), user_id = user_id.as_str(), "queued event expired");
                                }
                            }
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Event listener lagged, skipped {skipped} events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            _ = cancel_token.cancelled() => {
                info!("Event listener cancelled gracefully");
                break;
            }
        }
    }

    let stats = listener.stats();
    info!(
        "Event listener shutting down. {} opened, {} closed, {} failed deliveries, {} expired",
        stats.connections_opened,
        stats.connections_closed,
        stats.delivery_failures,
        stats.queue_expirations
    );
}

fn should_log(last_logged: &mut HashMap<String, Instant>, key: String, throttle: Duration) -> bool {
    let now = Instant::now();
    let due = last_logged
        .get(&key)
        .map_or(true, |&last| now.duration_since(last) > throttle);
    if due {
        last_logged.insert(key, now);
    }
    due
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::domain::connection::ConnectionId;

    #[tokio::test]
    async fn test_listener_counts_events_until_cancelled() {
        let publisher = Arc::new(Publisher::new(16));
        let listener = Arc::new(EventListener::new());
        let cancel_token = CancellationToken::new();

        let handle = tokio::spawn(run_event_listener(
            publisher.clone(),
            cancel_token.clone(),
            listener.clone(),
            Duration::from_secs(60),
        ));

        // Wait until the loop has subscribed.
        while publisher.sender.receiver_count() == 0 {
            tokio::task::yield_now().await;
        }

        publisher
            .publish(BusEvent::DeliveryFailed {
                event_id: "e1".into(),
                connection_id: Some(ConnectionId::new()),
                attempts: 4,
                reason: "ack timeout".into(),
            })
            .unwrap();
        publisher
            .publish(BusEvent::QueueExpired {
                event_id: "e2".into(),
                tenant_id: "t1".into(),
                user_id: "u1".into(),
            })
            .unwrap();

        while listener.stats().queue_expirations == 0 {
            tokio::task::yield_now().await;
        }
        cancel_token.cancel();
        handle.await.unwrap();

        let stats = listener.stats();
        assert_eq!(stats.delivery_failures, 1);
        assert_eq!(stats.queue_expirations, 1);
        assert_eq!(stats.connections_opened, 0);
    }

    #[test]
    fn test_failure_logs_are_throttled_per_key() {
        let mut last = HashMap::new();
        assert!(should_log(&mut last, "a".into(), Duration::from_secs(60)));
        assert!(!should_log(&mut last, "a".into(), Duration::from_secs(60)));
        assert!(should_log(&mut last, "b".into(), Duration::from_secs(60)));
    }
}
