use crate::core::domain::connection::ConnectionId;
use crate::core::domain::delivery::{AckStatus, DeliveryOutcome, EventAcknowledgment, QueueKey};
use crate::core::domain::notification::NotificationPayload;
use dashmap::DashMap;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

const ACK_TIMEOUT_REASON: &str = "acknowledgment timed out";

type PendingKey = (String, ConnectionId);

#[derive(Debug)]
struct Pending {
    notification: NotificationPayload,
    owner: QueueKey,
    delivered_at: Instant,
    deadline: Instant,
    redeliveries: u32,
    last_error: Option<String>,
}

/// Bookkeeping shared by every delivery of one event id.
#[derive(Debug, Default)]
struct Group {
    waiter: Option<oneshot::Sender<DeliveryOutcome>>,
    /// Tracked deliveries plus queued copies still waiting for a connection.
    outstanding: usize,
    processed: usize,
    attempts: u32,
    reason: Option<String>,
}

/// What an inbound acknowledgment did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum AckOutcome {
    /// `processed`: the delivery is retired.
    Retired { latency_ms: u64 },
    /// `failed`: the delivery is due for redelivery on the next pass.
    Retry,
    /// `received`: noted, the timer keeps running.
    Noted,
    /// Nothing is pending for this event on this connection.
    Unknown,
}

/// A delivery whose acknowledgment timed out and that should be sent again.
#[derive(Debug, Clone)]
pub struct Redelivery {
    pub notification: NotificationPayload,
    pub connection_id: ConnectionId,
    pub owner: QueueKey,
    pub redelivery: u32,
}

/// A delivery that exhausted its redeliveries. Reported exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedDelivery {
    pub event_id: String,
    pub connection_id: ConnectionId,
    pub owner: QueueKey,
    pub attempts: u32,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct DueDeliveries {
    pub redeliver: Vec<Redelivery>,
    pub failed: Vec<FailedDelivery>,
}

/// Correlates acknowledgments with deliveries of `acknowledgmentRequired` events.
///
/// A timer starts for every (event, connection) pair when the frame is written.
/// Without a `processed` acknowledgment before the timer fires, the delivery is
/// handed back for redelivery, at most `max_retries` times; after that it is
/// reported as failed once and forgotten.
///
/// An emitter may [`watch`](Self::watch) an event id to learn its final
/// [`DeliveryOutcome`]: `Delivered` as soon as one target processed it, `Failed`
/// once every delivery and queued copy has failed or expired.
#[derive(Debug)]
pub struct AckTracker {
    timeout: Duration,
    max_retries: u32,
    pending: DashMap<PendingKey, Pending>,
    groups: DashMap<String, Group>,
}

impl AckTracker {
    pub fn new(timeout: Duration, max_retries: u32) -> Self {
        Self {
            timeout,
            max_retries,
            pending: DashMap::new(),
            groups: DashMap::new(),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Registers interest in the final outcome of `event_id`.
    pub fn watch(&self, event_id: &str) -> oneshot::Receiver<DeliveryOutcome> {
        let (sender, receiver) = oneshot::channel();
        self.groups.entry(event_id.to_string()).or_default().waiter = Some(sender);
        receiver
    }

    /// Drops a watch for an event that was never delivered nor queued.
    pub fn forget(&self, event_id: &str) {
        self.groups.remove_if(event_id, |_, group| group.outstanding == 0);
    }

    /// Starts the acknowledgment timer for a frame just written to `connection_id`.
    ///
    /// A repeated delivery of the same event to the same connection restarts the
    /// timer without counting as a new outstanding delivery.
    pub fn track(&self, notification: &NotificationPayload, connection_id: ConnectionId, owner: QueueKey) {
        let now = Instant::now();
        let key = (notification.id.clone(), connection_id);
        let fresh = !self.pending.contains_key(&key);
        self.pending
            .entry(key)
            .and_modify(|p| {
                p.delivered_at = now;
                p.deadline = now + self.timeout;
            })
            .or_insert_with(|| Pending {
                notification: notification.clone(),
                owner,
                delivered_at: now,
                deadline: now + self.timeout,
                redeliveries: 0,
                last_error: None,
            });
        if fresh {
            self.groups
                .entry(notification.id.clone())
                .or_default()
                .outstanding += 1;
        }
    }

    /// Counts a queued copy of `event_id` as outstanding until it is delivered or lost.
    pub fn hold(&self, event_id: &str) {
        self.groups.entry(event_id.to_string()).or_default().outstanding += 1;
    }

    /// A held copy was written to a connection; its timer starts now.
    pub fn track_held(&self, notification: &NotificationPayload, connection_id: ConnectionId, owner: QueueKey) {
        self.release_hold(&notification.id, None);
        self.track(notification, connection_id, owner);
    }

    /// A held copy was lost (TTL expiry or eviction). With a `reason` the loss
    /// counts as a failure of the event.
    pub fn release_hold(&self, event_id: &str, reason: Option<&str>) {
        self.settle(event_id, |group| {
            group.outstanding = group.outstanding.saturating_sub(1);
            if let Some(reason) = reason {
                group.reason = Some(reason.to_string());
                group.attempts = group.attempts.max(1);
            }
        });
    }

    /// Moves a timed-out delivery from a dead connection into the user's queue.
    /// The event stays outstanding as a held copy.
    pub fn park(&self, event_id: &str, connection_id: ConnectionId) -> bool {
        self.pending
            .remove(&(event_id.to_string(), connection_id))
            .is_some()
    }

    /// Re-keys a pending delivery after it was redelivered to another connection
    /// of the same user.
    pub fn retarget(&self, event_id: &str, from: ConnectionId, to: ConnectionId) {
        if from == to {
            return;
        }
        let Some((_, mut pending)) = self.pending.remove(&(event_id.to_string(), from)) else {
            return;
        };
        let now = Instant::now();
        pending.delivered_at = now;
        pending.deadline = now + self.timeout;
        let key = (event_id.to_string(), to);
        if self.pending.contains_key(&key) {
            // Already pending there; the moved copy collapses into it.
            self.settle(event_id, |group| {
                group.outstanding = group.outstanding.saturating_sub(1);
            });
        } else {
            self.pending.insert(key, pending);
        }
    }

    /// Applies an inbound acknowledgment.
    pub fn acknowledge(&self, ack: &EventAcknowledgment) -> AckOutcome {
        let key = (ack.event_id.clone(), ack.connection_id);
        match ack.status {
            AckStatus::Received => {
                if self.pending.contains_key(&key) {
                    AckOutcome::Noted
                } else {
                    AckOutcome::Unknown
                }
            }
            AckStatus::Failed => match self.pending.get_mut(&key) {
                Some(mut pending) => {
                    pending.deadline = Instant::now();
                    pending.last_error = Some(
                        ack.error
                            .clone()
                            .unwrap_or_else(|| "client reported failure".to_string()),
                    );
                    AckOutcome::Retry
                }
                None => AckOutcome::Unknown,
            },
            AckStatus::Processed => {
                let Some((_, pending)) = self.pending.remove(&key) else {
                    return AckOutcome::Unknown;
                };
                let latency_ms =
                    u64::try_from(Instant::now().duration_since(pending.delivered_at).as_millis())
                        .unwrap_or(u64::MAX);
                self.settle(&ack.event_id, |group| {
                    group.outstanding = group.outstanding.saturating_sub(1);
                    group.processed += 1;
                });
                AckOutcome::Retired { latency_ms }
            }
        }
    }

    /// Makes every delivery on a closed connection due on the next pass.
    pub fn release_connection(&self, connection_id: ConnectionId) -> usize {
        let now = Instant::now();
        let mut released = 0;
        for mut pending in self.pending.iter_mut() {
            if pending.key().1 == connection_id {
                pending.deadline = now;
                released += 1;
            }
        }
        released
    }

    /// Collects deliveries whose timer fired.
    ///
    /// Each one is either handed back for redelivery with a fresh timer, or, once
    /// `max_retries` redeliveries happened, removed and reported as failed.
    pub fn take_due(&self) -> DueDeliveries {
        let now = Instant::now();
        let due: Vec<PendingKey> = self
            .pending
            .iter()
            .filter(|p| p.deadline <= now)
            .map(|p| p.key().clone())
            .collect();

        let mut result = DueDeliveries::default();
        for key in due {
            let exhausted = match self.pending.get_mut(&key) {
                Some(mut pending) => {
                    if pending.redeliveries < self.max_retries {
                        pending.redeliveries += 1;
                        pending.delivered_at = now;
                        pending.deadline = now + self.timeout;
                        debug!(
                            event_id = key.0.as_str(),
                            connection_id = %key.1,
                            redelivery = pending.redeliveries,
                            "acknowledgment overdue, redelivering"
                        );
                        result.redeliver.push(Redelivery {
                            notification: pending.notification.clone(),
                            connection_id: key.1,
                            owner: pending.owner.clone(),
                            redelivery: pending.redeliveries,
                        });
                        false
                    } else {
                        true
                    }
                }
                None => false,
            };

            if exhausted {
                if let Some((_, pending)) = self.pending.remove(&key) {
                    let attempts = pending.redeliveries + 1;
                    let reason = pending
                        .last_error
                        .unwrap_or_else(|| ACK_TIMEOUT_REASON.to_string());
                    warn!(
                        event_id = key.0.as_str(),
                        connection_id = %key.1,
                        attempts,
                        "delivery failed: {reason}"
                    );
                    self.settle(&key.0, |group| {
                        group.outstanding = group.outstanding.saturating_sub(1);
                        group.attempts = group.attempts.max(attempts);
                        group.reason = Some(reason.clone());
                    });
                    result.failed.push(FailedDelivery {
                        event_id: key.0,
                        connection_id: key.1,
                        owner: pending.owner,
                        attempts,
                        reason,
                    });
                }
            }
        }
        result
    }

    /// Updates the group of `event_id` and resolves its waiter when the outcome is known.
    fn settle(&self, event_id: &str, update: impl FnOnce(&mut Group)) {
        let finished = {
            let Some(mut group) = self.groups.get_mut(event_id) else {
                return;
            };
            update(group.value_mut());

            if group.processed > 0 {
                if let Some(waiter) = group.waiter.take() {
                    let _ = waiter.send(DeliveryOutcome::Delivered {
                        event_id: event_id.to_string(),
                        acknowledged_by: group.processed,
                    });
                }
            } else if group.outstanding == 0 {
                if let Some(waiter) = group.waiter.take() {
                    let _ = waiter.send(DeliveryOutcome::Failed {
                        event_id: event_id.to_string(),
                        attempts: group.attempts,
                        reason: group
                            .reason
                            .clone()
                            .unwrap_or_else(|| ACK_TIMEOUT_REASON.to_string()),
                    });
                }
            }
            group.outstanding == 0
        };
        if finished {
            self.groups.remove_if(event_id, |_, group| group.outstanding == 0);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, event_id: &str, connection_id: ConnectionId) -> bool {
        self.pending
            .contains_key(&(event_id.to_string(), connection_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn required(event_type: &str) -> NotificationPayload {
        let mut payload = NotificationPayload::new(event_type, json!({}));
        payload.acknowledgment_required = true;
        payload
    }

    fn owner() -> QueueKey {
        QueueKey::new("t1", "u1")
    }

    #[tokio::test(start_paused = true)]
    async fn test_processed_ack_retires_and_resolves_waiter() {
        let tracker = AckTracker::new(Duration::from_secs(5), 3);
        let payload = required("payment:requested");
        let connection = ConnectionId::new();
        let outcome = tracker.watch(&payload.id);
        tracker.track(&payload, connection, owner());

        tokio::time::advance(Duration::from_millis(120)).await;
        let result = tracker.acknowledge(&EventAcknowledgment::new(
            payload.id.clone(),
            connection,
            AckStatus::Processed,
        ));
        assert_eq!(result, AckOutcome::Retired { latency_ms: 120 });
        assert_eq!(tracker.pending_count(), 0);
        assert_eq!(
            outcome.await.unwrap(),
            DeliveryOutcome::Delivered {
                event_id: payload.id.clone(),
                acknowledged_by: 1
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exactly_max_then_fails_once() {
        let tracker = AckTracker::new(Duration::from_secs(5), 3);
        let payload = required("order:ready");
        let connection = ConnectionId::new();
        let outcome = tracker.watch(&payload.id);
        tracker.track(&payload, connection, owner());

        let mut redeliveries = 0;
        let mut failures = Vec::new();
        for _ in 0..10 {
            tokio::time::advance(Duration::from_secs(6)).await;
            let due = tracker.take_due();
            redeliveries += due.redeliver.len();
            failures.extend(due.failed);
        }

        assert_eq!(redeliveries, 3);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].attempts, 4);
        assert_eq!(tracker.pending_count(), 0);
        assert!(matches!(
            outcome.await.unwrap(),
            DeliveryOutcome::Failed { attempts: 4, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_ack_is_due_immediately() {
        let tracker = AckTracker::new(Duration::from_secs(30), 1);
        let payload = required("order:new");
        let connection = ConnectionId::new();
        tracker.track(&payload, connection, owner());

        assert!(tracker.take_due().redeliver.is_empty());
        let ack = EventAcknowledgment::failed(payload.id.clone(), connection, "printer jam");
        assert_eq!(tracker.acknowledge(&ack), AckOutcome::Retry);
        assert_eq!(tracker.take_due().redeliver.len(), 1);

        tracker.acknowledge(&ack);
        let due = tracker.take_due();
        assert_eq!(due.failed.len(), 1);
        assert_eq!(due.failed[0].reason, "printer jam");
    }

    #[test]
    fn test_waiter_stays_pending_until_processed() {
        let tracker = AckTracker::new(Duration::from_secs(30), 2);
        let payload = required("order:ready");
        let connection = ConnectionId::new();
        let mut waiter = tokio_test::task::spawn(tracker.watch(&payload.id));
        tracker.track(&payload, connection, owner());

        tracker.acknowledge(&EventAcknowledgment::new(
            payload.id.clone(),
            connection,
            AckStatus::Received,
        ));
        tokio_test::assert_pending!(waiter.poll());

        tracker.acknowledge(&EventAcknowledgment::new(
            payload.id.clone(),
            connection,
            AckStatus::Processed,
        ));
        assert!(waiter.is_woken());
        let outcome = tokio_test::assert_ready_ok!(waiter.poll());
        assert!(matches!(outcome, DeliveryOutcome::Delivered { acknowledged_by: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_received_only_notes() {
        let tracker = AckTracker::new(Duration::from_secs(5), 0);
        let payload = required("order:new");
        let connection = ConnectionId::new();
        tracker.track(&payload, connection, owner());

        let received = EventAcknowledgment::new(payload.id.clone(), connection, AckStatus::Received);
        assert_eq!(tracker.acknowledge(&received), AckOutcome::Noted);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(tracker.take_due().failed.len(), 1);

        assert_eq!(tracker.acknowledge(&received), AckOutcome::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_sees_delivered_when_any_target_processes() {
        let tracker = AckTracker::new(Duration::from_secs(5), 0);
        let payload = required("table:state_changed");
        let (a, b) = (ConnectionId::new(), ConnectionId::new());
        let outcome = tracker.watch(&payload.id);
        tracker.track(&payload, a, owner());
        tracker.track(&payload, b, QueueKey::new("t1", "u2"));

        tracker.acknowledge(&EventAcknowledgment::new(payload.id.clone(), b, AckStatus::Processed));
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(tracker.take_due().failed.len(), 1);

        assert!(matches!(outcome.await.unwrap(), DeliveryOutcome::Delivered { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_hold_fails_the_event() {
        let tracker = AckTracker::new(Duration::from_secs(5), 3);
        let payload = required("order:ready");
        let outcome = tracker.watch(&payload.id);
        tracker.hold(&payload.id);
        tracker.release_hold(&payload.id, Some("queued event expired"));

        assert_eq!(
            outcome.await.unwrap(),
            DeliveryOutcome::Failed {
                event_id: payload.id.clone(),
                attempts: 1,
                reason: "queued event expired".into()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_connection_makes_entries_due() {
        let tracker = AckTracker::new(Duration::from_secs(60), 2);
        let payload = required("order:ready");
        let (a, b) = (ConnectionId::new(), ConnectionId::new());
        tracker.track(&payload, a, owner());

        assert_eq!(tracker.release_connection(a), 1);
        let due = tracker.take_due();
        assert_eq!(due.redeliver.len(), 1);
        assert_eq!(due.redeliver[0].connection_id, a);

        tracker.retarget(&payload.id, a, b);
        assert!(tracker.is_pending(&payload.id, b));
        assert!(!tracker.is_pending(&payload.id, a));
    }
}
