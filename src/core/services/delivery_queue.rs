use crate::core::domain::delivery::{QueueKey, QueuedEvent};
use crate::core::domain::notification::NotificationPayload;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Upper bound on any queued event's lifetime, whatever the payload asks for.
pub const MAX_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// A queued event together with its monotonic expiry.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub event: QueuedEvent,
    deadline: Instant,
}

impl QueueEntry {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

/// Result of [`DeliveryQueue::enqueue`].
#[derive(Debug, Clone)]
pub struct Enqueued {
    pub event: QueuedEvent,
    /// The oldest entry, dropped because the user's queue was at its cap.
    pub evicted: Option<QueuedEvent>,
}

/// Result of [`DeliveryQueue::drain`].
#[derive(Debug, Default)]
pub struct Drained {
    /// Live entries in enqueue order.
    pub ready: Vec<QueueEntry>,
    pub expired: Vec<QueuedEvent>,
}

/// Per-(tenant, user) FIFO of events waiting for their user to come back.
///
/// Each entry carries an absolute TTL: the payload's `ttlSeconds` when present,
/// otherwise `default_ttl`. Expired entries are never handed out; they are
/// returned separately by `drain` and `sweep_expired` so the caller can report them.
#[derive(Debug)]
pub struct DeliveryQueue {
    default_ttl: Duration,
    max_per_user: usize,
    queues: DashMap<QueueKey, VecDeque<QueueEntry>>,
}

impl DeliveryQueue {
    pub fn new(default_ttl: Duration, max_per_user: usize) -> Self {
        Self {
            default_ttl,
            max_per_user: max_per_user.max(1),
            queues: DashMap::new(),
        }
    }

    fn ttl_for(&self, notification: &NotificationPayload) -> Duration {
        notification
            .ttl_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.default_ttl)
            .min(MAX_TTL)
    }

    /// Appends `notification` to the queue of `key`.
    pub fn enqueue(&self, key: &QueueKey, notification: NotificationPayload) -> Enqueued {
        let ttl = self.ttl_for(&notification);
        let now = Instant::now();
        let entry = QueueEntry {
            event: QueuedEvent::new(notification, ttl),
            deadline: now.checked_add(ttl).unwrap_or(now + MAX_TTL),
        };
        let event = entry.event.clone();

        let mut queue = self.queues.entry(key.clone()).or_default();
        let evicted = if queue.len() >= self.max_per_user {
            queue.pop_front().map(|old| {
                warn!(
                    tenant_id = key.tenant_id.as_str(),
                    user_id = key.user_id.as_str(),
                    event_id = old.event.notification.id.as_str(),
                    "delivery queue full, evicting oldest entry"
                );
                old.event
            })
        } else {
            None
        };
        queue.push_back(entry);

        Enqueued { event, evicted }
    }

    /// Takes every entry queued for `key`, oldest first.
    ///
    /// Live entries have their `attempts` incremented. Expired ones are logged at
    /// info level and returned in `expired`.
    pub fn drain(&self, key: &QueueKey) -> Drained {
        let Some((_, queue)) = self.queues.remove(key) else {
            return Drained::default();
        };
        let now = Instant::now();
        let mut drained = Drained::default();
        for mut entry in queue {
            if entry.is_expired(now) {
                info!(
                    event_id = entry.event.notification.id.as_str(),
                    user_id = key.user_id.as_str(),
                    "queued event expired before delivery"
                );
                drained.expired.push(entry.event);
            } else {
                entry.event.attempts += 1;
                drained.ready.push(entry);
            }
        }
        drained
    }

    /// Puts entries back at the head of the queue, ahead of anything enqueued meanwhile.
    ///
    /// When the queue grew past its cap in the meantime, the newest entries are
    /// dropped and returned so the caller can report them.
    pub fn requeue_front(&self, key: &QueueKey, entries: Vec<QueueEntry>) -> Vec<QueuedEvent> {
        if entries.is_empty() {
            return Vec::new();
        }
        let mut queue = self.queues.entry(key.clone()).or_default();
        for entry in entries.into_iter().rev() {
            queue.push_front(entry);
        }
        let mut overflow = Vec::new();
        while queue.len() > self.max_per_user {
            if let Some(dropped) = queue.pop_back() {
                warn!(
                    tenant_id = key.tenant_id.as_str(),
                    user_id = key.user_id.as_str(),
                    event_id = dropped.event.notification.id.as_str(),
                    "delivery queue over its cap after requeue, dropping newest entry"
                );
                overflow.push(dropped.event);
            }
        }
        overflow
    }

    /// Removes expired entries from every queue.
    pub fn sweep_expired(&self) -> Vec<(QueueKey, QueuedEvent)> {
        let now = Instant::now();
        let mut expired = Vec::new();
        for mut queue in self.queues.iter_mut() {
            let key = queue.key().clone();
            let mut kept = VecDeque::with_capacity(queue.len());
            for entry in queue.drain(..) {
                if entry.is_expired(now) {
                    expired.push((key.clone(), entry.event));
                } else {
                    kept.push_back(entry);
                }
            }
            *queue = kept;
        }
        self.queues.retain(|_, queue| !queue.is_empty());

        for (key, event) in &expired {
            info!(
                event_id = event.notification.id.as_str(),
                user_id = key.user_id.as_str(),
                "queued event expired"
            );
        }
        expired
    }

    pub fn backlog(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }

    pub fn backlog_for(&self, key: &QueueKey) -> usize {
        self.queues.get(key).map_or(0, |q| q.len())
    }

    /// Keys that currently hold at least one entry.
    pub fn keys(&self) -> Vec<QueueKey> {
        self.queues.iter().map(|q| q.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(event_type: &str) -> NotificationPayload {
        NotificationPayload::new(event_type, json!({}))
    }

    fn types(entries: &[QueueEntry]) -> Vec<String> {
        entries
            .iter()
            .map(|e| e.event.notification.event_type.clone())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_preserves_enqueue_order() {
        let queue = DeliveryQueue::new(Duration::from_secs(60), 10);
        let key = QueueKey::new("t1", "u1");
        queue.enqueue(&key, payload("order:new"));
        queue.enqueue(&key, payload("order:ready"));

        tokio::time::advance(Duration::from_secs(5)).await;
        let drained = queue.drain(&key);
        assert_eq!(types(&drained.ready), vec!["order:new", "order:ready"]);
        assert!(drained.expired.is_empty());
        assert_eq!(drained.ready[0].event.attempts, 1);
        assert_eq!(queue.backlog_for(&key), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_are_never_handed_out() {
        let queue = DeliveryQueue::new(Duration::from_secs(60), 10);
        let key = QueueKey::new("t1", "u1");
        let mut short = payload("order:item_ready");
        short.ttl_seconds = Some(5);
        queue.enqueue(&key, short);
        queue.enqueue(&key, payload("order:ready"));

        tokio::time::advance(Duration::from_secs(10)).await;
        let drained = queue.drain(&key);
        assert_eq!(types(&drained.ready), vec!["order:ready"]);
        assert_eq!(drained.expired.len(), 1);
        assert_eq!(drained.expired[0].notification.event_type, "order:item_ready");
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_leaves_zero_backlog() {
        let queue = DeliveryQueue::new(Duration::from_secs(60), 10);
        queue.enqueue(&QueueKey::new("t1", "u1"), payload("order:new"));
        queue.enqueue(&QueueKey::new("t1", "u2"), payload("order:new"));
        assert_eq!(queue.backlog(), 2);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(queue.sweep_expired().len(), 2);
        assert_eq!(queue.backlog(), 0);
        assert!(queue.keys().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cap_evicts_oldest() {
        let queue = DeliveryQueue::new(Duration::from_secs(60), 2);
        let key = QueueKey::new("t1", "u1");
        queue.enqueue(&key, payload("a"));
        queue.enqueue(&key, payload("b"));
        let third = queue.enqueue(&key, payload("c"));

        assert_eq!(third.evicted.unwrap().notification.event_type, "a");
        assert_eq!(types(&queue.drain(&key).ready), vec!["b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_front_goes_ahead_of_newer_entries() {
        let queue = DeliveryQueue::new(Duration::from_secs(60), 10);
        let key = QueueKey::new("t1", "u1");
        queue.enqueue(&key, payload("a"));
        queue.enqueue(&key, payload("b"));
        let drained = queue.drain(&key);

        queue.enqueue(&key, payload("c"));
        assert!(queue.requeue_front(&key, drained.ready).is_empty());
        assert_eq!(types(&queue.drain(&key).ready), vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_over_cap_returns_dropped_entries() {
        let queue = DeliveryQueue::new(Duration::from_secs(60), 2);
        let key = QueueKey::new("t1", "u1");
        queue.enqueue(&key, payload("a"));
        queue.enqueue(&key, payload("b"));
        let drained = queue.drain(&key);

        queue.enqueue(&key, payload("c"));
        let dropped = queue.requeue_front(&key, drained.ready);
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].notification.event_type, "c");
        assert_eq!(types(&queue.drain(&key).ready), vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_ttl_is_capped() {
        let queue = DeliveryQueue::new(Duration::from_secs(60), 10);
        let key = QueueKey::new("t1", "u1");
        let mut forever = payload("order:new");
        forever.ttl_seconds = Some(u64::MAX);
        let enqueued = queue.enqueue(&key, forever);
        assert!(enqueued.event.expires_at.is_some());

        tokio::time::advance(MAX_TTL - Duration::from_secs(1)).await;
        assert_eq!(queue.backlog_for(&key), 1);
        assert!(queue.sweep_expired().is_empty());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(queue.sweep_expired().len(), 1);
    }
}
