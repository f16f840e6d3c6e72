use crate::core::domain::notification::NotificationPayload;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Drops repeated deliveries seen within a sliding window.
///
/// Two checks apply: the payload `id`, and a business key
/// `type|entityId|status|timestamp` that catches the same change re-emitted
/// under a fresh id. Payloads without an entity id skip the business key.
#[derive(Debug)]
pub struct DedupFilter {
    window: Duration,
    enabled: bool,
    seen_ids: HashMap<String, Instant>,
    seen_keys: HashMap<String, Instant>,
}

impl DedupFilter {
    pub fn new(window: Duration, enabled: bool) -> Self {
        Self {
            window,
            enabled,
            seen_ids: HashMap::new(),
            seen_keys: HashMap::new(),
        }
    }

    /// The business key of `payload`, or `None` when it names no entity.
    pub fn key_of(payload: &NotificationPayload) -> Option<String> {
        let entity_id = payload.entity_id()?;
        Some(format!(
            "{}|{}|{}|{}",
            payload.event_type,
            entity_id,
            payload.state_marker().unwrap_or_default(),
            payload.timestamp.timestamp_millis()
        ))
    }

    /// Returns `true` if `payload` should reach subscribers, recording it.
    pub fn admit(&mut self, payload: &NotificationPayload) -> bool {
        if !self.enabled {
            return true;
        }
        let now = Instant::now();
        let window = self.window;
        let fresh = |seen: Option<&Instant>| seen.map_or(true, |at| now.duration_since(*at) > window);

        let key = Self::key_of(payload);
        if !fresh(self.seen_ids.get(&payload.id)) {
            return false;
        }
        if let Some(key) = &key {
            if !fresh(self.seen_keys.get(key)) {
                return false;
            }
        }

        self.seen_ids.insert(payload.id.clone(), now);
        if let Some(key) = key {
            self.seen_keys.insert(key, now);
        }
        true
    }

    /// Purges entries older than twice the window.
    ///
    /// # Returns
    ///
    /// The number of entries removed.
    pub fn sweep(&mut self) -> usize {
        let now = Instant::now();
        let horizon = self.window * 2;
        let before = self.len();
        self.seen_ids.retain(|_, at| now.duration_since(*at) <= horizon);
        self.seen_keys.retain(|_, at| now.duration_since(*at) <= horizon);
        before - self.len()
    }

    pub fn clear(&mut self) {
        self.seen_ids.clear();
        self.seen_keys.clear();
    }

    pub fn len(&self) -> usize {
        self.seen_ids.len() + self.seen_keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
