use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Bucket key used when an emission carries no tenant.
pub const GLOBAL_TENANT: &str = "*";

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    last_used: Instant,
}

/// Token buckets per (event type, tenant).
///
/// Every pair gets its own `capacity`-sized bucket refilled continuously at
/// `refill_per_second`, so a burst of one event type never eats into the budget
/// of another. Buckets are created lazily on first use.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    refill_per_second: f64,
    buckets: DashMap<(String, String), TokenBucket>,
}

impl RateLimiter {
    pub fn new(capacity: u32, refill_per_second: f64) -> Self {
        Self {
            capacity: f64::from(capacity.max(1)),
            refill_per_second: refill_per_second.max(0.0),
            buckets: DashMap::new(),
        }
    }

    /// Takes one token from the bucket of (`event_type`, `tenant_id`).
    ///
    /// # Returns
    ///
    /// `true` if a token was available, `false` if the emission must be dropped.
    pub fn allow(&self, event_type: &str, tenant_id: Option<&str>) -> bool {
        let key = (
            event_type.to_string(),
            tenant_id.unwrap_or(GLOBAL_TENANT).to_string(),
        );
        let now = Instant::now();
        let mut bucket = self.buckets.entry(key).or_insert_with(|| TokenBucket {
            tokens: self.capacity,
            last_refill: now,
            last_used: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_second).min(self.capacity);
        bucket.last_refill = now;
        bucket.last_used = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drops buckets untouched for longer than `idle_for`; returns how many went.
    pub fn sweep_idle(&self, idle_for: Duration) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.duration_since(bucket.last_used) <= idle_for);
        before - self.buckets.len()
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
