use crate::core::domain::connection::ConnectionId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// Latency samples kept per connection.
const LATENCY_SAMPLES: usize = 100;

/// Counters for one live connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionMetrics {
    pub messages_sent: u64,
    pub messages_acknowledged: u64,
    pub errors: u64,
    pub latencies: VecDeque<u64>,
}

impl ConnectionMetrics {
    fn push_latency(&mut self, latency_ms: u64) {
        if self.latencies.len() == LATENCY_SAMPLES {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency_ms);
    }
}

/// Point-in-time view of the bus, appended to the history ring on a cadence.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub taken_at: DateTime<Utc>,
    pub active_connections: usize,
    pub messages_sent: u64,
    pub messages_acknowledged: u64,
    pub errors: u64,
    pub error_rate: f64,
    pub average_latency_ms: Option<f64>,
    pub rate_limited: u64,
    pub queued: u64,
    pub expired: u64,
    pub redelivered: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
struct Totals {
    sent: AtomicU64,
    acknowledged: AtomicU64,
    errors: AtomicU64,
    rate_limited: AtomicU64,
    queued: AtomicU64,
    expired: AtomicU64,
    redelivered: AtomicU64,
    failed: AtomicU64,
}

/// Delivery counters for the whole bus.
///
/// Per-connection counters live only while the connection is registered; the
/// process-wide totals survive disconnects so the error rate stays meaningful.
#[derive(Debug)]
pub struct DeliveryMetrics {
    connections: DashMap<ConnectionId, ConnectionMetrics>,
    totals: Totals,
    history: Mutex<VecDeque<MetricsSnapshot>>,
    history_depth: usize,
}

impl DeliveryMetrics {
    pub fn new(history_depth: usize) -> Self {
        Self {
            connections: DashMap::new(),
            totals: Totals::default(),
            history: Mutex::new(VecDeque::new()),
            history_depth: history_depth.max(1),
        }
    }

    pub fn track_connection(&self, connection_id: ConnectionId) {
        self.connections.entry(connection_id).or_default();
    }

    pub fn forget_connection(&self, connection_id: ConnectionId) -> Option<ConnectionMetrics> {
        self.connections.remove(&connection_id).map(|(_, m)| m)
    }

    pub fn record_sent(&self, connection_id: ConnectionId) {
        self.totals.sent.fetch_add(1, Ordering::Relaxed);
        if let Some(mut m) = self.connections.get_mut(&connection_id) {
            m.messages_sent += 1;
        }
    }

    pub fn record_ack(&self, connection_id: ConnectionId, latency_ms: Option<u64>) {
        self.totals.acknowledged.fetch_add(1, Ordering::Relaxed);
        if let Some(mut m) = self.connections.get_mut(&connection_id) {
            m.messages_acknowledged += 1;
            if let Some(latency) = latency_ms {
                m.push_latency(latency);
            }
        }
    }

    /// Heartbeat round trips count as latency samples without touching ack totals.
    pub fn record_latency(&self, connection_id: ConnectionId, latency_ms: u64) {
        if let Some(mut m) = self.connections.get_mut(&connection_id) {
            m.push_latency(latency_ms);
        }
    }

    pub fn record_error(&self, connection_id: Option<ConnectionId>) {
        self.totals.errors.fetch_add(1, Ordering::Relaxed);
        if let Some(mut m) = connection_id.and_then(|id| self.connections.get_mut(&id)) {
            m.errors += 1;
        }
    }

    pub fn record_rate_limited(&self) {
        self.totals.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queued(&self, count: usize) {
        self.totals.queued.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_expired(&self, count: usize) {
        self.totals.expired.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_redelivered(&self) {
        self.totals.redelivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.totals.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection(&self, connection_id: ConnectionId) -> Option<ConnectionMetrics> {
        self.connections.get(&connection_id).map(|m| m.clone())
    }

    /// Errors per sent message, 0.0 before anything was sent.
    pub fn error_rate(&self) -> f64 {
        let sent = self.totals.sent.load(Ordering::Relaxed);
        let errors = self.totals.errors.load(Ordering::Relaxed);
        if sent == 0 {
            if errors == 0 {
                0.0
            } else {
                1.0
            }
        } else {
            (errors as f64 / sent as f64).min(1.0)
        }
    }

    /// Mean over the latency samples of every live connection.
    pub fn average_latency_ms(&self) -> Option<f64> {
        let (sum, count) = self
            .connections
            .iter()
            .flat_map(|m| m.latencies.iter().copied().collect::<Vec<_>>())
            .fold((0u64, 0u64), |(sum, count), l| (sum + l, count + 1));
        (count > 0).then(|| sum as f64 / count as f64)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            taken_at: Utc::now(),
            active_connections: self.connections.len(),
            messages_sent: self.totals.sent.load(Ordering::Relaxed),
            messages_acknowledged: self.totals.acknowledged.load(Ordering::Relaxed),
            errors: self.totals.errors.load(Ordering::Relaxed),
            error_rate: self.error_rate(),
            average_latency_ms: self.average_latency_ms(),
            rate_limited: self.totals.rate_limited.load(Ordering::Relaxed),
            queued: self.totals.queued.load(Ordering::Relaxed),
            expired: self.totals.expired.load(Ordering::Relaxed),
            redelivered: self.totals.redelivered.load(Ordering::Relaxed),
            failed: self.totals.failed.load(Ordering::Relaxed),
        }
    }

    /// Takes a snapshot and appends it to the history ring, evicting the oldest.
    pub fn record_snapshot(&self) -> MetricsSnapshot {
        let snapshot = self.snapshot();
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        while history.len() >= self.history_depth {
            history.pop_front();
        }
        history.push_back(snapshot.clone());
        snapshot
    }

    /// Retained snapshots, oldest first.
    pub fn history(&self) -> Vec<MetricsSnapshot> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

impl Default for DeliveryMetrics {
    fn default() -> Self {
        Self::new(60)
    }
}
