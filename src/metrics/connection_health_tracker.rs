use crate::core::domain::health::{ConnectionHealth, ConnectionQuality, ConnectionStatus};
use crate::metrics::{HealthCheck, HealthChecker};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const MAX_SCORE: u8 = 100;

#[derive(Debug)]
struct HealthState {
    score: u8,
    status: ConnectionStatus,
    latency_ms: Option<u64>,
    last_ping_at: Option<DateTime<Utc>>,
    /// Send time of the ping still waiting for its pong.
    outstanding_ping: Option<i64>,
    missed_pings: u32,
    reconnect_attempts: u32,
}

/// Client-side stability scorer for the push connection.
///
/// The `ConnectionHealthTracker` keeps a 0..=100 score that climbs by `gain` on every
/// healthy tick while connected and drops by `penalty` whenever the connection is lost.
/// The score maps to a [`ConnectionQuality`] bucket. The result is advisory: it feeds
/// UI affordances and never gates delivery or the reconnect policy.
///
/// Clones share state, so the runtime and its background tick can hold one each.
#[derive(Debug, Clone)]
pub struct ConnectionHealthTracker {
    gain: u8,
    penalty: u8,
    /// Unanswered pings tolerated before the link is considered dead.
    max_missed_pings: u32,
    state: Arc<Mutex<HealthState>>,
}

impl HealthCheck for ConnectionHealthTracker {
    /// Checks if the connection is usable.
    ///
    /// # Returns
    ///
    /// * `true` if the connection is up and fewer than `max_missed_pings` pings are unanswered.
    /// * `false` otherwise.
    fn healthy(&self) -> bool {
        let state = self.lock();
        state.status == ConnectionStatus::Connected && state.missed_pings < self.max_missed_pings
    }
}

impl ConnectionHealthTracker {
    /// Creates a new `ConnectionHealthTracker` with a full score and a disconnected status.
    ///
    /// # Arguments
    ///
    /// * `gain` - Points added per healthy tick while connected.
    /// * `penalty` - Points removed when the connection is lost.
    /// * `max_missed_pings` - Unanswered pings tolerated before [`Self::link_dead`] reports true.
    #[must_use]
    pub fn new(gain: u8, penalty: u8, max_missed_pings: u32) -> Self {
        Self {
            gain,
            penalty,
            max_missed_pings: max_missed_pings.max(1),
            state: Arc::new(Mutex::new(HealthState {
                score: MAX_SCORE,
                status: ConnectionStatus::Disconnected,
                latency_ms: None,
                last_ping_at: None,
                outstanding_ping: None,
                missed_pings: 0,
                reconnect_attempts: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HealthState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn note_connecting(&self) {
        self.lock().status = ConnectionStatus::Connecting;
    }

    /// A stream was opened; resets the attempt counter and ping bookkeeping.
    pub fn note_connected(&self) {
        let mut state = self.lock();
        state.status = ConnectionStatus::Connected;
        state.reconnect_attempts = 0;
        state.missed_pings = 0;
        state.outstanding_ping = None;
    }

    /// An established stream dropped.
    pub fn note_connection_lost(&self) {
        let mut state = self.lock();
        state.score = state.score.saturating_sub(self.penalty);
        state.status = ConnectionStatus::Error;
        state.outstanding_ping = None;
    }

    /// A connection attempt failed; another one will be scheduled.
    pub fn note_attempt_failed(&self) {
        let mut state = self.lock();
        state.reconnect_attempts += 1;
        state.status = ConnectionStatus::Error;
    }

    /// Retries were given up on, or the runtime was shut down.
    pub fn note_disconnected(&self) {
        let mut state = self.lock();
        state.status = ConnectionStatus::Disconnected;
        state.outstanding_ping = None;
    }

    /// Periodic tick; only rewards a connected, responsive link.
    pub fn note_healthy_tick(&self) {
        let mut state = self.lock();
        if state.status == ConnectionStatus::Connected && state.missed_pings == 0 {
            state.score = state.score.saturating_add(self.gain).min(MAX_SCORE);
        }
    }

    /// Records an outgoing ping. A previous ping still unanswered counts as missed.
    ///
    /// # Returns
    ///
    /// The number of consecutive missed pings.
    pub fn note_ping_sent(&self, sent_at_ms: i64) -> u32 {
        let mut state = self.lock();
        if state.outstanding_ping.is_some() {
            state.missed_pings += 1;
        }
        state.outstanding_ping = Some(sent_at_ms);
        state.last_ping_at = Some(Utc::now());
        state.missed_pings
    }

    /// Records a pong echoing `sent_at_ms`; stale pongs are ignored.
    pub fn note_pong(&self, sent_at_ms: i64, now_ms: i64) -> Option<u64> {
        let mut state = self.lock();
        if state.outstanding_ping != Some(sent_at_ms) {
            return None;
        }
        let latency = u64::try_from(now_ms - sent_at_ms).unwrap_or(0);
        state.latency_ms = Some(latency);
        state.outstanding_ping = None;
        state.missed_pings = 0;
        Some(latency)
    }

    /// `true` once `max_missed_pings` consecutive pings went unanswered.
    pub fn link_dead(&self) -> bool {
        self.lock().missed_pings >= self.max_missed_pings
    }

    pub fn status(&self) -> ConnectionStatus {
        self.lock().status
    }

    pub fn score(&self) -> u8 {
        self.lock().score
    }

    pub fn snapshot(&self) -> ConnectionHealth {
        let state = self.lock();
        ConnectionHealth {
            status: state.status,
            quality: ConnectionQuality::from_score(state.score),
            score: state.score,
            latency_ms: state.latency_ms,
            last_ping_at: state.last_ping_at,
            missed_pings: state.missed_pings,
            reconnect_attempts: state.reconnect_attempts,
        }
    }

    /// Returns a boxed clone of this tracker as a `HealthChecker`.
    #[must_use]
    pub fn tracker(&self) -> HealthChecker {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_penalty_and_gain_move_quality() {
        let tracker = ConnectionHealthTracker::new(5, 30, 3);
        tracker.note_connected();
        assert_eq!(tracker.snapshot().quality, ConnectionQuality::Excellent);

        tracker.note_connection_lost();
        assert_eq!(tracker.score(), 70);
        assert_eq!(tracker.snapshot().quality, ConnectionQuality::Good);
        assert_eq!(tracker.status(), ConnectionStatus::Error);

        tracker.note_connection_lost();
        tracker.note_connection_lost();
        assert_eq!(tracker.score(), 10);
        assert_eq!(tracker.snapshot().quality, ConnectionQuality::Poor);

        // Ticks while disconnected do not help.
        tracker.note_healthy_tick();
        assert_eq!(tracker.score(), 10);

        tracker.note_connected();
        for _ in 0..5 {
            tracker.note_healthy_tick();
        }
        assert_eq!(tracker.score(), 35);
        assert_eq!(tracker.snapshot().quality, ConnectionQuality::Fair);
    }

    #[test]
    fn test_score_is_clamped() {
        let tracker = ConnectionHealthTracker::new(50, 200, 3);
        tracker.note_connected();
        tracker.note_healthy_tick();
        assert_eq!(tracker.score(), 100);
        tracker.note_connection_lost();
        assert_eq!(tracker.score(), 0);
    }

    #[test]
    fn test_ping_round_trip_and_missed_pings() {
        let tracker = ConnectionHealthTracker::new(5, 30, 2);
        tracker.note_connected();

        assert_eq!(tracker.note_ping_sent(1_000), 0);
        assert_eq!(tracker.note_pong(1_000, 1_042), Some(42));
        assert_eq!(tracker.snapshot().latency_ms, Some(42));
        assert!(tracker.healthy());

        tracker.note_ping_sent(2_000);
        assert_eq!(tracker.note_ping_sent(3_000), 1);
        assert!(!tracker.link_dead());
        assert_eq!(tracker.note_ping_sent(4_000), 2);
        assert!(tracker.link_dead());
        assert!(!tracker.healthy());

        // A late pong for an older ping is ignored.
        assert_eq!(tracker.note_pong(2_000, 4_100), None);
        assert_eq!(tracker.note_pong(4_000, 4_010), Some(10));
        assert!(tracker.healthy());
    }

    #[test]
    fn test_attempts_reset_on_connect() {
        let tracker = ConnectionHealthTracker::new(5, 30, 3);
        tracker.note_attempt_failed();
        tracker.note_attempt_failed();
        assert_eq!(tracker.snapshot().reconnect_attempts, 2);
        tracker.note_connected();
        assert_eq!(tracker.snapshot().reconnect_attempts, 0);
        tracker.note_disconnected();
        assert_eq!(tracker.status(), ConnectionStatus::Disconnected);
    }
}
