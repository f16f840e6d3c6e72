use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of the client connection manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Coarse status exposed to the UI.
///
/// `Error` means the last attempt failed and another one is scheduled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Connecting,
    #[default]
    Disconnected,
    Error,
}

impl From<ConnectionState> for ConnectionStatus {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Connected => ConnectionStatus::Connected,
            ConnectionState::Connecting => ConnectionStatus::Connecting,
            ConnectionState::Reconnecting => ConnectionStatus::Error,
            ConnectionState::Disconnected => ConnectionStatus::Disconnected,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    #[default]
    Poor,
    Fair,
    Good,
    Excellent,
}

impl ConnectionQuality {
    pub fn from_score(score: u8) -> Self {
        match score {
            80.. => ConnectionQuality::Excellent,
            60..=79 => ConnectionQuality::Good,
            30..=59 => ConnectionQuality::Fair,
            _ => ConnectionQuality::Poor,
        }
    }
}

/// Derived, advisory view of the client's link. Never consulted for delivery.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionHealth {
    pub status: ConnectionStatus,
    pub quality: ConnectionQuality,
    pub score: u8,
    pub latency_ms: Option<u64>,
    pub last_ping_at: Option<DateTime<Utc>>,
    pub missed_pings: u32,
    pub reconnect_attempts: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_buckets() {
        assert_eq!(ConnectionQuality::from_score(100), ConnectionQuality::Excellent);
        assert_eq!(ConnectionQuality::from_score(80), ConnectionQuality::Excellent);
        assert_eq!(ConnectionQuality::from_score(79), ConnectionQuality::Good);
        assert_eq!(ConnectionQuality::from_score(30), ConnectionQuality::Fair);
        assert_eq!(ConnectionQuality::from_score(29), ConnectionQuality::Poor);
    }

    #[test]
    fn test_reconnecting_is_reported_as_error() {
        assert_eq!(
            ConnectionStatus::from(ConnectionState::Reconnecting),
            ConnectionStatus::Error
        );
    }
}
