use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identifier of a single physical push stream.
///
/// A user holding the app open on two devices owns two connections with
/// distinct ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ConnectionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A role-scoped consumer class such as `CAMERIERE` (waiter) or `PREPARA` (kitchen).
///
/// Station names are compared case-insensitively; they are stored trimmed and
/// upper-cased.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Station(String);

impl Station {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().trim().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Station {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for Station {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<Station> for String {
    fn from(value: Station) -> Self {
        value.0
    }
}

impl fmt::Display for Station {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A live push connection together with the routing metadata the registry
/// indexes it by.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub connection_id: ConnectionId,
    pub user_id: String,
    pub tenant_id: String,
    pub station: Station,
    pub connected_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl Connection {
    /// Creates a connection record for a stream that has just been opened by an
    /// already authenticated identity.
    pub fn new(
        user_id: impl Into<String>,
        tenant_id: impl Into<String>,
        station: impl Into<Station>,
    ) -> Self {
        let now = Utc::now();
        Self {
            connection_id: ConnectionId::new(),
            user_id: user_id.into(),
            tenant_id: tenant_id.into(),
            station: station.into(),
            connected_at: now,
            last_seen_at: now,
        }
    }
}

/// Lookup filter for the connection registry. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionFilter {
    pub tenant_id: Option<String>,
    pub station: Option<Station>,
    pub connection_id: Option<ConnectionId>,
    pub user_id: Option<String>,
}

impl ConnectionFilter {
    pub fn tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn station(mut self, station: impl Into<Station>) -> Self {
        self.station = Some(station.into());
        self
    }

    pub fn connection(mut self, connection_id: ConnectionId) -> Self {
        self.connection_id = Some(connection_id);
        self
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn matches(&self, connection: &Connection) -> bool {
        self.tenant_id
            .as_ref()
            .map_or(true, |t| *t == connection.tenant_id)
            && self
                .station
                .as_ref()
                .map_or(true, |s| *s == connection.station)
            && self
                .connection_id
                .map_or(true, |id| id == connection.connection_id)
            && self
                .user_id
                .as_ref()
                .map_or(true, |u| *u == connection.user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_station_is_normalized() {
        assert_eq!(Station::new(" cameriere "), Station::from("CAMERIERE"));
        let json = serde_json::to_string(&Station::new("prepara")).unwrap();
        assert_eq!(json, "\"PREPARA\"");
        let parsed: Station = serde_json::from_str("\"cassa\"").unwrap();
        assert_eq!(parsed.as_str(), "CASSA");
    }

    #[test]
    fn test_filter_matches_on_every_set_field() {
        let conn = Connection::new("u1", "t1", "CAMERIERE");
        assert!(ConnectionFilter::default().matches(&conn));
        assert!(ConnectionFilter::default()
            .tenant("t1")
            .station("cameriere")
            .user("u1")
            .matches(&conn));
        assert!(!ConnectionFilter::default().tenant("t2").matches(&conn));
        assert!(!ConnectionFilter::default()
            .connection(ConnectionId::new())
            .matches(&conn));
    }

    #[test]
    fn test_connection_id_round_trips_through_display() {
        let id = ConnectionId::new();
        let parsed: ConnectionId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }
}
