use crate::core::domain::connection::{Connection, ConnectionFilter, ConnectionId, Station};
use crate::core::domain::delivery::QueueKey;
use crate::core::ports::sink::PushSink;
use chrono::Utc;
use dashmap::DashMap;
use itertools::Itertools;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// A registered connection paired with its writer, as handed to the router.
#[derive(Clone)]
pub struct Target {
    pub connection: Connection,
    pub sink: Arc<dyn PushSink>,
}

struct Entry {
    connection: Connection,
    sink: Arc<dyn PushSink>,
    last_seen: Instant,
}

/// A user whose last connection closed recently, remembered so that targeted
/// events can still be queued for them until they come back.
#[derive(Debug, Clone)]
struct Departed {
    station: Station,
    departed_at: Instant,
}

/// The single source of truth for which stations are reachable right now.
///
/// Connections are kept in a sharded map and indexed by tenant, by
/// (tenant, station) and by (tenant, user), so that fan-out reads touch only the
/// matching ids instead of scanning every connection. Index sets are cloned out
/// before connection entries are looked up; no two shard guards are held at once.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Entry>,
    by_tenant: DashMap<String, HashSet<ConnectionId>>,
    by_station: DashMap<(String, Station), HashSet<ConnectionId>>,
    by_user: DashMap<QueueKey, HashSet<ConnectionId>>,
    departed: DashMap<QueueKey, Departed>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an opened stream and returns its id.
    pub fn register(&self, connection: Connection, sink: Arc<dyn PushSink>) -> ConnectionId {
        let id = connection.connection_id;
        let tenant = connection.tenant_id.clone();
        let user_key = QueueKey::from(&connection);

        self.by_tenant.entry(tenant.clone()).or_default().insert(id);
        self.by_station
            .entry((tenant, connection.station.clone()))
            .or_default()
            .insert(id);
        self.by_user.entry(user_key.clone()).or_default().insert(id);
        self.departed.remove(&user_key);

        self.connections.insert(
            id,
            Entry {
                connection,
                sink,
                last_seen: Instant::now(),
            },
        );
        id
    }

    /// Removes a connection and returns its record, if it was still registered.
    pub fn unregister(&self, connection_id: ConnectionId) -> Option<Connection> {
        let (_, entry) = self.connections.remove(&connection_id)?;
        let connection = entry.connection;
        let user_key = QueueKey::from(&connection);

        remove_from_index(&self.by_tenant, &connection.tenant_id, connection_id);
        remove_from_index(
            &self.by_station,
            &(connection.tenant_id.clone(), connection.station.clone()),
            connection_id,
        );
        let user_gone = remove_from_index(&self.by_user, &user_key, connection_id);
        if user_gone {
            self.departed.insert(
                user_key,
                Departed {
                    station: connection.station.clone(),
                    departed_at: Instant::now(),
                },
            );
        }
        Some(connection)
    }

    /// Records a heartbeat. Returns `false` if the connection is unknown.
    pub fn touch(&self, connection_id: ConnectionId) -> bool {
        match self.connections.get_mut(&connection_id) {
            Some(mut entry) => {
                entry.last_seen = Instant::now();
                entry.connection.last_seen_at = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Unregisters every connection that has not been seen for `timeout`.
    pub fn sweep_stale(&self, timeout: Duration) -> Vec<Connection> {
        let now = Instant::now();
        let stale: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|entry| now.duration_since(entry.last_seen) > timeout)
            .map(|entry| *entry.key())
            .collect();

        stale
            .into_iter()
            .filter_map(|id| {
                debug!(connection_id = %id, "liveness timeout");
                self.unregister(id)
            })
            .collect()
    }

    /// Forgets departed users older than `retention`.
    pub fn prune_departed(&self, retention: Duration) -> usize {
        let now = Instant::now();
        let before = self.departed.len();
        self.departed
            .retain(|_, d| now.duration_since(d.departed_at) <= retention);
        before - self.departed.len()
    }

    pub fn get(&self, connection_id: ConnectionId) -> Option<Connection> {
        self.connections
            .get(&connection_id)
            .map(|entry| entry.connection.clone())
    }

    pub fn sink(&self, connection_id: ConnectionId) -> Option<Arc<dyn PushSink>> {
        self.connections
            .get(&connection_id)
            .map(|entry| entry.sink.clone())
    }

    pub fn find(&self, filter: &ConnectionFilter) -> Vec<Connection> {
        self.targets(filter)
            .into_iter()
            .map(|target| target.connection)
            .collect()
    }

    /// Resolves a filter to live connections and their writers, using the most
    /// selective index the filter allows.
    pub fn targets(&self, filter: &ConnectionFilter) -> Vec<Target> {
        let candidates: Vec<ConnectionId> = if let Some(id) = filter.connection_id {
            vec![id]
        } else {
            match (&filter.tenant_id, &filter.user_id, &filter.station) {
                (Some(tenant), Some(user), _) => {
                    index_ids(&self.by_user, &QueueKey::new(tenant.clone(), user.clone()))
                }
                (Some(tenant), None, Some(station)) => {
                    index_ids(&self.by_station, &(tenant.clone(), station.clone()))
                }
                (Some(tenant), None, None) => index_ids(&self.by_tenant, tenant),
                (None, _, _) => self.connections.iter().map(|e| *e.key()).collect(),
            }
        };

        candidates
            .into_iter()
            .filter_map(|id| {
                let entry = self.connections.get(&id)?;
                filter.matches(&entry.connection).then(|| Target {
                    connection: entry.connection.clone(),
                    sink: entry.sink.clone(),
                })
            })
            .sorted_by_key(|t| t.connection.connected_at)
            .collect()
    }

    /// Live targets whose station is one of `stations`, optionally within a tenant.
    pub fn targets_for_stations(&self, tenant_id: Option<&str>, stations: &[Station]) -> Vec<Target> {
        stations
            .iter()
            .unique()
            .flat_map(|station| {
                let mut filter = ConnectionFilter::default().station(station.clone());
                filter.tenant_id = tenant_id.map(str::to_string);
                self.targets(&filter)
            })
            .collect()
    }

    /// Users that left recently, have no live connection, and match the tenant
    /// and (when given) one of the stations.
    pub fn departed_users(&self, tenant_id: Option<&str>, stations: &[Station]) -> Vec<QueueKey> {
        self.departed
            .iter()
            .filter(|entry| tenant_id.map_or(true, |t| entry.key().tenant_id == t))
            .filter(|entry| stations.is_empty() || stations.contains(&entry.value().station))
            .map(|entry| entry.key().clone())
            .sorted()
            .collect()
    }

    pub fn is_departed(&self, key: &QueueKey) -> bool {
        self.departed.contains_key(key)
    }

    pub fn connections_for_user(&self, key: &QueueKey) -> Vec<ConnectionId> {
        index_ids(&self.by_user, key)
    }

    pub fn role_breakdown(&self) -> BTreeMap<String, usize> {
        self.connections
            .iter()
            .map(|entry| entry.connection.station.to_string())
            .counts()
            .into_iter()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

fn index_ids<K>(index: &DashMap<K, HashSet<ConnectionId>>, key: &K) -> Vec<ConnectionId>
where
    K: std::hash::Hash + Eq,
{
    index
        .get(key)
        .map(|ids| ids.iter().copied().collect())
        .unwrap_or_default()
}

/// Removes `id` from the set under `key`, dropping the set once empty.
/// Returns `true` if the set became empty.
fn remove_from_index<K>(index: &DashMap<K, HashSet<ConnectionId>>, key: &K, id: ConnectionId) -> bool
where
    K: std::hash::Hash + Eq,
{
    let emptied = match index.get_mut(key) {
        Some(mut ids) => {
            ids.remove(&id);
            ids.is_empty()
        }
        None => return false,
    };
    if emptied {
        index.remove_if(key, |_, ids| ids.is_empty());
    }
    emptied
}
