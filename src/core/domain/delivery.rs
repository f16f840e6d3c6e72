use crate::core::domain::connection::{Connection, ConnectionId, Station};
use crate::core::domain::notification::{EntityChange, NotificationPayload, Priority};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Routing and shaping options for a single `emit` call.
///
/// Resolution order: an explicit `target_connection_id` wins, then
/// `target_user_id`, then `broadcast`, then `target_stations`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EmitOptions {
    pub broadcast: bool,
    pub tenant_id: Option<String>,
    pub target_stations: Vec<Station>,
    pub target_connection_id: Option<ConnectionId>,
    pub target_user_id: Option<String>,
    pub skip_rate_limit: bool,
    pub queue_if_offline: bool,
    pub priority: Option<Priority>,
    pub acknowledgment_required: bool,
    pub ttl_seconds: Option<u64>,
    pub correlation_id: Option<String>,
    pub entity_changes: Vec<EntityChange>,
    pub metadata: Option<Value>,
}

impl EmitOptions {
    pub fn broadcast() -> Self {
        Self {
            broadcast: true,
            ..Self::default()
        }
    }

    pub fn to_stations<I, S>(tenant_id: impl Into<String>, stations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Station>,
    {
        Self {
            tenant_id: Some(tenant_id.into()),
            target_stations: stations.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn to_connection(connection_id: ConnectionId) -> Self {
        Self {
            target_connection_id: Some(connection_id),
            ..Self::default()
        }
    }

    pub fn to_user(tenant_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            tenant_id: Some(tenant_id.into()),
            target_user_id: Some(user_id.into()),
            ..Self::default()
        }
    }

    pub fn tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn queue_if_offline(mut self) -> Self {
        self.queue_if_offline = true;
        self
    }

    pub fn skip_rate_limit(mut self) -> Self {
        self.skip_rate_limit = true;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn require_ack(mut self) -> Self {
        self.acknowledgment_required = true;
        self
    }

    pub fn ttl_seconds(mut self, ttl_seconds: u64) -> Self {
        self.ttl_seconds = Some(ttl_seconds);
        self
    }

    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn entity_change(mut self, change: EntityChange) -> Self {
        self.entity_changes.push(change);
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Builds the immutable payload that this emission will carry.
    pub fn build_payload(&self, event_type: &str, data: Value) -> NotificationPayload {
        let mut payload = NotificationPayload::new(event_type, data);
        payload.priority = self.priority.unwrap_or_default();
        payload.correlation_id = self.correlation_id.clone();
        payload.target_tenant = self.tenant_id.clone();
        payload.target_roles = if self.target_stations.is_empty() {
            None
        } else {
            Some(self.target_stations.clone())
        };
        payload.entity_changes = if self.entity_changes.is_empty() {
            None
        } else {
            Some(self.entity_changes.clone())
        };
        payload.metadata = self.metadata.clone();
        payload.acknowledgment_required = self.acknowledgment_required;
        payload.ttl_seconds = self.ttl_seconds;
        payload
    }
}

/// What happened to a single emission, returned to the emitting caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReceipt {
    pub event_id: String,
    pub event_type: String,
    /// Live connections selected by the router.
    pub matched: usize,
    /// Frames handed to a connection writer.
    pub delivered: usize,
    /// Entries placed in a delivery queue (offline or backpressured target).
    pub queued: usize,
    /// Writers that turned out to be closed; those connections were unregistered.
    pub failed_writes: usize,
    pub rate_limited: bool,
}

impl DeliveryReceipt {
    pub fn new(payload: &NotificationPayload) -> Self {
        Self {
            event_id: payload.id.clone(),
            event_type: payload.event_type.clone(),
            ..Self::default()
        }
    }
}

/// Key of a per-user delivery queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueKey {
    pub tenant_id: String,
    pub user_id: String,
}

impl QueueKey {
    pub fn new(tenant_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
        }
    }
}

impl From<&Connection> for QueueKey {
    fn from(connection: &Connection) -> Self {
        Self::new(connection.tenant_id.clone(), connection.user_id.clone())
    }
}

/// A notification parked for a user who is momentarily unreachable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedEvent {
    pub id: String,
    pub notification: NotificationPayload,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
    pub acknowledged: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

impl QueuedEvent {
    pub fn new(notification: NotificationPayload, ttl: std::time::Duration) -> Self {
        let enqueued_at = Utc::now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| enqueued_at.checked_add_signed(ttl));
        Self {
            id: Uuid::new_v4().to_string(),
            notification,
            enqueued_at,
            attempts: 0,
            acknowledged: false,
            expires_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Received,
    Processed,
    Failed,
}

/// Client to server receipt for a delivered notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventAcknowledgment {
    pub event_id: String,
    pub connection_id: ConnectionId,
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
    pub status: AckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EventAcknowledgment {
    pub fn new(event_id: impl Into<String>, connection_id: ConnectionId, status: AckStatus) -> Self {
        Self {
            event_id: event_id.into(),
            connection_id,
            received_at: Utc::now(),
            status,
            error: None,
        }
    }

    pub fn failed(
        event_id: impl Into<String>,
        connection_id: ConnectionId,
        error: impl Into<String>,
    ) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(event_id, connection_id, AckStatus::Failed)
        }
    }
}

/// Final result of an emission that asked for acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum DeliveryOutcome {
    /// At least one target processed the event.
    Delivered { event_id: String, acknowledged_by: usize },
    /// Every target exhausted its retries, expired in a queue, or there was no target.
    Failed {
        event_id: String,
        attempts: u32,
        reason: String,
    },
}

/// Messages a station sends back over its push socket.
///
/// The connection id of an acknowledgment sent this way is always taken from
/// the socket it arrived on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ClientMessage {
    Ack(ClientAck),
    Heartbeat {
        #[serde(rename = "sentAt", default)]
        sent_at: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientAck {
    pub event_id: String,
    pub status: AckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ClientAck {
    pub fn into_acknowledgment(self, connection_id: ConnectionId) -> EventAcknowledgment {
        EventAcknowledgment {
            event_id: self.event_id,
            connection_id,
            received_at: Utc::now(),
            status: self.status,
            error: self.error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_build_payload_copies_routing_and_shape() {
        let options = EmitOptions::to_stations("t1", ["cameriere"])
            .priority(Priority::Urgent)
            .require_ack()
            .ttl_seconds(30)
            .metadata(json!({"orderId": "9"}));
        let payload = options.build_payload("order:ready", json!({"table": 3}));

        assert_eq!(payload.event_type, "order:ready");
        assert_eq!(payload.priority, Priority::Urgent);
        assert!(payload.acknowledgment_required);
        assert_eq!(payload.ttl_seconds, Some(30));
        assert_eq!(payload.target_tenant.as_deref(), Some("t1"));
        assert_eq!(payload.target_roles, Some(vec![Station::new("CAMERIERE")]));
        assert!(payload.entity_changes.is_none());
    }

    #[test]
    fn test_emit_options_deserialize_with_defaults() {
        let options: EmitOptions =
            serde_json::from_value(json!({"targetStations": ["prepara"], "queueIfOffline": true}))
                .unwrap();
        assert!(options.queue_if_offline);
        assert!(!options.broadcast);
        assert_eq!(options.target_stations, vec![Station::new("PREPARA")]);
    }

    #[test]
    fn test_client_message_tagging() {
        let ack: ClientMessage = serde_json::from_value(
            json!({"kind": "ack", "eventId": "e1", "status": "processed"}),
        )
        .unwrap();
        assert!(matches!(ack, ClientMessage::Ack(ClientAck { ref event_id, status: AckStatus::Processed, .. }) if event_id == "e1"));

        let heartbeat = serde_json::to_value(ClientMessage::Heartbeat { sent_at: 12 }).unwrap();
        assert_eq!(heartbeat, json!({"kind": "heartbeat", "sentAt": 12}));
    }

    #[test]
    fn test_queued_event_expiry_follows_ttl() {
        let event = QueuedEvent::new(
            NotificationPayload::new("order:new", Value::Null),
            std::time::Duration::from_secs(60),
        );
        let expires_at = event.expires_at.unwrap();
        assert_eq!((expires_at - event.enqueued_at).num_seconds(), 60);
    }
}
