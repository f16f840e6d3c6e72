use crate::core::domain::connection::Station;
use crate::utils::error::BusResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Well-known event type names emitted by the venue back office.
///
/// Clients subscribe by the raw string, so any other name is valid as well.
pub mod event_types {
    pub const ORDER_NEW: &str = "order:new";
    pub const ORDER_READY: &str = "order:ready";
    pub const ORDER_ITEM_READY: &str = "order:item_ready";
    pub const PRODUCT_OUT_OF_STOCK: &str = "product:out_of_stock";
    pub const PAYMENT_REQUESTED: &str = "payment:requested";
    pub const TABLE_STATE_CHANGED: &str = "table:state_changed";

    /// Reply to a client heartbeat; never handed to subscribers.
    pub const BUS_PONG: &str = "bus:pong";
}

/// Delivery priority of a notification.
///
/// `Urgent` notifications are never throttled by the rate limiter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityOperation {
    Create,
    Update,
    Delete,
    BulkUpdate,
    Sync,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldChange {
    pub field: String,
    pub old_value: Value,
    pub new_value: Value,
}

/// A structured diff riding inside a notification so that stations can patch
/// their local view instead of refetching the entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityChange {
    pub entity_type: String,
    pub entity_id: String,
    pub operation: EntityOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changes: Option<Vec<FieldChange>>,
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_version: Option<u64>,
}

impl EntityChange {
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        operation: EntityOperation,
        version: u64,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            operation,
            changes: None,
            version,
            previous_version: (version > 1).then(|| version - 1),
        }
    }

    pub fn with_field(
        mut self,
        field: impl Into<String>,
        old_value: Value,
        new_value: Value,
    ) -> Self {
        self.changes.get_or_insert_with(Vec::new).push(FieldChange {
            field: field.into(),
            old_value,
            new_value,
        });
        self
    }

    /// The new value written to `field` by this change, if any.
    pub fn new_value_of(&self, field: &str) -> Option<&Value> {
        self.changes
            .as_ref()?
            .iter()
            .find(|c| c.field == field)
            .map(|c| &c.new_value)
    }
}

/// The immutable body of every pushed event.
///
/// The `id` is globally unique; consumers must treat a second delivery of the
/// same id as a no-op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub priority: Priority,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_roles: Option<Vec<Station>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_tenant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_changes: Option<Vec<EntityChange>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub acknowledgment_required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,
    #[serde(default)]
    pub data: Value,
}

impl NotificationPayload {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            priority: Priority::default(),
            timestamp: Utc::now(),
            correlation_id: None,
            target_roles: None,
            target_tenant: None,
            entity_changes: None,
            metadata: None,
            acknowledgment_required: false,
            ttl_seconds: None,
            data,
        }
    }

    /// The business identity of the entity this event is about.
    ///
    /// Looks at the first entity change, then at `metadata.entityId` and
    /// `metadata.orderId`. Blank identifiers are treated as missing.
    pub fn entity_id(&self) -> Option<String> {
        let from_changes = self
            .entity_changes
            .as_ref()
            .and_then(|changes| changes.first())
            .map(|c| c.entity_id.clone());
        from_changes
            .or_else(|| self.metadata_str("entityId"))
            .or_else(|| self.metadata_str("orderId"))
            .filter(|id| !id.trim().is_empty())
    }

    /// The status or state this event moves its entity to, if it carries one.
    pub fn state_marker(&self) -> Option<String> {
        self.metadata_str("status")
            .or_else(|| self.metadata_str("state"))
            .or_else(|| {
                self.entity_changes
                    .as_ref()
                    .and_then(|changes| changes.first())
                    .and_then(|c| c.new_value_of("status").or_else(|| c.new_value_of("state")))
                    .map(value_to_string)
            })
    }

    fn metadata_str(&self, key: &str) -> Option<String> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get(key))
            .filter(|v| !v.is_null())
            .map(value_to_string)
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// One line of the push stream: a `type` discriminator plus the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushFrame {
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: NotificationPayload,
}

impl PushFrame {
    pub fn new(payload: NotificationPayload) -> Self {
        Self {
            event_type: payload.event_type.clone(),
            payload,
        }
    }

    /// Heartbeat reply echoing the client's send time so it can measure latency.
    pub fn pong(sent_at_ms: i64) -> Self {
        Self::new(NotificationPayload::new(
            event_types::BUS_PONG,
            serde_json::json!({ "sentAt": sent_at_ms }),
        ))
    }

    /// Serializes the frame as a single newline-terminated JSON line.
    pub fn to_line(&self) -> BusResult<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn parse(line: &str) -> BusResult<Self> {
        Ok(serde_json::from_str(line.trim_end())?)
    }

    pub fn is_pong(&self) -> bool {
        self.event_type == event_types::BUS_PONG
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_wire_shape_is_camel_case() {
        let mut payload = NotificationPayload::new(event_types::ORDER_READY, json!({"table": 4}));
        payload.acknowledgment_required = true;
        payload.entity_changes = Some(vec![EntityChange::new(
            "order",
            "42",
            EntityOperation::BulkUpdate,
            3,
        )]);

        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["type"], "order:ready");
        assert_eq!(value["priority"], "normal");
        assert_eq!(value["acknowledgmentRequired"], true);
        assert_eq!(value["entityChanges"][0]["operation"], "bulk_update");
        assert_eq!(value["entityChanges"][0]["previousVersion"], 2);
        assert!(value.get("ttlSeconds").is_none());
    }

    #[test]
    fn test_frame_is_one_line() {
        let frame = PushFrame::new(NotificationPayload::new("order:new", json!({"note": "a\nb"})));
        let line = frame.to_line().unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        let parsed = PushFrame::parse(&line).unwrap();
        assert_eq!(parsed.payload.id, frame.payload.id);
    }

    #[test]
    fn test_entity_id_skips_blank_identifiers() {
        let mut payload = NotificationPayload::new("order:ready", Value::Null);
        assert_eq!(payload.entity_id(), None);

        payload.metadata = Some(json!({"orderId": "  "}));
        assert_eq!(payload.entity_id(), None);

        payload.metadata = Some(json!({"orderId": 17, "status": "READY"}));
        assert_eq!(payload.entity_id().as_deref(), Some("17"));
        assert_eq!(payload.state_marker().as_deref(), Some("READY"));
    }

    #[test]
    fn test_state_marker_falls_back_to_entity_change() {
        let mut payload = NotificationPayload::new("table:state_changed", Value::Null);
        payload.entity_changes = Some(vec![EntityChange::new(
            "table",
            "T7",
            EntityOperation::Update,
            5,
        )
        .with_field("state", json!("FREE"), json!("OCCUPIED"))]);

        assert_eq!(payload.entity_id().as_deref(), Some("T7"));
        assert_eq!(payload.state_marker().as_deref(), Some("OCCUPIED"));
    }
}
