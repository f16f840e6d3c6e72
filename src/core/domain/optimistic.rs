use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A local change applied by a station before the server confirmed it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimisticUpdate {
    pub id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub changes: Value,
    pub applied_at: DateTime<Utc>,
    pub confirmed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_data: Option<Value>,
}
