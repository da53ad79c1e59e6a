//! Append-only audit records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One audit event, keyed by app and timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub app: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// One recorded scaling transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingAction {
    pub id: i64,
    pub app: String,
    #[serde(rename = "from")]
    pub from_replicas: i32,
    #[serde(rename = "to")]
    pub to_replicas: i32,
    pub reason: String,
    /// `"autoscaler"` or `"manual"`.
    pub triggered_by: String,
    /// Snapshot of the metrics that drove the decision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Value>,
    pub timestamp: DateTime<Utc>,
}
