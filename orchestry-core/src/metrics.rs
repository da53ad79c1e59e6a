//! Metric samples fed into the autoscaler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One joined observation of an app's signals at a point in time.
///
/// Samples are retained for `2 × window_seconds` per app; aggregation over
/// the trailing window happens in the autoscaler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    /// App-attributed requests per second (fair share of the proxy total).
    pub rps: f64,
    pub p95_latency_ms: f64,
    /// App-attributed active connections.
    pub active_conn: f64,
    /// Average cpu utilisation across the app's replicas, percent.
    pub cpu_pct: f64,
    /// Average memory utilisation across the app's replicas, percent.
    pub mem_pct: f64,
    pub healthy_replicas: u32,
    pub total_replicas: u32,
}
