//! The in-memory view of one container instance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Replica lifecycle state as tracked by the app manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaState {
    /// Registered and eligible for proxy membership.
    Ready,
    /// Being taken out of rotation ahead of removal.
    Draining,
    /// The runtime reports the container as not running.
    Down,
}

impl ReplicaState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Down => "down",
        }
    }
}

/// One container instance of an app.
///
/// Authoritative only on the current leader; other nodes may serve stale
/// copies for status reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Replica {
    /// Runtime container id.
    pub container_id: String,
    pub app: String,
    /// Dense per-app index, reused after removal. Also the `replica` label.
    pub index: u32,
    pub ip: String,
    pub port: u16,
    pub state: ReplicaState,
    pub last_seen: DateTime<Utc>,
    /// Consecutive runtime-side failures observed by the monitor.
    pub failures: u32,
    pub cpu_pct: f64,
    pub memory_pct: f64,
}

impl Replica {
    /// Container name as created by the manager (`<app>-<index>`).
    #[must_use]
    pub fn container_name(&self) -> String {
        format!("{}-{}", self.app, self.index)
    }
}
