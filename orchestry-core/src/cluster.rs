//! Cluster membership and leader-lease records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-node election state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Follower,
    Candidate,
    Leader,
    Stopped,
}

impl NodeState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Follower => "follower",
            Self::Candidate => "candidate",
            Self::Leader => "leader",
            Self::Stopped => "stopped",
        }
    }
}

impl std::str::FromStr for NodeState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "follower" => Ok(Self::Follower),
            "candidate" => Ok(Self::Candidate),
            "leader" => Ok(Self::Leader),
            "stopped" => Ok(Self::Stopped),
            other => Err(format!("unknown node state {other:?}")),
        }
    }
}

/// One controller process, as registered in `cluster_nodes`.
///
/// A node is *visible* while its heartbeat is fresh; nodes silent for long
/// enough are garbage-collected by the membership monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterNode {
    pub node_id: String,
    pub hostname: String,
    pub port: u16,
    pub api_url: String,
    pub state: NodeState,
    pub term: i64,
    pub last_heartbeat: DateTime<Utc>,
    pub healthy: bool,
}

/// The singleton leader lease row.
///
/// At any instant at most one unexpired `(leader_id, term)` pair exists, and
/// the term strictly increases across replacements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderLease {
    pub leader_id: String,
    pub term: i64,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub renewed_at: DateTime<Utc>,
    pub hostname: String,
    pub api_url: String,
}
