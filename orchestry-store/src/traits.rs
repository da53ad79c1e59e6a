//! Capability traits the runtime consumes.
//!
//! The runtime crate depends on these traits rather than on [`Store`]
//! directly, so the coordinator, manager and control loop can be exercised
//! against in-memory implementations in tests.
//!
//! [`Store`]: crate::Store

use std::time::Duration;

use async_trait::async_trait;
use orchestry_core::{App, AppStatus, ClusterNode, Event, LeaderLease, NodeState, ScalingAction};
use serde_json::Value;

use crate::Error;

/// Durable app records.
#[async_trait]
pub trait AppStore: Send + Sync + 'static {
    async fn get_app(&self, name: &str) -> Result<Option<App>, Error>;

    /// Upsert by name. `created_at` is preserved on update.
    async fn save_app(&self, app: &App) -> Result<(), Error>;

    async fn list_apps(&self) -> Result<Vec<App>, Error>;

    async fn list_running_apps(&self) -> Result<Vec<App>, Error>;

    /// The manifest exactly as submitted at registration.
    async fn get_raw_spec(&self, name: &str) -> Result<Option<Value>, Error>;

    async fn set_app_status(
        &self,
        name: &str,
        status: AppStatus,
        replicas: i32,
    ) -> Result<(), Error>;

    async fn set_desired_replicas(&self, name: &str, replicas: i32) -> Result<(), Error>;
}

/// A scaling transition about to be recorded.
#[derive(Debug, Clone)]
pub struct NewScalingAction {
    pub app: String,
    pub from_replicas: i32,
    pub to_replicas: i32,
    pub reason: String,
    pub triggered_by: String,
    pub metrics: Option<Value>,
}

/// Append-only audit records.
#[async_trait]
pub trait AuditStore: Send + Sync + 'static {
    async fn log_event(
        &self,
        app: &str,
        kind: &str,
        message: &str,
        data: Option<Value>,
    ) -> Result<(), Error>;

    async fn get_events(&self, app: Option<&str>, limit: i64) -> Result<Vec<Event>, Error>;

    async fn log_scaling_action(&self, action: &NewScalingAction) -> Result<(), Error>;

    async fn get_scaling_history(&self, app: &str, limit: i64)
        -> Result<Vec<ScalingAction>, Error>;
}

/// A bid for the leader lease.
#[derive(Debug, Clone)]
pub struct LeaseClaim {
    pub leader_id: String,
    pub term: i64,
    pub ttl: Duration,
    pub hostname: String,
    pub api_url: String,
}

/// The lease row together with its expiry judged by the *database* clock.
///
/// Expiry is evaluated on the SQL side so the single-writer predicate never
/// depends on node clocks agreeing with each other.
#[derive(Debug, Clone)]
pub struct LeaseSnapshot {
    pub lease: LeaderLease,
    pub expired: bool,
}

/// Cluster membership and the leader lease.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    async fn upsert_node(&self, node: &ClusterNode) -> Result<(), Error>;

    /// Refresh this node's heartbeat, state and term.
    ///
    /// Returns `false` when the node row no longer exists (e.g. it was
    /// garbage-collected); the caller should re-register.
    async fn heartbeat(&self, node_id: &str, state: NodeState, term: i64) -> Result<bool, Error>;

    async fn list_nodes(&self) -> Result<Vec<ClusterNode>, Error>;

    /// Nodes whose heartbeat is within the visibility window (60 s).
    async fn visible_nodes(&self) -> Result<Vec<ClusterNode>, Error>;

    /// Drop nodes silent for 300 s, never the caller. Returns the count.
    async fn gc_stale_nodes(&self, keep: &str) -> Result<u64, Error>;

    async fn current_lease(&self) -> Result<Option<LeaseSnapshot>, Error>;

    /// Atomic conditional upsert of the singleton lease row.
    ///
    /// Succeeds only when no live lease exists or the existing term is below
    /// the claim's. The affected-row count is the success signal; `true`
    /// means this node is now the leader at `claim.term`.
    async fn try_acquire_lease(&self, claim: &LeaseClaim) -> Result<bool, Error>;

    /// Extend the lease this node holds. `false` means the row is gone or
    /// replaced and leadership is lost immediately.
    async fn renew_lease(&self, leader_id: &str, term: i64, ttl: Duration)
        -> Result<bool, Error>;

    /// Voluntarily drop the lease on graceful shutdown.
    async fn release_lease(&self, leader_id: &str, term: i64) -> Result<(), Error>;

    async fn log_cluster_event(
        &self,
        node_id: &str,
        event_type: &str,
        data: Option<Value>,
        term: i64,
    ) -> Result<(), Error>;
}
