//! The external HTTP interface.
//!
//! Reads are served by any node from its local (possibly stale) view.
//! Every write endpoint is gated on leadership before any work happens;
//! non-leaders answer 503 with an `X-Current-Leader` hint so clients can
//! redirect.

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use orchestry_runtime::{AppManager, Autoscaler, HealthProber, LeadershipState};
use orchestry_store::{AppStore, AuditStore, CoordinationStore};
use tokio::sync::watch;

mod apps;
mod cluster;
mod error;
mod system;

pub use error::{ApiError, ApiResult};

/// Shared handler state.
#[derive(Clone)]
pub struct ApiState {
    pub apps: Arc<dyn AppStore>,
    pub audit: Arc<dyn AuditStore>,
    pub cluster: Arc<dyn CoordinationStore>,
    pub manager: Arc<AppManager>,
    pub autoscaler: Arc<Autoscaler>,
    pub prober: Arc<HealthProber>,
    pub leadership: watch::Receiver<LeadershipState>,
    pub node_id: String,
}

impl ApiState {
    /// Reject writes on non-leaders, carrying the current leader when known.
    fn require_leader(&self) -> Result<(), ApiError> {
        let state = self.leadership.borrow();
        if state.is_leader {
            Ok(())
        } else {
            Err(orchestry_runtime::Error::Leadership {
                leader: state.leader_id.clone(),
            }
            .into())
        }
    }
}

/// Build the full route table.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/apps/register", post(apps::register))
        .route("/apps/{name}/up", post(apps::up))
        .route("/apps/{name}/down", post(apps::down))
        .route("/apps/{name}/scale", post(apps::scale))
        .route("/apps/{name}/policy", post(apps::set_policy))
        .route("/apps/{name}/simulateMetrics", post(apps::simulate_metrics))
        .route("/apps", get(apps::list))
        .route("/apps/{name}/status", get(apps::status))
        .route("/apps/{name}/raw", get(apps::raw))
        .route("/apps/{name}/logs", get(apps::logs))
        .route("/apps/{name}/metrics", get(apps::metrics))
        .route("/metrics", get(system::metrics))
        .route("/events", get(system::events))
        .route("/cluster/status", get(cluster::status))
        .route("/cluster/leader", get(cluster::leader))
        .route("/cluster/health", get(cluster::health))
        .route("/health", get(system::health))
        .with_state(state)
}
