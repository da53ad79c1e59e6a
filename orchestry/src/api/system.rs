//! Liveness, system-wide metrics and audit endpoints.

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Json,
};
use orchestry_store::{AppStore, AuditStore};
use serde::Deserialize;
use serde_json::json;

use super::{ApiResult, ApiState};

pub async fn health(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    let leadership = state.leadership.borrow().clone();
    Ok(Json(json!({
        "status": "ok",
        "nodeId": state.node_id,
        "isLeader": leadership.is_leader,
    })))
}

/// System-wide snapshot: registered apps, their replica counts and the
/// prober's view.
pub async fn metrics(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    let apps = state.apps.list_apps().await?;
    let running = apps
        .iter()
        .filter(|a| a.status == orchestry_core::AppStatus::Running)
        .count();
    let mut per_app = Vec::with_capacity(apps.len());
    for app in &apps {
        let replicas = state.manager.snapshot(&app.name).await;
        per_app.push(json!({
            "name": app.name,
            "status": app.status,
            "replicas": replicas.len(),
            "desiredReplicas": app.desired_replicas,
            "window": state.autoscaler.get_metrics_summary(&app.name),
        }));
    }
    let probes = state.prober.summary().await;
    Ok(Json(json!({
        "apps": apps.len(),
        "running": running,
        "perApp": per_app,
        "probes": probes,
    })))
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub app: Option<String>,
    pub limit: Option<i64>,
}

pub async fn events(
    State(state): State<ApiState>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<impl IntoResponse> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let events = state.audit.get_events(query.app.as_deref(), limit).await?;
    Ok(Json(json!({ "events": events })))
}
