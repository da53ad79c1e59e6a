//! Cluster membership and leadership endpoints.

use axum::{extract::State, response::IntoResponse, Json};
use orchestry_store::CoordinationStore;
use serde_json::json;

use super::{ApiResult, ApiState};

pub async fn status(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    let nodes = state.cluster.list_nodes().await?;
    let lease = state.cluster.current_lease().await?;
    let leadership = state.leadership.borrow().clone();
    Ok(Json(json!({
        "nodeId": state.node_id,
        "isLeader": leadership.is_leader,
        "term": leadership.term,
        "nodes": nodes,
        "lease": lease.map(|snapshot| json!({
            "leaderId": snapshot.lease.leader_id,
            "term": snapshot.lease.term,
            "acquiredAt": snapshot.lease.acquired_at,
            "expiresAt": snapshot.lease.expires_at,
            "renewedAt": snapshot.lease.renewed_at,
            "hostname": snapshot.lease.hostname,
            "apiUrl": snapshot.lease.api_url,
            "expired": snapshot.expired,
        })),
    })))
}

pub async fn leader(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    let lease = state.cluster.current_lease().await?;
    let leader = lease
        .filter(|snapshot| !snapshot.expired)
        .map(|snapshot| {
            json!({
                "leaderId": snapshot.lease.leader_id,
                "term": snapshot.lease.term,
                "hostname": snapshot.lease.hostname,
                "apiUrl": snapshot.lease.api_url,
            })
        });
    Ok(Json(json!({ "leader": leader })))
}

pub async fn health(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    let visible = state.cluster.visible_nodes().await?;
    let lease = state.cluster.current_lease().await?;
    let has_leader = lease.as_ref().is_some_and(|snapshot| !snapshot.expired);
    let status = if has_leader && !visible.is_empty() {
        "healthy"
    } else {
        "degraded"
    };
    Ok(Json(json!({
        "status": status,
        "visibleNodes": visible.len(),
        "hasLeader": has_leader,
    })))
}
