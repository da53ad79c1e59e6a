//! App lifecycle and metrics endpoints.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use orchestry_core::{MetricSample, ScalingPolicy, ValidationError};
use orchestry_runtime::Error;
use orchestry_store::{AppStore, AuditStore, NewScalingAction};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{ApiResult, ApiState};

pub async fn register(
    State(state): State<ApiState>,
    Json(raw): Json<Value>,
) -> ApiResult<impl IntoResponse> {
    state.require_leader()?;
    let app = state.manager.register(raw).await?;
    if let Some(policy) = app.manifest.policy() {
        state.autoscaler.set_policy(&app.name, policy);
    }
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "app": app.name,
            "status": app.status,
            "mode": app.mode,
        })),
    ))
}

pub async fn up(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.require_leader()?;
    let report = state.manager.start(&name).await?;
    Ok(Json(json!({
        "app": name,
        "adopted": report.adopted,
        "started": report.started,
    })))
}

pub async fn down(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.require_leader()?;
    state.manager.stop(&name).await?;
    state.autoscaler.remove_app(&name);
    Ok(Json(json!({ "app": name, "status": "stopped" })))
}

#[derive(Debug, Deserialize)]
pub struct ScaleRequest {
    pub replicas: u32,
}

pub async fn scale(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(request): Json<ScaleRequest>,
) -> ApiResult<impl IntoResponse> {
    state.require_leader()?;
    let (from, to) = state.manager.scale(&name, request.replicas).await?;
    state.autoscaler.record_scaling_action(&name);
    state
        .audit
        .log_scaling_action(&NewScalingAction {
            app: name.clone(),
            from_replicas: from as i32,
            to_replicas: to as i32,
            reason: "manual scale request".to_string(),
            triggered_by: "manual".to_string(),
            metrics: None,
        })
        .await?;
    Ok(Json(json!({ "app": name, "from": from, "to": to })))
}

pub async fn set_policy(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(policy): Json<ScalingPolicy>,
) -> ApiResult<impl IntoResponse> {
    state.require_leader()?;
    if state.apps.get_app(&name).await?.is_none() {
        return Err(Error::NotFound(name).into());
    }
    validate_policy(&policy)?;
    state.autoscaler.set_policy(&name, policy.clone());
    state
        .audit
        .log_event(
            &name,
            "policy_updated",
            "scaling policy updated",
            Some(serde_json::to_value(&policy).unwrap_or(Value::Null)),
        )
        .await?;
    Ok(Json(json!({ "app": name, "policy": policy })))
}

fn validate_policy(policy: &ScalingPolicy) -> Result<(), Error> {
    if policy.min < 1 {
        return Err(ValidationError::MinReplicas.into());
    }
    if policy.max < policy.min {
        return Err(ValidationError::MaxBelowMin {
            min: policy.min,
            max: policy.max,
        }
        .into());
    }
    if policy.scale_in_threshold_pct >= policy.scale_out_threshold_pct {
        return Err(ValidationError::ThresholdOrder {
            scale_in: policy.scale_in_threshold_pct,
            scale_out: policy.scale_out_threshold_pct,
        }
        .into());
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SimulateMetricsRequest {
    pub rps: f64,
    pub p95_latency_ms: f64,
    pub active_conn: f64,
    pub cpu_pct: f64,
    pub mem_pct: f64,
    pub healthy_replicas: Option<u32>,
    pub total_replicas: Option<u32>,
    /// Also run an evaluation and include the decision in the response.
    pub evaluate: bool,
}

impl Default for SimulateMetricsRequest {
    fn default() -> Self {
        Self {
            rps: 0.0,
            p95_latency_ms: 0.0,
            active_conn: 0.0,
            cpu_pct: 0.0,
            mem_pct: 0.0,
            healthy_replicas: None,
            total_replicas: None,
            evaluate: false,
        }
    }
}

/// Inject a synthetic sample, bypassing the proxy and runtime. Intended for
/// exercising scaling policies without load.
pub async fn simulate_metrics(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(request): Json<SimulateMetricsRequest>,
) -> ApiResult<impl IntoResponse> {
    state.require_leader()?;
    let app = state
        .apps
        .get_app(&name)
        .await?
        .ok_or_else(|| Error::NotFound(name.clone()))?;

    let tracked = state.manager.snapshot(&name).await.len() as u32;
    let sample = MetricSample {
        timestamp: Utc::now(),
        rps: request.rps,
        p95_latency_ms: request.p95_latency_ms,
        active_conn: request.active_conn,
        cpu_pct: request.cpu_pct,
        mem_pct: request.mem_pct,
        healthy_replicas: request.healthy_replicas.unwrap_or(tracked),
        total_replicas: request.total_replicas.unwrap_or(tracked),
    };
    state.autoscaler.add_metrics(&name, sample);

    let decision = request
        .evaluate
        .then(|| state.autoscaler.evaluate(&name, tracked, app.mode));
    Ok(Json(json!({ "app": name, "decision": decision })))
}

pub async fn list(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    let apps = state.apps.list_apps().await?;
    let listed: Vec<Value> = apps
        .iter()
        .map(|app| {
            json!({
                "name": app.name,
                "status": app.status,
                "mode": app.mode,
                "replicas": app.desired_replicas,
                "image": app.manifest.spec.image,
                "createdAt": app.created_at,
                "updatedAt": app.updated_at,
            })
        })
        .collect();
    Ok(Json(json!({ "apps": listed })))
}

pub async fn status(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let report = state.manager.status(&name).await?;
    Ok(Json(report))
}

pub async fn raw(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let raw = state
        .apps
        .get_raw_spec(&name)
        .await?
        .ok_or_else(|| Error::NotFound(name.clone()))?;
    let app = state
        .apps
        .get_app(&name)
        .await?
        .ok_or_else(|| Error::NotFound(name.clone()))?;
    Ok(Json(json!({
        "app": name,
        "raw": raw,
        "normalized": app.manifest,
    })))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub lines: Option<u32>,
}

pub async fn logs(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<impl IntoResponse> {
    let lines = query.lines.unwrap_or(100).min(1000);
    let merged = state.manager.logs(&name, lines).await?;
    Ok(Json(json!({ "app": name, "lines": merged })))
}

pub async fn metrics(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    if state.apps.get_app(&name).await?.is_none() {
        return Err(Error::NotFound(name).into());
    }
    let policy = state.autoscaler.get_policy(&name);
    let summary = state.autoscaler.get_metrics_summary(&name);
    let factors = state.autoscaler.get_last_scale_factors(&name);
    let history = state.autoscaler.history(&name);
    let scaling_history = state.audit.get_scaling_history(&name, 20).await?;
    Ok(Json(json!({
        "app": name,
        "policy": policy,
        "window": summary,
        "lastScaleFactors": factors,
        "samples": history,
        "scalingHistory": scaling_history,
    })))
}
