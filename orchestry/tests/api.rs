//! Router-level tests: leader gating, registration validation, and the read
//! endpoints, exercised against in-memory stores and drivers.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use orchestry::api::{router, ApiState};
use orchestry_runtime::{
    testing::{MemAppStore, MemAuditStore, MemCoordinationStore, MockRuntime, OkProxy},
    AppManager, Autoscaler, HealthProber, LeadershipState, UpstreamPublisher,
};
use serde_json::{json, Value};
use tokio::sync::watch;
use tower::ServiceExt;

struct TestNode {
    router: Router,
    leadership: watch::Sender<LeadershipState>,
    _conf_dir: tempfile::TempDir,
}

fn test_node(is_leader: bool) -> TestNode {
    let apps = Arc::new(MemAppStore::default());
    let audit = Arc::new(MemAuditStore::default());
    let cluster = Arc::new(MemCoordinationStore::default());
    let prober = Arc::new(HealthProber::new());
    let autoscaler = Arc::new(Autoscaler::new());
    let conf_dir = tempfile::tempdir().unwrap();
    let publisher = Arc::new(UpstreamPublisher::new(
        conf_dir.path(),
        Arc::new(OkProxy::default()),
    ));
    let (leadership, rx) = watch::channel(LeadershipState {
        is_leader,
        leader_id: Some(if is_leader { "node-a" } else { "node-b" }.to_string()),
        term: 1,
    });
    let manager = AppManager::new(
        apps.clone(),
        audit.clone(),
        Arc::new(MockRuntime::default()),
        prober.clone(),
        publisher,
        rx.clone(),
        "orchestry".to_string(),
    );
    let state = ApiState {
        apps,
        audit,
        cluster,
        manager,
        autoscaler,
        prober,
        leadership: rx,
        node_id: "node-a".to_string(),
    };
    TestNode {
        router: router(state),
        leadership,
        _conf_dir: conf_dir,
    }
}

fn manifest(name: &str) -> Value {
    json!({
        "apiVersion": "orchestry/v1",
        "kind": "App",
        "metadata": { "name": name },
        "spec": {
            "type": "http",
            "image": "nginx:alpine",
            "ports": [ { "containerPort": 8080 } ]
        },
        "scaling": { "minReplicas": 1, "maxReplicas": 3 }
    })
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn writes_on_a_follower_redirect_to_the_leader() {
    let node = test_node(false);

    let response = node
        .router
        .clone()
        .oneshot(post("/apps/register", manifest("web")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        response
            .headers()
            .get("x-current-leader")
            .and_then(|v| v.to_str().ok()),
        Some("node-b")
    );
    let body = body_json(response).await;
    assert_eq!(body["leader"], "node-b");
    assert!(body["error"].as_str().unwrap().contains("not the leader"));

    // Every write endpoint is gated the same way.
    for uri in [
        "/apps/web/up",
        "/apps/web/down",
        "/apps/web/scale",
        "/apps/web/simulateMetrics",
    ] {
        let response = node
            .router
            .clone()
            .oneshot(post(uri, json!({ "replicas": 2 })))
            .await
            .unwrap();
        assert_eq!(
            response.status(),
            StatusCode::SERVICE_UNAVAILABLE,
            "{uri} must be leader-gated"
        );
    }
}

#[tokio::test]
async fn reads_are_served_by_followers() {
    let node = test_node(false);
    for uri in ["/apps", "/health", "/cluster/status", "/cluster/health", "/events"] {
        let response = node.router.clone().oneshot(get(uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK, "{uri} must serve reads");
    }
}

#[tokio::test]
async fn register_then_read_back() {
    let node = test_node(true);

    let response = node
        .router
        .clone()
        .oneshot(post("/apps/register", manifest("web")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert_eq!(body["app"], "web");
    assert_eq!(body["status"], "stopped");

    let response = node.router.clone().oneshot(get("/apps")).await.unwrap();
    let body = body_json(response).await;
    assert_eq!(body["apps"][0]["name"], "web");

    // Raw spec round-trips, normalization shown alongside.
    let response = node
        .router
        .clone()
        .oneshot(get("/apps/web/raw"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["raw"]["metadata"]["name"], "web");
    assert_eq!(body["normalized"]["spec"]["type"], "http");
}

#[tokio::test]
async fn register_rejects_invalid_manifests() {
    let node = test_node(true);
    let mut bad = manifest("web");
    bad["spec"]["ports"] = json!([]);
    let response = node
        .router
        .clone()
        .oneshot(post("/apps/register", bad))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("port"));
}

#[tokio::test]
async fn unknown_apps_return_404() {
    let node = test_node(true);
    let response = node
        .router
        .clone()
        .oneshot(get("/apps/ghost/status"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = node
        .router
        .clone()
        .oneshot(post("/apps/ghost/up", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn lifecycle_up_scale_down() {
    let node = test_node(true);
    node.router
        .clone()
        .oneshot(post("/apps/register", manifest("web")))
        .await
        .unwrap();

    let response = node
        .router
        .clone()
        .oneshot(post("/apps/web/up", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["started"], 1);

    let response = node
        .router
        .clone()
        .oneshot(post("/apps/web/scale", json!({ "replicas": 3 })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["to"], 3);

    let response = node
        .router
        .clone()
        .oneshot(get("/apps/web/status"))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["replicas"], 3);

    let response = node
        .router
        .clone()
        .oneshot(post("/apps/web/down", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "stopped");
}

#[tokio::test]
async fn simulate_metrics_reports_a_decision() {
    let node = test_node(true);
    node.router
        .clone()
        .oneshot(post("/apps/register", manifest("web")))
        .await
        .unwrap();

    let response = node
        .router
        .clone()
        .oneshot(post(
            "/apps/web/simulateMetrics",
            json!({
                "rps": 500.0,
                "healthyReplicas": 1,
                "totalReplicas": 1,
                "evaluate": true
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    // One replica at 500 rps against a 50 rps budget: scale out.
    assert_eq!(body["decision"]["should_scale"], true);
}

#[tokio::test]
async fn losing_leadership_gates_future_writes() {
    let node = test_node(true);
    node.router
        .clone()
        .oneshot(post("/apps/register", manifest("web")))
        .await
        .unwrap();

    node.leadership
        .send(LeadershipState {
            is_leader: false,
            leader_id: Some("node-c".to_string()),
            term: 2,
        })
        .unwrap();

    let response = node
        .router
        .clone()
        .oneshot(post("/apps/web/up", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}
