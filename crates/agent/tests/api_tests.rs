//! Integration tests for the agent API endpoints

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;
use virtsched_lib::{
    health::components, hypervisor::MachineCgroupDriver, AgentMetrics, ComponentStatus,
    HealthRegistry, HypervisorAdapter,
};

#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub adapter: Arc<HypervisorAdapter>,
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;
    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(health))
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;
    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status_code, Json(readiness))
}

async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}

async fn vms(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.adapter.entity_snapshots())
}

fn create_test_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/vms", get(vms))
        .with_state(state)
}

async fn setup_test_app() -> (Router, Arc<AppState>, TempDir) {
    let temp = TempDir::new().unwrap();
    let machine_root = temp.path().join("machine.slice");
    let descriptor_root = temp.path().join("domains");
    tokio::fs::create_dir_all(&machine_root).await.unwrap();
    tokio::fs::create_dir_all(&descriptor_root).await.unwrap();

    let driver = MachineCgroupDriver::connect(&machine_root, &descriptor_root, 4)
        .await
        .unwrap();
    let adapter = Arc::new(HypervisorAdapter::new(Arc::new(driver)));

    let health_registry = HealthRegistry::new();
    health_registry.register(components::HYPERVISOR).await;
    health_registry.register(components::RECONCILER).await;

    let state = Arc::new(AppState {
        health_registry,
        adapter,
    });
    let router = create_test_router(state.clone());

    (router, state, temp)
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let (app, _state, _temp) = setup_test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();

    assert_eq!(health["status"], "healthy");
    assert!(health["components"]["hypervisor"].is_object());
    assert!(health["components"]["reconciler"].is_object());
}

#[tokio::test]
async fn test_healthz_returns_ok_when_degraded() {
    let (app, state, _temp) = setup_test_app().await;

    state
        .health_registry
        .set_degraded(components::RECONCILER, "Tick overruns")
        .await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    // Degraded still returns 200 (operational)
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();

    assert_eq!(health["status"], "degraded");
}

#[tokio::test]
async fn test_healthz_returns_503_when_unhealthy() {
    let (app, state, _temp) = setup_test_app().await;

    state
        .health_registry
        .set_unhealthy(components::HYPERVISOR, "Lost hypervisor connection")
        .await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();

    assert_eq!(health["status"], "unhealthy");
}

#[tokio::test]
async fn test_readyz_returns_503_until_ready() {
    let (app, state, _temp) = setup_test_app().await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/readyz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    state.health_registry.set_ready(true).await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/readyz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let readiness: serde_json::Value = serde_json::from_slice(&body).unwrap();

    assert_eq!(readiness["ready"], true);
}

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format() {
    let (app, _state, _temp) = setup_test_app().await;

    // Touch some metrics so the families exist
    let metrics = AgentMetrics::new();
    metrics.observe_tick_duration(0.001);
    metrics.set_vms_tracked(1);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let metrics_text = String::from_utf8(body.to_vec()).unwrap();

    assert!(metrics_text.contains("virtsched_tick_duration_seconds"));
    assert!(metrics_text.contains("virtsched_vms_tracked"));
    assert!(metrics_text.contains("virtsched_tick_duration_seconds_bucket"));
}

#[tokio::test]
async fn test_vms_endpoint_reflects_cache() {
    let (app, state, temp) = setup_test_app().await;

    // Empty cache first
    let response = app
        .clone()
        .oneshot(Request::builder().uri("/vms").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let vms: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(vms.as_array().unwrap().len(), 0);

    // Define a VM and resolve it through the adapter
    tokio::fs::write(
        temp.path().join("domains/web.json"),
        r#"{"uuid":"uuid-web","name":"web","memory_bytes":4096,"vcpus":1,"oversubscription":{"cpu":1.5}}"#,
    )
    .await
    .unwrap();
    let handle = state.adapter.list_defined().await.unwrap().pop().unwrap();
    state.adapter.resolve_entity(&handle, false).await.unwrap();

    let response = app
        .oneshot(Request::builder().uri("/vms").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let vms: serde_json::Value = serde_json::from_slice(&body).unwrap();

    assert_eq!(vms.as_array().unwrap().len(), 1);
    assert_eq!(vms[0]["name"], "web");
    assert_eq!(vms[0]["oversub_cpu_ratio"], 1.5);
    assert_eq!(vms[0]["has_cpu_sample"], false);
}
