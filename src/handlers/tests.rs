//! # Tests for Handlers
//!
//! Router-level tests run against an in-memory SQLite database.

use std::sync::Arc;

use axum::{
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
    response::Json,
};
use migration::{Migrator, MigratorTrait};
use sea_orm::{Database, EntityTrait};
use serde_json::Value;
use tower::ServiceExt;

use crate::config::AppConfig;
use crate::handlers::root;
use crate::models::{QueueJob, ServiceInfo};
use crate::progress::{InstallationKey, ProgressStore, RepositorySummary, SyncStatus};
use crate::server::{AppState, create_app};

async fn setup_test_app() -> AppState {
    let db = Database::connect("sqlite::memory:").await.unwrap();
    Migrator::up(&db, None).await.unwrap();
    AppState::new(Arc::new(AppConfig::default()), db)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn repository(id: i64, name: &str) -> RepositorySummary {
    RepositorySummary {
        id,
        name: name.to_string(),
        owner: "acme".to_string(),
        full_name: format!("acme/{}", name),
        updated_at: chrono::Utc::now(),
    }
}

#[tokio::test]
async fn test_root_handler_returns_expected_service_info() {
    let Json(service_info) = root().await;

    assert_eq!(service_info.service, "repo-sync");
    assert_eq!(service_info.version, env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_service_info_serializes() {
    let json_value = serde_json::to_value(ServiceInfo::default()).unwrap();

    assert_eq!(json_value["service"], "repo-sync");
    assert!(json_value.get("version").is_some());
}

#[tokio::test]
async fn test_healthz_reports_ok() {
    let app = create_app(setup_test_app().await);

    let request = Request::builder()
        .uri("/healthz")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "ok");
}

#[tokio::test]
async fn test_request_id_is_echoed() {
    let app = create_app(setup_test_app().await);

    let request = Request::builder()
        .uri("/")
        .header("x-request-id", "req-abc")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.headers().get("x-request-id").unwrap(), "req-abc");
}

#[tokio::test]
async fn test_get_unknown_installation_returns_problem_json() {
    let app = create_app(setup_test_app().await);

    let request = Request::builder()
        .uri("/tenants/acme/installations/42")
        .header("x-request-id", "req-404")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/problem+json"
    );
    let body = body_json(response).await;
    assert_eq!(body["code"], "NOT_FOUND");
    assert_eq!(body["trace_id"], "req-404");
}

#[tokio::test]
async fn test_get_installation_reports_progress() {
    let state = setup_test_app().await;
    let key = InstallationKey::new(42, "acme");
    let mut progress = state.installations.create(&key).await.unwrap();
    progress.repo_sync_state.upsert_repository(repository(101, "widgets"));
    progress.total_repo_count = 1;
    progress.sync_status = SyncStatus::Active;
    assert!(state.installations.save(&progress).await.unwrap());

    let app = create_app(state);
    let request = Request::builder()
        .uri("/tenants/acme/installations/42")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["syncStatus"], "ACTIVE");
    assert_eq!(body["totalRepoCount"], 1);
    assert_eq!(body["repositories"][0]["fullName"], "acme/widgets");
    assert_eq!(body["repositories"][0]["synced"], false);
    assert_eq!(body["repositories"][0]["tasks"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_start_sync_links_installation_and_enqueues_discovery() {
    let state = setup_test_app().await;
    let db = state.db.clone();
    let installations = state.installations.clone();
    let app = create_app(state);

    let request = Request::builder()
        .method("POST")
        .uri("/tenants/acme/installations/7/sync")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"syncType":"full"}"#))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = body_json(response).await;
    assert_eq!(body["syncType"], "full");
    assert_eq!(body["created"], true);

    let progress = installations
        .load(&InstallationKey::new(7, "acme"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(progress.sync_status, SyncStatus::Pending);

    let jobs = QueueJob::find().all(&db).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].queue, "discovery");
    assert_eq!(jobs[0].attempts, AppConfig::default().queue.default_attempts as i32);
}

#[tokio::test]
async fn test_start_sync_without_body_defaults_to_partial() {
    let state = setup_test_app().await;
    state
        .installations
        .create(&InstallationKey::new(7, "acme"))
        .await
        .unwrap();
    let app = create_app(state);

    let request = Request::builder()
        .method("POST")
        .uri("/tenants/acme/installations/7/sync")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = body_json(response).await;
    assert_eq!(body["syncType"], "partial");
    assert_eq!(body["created"], false);
}

#[tokio::test]
async fn test_start_sync_rejects_unknown_sync_type() {
    let app = create_app(setup_test_app().await);

    let request = Request::builder()
        .method("POST")
        .uri("/tenants/acme/installations/7/sync")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"syncType":"sometimes"}"#))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "VALIDATION_FAILED");
}

#[tokio::test]
async fn test_openapi_document_lists_installation_routes() {
    let app = create_app(setup_test_app().await);

    let request = Request::builder()
        .uri("/openapi.json")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert!(
        body["paths"]
            .get("/tenants/{tenant_id}/installations/{installation_id}/sync")
            .is_some()
    );
}
