//! Router tests for the main, metrics and diagnostics listeners.
//!
//! Tests cover:
//! - Ping and version endpoints
//! - Job creation, lookup, listing and transitions
//! - Stacked image creation and supersession
//! - Target queries
//! - Error response shape and status mapping
//! - Metrics exposition and diagnostics views

use std::sync::Arc;

use axum::{
    body::Body,
    http::{header::CONTENT_TYPE, Method, Request, StatusCode},
    Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use tower::ServiceExt;

use stacker_core::api::{self, AppState, BuildInfo, DiagnosticsState};
use stacker_core::config::{Config, StorageKind};
use stacker_core::db::{SchedulerStore, Store, StoreOptions};
use stacker_core::listeners::{ListenerDescriptor, ListenerGroup};

struct Fixture {
    router: Router,
    state: AppState,
    _dir: tempfile::TempDir,
}

async fn scheduler_store(dir: &tempfile::TempDir) -> SchedulerStore {
    let dsn = format!("sqlite://{}", dir.path().join("scheduler.db").display());
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .connect_with(
            dsn.parse::<sqlx::sqlite::SqliteConnectOptions>()
                .unwrap()
                .create_if_missing(true),
        )
        .await
        .unwrap();
    sqlx::query(
        "CREATE TABLE target (id INTEGER PRIMARY KEY, name TEXT NOT NULL, active INTEGER NOT NULL, \
         ra REAL, dec REAL, epochcode INTEGER NOT NULL, rotation REAL, roi REAL, projectid INTEGER)",
    )
    .execute(&pool)
    .await
    .unwrap();
    sqlx::query(
        "INSERT INTO target VALUES (1, 'M31', 1, 0.71, 41.27, 2, 0, 100, 1), \
         (2, 'M42', 0, 5.59, -5.39, 1, NULL, NULL, NULL)",
    )
    .execute(&pool)
    .await
    .unwrap();
    pool.close().await;

    SchedulerStore::connect(StorageKind::Sqlite, &dsn, &StoreOptions::default())
        .await
        .unwrap()
}

async fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::connect(StorageKind::Sqlite, "sqlite::memory:", &StoreOptions::default())
        .await
        .unwrap();
    let state = AppState {
        store,
        scheduler: scheduler_store(&dir).await,
        config: Arc::new(Config::default()),
        build: Arc::new(BuildInfo::current()),
    };
    Fixture {
        router: api::main_router(state.clone()),
        state,
        _dir: dir,
    }
}

async fn send(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    (status, value)
}

fn stack_body(target_id: i64, filter: &str, image_count: i64) -> Value {
    json!({
        "target_id": target_id,
        "filter_name": filter,
        "image_count": image_count,
        "file_path": format!("/stacks/{}-{}.fits", target_id, filter),
        "thumbnail_path": format!("/stacks/{}-{}.jpg", target_id, filter),
        "file_size": 4096,
        "processed_at": Utc::now() - chrono::Duration::minutes(5),
    })
}

fn assert_error(body: &Value, code: &str) {
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], code, "body: {}", body);
    assert!(body["error"]["numeric_code"].is_number());
    assert!(body["error"]["message"].is_string());
}

// ============================================================================
// Service Endpoints
// ============================================================================

#[tokio::test]
async fn test_ping() {
    let fx = fixture().await;
    let (status, body) = send(&fx.router, Method::GET, "/ping", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "state": "OK" }));
}

#[tokio::test]
async fn test_version_is_plain_text() {
    let fx = fixture().await;
    let request = Request::builder().uri("/api/v1/version").body(Body::empty()).unwrap();
    let response = fx.router.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()[CONTENT_TYPE].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/plain"));
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], env!("CARGO_PKG_VERSION").as_bytes());
}

#[tokio::test]
async fn test_unknown_route() {
    let fx = fixture().await;
    let (status, _) = send(&fx.router, Method::GET, "/api/v2/jobs", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ============================================================================
// Jobs
// ============================================================================

#[tokio::test]
async fn test_create_and_get_job() {
    let fx = fixture().await;

    let (status, job) = send(&fx.router, Method::POST, "/api/v1/jobs", Some(json!({ "acquired_image_id": 42 }))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(job["status"], "pending");
    assert_eq!(job["acquired_image_id"], 42);
    assert_eq!(job["revision"], 0);

    let uri = format!("/api/v1/jobs/{}", job["id"]);
    let (status, fetched) = send(&fx.router, Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched, job);
}

#[tokio::test]
async fn test_duplicate_job_conflicts() {
    let fx = fixture().await;
    let body = json!({ "acquired_image_id": 7 });
    send(&fx.router, Method::POST, "/api/v1/jobs", Some(body.clone())).await;

    let (status, error) = send(&fx.router, Method::POST, "/api/v1/jobs", Some(body)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_error(&error, "DUPLICATE_RECORD");
}

#[tokio::test]
async fn test_missing_job() {
    let fx = fixture().await;
    let (status, error) = send(&fx.router, Method::GET, "/api/v1/jobs/404", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_error(&error, "NOT_FOUND");

    let (status, error) = send(&fx.router, Method::GET, "/api/v1/jobs/abc", None).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_error(&error, "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_malformed_body() {
    let fx = fixture().await;
    let (status, error) = send(&fx.router, Method::POST, "/api/v1/jobs", Some(json!({ "acquired": "x" }))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_error(&error, "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_job_lifecycle_over_http() {
    let fx = fixture().await;
    let (_, stack) = send(&fx.router, Method::POST, "/api/v1/stacks", Some(stack_body(1, "Ha", 1))).await;
    let (_, job) = send(&fx.router, Method::POST, "/api/v1/jobs", Some(json!({ "acquired_image_id": 42 }))).await;
    let uri = format!("/api/v1/jobs/{}/transition", job["id"]);

    let (status, job) = send(
        &fx.router,
        Method::POST,
        &uri,
        Some(json!({ "status": "downloaded", "file_path": "/tmp/42.fits", "expected_revision": 0 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["status"], "downloaded");
    assert_eq!(job["revision"], 1);

    let (status, job) = send(&fx.router, Method::POST, &uri, Some(json!({ "status": "processing" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["status"], "processing");

    let (status, job) = send(
        &fx.router,
        Method::POST,
        &uri,
        Some(json!({ "status": "stacked", "stacked_image_id": stack["id"] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["status"], "stacked");
    assert_eq!(job["stacked_image_id"], stack["id"]);
    assert!(job["downloaded_at"].is_string());
    assert!(job["processed_at"].is_string());
    assert!(job["error"].is_null());
}

#[tokio::test]
async fn test_transition_errors() {
    let fx = fixture().await;
    let (_, job) = send(&fx.router, Method::POST, "/api/v1/jobs", Some(json!({ "acquired_image_id": 1 }))).await;
    let uri = format!("/api/v1/jobs/{}/transition", job["id"]);

    // The edge is checked before the referenced stacked image is looked up.
    let (status, error) = send(
        &fx.router,
        Method::POST,
        &uri,
        Some(json!({ "status": "stacked", "stacked_image_id": 999 })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_error(&error, "INVALID_TRANSITION");

    let (status, error) = send(&fx.router, Method::POST, &uri, Some(json!({ "status": "processing" }))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_error(&error, "INVALID_TRANSITION");

    let (status, error) = send(&fx.router, Method::POST, &uri, Some(json!({ "status": "downloaded" }))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_error(&error, "VALIDATION_ERROR");

    let (status, error) = send(
        &fx.router,
        Method::POST,
        &uri,
        Some(json!({ "status": "failed", "error": "dew on optics", "expected_revision": 3 })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_error(&error, "CONFLICT");

    let (status, job) = send(
        &fx.router,
        Method::POST,
        &uri,
        Some(json!({ "status": "failed", "error": "dew on optics", "expected_revision": 0 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["status"], "failed");
    assert_eq!(job["error"], "dew on optics");
}

#[tokio::test]
async fn test_stacked_transition_needs_existing_image() {
    let fx = fixture().await;
    let (_, job) = send(&fx.router, Method::POST, "/api/v1/jobs", Some(json!({ "acquired_image_id": 5 }))).await;
    let uri = format!("/api/v1/jobs/{}/transition", job["id"]);

    let (status, _) = send(
        &fx.router,
        Method::POST,
        &uri,
        Some(json!({ "status": "downloaded", "file_path": "/data/m31_0005.fits" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&fx.router, Method::POST, &uri, Some(json!({ "status": "processing" }))).await;
    assert_eq!(status, StatusCode::OK);

    let (status, error) = send(
        &fx.router,
        Method::POST,
        &uri,
        Some(json!({ "status": "stacked", "stacked_image_id": 999 })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_error(&error, "PRECONDITION_FAILED");

    let (_, unchanged) = send(&fx.router, Method::GET, &format!("/api/v1/jobs/{}", job["id"]), None).await;
    assert_eq!(unchanged["status"], "processing");
}

#[tokio::test]
async fn test_list_jobs() {
    let fx = fixture().await;
    for id in [3, 1, 2] {
        send(&fx.router, Method::POST, "/api/v1/jobs", Some(json!({ "acquired_image_id": id }))).await;
    }
    let (_, first) = send(&fx.router, Method::GET, "/api/v1/jobs/1", None).await;
    send(
        &fx.router,
        Method::POST,
        "/api/v1/jobs/1/transition",
        Some(json!({ "status": "failed", "error": "clouds", "expected_revision": first["revision"] })),
    )
    .await;

    let (status, pending) = send(&fx.router, Method::GET, "/api/v1/jobs?status=pending", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pending.as_array().unwrap().len(), 2);

    let (_, all) = send(&fx.router, Method::GET, "/api/v1/jobs", None).await;
    let ids: Vec<i64> = all.as_array().unwrap().iter().map(|j| j["id"].as_i64().unwrap()).collect();
    assert_eq!(ids, vec![1, 2, 3]);

    let (status, error) = send(&fx.router, Method::GET, "/api/v1/jobs?status=bogus", None).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_error(&error, "VALIDATION_ERROR");
}

// ============================================================================
// Stacked Images
// ============================================================================

#[tokio::test]
async fn test_stack_supersession_over_http() {
    let fx = fixture().await;
    let (status, stack) = send(&fx.router, Method::POST, "/api/v1/stacks", Some(stack_body(9, "OIII", 2))).await;
    assert_eq!(status, StatusCode::CREATED);
    let uri = format!("/api/v1/stacks/{}", stack["id"]);

    let mut grown = stack.clone();
    grown["image_count"] = json!(6);
    let (status, updated) = send(&fx.router, Method::PUT, &uri, Some(grown)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["image_count"], 6);

    let mut shrunk = updated.clone();
    shrunk["image_count"] = json!(5);
    let (status, error) = send(&fx.router, Method::PUT, &uri, Some(shrunk)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_error(&error, "IMAGE_COUNT_DECREASED");

    let mut moved = updated.clone();
    moved["id"] = json!(999);
    let (status, error) = send(&fx.router, Method::PUT, &uri, Some(moved)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_error(&error, "VALIDATION_ERROR");

    let (status, fetched) = send(&fx.router, Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["image_count"], 6);
}

// ============================================================================
// Targets
// ============================================================================

#[tokio::test]
async fn test_targets() {
    let fx = fixture().await;

    let (status, all) = send(&fx.router, Method::GET, "/api/v1/targets", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(all.as_array().unwrap().len(), 2);

    let (_, active) = send(&fx.router, Method::GET, "/api/v1/targets?active=true", None).await;
    let active = active.as_array().unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0]["name"], "M31");
    assert_eq!(active[0]["epoch"], "J2000");

    let (status, m42) = send(&fx.router, Method::GET, "/api/v1/targets/2", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(m42["epoch"], "B1950");
    assert_eq!(m42["active"], false);

    let (status, error) = send(&fx.router, Method::GET, "/api/v1/targets/3", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_error(&error, "NOT_FOUND");
}

// ============================================================================
// Metrics and Diagnostics
// ============================================================================

#[tokio::test]
async fn test_metrics_router() {
    let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
    let router = api::metrics_router(recorder.handle());

    let request = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_diagnostics_router() {
    let fx = fixture().await;
    let mut config = Config::default();
    config.storage.dsn_app = "postgres://stacker:hunter2@db:5432/stacker".to_string();
    config.storage.kind = StorageKind::Postgres;

    let mut group = ListenerGroup::new(std::time::Duration::from_secs(1));
    group.add_listener(ListenerDescriptor::new("main", "127.0.0.1", 0), Router::new());

    let router = api::diagnostics_router(DiagnosticsState {
        monitor: group.monitor(),
        store: fx.state.store.clone(),
        scheduler: fx.state.scheduler.clone(),
        config: Arc::new(config),
        build: fx.state.build.clone(),
    });

    let (status, listeners) = send(&router, Method::GET, "/debug/listeners", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listeners["state"], "created");
    assert_eq!(listeners["listeners"][0]["name"], "main");

    let (status, store) = send(&router, Method::GET, "/debug/store", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(store["backend"], "sqlite");
    assert_eq!(store["ping"]["ok"], true);
    assert_eq!(store["pool"]["max_connections"], 1);

    let (_, build) = send(&router, Method::GET, "/debug/build", None).await;
    assert_eq!(build["version"], env!("CARGO_PKG_VERSION"));
    assert!(build["uptime"].is_string());

    let (_, config) = send(&router, Method::GET, "/debug/config", None).await;
    let dsn = config["storage"]["dsn_app"].as_str().unwrap();
    assert!(!dsn.contains("hunter2"));
    assert!(dsn.ends_with("@db:5432/stacker"));
}
