//! HTTP surface tests driven through the router with tower::oneshot

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::{Duration, Utc};
use tower::ServiceExt;

use kiln_core::models::{WorkerHeartbeat, WorkerState};
use kiln_core::{BlobStore, Config, Database, Metrics};
use kiln_server::{api, AppState};

const BOUNDARY: &str = "kiln-test-boundary";

struct TestApp {
    app: Router,
    db: Database,
    _dir: tempfile::TempDir,
}

async fn test_app(tweak: impl FnOnce(&mut Config)) -> TestApp {
    let dir = tempfile::TempDir::new().expect("temp dir");
    let db = Database::open(dir.path().join("test.db")).await.expect("db");
    let blobs = BlobStore::open(dir.path().join("blobs")).expect("blobs");
    let mut cfg = Config::default();
    cfg.data_dir = dir.path().to_path_buf();
    tweak(&mut cfg);
    let metrics = Metrics::new().expect("metrics");
    let state = AppState::new(db.clone(), blobs, cfg, metrics);
    TestApp { app: api::router(state), db, _dir: dir }
}

fn multipart_body(filename: &str, content: &str, purpose: &str) -> Body {
    let body = format!(
        "--{b}\r\ncontent-disposition: form-data; name=\"purpose\"\r\n\r\n{purpose}\r\n\
         --{b}\r\ncontent-disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n\
         content-type: application/jsonl\r\n\r\n{content}\r\n--{b}--\r\n",
        b = BOUNDARY,
    );
    Body::from(body)
}

fn upload_request(filename: &str, content: &str, purpose: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/files")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(multipart_body(filename, content, purpose))
        .unwrap()
}

fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_json(resp: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn input_line(custom_id: &str, model: &str) -> String {
    format!(
        r#"{{"custom_id":"{}","method":"POST","url":"/v1/chat/completions","body":{{"model":"{}","messages":[{{"role":"user","content":"hi"}}]}}}}"#,
        custom_id, model
    )
}

fn three_line_input() -> String {
    format!("{}\n{}\n{}\n", input_line("a", "m1"), input_line("b", "m1"), input_line("c", "m1"))
}

async fn seed_fresh_heartbeat(db: &Database) {
    let now = Utc::now();
    db.upsert_heartbeat(&WorkerHeartbeat {
        worker_id: "w-test".into(),
        pid: 1,
        started_at: now - Duration::minutes(5),
        last_seen: now,
        status: WorkerState::Idle.as_str().to_string(),
        current_batch_id: None,
        loaded_model: None,
        model_loaded_at: None,
        gpu_memory_used_bytes: Some(2 << 30),
        gpu_memory_total_bytes: Some(24 << 30),
        gpu_temperature_c: Some(50.0),
        gpu_utilization_pct: Some(5.0),
    })
    .await
    .unwrap();
}

async fn upload_input(app: &Router) -> String {
    let resp = app
        .clone()
        .oneshot(upload_request("in.jsonl", &three_line_input(), "batch"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    json["id"].as_str().unwrap().to_string()
}

async fn create_batch(app: &Router, file_id: &str) -> serde_json::Value {
    let resp = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/v1/batches",
            serde_json::json!({
                "input_file_id": file_id,
                "endpoint": "/v1/chat/completions",
                "completion_window": "24h",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    body_json(resp).await
}

// ============================================================================
// Files
// ============================================================================

#[tokio::test]
async fn test_file_upload_get_download_delete() {
    let t = test_app(|_| {}).await;

    let resp = t
        .app
        .clone()
        .oneshot(upload_request("in.jsonl", &three_line_input(), "batch"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().contains_key("x-request-id"));
    let file = body_json(resp).await;
    assert_eq!(file["object"], "file");
    assert_eq!(file["purpose"], "batch_input");
    assert_eq!(file["filename"], "in.jsonl");
    let file_id = file["id"].as_str().unwrap();

    let resp = t.app.clone().oneshot(get(&format!("/v1/files/{}", file_id))).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = t
        .app
        .clone()
        .oneshot(get(&format!("/v1/files/{}/content", file_id)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    assert_eq!(String::from_utf8(bytes.to_vec()).unwrap(), three_line_input());

    let resp = t
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/v1/files/{}", file_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let deleted = body_json(resp).await;
    assert_eq!(deleted["deleted"], true);

    let resp = t.app.clone().oneshot(get(&format!("/v1/files/{}", file_id))).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_upload_rejects_empty_file() {
    let t = test_app(|_| {}).await;
    let resp = t.app.clone().oneshot(upload_request("in.jsonl", "", "batch")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let json = body_json(resp).await;
    assert_eq!(json["error"]["code"], "validation_error");
    assert!(json["error"]["request_id"].is_string());
}

#[tokio::test]
async fn test_upload_rejects_bad_line_with_index() {
    let t = test_app(|_| {}).await;
    let content = format!("{}\nnot json\n", input_line("a", "m1"));
    let resp = t.app.clone().oneshot(upload_request("in.jsonl", &content, "batch")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let json = body_json(resp).await;
    assert_eq!(json["error"]["code"], "validation_error");
    assert!(json["error"]["message"].as_str().unwrap().contains("line 1"));
}

#[tokio::test]
async fn test_upload_rejects_duplicate_custom_id() {
    let t = test_app(|_| {}).await;
    let content = format!("{}\n{}\n", input_line("a", "m1"), input_line("a", "m1"));
    let resp = t.app.clone().oneshot(upload_request("in.jsonl", &content, "batch")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let json = body_json(resp).await;
    assert_eq!(json["error"]["code"], "duplicate_custom_id");
}

#[tokio::test]
async fn test_upload_rejects_model_mismatch() {
    let t = test_app(|_| {}).await;
    let content = format!("{}\n{}\n", input_line("a", "m1"), input_line("b", "m2"));
    let resp = t.app.clone().oneshot(upload_request("in.jsonl", &content, "batch")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let json = body_json(resp).await;
    assert_eq!(json["error"]["code"], "model_mismatch_in_batch");
}

// ============================================================================
// Batches
// ============================================================================

#[tokio::test]
async fn test_create_and_get_batch() {
    let t = test_app(|_| {}).await;
    seed_fresh_heartbeat(&t.db).await;
    let file_id = upload_input(&t.app).await;

    let batch = create_batch(&t.app, &file_id).await;
    assert_eq!(batch["object"], "batch");
    assert_eq!(batch["status"], "validating");
    assert_eq!(batch["input_file_id"], file_id.as_str());
    assert_eq!(batch["request_counts"]["total"], 3);
    assert_eq!(batch["request_counts"]["completed"], 0);
    assert_eq!(batch["queue_position"], 1);
    let batch_id = batch["id"].as_str().unwrap();

    let resp = t.app.clone().oneshot(get(&format!("/v1/batches/{}", batch_id))).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let fetched = body_json(resp).await;
    assert_eq!(fetched["id"], batch_id);
    assert_eq!(fetched["status"], "validating");
}

#[tokio::test]
async fn test_create_batch_requires_live_worker() {
    let t = test_app(|_| {}).await;
    let file_id = upload_input(&t.app).await;

    // No heartbeat at all: the engine is unreachable
    let resp = t
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            "/v1/batches",
            serde_json::json!({
                "input_file_id": file_id,
                "endpoint": "/v1/chat/completions",
                "completion_window": "24h",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    let json = body_json(resp).await;
    assert_eq!(json["error"]["code"], "gpu_unhealthy");
}

#[tokio::test]
async fn test_create_batch_rejects_hot_gpu() {
    let t = test_app(|_| {}).await;
    let now = Utc::now();
    t.db.upsert_heartbeat(&WorkerHeartbeat {
        worker_id: "w-test".into(),
        pid: 1,
        started_at: now,
        last_seen: now,
        status: WorkerState::Processing.as_str().to_string(),
        current_batch_id: None,
        loaded_model: None,
        model_loaded_at: None,
        gpu_memory_used_bytes: Some(24 << 30),
        gpu_memory_total_bytes: Some(24 << 30),
        gpu_temperature_c: Some(50.0),
        gpu_utilization_pct: Some(90.0),
    })
    .await
    .unwrap();
    let file_id = upload_input(&t.app).await;

    let resp = t
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            "/v1/batches",
            serde_json::json!({
                "input_file_id": file_id,
                "endpoint": "/v1/chat/completions",
                "completion_window": "24h",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    let json = body_json(resp).await;
    assert_eq!(json["error"]["code"], "gpu_unhealthy");
}

#[tokio::test]
async fn test_create_batch_maintenance_mode() {
    let t = test_app(|_| {}).await;
    seed_fresh_heartbeat(&t.db).await;
    let file_id = upload_input(&t.app).await;

    let resp = t
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            "/admin/maintenance",
            serde_json::json!({"enabled": true, "reason": "model upgrade", "eta_minutes": 15}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = t
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            "/v1/batches",
            serde_json::json!({
                "input_file_id": file_id,
                "endpoint": "/v1/chat/completions",
                "completion_window": "24h",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    let json = body_json(resp).await;
    assert_eq!(json["error"]["code"], "maintenance_mode");
    assert!(json["error"]["message"].as_str().unwrap().contains("model upgrade"));
}

#[tokio::test]
async fn test_create_batch_queue_full() {
    let t = test_app(|cfg| cfg.max_queue_depth = 1).await;
    seed_fresh_heartbeat(&t.db).await;
    let file_id = upload_input(&t.app).await;

    create_batch(&t.app, &file_id).await;

    let resp = t
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            "/v1/batches",
            serde_json::json!({
                "input_file_id": file_id,
                "endpoint": "/v1/chat/completions",
                "completion_window": "24h",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    let json = body_json(resp).await;
    assert_eq!(json["error"]["code"], "queue_full");
}

#[tokio::test]
async fn test_create_batch_too_many_requests_in_file() {
    let t = test_app(|cfg| cfg.max_requests_per_job = 2).await;
    seed_fresh_heartbeat(&t.db).await;
    let file_id = upload_input(&t.app).await;

    let resp = t
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            "/v1/batches",
            serde_json::json!({
                "input_file_id": file_id,
                "endpoint": "/v1/chat/completions",
                "completion_window": "24h",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let json = body_json(resp).await;
    assert_eq!(json["error"]["code"], "too_large");
}

#[tokio::test]
async fn test_create_batch_at_limit_is_accepted() {
    let t = test_app(|cfg| cfg.max_requests_per_job = 3).await;
    seed_fresh_heartbeat(&t.db).await;
    let file_id = upload_input(&t.app).await;
    let batch = create_batch(&t.app, &file_id).await;
    assert_eq!(batch["request_counts"]["total"], 3);
}

#[tokio::test]
async fn test_priority_clamped_from_metadata() {
    let t = test_app(|_| {}).await;
    seed_fresh_heartbeat(&t.db).await;
    let file_id = upload_input(&t.app).await;

    let resp = t
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            "/v1/batches",
            serde_json::json!({
                "input_file_id": file_id,
                "endpoint": "/v1/chat/completions",
                "completion_window": "24h",
                "metadata": {"priority": "7", "team": "search"},
            }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let batch = body_json(resp).await;
    assert_eq!(batch["metadata"]["team"], "search");

    let job = t.db.get_job(batch["id"].as_str().unwrap()).await.unwrap().unwrap();
    assert_eq!(job.priority, 1);
}

#[tokio::test]
async fn test_cancel_validating_then_cancel_again() {
    let t = test_app(|_| {}).await;
    seed_fresh_heartbeat(&t.db).await;
    let file_id = upload_input(&t.app).await;
    let batch = create_batch(&t.app, &file_id).await;
    let batch_id = batch["id"].as_str().unwrap();

    let resp = t
        .app
        .clone()
        .oneshot(json_request("POST", &format!("/v1/batches/{}/cancel", batch_id), serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let cancelled = body_json(resp).await;
    assert_eq!(cancelled["status"], "cancelled");

    // The second cancel reports the terminal state
    let resp = t
        .app
        .clone()
        .oneshot(json_request("POST", &format!("/v1/batches/{}/cancel", batch_id), serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let json = body_json(resp).await;
    assert_eq!(json["error"]["code"], "already_terminal");
}

#[tokio::test]
async fn test_delete_input_file_refused_while_job_active() {
    let t = test_app(|_| {}).await;
    seed_fresh_heartbeat(&t.db).await;
    let file_id = upload_input(&t.app).await;
    create_batch(&t.app, &file_id).await;

    let resp = t
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/v1/files/{}", file_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let json = body_json(resp).await;
    assert_eq!(json["error"]["code"], "file_in_use");
}

#[tokio::test]
async fn test_list_batches_pagination() {
    let t = test_app(|_| {}).await;
    seed_fresh_heartbeat(&t.db).await;
    let file_id = upload_input(&t.app).await;
    for _ in 0..3 {
        create_batch(&t.app, &file_id).await;
    }

    let resp = t.app.clone().oneshot(get("/v1/batches?limit=2")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let page = body_json(resp).await;
    assert_eq!(page["data"].as_array().unwrap().len(), 2);
    assert_eq!(page["has_more"], true);

    let after = page["last_id"].as_str().unwrap();
    let resp = t
        .app
        .clone()
        .oneshot(get(&format!("/v1/batches?limit=2&after={}", after)))
        .await
        .unwrap();
    let page2 = body_json(resp).await;
    assert_eq!(page2["data"].as_array().unwrap().len(), 1);
}

// ============================================================================
// Rate limiting
// ============================================================================

#[tokio::test]
async fn test_create_batch_rate_limited() {
    let t = test_app(|cfg| cfg.rate_limit_batches_per_min = 2).await;
    seed_fresh_heartbeat(&t.db).await;
    let file_id = upload_input(&t.app).await;

    create_batch(&t.app, &file_id).await;
    create_batch(&t.app, &file_id).await;

    let resp = t
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            "/v1/batches",
            serde_json::json!({
                "input_file_id": file_id,
                "endpoint": "/v1/chat/completions",
                "completion_window": "24h",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = resp
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .expect("Retry-After header");
    assert!(retry_after >= 1);
    assert_eq!(resp.headers().get("x-ratelimit-remaining").unwrap(), "0");
    let json = body_json(resp).await;
    assert_eq!(json["error"]["code"], "rate_limited");
}

// ============================================================================
// Ops
// ============================================================================

#[tokio::test]
async fn test_health_degraded_without_worker_then_healthy() {
    let t = test_app(|_| {}).await;

    let resp = t.app.clone().oneshot(get("/health")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let health = body_json(resp).await;
    assert_eq!(health["status"], "degraded");

    seed_fresh_heartbeat(&t.db).await;
    let resp = t.app.clone().oneshot(get("/health")).await.unwrap();
    let health = body_json(resp).await;
    assert_eq!(health["status"], "healthy");
    assert!(health["worker_heartbeat_age_s"].as_i64().unwrap() < 60);
    assert!(health["gpu"]["memory_pct"].as_f64().unwrap() > 0.0);
}

#[tokio::test]
async fn test_queue_view_lists_active_jobs() {
    let t = test_app(|_| {}).await;
    seed_fresh_heartbeat(&t.db).await;
    let file_id = upload_input(&t.app).await;
    let batch = create_batch(&t.app, &file_id).await;

    let resp = t.app.clone().oneshot(get("/v1/queue")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let queue = body_json(resp).await;
    assert_eq!(queue["worker"]["status"], "idle");
    let jobs = queue["jobs"].as_array().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["batch_id"], batch["id"]);
    assert_eq!(jobs[0]["status"], "validating");
}

#[tokio::test]
async fn test_metrics_endpoint_exposes_request_counters() {
    let t = test_app(|_| {}).await;
    t.app.clone().oneshot(get("/health")).await.unwrap();

    let resp = t.app.clone().oneshot(get("/metrics")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("kiln_http_requests_total"));
}
