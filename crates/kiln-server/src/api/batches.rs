//! Batch API routes
//!
//! Batch creation runs the admission checks in a fixed order: maintenance,
//! engine health, queue depth, job size, then input coherence. The model is
//! taken from the validated input file, never from the request body.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::{Duration, Utc};
use serde::Deserialize;

use kiln_core::error::{Error, ErrorCode};
use kiln_core::models::wire::{BatchList, BatchObject, CreateBatchRequest};
use kiln_core::models::{clamp_priority, new_batch_id, BatchJob, BatchStatus, FilePurpose};

use crate::api::rate_headers;
use crate::error::ApiError;
use crate::middleware::RequestId;
use crate::ratelimit::client_ip;
use crate::state::AppState;

const SUPPORTED_ENDPOINT: &str = "/v1/chat/completions";

/// Batch routes
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_batches).post(create_batch))
        .route("/:id", get(get_batch))
        .route("/:id/cancel", post(cancel_batch))
}

/// Create a batch job
async fn create_batch(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(req): Json<CreateBatchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let ip = client_ip(&headers, peer.map(|p| p.0.ip()), state.cfg.trust_forwarded_for);
    let decision = state
        .limiter
        .check("batches", ip, state.cfg.rate_limit_batches_per_min);
    if !decision.allowed {
        state.metrics.rate_limited.with_label_values(&["batches"]).inc();
        return Err(ApiError::rate_limited(&decision).with_request_id(&rid.0));
    }

    let err = |e: Error| ApiError::from(e).with_request_id(&rid.0);

    // 1. Maintenance gate
    let system = state.db.system_status().await.map_err(err)?;
    if system.maintenance_mode {
        let reason = system
            .maintenance_reason
            .unwrap_or_else(|| "maintenance in progress".to_string());
        let message = match system.maintenance_eta_minutes {
            Some(eta) => format!("{} (eta {} min)", reason, eta),
            None => reason,
        };
        return Err(ApiError::new(ErrorCode::MaintenanceMode, message).with_request_id(&rid.0));
    }

    // 2. Engine health via the worker heartbeat
    let now = Utc::now();
    if state
        .db
        .worker_is_stale(now, state.cfg.heartbeat_stale_s)
        .await
        .map_err(err)?
    {
        return Err(ApiError::new(ErrorCode::GpuUnhealthy, "no live worker").with_request_id(&rid.0));
    }
    if let Some(hb) = state.db.latest_heartbeat().await.map_err(err)? {
        if let Some(mem_pct) = hb.gpu_memory_pct() {
            if mem_pct >= state.cfg.gpu_memory_pct_limit {
                return Err(ApiError::new(
                    ErrorCode::GpuUnhealthy,
                    format!("GPU memory at {:.0}%", mem_pct),
                )
                .with_request_id(&rid.0));
            }
        }
        if let Some(temp) = hb.gpu_temperature_c {
            if temp >= state.cfg.gpu_temperature_c_limit {
                return Err(ApiError::new(
                    ErrorCode::GpuUnhealthy,
                    format!("GPU temperature at {:.0}C", temp),
                )
                .with_request_id(&rid.0));
            }
        }
    }

    // 3. Queue back-pressure
    let depth = state.db.queue_depth().await.map_err(err)?;
    if depth >= state.cfg.max_queue_depth {
        return Err(ApiError::new(
            ErrorCode::QueueFull,
            format!("queue depth {} at limit", depth),
        )
        .with_request_id(&rid.0));
    }

    // 4. Input file checks
    let file = state
        .db
        .get_file(&req.input_file_id)
        .await
        .map_err(err)?
        .ok_or_else(|| {
            ApiError::new(ErrorCode::NotFound, format!("file {} not found", req.input_file_id))
                .with_request_id(&rid.0)
        })?;
    if file.purpose() != Some(FilePurpose::BatchInput) {
        return Err(ApiError::new(
            ErrorCode::ValidationError,
            format!("file {} is not a batch input", file.id),
        )
        .with_request_id(&rid.0));
    }
    if file.line_count > state.cfg.max_requests_per_job as i64 {
        return Err(ApiError::new(
            ErrorCode::TooLarge,
            format!(
                "input has {} requests, limit is {}",
                file.line_count, state.cfg.max_requests_per_job
            ),
        )
        .with_request_id(&rid.0));
    }

    if req.endpoint != SUPPORTED_ENDPOINT {
        return Err(ApiError::new(
            ErrorCode::ValidationError,
            format!("unsupported endpoint {:?}", req.endpoint),
        )
        .with_request_id(&rid.0));
    }
    let window = parse_completion_window(&req.completion_window)
        .ok_or_else(|| {
            ApiError::new(
                ErrorCode::ValidationError,
                format!("invalid completion_window {:?}", req.completion_window),
            )
            .with_request_id(&rid.0)
        })?;

    // 5. Model comes from the validated input, all lines agree
    let model = file.model.clone().ok_or_else(|| {
        ApiError::new(ErrorCode::ValidationError, "input file has no model recorded")
            .with_request_id(&rid.0)
    })?;

    let metadata = req.metadata.unwrap_or_default();
    let priority = metadata
        .get("priority")
        .and_then(|p| p.parse::<i64>().ok())
        .map(clamp_priority)
        .unwrap_or(0);

    // 6. Insert in `validating`; the worker takes it from here
    let job = BatchJob {
        id: new_batch_id(),
        input_file_id: file.id.clone(),
        endpoint: req.endpoint,
        completion_window: req.completion_window,
        model,
        priority,
        metadata: if metadata.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&metadata).map_err(|e| err(e.into()))?)
        },
        status: BatchStatus::Validating.as_str().to_string(),
        worker_id: None,
        total_requests: file.line_count,
        completed_requests: 0,
        failed_requests: 0,
        tokens_processed: 0,
        throughput_tokens_per_s: None,
        last_progress_at: None,
        estimated_completion_at: None,
        created_at: now,
        in_progress_at: None,
        finalized_at: None,
        completed_at: None,
        expires_at: now + window,
        output_file_id: None,
        error_file_id: None,
        error_code: None,
        error_message: None,
    };
    state.db.insert_job(&job).await.map_err(err)?;
    state.metrics.transition("validating");

    let position = state.db.queue_position(&job).await.map_err(err)?;
    tracing::info!(
        batch_id = %job.id,
        input_file_id = %job.input_file_id,
        model = %job.model,
        priority = job.priority,
        total = job.total_requests,
        queue_position = position,
        "batch created"
    );

    Ok((rate_headers(&decision), Json(BatchObject::from_job(&job, Some(position)))))
}

/// "24h" / "48h" / "7d" → duration
fn parse_completion_window(window: &str) -> Option<Duration> {
    let (value, unit) = window.split_at(window.len().checked_sub(1)?);
    let value: i64 = value.parse().ok()?;
    if value <= 0 {
        return None;
    }
    match unit {
        "h" => Some(Duration::hours(value)),
        "d" => Some(Duration::days(value)),
        _ => None,
    }
}

/// Fetch one batch
async fn get_batch(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .db
        .get_job(&id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&rid.0))?
        .ok_or_else(|| {
            ApiError::new(ErrorCode::NotFound, format!("batch {} not found", id))
                .with_request_id(&rid.0)
        })?;

    let position = if job.status() == BatchStatus::Validating {
        Some(
            state
                .db
                .queue_position(&job)
                .await
                .map_err(|e| ApiError::from(e).with_request_id(&rid.0))?,
        )
    } else {
        None
    };
    Ok(Json(BatchObject::from_job(&job, position)))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    after: Option<String>,
    limit: Option<i64>,
}

/// List batches, newest first, with an opaque cursor
async fn list_batches(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    let jobs = state
        .db
        .list_jobs(query.after.as_deref(), limit)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&rid.0))?;

    let has_more = jobs.len() as i64 == limit;
    let last_id = jobs.last().map(|j| j.id.clone());
    let data = jobs.iter().map(|j| BatchObject::from_job(j, None)).collect();
    Ok(Json(BatchList { object: "list".to_string(), data, has_more, last_id }))
}

/// Request cancellation
async fn cancel_batch(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .db
        .request_cancel(&id, Utc::now())
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&rid.0))?;

    state.metrics.transition(job.status().as_str());
    tracing::info!(batch_id = %id, status = %job.status(), "cancel requested");
    Ok(Json(BatchObject::from_job(&job, None)))
}
