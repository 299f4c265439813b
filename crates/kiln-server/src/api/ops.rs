//! Operational routes: queue view, health, metrics, maintenance

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::Utc;

use kiln_core::models::wire::{
    GpuView, HealthView, MaintenanceRequest, QueueJobView, QueueView, QueueWorkerView,
};

use crate::error::ApiError;
use crate::middleware::RequestId;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/queue", get(queue_view))
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .route("/admin/maintenance", post(set_maintenance))
}

/// Monitoring view: worker liveness plus every non-terminal job
async fn queue_view(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
) -> Result<impl IntoResponse, ApiError> {
    let err = |e: kiln_core::Error| ApiError::from(e).with_request_id(&rid.0);
    let now = Utc::now();

    let worker = match state.db.latest_heartbeat().await.map_err(err)? {
        Some(hb) => QueueWorkerView {
            status: hb.status.clone(),
            last_seen: Some(hb.last_seen.timestamp()),
            loaded_model: hb.loaded_model.clone(),
        },
        None => QueueWorkerView { status: "down".to_string(), last_seen: None, loaded_model: None },
    };

    let jobs = state
        .db
        .active_jobs()
        .await
        .map_err(err)?
        .iter()
        .map(|j| QueueJobView {
            batch_id: j.id.clone(),
            status: j.status.clone(),
            progress_pct: j.progress() * 100.0,
            throughput: j.throughput_tokens_per_s,
            eta_seconds: j
                .estimated_completion_at
                .map(|eta| (eta - now).num_seconds().max(0)),
        })
        .collect();

    Ok(Json(QueueView { worker, jobs }))
}

/// Liveness summary for load balancers and dashboards
async fn health(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
) -> Result<impl IntoResponse, ApiError> {
    let err = |e: kiln_core::Error| ApiError::from(e).with_request_id(&rid.0);
    let now = Utc::now();

    let hb = state.db.latest_heartbeat().await.map_err(err)?;
    let (age, gpu) = match &hb {
        Some(hb) => (
            Some(hb.age_seconds(now)),
            GpuView { memory_pct: hb.gpu_memory_pct(), temperature_c: hb.gpu_temperature_c },
        ),
        None => (None, GpuView::default()),
    };

    let healthy = age.map(|a| a <= state.cfg.heartbeat_stale_s).unwrap_or(false)
        && gpu
            .memory_pct
            .map(|m| m < state.cfg.gpu_memory_pct_limit)
            .unwrap_or(true)
        && gpu
            .temperature_c
            .map(|t| t < state.cfg.gpu_temperature_c_limit)
            .unwrap_or(true);

    Ok(Json(HealthView {
        status: if healthy { "healthy" } else { "degraded" }.to_string(),
        worker_heartbeat_age_s: age,
        gpu,
    }))
}

/// Prometheus text exposition
async fn metrics_text(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
) -> Result<impl IntoResponse, ApiError> {
    let text = state
        .metrics
        .export()
        .map_err(|e| ApiError::from(e).with_request_id(&rid.0))?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        text,
    ))
}

/// Toggle maintenance mode
async fn set_maintenance(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    Json(req): Json<MaintenanceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let status = state
        .db
        .set_maintenance(req.enabled, req.reason.as_deref(), req.eta_minutes, Utc::now())
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&rid.0))?;
    tracing::info!(enabled = req.enabled, "maintenance mode toggled");
    Ok(Json(status))
}
