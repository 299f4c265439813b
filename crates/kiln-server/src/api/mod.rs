//! API module - Axum routes

pub mod batches;
pub mod files;
pub mod ops;

use axum::http::HeaderMap;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::middleware::{assign_request_id, track_metrics};
use crate::ratelimit::RateDecision;
use crate::state::AppState;

/// Create the API router with all routes
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .nest("/v1/files", files::routes())
        .nest("/v1/batches", batches::routes())
        .merge(ops::routes())
        .layer(axum::middleware::from_fn_with_state(state.metrics.clone(), track_metrics))
        .layer(axum::middleware::from_fn(assign_request_id))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Rate-limit headers attached to allowed responses on limited routes.
pub(crate) fn rate_headers(decision: &RateDecision) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in [
        ("x-ratelimit-limit", decision.limit.to_string()),
        ("x-ratelimit-remaining", decision.remaining.to_string()),
        ("x-ratelimit-reset", decision.reset_s.to_string()),
    ] {
        if let Ok(v) = value.parse() {
            headers.insert(name, v);
        }
    }
    headers
}
