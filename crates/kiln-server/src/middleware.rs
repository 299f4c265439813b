//! Request middleware: request ids and per-endpoint metrics

use axum::extract::{MatchedPath, Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use tracing::Instrument;

use kiln_core::Metrics;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Opaque id assigned to every request, stored in request extensions and
/// echoed back in `X-Request-ID`.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

pub async fn assign_request_id(mut req: Request, next: Next) -> Response {
    let id = uuid::Uuid::new_v4().to_string();
    req.extensions_mut().insert(RequestId(id.clone()));

    let span = tracing::info_span!(
        "request",
        request_id = %id,
        method = %req.method(),
        path = %req.uri().path(),
    );
    let mut resp = next.run(req).instrument(span).await;

    if let Ok(value) = HeaderValue::from_str(&id) {
        resp.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    resp
}

/// Count and time every request against its matched route.
pub async fn track_metrics(State(metrics): State<Metrics>, req: Request, next: Next) -> Response {
    let endpoint = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let method = req.method().to_string();

    let started = std::time::Instant::now();
    let resp = next.run(req).await;
    let elapsed = started.elapsed().as_secs_f64();

    let status = match resp.status().as_u16() {
        s if s < 300 => "2xx",
        s if s < 400 => "3xx",
        s if s < 500 => "4xx",
        _ => "5xx",
    };
    metrics
        .http_requests
        .with_label_values(&[endpoint.as_str(), method.as_str(), status])
        .inc();
    metrics
        .http_latency
        .with_label_values(&[endpoint.as_str()])
        .observe(elapsed);

    resp
}
