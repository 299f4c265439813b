//! API error responses
//!
//! Every 4xx/5xx carries `{error: {code, message, request_id}}` with a code
//! from the stable taxonomy. Internal errors are logged with context and
//! never leak details to the client.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use kiln_core::{Error, ErrorCode};

#[derive(Debug)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    pub request_id: Option<String>,
    /// Extra response headers (rate-limit hints)
    pub headers: Vec<(&'static str, String)>,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: ErrorDetail<'a>,
}

#[derive(Serialize)]
struct ErrorDetail<'a> {
    code: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_id: Option<&'a str>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), request_id: None, headers: Vec::new() }
    }

    pub fn with_request_id(mut self, request_id: &str) -> Self {
        self.request_id = Some(request_id.to_string());
        self
    }

    /// 429 with the standard rate-limit headers and a Retry-After hint.
    pub fn rate_limited(decision: &crate::ratelimit::RateDecision) -> Self {
        let mut err = Self::new(ErrorCode::RateLimited, "rate limit exceeded, slow down");
        err.headers = vec![
            ("x-ratelimit-limit", decision.limit.to_string()),
            ("x-ratelimit-remaining", decision.remaining.to_string()),
            ("x-ratelimit-reset", decision.reset_s.to_string()),
            ("retry-after", decision.reset_s.to_string()),
        ];
        err
    }

    pub fn status(&self) -> StatusCode {
        match self.code {
            ErrorCode::ValidationError
            | ErrorCode::ModelMismatchInBatch
            | ErrorCode::DuplicateCustomId => StatusCode::BAD_REQUEST,
            ErrorCode::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ErrorCode::NotFound | ErrorCode::FileMissing => StatusCode::NOT_FOUND,
            ErrorCode::FileInUse | ErrorCode::AlreadyTerminal => StatusCode::CONFLICT,
            ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::MaintenanceMode
            | ErrorCode::QueueFull
            | ErrorCode::GpuUnhealthy
            | ErrorCode::InsufficientMemory
            | ErrorCode::ModelLoadFailed => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let code = err.code();
        let message = match code {
            // Never leak internals to clients
            ErrorCode::InternalError => {
                tracing::error!(error = %err, "internal error");
                "internal error".to_string()
            }
            _ => err.to_string(),
        };
        Self { code, message, request_id: None, headers: Vec::new() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(ErrorBody {
            error: ErrorDetail {
                code: self.code.as_str(),
                message: &self.message,
                request_id: self.request_id.as_deref(),
            },
        });
        let mut resp = (status, body).into_response();
        for (name, value) in &self.headers {
            if let Ok(v) = axum::http::HeaderValue::from_str(value) {
                resp.headers_mut().insert(*name, v);
            }
        }
        resp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ApiError::new(ErrorCode::ValidationError, "x").status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::new(ErrorCode::TooLarge, "x").status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(ApiError::new(ErrorCode::NotFound, "x").status(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::new(ErrorCode::AlreadyTerminal, "x").status(), StatusCode::CONFLICT);
        assert_eq!(ApiError::new(ErrorCode::RateLimited, "x").status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(ApiError::new(ErrorCode::QueueFull, "x").status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ApiError::new(ErrorCode::InternalError, "x").status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_internal_errors_are_redacted() {
        let api: ApiError = Error::internal("sqlite file is corrupt at /secret/path").into();
        assert_eq!(api.message, "internal error");
    }
}
