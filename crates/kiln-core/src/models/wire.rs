//! OpenAI-compatible wire shapes
//!
//! Request/response bodies for the HTTP surface and the JSONL line formats.
//! Timestamps go out as Unix seconds; unknown request-body fields are kept
//! verbatim and forwarded to the engine untouched.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{BatchJob, FileRecord};

// ============================================================================
// Files
// ============================================================================

/// `GET /v1/files/{id}` / `POST /v1/files` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileObject {
    pub id: String,
    pub object: String,
    pub bytes: i64,
    pub created_at: i64,
    pub filename: String,
    pub purpose: String,
}

impl From<&FileRecord> for FileObject {
    fn from(f: &FileRecord) -> Self {
        Self {
            id: f.id.clone(),
            object: "file".to_string(),
            bytes: f.bytes,
            created_at: f.created_at.timestamp(),
            filename: f.filename.clone(),
            purpose: f.purpose.clone(),
        }
    }
}

/// `DELETE /v1/files/{id}` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDeleted {
    pub id: String,
    pub object: String,
    pub deleted: bool,
}

// ============================================================================
// Batches
// ============================================================================

/// `POST /v1/batches` request body
#[derive(Debug, Clone, Deserialize)]
pub struct CreateBatchRequest {
    pub input_file_id: String,
    pub endpoint: String,
    pub completion_window: String,
    pub metadata: Option<HashMap<String, String>>,
}

/// Request counts block of the batch object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestCounts {
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
}

/// Error block of the batch object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchError {
    pub code: String,
    pub message: String,
}

/// The batch object returned by every batch endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchObject {
    pub id: String,
    pub object: String,
    pub endpoint: String,
    pub input_file_id: String,
    pub completion_window: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_file_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_file_id: Option<String>,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_progress_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finalized_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    pub expires_at: i64,
    pub request_counts: RequestCounts,
    pub metadata: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<BatchError>,
    /// Non-standard: tokens per second over recent chunks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub throughput_tokens_per_s: Option<f64>,
    /// Non-standard: projected completion time, Unix seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_completion_at: Option<i64>,
    /// Non-standard: position among queued jobs, present while validating
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<i64>,
}

impl BatchObject {
    pub fn from_job(job: &BatchJob, queue_position: Option<i64>) -> Self {
        let error = match (&job.error_code, &job.error_message) {
            (Some(code), Some(message)) => Some(BatchError {
                code: code.clone(),
                message: message.clone(),
            }),
            (Some(code), None) => Some(BatchError {
                code: code.clone(),
                message: String::new(),
            }),
            _ => None,
        };
        Self {
            id: job.id.clone(),
            object: "batch".to_string(),
            endpoint: job.endpoint.clone(),
            input_file_id: job.input_file_id.clone(),
            completion_window: job.completion_window.clone(),
            status: job.status.clone(),
            output_file_id: job.output_file_id.clone(),
            error_file_id: job.error_file_id.clone(),
            created_at: job.created_at.timestamp(),
            in_progress_at: job.in_progress_at.map(|t| t.timestamp()),
            finalized_at: job.finalized_at.map(|t| t.timestamp()),
            completed_at: job.completed_at.map(|t| t.timestamp()),
            expires_at: job.expires_at.timestamp(),
            request_counts: RequestCounts {
                total: job.total_requests,
                completed: job.completed_requests,
                failed: job.failed_requests,
            },
            metadata: job.metadata_map(),
            error,
            throughput_tokens_per_s: job.throughput_tokens_per_s,
            estimated_completion_at: job.estimated_completion_at.map(|t| t.timestamp()),
            queue_position,
        }
    }
}

/// `GET /v1/batches` response
#[derive(Debug, Clone, Serialize)]
pub struct BatchList {
    pub object: String,
    pub data: Vec<BatchObject>,
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_id: Option<String>,
}

// ============================================================================
// Input lines
// ============================================================================

/// One chat message of the request body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// The chat-completions request body carried by an input line. Fields we
/// do not interpret ride along in `extra` and reach the engine verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatBody {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// One line of a batch input file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequestLine {
    pub custom_id: String,
    pub method: String,
    pub url: String,
    pub body: ChatBody,
}

// ============================================================================
// Output lines
// ============================================================================

/// Usage block mirrored from the engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

/// Per-line error on the output file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineError {
    pub code: String,
    pub message: String,
}

/// `response` block of an output line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineResponse {
    pub status_code: u16,
    pub body: serde_json::Value,
}

/// One line of a batch output file, in input order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResultLine {
    pub custom_id: String,
    pub response: Option<LineResponse>,
    pub error: Option<LineError>,
}

impl BatchResultLine {
    /// A successful completion in chat-completions response shape.
    pub fn ok(custom_id: String, content: String, usage: Usage) -> Self {
        let body = serde_json::json!({
            "choices": [{
                "message": { "role": "assistant", "content": content }
            }],
            "usage": {
                "prompt_tokens": usage.prompt_tokens,
                "completion_tokens": usage.completion_tokens,
                "total_tokens": usage.total_tokens,
            },
        });
        Self {
            custom_id,
            response: Some(LineResponse { status_code: 200, body }),
            error: None,
        }
    }

    pub fn err(custom_id: String, code: String, message: String) -> Self {
        Self {
            custom_id,
            response: None,
            error: Some(LineError { code, message }),
        }
    }
}

/// One line of the aggregated errors file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorFileLine {
    pub custom_id: String,
    pub error: ErrorFileDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorFileDetail {
    pub code: String,
    pub message: String,
    pub attempt_count: i64,
}

// ============================================================================
// Monitoring
// ============================================================================

/// `GET /v1/queue` response
#[derive(Debug, Clone, Serialize)]
pub struct QueueView {
    pub worker: QueueWorkerView,
    pub jobs: Vec<QueueJobView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueWorkerView {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loaded_model: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueJobView {
    pub batch_id: String,
    pub status: String,
    pub progress_pct: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub throughput: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<i64>,
}

/// `GET /health` response
#[derive(Debug, Clone, Serialize)]
pub struct HealthView {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_heartbeat_age_s: Option<i64>,
    pub gpu: GpuView,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GpuView {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature_c: Option<f64>,
}

/// `POST /admin/maintenance` request body
#[derive(Debug, Clone, Deserialize)]
pub struct MaintenanceRequest {
    pub enabled: bool,
    pub reason: Option<String>,
    pub eta_minutes: Option<i64>,
}

/// Webhook payload delivered on batch completion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub event: String,
    pub batch_id: String,
    pub output_file_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_file_id: Option<String>,
    pub counts: RequestCounts,
    pub metadata: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_line_keeps_unknown_body_fields() {
        let raw = r#"{"custom_id":"a","method":"POST","url":"/v1/chat/completions","body":{"model":"m","messages":[{"role":"user","content":"hi"}],"seed":42}}"#;
        let line: BatchRequestLine = serde_json::from_str(raw).unwrap();
        assert_eq!(line.body.extra.get("seed"), Some(&serde_json::json!(42)));

        let out = serde_json::to_value(&line).unwrap();
        assert_eq!(out["body"]["seed"], serde_json::json!(42));
    }

    #[test]
    fn test_result_line_ok_shape() {
        let line = BatchResultLine::ok(
            "a".into(),
            "hello".into(),
            Usage { prompt_tokens: 3, completion_tokens: 2, total_tokens: 5 },
        );
        let v = serde_json::to_value(&line).unwrap();
        assert_eq!(v["response"]["status_code"], 200);
        assert_eq!(v["response"]["body"]["choices"][0]["message"]["content"], "hello");
        assert_eq!(v["response"]["body"]["usage"]["total_tokens"], 5);
        assert!(v["error"].is_null());
    }

    #[test]
    fn test_result_line_err_shape() {
        let line = BatchResultLine::err("b".into(), "inference_error".into(), "oom".into());
        let v = serde_json::to_value(&line).unwrap();
        assert!(v["response"].is_null());
        assert_eq!(v["error"]["code"], "inference_error");
    }
}
