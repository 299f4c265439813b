//! Data models for the kiln batch service
//!
//! Row structs map 1:1 onto the SQLite schema; statuses are stored as TEXT
//! and converted through the enums here. Wire-facing (OpenAI-compatible)
//! shapes live in [`wire`], input-file validation in [`jsonl`].

pub mod jsonl;
pub mod wire;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ============================================================================
// Files
// ============================================================================

/// What an uploaded or produced blob is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilePurpose {
    BatchInput,
    BatchOutput,
    BatchErrors,
}

impl FilePurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilePurpose::BatchInput => "batch_input",
            FilePurpose::BatchOutput => "batch_output",
            FilePurpose::BatchErrors => "batch_errors",
        }
    }

    /// Parse a stored or client-supplied purpose. The public upload API
    /// accepts OpenAI's `batch` as an alias for `batch_input`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "batch" | "batch_input" => Some(FilePurpose::BatchInput),
            "batch_output" => Some(FilePurpose::BatchOutput),
            "batch_errors" => Some(FilePurpose::BatchErrors),
            _ => None,
        }
    }
}

/// An uploaded or worker-produced file. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FileRecord {
    pub id: String,
    pub purpose: String,
    pub filename: String,
    pub bytes: i64,
    /// Handle into the blob store
    pub blob_ref: String,
    /// Line count for JSONL payloads, cached at creation
    pub line_count: i64,
    /// For batch inputs: the single model shared by every line, derived at
    /// upload validation
    pub model: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl FileRecord {
    pub fn purpose(&self) -> Option<FilePurpose> {
        FilePurpose::parse(&self.purpose)
    }
}

// ============================================================================
// Batch jobs
// ============================================================================

/// Lifecycle state of a batch job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Validating,
    InProgress,
    Finalizing,
    Completed,
    Failed,
    Cancelling,
    Cancelled,
    Expired,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Validating => "validating",
            BatchStatus::InProgress => "in_progress",
            BatchStatus::Finalizing => "finalizing",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
            BatchStatus::Cancelling => "cancelling",
            BatchStatus::Cancelled => "cancelled",
            BatchStatus::Expired => "expired",
        }
    }

    /// Terminal statuses are monotonic: no transition leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Cancelled | BatchStatus::Expired
        )
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for BatchStatus {
    fn from(s: &str) -> Self {
        match s {
            "validating" => BatchStatus::Validating,
            "in_progress" => BatchStatus::InProgress,
            "finalizing" => BatchStatus::Finalizing,
            "completed" => BatchStatus::Completed,
            "failed" => BatchStatus::Failed,
            "cancelling" => BatchStatus::Cancelling,
            "cancelled" => BatchStatus::Cancelled,
            "expired" => BatchStatus::Expired,
            _ => BatchStatus::Validating,
        }
    }
}

/// A batch job row. The scheduling unit: one input file, one model, one
/// pass through the worker.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BatchJob {
    pub id: String,
    pub input_file_id: String,
    pub endpoint: String,
    pub completion_window: String,
    /// Denormalised from the input file for scheduling
    pub model: String,
    /// -1 test, 0 normal, 1 high
    pub priority: i64,
    /// Opaque client key/value map, JSON-encoded
    pub metadata: Option<String>,
    pub status: String,
    /// Worker that claimed the job; set at dequeue
    pub worker_id: Option<String>,

    pub total_requests: i64,
    pub completed_requests: i64,
    pub failed_requests: i64,
    pub tokens_processed: i64,

    pub throughput_tokens_per_s: Option<f64>,
    pub last_progress_at: Option<DateTime<Utc>>,
    pub estimated_completion_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub in_progress_at: Option<DateTime<Utc>>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,

    pub output_file_id: Option<String>,
    pub error_file_id: Option<String>,

    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl BatchJob {
    pub fn status(&self) -> BatchStatus {
        BatchStatus::from(self.status.as_str())
    }

    /// Parsed client metadata map
    pub fn metadata_map(&self) -> std::collections::HashMap<String, String> {
        self.metadata
            .as_deref()
            .and_then(|m| serde_json::from_str(m).ok())
            .unwrap_or_default()
    }

    /// Fraction of requests resolved so far, 0.0..=1.0
    pub fn progress(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        (self.completed_requests + self.failed_requests) as f64 / self.total_requests as f64
    }
}

/// Clamp a client-supplied priority into the supported band.
pub fn clamp_priority(p: i64) -> i64 {
    p.clamp(-1, 1)
}

// ============================================================================
// Failed requests
// ============================================================================

/// Classification of a per-request failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    Inference,
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Validation => "validation",
            FailureKind::Inference => "inference",
            FailureKind::Internal => "internal",
        }
    }
}

/// Dead-letter entry for a single input line. Survives the job for
/// post-mortem queries.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FailedRequest {
    pub id: String,
    pub batch_id: String,
    pub custom_id: String,
    pub request_index: i64,
    pub error_kind: String,
    pub error_message: String,
    pub attempt_count: i64,
    pub last_attempt_at: DateTime<Utc>,
}

// ============================================================================
// Worker heartbeat
// ============================================================================

/// What the worker is doing right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    LoadingModel,
    Processing,
    Draining,
    Error,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::LoadingModel => "loading_model",
            WorkerState::Processing => "processing",
            WorkerState::Draining => "draining",
            WorkerState::Error => "error",
        }
    }
}

/// Liveness record, one row per worker process, upserted every few seconds.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkerHeartbeat {
    pub worker_id: String,
    pub pid: i64,
    pub started_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub status: String,
    pub current_batch_id: Option<String>,
    pub loaded_model: Option<String>,
    pub model_loaded_at: Option<DateTime<Utc>>,
    pub gpu_memory_used_bytes: Option<i64>,
    pub gpu_memory_total_bytes: Option<i64>,
    pub gpu_temperature_c: Option<f64>,
    pub gpu_utilization_pct: Option<f64>,
}

impl WorkerHeartbeat {
    /// Age of this heartbeat relative to `now`, in seconds.
    pub fn age_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_seen).num_seconds()
    }

    /// GPU memory usage as a percentage, when both gauges are present.
    pub fn gpu_memory_pct(&self) -> Option<f64> {
        match (self.gpu_memory_used_bytes, self.gpu_memory_total_bytes) {
            (Some(used), Some(total)) if total > 0 => Some(used as f64 / total as f64 * 100.0),
            _ => None,
        }
    }
}

// ============================================================================
// System status
// ============================================================================

/// Singleton administrative state.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SystemStatus {
    pub maintenance_mode: bool,
    pub maintenance_reason: Option<String>,
    pub maintenance_started_at: Option<DateTime<Utc>>,
    pub maintenance_eta_minutes: Option<i64>,
}

impl Default for SystemStatus {
    fn default() -> Self {
        Self {
            maintenance_mode: false,
            maintenance_reason: None,
            maintenance_started_at: None,
            maintenance_eta_minutes: None,
        }
    }
}

// ============================================================================
// Identifiers
// ============================================================================

/// Opaque file identifier, `file-<hex>`
pub fn new_file_id() -> String {
    format!("file-{}", uuid::Uuid::new_v4().simple())
}

/// Opaque batch identifier, `batch-<hex>`
pub fn new_batch_id() -> String {
    format!("batch-{}", uuid::Uuid::new_v4().simple())
}
