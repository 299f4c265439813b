//! Service configuration
//!
//! Every tunable has a compiled-in default and a `KILN_*` environment
//! override. The binary layers clap args on top of `Config::from_env()`.

use std::path::PathBuf;

use crate::error::{Error, Result};

/// Runtime configuration shared by the API and the worker.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the SQLite database and the blob store
    pub data_dir: PathBuf,
    /// API bind address
    pub bind_addr: String,
    /// Base URL of the inference engine daemon
    pub engine_url: String,
    /// Stable identity of this worker process
    pub worker_id: String,

    /// Worker loop cadence in seconds
    pub poll_interval_s: u64,
    /// Default lines per Engine.generate call
    pub chunk_size_default: usize,
    /// Floor for adaptive chunk shrinking
    pub chunk_size_min: usize,
    /// Heartbeat emission cadence in seconds
    pub heartbeat_interval_s: u64,
    /// Heartbeats older than this are treated as worker-down
    pub heartbeat_stale_s: i64,

    /// Maximum number of non-terminal jobs admitted
    pub max_queue_depth: i64,
    /// Maximum requests in one input file
    pub max_requests_per_job: usize,
    /// Maximum input file size in bytes
    pub max_file_bytes: u64,

    /// GPU memory usage percentage above which admission/pre-flight fails
    pub gpu_memory_pct_limit: f64,
    /// GPU temperature above which admission/pre-flight fails
    pub gpu_temperature_c_limit: f64,

    /// Attempts per result handler
    pub handler_max_attempts: u32,
    /// Base backoff between handler attempts, milliseconds
    pub handler_backoff_base_ms: u64,

    /// Create-batch requests allowed per IP per minute
    pub rate_limit_batches_per_min: u32,
    /// File uploads allowed per IP per minute
    pub rate_limit_files_per_min: u32,
    /// Trust X-Forwarded-For when resolving the client IP
    pub trust_forwarded_for: bool,

    /// Webhook target URL; handler disabled when unset
    pub webhook_url: Option<String>,
    /// Shared secret for the webhook signature header
    pub webhook_secret: Option<String>,
    /// Per-attempt webhook timeout in seconds
    pub webhook_timeout_s: u64,
    /// Downstream import API base URL; handler disabled when unset
    pub import_url: Option<String>,

    /// Retention window for worker-produced output/error files, days
    pub output_retention_days: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            bind_addr: "127.0.0.1:8440".to_string(),
            engine_url: "http://127.0.0.1:8441".to_string(),
            worker_id: format!("worker-{}", hostname()),
            poll_interval_s: 5,
            chunk_size_default: 5000,
            chunk_size_min: 500,
            heartbeat_interval_s: 5,
            heartbeat_stale_s: 60,
            max_queue_depth: 100,
            max_requests_per_job: 50_000,
            max_file_bytes: 200 * 1024 * 1024,
            gpu_memory_pct_limit: 95.0,
            gpu_temperature_c_limit: 85.0,
            handler_max_attempts: 3,
            handler_backoff_base_ms: 500,
            rate_limit_batches_per_min: 10,
            rate_limit_files_per_min: 20,
            trust_forwarded_for: false,
            webhook_url: None,
            webhook_secret: None,
            webhook_timeout_s: 10,
            import_url: None,
            output_retention_days: 30,
        }
    }
}

impl Config {
    /// Build a config from defaults plus `KILN_*` environment overrides.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Config::default();

        if let Ok(v) = std::env::var("KILN_DATA_DIR") {
            cfg.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("KILN_BIND_ADDR") {
            cfg.bind_addr = v;
        }
        if let Ok(v) = std::env::var("KILN_ENGINE_URL") {
            cfg.engine_url = v;
        }
        if let Ok(v) = std::env::var("KILN_WORKER_ID") {
            cfg.worker_id = v;
        }
        if let Ok(v) = std::env::var("KILN_POLL_INTERVAL_S") {
            cfg.poll_interval_s = parse(&v, "KILN_POLL_INTERVAL_S")?;
        }
        if let Ok(v) = std::env::var("KILN_CHUNK_SIZE_DEFAULT") {
            cfg.chunk_size_default = parse(&v, "KILN_CHUNK_SIZE_DEFAULT")?;
        }
        if let Ok(v) = std::env::var("KILN_CHUNK_SIZE_MIN") {
            cfg.chunk_size_min = parse(&v, "KILN_CHUNK_SIZE_MIN")?;
        }
        if let Ok(v) = std::env::var("KILN_MAX_QUEUE_DEPTH") {
            cfg.max_queue_depth = parse(&v, "KILN_MAX_QUEUE_DEPTH")?;
        }
        if let Ok(v) = std::env::var("KILN_MAX_REQUESTS_PER_JOB") {
            cfg.max_requests_per_job = parse(&v, "KILN_MAX_REQUESTS_PER_JOB")?;
        }
        if let Ok(v) = std::env::var("KILN_MAX_FILE_BYTES") {
            cfg.max_file_bytes = parse(&v, "KILN_MAX_FILE_BYTES")?;
        }
        if let Ok(v) = std::env::var("KILN_GPU_MEMORY_PCT_LIMIT") {
            cfg.gpu_memory_pct_limit = parse(&v, "KILN_GPU_MEMORY_PCT_LIMIT")?;
        }
        if let Ok(v) = std::env::var("KILN_GPU_TEMPERATURE_C_LIMIT") {
            cfg.gpu_temperature_c_limit = parse(&v, "KILN_GPU_TEMPERATURE_C_LIMIT")?;
        }
        if let Ok(v) = std::env::var("KILN_HANDLER_MAX_ATTEMPTS") {
            cfg.handler_max_attempts = parse(&v, "KILN_HANDLER_MAX_ATTEMPTS")?;
        }
        if let Ok(v) = std::env::var("KILN_HANDLER_BACKOFF_BASE_MS") {
            cfg.handler_backoff_base_ms = parse(&v, "KILN_HANDLER_BACKOFF_BASE_MS")?;
        }
        if let Ok(v) = std::env::var("KILN_RATE_LIMIT_BATCHES_PER_MIN") {
            cfg.rate_limit_batches_per_min = parse(&v, "KILN_RATE_LIMIT_BATCHES_PER_MIN")?;
        }
        if let Ok(v) = std::env::var("KILN_RATE_LIMIT_FILES_PER_MIN") {
            cfg.rate_limit_files_per_min = parse(&v, "KILN_RATE_LIMIT_FILES_PER_MIN")?;
        }
        if let Ok(v) = std::env::var("KILN_TRUST_FORWARDED_FOR") {
            cfg.trust_forwarded_for = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("KILN_WEBHOOK_URL") {
            cfg.webhook_url = Some(v);
        }
        if let Ok(v) = std::env::var("KILN_WEBHOOK_SECRET") {
            cfg.webhook_secret = Some(v);
        }
        if let Ok(v) = std::env::var("KILN_WEBHOOK_TIMEOUT_S") {
            cfg.webhook_timeout_s = parse(&v, "KILN_WEBHOOK_TIMEOUT_S")?;
        }
        if let Ok(v) = std::env::var("KILN_IMPORT_URL") {
            cfg.import_url = Some(v);
        }

        Ok(cfg)
    }

    /// Path of the SQLite database file
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("kiln.db")
    }

    /// Root directory of the blob store
    pub fn blob_dir(&self) -> PathBuf {
        self.data_dir.join("blobs")
    }
}

fn parse<T: std::str::FromStr>(v: &str, key: &str) -> Result<T> {
    v.parse()
        .map_err(|_| Error::config(format!("invalid value for {}: {}", key, v)))
}

/// Default data directory: platform app-data dir, like the database path
/// resolution in the rest of the stack.
fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("dev", "kiln", "Kiln")
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("./kiln-data"))
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.poll_interval_s, 5);
        assert_eq!(cfg.chunk_size_default, 5000);
        assert_eq!(cfg.chunk_size_min, 500);
        assert_eq!(cfg.max_queue_depth, 100);
        assert_eq!(cfg.max_requests_per_job, 50_000);
        assert_eq!(cfg.rate_limit_batches_per_min, 10);
        assert_eq!(cfg.rate_limit_files_per_min, 20);
        assert_eq!(cfg.handler_max_attempts, 3);
    }

    #[test]
    fn test_db_path_under_data_dir() {
        let mut cfg = Config::default();
        cfg.data_dir = PathBuf::from("/tmp/kiln-test");
        assert_eq!(cfg.db_path(), PathBuf::from("/tmp/kiln-test/kiln.db"));
        assert_eq!(cfg.blob_dir(), PathBuf::from("/tmp/kiln-test/blobs"));
    }
}
