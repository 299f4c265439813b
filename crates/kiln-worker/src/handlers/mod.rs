//! Result-handler pipeline
//!
//! After a batch completes, registered handlers run sequentially in
//! registration order with bounded retry and at-least-once delivery.
//! Handlers never touch the job row; a failing handler is logged and
//! counted, and the next one still runs.

pub mod import;
pub mod webhook;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use kiln_core::models::BatchJob;
use kiln_core::{BlobStore, Config, Metrics};

pub use import::ImportHandler;
pub use webhook::WebhookHandler;

/// What a handler attempt produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    Ok,
    /// Transient failure; the pipeline retries with backoff
    Retryable(String),
    /// Definitive failure; no more attempts
    Permanent(String),
}

/// Everything a handler may look at. Results are read from the published
/// output blob; handlers never see the job store.
pub struct HandlerContext<'a> {
    pub job: &'a BatchJob,
    pub metadata: &'a HashMap<String, String>,
    pub blobs: &'a BlobStore,
    /// Blob ref of the published output file
    pub output_blob_ref: &'a str,
    pub output_file_id: &'a str,
    pub error_file_id: Option<&'a str>,
}

/// A post-completion side effect.
#[async_trait]
pub trait ResultHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Per-job opt-in; metadata is the client's opaque map.
    fn enabled(&self, _metadata: &HashMap<String, String>) -> bool {
        true
    }

    async fn handle(&self, ctx: &HandlerContext<'_>) -> HandlerOutcome;
}

/// Ordered handler pipeline with bounded full-jitter retry.
pub struct HandlerPipeline {
    handlers: Vec<Arc<dyn ResultHandler>>,
    max_attempts: u32,
    backoff_base_ms: u64,
    metrics: Metrics,
}

impl HandlerPipeline {
    pub fn new(handlers: Vec<Arc<dyn ResultHandler>>, cfg: &Config, metrics: Metrics) -> Self {
        Self {
            handlers,
            max_attempts: cfg.handler_max_attempts.max(1),
            backoff_base_ms: cfg.handler_backoff_base_ms,
            metrics,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run every enabled handler in order. Never fails: outcomes are
    /// recorded in logs and metrics only.
    pub async fn run(&self, ctx: &HandlerContext<'_>) {
        for handler in &self.handlers {
            if !handler.enabled(ctx.metadata) {
                tracing::debug!(
                    batch_id = %ctx.job.id,
                    handler = handler.name(),
                    "handler disabled for this job"
                );
                continue;
            }
            self.run_one(handler.as_ref(), ctx).await;
        }
    }

    async fn run_one(&self, handler: &dyn ResultHandler, ctx: &HandlerContext<'_>) {
        for attempt in 1..=self.max_attempts {
            match handler.handle(ctx).await {
                HandlerOutcome::Ok => {
                    tracing::info!(
                        batch_id = %ctx.job.id,
                        handler = handler.name(),
                        attempt,
                        "handler delivered"
                    );
                    self.metrics
                        .handler_outcomes
                        .with_label_values(&[handler.name(), "ok"])
                        .inc();
                    return;
                }
                HandlerOutcome::Permanent(reason) => {
                    tracing::warn!(
                        batch_id = %ctx.job.id,
                        handler = handler.name(),
                        attempt,
                        reason = %reason,
                        "handler failed permanently"
                    );
                    self.metrics
                        .handler_outcomes
                        .with_label_values(&[handler.name(), "permanent"])
                        .inc();
                    return;
                }
                HandlerOutcome::Retryable(reason) => {
                    self.metrics
                        .handler_outcomes
                        .with_label_values(&[handler.name(), "retryable"])
                        .inc();
                    if attempt == self.max_attempts {
                        tracing::warn!(
                            batch_id = %ctx.job.id,
                            handler = handler.name(),
                            attempt,
                            reason = %reason,
                            "handler exhausted retries"
                        );
                        self.metrics
                            .handler_outcomes
                            .with_label_values(&[handler.name(), "exhausted"])
                            .inc();
                        return;
                    }
                    let delay = self.jittered_backoff(attempt);
                    tracing::info!(
                        batch_id = %ctx.job.id,
                        handler = handler.name(),
                        attempt,
                        reason = %reason,
                        delay_ms = delay.as_millis() as u64,
                        "handler attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Full jitter: uniform in [0, base * 2^(attempt-1)].
    fn jittered_backoff(&self, attempt: u32) -> Duration {
        let ceiling = self.backoff_base_ms.saturating_mul(1u64 << (attempt - 1).min(16));
        let ms = rand::thread_rng().gen_range(0..=ceiling.max(1));
        Duration::from_millis(ms)
    }
}

/// The handlers compiled into this build, in invocation order. Adding a
/// handler is a source change here, not a runtime discovery mechanism.
pub fn default_handlers(cfg: &Config) -> Vec<Arc<dyn ResultHandler>> {
    let mut handlers: Vec<Arc<dyn ResultHandler>> = Vec::new();
    if let (Some(url), Some(secret)) = (&cfg.webhook_url, &cfg.webhook_secret) {
        handlers.push(Arc::new(WebhookHandler::new(
            url.clone(),
            secret.clone(),
            Duration::from_secs(cfg.webhook_timeout_s),
        )));
    }
    if let Some(url) = &cfg.import_url {
        handlers.push(Arc::new(ImportHandler::new(url.clone())));
    }
    handlers
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    struct Scripted {
        calls: AtomicU32,
        fail_first: u32,
        permanent: bool,
    }

    #[async_trait]
    impl ResultHandler for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn handle(&self, _ctx: &HandlerContext<'_>) -> HandlerOutcome {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.permanent {
                HandlerOutcome::Permanent("no".into())
            } else if n <= self.fail_first {
                HandlerOutcome::Retryable("later".into())
            } else {
                HandlerOutcome::Ok
            }
        }
    }

    fn test_job() -> BatchJob {
        let now = Utc::now();
        BatchJob {
            id: "batch-t".into(),
            input_file_id: "file-in".into(),
            endpoint: "/v1/chat/completions".into(),
            completion_window: "24h".into(),
            model: "m".into(),
            priority: 0,
            metadata: None,
            status: "completed".into(),
            worker_id: Some("w1".into()),
            total_requests: 1,
            completed_requests: 1,
            failed_requests: 0,
            tokens_processed: 10,
            throughput_tokens_per_s: None,
            last_progress_at: None,
            estimated_completion_at: None,
            created_at: now,
            in_progress_at: Some(now),
            finalized_at: Some(now),
            completed_at: Some(now),
            expires_at: now,
            output_file_id: Some("file-out".into()),
            error_file_id: None,
            error_code: None,
            error_message: None,
        }
    }

    async fn run_pipeline(handler: Arc<Scripted>, max_attempts: u32) -> u32 {
        let dir = TempDir::new().unwrap();
        let blobs = BlobStore::open(dir.path().join("blobs")).unwrap();
        let mut cfg = Config::default();
        cfg.handler_max_attempts = max_attempts;
        cfg.handler_backoff_base_ms = 1;
        let metrics = Metrics::new().unwrap();
        let pipeline = HandlerPipeline::new(vec![handler.clone()], &cfg, metrics);

        let job = test_job();
        let metadata = HashMap::new();
        let ctx = HandlerContext {
            job: &job,
            metadata: &metadata,
            blobs: &blobs,
            output_blob_ref: "none",
            output_file_id: "file-out",
            error_file_id: None,
        };
        pipeline.run(&ctx).await;
        handler.calls.load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn test_retryable_then_ok_stops_retrying() {
        let h = Arc::new(Scripted { calls: AtomicU32::new(0), fail_first: 2, permanent: false });
        // 500 twice then 200: exactly three attempts
        assert_eq!(run_pipeline(h, 3).await, 3);
    }

    #[tokio::test]
    async fn test_retries_exhaust_at_max_attempts() {
        let h = Arc::new(Scripted { calls: AtomicU32::new(0), fail_first: 99, permanent: false });
        assert_eq!(run_pipeline(h, 3).await, 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_stops_immediately() {
        let h = Arc::new(Scripted { calls: AtomicU32::new(0), fail_first: 0, permanent: true });
        assert_eq!(run_pipeline(h, 3).await, 1);
    }

    #[test]
    fn test_default_handlers_respect_config() {
        let cfg = Config::default();
        assert!(default_handlers(&cfg).is_empty());

        let mut cfg = Config::default();
        cfg.webhook_url = Some("http://example.test/hook".into());
        cfg.webhook_secret = Some("s3cret".into());
        cfg.import_url = Some("http://example.test/import".into());
        let handlers = default_handlers(&cfg);
        assert_eq!(handlers.len(), 2);
        assert_eq!(handlers[0].name(), "webhook");
        assert_eq!(handlers[1].name(), "downstream_import");
    }
}
