//! Worker run loop
//!
//! A single long-running process that owns the accelerator: it claims one
//! job at a time, hot-swaps models between jobs, streams the input through
//! the engine in adaptive chunks, and appends results to a fsynced partial
//! output so a crash loses at most one chunk of work. Cancellation and
//! expiry are observed at chunk boundaries.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::sync::{watch, Mutex};

use kiln_core::db::ChunkProgress;
use kiln_core::error::{Error, ErrorCode, Result};
use kiln_core::models::jsonl;
use kiln_core::models::wire::{BatchResultLine, ErrorFileDetail, ErrorFileLine};
use kiln_core::models::{
    new_file_id, BatchJob, BatchStatus, FailedRequest, FailureKind, FilePurpose, FileRecord,
    WorkerHeartbeat, WorkerState,
};
use kiln_core::{BlobStore, Config, Database, Metrics};

use crate::chunking::{ChunkDecision, ChunkPolicy};
use crate::engine::{Engine, EngineHealth, GenerateOutcome, GenerateRequest};
use crate::handlers::{HandlerContext, HandlerPipeline};
use crate::registry::ModelRegistry;

/// Smoothing factor for the throughput EMA.
const THROUGHPUT_EMA_ALPHA: f64 = 0.3;
/// Pause after an unhealthy pre-flight before re-probing.
const BACKOFF_SLEEP: Duration = Duration::from_secs(5);

/// Fields the heartbeat timer publishes; shared between the loop and the
/// dedicated timer task.
#[derive(Debug, Clone)]
struct HeartbeatSnapshot {
    state: WorkerState,
    current_batch_id: Option<String>,
    loaded_model: Option<String>,
    model_loaded_at: Option<DateTime<Utc>>,
    gpu: Option<EngineHealth>,
}

pub struct Worker {
    db: Database,
    blobs: BlobStore,
    engine: Arc<dyn Engine>,
    registry: ModelRegistry,
    cfg: Config,
    metrics: Metrics,
    pipeline: HandlerPipeline,
    started_at: DateTime<Utc>,
    snapshot: Arc<Mutex<HeartbeatSnapshot>>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Database,
        blobs: BlobStore,
        engine: Arc<dyn Engine>,
        registry: ModelRegistry,
        cfg: Config,
        metrics: Metrics,
        pipeline: HandlerPipeline,
    ) -> Self {
        Self {
            db,
            blobs,
            engine,
            registry,
            cfg,
            metrics,
            pipeline,
            started_at: Utc::now(),
            snapshot: Arc::new(Mutex::new(HeartbeatSnapshot {
                state: WorkerState::Idle,
                current_batch_id: None,
                loaded_model: None,
                model_loaded_at: None,
                gpu: None,
            })),
        }
    }

    /// Run until `shutdown` flips true. On startup the worker announces
    /// itself, reclaims any job it owned before a crash, and enters the
    /// poll loop.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(worker_id = %self.cfg.worker_id, "worker starting");
        if let Err(e) = self.emit_heartbeat().await {
            tracing::warn!(worker_id = %self.cfg.worker_id, error = %e, "startup heartbeat failed");
        }
        self.spawn_heartbeat_timer(shutdown.clone());

        while !*shutdown.borrow() {
            self.refresh_gpu_snapshot().await;
            if let Err(e) = self.emit_heartbeat().await {
                tracing::warn!(worker_id = %self.cfg.worker_id, error = %e, "heartbeat failed");
            }
            self.update_queue_gauges().await;

            match self.next_job().await {
                Ok(Some(job)) => {
                    if let Err(e) = self.process_job(job.clone(), &mut shutdown).await {
                        // Leave the job in_progress: the resume path picks it
                        // up on the next iteration or after restart.
                        tracing::error!(
                            worker_id = %self.cfg.worker_id,
                            batch_id = %job.id,
                            error = %e,
                            "job processing interrupted"
                        );
                        self.sleep_or_shutdown(&mut shutdown, Duration::from_secs(self.cfg.poll_interval_s))
                            .await;
                    }
                    self.clear_current_batch().await;
                }
                Ok(None) => {
                    self.set_state(WorkerState::Idle).await;
                    self.sleep_or_shutdown(&mut shutdown, Duration::from_secs(self.cfg.poll_interval_s))
                        .await;
                }
                Err(e) => {
                    tracing::warn!(worker_id = %self.cfg.worker_id, error = %e, "dequeue failed");
                    self.sleep_or_shutdown(&mut shutdown, Duration::from_secs(self.cfg.poll_interval_s))
                        .await;
                }
            }
        }

        self.set_state(WorkerState::Draining).await;
        if let Err(e) = self.emit_heartbeat().await {
            tracing::warn!(worker_id = %self.cfg.worker_id, error = %e, "draining heartbeat failed");
        }
        tracing::info!(worker_id = %self.cfg.worker_id, "worker stopped");
    }

    /// Resume-first dequeue: own unfinished job, then an abandoned one from
    /// a stale worker, then the best validating job.
    async fn next_job(&self) -> Result<Option<BatchJob>> {
        if let Some(job) = self.db.resumable_job(&self.cfg.worker_id).await? {
            tracing::info!(
                worker_id = %self.cfg.worker_id,
                batch_id = %job.id,
                "resuming previously claimed job"
            );
            return Ok(Some(job));
        }

        let stale_before = Utc::now() - chrono::Duration::seconds(self.cfg.heartbeat_stale_s);
        if let Some(job) = self.db.adopt_stale_job(&self.cfg.worker_id, stale_before).await? {
            tracing::info!(
                worker_id = %self.cfg.worker_id,
                batch_id = %job.id,
                "adopted job from stale worker"
            );
            return Ok(Some(job));
        }

        let job = self.db.dequeue_next(&self.cfg.worker_id, Utc::now()).await?;
        if job.is_some() {
            self.metrics.transition("in_progress");
        }
        Ok(job)
    }

    // ------------------------------------------------------------------
    // Job processing
    // ------------------------------------------------------------------

    async fn process_job(&self, job: BatchJob, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        tracing::info!(
            worker_id = %self.cfg.worker_id,
            batch_id = %job.id,
            model = %job.model,
            total = job.total_requests,
            "processing batch job"
        );
        {
            let mut snap = self.snapshot.lock().await;
            snap.current_batch_id = Some(job.id.clone());
            snap.state = WorkerState::Processing;
        }

        // A cancel requested while we were away finishes immediately, and a
        // job that crashed mid-finalize jumps straight back to publication.
        if job.status() == BatchStatus::Cancelling {
            return self.finish_cancelled(&job).await;
        }
        if job.status() == BatchStatus::Finalizing {
            return self.finalize(&job).await;
        }

        if let Err(e) = self.ensure_model(&job).await {
            let (code, msg) = match &e {
                Error::InsufficientMemory(m) => (ErrorCode::InsufficientMemory, m.clone()),
                Error::GpuUnhealthy(m) => (ErrorCode::GpuUnhealthy, m.clone()),
                other => (ErrorCode::ModelLoadFailed, other.to_string()),
            };
            tracing::error!(batch_id = %job.id, code = %code, error = %msg, "model load failed");
            self.db.fail_job(&job.id, code, &msg, Utc::now()).await?;
            self.metrics.transition("failed");
            return Ok(());
        }

        let Some(input) = self.db.get_file(&job.input_file_id).await? else {
            self.db
                .fail_job(&job.id, ErrorCode::FileMissing, "input file row missing", Utc::now())
                .await?;
            self.metrics.transition("failed");
            return Ok(());
        };
        let reader = match self.blobs.open_reader(&input.blob_ref).await {
            Ok(r) => r,
            Err(_) => {
                self.db
                    .fail_job(&job.id, ErrorCode::FileMissing, "input blob missing", Utc::now())
                    .await?;
                self.metrics.transition("failed");
                return Ok(());
            }
        };
        let mut lines = BufReader::new(reader).lines();

        // Crash resume: lines already in the partial output are done.
        let n_done = self.blobs.partial_line_count(&job.id).await?;
        if n_done > 0 {
            tracing::info!(batch_id = %job.id, lines = n_done, "resuming from partial output");
            self.reconcile_counters(&job).await?;
            let mut skipped = 0u64;
            while skipped < n_done {
                if lines.next_line().await?.is_none() {
                    break;
                }
                skipped += 1;
            }
        }

        let mut policy = ChunkPolicy::new(self.cfg.chunk_size_default, self.cfg.chunk_size_min);
        let mut ema_tps = job.throughput_tokens_per_s;
        let mut index = n_done as i64;

        loop {
            if *shutdown.borrow() {
                tracing::info!(batch_id = %job.id, "shutdown requested, leaving job resumable");
                self.set_state(WorkerState::Draining).await;
                return Ok(());
            }

            // Chunk boundary: honour cancel/expiry decided elsewhere.
            let current = self
                .db
                .get_job(&job.id)
                .await?
                .ok_or_else(|| Error::not_found(format!("batch {}", job.id)))?;
            match current.status() {
                BatchStatus::Cancelling => return self.finish_cancelled(&current).await,
                BatchStatus::InProgress => {}
                other => {
                    tracing::info!(batch_id = %job.id, status = %other, "job moved under us, stopping");
                    return Ok(());
                }
            }

            let health = self.engine.health().await.ok();
            let (healthy, free_fraction) = match &health {
                Some(h) => (
                    h.memory_pct() < self.cfg.gpu_memory_pct_limit
                        && h.temperature_c < self.cfg.gpu_temperature_c_limit,
                    h.free_fraction(),
                ),
                None => (false, 0.0),
            };
            {
                let mut snap = self.snapshot.lock().await;
                snap.gpu = health;
            }

            match policy.pre_flight(healthy, free_fraction) {
                ChunkDecision::Abort => {
                    let msg = "GPU unhealthy at minimum chunk size";
                    tracing::error!(batch_id = %job.id, "{}", msg);
                    self.db.fail_job(&job.id, ErrorCode::GpuUnhealthy, msg, Utc::now()).await?;
                    self.metrics.transition("failed");
                    return Ok(());
                }
                ChunkDecision::Backoff => {
                    tracing::warn!(
                        batch_id = %job.id,
                        chunk_size = policy.current(),
                        "GPU pre-flight unhealthy, backing off"
                    );
                    self.sleep_or_shutdown(shutdown, BACKOFF_SLEEP).await;
                    continue;
                }
                ChunkDecision::Run(size) => {
                    let chunk = read_chunk(&mut lines, size).await?;
                    if chunk.is_empty() {
                        break;
                    }

                    // Heartbeat right before the long blocking call
                    self.emit_heartbeat().await.ok();

                    let started = std::time::Instant::now();
                    let outcome = self.run_chunk(&job, &chunk, index).await;
                    let elapsed = started.elapsed().as_secs_f64();
                    self.metrics.chunk_duration.observe(elapsed);

                    self.blobs.append_partial_lines(&job.id, &outcome.lines).await?;
                    for fr in &outcome.failed {
                        self.db.insert_failed_request(fr).await?;
                    }

                    if outcome.tokens > 0 {
                        let inst = outcome.tokens as f64 / elapsed.max(1e-3);
                        let next = match ema_tps {
                            Some(prev) => THROUGHPUT_EMA_ALPHA * inst + (1.0 - THROUGHPUT_EMA_ALPHA) * prev,
                            None => inst,
                        };
                        ema_tps = Some(next);
                        self.metrics.tokens_per_s.set(next);
                    }

                    let progress: ChunkProgress = self
                        .db
                        .record_chunk(&job.id, outcome.ok, outcome.err, outcome.tokens, ema_tps, Utc::now())
                        .await?;
                    index += chunk.len() as i64;
                    policy.on_clean_chunk();

                    tracing::debug!(
                        batch_id = %job.id,
                        chunk_lines = chunk.len(),
                        completed = progress.completed_requests,
                        failed = progress.failed_requests,
                        total = progress.total_requests,
                        "chunk recorded"
                    );

                    if progress.status == BatchStatus::Cancelling {
                        let current = self
                            .db
                            .get_job(&job.id)
                            .await?
                            .ok_or_else(|| Error::not_found(format!("batch {}", job.id)))?;
                        return self.finish_cancelled(&current).await;
                    }
                }
            }
        }

        self.finalize(&job).await
    }

    /// Translate a chunk, drive the engine, and shape one output line per
    /// input line, in input order.
    async fn run_chunk(&self, job: &BatchJob, raw_lines: &[String], base_index: i64) -> ChunkOutcome {
        enum Slot {
            Pending(usize),
            Invalid { custom_id: String, message: String },
        }

        let mut requests: Vec<GenerateRequest> = Vec::new();
        let mut slots: Vec<Slot> = Vec::with_capacity(raw_lines.len());

        for (i, raw) in raw_lines.iter().enumerate() {
            let line_index = base_index as usize + i;
            match jsonl::parse_line(line_index, raw) {
                Ok(line) => {
                    slots.push(Slot::Pending(requests.len()));
                    requests.push(GenerateRequest { custom_id: line.custom_id, body: line.body });
                }
                Err(e) => {
                    // Upload validation should have caught this; record the
                    // dead letter and keep the output aligned with the input.
                    let custom_id = extract_custom_id(raw)
                        .unwrap_or_else(|| format!("line-{}", line_index));
                    slots.push(Slot::Invalid { custom_id, message: e.to_string() });
                }
            }
        }

        let outcomes: Vec<GenerateOutcome> = if requests.is_empty() {
            Vec::new()
        } else {
            match self.engine.generate(&requests).await {
                Ok(o) => o,
                Err(e) => {
                    tracing::warn!(
                        batch_id = %job.id,
                        error = %e,
                        "generate call failed, failing chunk requests"
                    );
                    requests
                        .iter()
                        .map(|_| GenerateOutcome::Error { message: e.to_string() })
                        .collect()
                }
            }
        };

        let now = Utc::now();
        let mut out = ChunkOutcome::default();
        for (i, slot) in slots.into_iter().enumerate() {
            let line_index = base_index + i as i64;
            match slot {
                Slot::Pending(k) => {
                    let custom_id = requests[k].custom_id.clone();
                    match &outcomes[k] {
                        GenerateOutcome::Completion(c) => {
                            out.ok += 1;
                            out.tokens += c.usage.total_tokens;
                            out.push(BatchResultLine::ok(custom_id, c.content.clone(), c.usage.clone()));
                        }
                        GenerateOutcome::Error { message } => {
                            out.err += 1;
                            out.failed.push(failed_request(
                                job, &custom_id, line_index, FailureKind::Inference, message, now,
                            ));
                            out.push(BatchResultLine::err(
                                custom_id,
                                ErrorCode::InferenceError.as_str().to_string(),
                                message.clone(),
                            ));
                        }
                    }
                }
                Slot::Invalid { custom_id, message } => {
                    out.err += 1;
                    out.failed.push(failed_request(
                        job, &custom_id, line_index, FailureKind::Validation, &message, now,
                    ));
                    out.push(BatchResultLine::err(
                        custom_id,
                        ErrorCode::ValidationError.as_str().to_string(),
                        message,
                    ));
                }
            }
        }
        out
    }

    /// Hot-swap to the job's model if the engine has something else loaded.
    async fn ensure_model(&self, job: &BatchJob) -> Result<()> {
        let health = self.engine.health().await?;
        if health.loaded_model.as_deref() == Some(job.model.as_str()) {
            return Ok(());
        }

        self.set_state(WorkerState::LoadingModel).await;
        self.emit_heartbeat().await.ok();

        if health.loaded_model.is_some() {
            tracing::info!(
                batch_id = %job.id,
                from = health.loaded_model.as_deref().unwrap_or(""),
                to = %job.model,
                "hot-swapping model"
            );
            self.engine.unload().await?;
            self.wait_for_idle_gpu().await?;
        }

        let health = self.engine.health().await?;
        let plan = self
            .registry
            .plan_load(&job.model, &health, available_cpu_ram_bytes())?;
        tracing::info!(
            batch_id = %job.id,
            model = %job.model,
            cpu_offload_bytes = plan.cpu_offload_bytes,
            "loading model"
        );
        self.engine.load(&job.model, &plan).await?;

        {
            let mut snap = self.snapshot.lock().await;
            snap.loaded_model = Some(job.model.clone());
            snap.model_loaded_at = Some(Utc::now());
            snap.state = WorkerState::Processing;
        }
        Ok(())
    }

    /// After unload, give the engine a moment to release VRAM.
    async fn wait_for_idle_gpu(&self) -> Result<()> {
        for _ in 0..30 {
            let health = self.engine.health().await?;
            if health.loaded_model.is_none() && health.utilization_pct < 5.0 {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        Err(Error::GpuUnhealthy("engine did not reach idle after unload".into()))
    }

    /// After a crash the partial output may be ahead of the counters (the
    /// chunk was fsynced but the transaction never committed). Recount from
    /// the durable lines.
    async fn reconcile_counters(&self, job: &BatchJob) -> Result<()> {
        let mut ok = 0i64;
        let mut err = 0i64;
        for raw in self.read_partial_lines(&job.id).await? {
            match serde_json::from_str::<BatchResultLine>(&raw) {
                Ok(line) if line.response.is_some() => ok += 1,
                _ => err += 1,
            }
        }
        let recorded = job.completed_requests + job.failed_requests;
        let durable = ok + err;
        if durable > recorded {
            let delta_ok = (ok - job.completed_requests).max(0);
            let delta_err = (err - job.failed_requests).max(0);
            tracing::info!(
                batch_id = %job.id,
                durable,
                recorded,
                "reconciling counters with partial output"
            );
            self.db
                .record_chunk(&job.id, delta_ok, delta_err, 0, job.throughput_tokens_per_s, Utc::now())
                .await?;
        }
        Ok(())
    }

    async fn read_partial_lines(&self, batch_id: &str) -> Result<Vec<String>> {
        // The partial file is never huge: at most one job's output.
        let path_reader = self.blobs.open_partial_reader(batch_id).await?;
        let mut lines = BufReader::new(path_reader).lines();
        let mut out = Vec::new();
        while let Some(l) = lines.next_line().await? {
            out.push(l);
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Finalisation
    // ------------------------------------------------------------------

    async fn finalize(&self, job: &BatchJob) -> Result<()> {
        if !self.db.begin_finalizing(&job.id, Utc::now()).await? {
            // Cancelled or expired between the last chunk and here
            let current = self
                .db
                .get_job(&job.id)
                .await?
                .ok_or_else(|| Error::not_found(format!("batch {}", job.id)))?;
            if current.status() == BatchStatus::Cancelling {
                return self.finish_cancelled(&current).await;
            }
            tracing::info!(batch_id = %job.id, status = %current.status(), "skipping finalize");
            return Ok(());
        }
        self.metrics.transition("finalizing");

        let (output_file_id, output_blob_ref) = self.publish_output(job).await?;
        let failed = self.db.failed_requests_for(&job.id).await?;
        let error_file_id = self.publish_errors(job, &failed).await?;

        let current = self
            .db
            .get_job(&job.id)
            .await?
            .ok_or_else(|| Error::not_found(format!("batch {}", job.id)))?;

        // Per-request failures never fail the job unless literally every
        // request died in inference.
        let all_inference_failures = current.total_requests > 0
            && current.completed_requests == 0
            && current.failed_requests == current.total_requests
            && !failed.is_empty()
            && failed.iter().all(|f| f.error_kind == FailureKind::Inference.as_str());

        if all_inference_failures {
            self.db
                .finish_job(
                    &job.id,
                    BatchStatus::Failed,
                    Some(&output_file_id),
                    error_file_id.as_deref(),
                    Some(ErrorCode::InferenceError),
                    Some("every request in the batch failed"),
                    Utc::now(),
                )
                .await?;
            self.blobs.discard_partial(&job.id).await.ok();
            self.metrics.transition("failed");
            tracing::warn!(batch_id = %job.id, "batch failed: all requests errored");
            return Ok(());
        }

        self.db
            .finish_job(
                &job.id,
                BatchStatus::Completed,
                Some(&output_file_id),
                error_file_id.as_deref(),
                None,
                None,
                Utc::now(),
            )
            .await?;
        self.blobs.discard_partial(&job.id).await.ok();
        self.metrics.transition("completed");
        tracing::info!(
            batch_id = %job.id,
            output_file_id = %output_file_id,
            completed = current.completed_requests,
            failed = current.failed_requests,
            "batch completed"
        );

        // Handlers only ever fire for completed jobs; their outcome cannot
        // change the terminal status.
        if !self.pipeline.is_empty() {
            let finished = self
                .db
                .get_job(&job.id)
                .await?
                .ok_or_else(|| Error::not_found(format!("batch {}", job.id)))?;
            let metadata = finished.metadata_map();
            let ctx = HandlerContext {
                job: &finished,
                metadata: &metadata,
                blobs: &self.blobs,
                output_blob_ref: &output_blob_ref,
                output_file_id: &output_file_id,
                error_file_id: error_file_id.as_deref(),
            };
            self.pipeline.run(&ctx).await;
        }

        Ok(())
    }

    /// Cooperative cancel: publish whatever is durably written, then land
    /// on `cancelled`.
    async fn finish_cancelled(&self, job: &BatchJob) -> Result<()> {
        let (output_file_id, _) = self.publish_output(job).await?;
        self.db
            .finish_job(
                &job.id,
                BatchStatus::Cancelled,
                Some(&output_file_id),
                None,
                None,
                None,
                Utc::now(),
            )
            .await?;
        self.blobs.discard_partial(&job.id).await.ok();
        self.metrics.transition("cancelled");
        tracing::info!(batch_id = %job.id, output_file_id = %output_file_id, "batch cancelled");
        Ok(())
    }

    /// Promote the partial output into an immutable file row.
    async fn publish_output(&self, job: &BatchJob) -> Result<(String, String)> {
        let line_count = self.blobs.partial_line_count(&job.id).await? as i64;
        let handle = self.blobs.promote_partial(&job.id).await?;
        let now = Utc::now();
        let record = FileRecord {
            id: new_file_id(),
            purpose: FilePurpose::BatchOutput.as_str().to_string(),
            filename: format!("{}_output.jsonl", job.id),
            bytes: handle.bytes as i64,
            blob_ref: handle.blob_ref.clone(),
            line_count,
            model: None,
            created_at: now,
            expires_at: Some(now + chrono::Duration::days(self.cfg.output_retention_days)),
        };
        self.db.insert_file(&record).await?;
        Ok((record.id, handle.blob_ref))
    }

    /// Aggregate dead letters into an errors file, if any exist.
    async fn publish_errors(
        &self,
        job: &BatchJob,
        failed: &[FailedRequest],
    ) -> Result<Option<String>> {
        if failed.is_empty() {
            return Ok(None);
        }
        let mut content = String::new();
        for fr in failed {
            let line = ErrorFileLine {
                custom_id: fr.custom_id.clone(),
                error: ErrorFileDetail {
                    code: match fr.error_kind.as_str() {
                        "validation" => ErrorCode::ValidationError.as_str().to_string(),
                        "inference" => ErrorCode::InferenceError.as_str().to_string(),
                        _ => ErrorCode::InternalError.as_str().to_string(),
                    },
                    message: fr.error_message.clone(),
                    attempt_count: fr.attempt_count,
                },
            };
            content.push_str(&serde_json::to_string(&line)?);
            content.push('\n');
        }

        let handle = self.blobs.put_bytes(content.as_bytes()).await?;
        let now = Utc::now();
        let record = FileRecord {
            id: new_file_id(),
            purpose: FilePurpose::BatchErrors.as_str().to_string(),
            filename: format!("{}_errors.jsonl", job.id),
            bytes: handle.bytes as i64,
            blob_ref: handle.blob_ref,
            line_count: failed.len() as i64,
            model: None,
            created_at: now,
            expires_at: Some(now + chrono::Duration::days(self.cfg.output_retention_days)),
        };
        self.db.insert_file(&record).await?;
        Ok(Some(record.id))
    }

    // ------------------------------------------------------------------
    // Heartbeats and gauges
    // ------------------------------------------------------------------

    /// Dedicated timer so the heartbeat is never starved by a long
    /// generate call.
    fn spawn_heartbeat_timer(&self, mut shutdown: watch::Receiver<bool>) {
        let db = self.db.clone();
        let snapshot = Arc::clone(&self.snapshot);
        let worker_id = self.cfg.worker_id.clone();
        let started_at = self.started_at;
        let interval_s = self.cfg.heartbeat_interval_s;

        tokio::spawn(async move {
            let mut timer = tokio::time::interval(Duration::from_secs(interval_s));
            timer.tick().await;
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        let hb = build_heartbeat(&worker_id, started_at, &*snapshot.lock().await);
                        if let Err(e) = db.upsert_heartbeat(&hb).await {
                            tracing::warn!(worker_id = %worker_id, error = %e, "timer heartbeat failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    async fn emit_heartbeat(&self) -> Result<()> {
        let hb = build_heartbeat(&self.cfg.worker_id, self.started_at, &*self.snapshot.lock().await);
        if let Some((mem_pct, temp, util)) = hb_gpu(&hb) {
            self.metrics.gpu_memory_pct.set(mem_pct);
            self.metrics.gpu_temperature_c.set(temp);
            self.metrics.gpu_utilization_pct.set(util);
        }
        self.db.upsert_heartbeat(&hb).await
    }

    async fn refresh_gpu_snapshot(&self) {
        let health = self.engine.health().await.ok();
        let mut snap = self.snapshot.lock().await;
        if let Some(h) = &health {
            snap.loaded_model = h.loaded_model.clone();
        }
        snap.gpu = health;
    }

    async fn update_queue_gauges(&self) {
        if let Ok(depth) = self.db.queue_depth().await {
            self.metrics.queue_depth.set(depth);
        }
        if let Ok(counts) = self.db.status_counts().await {
            for (status, count) in counts {
                self.metrics
                    .jobs_by_status
                    .with_label_values(&[status.as_str()])
                    .set(count);
            }
        }
    }

    async fn set_state(&self, state: WorkerState) {
        let mut snap = self.snapshot.lock().await;
        snap.state = state;
    }

    async fn clear_current_batch(&self) {
        let mut snap = self.snapshot.lock().await;
        snap.current_batch_id = None;
        snap.state = WorkerState::Idle;
        self.metrics.tokens_per_s.set(0.0);
    }

    async fn sleep_or_shutdown(&self, shutdown: &mut watch::Receiver<bool>, dur: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(dur) => {}
            _ = shutdown.changed() => {}
        }
    }
}

/// One chunk's shaped results.
#[derive(Debug, Default)]
struct ChunkOutcome {
    lines: Vec<String>,
    ok: i64,
    err: i64,
    tokens: i64,
    failed: Vec<FailedRequest>,
}

impl ChunkOutcome {
    fn push(&mut self, line: BatchResultLine) {
        // Serialisation of our own shapes cannot fail
        if let Ok(s) = serde_json::to_string(&line) {
            self.lines.push(s);
        }
    }
}

async fn read_chunk(
    lines: &mut Lines<BufReader<tokio::fs::File>>,
    size: usize,
) -> Result<Vec<String>> {
    let mut chunk = Vec::with_capacity(size.min(1024));
    while chunk.len() < size {
        match lines.next_line().await? {
            Some(l) => chunk.push(l),
            None => break,
        }
    }
    Ok(chunk)
}

fn failed_request(
    job: &BatchJob,
    custom_id: &str,
    request_index: i64,
    kind: FailureKind,
    message: &str,
    now: DateTime<Utc>,
) -> FailedRequest {
    FailedRequest {
        id: uuid::Uuid::new_v4().to_string(),
        batch_id: job.id.clone(),
        custom_id: custom_id.to_string(),
        request_index,
        error_kind: kind.as_str().to_string(),
        error_message: message.to_string(),
        attempt_count: 1,
        last_attempt_at: now,
    }
}

fn extract_custom_id(raw: &str) -> Option<String> {
    serde_json::from_str::<serde_json::Value>(raw)
        .ok()?
        .get("custom_id")?
        .as_str()
        .map(|s| s.to_string())
}

fn build_heartbeat(
    worker_id: &str,
    started_at: DateTime<Utc>,
    snap: &HeartbeatSnapshot,
) -> WorkerHeartbeat {
    let gpu = snap.gpu.as_ref();
    WorkerHeartbeat {
        worker_id: worker_id.to_string(),
        pid: std::process::id() as i64,
        started_at,
        last_seen: Utc::now(),
        status: snap.state.as_str().to_string(),
        current_batch_id: snap.current_batch_id.clone(),
        loaded_model: snap.loaded_model.clone(),
        model_loaded_at: snap.model_loaded_at,
        gpu_memory_used_bytes: gpu.map(|g| g.memory_used_bytes as i64),
        gpu_memory_total_bytes: gpu.map(|g| g.memory_total_bytes as i64),
        gpu_temperature_c: gpu.map(|g| g.temperature_c),
        gpu_utilization_pct: gpu.map(|g| g.utilization_pct),
    }
}

fn hb_gpu(hb: &WorkerHeartbeat) -> Option<(f64, f64, f64)> {
    Some((
        hb.gpu_memory_pct()?,
        hb.gpu_temperature_c?,
        hb.gpu_utilization_pct?,
    ))
}

/// MemAvailable from /proc/meminfo; on platforms without it, assume RAM is
/// not the constraint and let VRAM planning decide.
fn available_cpu_ram_bytes() -> u64 {
    if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
        for line in meminfo.lines() {
            if let Some(rest) = line.strip_prefix("MemAvailable:") {
                if let Some(kb) = rest.trim().split_whitespace().next().and_then(|v| v.parse::<u64>().ok()) {
                    return kb * 1024;
                }
            }
        }
    }
    u64::MAX
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_custom_id() {
        assert_eq!(extract_custom_id(r#"{"custom_id":"a","method":"GET"}"#), Some("a".into()));
        assert_eq!(extract_custom_id("not json"), None);
        assert_eq!(extract_custom_id(r#"{"method":"GET"}"#), None);
    }

    #[test]
    fn test_chunk_outcome_lines_serialize() {
        let mut out = ChunkOutcome::default();
        out.push(BatchResultLine::ok("a".into(), "x".into(), Default::default()));
        out.push(BatchResultLine::err("b".into(), "inference_error".into(), "boom".into()));
        assert_eq!(out.lines.len(), 2);
        assert!(out.lines[0].contains("\"custom_id\":\"a\""));
    }
}
