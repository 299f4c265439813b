//! Batch job rows
//!
//! The scheduling contract lives here: dequeue is a guarded single-statement
//! UPDATE (highest priority, then oldest), counter updates ride one
//! transaction with the status read, and terminal statuses are monotonic.

use chrono::{DateTime, Duration, Utc};

use super::Database;
use crate::error::{Error, ErrorCode, Result};
use crate::models::{BatchJob, BatchStatus, FailedRequest};

const TERMINAL: &str = "('completed', 'failed', 'cancelled', 'expired')";

/// Outcome of recording a chunk: the counters after the update plus the
/// status the worker must honour at the next boundary.
#[derive(Debug, Clone)]
pub struct ChunkProgress {
    pub status: BatchStatus,
    pub completed_requests: i64,
    pub failed_requests: i64,
    pub total_requests: i64,
}

impl Database {
    pub async fn insert_job(&self, job: &BatchJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO batch_jobs (
                id, input_file_id, endpoint, completion_window, model, priority, metadata,
                status, total_requests, created_at, expires_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.input_file_id)
        .bind(&job.endpoint)
        .bind(&job.completion_window)
        .bind(&job.model)
        .bind(job.priority)
        .bind(&job.metadata)
        .bind(&job.status)
        .bind(job.total_requests)
        .bind(job.created_at)
        .bind(job.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<BatchJob>> {
        let job = sqlx::query_as("SELECT * FROM batch_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    /// Jobs newest-first with an opaque cursor (the last batch id of the
    /// previous page).
    pub async fn list_jobs(&self, after: Option<&str>, limit: i64) -> Result<Vec<BatchJob>> {
        let jobs = match after {
            Some(after_id) => {
                sqlx::query_as(
                    r#"
                    SELECT * FROM batch_jobs
                    WHERE (created_at, id) < (SELECT created_at, id FROM batch_jobs WHERE id = ?)
                    ORDER BY created_at DESC, id DESC
                    LIMIT ?
                    "#,
                )
                .bind(after_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as("SELECT * FROM batch_jobs ORDER BY created_at DESC, id DESC LIMIT ?")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(jobs)
    }

    /// Count of non-terminal jobs; the admission back-pressure signal.
    pub async fn queue_depth(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(&format!(
            "SELECT COUNT(*) FROM batch_jobs WHERE status NOT IN {}",
            TERMINAL
        ))
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    /// 1-based position of a `validating` job in dispatch order.
    pub async fn queue_position(&self, job: &BatchJob) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM batch_jobs
            WHERE status = 'validating'
              AND (priority > ? OR (priority = ? AND created_at < ?)
                   OR (priority = ? AND created_at = ? AND id < ?))
            "#,
        )
        .bind(job.priority)
        .bind(job.priority)
        .bind(job.created_at)
        .bind(job.priority)
        .bind(job.created_at)
        .bind(&job.id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0 + 1)
    }

    /// All non-terminal jobs in dispatch order, for the queue view.
    pub async fn active_jobs(&self) -> Result<Vec<BatchJob>> {
        let jobs = sqlx::query_as(&format!(
            r#"
            SELECT * FROM batch_jobs
            WHERE status NOT IN {}
            ORDER BY CASE WHEN status IN ('in_progress', 'finalizing') THEN 0 ELSE 1 END,
                     priority DESC, created_at ASC
            "#,
            TERMINAL
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    /// Job counts per status, for gauges.
    pub async fn status_counts(&self) -> Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM batch_jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    /// A job this worker was driving before a restart, if any.
    pub async fn resumable_job(&self, worker_id: &str) -> Result<Option<BatchJob>> {
        let job = sqlx::query_as(
            r#"
            SELECT * FROM batch_jobs
            WHERE worker_id = ? AND status IN ('in_progress', 'finalizing', 'cancelling')
            ORDER BY in_progress_at ASC
            LIMIT 1
            "#,
        )
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    /// Adopt an in-flight job whose owning worker has gone stale. The
    /// worker_id check in the UPDATE keeps two adopters from both winning.
    pub async fn adopt_stale_job(
        &self,
        worker_id: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<BatchJob>> {
        let candidate: Option<BatchJob> = sqlx::query_as(
            r#"
            SELECT j.* FROM batch_jobs j
            LEFT JOIN worker_heartbeats h ON h.worker_id = j.worker_id
            WHERE j.status IN ('in_progress', 'finalizing', 'cancelling')
              AND j.worker_id IS NOT NULL AND j.worker_id != ?
              AND (h.worker_id IS NULL OR h.last_seen < ?)
            ORDER BY j.in_progress_at ASC
            LIMIT 1
            "#,
        )
        .bind(worker_id)
        .bind(stale_before)
        .fetch_optional(&self.pool)
        .await?;

        let Some(candidate) = candidate else {
            return Ok(None);
        };

        let adopted: Option<BatchJob> = sqlx::query_as(
            r#"
            UPDATE batch_jobs SET worker_id = ?
            WHERE id = ? AND worker_id = ? AND status IN ('in_progress', 'finalizing', 'cancelling')
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(&candidate.id)
        .bind(&candidate.worker_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(adopted)
    }

    /// Claim the next pending job for `worker_id`.
    ///
    /// Jobs whose input file row has vanished are failed with `file_missing`
    /// first, then the best `validating` job (priority desc, created asc) is
    /// flipped to `in_progress` in a single guarded statement. Losing the
    /// race against another worker yields `None`; the caller just polls
    /// again.
    pub async fn dequeue_next(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<BatchJob>> {
        sqlx::query(
            r#"
            UPDATE batch_jobs
            SET status = 'failed', error_code = ?, error_message = 'input file no longer exists',
                completed_at = ?
            WHERE status = 'validating'
              AND input_file_id NOT IN (SELECT id FROM files)
            "#,
        )
        .bind(ErrorCode::FileMissing.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;

        let job: Option<BatchJob> = sqlx::query_as(
            r#"
            UPDATE batch_jobs
            SET status = 'in_progress', worker_id = ?, in_progress_at = ?
            WHERE id = (
                SELECT id FROM batch_jobs
                WHERE status = 'validating'
                ORDER BY priority DESC, created_at ASC, id ASC
                LIMIT 1
            ) AND status = 'validating'
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    /// Apply one chunk's results: counters, tokens, throughput and ETA, all
    /// in one transaction with the status read the worker acts on next.
    /// Counters are clamped so completed + failed never exceeds total.
    pub async fn record_chunk(
        &self,
        id: &str,
        ok_delta: i64,
        err_delta: i64,
        tokens_delta: i64,
        throughput_tokens_per_s: Option<f64>,
        now: DateTime<Utc>,
    ) -> Result<ChunkProgress> {
        let mut tx = self.pool.begin().await?;

        let job: Option<BatchJob> = sqlx::query_as("SELECT * FROM batch_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let job = job.ok_or_else(|| Error::not_found(format!("batch {}", id)))?;

        let completed = (job.completed_requests + ok_delta).min(job.total_requests);
        let failed = (job.failed_requests + err_delta).min(job.total_requests - completed);

        let remaining = job.total_requests - completed - failed;
        let estimated_completion_at = throughput_tokens_per_s.and_then(|tps| {
            if tps <= 0.0 || remaining == 0 {
                return None;
            }
            // Rough per-request token cost from what we have seen so far
            let done = completed + failed;
            if done == 0 {
                return None;
            }
            let tokens_per_request = (job.tokens_processed + tokens_delta) as f64 / done as f64;
            let secs = (remaining as f64 * tokens_per_request / tps).ceil() as i64;
            Some(now + Duration::seconds(secs))
        });

        sqlx::query(
            r#"
            UPDATE batch_jobs
            SET completed_requests = ?, failed_requests = ?, tokens_processed = tokens_processed + ?,
                throughput_tokens_per_s = ?, last_progress_at = ?, estimated_completion_at = ?
            WHERE id = ?
            "#,
        )
        .bind(completed)
        .bind(failed)
        .bind(tokens_delta)
        .bind(throughput_tokens_per_s)
        .bind(now)
        .bind(estimated_completion_at)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(ChunkProgress {
            status: job.status(),
            completed_requests: completed,
            failed_requests: failed,
            total_requests: job.total_requests,
        })
    }

    /// `in_progress` → `finalizing`. Re-entrant: resuming a job that
    /// crashed mid-finalize succeeds again. Returns false if the job moved
    /// under us (cancelled or expired meanwhile).
    pub async fn begin_finalizing(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE batch_jobs SET status = 'finalizing', finalized_at = COALESCE(finalized_at, ?)
            WHERE id = ? AND status IN ('in_progress', 'finalizing')
            "#,
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Move a job into a terminal status, attaching output/error files.
    /// No-op (returning false) if the job is already terminal.
    pub async fn finish_job(
        &self,
        id: &str,
        status: BatchStatus,
        output_file_id: Option<&str>,
        error_file_id: Option<&str>,
        error_code: Option<ErrorCode>,
        error_message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        debug_assert!(status.is_terminal());
        let res = sqlx::query(&format!(
            r#"
            UPDATE batch_jobs
            SET status = ?, output_file_id = COALESCE(?, output_file_id),
                error_file_id = COALESCE(?, error_file_id),
                error_code = ?, error_message = ?, completed_at = ?
            WHERE id = ? AND status NOT IN {}
            "#,
            TERMINAL
        ))
        .bind(status.as_str())
        .bind(output_file_id)
        .bind(error_file_id)
        .bind(error_code.map(|c| c.as_str()))
        .bind(error_message)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Fail a job outright (model load failure, GPU at the floor, missing
    /// file).
    pub async fn fail_job(
        &self,
        id: &str,
        code: ErrorCode,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.finish_job(id, BatchStatus::Failed, None, None, Some(code), Some(message), now)
            .await
    }

    /// Client-requested cancellation.
    ///
    /// `validating` jobs cancel immediately; in-flight jobs move to
    /// `cancelling` and the worker observes that at the next chunk boundary.
    /// Terminal jobs yield `already_terminal`.
    pub async fn request_cancel(&self, id: &str, now: DateTime<Utc>) -> Result<BatchJob> {
        let mut tx = self.pool.begin().await?;

        let job: Option<BatchJob> = sqlx::query_as("SELECT * FROM batch_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let job = job.ok_or_else(|| Error::not_found(format!("batch {}", id)))?;

        match job.status() {
            BatchStatus::Validating => {
                sqlx::query(
                    "UPDATE batch_jobs SET status = 'cancelled', completed_at = ? WHERE id = ? AND status = 'validating'",
                )
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            }
            BatchStatus::InProgress | BatchStatus::Finalizing => {
                sqlx::query(
                    "UPDATE batch_jobs SET status = 'cancelling' WHERE id = ? AND status IN ('in_progress', 'finalizing')",
                )
                .bind(id)
                .execute(&mut *tx)
                .await?;
            }
            // Repeated cancel while the worker drains is benign
            BatchStatus::Cancelling => {}
            s @ (BatchStatus::Completed
            | BatchStatus::Failed
            | BatchStatus::Cancelled
            | BatchStatus::Expired) => {
                return Err(Error::AlreadyTerminal(format!("batch {} is {}", id, s)));
            }
        }

        let updated: BatchJob = sqlx::query_as("SELECT * FROM batch_jobs WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(updated)
    }

    /// Mark every overdue non-terminal job `expired`; returns affected ids.
    pub async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(&format!(
            r#"
            UPDATE batch_jobs
            SET status = 'expired', error_code = ?, error_message = 'completion window elapsed',
                completed_at = ?
            WHERE status NOT IN {} AND expires_at < ?
            RETURNING id
            "#,
            TERMINAL
        ))
        .bind(ErrorCode::Timeout.as_str())
        .bind(now)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    // ------------------------------------------------------------------
    // Failed requests (dead letters)
    // ------------------------------------------------------------------

    pub async fn insert_failed_request(&self, fr: &FailedRequest) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO failed_requests (id, batch_id, custom_id, request_index, error_kind,
                error_message, attempt_count, last_attempt_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&fr.id)
        .bind(&fr.batch_id)
        .bind(&fr.custom_id)
        .bind(fr.request_index)
        .bind(&fr.error_kind)
        .bind(&fr.error_message)
        .bind(fr.attempt_count)
        .bind(fr.last_attempt_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn failed_requests_for(&self, batch_id: &str) -> Result<Vec<FailedRequest>> {
        let rows = sqlx::query_as(
            "SELECT * FROM failed_requests WHERE batch_id = ? ORDER BY request_index ASC",
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
