//! Job store - SQLx with SQLite
//!
//! Durable state for files, batch jobs, failed requests, worker heartbeats
//! and the system-status singleton. All status changes and counter updates
//! for a job happen in a single transaction; the dequeue path is a guarded
//! UPDATE so concurrent workers cannot claim the same job.

mod files;
mod heartbeat;
mod jobs;

pub use jobs::ChunkProgress;

use std::path::PathBuf;

use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::error::Result;

/// Database handle, cheap to clone.
#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database at `db_path` and run migrations.
    pub async fn open(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());
        tracing::info!(path = %db_path.display(), "Connecting to database");

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        // WAL keeps the worker's writes from blocking API reads
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        // Retry on SQLITE_BUSY instead of failing immediately
        sqlx::query("PRAGMA busy_timeout = 5000")
            .execute(&pool)
            .await?;

        // Synchronous NORMAL is safe with WAL and faster than FULL
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&pool)
            .await?;

        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&pool)
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run database migrations
    async fn run_migrations(&self) -> Result<()> {
        tracing::info!("Running database migrations...");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS files (
                id TEXT PRIMARY KEY,
                purpose TEXT NOT NULL,
                filename TEXT NOT NULL,
                bytes INTEGER NOT NULL DEFAULT 0,
                blob_ref TEXT NOT NULL,
                line_count INTEGER NOT NULL DEFAULT 0,
                model TEXT,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                expires_at DATETIME
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS batch_jobs (
                id TEXT PRIMARY KEY,
                input_file_id TEXT NOT NULL,
                endpoint TEXT NOT NULL,
                completion_window TEXT NOT NULL,
                model TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                metadata TEXT,
                status TEXT NOT NULL DEFAULT 'validating',
                worker_id TEXT,
                total_requests INTEGER NOT NULL DEFAULT 0,
                completed_requests INTEGER NOT NULL DEFAULT 0,
                failed_requests INTEGER NOT NULL DEFAULT 0,
                tokens_processed INTEGER NOT NULL DEFAULT 0,
                throughput_tokens_per_s REAL,
                last_progress_at DATETIME,
                estimated_completion_at DATETIME,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                in_progress_at DATETIME,
                finalized_at DATETIME,
                completed_at DATETIME,
                expires_at DATETIME NOT NULL,
                output_file_id TEXT,
                error_file_id TEXT,
                error_code TEXT,
                error_message TEXT,
                FOREIGN KEY (input_file_id) REFERENCES files(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Dequeue scan: status first, then the dispatch order
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_jobs_dequeue ON batch_jobs(status, priority DESC, created_at ASC)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_worker ON batch_jobs(worker_id, status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_created ON batch_jobs(created_at DESC, id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS failed_requests (
                id TEXT PRIMARY KEY,
                batch_id TEXT NOT NULL,
                custom_id TEXT NOT NULL,
                request_index INTEGER NOT NULL,
                error_kind TEXT NOT NULL,
                error_message TEXT NOT NULL,
                attempt_count INTEGER NOT NULL DEFAULT 1,
                last_attempt_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY (batch_id) REFERENCES batch_jobs(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_failed_requests_batch ON failed_requests(batch_id, request_index)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS worker_heartbeats (
                worker_id TEXT PRIMARY KEY,
                pid INTEGER NOT NULL,
                started_at DATETIME NOT NULL,
                last_seen DATETIME NOT NULL,
                status TEXT NOT NULL DEFAULT 'idle',
                current_batch_id TEXT,
                loaded_model TEXT,
                model_loaded_at DATETIME,
                gpu_memory_used_bytes INTEGER,
                gpu_memory_total_bytes INTEGER,
                gpu_temperature_c REAL,
                gpu_utilization_pct REAL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_heartbeats_seen ON worker_heartbeats(last_seen)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS system_status (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                maintenance_mode BOOLEAN NOT NULL DEFAULT 0,
                maintenance_reason TEXT,
                maintenance_started_at DATETIME,
                maintenance_eta_minutes INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("INSERT OR IGNORE INTO system_status (id, maintenance_mode) VALUES (1, 0)")
            .execute(&self.pool)
            .await?;

        tracing::info!("Database migrations completed");
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::open_test_db;

    #[tokio::test]
    async fn test_migrations_idempotent() {
        let (db, _dir) = open_test_db().await;
        // Second run must be a no-op, not an error
        db.run_migrations().await.expect("re-run migrations");
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM system_status")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(row.0, 1);
    }
}
