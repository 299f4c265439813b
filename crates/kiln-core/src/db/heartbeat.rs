//! Worker heartbeats and the system-status singleton

use chrono::{DateTime, Utc};

use super::Database;
use crate::error::Result;
use crate::models::{SystemStatus, WorkerHeartbeat};

impl Database {
    /// Upsert the liveness row for a worker. Called on every loop iteration
    /// and from the dedicated heartbeat timer.
    pub async fn upsert_heartbeat(&self, hb: &WorkerHeartbeat) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO worker_heartbeats (
                worker_id, pid, started_at, last_seen, status, current_batch_id,
                loaded_model, model_loaded_at, gpu_memory_used_bytes,
                gpu_memory_total_bytes, gpu_temperature_c, gpu_utilization_pct
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(worker_id) DO UPDATE SET
                pid = excluded.pid,
                last_seen = excluded.last_seen,
                status = excluded.status,
                current_batch_id = excluded.current_batch_id,
                loaded_model = excluded.loaded_model,
                model_loaded_at = excluded.model_loaded_at,
                gpu_memory_used_bytes = excluded.gpu_memory_used_bytes,
                gpu_memory_total_bytes = excluded.gpu_memory_total_bytes,
                gpu_temperature_c = excluded.gpu_temperature_c,
                gpu_utilization_pct = excluded.gpu_utilization_pct
            "#,
        )
        .bind(&hb.worker_id)
        .bind(hb.pid)
        .bind(hb.started_at)
        .bind(hb.last_seen)
        .bind(&hb.status)
        .bind(&hb.current_batch_id)
        .bind(&hb.loaded_model)
        .bind(hb.model_loaded_at)
        .bind(hb.gpu_memory_used_bytes)
        .bind(hb.gpu_memory_total_bytes)
        .bind(hb.gpu_temperature_c)
        .bind(hb.gpu_utilization_pct)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The freshest heartbeat across all workers, for health and admission
    /// checks.
    pub async fn latest_heartbeat(&self) -> Result<Option<WorkerHeartbeat>> {
        let hb = sqlx::query_as("SELECT * FROM worker_heartbeats ORDER BY last_seen DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(hb)
    }

    pub async fn get_heartbeat(&self, worker_id: &str) -> Result<Option<WorkerHeartbeat>> {
        let hb = sqlx::query_as("SELECT * FROM worker_heartbeats WHERE worker_id = ?")
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(hb)
    }

    /// True when no worker heartbeat is newer than `stale_after`.
    pub async fn worker_is_stale(&self, now: DateTime<Utc>, stale_after_s: i64) -> Result<bool> {
        match self.latest_heartbeat().await? {
            Some(hb) => Ok(hb.age_seconds(now) > stale_after_s),
            None => Ok(true),
        }
    }

    // ------------------------------------------------------------------
    // System status
    // ------------------------------------------------------------------

    pub async fn system_status(&self) -> Result<SystemStatus> {
        let status: Option<SystemStatus> = sqlx::query_as(
            "SELECT maintenance_mode, maintenance_reason, maintenance_started_at, maintenance_eta_minutes FROM system_status WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(status.unwrap_or_default())
    }

    pub async fn set_maintenance(
        &self,
        enabled: bool,
        reason: Option<&str>,
        eta_minutes: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<SystemStatus> {
        let started_at = if enabled { Some(now) } else { None };
        sqlx::query(
            r#"
            UPDATE system_status
            SET maintenance_mode = ?, maintenance_reason = ?, maintenance_started_at = ?,
                maintenance_eta_minutes = ?
            WHERE id = 1
            "#,
        )
        .bind(enabled)
        .bind(if enabled { reason } else { None })
        .bind(started_at)
        .bind(if enabled { eta_minutes } else { None })
        .execute(&self.pool)
        .await?;
        self.system_status().await
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::open_test_db;
    use crate::models::{WorkerHeartbeat, WorkerState};
    use chrono::{Duration, Utc};

    fn hb(worker_id: &str, last_seen: chrono::DateTime<Utc>) -> WorkerHeartbeat {
        WorkerHeartbeat {
            worker_id: worker_id.to_string(),
            pid: 4242,
            started_at: last_seen - Duration::minutes(5),
            last_seen,
            status: WorkerState::Idle.as_str().to_string(),
            current_batch_id: None,
            loaded_model: None,
            model_loaded_at: None,
            gpu_memory_used_bytes: Some(4_000_000_000),
            gpu_memory_total_bytes: Some(24_000_000_000),
            gpu_temperature_c: Some(55.0),
            gpu_utilization_pct: Some(12.0),
        }
    }

    #[tokio::test]
    async fn test_heartbeat_upsert_and_staleness() {
        let (db, _dir) = open_test_db().await;
        let now = Utc::now();

        assert!(db.worker_is_stale(now, 60).await.unwrap());

        db.upsert_heartbeat(&hb("w1", now - Duration::seconds(10))).await.unwrap();
        assert!(!db.worker_is_stale(now, 60).await.unwrap());

        db.upsert_heartbeat(&hb("w1", now - Duration::seconds(120))).await.unwrap();
        assert!(db.worker_is_stale(now, 60).await.unwrap());

        // A second, fresher worker unstales the system
        db.upsert_heartbeat(&hb("w2", now)).await.unwrap();
        let latest = db.latest_heartbeat().await.unwrap().unwrap();
        assert_eq!(latest.worker_id, "w2");
        assert!(!db.worker_is_stale(now, 60).await.unwrap());
    }

    #[tokio::test]
    async fn test_maintenance_toggle() {
        let (db, _dir) = open_test_db().await;
        let now = Utc::now();

        let st = db.system_status().await.unwrap();
        assert!(!st.maintenance_mode);

        let st = db
            .set_maintenance(true, Some("model upgrade"), Some(30), now)
            .await
            .unwrap();
        assert!(st.maintenance_mode);
        assert_eq!(st.maintenance_reason.as_deref(), Some("model upgrade"));
        assert_eq!(st.maintenance_eta_minutes, Some(30));

        let st = db.set_maintenance(false, None, None, now).await.unwrap();
        assert!(!st.maintenance_mode);
        assert!(st.maintenance_reason.is_none());
    }
}
