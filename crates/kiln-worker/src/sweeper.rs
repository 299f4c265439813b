//! Expiry sweeper
//!
//! Interval task that marks overdue non-terminal jobs `expired` and removes
//! files past their retention window. A worker mid-chunk on an expired job
//! notices the status at its next boundary and stops.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use kiln_core::{BlobStore, Database, Metrics};

/// Sweep cadence; expiry is minute-granular at best.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

pub struct Sweeper {
    db: Database,
    blobs: BlobStore,
    metrics: Metrics,
}

impl Sweeper {
    pub fn new(db: Database, blobs: BlobStore, metrics: Metrics) -> Self {
        Self { db, blobs, metrics }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut timer = tokio::time::interval(SWEEP_INTERVAL);
        timer.tick().await;
        loop {
            tokio::select! {
                _ = timer.tick() => {
                    self.sweep().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("sweeper stopped");
    }

    /// One pass: expire overdue jobs, then prune expired files.
    pub async fn sweep(&self) {
        let now = Utc::now();

        match self.db.expire_overdue(now).await {
            Ok(ids) => {
                for id in &ids {
                    tracing::warn!(batch_id = %id, "job expired");
                    self.metrics.transition("expired");
                    // The partial output will never be promoted
                    if let Err(e) = self.blobs.discard_partial(id).await {
                        tracing::warn!(batch_id = %id, error = %e, "discarding partial failed");
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "expiry sweep failed"),
        }

        match self.db.expired_files(now).await {
            Ok(files) => {
                for file in files {
                    match self.db.delete_file(&file.id).await {
                        Ok(record) => {
                            tracing::info!(file_id = %record.id, "expired file removed");
                            // Best-effort on the blob, and only once no other
                            // file row shares the object
                            match self.db.files_with_blob_ref(&record.blob_ref).await {
                                Ok(0) => {
                                    if let Err(e) = self.blobs.delete(&record.blob_ref).await {
                                        tracing::warn!(file_id = %record.id, error = %e, "blob delete failed");
                                    }
                                }
                                Ok(_) => {}
                                Err(e) => tracing::warn!(error = %e, "blob refcount check failed"),
                            }
                        }
                        // Still referenced by a live job; retried next sweep
                        Err(e) => tracing::debug!(file_id = %file.id, error = %e, "file not deletable yet"),
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "file retention sweep failed"),
        }
    }
}
