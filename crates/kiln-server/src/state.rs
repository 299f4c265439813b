//! Shared API state

use std::sync::Arc;

use kiln_core::{BlobStore, Config, Database, Metrics};

use crate::ratelimit::RateLimiter;

/// Everything a handler needs; cheap to clone per request.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub blobs: BlobStore,
    pub cfg: Arc<Config>,
    pub metrics: Metrics,
    pub limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(db: Database, blobs: BlobStore, cfg: Config, metrics: Metrics) -> Self {
        Self {
            db,
            blobs,
            cfg: Arc::new(cfg),
            metrics,
            limiter: Arc::new(RateLimiter::new()),
        }
    }
}
