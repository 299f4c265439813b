//! kiln-core — shared foundation of the kiln batch inference service
//!
//! Holds everything both the API and the worker depend on: configuration,
//! the error taxonomy, persisted models and OpenAI-compatible wire shapes,
//! the SQLite job store, the filesystem blob store and the metrics registry.

pub mod blob;
pub mod config;
pub mod db;
pub mod error;
pub mod metrics;
pub mod models;

pub use blob::{BlobHandle, BlobStore};
pub use config::Config;
pub use db::Database;
pub use error::{Error, ErrorCode, Result};
pub use metrics::Metrics;
