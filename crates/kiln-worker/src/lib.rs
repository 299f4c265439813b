//! kiln-worker — single-GPU batch scheduler
//!
//! The worker claims one job at a time from the job store, drives the
//! external inference engine (load/unload/generate), checkpoints output at
//! chunk granularity, and fires the result-handler pipeline when a batch
//! completes. The expiry sweeper shares this crate.

pub mod chunking;
pub mod engine;
pub mod handlers;
pub mod registry;
pub mod sweeper;
pub mod worker;

pub use engine::{Engine, EngineHealth, HttpEngine, LoadConfig};
pub use handlers::{default_handlers, HandlerPipeline, ResultHandler};
pub use registry::{ModelRegistry, ModelSpec};
pub use sweeper::Sweeper;
pub use worker::Worker;
