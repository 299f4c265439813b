//! Prometheus metrics
//!
//! One registry owned by the process, shared by the API and the worker.
//! Exported as text exposition at `GET /metrics`.

use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry, TextEncoder,
};

use crate::error::{Error, Result};

/// All service metrics, cheap to clone.
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    /// HTTP requests by endpoint, method and status class
    pub http_requests: IntCounterVec,
    /// HTTP request latency seconds by endpoint
    pub http_latency: HistogramVec,
    /// Requests rejected by the rate limiter, by route class
    pub rate_limited: IntCounterVec,

    /// Batch state transitions, by target status
    pub batch_transitions: IntCounterVec,
    /// Non-terminal jobs in the store
    pub queue_depth: IntGauge,
    /// Jobs by current status
    pub jobs_by_status: IntGaugeVec,

    /// Seconds spent per generate chunk
    pub chunk_duration: Histogram,
    /// Throughput of the in-flight job
    pub tokens_per_s: Gauge,
    /// GPU gauges mirrored from the worker heartbeat
    pub gpu_memory_pct: Gauge,
    pub gpu_temperature_c: Gauge,
    pub gpu_utilization_pct: Gauge,

    /// Handler pipeline outcomes, by handler name and outcome
    pub handler_outcomes: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let http_requests = IntCounterVec::new(
            Opts::new("kiln_http_requests_total", "HTTP requests served"),
            &["endpoint", "method", "status"],
        )
        .map_err(internal)?;
        let http_latency = HistogramVec::new(
            HistogramOpts::new("kiln_http_latency_seconds", "HTTP request latency")
                .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
            &["endpoint"],
        )
        .map_err(internal)?;
        let rate_limited = IntCounterVec::new(
            Opts::new("kiln_rate_limited_total", "Requests rejected by the rate limiter"),
            &["route"],
        )
        .map_err(internal)?;

        let batch_transitions = IntCounterVec::new(
            Opts::new("kiln_batch_transitions_total", "Batch state transitions"),
            &["to"],
        )
        .map_err(internal)?;
        let queue_depth =
            IntGauge::new("kiln_queue_depth", "Non-terminal jobs in the store").map_err(internal)?;
        let jobs_by_status = IntGaugeVec::new(
            Opts::new("kiln_jobs_by_status", "Jobs by current status"),
            &["status"],
        )
        .map_err(internal)?;

        let chunk_duration = Histogram::with_opts(
            HistogramOpts::new("kiln_chunk_duration_seconds", "Engine generate call duration")
                .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
        )
        .map_err(internal)?;
        let tokens_per_s =
            Gauge::new("kiln_tokens_per_second", "Throughput of the in-flight job").map_err(internal)?;
        let gpu_memory_pct =
            Gauge::new("kiln_gpu_memory_pct", "GPU memory usage percent").map_err(internal)?;
        let gpu_temperature_c =
            Gauge::new("kiln_gpu_temperature_celsius", "GPU temperature").map_err(internal)?;
        let gpu_utilization_pct =
            Gauge::new("kiln_gpu_utilization_pct", "GPU utilization percent").map_err(internal)?;

        let handler_outcomes = IntCounterVec::new(
            Opts::new("kiln_handler_outcomes_total", "Result handler outcomes"),
            &["handler", "outcome"],
        )
        .map_err(internal)?;

        for collector in [
            Box::new(http_requests.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(http_latency.clone()),
            Box::new(rate_limited.clone()),
            Box::new(batch_transitions.clone()),
            Box::new(queue_depth.clone()),
            Box::new(jobs_by_status.clone()),
            Box::new(chunk_duration.clone()),
            Box::new(tokens_per_s.clone()),
            Box::new(gpu_memory_pct.clone()),
            Box::new(gpu_temperature_c.clone()),
            Box::new(gpu_utilization_pct.clone()),
            Box::new(handler_outcomes.clone()),
        ] {
            registry.register(collector).map_err(internal)?;
        }

        Ok(Self {
            registry,
            http_requests,
            http_latency,
            rate_limited,
            batch_transitions,
            queue_depth,
            jobs_by_status,
            chunk_duration,
            tokens_per_s,
            gpu_memory_pct,
            gpu_temperature_c,
            gpu_utilization_pct,
            handler_outcomes,
        })
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn export(&self) -> Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buf)
            .map_err(internal)?;
        String::from_utf8(buf).map_err(|e| Error::internal(format!("metrics encoding: {}", e)))
    }

    /// Record one batch transition.
    pub fn transition(&self, to: &str) {
        self.batch_transitions.with_label_values(&[to]).inc();
    }
}

fn internal(e: prometheus::Error) -> Error {
    Error::internal(format!("metrics registry: {}", e))
}
