//! Engine interface
//!
//! The inference engine is an external, accelerator-owning process; the
//! worker drives it exclusively through this trait. `HttpEngine` talks to a
//! local engine daemon over its JSON API.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use kiln_core::error::{Error, Result};
use kiln_core::models::wire::{ChatBody, Usage};

/// Per-model load parameters handed to the engine (see the model registry).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadConfig {
    /// Fraction of VRAM the engine may claim for this model
    pub gpu_memory_fraction: f64,
    /// Context window to configure
    pub max_context_len: u32,
    /// Bytes of weights to keep in CPU RAM instead of VRAM
    pub cpu_offload_bytes: u64,
}

/// One prompt handed to `generate`, translated from an input line.
#[derive(Debug, Clone, Serialize)]
pub struct GenerateRequest {
    pub custom_id: String,
    #[serde(flatten)]
    pub body: ChatBody,
}

/// Successful completion for one prompt.
#[derive(Debug, Clone, Deserialize)]
pub struct Completion {
    pub content: String,
    pub usage: Usage,
}

/// Per-prompt result: the engine either completes a prompt or reports an
/// error for it; one bad prompt never fails the call.
#[derive(Debug, Clone)]
pub enum GenerateOutcome {
    Completion(Completion),
    Error { message: String },
}

/// Snapshot of the accelerator behind the engine.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineHealth {
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub temperature_c: f64,
    pub utilization_pct: f64,
    pub loaded_model: Option<String>,
}

impl EngineHealth {
    pub fn memory_pct(&self) -> f64 {
        if self.memory_total_bytes == 0 {
            return 0.0;
        }
        self.memory_used_bytes as f64 / self.memory_total_bytes as f64 * 100.0
    }

    /// Fraction of VRAM currently free, 0.0..=1.0
    pub fn free_fraction(&self) -> f64 {
        if self.memory_total_bytes == 0 {
            return 1.0;
        }
        1.0 - (self.memory_used_bytes as f64 / self.memory_total_bytes as f64)
    }

    pub fn free_bytes(&self) -> u64 {
        self.memory_total_bytes.saturating_sub(self.memory_used_bytes)
    }
}

/// The worker's only doorway to the accelerator.
#[async_trait]
pub trait Engine: Send + Sync {
    async fn load(&self, model: &str, config: &LoadConfig) -> Result<()>;
    async fn unload(&self) -> Result<()>;
    /// One result per request, in request order.
    async fn generate(&self, requests: &[GenerateRequest]) -> Result<Vec<GenerateOutcome>>;
    async fn health(&self) -> Result<EngineHealth>;
}

// ============================================================================
// HTTP engine client
// ============================================================================

/// Client for an engine daemon exposing load/unload/generate/health over
/// HTTP on localhost.
pub struct HttpEngine {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct LoadRequest<'a> {
    model: &'a str,
    #[serde(flatten)]
    config: &'a LoadConfig,
}

#[derive(Debug, Serialize)]
struct GenerateCall<'a> {
    requests: &'a [GenerateRequest],
}

#[derive(Debug, Deserialize)]
struct GenerateReply {
    results: Vec<GenerateResult>,
}

/// Wire shape of one generate result; exactly one of `content`/`error` set.
#[derive(Debug, Deserialize)]
struct GenerateResult {
    #[allow(dead_code)]
    custom_id: String,
    content: Option<String>,
    usage: Option<Usage>,
    error: Option<String>,
}

impl HttpEngine {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: base_url.into(),
            client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl Engine for HttpEngine {
    async fn load(&self, model: &str, config: &LoadConfig) -> Result<()> {
        let resp = self
            .client
            .post(self.url("/load"))
            .json(&LoadRequest { model, config })
            .send()
            .await
            .map_err(|e| Error::ModelLoadFailed(format!("{}: {}", model, e)))?;
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::ModelLoadFailed(format!("{}: {}", model, text)));
        }
        Ok(())
    }

    async fn unload(&self) -> Result<()> {
        let resp = self
            .client
            .post(self.url("/unload"))
            .send()
            .await
            .map_err(|e| Error::internal(format!("engine unload: {}", e)))?;
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::internal(format!("engine unload: {}", text)));
        }
        Ok(())
    }

    async fn generate(&self, requests: &[GenerateRequest]) -> Result<Vec<GenerateOutcome>> {
        let resp = self
            .client
            .post(self.url("/generate"))
            .json(&GenerateCall { requests })
            .send()
            .await
            .map_err(|e| Error::internal(format!("engine generate: {}", e)))?;
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::internal(format!("engine generate: {}", text)));
        }
        let reply: GenerateReply = resp
            .json()
            .await
            .map_err(|e| Error::internal(format!("engine generate reply: {}", e)))?;

        if reply.results.len() != requests.len() {
            return Err(Error::internal(format!(
                "engine returned {} results for {} requests",
                reply.results.len(),
                requests.len()
            )));
        }

        Ok(reply
            .results
            .into_iter()
            .map(|r| match (r.content, r.error) {
                (Some(content), None) => GenerateOutcome::Completion(Completion {
                    content,
                    usage: r.usage.unwrap_or_default(),
                }),
                (_, Some(message)) => GenerateOutcome::Error { message },
                (None, None) => GenerateOutcome::Error {
                    message: "engine returned neither content nor error".to_string(),
                },
            })
            .collect())
    }

    async fn health(&self) -> Result<EngineHealth> {
        let resp = self
            .client
            .get(self.url("/health"))
            .send()
            .await
            .map_err(|e| Error::GpuUnhealthy(format!("engine health probe: {}", e)))?;
        if !resp.status().is_success() {
            return Err(Error::GpuUnhealthy(format!(
                "engine health probe: HTTP {}",
                resp.status()
            )));
        }
        resp.json()
            .await
            .map_err(|e| Error::GpuUnhealthy(format!("engine health reply: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_fractions() {
        let h = EngineHealth {
            memory_used_bytes: 6_000_000_000,
            memory_total_bytes: 24_000_000_000,
            temperature_c: 60.0,
            utilization_pct: 40.0,
            loaded_model: None,
        };
        assert_eq!(h.memory_pct(), 25.0);
        assert!((h.free_fraction() - 0.75).abs() < 1e-9);
        assert_eq!(h.free_bytes(), 18_000_000_000);
    }

    #[test]
    fn test_zero_total_memory_reads_as_free() {
        let h = EngineHealth::default();
        assert_eq!(h.memory_pct(), 0.0);
        assert_eq!(h.free_fraction(), 1.0);
    }
}
