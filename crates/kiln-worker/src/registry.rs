//! Model registry and load planning
//!
//! Records what each model needs from the accelerator and decides, per
//! dequeue, whether it fits in VRAM, needs CPU offload, or must be rejected.

use std::collections::HashMap;

use kiln_core::error::{Error, Result};

use crate::engine::{EngineHealth, LoadConfig};

/// Extra VRAM kept free beyond the computed requirement.
const SAFETY_BUFFER_BYTES: u64 = 1 << 30;

/// Per-model resource facts.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    /// Fraction of VRAM the engine should budget for this model
    pub gpu_memory_fraction: f64,
    pub max_context_len: u32,
    /// Resident size of the weights
    pub weights_bytes: u64,
    /// KV cache + activation overhead at full context
    pub overhead_bytes: u64,
    /// How much of the weights the engine can serve from CPU RAM
    pub cpu_offload_max_bytes: u64,
}

impl Default for ModelSpec {
    fn default() -> Self {
        // Conservative profile for models we have no entry for
        Self {
            gpu_memory_fraction: 0.90,
            max_context_len: 8192,
            weights_bytes: 16 << 30,
            overhead_bytes: 4 << 30,
            cpu_offload_max_bytes: 8 << 30,
        }
    }
}

impl ModelSpec {
    /// Total bytes this model needs somewhere (VRAM or CPU RAM).
    pub fn total_bytes(&self) -> u64 {
        self.weights_bytes + self.overhead_bytes
    }
}

/// Registry of known models plus a fallback profile.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    specs: HashMap<String, ModelSpec>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, model: impl Into<String>, spec: ModelSpec) {
        self.specs.insert(model.into(), spec);
    }

    pub fn spec_for(&self, model: &str) -> ModelSpec {
        self.specs.get(model).cloned().unwrap_or_default()
    }

    /// Decide the engine load config for `model` given the GPU snapshot and
    /// available CPU RAM.
    ///
    /// Fits entirely in VRAM: no offload. Shortfall: offload the missing
    /// bytes plus a safety buffer, capped by what the model tolerates.
    /// Does not fit even fully offloaded: `insufficient_memory`.
    pub fn plan_load(
        &self,
        model: &str,
        health: &EngineHealth,
        cpu_ram_available_bytes: u64,
    ) -> Result<LoadConfig> {
        let spec = self.spec_for(model);
        let vram_budget =
            (health.memory_total_bytes as f64 * spec.gpu_memory_fraction) as u64;
        let need = spec.total_bytes() + SAFETY_BUFFER_BYTES;

        let offload = if need <= vram_budget {
            0
        } else {
            let shortfall = need - vram_budget;
            if shortfall > spec.cpu_offload_max_bytes || shortfall > cpu_ram_available_bytes {
                return Err(Error::InsufficientMemory(format!(
                    "{} needs {} bytes, VRAM budget {} with at most {} offloadable ({} CPU RAM free)",
                    model, need, vram_budget, spec.cpu_offload_max_bytes, cpu_ram_available_bytes
                )));
            }
            shortfall
        };

        Ok(LoadConfig {
            gpu_memory_fraction: spec.gpu_memory_fraction,
            max_context_len: spec.max_context_len,
            cpu_offload_bytes: offload,
        })
    }
}
