use std::path::Path;

use tracing::{info, warn};

use crate::error::NodeError;
use serving_common::{DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE};

/// Synchronous text generation backend for one GPU.
///
/// The real model is opaque to the pipeline: `generate` blocks, so workers
/// always call it through `spawn_blocking`. The mock backend serves
/// deterministic text for development and tests.
#[derive(Debug)]
pub struct ModelRunner {
    gpu_id: usize,
    device: String,
    mock: bool,
}

impl ModelRunner {
    /// Initialize a runner bound to one GPU (or the mock backend).
    pub fn load(gpu_id: usize, mock: bool) -> Self {
        let device = if mock {
            "mock".to_string()
        } else if detect_gpu_count() > 0 {
            format!("cuda:{gpu_id}")
        } else {
            warn!("No GPUs detected, model runner falls back to CPU");
            "cpu".to_string()
        };
        info!(gpu_id, device = %device, "Model runner initialized");
        Self {
            gpu_id,
            device,
            mock,
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// Generate a completion for one prompt. Blocking.
    pub fn generate(
        &self,
        prompt: &str,
        max_tokens: Option<u32>,
        temperature: Option<f64>,
    ) -> Result<String, NodeError> {
        if prompt.is_empty() {
            return Err(NodeError::Generate("empty prompt".to_string()));
        }
        let max_tokens = max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
        let _temperature = temperature.unwrap_or(DEFAULT_TEMPERATURE);

        let prefix: String = prompt.chars().take(50).collect();
        if self.mock {
            Ok(format!(
                "[MOCK (GPU {})] Generated {} tokens for: {}...",
                self.gpu_id, max_tokens, prefix
            ))
        } else {
            // Placeholder until a real model backend is wired in.
            Ok(format!(
                "[PLACEHOLDER {}] Generated response for prompt: {}...",
                self.device, prefix
            ))
        }
    }
}

/// Number of GPUs visible to this process.
///
/// Counts the per-device entries the NVIDIA driver exposes under /proc;
/// returns 0 when the driver is absent.
pub fn detect_gpu_count() -> usize {
    gpu_count_at(Path::new("/proc/driver/nvidia/gpus"))
}

fn gpu_count_at(path: &Path) -> usize {
    match std::fs::read_dir(path) {
        Ok(entries) => entries.filter_map(|entry| entry.ok()).count(),
        Err(_) => 0,
    }
}
