//! Runtime configuration (§6 "CLI/config (minimal)").
//!
//! The core does not own a CLI or a YAML binder — those live in the
//! out-of-scope control plane. This is the thin, loadable surface the
//! runtime itself consumes: worker count, buffer sizing, queue capacities,
//! and the set of origins the watermark processor tracks.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Result, RuntimeError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub number_of_worker_threads: usize,
    pub buffer_size: usize,
    pub number_of_buffers_in_global_pool: usize,
    pub number_of_buffers_per_pipeline: usize,
    pub number_of_buffers_in_source_local_pool: usize,
    pub task_queue_capacity: usize,
    pub sequence_shredder_capacity: usize,
    pub watermark_origins: Vec<u64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            number_of_worker_threads: num_cpus::get().clamp(2, 32),
            buffer_size: 4096,
            number_of_buffers_in_global_pool: 1024,
            number_of_buffers_per_pipeline: 64,
            number_of_buffers_in_source_local_pool: 64,
            task_queue_capacity: 1000,
            sequence_shredder_capacity: 4096,
            watermark_origins: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    /// Load from a JSON config file, falling back to defaults for absent fields.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| RuntimeError::Configuration(format!("malformed config: {e}")))
    }

    /// Overlay `NEBULA_*` environment variables onto an existing config.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("NEBULA_NUMBER_OF_WORKER_THREADS") {
            if let Ok(v) = v.parse() {
                self.number_of_worker_threads = v;
            }
        }
        if let Ok(v) = std::env::var("NEBULA_BUFFER_SIZE") {
            if let Ok(v) = v.parse() {
                self.buffer_size = v;
            }
        }
        if let Ok(v) = std::env::var("NEBULA_TASK_QUEUE_CAPACITY") {
            if let Ok(v) = v.parse() {
                self.task_queue_capacity = v;
            }
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.number_of_worker_threads == 0 {
            return Err(RuntimeError::Configuration(
                "number_of_worker_threads must be >= 1".into(),
            ));
        }
        if self.buffer_size == 0 {
            return Err(RuntimeError::Configuration(
                "buffer_size must be > 0".into(),
            ));
        }
        if self.task_queue_capacity == 0 {
            return Err(RuntimeError::Configuration(
                "task_queue_capacity must be > 0".into(),
            ));
        }
        Ok(())
    }
}
