//! Configuration types
//!
//! Model load configuration.

use serde::{Deserialize, Serialize};

/// Parameters used when acquiring a model handle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadConfig {
    /// Context window size in tokens
    pub context_size: u32,
    /// Prompt batch size
    pub batch_size: u32,
    /// Decode threads. `None` uses every available core
    pub threads: Option<u32>,
    /// Number of GPU layers to offload (0 = CPU only)
    pub gpu_layers: u32,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            context_size: 2048,
            batch_size: 512,
            threads: None,
            gpu_layers: 0,
        }
    }
}

impl LoadConfig {
    /// Thread count to hand to the backend
    pub fn effective_threads(&self) -> u32 {
        match self.threads {
            Some(n) if n > 0 => n,
            _ => std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1),
        }
    }
}
