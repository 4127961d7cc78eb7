//! Sampling parameter types

use serde::{Deserialize, Serialize};

/// Largest top-k the native sampler accepts (it takes an `i32`)
pub const MAX_TOP_K: u32 = i32::MAX as u32;

/// Knobs controlling randomness and length of generated text
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParameters {
    /// Temperature (> 0)
    pub temperature: f32,
    /// Maximum number of tokens to generate
    #[serde(alias = "max_new_tokens")]
    pub max_tokens: u32,
    /// Nucleus sampling cutoff, in (0, 1]
    pub top_p: f32,
    /// Top-k sampling parameter (>= 1)
    pub top_k: u32,
    /// Repetition penalty (>= 1)
    #[serde(alias = "repetition_penalty")]
    pub repeat_penalty: f32,
}

impl Default for SamplingParameters {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 1000,
            top_p: 0.95,
            top_k: 40,
            repeat_penalty: 1.1,
        }
    }
}

impl SamplingParameters {
    /// Clamp every field into its valid range.
    pub fn validated(mut self) -> Self {
        if !self.temperature.is_finite() || self.temperature <= 0.0 {
            self.temperature = 0.01;
        }
        self.temperature = self.temperature.min(2.0);
        self.max_tokens = self.max_tokens.max(1);
        if !self.top_p.is_finite() || self.top_p <= 0.0 {
            self.top_p = 0.01;
        }
        self.top_p = self.top_p.min(1.0);
        self.top_k = self.top_k.clamp(1, MAX_TOP_K);
        if !self.repeat_penalty.is_finite() || self.repeat_penalty < 1.0 {
            self.repeat_penalty = 1.0;
        }
        self
    }

    /// Overlay request overrides on top of these defaults.
    pub fn merged(self, overrides: &SamplingOverrides) -> Self {
        Self {
            temperature: overrides.temperature.unwrap_or(self.temperature),
            max_tokens: overrides.max_tokens.unwrap_or(self.max_tokens),
            top_p: overrides.top_p.unwrap_or(self.top_p),
            top_k: overrides.top_k.unwrap_or(self.top_k),
            repeat_penalty: overrides.repeat_penalty.unwrap_or(self.repeat_penalty),
        }
        .validated()
    }
}

/// Per-request overrides. Absent fields fall back to the bot's defaults
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingOverrides {
    pub temperature: Option<f32>,
    #[serde(alias = "max_new_tokens")]
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    #[serde(alias = "repetition_penalty")]
    pub repeat_penalty: Option<f32>,
}
