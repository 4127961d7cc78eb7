//! Model handles
//!
//! [`ModelLoader`] and [`ModelHandle`] are the seam between the session and the
//! native library. The llama.cpp implementation lives here; tests plug in stubs.

use crate::inference::InferenceError;
use crate::types::config::LoadConfig;
use crate::types::sampling::SamplingParameters;
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel};
use llama_cpp_2::sampling::LlamaSampler;
use std::num::NonZeroU32;
use std::path::Path;
use std::sync::Arc;

/// Tokens considered by the repetition penalty
const REPEAT_LAST_N: i32 = 64;

/// Returned by the piece callback to continue or end decoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenAction {
    Continue,
    Stop,
}

/// Token counts of a finished generation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GenerationSummary {
    pub prompt_tokens: usize,
    pub output_tokens: usize,
}

/// A loaded model capable of streaming decode
pub trait ModelHandle: Send {
    /// Decode a continuation of `prompt`, calling `on_piece` with every non-empty
    /// piece of text until end-of-generation, the token budget, or `Stop`.
    fn generate(
        &mut self,
        prompt: &str,
        params: &SamplingParameters,
        on_piece: &mut dyn FnMut(&str) -> TokenAction,
    ) -> Result<GenerationSummary, InferenceError>;
}

/// Creates model handles from files on disk
pub trait ModelLoader: Send + Sync {
    fn load(&self, path: &Path, config: &LoadConfig) -> Result<Box<dyn ModelHandle>, InferenceError>;
}

/// llama.cpp loader. Owns the process-wide backend, so create one per process.
pub struct LlamaLoader {
    backend: Arc<LlamaBackend>,
}

impl LlamaLoader {
    pub fn init() -> Result<Self, InferenceError> {
        let backend = LlamaBackend::init().map_err(|e| InferenceError::Backend(e.to_string()))?;
        tracing::info!("llama.cpp backend initialized");
        Ok(Self {
            backend: Arc::new(backend),
        })
    }
}

impl ModelLoader for LlamaLoader {
    fn load(&self, path: &Path, config: &LoadConfig) -> Result<Box<dyn ModelHandle>, InferenceError> {
        if !path.is_file() {
            return Err(InferenceError::ModelNotFound(path.to_path_buf()));
        }

        let params = LlamaModelParams::default().with_n_gpu_layers(config.gpu_layers);
        let model = LlamaModel::load_from_file(&self.backend, path, &params)
            .map_err(|e| InferenceError::ModelLoad(e.to_string()))?;

        tracing::info!(
            "Loaded {} (ctx={}, batch={}, threads={}, gpu_layers={})",
            path.display(),
            config.context_size,
            config.batch_size,
            config.effective_threads(),
            config.gpu_layers
        );

        Ok(Box::new(LlamaHandle {
            model,
            backend: Arc::clone(&self.backend),
            config: config.clone(),
        }))
    }
}

/// Field order matters: the model is dropped before the last backend reference.
struct LlamaHandle {
    model: LlamaModel,
    backend: Arc<LlamaBackend>,
    config: LoadConfig,
}

fn build_sampler(params: &SamplingParameters) -> LlamaSampler {
    let seed = chrono::Utc::now().timestamp_subsec_nanos();
    LlamaSampler::chain_simple([
        LlamaSampler::penalties(REPEAT_LAST_N, params.repeat_penalty, 0.0, 0.0),
        LlamaSampler::top_k(i32::try_from(params.top_k).unwrap_or(i32::MAX)),
        LlamaSampler::top_p(params.top_p, 1),
        LlamaSampler::temp(params.temperature),
        LlamaSampler::dist(seed),
    ])
}

impl ModelHandle for LlamaHandle {
    fn generate(
        &mut self,
        prompt: &str,
        params: &SamplingParameters,
        on_piece: &mut dyn FnMut(&str) -> TokenAction,
    ) -> Result<GenerationSummary, InferenceError> {
        let tokens = self
            .model
            .str_to_token(prompt, AddBos::Always)
            .map_err(|e| InferenceError::Decode(format!("Failed to tokenize prompt: {e}")))?;

        let context_size = self.config.context_size as usize;
        if tokens.len() >= context_size {
            return Err(InferenceError::ContextOverflow {
                prompt_tokens: tokens.len(),
                context_size,
            });
        }

        let threads = self.config.effective_threads() as i32;
        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(self.config.context_size))
            .with_n_batch(self.config.batch_size)
            .with_n_threads(threads)
            .with_n_threads_batch(threads);
        let mut ctx = self
            .model
            .new_context(&self.backend, ctx_params)
            .map_err(|e| InferenceError::Decode(format!("Failed to create context: {e}")))?;

        let n_batch = (ctx.n_batch() as usize).max(1);
        for chunk in tokens.chunks(n_batch) {
            let mut batch = LlamaBatch::get_one(chunk)
                .map_err(|e| InferenceError::Decode(format!("Failed to create batch: {e}")))?;
            ctx.decode(&mut batch)
                .map_err(|e| InferenceError::Decode(format!("Prompt decode failed: {e}")))?;
        }

        let budget = (params.max_tokens as usize).min(context_size - tokens.len());
        let mut sampler = build_sampler(params);
        let mut decoder = encoding_rs::UTF_8.new_decoder();
        let mut output_tokens = 0;

        for _ in 0..budget {
            let token = sampler.sample(&ctx, -1);
            sampler.accept(token);

            if self.model.is_eog_token(token) {
                break;
            }
            output_tokens += 1;

            let piece = self
                .model
                .token_to_piece(token, &mut decoder, false, None)
                .map_err(|e| InferenceError::Decode(format!("Failed to detokenize: {e}")))?;

            if !piece.is_empty() && on_piece(&piece) == TokenAction::Stop {
                break;
            }

            let next = [token];
            let mut batch = LlamaBatch::get_one(&next)
                .map_err(|e| InferenceError::Decode(format!("Failed to create batch: {e}")))?;
            ctx.decode(&mut batch)
                .map_err(|e| InferenceError::Decode(format!("Decode failed: {e}")))?;
        }

        Ok(GenerationSummary {
            prompt_tokens: tokens.len(),
            output_tokens,
        })
    }
}
