//! LLM inference
//!
//! Model loading through llama.cpp, prompt assembly, response cleanup and
//! token streaming.

pub mod engine;
pub mod model;
pub mod normalize;
pub mod prompt;
pub mod streaming;

pub use engine::InferenceSession;
pub use streaming::{ChatChunk, GenerationStream, StreamToken};

use std::path::PathBuf;
use thiserror::Error;

/// Inference errors
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("Failed to initialize backend: {0}")]
    Backend(String),
    #[error("Unknown model: {0}")]
    UnknownModel(String),
    #[error("Model file not found: {0}")]
    ModelNotFound(PathBuf),
    #[error("Failed to load model: {0}")]
    ModelLoad(String),
    #[error("{0}")]
    Decode(String),
    #[error("Prompt is {prompt_tokens} tokens but the context window is {context_size}")]
    ContextOverflow { prompt_tokens: usize, context_size: usize },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
