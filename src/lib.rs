//! localchat library
//!
//! Local chat inference: a single-model session over llama.cpp, bot personas,
//! and JSON-file storage for models, settings and conversations.

pub mod bot;
pub mod inference;
pub mod storage;
pub mod types;
