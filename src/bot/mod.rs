//! Bots
//!
//! A bot is a persona: a system prompt, a base model and default sampling
//! parameters. Bot definitions are JSON files in the bots directory.

pub mod manager;

pub use manager::{BotManager, ChatReply, ChatRequest};

use crate::storage::StorageError;
use crate::types::model::normalize_model_id;
use crate::types::sampling::{SamplingOverrides, SamplingParameters};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Identifier of the bot that always exists
pub const DEFAULT_BOT_ID: &str = "assistant";

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful, knowledgeable and precise assistant. \
Answer accurately and concisely while staying friendly and professional.";

/// Bot errors
#[derive(Debug, Error)]
pub enum BotError {
    #[error("Message is empty")]
    EmptyMessage,
    #[error("Unknown bot: {0}")]
    UnknownBot(String),
    #[error("Model {0} is not available")]
    ModelUnavailable(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A chat persona
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bot {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub system_prompt: String,
    /// Identifier of the model this bot runs on
    pub base_model: String,
    /// Defaults for every request to this bot
    #[serde(default)]
    pub parameters: SamplingParameters,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Bot {
    /// The built-in general purpose assistant
    pub fn default_assistant(base_model: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: DEFAULT_BOT_ID.to_string(),
            name: "Assistant".to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            base_model: base_model.into(),
            parameters: SamplingParameters {
                top_k: 50,
                repeat_penalty: 1.2,
                ..SamplingParameters::default()
            },
            created_at: now,
            updated_at: now,
        }
    }

    /// Sampling parameters for one request: request values win over the bot's
    pub fn resolve_parameters(&self, overrides: &SamplingOverrides) -> SamplingParameters {
        self.parameters.merged(overrides)
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn base_model_identifier(&self) -> String {
        normalize_model_id(&self.base_model)
    }
}

/// Read every `*.json` bot definition in `dir`
///
/// A missing directory yields no bots. Files that fail to parse are skipped.
pub fn load_bots(dir: &Path) -> Result<Vec<Bot>, StorageError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut bots = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let json = fs::read_to_string(&path)?;
        match serde_json::from_str::<Bot>(&json) {
            Ok(bot) => bots.push(bot),
            Err(e) => tracing::warn!("Skipping bot file {}: {}", path.display(), e),
        }
    }

    bots.sort_by(|a, b| a.id.cmp(&b.id));
    tracing::debug!("Loaded {} bot(s) from {}", bots.len(), dir.display());
    Ok(bots)
}
