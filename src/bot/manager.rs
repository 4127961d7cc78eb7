//! Bot manager
//!
//! Routes chat requests to a bot, drives the inference session and records
//! finished exchanges in the chat store.

use crate::bot::{load_bots, Bot, BotError};
use crate::inference::{GenerationStream, InferenceSession, StreamToken};
use crate::storage::conversations::ChatStore;
use crate::types::message::ConversationTurn;
use crate::types::model::normalize_model_id;
use crate::types::sampling::SamplingOverrides;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

/// Body of a chat request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub parameters: SamplingOverrides,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            parameters: SamplingOverrides::default(),
        }
    }
}

pub struct BotManager {
    session: Arc<InferenceSession>,
    store: Arc<dyn ChatStore>,
    bots: HashMap<String, Bot>,
}

impl BotManager {
    /// Build a manager over `bots`. `default_bot` is added unless a bot with the
    /// same id is already among them.
    pub fn new(
        session: Arc<InferenceSession>,
        store: Arc<dyn ChatStore>,
        bots: impl IntoIterator<Item = Bot>,
        default_bot: Bot,
    ) -> Self {
        let mut bots: HashMap<String, Bot> = bots.into_iter().map(|b| (b.id.clone(), b)).collect();
        bots.entry(default_bot.id.clone()).or_insert(default_bot);
        Self { session, store, bots }
    }

    /// Load bot definitions from `dir`
    pub fn from_dir(
        dir: &Path,
        session: Arc<InferenceSession>,
        store: Arc<dyn ChatStore>,
        default_bot: Bot,
    ) -> Result<Self, BotError> {
        let bots = load_bots(dir)?;
        Ok(Self::new(session, store, bots, default_bot))
    }

    pub fn get_bot(&self, bot_id: &str) -> Option<&Bot> {
        self.bots.get(bot_id)
    }

    /// All bots, sorted by id
    pub fn list_bots(&self) -> Vec<&Bot> {
        let mut bots: Vec<&Bot> = self.bots.values().collect();
        bots.sort_by(|a, b| a.id.cmp(&b.id));
        bots
    }

    /// Point a bot at another model for the rest of this process
    pub fn set_base_model(&mut self, bot_id: &str, model_id: &str) -> Result<(), BotError> {
        let bot = self
            .bots
            .get_mut(bot_id)
            .ok_or_else(|| BotError::UnknownBot(bot_id.to_string()))?;
        bot.base_model = normalize_model_id(model_id);
        bot.updated_at = Utc::now();
        tracing::info!("Bot {} now uses {}", bot_id, bot.base_model);
        Ok(())
    }

    pub fn session(&self) -> &Arc<InferenceSession> {
        &self.session
    }

    /// Start a reply from `bot_id` to `request` within `conversation_id`
    ///
    /// The exchange is written to the chat store once the returned reply has been
    /// read to the end without an error.
    pub async fn chat(&self, bot_id: &str, conversation_id: &str, request: ChatRequest) -> Result<ChatReply, BotError> {
        let message = request.message.trim();
        if message.is_empty() {
            return Err(BotError::EmptyMessage);
        }

        let bot = self
            .bots
            .get(bot_id)
            .ok_or_else(|| BotError::UnknownBot(bot_id.to_string()))?;

        let model_id = bot.base_model_identifier();
        if !self.session.load(&model_id).await {
            return Err(BotError::ModelUnavailable(model_id));
        }

        let history = self.store.history(conversation_id).await?;
        let params = bot.resolve_parameters(&request.parameters);
        let user_turn = ConversationTurn::user(message);

        // Reasserts the model under the generation lock in case another request swapped it
        let stream = self
            .session
            .generate_with_model(&model_id, &history, bot.system_prompt(), message, params)
            .await;

        tracing::info!(
            "Chat {} with bot {} on {} (request {})",
            conversation_id,
            bot.id,
            model_id,
            stream.id()
        );

        Ok(ChatReply {
            stream,
            store: Arc::clone(&self.store),
            conversation_id: conversation_id.to_string(),
            user_turn,
            response: String::new(),
            failed: false,
            finished: false,
        })
    }
}

/// A streaming reply
///
/// Relays the units of the generation and accumulates the response text. After
/// the last unit, a successful exchange is appended to the chat store. Dropping
/// the reply early cancels generation and records nothing.
pub struct ChatReply {
    stream: GenerationStream,
    store: Arc<dyn ChatStore>,
    conversation_id: String,
    user_turn: ConversationTurn,
    response: String,
    failed: bool,
    finished: bool,
}

impl ChatReply {
    pub fn id(&self) -> Uuid {
        self.stream.id()
    }

    /// Next unit, `None` once the reply is complete
    pub async fn next(&mut self) -> Option<StreamToken> {
        if self.finished {
            return None;
        }
        match self.stream.next().await {
            Some(token) => {
                match &token {
                    StreamToken::Token(text) => self.response.push_str(text),
                    StreamToken::Error(_) => self.failed = true,
                }
                Some(token)
            }
            None => {
                self.finished = true;
                self.persist().await;
                None
            }
        }
    }

    /// Response text received so far
    pub fn response(&self) -> &str {
        &self.response
    }

    /// Whether generation ended with an error unit
    pub fn failed(&self) -> bool {
        self.failed
    }

    async fn persist(&self) {
        if self.failed {
            tracing::debug!("Not recording failed exchange in {}", self.conversation_id);
            return;
        }
        let turns = [
            self.user_turn.clone(),
            ConversationTurn::assistant(self.response.trim()),
        ];
        if let Err(e) = self.store.append(&self.conversation_id, &turns).await {
            tracing::warn!("Failed to save exchange to {}: {}", self.conversation_id, e);
        }
    }
}
