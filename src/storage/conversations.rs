//! Conversation storage
//!
//! Append-only chat logs, one JSON file per conversation.

use crate::storage::{check_file_id, StorageError};
use crate::types::message::{ConversationTurn, Role};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::Mutex;

const DEFAULT_TITLE: &str = "New Chat";
const TITLE_MAX_CHARS: usize = 50;

/// A persisted conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub messages: Vec<ConversationTurn>,
}

impl Conversation {
    /// A new conversation titled after its first user turn
    fn new(id: &str, turns: &[ConversationTurn]) -> Self {
        Self {
            id: id.to_string(),
            title: title_for(turns),
            created_at: Utc::now(),
            messages: Vec::new(),
        }
    }
}

/// First user message, cut to 50 characters with `...` appended
fn title_for(turns: &[ConversationTurn]) -> String {
    let Some(first) = turns
        .iter()
        .find(|t| t.role == Role::User && !t.content.trim().is_empty())
    else {
        return DEFAULT_TITLE.to_string();
    };
    let text = first.content.trim();
    if text.chars().count() > TITLE_MAX_CHARS {
        let cut: String = text.chars().take(TITLE_MAX_CHARS).collect();
        format!("{cut}...")
    } else {
        text.to_string()
    }
}

/// Contract for persisting finished exchanges
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// All turns of a conversation in chronological order (empty if unknown)
    async fn history(&self, conversation_id: &str) -> Result<Vec<ConversationTurn>, StorageError>;

    /// Append turns to the end of a conversation, creating it if needed
    async fn append(&self, conversation_id: &str, turns: &[ConversationTurn]) -> Result<(), StorageError>;
}

/// File-backed chat store
pub struct JsonChatStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonChatStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn chat_path(&self, id: &str) -> Result<PathBuf, StorageError> {
        check_file_id(id)?;
        Ok(self.dir.join(format!("{id}.json")))
    }

    /// Load a conversation, `None` if it was never written
    pub async fn get(&self, id: &str) -> Result<Option<Conversation>, StorageError> {
        let path = self.chat_path(id)?;
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        let json = tokio::fs::read_to_string(&path).await?;
        Ok(Some(serde_json::from_str(&json)?))
    }
}

#[async_trait]
impl ChatStore for JsonChatStore {
    async fn history(&self, conversation_id: &str) -> Result<Vec<ConversationTurn>, StorageError> {
        Ok(self
            .get(conversation_id)
            .await?
            .map(|c| c.messages)
            .unwrap_or_default())
    }

    async fn append(&self, conversation_id: &str, turns: &[ConversationTurn]) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;

        let mut conversation = self
            .get(conversation_id)
            .await?
            .unwrap_or_else(|| Conversation::new(conversation_id, turns));
        conversation.messages.extend_from_slice(turns);

        tokio::fs::create_dir_all(&self.dir).await?;
        let json = serde_json::to_string_pretty(&conversation)?;
        tokio::fs::write(self.chat_path(conversation_id)?, json).await?;

        tracing::debug!(
            "Appended {} turn(s) to conversation {} ({} total)",
            turns.len(),
            conversation_id,
            conversation.messages.len()
        );
        Ok(())
    }
}
