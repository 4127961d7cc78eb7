//! Prompt assembly
//!
//! Renders a system prompt, a bounded window of history and the new user message
//! into the plain-text transcript the model continues.

use crate::types::message::{ConversationTurn, Role};
use serde::{Deserialize, Serialize};

/// How conversations are rendered into a prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptPolicy {
    /// Number of most recent history turns included (older turns are dropped)
    pub history_window: usize,
    /// Label in front of user turns
    pub user_label: String,
    /// Label in front of assistant turns, also used as the response cue
    pub assistant_label: String,
    /// Placed between rendered turns
    pub separator: String,
}

impl Default for PromptPolicy {
    fn default() -> Self {
        Self {
            history_window: 3,
            user_label: "User".to_string(),
            assistant_label: "Assistant".to_string(),
            separator: "\n".to_string(),
        }
    }
}

impl PromptPolicy {
    /// Replace blank labels and separators with the defaults
    pub fn validate(&mut self) {
        let defaults = Self::default();
        if self.user_label.trim().is_empty() {
            self.user_label = defaults.user_label;
        }
        if self.assistant_label.trim().is_empty() {
            self.assistant_label = defaults.assistant_label;
        }
        if self.separator.is_empty() {
            self.separator = defaults.separator;
        }
    }

    fn label(&self, role: Role) -> Option<&str> {
        match role {
            Role::User => Some(&self.user_label),
            Role::Assistant => Some(&self.assistant_label),
            Role::System => None,
        }
    }

    /// Build the prompt text
    ///
    /// The system prompt goes first without a label. System turns inside `history`
    /// are skipped; only the last `history_window` remaining turns are rendered.
    pub fn assemble(&self, history: &[ConversationTurn], system_prompt: &str, user_message: &str) -> String {
        let mut parts: Vec<String> = Vec::new();

        let system_prompt = system_prompt.trim();
        if !system_prompt.is_empty() {
            parts.push(system_prompt.to_string());
        }

        let turns: Vec<&ConversationTurn> = history.iter().filter(|t| t.role != Role::System).collect();
        let start = turns.len().saturating_sub(self.history_window);
        for turn in &turns[start..] {
            if let Some(label) = self.label(turn.role) {
                parts.push(format!("{}: {}", label, turn.content.trim()));
            }
        }

        parts.push(format!("{}: {}", self.user_label, user_message.trim()));
        parts.push(format!("{}:", self.assistant_label));

        parts.join(&self.separator)
    }

    /// Text that means the model has started writing the user's next turn
    pub fn stop_sequences(&self) -> Vec<String> {
        vec![format!("{}{}:", self.separator, self.user_label)]
    }

    /// Labels the model tends to echo at the start of its answer
    pub fn role_labels(&self) -> Vec<String> {
        vec![
            format!("{}:", self.user_label),
            format!("{}:", self.assistant_label),
        ]
    }
}
