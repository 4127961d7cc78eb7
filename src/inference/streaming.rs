//! Token streaming
//!
//! Generation runs on a blocking worker and hands text to the caller through a
//! bounded channel. Dropping or closing the [`GenerationStream`] stops the worker
//! at its next token.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Capacity of the channel between the decode worker and the consumer
pub(crate) const STREAM_CAPACITY: usize = 64;

/// One unit of a generated response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamToken {
    /// New response text (the first unit is the cleaned opening, later units are deltas)
    Token(String),
    /// Terminal, user-visible error. Nothing follows it
    Error(String),
}

impl StreamToken {
    pub fn text(&self) -> &str {
        match self {
            StreamToken::Token(text) | StreamToken::Error(text) => text,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, StreamToken::Error(_))
    }
}

/// Wire shape of a stream unit: `{"token": "..."}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatChunk {
    pub token: String,
}

impl From<StreamToken> for ChatChunk {
    fn from(token: StreamToken) -> Self {
        match token {
            StreamToken::Token(token) | StreamToken::Error(token) => Self { token },
        }
    }
}

/// Receiving end of a generation
///
/// Finite and not restartable: once `next` returns `None` the response is over.
#[derive(Debug)]
pub struct GenerationStream {
    id: Uuid,
    rx: mpsc::Receiver<StreamToken>,
}

impl GenerationStream {
    pub(crate) fn new(id: Uuid, rx: mpsc::Receiver<StreamToken>) -> Self {
        Self { id, rx }
    }

    /// A stream holding exactly one unit
    pub(crate) fn single(id: Uuid, token: StreamToken) -> Self {
        let (tx, rx) = mpsc::channel(1);
        // Capacity 1 on a fresh channel, cannot fail
        let _ = tx.try_send(token);
        Self { id, rx }
    }

    /// Request id, also recorded on the worker's tracing span
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next unit, `None` once the response is complete
    pub async fn next(&mut self) -> Option<StreamToken> {
        self.rx.recv().await
    }

    /// Blocking variant of [`next`](Self::next) for use outside the runtime
    pub fn blocking_next(&mut self) -> Option<StreamToken> {
        self.rx.blocking_recv()
    }

    /// Stop generation. Units already queued can still be read
    pub fn close(&mut self) {
        self.rx.close();
    }

    /// Drain the stream into a single string (error units included)
    pub async fn collect_text(mut self) -> String {
        let mut text = String::new();
        while let Some(token) = self.next().await {
            text.push_str(token.text());
        }
        text
    }
}
