//! In-call text chat.
//!
//! Chat messages ride the signaling channel as `chat` frames. Each session
//! keeps an append-only [`ChatLog`] that lives as long as the session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CallError, Result};

/// One chat line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Unique message id.
    pub id: Uuid,
    /// Display name of the author.
    pub sender: String,
    /// Message body.
    pub text: String,
    /// When the author sent it.
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    /// Creates a message stamped now.
    #[must_use]
    pub fn new(sender: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: sender.into(),
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Append-only list of the messages seen in one call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ChatLog {
    messages: Vec<ChatMessage>,
}

impl ChatLog {
    /// Creates an empty log.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            messages: Vec::new(),
        }
    }

    /// Appends a message. Duplicate ids (a re-delivered frame) are ignored.
    pub fn append(&mut self, message: ChatMessage) -> bool {
        if self.messages.iter().any(|m| m.id == message.id) {
            return false;
        }
        self.messages.push(message);
        true
    }

    /// Messages in arrival order.
    #[must_use]
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Number of messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Returns `true` if nothing was said yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Checks outgoing chat text: not blank, at most `max_len` characters.
pub fn validate_text(text: &str, max_len: usize) -> Result<()> {
    if text.trim().is_empty() {
        return Err(CallError::InvalidInput(
            "chat message must not be empty".to_string(),
        ));
    }
    let len = text.chars().count();
    if len > max_len {
        return Err(CallError::InvalidInput(format!(
            "chat message is {len} characters; the limit is {max_len}"
        )));
    }
    Ok(())
}
