//! Conversation state and the UI-facing transcript.

use ember_ai::{Message, Usage};
use serde::{Deserialize, Serialize};

/// Message history plus the active model's token ceiling.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    /// Conversation messages
    pub messages: Vec<Message>,
    /// Effective token ceiling of the active model
    pub ceiling: u32,
    /// Total usage across all turns
    pub total_usage: Usage,
    /// Last provider error surfaced to the operator
    pub error: Option<String>,
}

impl Conversation {
    pub fn new(ceiling: u32) -> Self {
        Self {
            ceiling,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Drop all messages and usage; the ceiling is kept.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.total_usage = Usage::default();
        self.error = None;
    }
}

/// Kind of a transcript entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayKind {
    User,
    Assistant,
    Tool,
    Notice,
    Error,
}

/// One line of the transcript a front end shows; saved alongside the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayEntry {
    pub kind: DisplayKind,
    pub text: String,
    pub timestamp: i64,
}

impl DisplayEntry {
    pub fn new(kind: DisplayKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}
