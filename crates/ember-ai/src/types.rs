//! Core types for model interactions

use serde::{Deserialize, Serialize};

/// Role of a message in the conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }
}

/// A tool invocation requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Identifier, unique within a turn
    pub id: String,
    /// Name of the tool to run
    pub name: String,
    /// Argument mapping
    #[serde(default)]
    pub arguments: serde_json::Value,
}

impl ToolCall {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// A message in the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Message {
    /// Notices injected by the agent itself (cancellation, restores)
    System { content: String, timestamp: i64 },
    /// Operator input
    User { content: String, timestamp: i64 },
    /// Model output, optionally carrying tool calls
    Assistant {
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
        timestamp: i64,
    },
    /// Result of one tool call
    Tool {
        tool_call_id: String,
        tool_name: String,
        content: String,
        #[serde(default)]
        is_error: bool,
        timestamp: i64,
    },
}

fn now() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl Message {
    /// Create a user message
    pub fn user(text: impl Into<String>) -> Self {
        Message::User {
            content: text.into(),
            timestamp: now(),
        }
    }

    /// Create a system notice
    pub fn system(text: impl Into<String>) -> Self {
        Message::System {
            content: text.into(),
            timestamp: now(),
        }
    }

    /// Create a plain assistant reply
    pub fn assistant(text: impl Into<String>) -> Self {
        Message::Assistant {
            content: text.into(),
            tool_calls: vec![],
            timestamp: now(),
        }
    }

    /// Create an assistant message carrying tool calls
    pub fn assistant_with_calls(text: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Message::Assistant {
            content: text.into(),
            tool_calls,
            timestamp: now(),
        }
    }

    /// Create a tool result message
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Message::Tool {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            content: content.into(),
            is_error,
            timestamp: now(),
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Message::System { .. } => Role::System,
            Message::User { .. } => Role::User,
            Message::Assistant { .. } => Role::Assistant,
            Message::Tool { .. } => Role::Tool,
        }
    }

    /// Text content of the message
    pub fn text(&self) -> &str {
        match self {
            Message::System { content, .. }
            | Message::User { content, .. }
            | Message::Assistant { content, .. }
            | Message::Tool { content, .. } => content,
        }
    }

    /// Replace the text content in place
    pub fn set_text(&mut self, text: String) {
        match self {
            Message::System { content, .. }
            | Message::User { content, .. }
            | Message::Assistant { content, .. }
            | Message::Tool { content, .. } => *content = text,
        }
    }

    /// Tool calls carried by an assistant message
    pub fn tool_calls(&self) -> &[ToolCall] {
        match self {
            Message::Assistant { tool_calls, .. } => tool_calls,
            _ => &[],
        }
    }

    /// The call identifier a tool message answers
    pub fn tool_call_id(&self) -> Option<&str> {
        match self {
            Message::Tool { tool_call_id, .. } => Some(tool_call_id),
            _ => None,
        }
    }

    pub fn is_tool_result(&self) -> bool {
        matches!(self, Message::Tool { .. })
    }
}

/// Tool definition handed to the model backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name
    pub name: String,
    /// Description for the model
    pub description: String,
    /// JSON Schema for parameters
    pub parameters: serde_json::Value,
}

/// Token usage reported by a backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input: u32,
    #[serde(default)]
    pub output: u32,
    #[serde(default)]
    pub cache_read: u32,
    #[serde(default)]
    pub cache_write: u32,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.input += other.input;
        self.output += other.output;
        self.cache_read += other.cache_read;
        self.cache_write += other.cache_write;
    }

    pub fn total(&self) -> u32 {
        self.input + self.output + self.cache_read + self.cache_write
    }
}

/// A successful reply from a model backend
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Plain text; ends the turn
    Text { text: String, usage: Option<Usage> },
    /// One or more tool invocations, with any text the model produced alongside
    ToolCalls {
        text: String,
        calls: Vec<ToolCall>,
        usage: Option<Usage>,
    },
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Reply::Text {
            text: text.into(),
            usage: None,
        }
    }

    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Reply::ToolCalls {
            text: String::new(),
            calls,
            usage: None,
        }
    }

    pub fn usage(&self) -> Option<&Usage> {
        match self {
            Reply::Text { usage, .. } | Reply::ToolCalls { usage, .. } => usage.as_ref(),
        }
    }
}
