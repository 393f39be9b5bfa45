//! Agent event types

use ember_ai::{Message, Usage};
use serde::{Deserialize, Serialize};

use crate::budget::BudgetPass;
use crate::compaction::CompactionReason;

/// Events emitted during agent execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// A provider call is about to be made
    TurnStart { depth: u32 },

    /// A message was added to the conversation
    MessageAppended { message: Message },

    /// Tool execution started
    ToolExecutionStart {
        tool_call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
    },

    /// Tool execution completed
    ToolExecutionEnd {
        tool_call_id: String,
        tool_name: String,
        result: String,
        is_error: bool,
    },

    /// The operator (or a missing front end) denied a tool call
    PermissionDenied { tool_name: String },

    /// The context budget had to shrink the conversation
    BudgetApplied {
        tokens_before: u32,
        tokens_after: u32,
        passes: Vec<BudgetPass>,
    },

    /// Context compaction started
    CompactionStart { reason: CompactionReason },

    /// Context compaction completed
    CompactionEnd {
        tokens_before: u32,
        tokens_after: u32,
        summarized: bool,
    },

    /// Usage totals and the current size estimate
    UsageUpdated {
        usage: Usage,
        estimated_tokens: u32,
        ceiling: u32,
    },

    /// The conversation was replaced by the backup slot
    HistoryRestored { messages: usize },

    /// The tool-call chain hit the depth limit
    DepthLimitReached { depth: u32 },

    /// The turn was cancelled
    Cancelled,

    /// Error occurred
    Error { message: String },

    /// The turn finished
    TurnEnd { usage: Usage },
}

impl AgentEvent {
    /// Check if this is a terminal event
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentEvent::TurnEnd { .. } | AgentEvent::Error { .. })
    }
}
