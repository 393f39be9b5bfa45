//! The model backend capability.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::{Error, Message, ModelInfo, Reply, Result, ToolDefinition};

/// Everything a backend needs for one call.
#[derive(Debug, Clone, Copy)]
pub struct ChatRequest<'a> {
    pub model: &'a ModelInfo,
    pub system_prompt: Option<&'a str>,
    pub messages: &'a [Message],
    /// Empty for calls that must not use tools (summaries)
    pub tools: &'a [ToolDefinition],
}

/// A model backend.
///
/// Given a conversation and a tool schema, return text, tool invocations, or an error.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Provider name, for display
    fn name(&self) -> &str;

    /// Run one request. Implementations should abort promptly once `cancel` fires.
    async fn invoke(&self, request: ChatRequest<'_>, cancel: CancellationToken) -> Result<Reply>;

    /// Whether `error` means the conversation was too large for the backend.
    fn is_capacity_error(&self, error: &Error) -> bool {
        error.is_context_overflow() || is_capacity_message(&error.to_string())
    }
}

/// Compiled patterns for "conversation too large" errors across backends,
/// including per-interval token rate limits that reject a single oversized request.
static CAPACITY_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)context.?length.?exceed",
        r"(?i)maximum.?context.?length",
        r"(?i)context.?window.?(exceed|full|limit)",
        r"(?i)too.?many.?tokens",
        r"(?i)prompt.?is.?too.?long",
        r"(?i)prompt.?too.?long",
        r"(?i)input.?too.?long",
        r"(?i)token.?limit.?(exceed|reach)",
        r"(?i)content.?too.?large",
        r"(?i)request.?too.?large",
        r"(?i)messages?.?too.?long",
        r"(?i)reduce.?the.?length",
        r"(?i)context_length_exceeded",
        r"(?i)max_tokens.*(exceed|limit|too|overflow)",
        r"(?i)exceeds?.+token.?limit",
        r"(?i)context.?overflow",
        r"(?i)tokens.?per.?(minute|min|day)\b.*(limit|requested)",
        r"(?i)n_ctx",
        r"\b413\b",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

static HTTP_400_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:status|http|error)[:\s]*400\b|\b400\s+bad\s+request").ok()
});

/// Check whether free-form error text describes a capacity overflow.
pub fn is_capacity_message(error: &str) -> bool {
    // A bare 400 is only a capacity error when it talks about size
    if let Some(re) = HTTP_400_PATTERN.as_ref() {
        if re.is_match(error) {
            let lower = error.to_lowercase();
            if lower.contains("token") || lower.contains("context") || lower.contains("length") {
                return true;
            }
        }
    }

    CAPACITY_PATTERNS.iter().any(|re| re.is_match(error))
}
