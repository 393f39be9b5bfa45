//! Context budget: keep the conversation under the model's ceiling.
//!
//! Three passes run in order and stop as soon as the estimate is within the
//! target: truncate long tool results, prune old tool results, and finally
//! summarize the whole conversation (see [`crate::compaction`]).

use std::sync::{Arc, LazyLock};

use ember_ai::Message;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::compaction::{self, CompactionContext, CompactionResult};
use crate::conversation::Conversation;
use crate::error::Result;

/// Estimates the token size of messages.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, message: &Message) -> u32;

    fn estimate_all(&self, messages: &[Message]) -> u32 {
        messages.iter().map(|m| self.estimate(m)).sum()
    }
}

/// Character-count heuristic with fixed per-message and per-tool-call overheads.
#[derive(Debug, Clone, Copy)]
pub struct CharEstimator {
    pub chars_per_token: usize,
    pub message_overhead: u32,
    pub tool_call_overhead: u32,
}

impl Default for CharEstimator {
    fn default() -> Self {
        Self {
            chars_per_token: 4,
            message_overhead: 4,
            tool_call_overhead: 12,
        }
    }
}

impl CharEstimator {
    fn tokens(&self, chars: usize) -> u32 {
        chars.div_ceil(self.chars_per_token.max(1)) as u32
    }
}

impl TokenEstimator for CharEstimator {
    fn estimate(&self, message: &Message) -> u32 {
        let calls: u32 = message
            .tool_calls()
            .iter()
            .map(|call| {
                let args = serde_json::to_string(&call.arguments).unwrap_or_default();
                self.tool_call_overhead + self.tokens(call.name.len() + args.len())
            })
            .sum();
        self.tokens(message.text().len()) + self.message_overhead + calls
    }
}

/// Budget thresholds
#[derive(Debug, Clone)]
pub struct BudgetConfig {
    /// Target size as a percentage of the ceiling
    pub headroom_percent: u32,
    /// Tool results longer than this are truncated
    pub truncate_threshold: usize,
    /// Body characters a truncated result keeps
    pub truncate_keep: usize,
    /// Trailing messages pruning never touches
    pub protected_tail: usize,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            headroom_percent: 80,
            truncate_threshold: 800,
            truncate_keep: 200,
            protected_tail: 8,
        }
    }
}

/// A shrinking pass of [`ContextBudget::ensure_fits`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetPass {
    Truncate,
    Prune,
    Summarize,
}

/// What [`ContextBudget::ensure_fits`] did
#[derive(Debug, Clone)]
pub struct BudgetReport {
    pub fits: bool,
    pub target: u32,
    pub tokens_before: u32,
    pub tokens_after: u32,
    /// Passes attempted, in order
    pub passes: Vec<BudgetPass>,
    pub compaction: Option<CompactionResult>,
}

const TRUNCATION_MARKER: &str = "[truncated to save context";

/// `KEY: value` lines tool results start with (`STATUS: running`, `OUTPUT:`).
static HEADER_LINE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Z][A-Z0-9_]*(?: [A-Z0-9_]+)*:(?:\s.*)?$").ok());

fn is_header(line: &str) -> bool {
    HEADER_LINE.as_ref().is_some_and(|re| re.is_match(line))
}

/// Most header lines a truncated result keeps.
const MAX_HEADER_LINES: usize = 10;

/// Number of leading header lines. `OUTPUT:` closes the block so body lines
/// shaped like headers (`ERROR: ...`) stay in the body.
fn header_len(lines: &[&str]) -> usize {
    let mut count = 0;
    for line in lines.iter().take(MAX_HEADER_LINES) {
        if !is_header(line) {
            break;
        }
        count += 1;
        if line.starts_with("OUTPUT:") {
            break;
        }
    }
    count
}

/// Collapse a long tool result to its header lines and the start of its body.
///
/// Lengths are counted in characters. Returns `None` when the content is short
/// enough or already truncated, so applying it twice changes nothing.
pub fn truncate_tool_result(content: &str, config: &BudgetConfig) -> Option<String> {
    if content.contains(TRUNCATION_MARKER)
        || content.chars().count() <= config.truncate_threshold
    {
        return None;
    }

    let lines: Vec<&str> = content.lines().collect();
    let header_count = header_len(&lines);
    let body = lines[header_count..].join("\n");

    let excerpt: String = body.chars().take(config.truncate_keep).collect();
    let omitted = body.chars().count() - excerpt.chars().count();

    let mut out = String::new();
    for header in &lines[..header_count] {
        // A single header can be arbitrarily long; keep it bounded too
        out.extend(header.chars().take(config.truncate_keep));
        out.push('\n');
    }
    out.push_str(&excerpt);
    if !excerpt.is_empty() && !excerpt.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&format!("{TRUNCATION_MARKER}: {omitted} more chars]"));
    Some(out)
}

/// Applies the budget passes to a conversation.
#[derive(Clone)]
pub struct ContextBudget {
    config: BudgetConfig,
    estimator: Arc<dyn TokenEstimator>,
}

impl ContextBudget {
    pub fn new(config: BudgetConfig) -> Self {
        Self::with_estimator(config, Arc::new(CharEstimator::default()))
    }

    pub fn with_estimator(config: BudgetConfig, estimator: Arc<dyn TokenEstimator>) -> Self {
        Self { config, estimator }
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    pub fn estimator(&self) -> &dyn TokenEstimator {
        self.estimator.as_ref()
    }

    /// Target size for a given ceiling
    pub fn target(&self, ceiling: u32) -> u32 {
        (u64::from(ceiling) * u64::from(self.config.headroom_percent) / 100) as u32
    }

    pub fn estimate(&self, conversation: &Conversation) -> u32 {
        self.estimator.estimate_all(&conversation.messages)
    }

    /// Truncate every oversized tool result. Returns how many were changed.
    pub fn truncate(&self, messages: &mut [Message]) -> usize {
        let mut changed = 0;
        for message in messages.iter_mut().filter(|m| m.is_tool_result()) {
            if let Some(short) = truncate_tool_result(message.text(), &self.config) {
                message.set_text(short);
                changed += 1;
            }
        }
        changed
    }

    /// Remove tool results oldest first, never touching the protected tail,
    /// until the estimate reaches `target`. Returns how many were removed.
    pub fn prune(&self, conversation: &mut Conversation, target: u32) -> usize {
        let mut tokens = self.estimate(conversation);
        let mut removed = 0;
        let mut i = 0;
        while tokens > target {
            let prunable = conversation
                .messages
                .len()
                .saturating_sub(self.config.protected_tail);
            if i >= prunable {
                break;
            }
            if conversation.messages[i].is_tool_result() {
                let message = conversation.messages.remove(i);
                tokens = tokens.saturating_sub(self.estimator.estimate(&message));
                removed += 1;
            } else {
                i += 1;
            }
        }
        removed
    }

    /// Shrink `conversation` until it is within the target, escalating through
    /// the passes. Still being over budget afterwards is not an error.
    pub async fn ensure_fits(
        &self,
        conversation: &mut Conversation,
        ctx: &CompactionContext<'_>,
    ) -> BudgetReport {
        let target = self.target(conversation.ceiling);
        let tokens_before = self.estimate(conversation);
        let mut report = BudgetReport {
            fits: tokens_before <= target,
            target,
            tokens_before,
            tokens_after: tokens_before,
            passes: Vec::new(),
            compaction: None,
        };
        if report.fits {
            return report;
        }

        report.passes.push(BudgetPass::Truncate);
        let truncated = self.truncate(&mut conversation.messages);
        report.tokens_after = self.estimate(conversation);
        tracing::debug!(truncated, tokens = report.tokens_after, target, "Truncated tool results");

        if report.tokens_after > target {
            report.passes.push(BudgetPass::Prune);
            let pruned = self.prune(conversation, target);
            report.tokens_after = self.estimate(conversation);
            tracing::debug!(pruned, tokens = report.tokens_after, target, "Pruned tool results");
        }

        if report.tokens_after > target {
            report.passes.push(BudgetPass::Summarize);
            match self.compact(conversation, ctx).await {
                Ok(result) => report.compaction = Some(result),
                Err(e) => tracing::warn!("Compaction skipped: {}", e),
            }
            report.tokens_after = self.estimate(conversation);
        }

        report.fits = report.tokens_after <= target;
        tracing::info!(
            before = report.tokens_before,
            after = report.tokens_after,
            target,
            passes = ?report.passes,
            "Context budget applied"
        );
        report
    }

    /// Summarize the conversation into an instruction and summary pair.
    pub async fn compact(
        &self,
        conversation: &mut Conversation,
        ctx: &CompactionContext<'_>,
    ) -> Result<CompactionResult> {
        compaction::compact(conversation, ctx, self.estimator.as_ref()).await
    }
}

impl Default for ContextBudget {
    fn default() -> Self {
        Self::new(BudgetConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compaction::tests::{Scripted, context};
    use crate::persistence::MemoryStore;
    use ember_ai::{Reply, ToolCall};

    fn tool_turn(i: usize, output: &str) -> [Message; 2] {
        let id = format!("call_{i}");
        [
            Message::assistant_with_calls(
                "",
                vec![ToolCall::new(&id, "read_file", serde_json::json!({"path": "a.rs"}))],
            ),
            Message::tool_result(id, "read_file", output, false),
        ]
    }

    #[test]
    fn test_char_estimator() {
        let est = CharEstimator::default();
        // 12 chars -> 3 tokens, plus overhead
        assert_eq!(est.estimate(&Message::user("Hello world!")), 3 + 4);
        assert_eq!(est.estimate(&Message::user("Hello world!!")), 4 + 4);

        let with_call = Message::assistant_with_calls(
            "",
            vec![ToolCall::new("c", "list_dir", serde_json::json!({}))],
        );
        // "list_dir" + "{}" = 10 chars -> 3 tokens
        assert_eq!(est.estimate(&with_call), 4 + 12 + 3);
    }

    #[test]
    fn test_target_is_eighty_percent() {
        let budget = ContextBudget::default();
        assert_eq!(budget.target(10_000), 8_000);
        assert_eq!(budget.target(30_000), 24_000);
    }

    #[test]
    fn test_truncate_keeps_headers_and_is_idempotent() {
        let config = BudgetConfig::default();
        let content = format!(
            "STATUS: completed\nEXIT_CODE: 0\nCOMMAND: cargo build\nOUTPUT:\n{}",
            "compiling crate\n".repeat(100)
        );

        let once = truncate_tool_result(&content, &config).unwrap();
        assert!(once.starts_with("STATUS: completed\nEXIT_CODE: 0\nCOMMAND: cargo build\nOUTPUT:\n"));
        assert!(once.contains(TRUNCATION_MARKER));
        assert!(once.len() < 400);

        assert!(truncate_tool_result(&once, &config).is_none());
        let mut messages = vec![Message::tool_result("c", "run_command", once.clone(), false)];
        assert_eq!(ContextBudget::default().truncate(&mut messages), 0);
        assert_eq!(messages[0].text(), once);
    }

    #[test]
    fn test_truncate_leaves_short_and_non_tool_messages() {
        let budget = ContextBudget::default();
        let long = "x".repeat(2000);
        let mut messages = vec![
            Message::user(long.clone()),
            Message::tool_result("c", "read_file", "short", false),
        ];
        assert_eq!(budget.truncate(&mut messages), 0);
        assert_eq!(messages[0].text(), long);
    }

    #[test]
    fn test_truncate_multibyte_body() {
        let config = BudgetConfig::default();
        let content = "é".repeat(1000);
        let out = truncate_tool_result(&content, &config).unwrap();
        assert!(out.starts_with(&"é".repeat(200)));
    }

    #[test]
    fn test_truncate_header_shaped_body() {
        let config = BudgetConfig::default();
        let body: String = (0..500)
            .map(|i| format!("ERROR: failed to compile unit {i}\n"))
            .collect();
        let content = format!(
            "STATUS: completed\nEXIT_CODE: 1\nCOMMAND: make\nOUTPUT:\n{}",
            body
        );

        let out = truncate_tool_result(&content, &config).unwrap();
        assert!(out.len() < 2_000, "len {}", out.len());
        assert!(out.starts_with("STATUS: completed\nEXIT_CODE: 1\nCOMMAND: make\nOUTPUT:\nERROR: failed to compile unit 0\n"));
        assert!(!out.contains("unit 499"));
    }

    #[test]
    fn test_truncate_caps_header_lines() {
        let config = BudgetConfig::default();
        let content: String = (0..200).map(|i| format!("KEY_{i}: value\n")).collect();
        let out = truncate_tool_result(&content, &config).unwrap();
        assert!(out.starts_with("KEY_0: value\n"));
        assert!(out.len() < 600, "len {}", out.len());
    }

    #[test]
    fn test_truncate_threshold_counts_chars() {
        let config = BudgetConfig::default();
        // 600 chars but 1200 bytes
        let content = "é".repeat(600);
        assert!(truncate_tool_result(&content, &config).is_none());

        let out = truncate_tool_result(&"é".repeat(1000), &config).unwrap();
        assert!(out.ends_with(": 800 more chars]"));
    }

    #[tokio::test]
    async fn test_truncation_alone_brings_conversation_under_target() {
        let budget = ContextBudget::default();
        let mut conv = Conversation::new(10_000);
        conv.push(Message::user("read the sources"));
        for i in 0..4 {
            conv.messages.extend(tool_turn(i, &"y".repeat(9_400)));
        }
        let before = budget.estimate(&conv);
        assert!(before >= 9_500, "estimate {before}");
        let len = conv.len();

        let provider = Scripted::new(vec![]);
        let store = MemoryStore::new();
        let report = budget.ensure_fits(&mut conv, &context(&provider, &store)).await;

        assert!(report.fits);
        assert_eq!(report.passes, vec![BudgetPass::Truncate]);
        assert!(report.tokens_after <= 8_000);
        assert_eq!(conv.len(), len);
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_under_target_is_untouched() {
        let budget = ContextBudget::default();
        let mut conv = Conversation::new(10_000);
        conv.push(Message::user("hi"));
        conv.messages.extend(tool_turn(0, &"z".repeat(2_000)));

        let provider = Scripted::new(vec![]);
        let store = MemoryStore::new();
        let report = budget.ensure_fits(&mut conv, &context(&provider, &store)).await;
        assert!(report.fits);
        assert!(report.passes.is_empty());
        assert_eq!(conv.messages[2].text().len(), 2_000);
    }

    #[tokio::test]
    async fn test_prune_removes_oldest_tool_results_outside_tail() {
        let budget = ContextBudget::default();
        let mut conv = Conversation::new(2_000);
        conv.push(Message::user("go"));
        // 10 turns of ~700 chars: under the truncation threshold
        for i in 0..10 {
            conv.messages.extend(tool_turn(i, &"p".repeat(700)));
        }
        let tail: Vec<Message> = conv.messages[conv.len() - 8..].to_vec();

        let provider = Scripted::new(vec![]);
        let store = MemoryStore::new();
        let report = budget.ensure_fits(&mut conv, &context(&provider, &store)).await;

        assert_eq!(report.passes, vec![BudgetPass::Truncate, BudgetPass::Prune]);
        assert!(report.fits);
        assert_eq!(conv.messages[conv.len() - 8..], tail[..]);
        // every assistant call message survives
        let assistants = conv.messages.iter().filter(|m| !m.tool_calls().is_empty()).count();
        assert_eq!(assistants, 10);
        assert_eq!(conv.messages[0].text(), "go");
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_all_passes_when_nothing_else_helps() {
        let budget = ContextBudget::default();
        let mut conv = Conversation::new(1_000);
        for i in 0..6 {
            conv.push(Message::user(format!("request {i} {}", "u".repeat(800))));
            conv.push(Message::assistant("done"));
        }

        let provider = Scripted::new(vec![Ok(Reply::text("short summary"))]);
        let store = MemoryStore::new();
        let report = budget.ensure_fits(&mut conv, &context(&provider, &store)).await;

        assert_eq!(
            report.passes,
            vec![BudgetPass::Truncate, BudgetPass::Prune, BudgetPass::Summarize]
        );
        assert!(report.fits);
        assert_eq!(conv.len(), 2);
        assert_eq!(conv.messages[1].text(), "short summary");
    }
}
