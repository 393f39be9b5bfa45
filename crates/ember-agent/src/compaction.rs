//! Context compaction for long conversations
//!
//! The last resort of the context budget: back the conversation up, ask the
//! model for a structured summary, and replace the whole history with an
//! instruction and that summary. When the summary call fails the backup is
//! restored, and when there is no backup only the newest third is kept.

use std::path::PathBuf;

use ember_ai::{ChatProvider, ChatRequest, Message, ModelInfo, Reply};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::budget::TokenEstimator;
use crate::conversation::{Conversation, DisplayEntry};
use crate::error::{Error, Result};
use crate::events::AgentEvent;
use crate::persistence::{SessionSnapshot, SessionStore};
use crate::process::ProcessInfo;

/// Reason for compaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionReason {
    /// Truncation and pruning were not enough
    Budget,
    /// The provider rejected the conversation as too large
    Overflow,
    /// Manual /compact command
    Manual,
}

/// Facts about the environment the summary must carry forward.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentFacts {
    pub cwd: PathBuf,
    pub platform: String,
    pub processes: Vec<ProcessInfo>,
}

impl EnvironmentFacts {
    pub fn new(cwd: impl Into<PathBuf>, processes: Vec<ProcessInfo>) -> Self {
        Self {
            cwd: cwd.into(),
            platform: format!("{} ({})", std::env::consts::OS, std::env::consts::ARCH),
            processes,
        }
    }

    fn render(&self) -> String {
        let mut out = format!(
            "Working directory: {}\nPlatform: {}\n",
            self.cwd.display(),
            self.platform
        );
        if self.processes.is_empty() {
            out.push_str("Background processes: (none)\n");
        } else {
            out.push_str("Background processes:\n");
            for p in &self.processes {
                let state = if p.running { "running" } else { "exited" };
                let port = p.port.map(|p| format!(" port {p}")).unwrap_or_default();
                out.push_str(&format!("- {} [{}{}]: {}\n", p.id, state, port, p.command));
            }
        }
        out
    }
}

/// Collaborators a compaction pass needs.
pub struct CompactionContext<'a> {
    pub provider: &'a dyn ChatProvider,
    pub store: &'a dyn SessionStore,
    pub model: &'a ModelInfo,
    /// Transcript saved with the backup
    pub transcript: &'a [DisplayEntry],
    pub environment: EnvironmentFacts,
    pub reason: CompactionReason,
    pub events: Option<&'a broadcast::Sender<AgentEvent>>,
    pub cancel: CancellationToken,
}

impl CompactionContext<'_> {
    fn emit(&self, event: AgentEvent) {
        if let Some(tx) = self.events {
            let _ = tx.send(event);
        }
    }
}

/// How the conversation was reduced
#[derive(Debug, Clone, PartialEq)]
pub enum CompactionOutcome {
    /// Replaced by the instruction and summary pair
    Summarized,
    /// The summary failed and the backup was put back
    RestoredBackup { error: String },
    /// The summary failed without a usable backup; only the newest messages remain
    KeptRecent { kept: usize, error: String },
}

/// Result of a compaction operation
#[derive(Debug, Clone)]
pub struct CompactionResult {
    pub outcome: CompactionOutcome,
    /// Estimated tokens before compaction
    pub tokens_before: u32,
    /// Estimated tokens after compaction
    pub tokens_after: u32,
    /// Files that were read during the summarized portion
    pub read_files: Vec<String>,
    /// Files that were modified during the summarized portion
    pub modified_files: Vec<String>,
}

// --- Message Serialization ---

/// Serialize messages to plain text for the summarization prompt.
/// Uses a human-readable format to prevent the model from trying to "continue" the conversation.
fn serialize_messages_for_summary(messages: &[Message]) -> String {
    let mut out = String::new();

    for msg in messages {
        match msg {
            Message::User { content, .. } => {
                out.push_str("[User]: ");
                out.push_str(content);
                out.push('\n');
            }
            Message::System { content, .. } => {
                out.push_str("[Notice]: ");
                out.push_str(content);
                out.push('\n');
            }
            Message::Assistant {
                content,
                tool_calls,
                ..
            } => {
                if !content.is_empty() {
                    out.push_str("[Assistant]: ");
                    out.push_str(content);
                    out.push('\n');
                }
                if !tool_calls.is_empty() {
                    let calls: Vec<String> = tool_calls
                        .iter()
                        .map(|c| format!("{}({})", c.name, format_tool_args(&c.arguments)))
                        .collect();
                    out.push_str("[Assistant tool calls]: ");
                    out.push_str(&calls.join("; "));
                    out.push('\n');
                }
            }
            Message::Tool {
                tool_name,
                content,
                is_error,
                ..
            } => {
                let label = if *is_error {
                    format!("[Tool error ({})]: ", tool_name)
                } else {
                    format!("[Tool result ({})]: ", tool_name)
                };
                out.push_str(&label);
                // Truncate very long tool results
                out.push_str(&clip(content, 2000));
                out.push('\n');
            }
        }
    }

    out
}

fn clip(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...(truncated)", &s[..end])
}

/// Keep the start and the end of `text` within `max` bytes.
fn clip_middle(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut head = max / 4;
    while !text.is_char_boundary(head) {
        head -= 1;
    }
    let mut tail = text.len() - (max - head);
    while !text.is_char_boundary(tail) {
        tail += 1;
    }
    format!(
        "{}\n[... {} bytes of conversation omitted ...]\n{}",
        &text[..head],
        tail - head,
        &text[tail..]
    )
}

fn format_tool_args(args: &serde_json::Value) -> String {
    match args {
        serde_json::Value::Object(map) => map
            .iter()
            .map(|(k, v)| {
                let val = match v {
                    serde_json::Value::String(s) => format!("\"{}\"", clip(s, 100)),
                    other => clip(&other.to_string(), 100),
                };
                format!("{}={}", k, val)
            })
            .collect::<Vec<_>>()
            .join(", "),
        _ => args.to_string(),
    }
}

// --- File Operation Tracking ---

/// Tool names that only look at files.
const READ_TOOLS: &[&str] = &["read_file", "list_dir"];
/// Tool names that change files.
const WRITE_TOOLS: &[&str] = &["write_file"];

/// Extract file paths from tool calls in messages
fn extract_file_operations(messages: &[Message]) -> (Vec<String>, Vec<String>) {
    let mut read_files = Vec::new();
    let mut modified_files = Vec::new();

    for call in messages.iter().flat_map(|m| m.tool_calls()) {
        let Some(path) = call.arguments.get("path").and_then(|v| v.as_str()) else {
            continue;
        };
        let list = if READ_TOOLS.contains(&call.name.as_str()) {
            &mut read_files
        } else if WRITE_TOOLS.contains(&call.name.as_str()) {
            &mut modified_files
        } else {
            continue;
        };
        if !list.iter().any(|p| p == path) {
            list.push(path.to_string());
        }
    }

    (read_files, modified_files)
}

// --- Summarization Prompts ---

const SUMMARIZATION_SYSTEM_PROMPT: &str = "\
You are a specialized summarization model. Your task is to create a comprehensive \
yet concise summary of a coding session. This summary will replace the original \
messages in the conversation context, so it must capture all essential information \
needed to continue the work without repeating it.";

const SUMMARIZATION_PROMPT: &str = "\
Summarize the coding session below. Use these headers:

1. **Original Task**: What did the user ask for?
2. **Completed Work**: What has been done? Name the file paths involved.
3. **Files Modified**: {modified_files}
4. **Files Read**: {read_files}
5. **Current State**: Where does the work stand, and what is the immediate next step?
6. **Remaining Work**: What is still left to do?
7. **Errors and Decisions**: Problems hit, how they were resolved, and decisions made.
8. **Environment**:
{environment}
Be thorough but concise. Do not invent progress that is not in the session.

<conversation>
{conversation}
</conversation>";

/// First message of a compacted conversation.
pub const COMPACTED_INSTRUCTION: &str = "\
This conversation was compacted to fit the model's context. The next message is a \
summary of everything before this point. Work listed there as completed is done: \
do not redo it. Continue from the current state and next step.";

// --- Main Compaction Function ---

/// Summarize `conversation` in place.
///
/// Fails only when there is nothing to compact; a failed summary is handled by
/// restoring the backup or keeping the newest third, and reported in the result.
pub async fn compact(
    conversation: &mut Conversation,
    ctx: &CompactionContext<'_>,
    estimator: &dyn TokenEstimator,
) -> Result<CompactionResult> {
    if conversation.is_empty() {
        return Err(Error::Compaction("Nothing to compact".to_string()));
    }

    let tokens_before = estimator.estimate_all(&conversation.messages);
    ctx.emit(AgentEvent::CompactionStart { reason: ctx.reason });
    tracing::info!(reason = ?ctx.reason, tokens_before, messages = conversation.len(), "Compacting conversation");

    let snapshot = SessionSnapshot::new(
        conversation.messages.clone(),
        ctx.transcript.to_vec(),
        ctx.model.id.clone(),
        ctx.environment.cwd.clone(),
    );
    let backed_up = match ctx.store.backup(&snapshot) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("Failed to back up conversation before compaction: {}", e);
            false
        }
    };

    let (read_files, modified_files) = extract_file_operations(&conversation.messages);

    let outcome = match summarize(conversation, ctx, &read_files, &modified_files).await {
        Ok(summary) => {
            conversation.messages = vec![
                Message::user(COMPACTED_INSTRUCTION),
                Message::assistant(summary),
            ];
            CompactionOutcome::Summarized
        }
        Err(e) => {
            tracing::warn!("Summary call failed: {}", e);
            fall_back(conversation, ctx.store, backed_up, e.to_string())
        }
    };

    let tokens_after = estimator.estimate_all(&conversation.messages);
    ctx.emit(AgentEvent::CompactionEnd {
        tokens_before,
        tokens_after,
        summarized: outcome == CompactionOutcome::Summarized,
    });

    Ok(CompactionResult {
        outcome,
        tokens_before,
        tokens_after,
        read_files,
        modified_files,
    })
}

async fn summarize(
    conversation: &mut Conversation,
    ctx: &CompactionContext<'_>,
    read_files: &[String],
    modified_files: &[String],
) -> Result<String> {
    let list = |files: &[String]| {
        if files.is_empty() {
            "(none)".to_string()
        } else {
            files.join(", ")
        }
    };

    // Leave room for the prompt and the answer in the ceiling
    let max_chars = ctx.model.ceiling() as usize * 4 * 3 / 5;
    let conversation_text =
        clip_middle(&serialize_messages_for_summary(&conversation.messages), max_chars);

    let prompt = SUMMARIZATION_PROMPT
        .replace("{read_files}", &list(read_files))
        .replace("{modified_files}", &list(modified_files))
        .replace("{environment}", &ctx.environment.render())
        .replace("{conversation}", &conversation_text);

    let messages = [Message::user(prompt)];
    let request = ChatRequest {
        model: ctx.model,
        system_prompt: Some(SUMMARIZATION_SYSTEM_PROMPT),
        messages: &messages,
        tools: &[],
    };

    let reply = tokio::select! {
        _ = ctx.cancel.cancelled() => return Err(ember_ai::Error::Aborted.into()),
        reply = ctx.provider.invoke(request, ctx.cancel.clone()) => reply?,
    };

    if let Some(usage) = reply.usage() {
        conversation.total_usage.add(usage);
    }
    let text = match reply {
        Reply::Text { text, .. } | Reply::ToolCalls { text, .. } => text,
    };
    if text.trim().is_empty() {
        return Err(Error::Compaction(
            "Summary call returned empty response".to_string(),
        ));
    }
    Ok(text)
}

fn fall_back(
    conversation: &mut Conversation,
    store: &dyn SessionStore,
    backed_up: bool,
    error: String,
) -> CompactionOutcome {
    if backed_up {
        match store.restore_backup() {
            Ok(Some(snapshot)) => {
                conversation.messages = snapshot.messages;
                return CompactionOutcome::RestoredBackup { error };
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Failed to read backup: {}", e),
        }
    }

    let len = conversation.len();
    let mut start = len - len.div_ceil(3);
    // A tool result must not lose the call that requested it
    while start < len && conversation.messages[start].is_tool_result() {
        start += 1;
    }
    conversation.messages.drain(..start);
    CompactionOutcome::KeptRecent {
        kept: conversation.len(),
        error,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::LazyLock;

    use async_trait::async_trait;
    use ember_ai::{ToolCall, Usage};
    use parking_lot::Mutex;

    use crate::budget::CharEstimator;
    use crate::persistence::MemoryStore;

    /// Provider that replays scripted replies and records what it was asked.
    pub(crate) struct Scripted {
        replies: Mutex<VecDeque<ember_ai::Result<Reply>>>,
        pub(crate) requests: Mutex<Vec<(Vec<Message>, usize)>>,
    }

    impl Scripted {
        pub(crate) fn new(replies: Vec<ember_ai::Result<Reply>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.requests.lock().len()
        }
    }

    #[async_trait]
    impl ChatProvider for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn invoke(
            &self,
            request: ChatRequest<'_>,
            _cancel: CancellationToken,
        ) -> ember_ai::Result<Reply> {
            self.requests
                .lock()
                .push((request.messages.to_vec(), request.tools.len()));
            self.replies
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(ember_ai::Error::UnexpectedResponse("script exhausted".into())))
        }
    }

    /// Store whose every operation fails.
    pub(crate) struct BrokenStore;

    impl SessionStore for BrokenStore {
        fn save(&self, _: &SessionSnapshot) -> io::Result<()> {
            Err(io::Error::other("disk full"))
        }
        fn backup(&self, _: &SessionSnapshot) -> io::Result<()> {
            Err(io::Error::other("disk full"))
        }
        fn load(&self) -> io::Result<Option<SessionSnapshot>> {
            Err(io::Error::other("disk full"))
        }
        fn restore_backup(&self) -> io::Result<Option<SessionSnapshot>> {
            Err(io::Error::other("disk full"))
        }
        fn clear(&self) -> io::Result<()> {
            Err(io::Error::other("disk full"))
        }
    }

    static MODEL: LazyLock<ModelInfo> = LazyLock::new(|| ModelInfo::custom("test", "test-model"));

    pub(crate) fn context<'a>(
        provider: &'a dyn ChatProvider,
        store: &'a dyn SessionStore,
    ) -> CompactionContext<'a> {
        CompactionContext {
            provider,
            store,
            model: &MODEL,
            transcript: &[],
            environment: EnvironmentFacts::new("/work", Vec::new()),
            reason: CompactionReason::Manual,
            events: None,
            cancel: CancellationToken::new(),
        }
    }

    fn session() -> Conversation {
        let mut conv = Conversation::new(10_000);
        conv.push(Message::user("add a health endpoint"));
        conv.push(Message::assistant_with_calls(
            "",
            vec![ToolCall::new("c1", "read_file", serde_json::json!({"path": "src/main.rs"}))],
        ));
        conv.push(Message::tool_result("c1", "read_file", "fn main() {}", false));
        conv.push(Message::assistant_with_calls(
            "",
            vec![ToolCall::new(
                "c2",
                "write_file",
                serde_json::json!({"path": "src/health.rs", "content": "pub fn ok() {}"}),
            )],
        ));
        conv.push(Message::tool_result("c2", "write_file", "Wrote 14 bytes", false));
        conv.push(Message::assistant("Added the endpoint."));
        conv
    }

    #[tokio::test]
    async fn test_compact_replaces_with_two_messages() {
        let provider = Scripted::new(vec![Ok(Reply::Text {
            text: "## Original Task\nhealth endpoint".into(),
            usage: Some(Usage {
                input: 100,
                output: 20,
                ..Usage::default()
            }),
        })]);
        let store = MemoryStore::new();
        let mut conv = session();
        let original = conv.messages.clone();

        let result = compact(&mut conv, &context(&provider, &store), &CharEstimator::default())
            .await
            .unwrap();

        assert_eq!(result.outcome, CompactionOutcome::Summarized);
        assert_eq!(conv.len(), 2);
        assert_eq!(conv.messages[0].text(), COMPACTED_INSTRUCTION);
        assert_eq!(conv.messages[1].text(), "## Original Task\nhealth endpoint");
        assert_eq!(conv.total_usage.input, 100);
        assert_eq!(result.read_files, vec!["src/main.rs".to_string()]);
        assert_eq!(result.modified_files, vec!["src/health.rs".to_string()]);

        // The summary call carries no tools and sees the whole session
        let requests = provider.requests.lock();
        assert_eq!(requests[0].1, 0);
        let prompt = requests[0].0[0].text();
        assert!(prompt.contains("[User]: add a health endpoint"));
        assert!(prompt.contains("Files Modified**: src/health.rs"));
        assert!(prompt.contains("Working directory: /work"));

        // Reversible until the next backup
        let backup = store.restore_backup().unwrap().unwrap();
        assert_eq!(backup.messages, original);
    }

    #[tokio::test]
    async fn test_failed_summary_restores_backup() {
        let provider = Scripted::new(vec![Err(ember_ai::Error::api("overloaded", "try later"))]);
        let store = MemoryStore::new();
        let mut conv = session();
        let original = conv.messages.clone();

        let result = compact(&mut conv, &context(&provider, &store), &CharEstimator::default())
            .await
            .unwrap();

        assert!(matches!(result.outcome, CompactionOutcome::RestoredBackup { .. }));
        assert_eq!(conv.messages, original);
    }

    #[tokio::test]
    async fn test_failed_summary_without_backup_keeps_recent_third() {
        let provider = Scripted::new(vec![Ok(Reply::text("   "))]);
        let mut conv = session();
        conv.push(Message::user("now add tests"));
        conv.push(Message::assistant_with_calls(
            "",
            vec![ToolCall::new("c3", "list_dir", serde_json::json!({"path": "tests"}))],
        ));
        conv.push(Message::tool_result("c3", "list_dir", "empty", false));
        // 9 messages -> keep the last 3
        let tail = conv.messages[6..].to_vec();

        let result = compact(&mut conv, &context(&provider, &BrokenStore), &CharEstimator::default())
            .await
            .unwrap();

        assert_eq!(
            result.outcome,
            CompactionOutcome::KeptRecent {
                kept: 3,
                error: "Compaction error: Summary call returned empty response".to_string(),
            }
        );
        assert_eq!(conv.messages, tail);
    }

    #[tokio::test]
    async fn test_recent_third_never_starts_with_tool_result() {
        let provider = Scripted::new(vec![]);
        let mut conv = session();
        // 6 messages -> cut at index 4, which is a tool result
        compact(&mut conv, &context(&provider, &BrokenStore), &CharEstimator::default())
            .await
            .unwrap();
        assert_eq!(conv.len(), 1);
        assert_eq!(conv.messages[0].text(), "Added the endpoint.");
    }

    #[tokio::test]
    async fn test_compact_empty_is_error() {
        let provider = Scripted::new(vec![]);
        let store = MemoryStore::new();
        let mut conv = Conversation::new(1000);
        let err = compact(&mut conv, &context(&provider, &store), &CharEstimator::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Compaction(_)));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_compaction_events() {
        let provider = Scripted::new(vec![Ok(Reply::text("summary"))]);
        let store = MemoryStore::new();
        let (tx, mut rx) = broadcast::channel(8);
        let mut ctx = context(&provider, &store);
        ctx.events = Some(&tx);
        let mut conv = session();

        compact(&mut conv, &ctx, &CharEstimator::default()).await.unwrap();

        assert!(matches!(
            rx.recv().await.unwrap(),
            AgentEvent::CompactionStart {
                reason: CompactionReason::Manual
            }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            AgentEvent::CompactionEnd {
                summarized: true,
                ..
            }
        ));
    }

    #[test]
    fn test_serialize_messages() {
        let text = serialize_messages_for_summary(&session().messages);
        assert!(text.contains("[User]: add a health endpoint"));
        assert!(text.contains("[Assistant tool calls]: read_file(path=\"src/main.rs\")"));
        assert!(text.contains("[Tool result (write_file)]: Wrote 14 bytes"));
        assert!(text.contains("[Assistant]: Added the endpoint."));
    }

    #[test]
    fn test_clip_middle_keeps_both_ends() {
        let text = format!("{}{}", "a".repeat(1000), "z".repeat(1000));
        let clipped = clip_middle(&text, 400);
        assert!(clipped.starts_with("aaaa"));
        assert!(clipped.ends_with("zzzz"));
        assert!(clipped.contains("bytes of conversation omitted"));
        assert_eq!(clip_middle("short", 400), "short");
    }

    #[test]
    fn test_environment_lists_processes() {
        let facts = EnvironmentFacts {
            cwd: PathBuf::from("/srv/app"),
            platform: "linux".into(),
            processes: vec![ProcessInfo {
                id: "bg_1".into(),
                command: "npm run dev".into(),
                running: true,
                exit_code: None,
                pid: Some(42),
                port: Some(5173),
                runtime: std::time::Duration::from_secs(3),
                started_at: chrono::Utc::now(),
            }],
        };
        let text = facts.render();
        assert!(text.contains("Working directory: /srv/app"));
        assert!(text.contains("- bg_1 [running port 5173]: npm run dev"));
    }
}
