//! The orchestration loop
//!
//! One call to [`Agent::prompt`] turns a line of operator input into provider
//! calls and tool executions until the model answers with text, the depth limit
//! is hit, the turn is cancelled, or an error ends it.

use std::collections::HashMap;
use std::sync::Arc;

use ember_ai::{ChatProvider, ChatRequest, Message, ModelInfo, Reply, ToolCall, ToolDefinition};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::budget::{BudgetConfig, ContextBudget};
use crate::compaction::{
    COMPACTED_INSTRUCTION, CompactionContext, CompactionOutcome, CompactionReason,
    CompactionResult, EnvironmentFacts,
};
use crate::conversation::{Conversation, DisplayEntry, DisplayKind};
use crate::error::Result;
use crate::events::AgentEvent;
use crate::handle::AgentHandle;
use crate::permission::{Permission, PermissionGate};
use crate::persistence::{SessionSnapshot, SessionStore};
use crate::process::ProcessSupervisor;
use crate::tools::{BoxedTool, ToolResult, to_definition};

/// Tool-call rounds allowed per operator turn.
pub const MAX_DEPTH: u32 = 15;

/// After an unrelated error, a conversation this short is assumed to have lost its history.
const SUSPICIOUS_LENGTH: usize = 2;

const CANCELLED_NOTICE: &str = "Operation cancelled by the user.";

/// Agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// System prompt
    pub system_prompt: Option<String>,
    /// Model to use
    pub model: ModelInfo,
    /// Maximum tool-call rounds per turn
    pub max_depth: u32,
    /// Context budget thresholds
    pub budget: BudgetConfig,
}

impl AgentConfig {
    pub fn new(model: ModelInfo) -> Self {
        Self {
            system_prompt: None,
            model,
            max_depth: MAX_DEPTH,
            budget: BudgetConfig::default(),
        }
    }
}

/// How a turn ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The model answered with text
    Completed,
    /// The tool-call chain reached the depth limit
    DepthLimited,
    /// The operator cancelled the turn
    Cancelled,
}

/// The main agent that orchestrates conversations
pub struct Agent {
    config: AgentConfig,
    conversation: Conversation,
    transcript: Vec<DisplayEntry>,
    tools: Vec<BoxedTool>,
    provider: Arc<dyn ChatProvider>,
    budget: ContextBudget,
    gate: Arc<PermissionGate>,
    supervisor: Arc<ProcessSupervisor>,
    store: Arc<dyn SessionStore>,
    event_tx: broadcast::Sender<AgentEvent>,
    handle: AgentHandle,
    /// Set by `clear_history`, so a short conversation is not mistaken for lost history
    cleared_intentionally: bool,
    /// Generation of the newest snapshot handed to a save task
    save_generation: u64,
    /// Generation of the newest snapshot written; held while writing
    saved_generation: Arc<Mutex<u64>>,

    // --- Schema validator cache ---
    /// Cached compiled JSON schema validators keyed by tool name
    schema_cache: HashMap<String, Arc<jsonschema::Validator>>,
}

impl Agent {
    /// Create a new agent
    pub fn new(
        config: AgentConfig,
        provider: Arc<dyn ChatProvider>,
        gate: Arc<PermissionGate>,
        supervisor: Arc<ProcessSupervisor>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            conversation: Conversation::new(config.model.ceiling()),
            budget: ContextBudget::new(config.budget.clone()),
            config,
            transcript: Vec::new(),
            tools: vec![],
            provider,
            handle: AgentHandle::new(gate.clone()),
            gate,
            supervisor,
            store,
            event_tx,
            cleared_intentionally: false,
            save_generation: 0,
            saved_generation: Arc::new(Mutex::new(0)),
            schema_cache: HashMap::new(),
        }
    }

    /// Subscribe to agent events
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.event_tx.subscribe()
    }

    /// Get the current conversation
    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// Get all messages
    pub fn messages(&self) -> &[Message] {
        &self.conversation.messages
    }

    /// UI-facing transcript
    pub fn transcript(&self) -> &[DisplayEntry] {
        &self.transcript
    }

    /// Get the agent config
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn gate(&self) -> &Arc<PermissionGate> {
        &self.gate
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    /// Get a cloneable handle for poking the agent from external code.
    pub fn handle(&self) -> AgentHandle {
        self.handle.clone()
    }

    /// Set the system prompt
    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        self.config.system_prompt = Some(prompt.into());
    }

    /// Set the model; the conversation's ceiling follows it.
    pub fn set_model(&mut self, model: ModelInfo) {
        self.conversation.ceiling = model.ceiling();
        self.config.model = model;
    }

    /// Switch backend and model together.
    pub fn set_provider(&mut self, provider: Arc<dyn ChatProvider>, model: ModelInfo) {
        self.provider = provider;
        self.set_model(model);
    }

    /// Set tools (replaces existing)
    pub fn set_tools(&mut self, tools: Vec<BoxedTool>) {
        self.schema_cache.clear();
        for tool in &tools {
            self.cache_tool_schema(tool);
        }
        self.tools = tools;
    }

    /// Compile and cache the JSON schema validator for a tool.
    fn cache_tool_schema(&mut self, tool: &BoxedTool) {
        let schema = tool.parameters_schema();
        match jsonschema::validator_for(&schema) {
            Ok(validator) => {
                self.schema_cache
                    .insert(tool.name().to_string(), Arc::new(validator));
            }
            Err(e) => {
                tracing::warn!(
                    "Invalid tool parameter schema for '{}', skipping validation: {}",
                    tool.name(),
                    e
                );
            }
        }
    }

    /// Get tool names
    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    fn emit(&self, event: AgentEvent) {
        let _ = self.event_tx.send(event);
    }

    fn note(&mut self, kind: DisplayKind, text: impl Into<String>) {
        self.transcript.push(DisplayEntry::new(kind, text));
    }

    fn append(&mut self, message: Message) {
        self.emit(AgentEvent::MessageAppended {
            message: message.clone(),
        });
        self.conversation.push(message);
    }

    fn emit_usage(&self) {
        self.emit(AgentEvent::UsageUpdated {
            usage: self.conversation.total_usage.clone(),
            estimated_tokens: self.budget.estimate(&self.conversation),
            ceiling: self.conversation.ceiling,
        });
    }

    /// Send operator input and run the turn to completion.
    pub async fn prompt(&mut self, input: &str) -> Result<TurnOutcome> {
        let cancel = self.handle.reset();
        self.handle.set_running(true);
        self.conversation.error = None;

        self.note(DisplayKind::User, input);
        self.append(Message::user(input));

        let result = self.run_turn(&cancel).await;

        self.handle.set_running(false);
        self.emit(AgentEvent::TurnEnd {
            usage: self.conversation.total_usage.clone(),
        });
        result
    }

    /// The loop: budget, provider call, tool dispatch, repeat with depth + 1.
    async fn run_turn(&mut self, cancel: &CancellationToken) -> Result<TurnOutcome> {
        let mut depth = 0u32;
        let mut retried = false;

        loop {
            if depth >= self.config.max_depth {
                tracing::warn!(depth, "Tool-call depth limit reached");
                self.note(
                    DisplayKind::Notice,
                    format!("Stopped after {depth} tool-call rounds (depth limit)."),
                );
                self.emit(AgentEvent::DepthLimitReached { depth });
                return Ok(TurnOutcome::DepthLimited);
            }

            if !cancel.is_cancelled() {
                self.apply_budget(cancel).await;
            }
            if cancel.is_cancelled() {
                return Ok(self.cancelled());
            }

            self.emit(AgentEvent::TurnStart { depth });
            let definitions: Vec<ToolDefinition> =
                self.tools.iter().map(|t| to_definition(t.as_ref())).collect();
            let request = ChatRequest {
                model: &self.config.model,
                system_prompt: self.config.system_prompt.as_deref(),
                messages: &self.conversation.messages,
                tools: &definitions,
            };
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(ember_ai::Error::Aborted),
                reply = self.provider.invoke(request, cancel.clone()) => reply,
            };

            let reply = match result {
                Ok(reply) => reply,
                Err(ember_ai::Error::Aborted) if cancel.is_cancelled() => {
                    return Ok(self.cancelled());
                }
                Err(e) if !retried && self.provider.is_capacity_error(&e) => {
                    tracing::warn!("Provider rejected the conversation as too large: {}", e);
                    retried = true;
                    if let Err(e) = self.compact_with(CompactionReason::Overflow, cancel).await {
                        tracing::warn!("Compaction after overflow failed: {}", e);
                    }
                    depth += 1;
                    continue;
                }
                Err(e) => return Err(self.fail(e)),
            };

            if let Some(usage) = reply.usage() {
                self.conversation.total_usage.add(usage);
            }

            let (text, calls) = match reply {
                Reply::Text { text, .. } => (text, Vec::new()),
                Reply::ToolCalls { text, calls, .. } => (text, calls),
            };

            if calls.is_empty() {
                self.note(DisplayKind::Assistant, &text);
                self.append(Message::assistant(text));
                self.emit_usage();
                self.save();
                return Ok(TurnOutcome::Completed);
            }

            if !text.is_empty() {
                self.note(DisplayKind::Assistant, &text);
            }
            self.append(Message::assistant_with_calls(text, calls.clone()));

            for call in &calls {
                if cancel.is_cancelled() {
                    return Ok(self.cancelled());
                }
                let result = self.dispatch(call, cancel).await;
                self.append(Message::tool_result(
                    &call.id,
                    &call.name,
                    result.content,
                    result.is_error,
                ));
                self.emit_usage();
            }

            depth += 1;
        }
    }

    /// Validate, ask the gate, and run one tool call. Every failure becomes an error result.
    async fn dispatch(&mut self, call: &ToolCall, cancel: &CancellationToken) -> ToolResult {
        self.emit(AgentEvent::ToolExecutionStart {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            arguments: call.arguments.clone(),
        });

        let tool = self.tools.iter().find(|t| t.name() == call.name).cloned();
        let result = match tool {
            None => ToolResult::error(format!("Tool not found: {}", call.name)),
            Some(tool) => {
                let validation_error = self
                    .schema_cache
                    .get(call.name.as_str())
                    .and_then(|validator| validate_with_validator(&call.arguments, validator));
                if let Some(err) = validation_error {
                    ToolResult::error(err)
                } else {
                    match self.gate.check(&call.name, &call.arguments).await {
                        Permission::Granted => {
                            tool.execute(&call.id, call.arguments.clone(), cancel.clone())
                                .await
                        }
                        Permission::Denied => {
                            self.emit(AgentEvent::PermissionDenied {
                                tool_name: call.name.clone(),
                            });
                            ToolResult::error(format!(
                                "Permission denied: the user did not allow {} to run.",
                                call.name
                            ))
                        }
                    }
                }
            }
        };

        self.emit(AgentEvent::ToolExecutionEnd {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            result: result.content.clone(),
            is_error: result.is_error,
        });
        let summary = result.content.lines().next().unwrap_or_default();
        let status = if result.is_error { "error" } else { "ok" };
        self.note(
            DisplayKind::Tool,
            format!("{} [{}] {}", call.name, status, summary),
        );
        result
    }

    fn cancelled(&mut self) -> TurnOutcome {
        tracing::info!("Turn cancelled");
        self.append(Message::system(CANCELLED_NOTICE));
        self.note(DisplayKind::Notice, CANCELLED_NOTICE);
        self.emit(AgentEvent::Cancelled);
        TurnOutcome::Cancelled
    }

    /// Record a terminal provider error. The conversation is left as it is,
    /// unless it looks like history was lost and a backup can bring it back.
    fn fail(&mut self, error: ember_ai::Error) -> crate::error::Error {
        let message = error.to_string();
        tracing::error!("Provider call failed: {}", message);
        self.conversation.error = Some(message.clone());
        self.note(DisplayKind::Error, &message);
        self.emit(AgentEvent::Error { message });
        self.restore_if_suspiciously_short();
        error.into()
    }

    fn restore_if_suspiciously_short(&mut self) {
        let len = self.conversation.len();
        let compacted = self
            .conversation
            .messages
            .first()
            .is_some_and(|m| m.text() == COMPACTED_INSTRUCTION);
        if self.cleared_intentionally || compacted || len > SUSPICIOUS_LENGTH {
            return;
        }
        match self.store.restore_backup() {
            Ok(Some(snapshot)) if snapshot.messages.len() > len => {
                tracing::warn!(
                    current = len,
                    backup = snapshot.messages.len(),
                    "Conversation looks truncated after an error, restoring backup"
                );
                self.apply_snapshot(snapshot);
            }
            Ok(_) => {}
            Err(e) => tracing::debug!("No backup to restore: {}", e),
        }
    }

    fn compaction_context(
        &self,
        reason: CompactionReason,
        cancel: &CancellationToken,
    ) -> CompactionContext<'_> {
        CompactionContext {
            provider: self.provider.as_ref(),
            store: self.store.as_ref(),
            model: &self.config.model,
            transcript: &self.transcript,
            environment: EnvironmentFacts::new(self.supervisor.cwd(), self.supervisor.list()),
            reason,
            events: Some(&self.event_tx),
            cancel: cancel.clone(),
        }
    }

    async fn apply_budget(&mut self, cancel: &CancellationToken) {
        let mut conversation = std::mem::take(&mut self.conversation);
        let report = {
            let ctx = self.compaction_context(CompactionReason::Budget, cancel);
            self.budget.ensure_fits(&mut conversation, &ctx).await
        };
        self.conversation = conversation;

        if !report.passes.is_empty() {
            self.note(
                DisplayKind::Notice,
                format!(
                    "Context reduced from ~{} to ~{} tokens (target {}).",
                    report.tokens_before, report.tokens_after, report.target
                ),
            );
            self.emit(AgentEvent::BudgetApplied {
                tokens_before: report.tokens_before,
                tokens_after: report.tokens_after,
                passes: report.passes,
            });
        }
    }

    async fn compact_with(
        &mut self,
        reason: CompactionReason,
        cancel: &CancellationToken,
    ) -> Result<CompactionResult> {
        let mut conversation = std::mem::take(&mut self.conversation);
        let result = {
            let ctx = self.compaction_context(reason, cancel);
            self.budget.compact(&mut conversation, &ctx).await
        };
        self.conversation = conversation;

        let result = result?;
        let notice = match &result.outcome {
            CompactionOutcome::Summarized => format!(
                "Conversation compacted from ~{} to ~{} tokens.",
                result.tokens_before, result.tokens_after
            ),
            CompactionOutcome::RestoredBackup { error } => {
                format!("Compaction failed ({error}); conversation restored from backup.")
            }
            CompactionOutcome::KeptRecent { kept, error } => {
                format!("Compaction failed ({error}); kept the last {kept} messages.")
            }
        };
        self.note(DisplayKind::Notice, notice);
        self.emit_usage();
        Ok(result)
    }

    /// Summarize the conversation now (the `/compact` command).
    pub async fn compact(&mut self) -> Result<CompactionResult> {
        let cancel = self.handle.reset();
        let result = self.compact_with(CompactionReason::Manual, &cancel).await;
        if result.is_ok() {
            self.save();
        }
        result
    }

    /// Fire-and-forget save of the conversation and transcript.
    ///
    /// Saves are written one at a time, and a snapshot older than one already
    /// written is dropped.
    fn save(&mut self) {
        self.save_generation += 1;
        let generation = self.save_generation;
        let snapshot = self.snapshot();
        let store = self.store.clone();
        let saved = self.saved_generation.clone();
        tokio::task::spawn_blocking(move || {
            let mut saved = saved.lock();
            if *saved >= generation {
                tracing::debug!(generation, "Skipping stale session save");
                return;
            }
            match store.save(&snapshot) {
                Ok(()) => *saved = generation,
                Err(e) => tracing::warn!("Failed to save session: {}", e),
            }
        });
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot::new(
            self.conversation.messages.clone(),
            self.transcript.clone(),
            self.config.model.id.clone(),
            self.supervisor.cwd(),
        )
    }

    fn apply_snapshot(&mut self, snapshot: SessionSnapshot) {
        let count = snapshot.messages.len();
        self.conversation.messages = snapshot.messages;
        self.conversation.error = None;
        self.transcript = snapshot.display;
        self.cleared_intentionally = false;
        self.emit(AgentEvent::HistoryRestored { messages: count });
        self.emit_usage();
    }

    /// Forget the conversation. The backup slot is kept for `restore_backup`.
    pub fn clear_history(&mut self) {
        self.conversation.clear();
        self.transcript.clear();
        self.cleared_intentionally = true;
        // Saves still in flight must not bring the session back
        self.save_generation += 1;
        {
            let mut saved = self.saved_generation.lock();
            *saved = self.save_generation;
            if let Err(e) = self.store.clear() {
                tracing::warn!("Failed to clear saved session: {}", e);
            }
        }
        self.emit_usage();
    }

    /// Replace the conversation with the backup slot. Returns the restored message count.
    pub fn restore_backup(&mut self) -> Option<usize> {
        match self.store.restore_backup() {
            Ok(Some(snapshot)) => {
                let count = snapshot.messages.len();
                self.apply_snapshot(snapshot);
                self.save();
                Some(count)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("Failed to read backup: {}", e);
                None
            }
        }
    }

    /// Resume the last saved session. Returns the loaded message count.
    pub fn load_session(&mut self) -> Option<usize> {
        match self.store.load() {
            Ok(Some(snapshot)) => {
                let count = snapshot.messages.len();
                self.apply_snapshot(snapshot);
                Some(count)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("Failed to load session: {}", e);
                None
            }
        }
    }
}

/// Validate tool arguments against a pre-compiled JSON Schema validator.
/// Returns `Some(error_message)` if validation fails, `None` if valid.
fn validate_with_validator(
    args: &serde_json::Value,
    validator: &jsonschema::Validator,
) -> Option<String> {
    let errors: Vec<String> = validator
        .iter_errors(args)
        .map(|e| {
            let path = e.instance_path.to_string();
            if path.is_empty() {
                e.to_string()
            } else {
                format!("{}: {}", path, e)
            }
        })
        .collect();

    if errors.is_empty() {
        None
    } else {
        Some(format!(
            "Tool argument validation failed:\n{}",
            errors.join("\n")
        ))
    }
}
