//! ember-agent: the decision core of a terminal coding agent
//!
//! This crate provides the orchestration loop that turns operator input into
//! model calls and tool executions, the context budget that keeps conversations
//! under the model's ceiling, the background process supervisor, and the
//! permission gate in front of dangerous tools.

pub mod agent;
pub mod budget;
pub mod compaction;
pub mod conversation;
pub mod error;
pub mod events;
pub mod handle;
pub mod permission;
pub mod persistence;
pub mod process;
pub mod tools;

pub use agent::{Agent, AgentConfig, MAX_DEPTH, TurnOutcome};
pub use budget::{BudgetConfig, BudgetPass, BudgetReport, CharEstimator, ContextBudget, TokenEstimator};
pub use compaction::{CompactionOutcome, CompactionReason, CompactionResult};
pub use conversation::{Conversation, DisplayEntry, DisplayKind};
pub use error::{Error, Result};
pub use events::AgentEvent;
pub use handle::AgentHandle;
pub use permission::{Permission, PermissionDecision, PermissionGate, PermissionRequest};
pub use persistence::{FileStore, MemoryStore, SessionSnapshot, SessionStore};
pub use process::{ProcessSupervisor, SupervisorConfig, WorkingDir};
pub use tools::{BoxedTool, Fetcher, Filesystem, LocalFilesystem, Tool, ToolResult, builtin_tools};
