//! Tool trait and the built-in tool catalogue

mod fetch;
mod file;
mod process;

pub use fetch::{FetchUrlTool, Fetcher};
pub use file::{DirEntryInfo, Filesystem, ListDirTool, LocalFilesystem, ReadFileTool, WriteFileTool};
pub use process::{GetLogsTool, ListProcessesTool, RunCommandTool, SendInputTool, StopProcessTool};

use std::sync::Arc;

use async_trait::async_trait;
use ember_ai::ToolDefinition;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::process::{ProcessSupervisor, WorkingDir};

/// Result of a tool execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Content to return to the model
    pub content: String,
    /// Whether the execution resulted in an error
    pub is_error: bool,
}

impl ToolResult {
    /// Create a successful text result
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: text.into(),
            is_error: false,
        }
    }

    /// Create an error result
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: message.into(),
            is_error: true,
        }
    }
}

/// Trait for executable tools
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (used in provider calls)
    fn name(&self) -> &str;

    /// Tool description for the model
    fn description(&self) -> &str;

    /// JSON Schema for parameters
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given arguments.
    ///
    /// Once started a call runs to completion; `cancel` lets long waits end early.
    async fn execute(
        &self,
        tool_call_id: &str,
        arguments: serde_json::Value,
        cancel: CancellationToken,
    ) -> ToolResult;
}

/// Boxed tool type for dynamic dispatch
pub type BoxedTool = Arc<dyn Tool>;

/// Describe a tool for the provider.
pub fn to_definition(tool: &dyn Tool) -> ToolDefinition {
    ToolDefinition {
        name: tool.name().to_string(),
        description: tool.description().to_string(),
        parameters: tool.parameters_schema(),
    }
}

/// Required string argument, or an error result naming it.
pub(crate) fn required_str<'a>(
    arguments: &'a serde_json::Value,
    name: &str,
) -> Result<&'a str, ToolResult> {
    arguments
        .get(name)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolResult::error(format!("Missing '{}' argument", name)))
}

/// The nine tools the agent offers, wired to their collaborators.
pub fn builtin_tools(
    filesystem: Arc<dyn Filesystem>,
    supervisor: Arc<ProcessSupervisor>,
    fetcher: Arc<dyn Fetcher>,
) -> Vec<BoxedTool> {
    let cwd: WorkingDir = supervisor.working_dir().clone();
    vec![
        Arc::new(ReadFileTool::new(filesystem.clone(), cwd.clone())),
        Arc::new(WriteFileTool::new(filesystem.clone(), cwd.clone())),
        Arc::new(ListDirTool::new(filesystem, cwd)),
        Arc::new(RunCommandTool::new(supervisor.clone())),
        Arc::new(StopProcessTool::new(supervisor.clone())),
        Arc::new(ListProcessesTool::new(supervisor.clone())),
        Arc::new(GetLogsTool::new(supervisor.clone())),
        Arc::new(SendInputTool::new(supervisor)),
        Arc::new(FetchUrlTool::new(fetcher)),
    ]
}
