//! Process tools: run_command, stop_process, list_processes, get_logs, send_input
//!
//! Results start with `KEY: value` lines so the context budget can keep them
//! when it truncates the output below.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::{Tool, ToolResult, required_str};
use crate::process::{
    AutoStopped, InputOutcome, LogsOutcome, ProcessSupervisor, RunOutcome, StopOutcome,
};

fn format_runtime(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{:.1}s", d.as_secs_f64())
    }
}

fn exit_code(code: Option<i32>) -> String {
    code.map_or_else(|| "none".to_string(), |c| c.to_string())
}

fn not_found(id: &str, known: &[String]) -> ToolResult {
    let known = if known.is_empty() {
        "(none)".to_string()
    } else {
        known.join(", ")
    };
    ToolResult::error(format!(
        "STATUS: not_found\nID: {id}\nKNOWN_IDS: {known}\nNo process with id '{id}'."
    ))
}

fn push_auto_stopped(out: &mut String, stopped: &Option<AutoStopped>) {
    if let Some(s) = stopped {
        let _ = writeln!(out, "AUTO_STOPPED: {} ({})", s.id, s.command);
    }
}

/// Render a run outcome for the model.
pub(crate) fn render_run(outcome: &RunOutcome) -> ToolResult {
    let mut out = String::new();
    match outcome {
        RunOutcome::Completed {
            command,
            cwd,
            exit_code: code,
            output,
            auto_stopped,
        } => {
            let _ = writeln!(out, "STATUS: completed");
            let _ = writeln!(out, "EXIT_CODE: {}", exit_code(*code));
            let _ = writeln!(out, "COMMAND: {command}");
            let _ = writeln!(out, "CWD: {}", cwd.display());
            push_auto_stopped(&mut out, auto_stopped);
            let _ = writeln!(out, "OUTPUT:");
            out.push_str(if output.is_empty() { "(no output)" } else { output.as_str() });
            ToolResult {
                content: out,
                is_error: *code != Some(0),
            }
        }
        RunOutcome::Backgrounded {
            id,
            command,
            cwd,
            pid,
            port,
            preview,
            auto_stopped,
        } => {
            let _ = writeln!(out, "STATUS: running_in_background");
            let _ = writeln!(out, "ID: {id}");
            let _ = writeln!(out, "COMMAND: {command}");
            let _ = writeln!(out, "CWD: {}", cwd.display());
            if let Some(pid) = pid {
                let _ = writeln!(out, "PID: {pid}");
            }
            if let Some(port) = port {
                let _ = writeln!(out, "PORT: {port}");
            }
            push_auto_stopped(&mut out, auto_stopped);
            let _ = writeln!(
                out,
                "NOTE: still running; use get_logs, send_input or stop_process with id {id}"
            );
            let _ = writeln!(out, "OUTPUT:");
            out.push_str(preview);
            ToolResult::text(out)
        }
        RunOutcome::DirectoryChanged { cwd } => {
            ToolResult::text(format!("STATUS: directory_changed\nCWD: {}", cwd.display()))
        }
        RunOutcome::Failed {
            command,
            cwd,
            error,
        } => ToolResult::error(format!(
            "STATUS: failed\nCOMMAND: {command}\nCWD: {}\nERROR: {error}",
            cwd.display()
        )),
    }
}

/// Tool for running shell commands
pub struct RunCommandTool {
    supervisor: Arc<ProcessSupervisor>,
}

impl RunCommandTool {
    pub fn new(supervisor: Arc<ProcessSupervisor>) -> Self {
        Self { supervisor }
    }
}

#[async_trait]
impl Tool for RunCommandTool {
    fn name(&self) -> &str {
        "run_command"
    }

    fn description(&self) -> &str {
        "Run a shell command. Commands still running after 15 seconds move to the background \
         and return an id (bg_N) for get_logs, send_input and stop_process. Starting a dev \
         server stops an already running server of the same kind first. A bare `cd DIR` \
         changes the working directory for later commands."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "Shell command to run"
                },
                "cwd": {
                    "type": "string",
                    "description": "Directory to run in (defaults to the current working directory)"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(
        &self,
        _tool_call_id: &str,
        arguments: serde_json::Value,
        _cancel: CancellationToken,
    ) -> ToolResult {
        let command = match required_str(&arguments, "command") {
            Ok(c) => c,
            Err(e) => return e,
        };
        if command.trim().is_empty() {
            return ToolResult::error("Empty command");
        }
        let cwd = arguments.get("cwd").and_then(|v| v.as_str());
        render_run(&self.supervisor.run(command, cwd).await)
    }
}

/// Tool for stopping background processes
pub struct StopProcessTool {
    supervisor: Arc<ProcessSupervisor>,
}

impl StopProcessTool {
    pub fn new(supervisor: Arc<ProcessSupervisor>) -> Self {
        Self { supervisor }
    }
}

#[async_trait]
impl Tool for StopProcessTool {
    fn name(&self) -> &str {
        "stop_process"
    }

    fn description(&self) -> &str {
        "Stop a background process and return its remaining output. The id is forgotten afterwards."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "process_id": {
                    "type": "string",
                    "description": "Process id, e.g. bg_1"
                }
            },
            "required": ["process_id"]
        })
    }

    async fn execute(
        &self,
        _tool_call_id: &str,
        arguments: serde_json::Value,
        _cancel: CancellationToken,
    ) -> ToolResult {
        let id = match required_str(&arguments, "process_id") {
            Ok(id) => id,
            Err(e) => return e,
        };
        match self.supervisor.stop(id).await {
            StopOutcome::Stopped(report) => {
                let status = match (report.was_running, report.forced) {
                    (false, _) => "already_exited",
                    (true, false) => "stopped",
                    (true, true) => "killed",
                };
                let mut out = String::new();
                let _ = writeln!(out, "STATUS: {status}");
                let _ = writeln!(out, "ID: {}", report.id);
                let _ = writeln!(out, "COMMAND: {}", report.command);
                let _ = writeln!(out, "EXIT_CODE: {}", exit_code(report.exit_code));
                let _ = writeln!(out, "RUNTIME: {}", format_runtime(report.runtime));
                let _ = writeln!(out, "OUTPUT:");
                out.push_str(&report.output);
                ToolResult::text(out)
            }
            StopOutcome::NotFound { id, known } => not_found(&id, &known),
        }
    }
}

/// Tool for listing background processes
pub struct ListProcessesTool {
    supervisor: Arc<ProcessSupervisor>,
}

impl ListProcessesTool {
    pub fn new(supervisor: Arc<ProcessSupervisor>) -> Self {
        Self { supervisor }
    }
}

#[async_trait]
impl Tool for ListProcessesTool {
    fn name(&self) -> &str {
        "list_processes"
    }

    fn description(&self) -> &str {
        "List background processes with their status, pid, port and runtime."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    async fn execute(
        &self,
        _tool_call_id: &str,
        _arguments: serde_json::Value,
        _cancel: CancellationToken,
    ) -> ToolResult {
        let processes = self.supervisor.list();
        if processes.is_empty() {
            return ToolResult::text("No background processes.");
        }
        let mut out = String::new();
        for p in processes {
            let status = if p.running {
                "running".to_string()
            } else {
                format!("exited ({})", exit_code(p.exit_code))
            };
            let pid = p.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into());
            let port = p.port.map(|p| p.to_string()).unwrap_or_else(|| "-".into());
            let _ = writeln!(
                out,
                "{}  {}  pid={}  port={}  runtime={}  {}",
                p.id,
                status,
                pid,
                port,
                format_runtime(p.runtime),
                p.command
            );
        }
        ToolResult::text(out.trim_end().to_string())
    }
}

/// Tool for reading background process output
pub struct GetLogsTool {
    supervisor: Arc<ProcessSupervisor>,
}

impl GetLogsTool {
    pub fn new(supervisor: Arc<ProcessSupervisor>) -> Self {
        Self { supervisor }
    }
}

#[async_trait]
impl Tool for GetLogsTool {
    fn name(&self) -> &str {
        "get_logs"
    }

    fn description(&self) -> &str {
        "Show the status and recent output of a background process without changing it."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "process_id": {
                    "type": "string",
                    "description": "Process id, e.g. bg_1"
                },
                "tail": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Number of trailing lines to return (default: 50)"
                }
            },
            "required": ["process_id"]
        })
    }

    async fn execute(
        &self,
        _tool_call_id: &str,
        arguments: serde_json::Value,
        _cancel: CancellationToken,
    ) -> ToolResult {
        let id = match required_str(&arguments, "process_id") {
            Ok(id) => id,
            Err(e) => return e,
        };
        let tail = arguments
            .get("tail")
            .and_then(|v| v.as_u64())
            .map(|t| t as usize);

        match self.supervisor.logs(id, tail) {
            LogsOutcome::Found(report) => {
                let mut out = String::new();
                let status = if report.running { "running" } else { "exited" };
                let _ = writeln!(out, "STATUS: {status}");
                let _ = writeln!(out, "ID: {}", report.id);
                let _ = writeln!(out, "COMMAND: {}", report.command);
                if !report.running {
                    let _ = writeln!(out, "EXIT_CODE: {}", exit_code(report.exit_code));
                }
                if let Some(port) = report.port {
                    let _ = writeln!(out, "PORT: {port}");
                }
                let _ = writeln!(out, "RUNTIME: {}", format_runtime(report.runtime));
                let _ = writeln!(out, "OUTPUT_BYTES: {}", report.output_bytes);
                let _ = writeln!(out, "OUTPUT:");
                out.push_str(if report.output.is_empty() {
                    "(no output yet)"
                } else {
                    report.output.as_str()
                });
                ToolResult::text(out)
            }
            LogsOutcome::NotFound { id, known } => not_found(&id, &known),
        }
    }
}

/// Tool for writing to a background process's stdin
pub struct SendInputTool {
    supervisor: Arc<ProcessSupervisor>,
}

impl SendInputTool {
    pub fn new(supervisor: Arc<ProcessSupervisor>) -> Self {
        Self { supervisor }
    }
}

#[async_trait]
impl Tool for SendInputTool {
    fn name(&self) -> &str {
        "send_input"
    }

    fn description(&self) -> &str {
        "Send a line of input to a running background process and return its recent output."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "process_id": {
                    "type": "string",
                    "description": "Process id, e.g. bg_1"
                },
                "input": {
                    "type": "string",
                    "description": "Text to send; a trailing newline is added if missing"
                }
            },
            "required": ["process_id", "input"]
        })
    }

    async fn execute(
        &self,
        _tool_call_id: &str,
        arguments: serde_json::Value,
        _cancel: CancellationToken,
    ) -> ToolResult {
        let (id, input) = match (
            required_str(&arguments, "process_id"),
            required_str(&arguments, "input"),
        ) {
            (Ok(id), Ok(input)) => (id, input),
            (Err(e), _) | (_, Err(e)) => return e,
        };

        match self.supervisor.send_input(id, input).await {
            InputOutcome::Sent { id, output } => {
                ToolResult::text(format!("STATUS: input_sent\nID: {id}\nOUTPUT:\n{output}"))
            }
            InputOutcome::NotRunning { id, exit_code: code } => ToolResult::error(format!(
                "STATUS: not_running\nID: {id}\nEXIT_CODE: {}\nThe process has exited.",
                exit_code(code)
            )),
            InputOutcome::InputClosed { id } => ToolResult::error(format!(
                "STATUS: input_closed\nID: {id}\nThe process no longer accepts input."
            )),
            InputOutcome::NotFound { id, known } => not_found(&id, &known),
        }
    }
}
