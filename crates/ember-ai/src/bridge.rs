//! Provider that delegates each request to an external command.
//!
//! The command receives one JSON object on stdin:
//!
//! ```json
//! {"model": "...", "max_tokens": 8192, "system_prompt": "...", "messages": [...], "tools": [...]}
//! ```
//!
//! and must print one JSON object on stdout, one of:
//!
//! ```json
//! {"text": "..."}
//! {"text": "...", "tool_calls": [{"id": "...", "name": "...", "arguments": {...}}]}
//! {"error": "..."}   or   {"error": {"type": "...", "message": "..."}}
//! ```
//!
//! An optional `"usage"` object may accompany any successful reply.

use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::{
    ChatProvider, ChatRequest, Error, Message, Reply, Result, ToolCall, ToolDefinition, Usage,
};

#[derive(Serialize)]
struct BridgeRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_prompt: Option<&'a str>,
    messages: &'a [Message],
    tools: &'a [ToolDefinition],
}

#[derive(Deserialize)]
struct BridgeToolCall {
    #[serde(default)]
    id: Option<String>,
    name: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BridgeError {
    Message(String),
    Detailed {
        #[serde(rename = "type", default)]
        error_type: String,
        message: String,
    },
}

#[derive(Deserialize)]
struct BridgeReply {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    tool_calls: Vec<BridgeToolCall>,
    #[serde(default)]
    error: Option<BridgeError>,
    #[serde(default)]
    usage: Option<Usage>,
}

/// Runs `program args...` once per request.
#[derive(Debug, Clone)]
pub struct CommandProvider {
    name: String,
    program: String,
    args: Vec<String>,
}

impl CommandProvider {
    pub fn new(name: impl Into<String>, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args,
        }
    }

    async fn exchange(&self, payload: Vec<u8>) -> Result<Vec<u8>> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::InvalidConfig(format!("cannot start '{}': {e}", self.program)))?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // All three pipes move together; a full stderr must not stall stdout
        let write = async move {
            if let Some(mut stdin) = stdin {
                match stdin.write_all(&payload).await {
                    // The bridge may exit without reading its input
                    Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                    other => other?,
                }
                let _ = stdin.shutdown().await;
            }
            Ok::<_, std::io::Error>(())
        };
        let (_, stdout, stderr) = tokio::try_join!(write, drain(stdout), drain(stderr))?;
        let status = child.wait().await?;

        if !status.success() && stdout.iter().all(u8::is_ascii_whitespace) {
            let message = String::from_utf8_lossy(&stderr).trim().to_string();
            return Err(Error::api(
                "bridge",
                if message.is_empty() {
                    format!("'{}' exited with {status}", self.program)
                } else {
                    message
                },
            ));
        }
        Ok(stdout)
    }
}

async fn drain<R: AsyncRead + Unpin>(pipe: Option<R>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

fn parse_reply(raw: &[u8]) -> Result<Reply> {
    let reply: BridgeReply = serde_json::from_slice(raw)
        .map_err(|e| Error::UnexpectedResponse(format!("bridge reply is not valid JSON: {e}")))?;

    if let Some(error) = reply.error {
        return Err(match error {
            BridgeError::Message(message) => Error::api("bridge", message),
            BridgeError::Detailed {
                error_type,
                message,
            } => Error::api(error_type, message),
        });
    }

    let text = reply.text.unwrap_or_default();
    if reply.tool_calls.is_empty() {
        return Ok(Reply::Text {
            text,
            usage: reply.usage,
        });
    }

    let calls = reply
        .tool_calls
        .into_iter()
        .map(|c| ToolCall {
            id: c
                .id
                .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple())),
            name: c.name,
            arguments: c.arguments,
        })
        .collect();

    Ok(Reply::ToolCalls {
        text,
        calls,
        usage: reply.usage,
    })
}

#[async_trait]
impl ChatProvider for CommandProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, request: ChatRequest<'_>, cancel: CancellationToken) -> Result<Reply> {
        let payload = serde_json::to_vec(&BridgeRequest {
            model: &request.model.id,
            max_tokens: request.model.max_tokens,
            system_prompt: request.system_prompt,
            messages: request.messages,
            tools: request.tools,
        })?;

        tracing::debug!(
            provider = %self.name,
            messages = request.messages.len(),
            bytes = payload.len(),
            "invoking bridge"
        );

        // Dropping the exchange future kills the child (kill_on_drop)
        let raw = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Aborted),
            raw = self.exchange(payload) => raw?,
        };

        parse_reply(&raw)
    }
}
