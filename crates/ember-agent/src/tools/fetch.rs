//! fetch_url: hand a URL to the configured fetcher

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::{Tool, ToolResult, required_str};

/// URL-to-text capability, supplied by the front end.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch `url` and return its body as text, or a message describing the failure.
    async fn fetch(&self, url: &str) -> Result<String, String>;
}

/// Tool for fetching web pages
pub struct FetchUrlTool {
    fetcher: Arc<dyn Fetcher>,
}

impl FetchUrlTool {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl Tool for FetchUrlTool {
    fn name(&self) -> &str {
        "fetch_url"
    }

    fn description(&self) -> &str {
        "Fetch a URL over HTTP(S) and return the response body as text."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "http:// or https:// URL to fetch"
                }
            },
            "required": ["url"]
        })
    }

    async fn execute(
        &self,
        _tool_call_id: &str,
        arguments: serde_json::Value,
        cancel: CancellationToken,
    ) -> ToolResult {
        let url = match required_str(&arguments, "url") {
            Ok(u) => u.trim(),
            Err(e) => return e,
        };
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return ToolResult::error(format!("Unsupported URL (expected http or https): {url}"));
        }

        tokio::select! {
            _ = cancel.cancelled() => ToolResult::error("Operation cancelled"),
            result = self.fetcher.fetch(url) => match result {
                Ok(body) => ToolResult::text(format!("URL: {url}\nCONTENT:\n{body}")),
                Err(e) => ToolResult::error(format!("Failed to fetch {url}: {e}")),
            },
        }
    }
}
