//! HTTP implementation of the agent's URL fetcher

use std::time::Duration;

use async_trait::async_trait;
use ember_agent::Fetcher;

const MAX_BODY_CHARS: usize = 100_000;
const TIMEOUT: Duration = Duration::from_secs(30);

/// GETs a URL and returns its body as text, without any HTML conversion.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(TIMEOUT)
            .user_agent(concat!("ember/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<String, String> {
        tracing::debug!(url, "Fetching");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("HTTP {}", status));
        }
        let body = response.text().await.map_err(|e| e.to_string())?;
        Ok(cap_body(body))
    }
}

fn cap_body(body: String) -> String {
    let total = body.chars().count();
    if total <= MAX_BODY_CHARS {
        return body;
    }
    let kept: String = body.chars().take(MAX_BODY_CHARS).collect();
    format!("{kept}\n\n[Response truncated: showing {MAX_BODY_CHARS} of {total} characters]")
}
