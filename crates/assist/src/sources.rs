//! The three cascade sources: the in-process web search aggregator, the
//! research CLI, and the hosted assistant endpoint.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::process::Command;
use tracing::debug;

use meridian_search::{SearchError, WebSearchAggregator};

use crate::{AssistSource, SourceAnswer, SourceError};

// ── Web search ───────────────────────────────────────────────────────────────

/// Free multi-source web search, first in the cascade.
pub struct WebSearchSource {
    aggregator: Arc<WebSearchAggregator>,
}

impl WebSearchSource {
    pub fn new(aggregator: Arc<WebSearchAggregator>) -> Self {
        Self { aggregator }
    }
}

#[async_trait]
impl AssistSource for WebSearchSource {
    fn name(&self) -> &str {
        "websearch"
    }

    async fn available(&self) -> bool {
        true
    }

    async fn ask(&self, prompt: &str) -> Result<SourceAnswer, SourceError> {
        let outcome = self.aggregator.search(prompt).await.map_err(|err| match err {
            SearchError::Timeout => SourceError::Timeout(Duration::from_secs(15)),
            SearchError::AllSourcesFailed => {
                SourceError::NotAvailable("no search results found".to_string())
            }
            SearchError::Transport(msg) => SourceError::NotAvailable(msg),
            SearchError::Malformed(msg) => SourceError::Malformed(msg),
        })?;

        Ok(SourceAnswer {
            text: outcome.answer,
            confidence: Some(outcome.confidence),
        })
    }
}

// ── Research CLI ─────────────────────────────────────────────────────────────

/// Consults a locally-installed research CLI (`perplexity <query>`).
pub struct PerplexitySource {
    command: String,
    timeout: Duration,
}

impl PerplexitySource {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }
}

#[async_trait]
impl AssistSource for PerplexitySource {
    fn name(&self) -> &str {
        "perplexity"
    }

    async fn available(&self) -> bool {
        Command::new("which")
            .arg(&self.command)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }

    async fn ask(&self, prompt: &str) -> Result<SourceAnswer, SourceError> {
        let child = Command::new(&self.command)
            .arg(prompt)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| SourceError::NotAvailable(format!("{} not runnable: {err}", self.command)))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| SourceError::Timeout(self.timeout))?
            .map_err(|err| SourceError::NotAvailable(err.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(SourceError::Refused(stderr));
        }

        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if text.is_empty() {
            return Err(SourceError::Malformed("empty CLI output".to_string()));
        }
        Ok(SourceAnswer { text, confidence: None })
    }
}

// ── Hosted assistant ─────────────────────────────────────────────────────────

/// Posts to a companion assist endpoint (a bridge run by a more capable
/// assistant).  The optional API key is read from the environment at
/// construction and sent as a bearer token.
pub struct ClaudeSource {
    endpoint: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl ClaudeSource {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            timeout,
        }
    }
}

#[async_trait]
impl AssistSource for ClaudeSource {
    fn name(&self) -> &str {
        "claude"
    }

    async fn available(&self) -> bool {
        true
    }

    async fn ask(&self, prompt: &str) -> Result<SourceAnswer, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|err| SourceError::NotAvailable(err.to_string()))?;

        let mut request = client.post(&self.endpoint).json(&json!({ "prompt": prompt }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|err| {
            if err.is_timeout() {
                SourceError::Timeout(self.timeout)
            } else {
                SourceError::NotAvailable(format!("assist endpoint unreachable: {err}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Refused(format!("assist endpoint returned {status}")));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|err| SourceError::Malformed(err.to_string()))?;
        debug!(target: "assist", "assist endpoint replied");

        body.get("response")
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
            .map(|s| SourceAnswer {
                text: s.to_string(),
                confidence: None,
            })
            .ok_or_else(|| SourceError::Malformed("response field missing".to_string()))
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_cli_is_not_available() {
        let source = PerplexitySource::new("definitely-not-a-real-cli", Duration::from_secs(5));
        assert!(!source.available().await);
        let err = source.ask("question").await.unwrap_err();
        assert!(matches!(err, SourceError::NotAvailable(_)));
    }

    #[tokio::test]
    async fn cli_output_is_returned() {
        // `echo` stands in for a research CLI that prints its answer.
        let source = PerplexitySource::new("echo", Duration::from_secs(5));
        let answer = source.ask("the answer").await.unwrap();
        assert_eq!(answer.text, "the answer");
        assert!(answer.confidence.is_none());
    }

    #[tokio::test]
    async fn failing_cli_is_refused() {
        let source = PerplexitySource::new("false", Duration::from_secs(5));
        let err = source.ask("anything").await.unwrap_err();
        assert!(matches!(err, SourceError::Refused(_) | SourceError::Malformed(_)));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_not_available() {
        // Reserved port on loopback with nothing listening.
        let source = ClaudeSource::new("http://127.0.0.1:9/assist", None, Duration::from_millis(500));
        let err = source.ask("question").await.unwrap_err();
        assert!(matches!(err, SourceError::NotAvailable(_) | SourceError::Timeout(_)));
    }
}
