//! Local model interface and the llama.cpp child-process adapter.
//!
//! The controller consumes the `LocalModel` trait only; the concrete binding
//! (which binary, which model file) lives at the composition root.  The
//! adapter enforces a hard wall-clock timeout — it kills the child and
//! returns an error rather than hang.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

/// Adapter-layer failure taxonomy shared by the model and the fallback
/// sources: the controller flattens these into user-visible messages.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("not available: {0}")]
    NotAvailable(String),
    #[error("refused: {0}")]
    Refused(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Enumerated generation parameter bag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub threads: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub context_size: u32,
    pub repeat_penalty: f32,
    pub stop_tokens: Vec<String>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 150,
            threads: 8,
            temperature: 0.3,
            top_p: 0.9,
            top_k: 40,
            context_size: 1024,
            repeat_penalty: 1.1,
            // Stop before the model drifts into fabricated Q&A pairs or
            // tool-command echoes.
            stop_tokens: ["Q1:", "Q2:", "LIST:", "READ:", "SEARCH:", "[File", "[Directory"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LocalResponse {
    pub text: String,
    pub latency_ms: u64,
}

#[async_trait]
pub trait LocalModel: Send + Sync {
    /// True when the binary and model file are present.
    fn available(&self) -> bool;

    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<LocalResponse, SourceError>;
}

/// llama.cpp CLI adapter.  stdout is the answer; stderr goes to logs.
pub struct LlamaCppModel {
    binary_path: PathBuf,
    model_path: PathBuf,
    timeout: Duration,
}

impl LlamaCppModel {
    pub fn new(
        binary_path: impl Into<PathBuf>,
        model_path: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            binary_path: binary_path.into(),
            model_path: model_path.into(),
            timeout,
        }
    }

    /// Well-known build output locations, newest CMake layout first.
    pub fn locate_binary(root: &str) -> Option<PathBuf> {
        [
            "build/bin/llama-cli",
            "build/bin/main",
            "llama-cli",
            "main",
        ]
        .iter()
        .map(|rel| PathBuf::from(root).join(rel))
        .find(|path| path.exists())
    }
}

#[async_trait]
impl LocalModel for LlamaCppModel {
    fn available(&self) -> bool {
        self.binary_path.exists() && self.model_path.exists()
    }

    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<LocalResponse, SourceError> {
        if !self.binary_path.exists() {
            return Err(SourceError::NotAvailable(format!(
                "model binary not found at {}",
                self.binary_path.display()
            )));
        }

        let mut command = Command::new(&self.binary_path);
        command
            .arg("-m")
            .arg(&self.model_path)
            .args(["-p", prompt])
            .args(["-n", &params.max_tokens.to_string()])
            .args(["-t", &params.threads.to_string()])
            .args(["--temp", &params.temperature.to_string()])
            .args(["--top-p", &params.top_p.to_string()])
            .args(["--top-k", &params.top_k.to_string()])
            .args(["-c", &params.context_size.to_string()])
            .args(["--repeat-penalty", &params.repeat_penalty.to_string()])
            .arg("--no-display-prompt")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for stop in &params.stop_tokens {
            command.args(["--stop", stop]);
        }

        let started = Instant::now();
        let child = command
            .spawn()
            .map_err(|err| SourceError::NotAvailable(format!("spawn failed: {err}")))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                // kill_on_drop reaps the child when the future is dropped here.
                warn!(timeout = ?self.timeout, "local model timed out");
                SourceError::Timeout(self.timeout)
            })?
            .map_err(|err| SourceError::NotAvailable(format!("wait failed: {err}")))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            debug!(target: "llm", "llama.cpp stderr: {}", stderr.trim());
        }

        if !output.status.success() {
            return Err(SourceError::Malformed(format!(
                "model exited with {}",
                output.status
            )));
        }

        let raw = String::from_utf8_lossy(&output.stdout);
        let text = clean_response(&raw, prompt);
        if text.is_empty() {
            return Err(SourceError::Malformed("empty model output".to_string()));
        }

        Ok(LocalResponse {
            text,
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }
}

/// Strip a leading restatement of the prompt and any `Assistant:` marker.
pub fn clean_response(raw: &str, prompt: &str) -> String {
    let mut text = raw.trim();

    if let Some(idx) = text.rfind("Assistant:") {
        text = text[idx + "Assistant:".len()..].trim_start();
    }

    let prompt = prompt.trim();
    if !prompt.is_empty() {
        if let Some(rest) = text.strip_prefix(prompt) {
            text = rest.trim_start();
        }
    }

    text.trim().to_string()
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_strips_assistant_marker() {
        let raw = "User asked a thing.\nAssistant: The answer is 4.";
        assert_eq!(clean_response(raw, "what is 2+2"), "The answer is 4.");
    }

    #[test]
    fn clean_strips_prompt_echo() {
        let raw = "what is 2+2 The answer is 4.";
        assert_eq!(clean_response(raw, "what is 2+2"), "The answer is 4.");
    }

    #[test]
    fn clean_passes_through_plain_output() {
        assert_eq!(clean_response("  Just an answer.  ", "prompt"), "Just an answer.");
    }

    #[test]
    fn default_params_carry_stop_tokens() {
        let params = GenerationParams::default();
        assert!(params.stop_tokens.iter().any(|s| s == "READ:"));
        assert_eq!(params.max_tokens, 150);
    }

    #[tokio::test]
    async fn missing_binary_is_not_available() {
        let model = LlamaCppModel::new(
            "/nonexistent/llama-cli",
            "/nonexistent/model.gguf",
            Duration::from_secs(1),
        );
        assert!(!model.available());
        let err = model
            .generate("hello", &GenerationParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::NotAvailable(_)));
    }

    #[tokio::test]
    async fn slow_binary_times_out() {
        use std::os::unix::fs::PermissionsExt;

        // A stub "model" that ignores its arguments and hangs.
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("stub-llm");
        std::fs::write(&script, "#!/bin/sh\nsleep 5\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let model = LlamaCppModel::new(&script, "/dev/null", Duration::from_millis(100));
        let err = model
            .generate("hello", &GenerationParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Timeout(_)));
    }

    #[tokio::test]
    async fn stub_binary_output_is_cleaned() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("stub-llm");
        std::fs::write(&script, "#!/bin/sh\necho 'Assistant: forty-two'\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let model = LlamaCppModel::new(&script, "/dev/null", Duration::from_secs(5));
        let response = model
            .generate("what is the answer", &GenerationParams::default())
            .await
            .unwrap();
        assert_eq!(response.text, "forty-two");
    }
}
