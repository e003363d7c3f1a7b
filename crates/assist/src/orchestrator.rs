//! The layered fallback cascade: strictly ordered, first acceptable answer
//! wins, every consultation recorded.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use meridian_store::DocumentStore;

use crate::{AssistSource, SourceError};

const FALLBACK_LOG: &str = "logs/fallback.jsonl";

#[derive(Debug, Clone, Serialize)]
pub struct Attempt {
    pub source: String,
    pub ok: bool,
    pub confidence: f64,
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What the cascade is being asked to rescue.
#[derive(Debug, Clone)]
pub struct CascadeRequest {
    pub prompt: String,
    /// The local model's uncertain answer, threaded into the hosted
    /// assistant's prompt for context.
    pub local_response: String,
    pub local_confidence: f64,
    /// Human-readable uncertainty reason, for the log and the prompt.
    pub reason: String,
    /// Sources the caller has switched off (e.g. the hosted assistant while
    /// the user has assist disabled).  They are skipped without an attempt.
    pub disabled_sources: Vec<String>,
}

#[derive(Debug)]
pub enum CascadeOutcome {
    Answered {
        source: String,
        text: String,
        confidence: f64,
        attempts: Vec<Attempt>,
    },
    /// Every source failed or was rejected; the caller shows the local
    /// answer under an explicit caution.
    Exhausted { attempts: Vec<Attempt> },
}

#[derive(Serialize)]
struct FallbackLogRecord<'a> {
    ts: String,
    query: &'a str,
    local_confidence: f64,
    source: &'a str,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

pub struct FallbackOrchestrator {
    sources: Vec<Arc<dyn AssistSource>>,
    store: Arc<DocumentStore>,
    per_source_timeout: Duration,
    websearch_min_confidence: f64,
}

impl FallbackOrchestrator {
    /// `sources` defines the cascade order.  Learned source weights are
    /// advisory only; if reordering by weight is ever wanted, this is the
    /// one place to apply it.
    pub fn new(
        sources: Vec<Arc<dyn AssistSource>>,
        store: Arc<DocumentStore>,
        per_source_timeout: Duration,
        websearch_min_confidence: f64,
    ) -> Self {
        Self {
            sources,
            store,
            per_source_timeout,
            websearch_min_confidence,
        }
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    /// Walk the cascade in order.  Sources run serially, each under the
    /// per-source deadline; the first `ok` answer that clears its acceptance
    /// bar wins and later sources are never contacted.
    pub async fn cascade(&self, request: &CascadeRequest) -> CascadeOutcome {
        let mut attempts = Vec::new();

        for source in &self.sources {
            let name = source.name().to_string();

            if request.disabled_sources.iter().any(|d| d == &name) {
                info!(source = %name, "fallback source disabled, skipping");
                continue;
            }

            if !source.available().await {
                warn!(source = %name, "fallback source unavailable, skipping");
                attempts.push(Attempt {
                    source: name.clone(),
                    ok: false,
                    confidence: 0.0,
                    latency_ms: 0,
                    error: Some("not available".to_string()),
                });
                self.log_attempt(request, &name, false, Some("not available"));
                continue;
            }

            let prompt = self.prompt_for(&name, request);
            let started = Instant::now();
            let result = tokio::time::timeout(self.per_source_timeout, source.ask(&prompt)).await;
            let latency_ms = started.elapsed().as_millis() as u64;

            let outcome = match result {
                Ok(inner) => inner,
                Err(_) => Err(SourceError::Timeout(self.per_source_timeout)),
            };

            match outcome {
                Ok(answer) => {
                    let confidence = answer.confidence.unwrap_or(1.0);
                    let acceptable = if name == "websearch" {
                        confidence >= self.websearch_min_confidence
                    } else {
                        true
                    };

                    attempts.push(Attempt {
                        source: name.clone(),
                        ok: acceptable,
                        confidence,
                        latency_ms,
                        error: (!acceptable)
                            .then(|| format!("confidence {confidence:.2} below threshold")),
                    });
                    self.log_attempt(request, &name, acceptable, None);

                    if acceptable {
                        info!(source = %name, confidence, "fallback source accepted");
                        return CascadeOutcome::Answered {
                            source: name,
                            text: answer.text,
                            confidence,
                            attempts,
                        };
                    }
                    warn!(source = %name, confidence, "fallback answer below threshold, advancing");
                }
                Err(err) => {
                    warn!(source = %name, %err, "fallback source failed, advancing");
                    let rendered = err.to_string();
                    self.log_attempt(request, &name, false, Some(&rendered));
                    attempts.push(Attempt {
                        source: name,
                        ok: false,
                        confidence: 0.0,
                        latency_ms,
                        error: Some(rendered),
                    });
                }
            }
        }

        CascadeOutcome::Exhausted { attempts }
    }

    /// Consult exactly one named source (the `search web:` / `ask claude:` /
    /// `ask perplexity:` force prefixes).
    pub async fn ask_single(&self, name: &str, prompt: &str) -> Result<String, SourceError> {
        let source = self
            .sources
            .iter()
            .find(|s| s.name() == name)
            .ok_or_else(|| SourceError::NotAvailable(format!("unknown source {name}")))?;

        let result = tokio::time::timeout(self.per_source_timeout, source.ask(prompt))
            .await
            .map_err(|_| SourceError::Timeout(self.per_source_timeout))??;
        Ok(result.text)
    }

    /// The hosted assistant gets the full situation; search-style sources
    /// get the raw query.
    fn prompt_for(&self, source: &str, request: &CascadeRequest) -> String {
        if source != "claude" {
            return request.prompt.clone();
        }
        format!(
            "You are assisting a local on-device AI that answered with low confidence \
             ({:.2}).\n\n\
             **Original User Request:**\n{}\n\n\
             **Local Response:**\n{}\n\n\
             **Uncertainty Detected:**\n{}\n\n\
             Please provide a complete, confident, and accurate response to the original \
             request. Be specific and actionable, include code examples if applicable, and \
             keep it concise but comprehensive.",
            request.local_confidence, request.prompt, request.local_response, request.reason
        )
    }

    fn log_attempt(&self, request: &CascadeRequest, source: &str, ok: bool, error: Option<&str>) {
        let record = FallbackLogRecord {
            ts: Utc::now().to_rfc3339(),
            query: &request.prompt,
            local_confidence: request.local_confidence,
            source,
            ok,
            error,
        };
        if let Err(err) = self.store.append_jsonl(FALLBACK_LOG, &record) {
            warn!(%err, "could not append fallback log");
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SourceAnswer;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubAssist {
        name: String,
        answer: Option<(String, Option<f64>)>,
        available: bool,
        calls: Arc<AtomicUsize>,
    }

    impl StubAssist {
        fn answering(name: &str, text: &str, confidence: Option<f64>, calls: Arc<AtomicUsize>) -> Self {
            Self {
                name: name.to_string(),
                answer: Some((text.to_string(), confidence)),
                available: true,
                calls,
            }
        }

        fn failing(name: &str, calls: Arc<AtomicUsize>) -> Self {
            Self {
                name: name.to_string(),
                answer: None,
                available: true,
                calls,
            }
        }
    }

    #[async_trait]
    impl AssistSource for StubAssist {
        fn name(&self) -> &str {
            &self.name
        }

        async fn available(&self) -> bool {
            self.available
        }

        async fn ask(&self, _prompt: &str) -> Result<SourceAnswer, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.answer {
                Some((text, confidence)) => Ok(SourceAnswer {
                    text: text.clone(),
                    confidence: *confidence,
                }),
                None => Err(SourceError::NotAvailable("down".to_string())),
            }
        }
    }

    fn request() -> CascadeRequest {
        CascadeRequest {
            prompt: "who won".to_string(),
            local_response: "I'm not sure".to_string(),
            local_confidence: 0.3,
            reason: "uncertain_language".to_string(),
            disabled_sources: Vec::new(),
        }
    }

    fn orchestrator(sources: Vec<Arc<dyn AssistSource>>) -> (tempfile::TempDir, FallbackOrchestrator) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DocumentStore::open(dir.path()).unwrap());
        (
            dir,
            FallbackOrchestrator::new(sources, store, Duration::from_secs(2), 0.5),
        )
    }

    #[tokio::test]
    async fn first_acceptable_source_wins_and_stops_cascade() {
        let calls_a = Arc::new(AtomicUsize::new(0));
        let calls_b = Arc::new(AtomicUsize::new(0));
        let (_dir, orchestrator) = orchestrator(vec![
            Arc::new(StubAssist::answering("websearch", "web answer", Some(0.8), Arc::clone(&calls_a))),
            Arc::new(StubAssist::answering("perplexity", "cli answer", None, Arc::clone(&calls_b))),
        ]);

        match orchestrator.cascade(&request()).await {
            CascadeOutcome::Answered { source, text, attempts, .. } => {
                assert_eq!(source, "websearch");
                assert_eq!(text, "web answer");
                assert_eq!(attempts.len(), 1);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(calls_b.load(Ordering::SeqCst), 0, "later source never contacted");
    }

    #[tokio::test]
    async fn low_confidence_websearch_advances_to_next_source() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (_dir, orchestrator) = orchestrator(vec![
            Arc::new(StubAssist::answering("websearch", "thin results", Some(0.2), Arc::clone(&calls))),
            Arc::new(StubAssist::answering("perplexity", "cli answer", None, Arc::clone(&calls))),
        ]);

        match orchestrator.cascade(&request()).await {
            CascadeOutcome::Answered { source, attempts, .. } => {
                assert_eq!(source, "perplexity");
                assert_eq!(attempts.len(), 2);
                assert!(!attempts[0].ok);
                assert!(attempts[0].error.as_ref().unwrap().contains("below threshold"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn exhausted_cascade_reports_every_attempt() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (_dir, orchestrator) = orchestrator(vec![
            Arc::new(StubAssist::failing("websearch", Arc::clone(&calls))),
            Arc::new(StubAssist::failing("perplexity", Arc::clone(&calls))),
            Arc::new(StubAssist::failing("claude", Arc::clone(&calls))),
        ]);

        match orchestrator.cascade(&request()).await {
            CascadeOutcome::Exhausted { attempts } => {
                assert_eq!(attempts.len(), 3);
                assert!(attempts.iter().all(|a| !a.ok));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn unavailable_source_is_skipped_without_a_call() {
        let calls_down = Arc::new(AtomicUsize::new(0));
        let calls_up = Arc::new(AtomicUsize::new(0));
        let mut down = StubAssist::answering("websearch", "never", Some(0.9), Arc::clone(&calls_down));
        down.available = false;
        let (_dir, orchestrator) = orchestrator(vec![
            Arc::new(down),
            Arc::new(StubAssist::answering("claude", "hosted answer", None, Arc::clone(&calls_up))),
        ]);

        match orchestrator.cascade(&request()).await {
            CascadeOutcome::Answered { source, .. } => assert_eq!(source, "claude"),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(calls_down.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn hosted_assistant_receives_enriched_prompt() {
        let (_dir, orchestrator) = orchestrator(vec![]);
        let prompt = orchestrator.prompt_for("claude", &request());
        assert!(prompt.contains("who won"));
        assert!(prompt.contains("I'm not sure"));
        assert!(prompt.contains("0.30"));

        let raw = orchestrator.prompt_for("websearch", &request());
        assert_eq!(raw, "who won");
    }

    #[tokio::test]
    async fn ask_single_routes_to_named_source() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (_dir, orchestrator) = orchestrator(vec![
            Arc::new(StubAssist::answering("websearch", "web", Some(0.9), Arc::clone(&calls))),
            Arc::new(StubAssist::answering("claude", "hosted", None, Arc::clone(&calls))),
        ]);

        assert_eq!(orchestrator.ask_single("claude", "q").await.unwrap(), "hosted");
        assert!(orchestrator.ask_single("telegraph", "q").await.is_err());
    }

    #[tokio::test]
    async fn disabled_source_is_skipped_entirely() {
        let calls_web = Arc::new(AtomicUsize::new(0));
        let calls_claude = Arc::new(AtomicUsize::new(0));
        let (_dir, orchestrator) = orchestrator(vec![
            Arc::new(StubAssist::failing("websearch", Arc::clone(&calls_web))),
            Arc::new(StubAssist::answering("claude", "hosted", None, Arc::clone(&calls_claude))),
        ]);

        let mut request = request();
        request.disabled_sources.push("claude".to_string());
        match orchestrator.cascade(&request).await {
            CascadeOutcome::Exhausted { attempts } => {
                // Only the web attempt is recorded; claude was never consulted.
                assert_eq!(attempts.len(), 1);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(calls_claude.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cascade_appends_fallback_log() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DocumentStore::open(dir.path()).unwrap());
        let orchestrator = FallbackOrchestrator::new(
            vec![Arc::new(StubAssist::answering("websearch", "a", Some(0.9), calls))],
            Arc::clone(&store),
            Duration::from_secs(2),
            0.5,
        );

        orchestrator.cascade(&request()).await;
        let records: Vec<serde_json::Value> = store.read_jsonl(FALLBACK_LOG);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["source"], "websearch");
        assert_eq!(records[0]["ok"], true);
    }
}
