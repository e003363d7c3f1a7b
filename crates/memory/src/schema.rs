use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One reasoning step as stored with an interaction.  The live trace type in
/// the reasoning engine carries more detail; this is the persisted summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningStepRecord {
    pub n: u32,
    pub description: String,
}

/// One consultation of an answer source during a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub source: String,
    pub ok: bool,
    pub confidence: f64,
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// User verdict on an interaction.  At most one per interaction; a later
/// correction replaces it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub is_correct: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub ts: DateTime<Utc>,
}

/// A completed prompt/response exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    pub question_id: String,
    pub session_id: String,
    pub prompt: String,
    pub final_text: String,
    /// Which source produced the final answer (`local`, `local_calculated`,
    /// `websearch`, `perplexity`, `claude`).
    pub source: String,
    pub confidence: f64,
    /// Classification kind the prompt resolved to.
    pub kind: String,
    pub time_sensitive: bool,
    pub used_fallback: bool,
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
    #[serde(default)]
    pub reasoning: Vec<ReasoningStepRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<FeedbackRecord>,
    pub timestamp: DateTime<Utc>,
}

impl Interaction {
    /// True when any recorded attempt errored or the stored answer carries an
    /// error/uncertainty marker.
    pub fn has_error_marker(&self) -> bool {
        self.attempts.iter().any(|a| a.error.is_some()) || self.final_text.contains('⚠')
    }
}
