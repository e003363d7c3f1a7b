//! Prompt analysis: classification, closed-form solving, reasoning traces,
//! uncertainty scoring, and tone inference.

pub mod classify;
pub mod solver;
pub mod tone;
pub mod tracer;
pub mod uncertainty;

use serde::{Deserialize, Serialize};

/// One step of the reasoning trace shown before an answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningStep {
    pub n: u32,
    pub description: String,
    /// Formula or working shown under the step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Concrete value produced by the step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

impl ReasoningStep {
    pub fn new(n: u32, description: impl Into<String>) -> Self {
        Self {
            n,
            description: description.into(),
            detail: None,
            result: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_result(mut self, result: impl Into<String>) -> Self {
        self.result = Some(result.into());
        self
    }
}

/// Render a trace for terminal display.
pub fn format_trace(steps: &[ReasoningStep]) -> String {
    let mut lines = vec!["[Thinking...]".to_string(), "─".repeat(60)];
    for step in steps {
        lines.push(format!("Step {}: {}", step.n, step.description));
        if let Some(detail) = &step.detail {
            lines.push(format!("  → {detail}"));
        }
        if let Some(result) = &step.result {
            lines.push(format!("  = {result}"));
        }
    }
    lines.push("─".repeat(60));
    lines.join("\n")
}
