//! External assistance: the layered fallback cascade and its sources.

mod orchestrator;
mod sources;

pub use orchestrator::{Attempt, CascadeOutcome, CascadeRequest, FallbackOrchestrator};
pub use sources::{ClaudeSource, PerplexitySource, WebSearchSource};

use async_trait::async_trait;

pub use meridian_llm::SourceError;

/// Answer from one assistance source.  Confidence is source-reported where
/// the source has a notion of it (web search); `None` means "trust the ok".
#[derive(Debug, Clone)]
pub struct SourceAnswer {
    pub text: String,
    pub confidence: Option<f64>,
}

/// A fallback source the cascade can consult.
#[async_trait]
pub trait AssistSource: Send + Sync {
    fn name(&self) -> &str;

    /// Cheap availability probe; an unavailable source is skipped with a
    /// recorded attempt rather than called.
    async fn available(&self) -> bool;

    async fn ask(&self, prompt: &str) -> Result<SourceAnswer, SourceError>;
}
