//! Concurrent multi-source web search with result synthesis and a TTL cache.

mod aggregator;
mod cache;
mod sources;

pub use aggregator::{SearchOutcome, SearchParams, WebSearchAggregator};
pub use cache::SearchCache;
pub use sources::{ArxivSearch, DuckDuckGoSearch, WikipediaSearch};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One result from one source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
    pub source: String,
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("source timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unparseable response: {0}")]
    Malformed(String),
    #[error("all search sources failed")]
    AllSourcesFailed,
}

/// A single queryable search backend.
#[async_trait]
pub trait SearchSource: Send + Sync {
    fn name(&self) -> &str;
    async fn search(&self, query: &str) -> Result<Vec<SearchHit>, SearchError>;
}
