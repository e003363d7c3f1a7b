//! Bounded concurrent fan-out over the search sources, result synthesis,
//! and the cache front.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, SearchCache};
use crate::{SearchError, SearchHit, SearchSource};

async fn run_source(
    source: Arc<dyn SearchSource>,
    query: String,
    per_source: Duration,
) -> (String, Result<Vec<SearchHit>, SearchError>) {
    let name = source.name().to_string();
    let result = match tokio::time::timeout(per_source, source.search(&query)).await {
        Ok(result) => result,
        Err(_) => Err(SearchError::Timeout),
    };
    (name, result)
}

#[derive(Debug, Clone)]
pub struct SearchParams {
    pub max_workers: usize,
    pub overall_timeout: Duration,
    pub per_source_timeout: Duration,
    pub use_cache: bool,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            max_workers: 3,
            overall_timeout: Duration::from_secs(15),
            per_source_timeout: Duration::from_secs(10),
            use_cache: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub answer: String,
    pub confidence: f64,
    pub sources: Vec<String>,
    pub from_cache: bool,
}

pub struct WebSearchAggregator {
    sources: Vec<Arc<dyn SearchSource>>,
    cache: SearchCache,
    params: SearchParams,
}

impl WebSearchAggregator {
    pub fn new(sources: Vec<Arc<dyn SearchSource>>, cache: SearchCache, params: SearchParams) -> Self {
        Self { sources, cache, params }
    }

    /// The standard three-source stack.
    pub fn with_default_sources(cache: SearchCache, params: SearchParams) -> Self {
        let timeout = params.per_source_timeout;
        Self::new(
            vec![
                Arc::new(crate::DuckDuckGoSearch::new(timeout)),
                Arc::new(crate::WikipediaSearch::new(timeout)),
                Arc::new(crate::ArxivSearch::new(timeout)),
            ],
            cache,
            params,
        )
    }

    /// Run the multi-source search.  A fresh cache entry short-circuits with
    /// zero outbound requests; otherwise sources are queried concurrently
    /// (bounded by `max_workers`) under per-source and overall deadlines.
    pub async fn search(&self, query: &str) -> Result<SearchOutcome, SearchError> {
        if self.params.use_cache {
            if let Some(entry) = self.cache.get(query) {
                debug!(query, "search cache hit");
                return Ok(SearchOutcome {
                    answer: entry.answer,
                    confidence: entry.confidence,
                    sources: entry.sources,
                    from_cache: true,
                });
            }
        }

        let per_source = self.params.per_source_timeout;
        let tasks: Vec<_> = self
            .sources
            .iter()
            .cloned()
            .map(|source| Box::pin(run_source(source, query.to_string(), per_source)))
            .collect();

        let deadline = tokio::time::Instant::now() + self.params.overall_timeout;
        let mut stream = futures::stream::iter(tasks).buffer_unordered(self.params.max_workers);

        let mut hits: Vec<SearchHit> = Vec::new();
        let mut ok_sources: Vec<String> = Vec::new();
        loop {
            match tokio::time::timeout_at(deadline, stream.next()).await {
                Ok(Some((name, Ok(results)))) => {
                    if !results.is_empty() {
                        ok_sources.push(name);
                        hits.extend(results);
                    }
                }
                Ok(Some((name, Err(err)))) => {
                    // One source failing is routine; the aggregate only fails
                    // when every source does.
                    warn!(source = %name, %err, "search source failed");
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(query, "overall search deadline hit, using partial results");
                    break; // dropping the stream cancels in-flight requests
                }
            }
        }

        if hits.is_empty() {
            return Err(SearchError::AllSourcesFailed);
        }

        let (answer, confidence) = synthesize(&hits, &ok_sources);
        info!(query, n_results = hits.len(), n_sources = ok_sources.len(), confidence, "search complete");

        if self.params.use_cache {
            self.cache.set(
                query,
                &CacheEntry {
                    answer: answer.clone(),
                    confidence,
                    sources: ok_sources.clone(),
                    inserted_at: Utc::now().to_rfc3339(),
                },
            );
        }

        Ok(SearchOutcome {
            answer,
            confidence,
            sources: ok_sources,
            from_cache: false,
        })
    }
}

/// Dedupe by URL, group by source, and render the synthesized answer.
/// Confidence grows with result count and source diversity.
fn synthesize(hits: &[SearchHit], sources: &[String]) -> (String, f64) {
    let mut seen_urls = HashSet::new();
    let deduped: Vec<&SearchHit> = hits
        .iter()
        .filter(|hit| hit.url.is_empty() || seen_urls.insert(hit.url.clone()))
        .collect();

    let confidence = (deduped.len() as f64 / 10.0).min(1.0) * (sources.len() as f64 / 3.0).min(1.0);

    let mut lines: Vec<String> = Vec::new();
    for source in sources {
        let group: Vec<&&SearchHit> = deduped.iter().filter(|h| &h.source == source).collect();
        if group.is_empty() {
            continue;
        }
        lines.push(format!("**{source}:**"));
        for (i, hit) in group.iter().take(3).enumerate() {
            lines.push(format!("{}. {}", i + 1, hit.title));
            if !hit.snippet.is_empty() {
                let snippet: String = hit.snippet.chars().take(150).collect();
                lines.push(format!("   {snippet}…"));
            }
            lines.push(format!("   {}", hit.url));
        }
    }
    lines.push(format!("\n**Sources consulted:** {}", sources.join(", ")));

    (lines.join("\n"), confidence)
}

// ── Tests ────────────────────────────────────────────────────────────────────
