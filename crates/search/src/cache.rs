//! File-backed search cache keyed by a hash of the normalized query.
//! Eviction is lazy: stale entries are removed when read.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use meridian_store::DocumentStore;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CacheEntry {
    pub answer: String,
    pub confidence: f64,
    #[serde(default)]
    pub sources: Vec<String>,
    pub inserted_at: String,
}

pub struct SearchCache {
    store: Arc<DocumentStore>,
    ttl: Duration,
}

impl SearchCache {
    pub fn new(store: Arc<DocumentStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    fn rel_path(query: &str) -> String {
        let normalized = normalize(query);
        let digest = Sha256::digest(normalized.as_bytes());
        format!("cache/search/{:x}.json", digest)
    }

    /// Fresh cached entry for a query, or `None`.  A stale entry is deleted
    /// on the way out.
    pub fn get(&self, query: &str) -> Option<CacheEntry> {
        let rel = Self::rel_path(query);
        let modified = self.store.modified(&rel)?;
        let age = SystemTime::now().duration_since(modified).unwrap_or_default();

        if age > self.ttl {
            debug!(query, "evicting stale search cache entry");
            if let Err(err) = self.store.remove(&rel) {
                warn!(%err, "could not evict cache entry");
            }
            return None;
        }

        let entry: CacheEntry = self.store.load_or_default(&rel);
        (!entry.answer.is_empty()).then_some(entry)
    }

    pub fn set(&self, query: &str, entry: &CacheEntry) {
        if let Err(err) = self.store.save(Self::rel_path(query), entry) {
            warn!(%err, "could not write search cache entry");
        }
    }
}

/// Case-fold and collapse whitespace so trivially-different phrasings share
/// one fingerprint.
fn normalize(query: &str) -> String {
    query.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(ttl: Duration) -> (tempfile::TempDir, SearchCache) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DocumentStore::open(dir.path()).unwrap());
        (dir, SearchCache::new(store, ttl))
    }

    fn entry(answer: &str) -> CacheEntry {
        CacheEntry {
            answer: answer.to_string(),
            confidence: 0.8,
            sources: vec!["Wikipedia".to_string()],
            inserted_at: "2025-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn set_then_get_within_ttl() {
        let (_dir, cache) = cache(Duration::from_secs(60));
        cache.set("rust language", &entry("Rust is a systems language"));
        let hit = cache.get("rust language").unwrap();
        assert_eq!(hit.answer, "Rust is a systems language");
    }

    #[test]
    fn normalization_merges_equivalent_queries() {
        let (_dir, cache) = cache(Duration::from_secs(60));
        cache.set("Rust   Language", &entry("answer"));
        assert!(cache.get("rust language").is_some());
    }

    #[test]
    fn stale_entry_is_lazily_evicted() {
        let (_dir, cache) = cache(Duration::from_millis(0));
        cache.set("old query", &entry("old answer"));
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get("old query").is_none());
        // The file itself is gone after the failed read.
        assert!(cache.get("old query").is_none());
    }

    #[test]
    fn miss_on_unknown_query() {
        let (_dir, cache) = cache(Duration::from_secs(60));
        assert!(cache.get("never seen").is_none());
    }
}
