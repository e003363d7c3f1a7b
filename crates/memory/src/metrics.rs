//! Performance metrics: per-query timing and outcome counters, persisted to
//! `metrics.json` and surfaced by the `#performance` directive.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use meridian_store::DocumentStore;

const METRICS_FILE: &str = "metrics.json";

/// Rolling window of per-query latency samples.
const MAX_SAMPLES: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PerformanceMetrics {
    pub queries_total: u64,
    pub direct_commands: u64,
    pub llm_calls: u64,
    pub fallbacks_triggered: u64,
    pub fallbacks_succeeded: u64,
    pub errors: u64,
    pub feedback_correct: u64,
    pub feedback_incorrect: u64,
    #[serde(default)]
    pub latency_samples_ms: Vec<u64>,
    #[serde(default)]
    pub last_updated: String,
}

impl PerformanceMetrics {
    pub fn average_latency_ms(&self) -> f64 {
        if self.latency_samples_ms.is_empty() {
            return 0.0;
        }
        self.latency_samples_ms.iter().sum::<u64>() as f64 / self.latency_samples_ms.len() as f64
    }

    pub fn accuracy_pct(&self) -> f64 {
        let total = self.feedback_correct + self.feedback_incorrect;
        if total == 0 {
            return 0.0;
        }
        self.feedback_correct as f64 / total as f64 * 100.0
    }
}

pub struct MetricsTracker {
    store: Arc<DocumentStore>,
    metrics: PerformanceMetrics,
}

impl MetricsTracker {
    pub fn open(store: Arc<DocumentStore>) -> Self {
        let metrics = store.load_or_default(METRICS_FILE);
        Self { store, metrics }
    }

    pub fn metrics(&self) -> &PerformanceMetrics {
        &self.metrics
    }

    pub fn record_query(&mut self, latency_ms: u64, was_direct: bool, used_llm: bool) {
        self.metrics.queries_total += 1;
        if was_direct {
            self.metrics.direct_commands += 1;
        }
        if used_llm {
            self.metrics.llm_calls += 1;
        }
        self.metrics.latency_samples_ms.push(latency_ms);
        if self.metrics.latency_samples_ms.len() > MAX_SAMPLES {
            let excess = self.metrics.latency_samples_ms.len() - MAX_SAMPLES;
            self.metrics.latency_samples_ms.drain(..excess);
        }
        self.persist();
    }

    pub fn record_fallback(&mut self, succeeded: bool) {
        self.metrics.fallbacks_triggered += 1;
        if succeeded {
            self.metrics.fallbacks_succeeded += 1;
        }
        self.persist();
    }

    pub fn record_error(&mut self) {
        self.metrics.errors += 1;
        self.persist();
    }

    pub fn record_feedback(&mut self, is_correct: bool) {
        if is_correct {
            self.metrics.feedback_correct += 1;
        } else {
            self.metrics.feedback_incorrect += 1;
        }
        self.persist();
    }

    pub fn reset(&mut self) {
        self.metrics = PerformanceMetrics::default();
        self.persist();
    }

    fn persist(&mut self) {
        self.metrics.last_updated = Utc::now().to_rfc3339();
        if let Err(err) = self.store.save(METRICS_FILE, &self.metrics) {
            warn!(%err, "could not persist metrics");
        }
    }

    pub fn summary(&self) -> String {
        let m = &self.metrics;
        format!(
            "Performance\n\
             ─────────────────────────────────────────────\n\
             Queries:              {}\n\
             Direct commands:      {}\n\
             LLM calls:            {}\n\
             Fallbacks:            {} ({} succeeded)\n\
             Errors:               {}\n\
             Avg response time:    {:.0} ms\n\
             Feedback:             {} correct / {} incorrect ({:.1}% accuracy)",
            m.queries_total,
            m.direct_commands,
            m.llm_calls,
            m.fallbacks_triggered,
            m.fallbacks_succeeded,
            m.errors,
            m.average_latency_ms(),
            m.feedback_correct,
            m.feedback_incorrect,
            m.accuracy_pct(),
        )
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> (tempfile::TempDir, MetricsTracker) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DocumentStore::open(dir.path()).unwrap());
        (dir, MetricsTracker::open(store))
    }

    #[test]
    fn counters_accumulate() {
        let (_dir, mut tracker) = tracker();
        tracker.record_query(120, true, false);
        tracker.record_query(300, false, true);
        tracker.record_fallback(true);
        tracker.record_feedback(true);
        tracker.record_feedback(false);

        let m = tracker.metrics();
        assert_eq!(m.queries_total, 2);
        assert_eq!(m.direct_commands, 1);
        assert_eq!(m.llm_calls, 1);
        assert_eq!(m.fallbacks_succeeded, 1);
        assert_eq!(m.average_latency_ms(), 210.0);
        assert_eq!(m.accuracy_pct(), 50.0);
    }

    #[test]
    fn metrics_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DocumentStore::open(dir.path()).unwrap());
        {
            let mut tracker = MetricsTracker::open(Arc::clone(&store));
            tracker.record_query(50, false, true);
        }
        let reloaded = MetricsTracker::open(store);
        assert_eq!(reloaded.metrics().queries_total, 1);
    }

    #[test]
    fn reset_clears_everything() {
        let (_dir, mut tracker) = tracker();
        tracker.record_query(50, false, true);
        tracker.reset();
        assert_eq!(tracker.metrics().queries_total, 0);
        assert_eq!(tracker.metrics().average_latency_ms(), 0.0);
    }
}
