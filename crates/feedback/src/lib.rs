//! Feedback-driven adaptive source weighting.
//!
//! The ledger owns per-source weights: a learned base confidence nudged by
//! each feedback event, plus fixed per-tag bonuses.  `best_source_for` is
//! advisory — the fallback cascade order is fixed; if learned reordering is
//! ever adopted it belongs in the orchestrator's cascade, nowhere else.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use meridian_store::DocumentStore;

const WEIGHTS_FILE: &str = "memory/source_weights.json";
const FEEDBACK_FILE: &str = "memory/feedback.json";
const LEARNING_FILE: &str = "memory/learning_events.json";

const LEARNING_RATE: f64 = 0.05;
const TARGET_CORRECT: f64 = 0.9;
const TARGET_INCORRECT: f64 = 0.5;
const MIN_BASE: f64 = 0.4;
const MAX_BASE: f64 = 0.95;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceWeight {
    pub base_confidence: f64,
    pub success: u64,
    pub total: u64,
    /// Fixed per-tag bonuses (e.g. `time_sensitive` for the web source).
    #[serde(default)]
    pub bonuses: BTreeMap<String, f64>,
}

impl SourceWeight {
    fn new(base_confidence: f64, bonuses: &[(&str, f64)]) -> Self {
        Self {
            base_confidence,
            success: 0,
            total: 0,
            bonuses: bonuses.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.success as f64 / self.total as f64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackEvent {
    pub ts: String,
    pub query: String,
    pub response_preview: String,
    pub is_correct: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub source: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningEvent {
    pub ts: String,
    pub query: String,
    pub is_correct: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub source: String,
    /// `error_correction` or `positive_refinement`.
    pub event_type: String,
    pub priority: String,
}

#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    pub correct: u64,
    pub incorrect: u64,
    pub refinements: u64,
    pub learning_events: u64,
}

pub struct FeedbackLedger {
    store: Arc<DocumentStore>,
    weights: HashMap<String, SourceWeight>,
    feedback_history: Vec<FeedbackEvent>,
    learning_events: Vec<LearningEvent>,
    session: SessionStats,
}

fn default_weights() -> HashMap<String, SourceWeight> {
    HashMap::from([
        ("websearch".to_string(), SourceWeight::new(0.70, &[("time_sensitive", 0.15)])),
        ("perplexity".to_string(), SourceWeight::new(0.75, &[("synthesis", 0.10)])),
        ("claude".to_string(), SourceWeight::new(0.85, &[("coding", 0.20)])),
        ("local".to_string(), SourceWeight::new(0.60, &[("math", 0.30)])),
    ])
}

impl FeedbackLedger {
    pub fn open(store: Arc<DocumentStore>) -> Self {
        let mut weights: HashMap<String, SourceWeight> = store.load_or_default(WEIGHTS_FILE);
        if weights.is_empty() {
            weights = default_weights();
        }
        let feedback_history = store.load_or_default(FEEDBACK_FILE);
        let learning_events = store.load_or_default(LEARNING_FILE);
        Self {
            store,
            weights,
            feedback_history,
            learning_events,
            session: SessionStats::default(),
        }
    }

    pub fn weight(&self, source: &str) -> Option<&SourceWeight> {
        self.weights.get(source)
    }

    pub fn session_stats(&self) -> &SessionStats {
        &self.session
    }

    /// Record one feedback event: bump the counters, nudge the source's base
    /// confidence toward the outcome target, and append a learning event when
    /// there is something to learn from (a correction, or a refinement note).
    pub fn add_feedback(
        &mut self,
        source: &str,
        query: &str,
        response: &str,
        is_correct: bool,
        note: Option<&str>,
        confidence: f64,
    ) {
        let preview: String = response.chars().take(200).collect();
        let event = FeedbackEvent {
            ts: Utc::now().to_rfc3339(),
            query: query.to_string(),
            response_preview: preview,
            is_correct,
            note: note.map(str::to_string),
            source: source.to_string(),
            confidence,
        };

        match (is_correct, note.is_some()) {
            (true, true) => self.session.refinements += 1,
            (true, false) => self.session.correct += 1,
            (false, _) => self.session.incorrect += 1,
        }

        self.feedback_history.push(event);
        self.update_weight(source, is_correct);

        if !is_correct || note.is_some() {
            self.learning_events.push(LearningEvent {
                ts: Utc::now().to_rfc3339(),
                query: query.chars().take(200).collect(),
                is_correct,
                note: note.map(str::to_string),
                source: source.to_string(),
                event_type: if is_correct {
                    "positive_refinement".to_string()
                } else {
                    "error_correction".to_string()
                },
                priority: if is_correct { "medium".to_string() } else { "high".to_string() },
            });
            self.session.learning_events += 1;
        }

        self.persist();
    }

    fn update_weight(&mut self, source: &str, is_correct: bool) {
        let Some(weight) = self.weights.get_mut(source) else {
            warn!(source, "feedback for unknown source, ignoring weight update");
            return;
        };

        weight.total += 1;
        if is_correct {
            weight.success += 1;
        }

        let target = if is_correct { TARGET_CORRECT } else { TARGET_INCORRECT };
        let adjusted = weight.base_confidence + LEARNING_RATE * (target - weight.base_confidence);
        weight.base_confidence = adjusted.clamp(MIN_BASE, MAX_BASE);

        info!(
            source,
            base_confidence = weight.base_confidence,
            success = weight.success,
            total = weight.total,
            "source weight updated"
        );
    }

    /// Learned confidence for a source given the query's tags.
    pub fn score(&self, source: &str, tags: &[&str]) -> f64 {
        let Some(weight) = self.weights.get(source) else {
            return 0.5;
        };
        let bonus: f64 = tags
            .iter()
            .filter_map(|tag| weight.bonuses.get(*tag))
            .sum();
        (weight.base_confidence + bonus).min(0.99)
    }

    /// Advisory pick of the most trustworthy source for a query shape.
    /// Domain multipliers push the web source toward live questions, the
    /// hosted assistant toward coding, and the local model toward math.
    pub fn best_source_for(&self, tags: &[&str]) -> (String, f64) {
        let mut best = ("local".to_string(), 0.0_f64);
        // Deterministic iteration order for stable ties.
        let mut names: Vec<&String> = self.weights.keys().collect();
        names.sort();

        for name in names {
            let mut score = self.score(name, tags);
            if tags.contains(&"time_sensitive") && name == "websearch" {
                score *= 1.3;
            }
            if tags.contains(&"coding") && name == "claude" {
                score *= 1.4;
            }
            if tags.contains(&"math") && name == "local" {
                score *= 1.2;
            }
            if score > best.1 {
                best = (name.clone(), score);
            }
        }
        best
    }

    fn persist(&self) {
        for (rel, err) in [
            (WEIGHTS_FILE, self.store.save(WEIGHTS_FILE, &self.weights).err()),
            (FEEDBACK_FILE, self.store.save(FEEDBACK_FILE, &self.feedback_history).err()),
            (LEARNING_FILE, self.store.save(LEARNING_FILE, &self.learning_events).err()),
        ] {
            if let Some(err) = err {
                warn!(file = rel, %err, "could not persist feedback state");
            }
        }
    }

    pub fn summary(&self) -> String {
        let total = self.session.correct + self.session.incorrect;
        let success_rate = if total == 0 {
            0.0
        } else {
            self.session.correct as f64 / total as f64 * 100.0
        };

        let mut lines = vec![
            "Feedback & Learning".to_string(),
            "─────────────────────────────────────────────".to_string(),
            format!("Session feedback:  {total} ({} correct, {} incorrect, {} refinements)",
                self.session.correct, self.session.incorrect, self.session.refinements),
            format!("Success rate:      {success_rate:.1}%"),
            format!("Learning events:   {} this session, {} stored",
                self.session.learning_events, self.learning_events.len()),
            String::new(),
            "Source confidence (adaptive)".to_string(),
        ];

        let mut names: Vec<&String> = self.weights.keys().collect();
        names.sort();
        for name in names {
            let w = &self.weights[name];
            if w.total > 0 {
                lines.push(format!(
                    "  {:12} {:.2} ({}/{} = {:.0}%)",
                    name,
                    w.base_confidence,
                    w.success,
                    w.total,
                    w.success_rate() * 100.0
                ));
            } else {
                lines.push(format!("  {:12} {:.2} (no feedback yet)", name, w.base_confidence));
            }
        }
        lines.join("\n")
    }

    /// Export learning events for a future fine-tuning pipeline.
    pub fn export_learning_data(&self) -> anyhow::Result<String> {
        #[derive(Serialize)]
        struct Export<'a> {
            export_timestamp: String,
            total_events: usize,
            source_weights: &'a HashMap<String, SourceWeight>,
            learning_events: &'a [LearningEvent],
        }

        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let rel = format!("memory/learning_export_{stamp}.json");
        let export = Export {
            export_timestamp: Utc::now().to_rfc3339(),
            total_events: self.learning_events.len(),
            source_weights: &self.weights,
            learning_events: &self.learning_events,
        };
        self.store.save(&rel, &export)?;
        Ok(self.store.path(&rel).display().to_string())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
