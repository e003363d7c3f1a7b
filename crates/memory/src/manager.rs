//! Session ring, long-term pool, preferences, relevance lookup, auto-prune,
//! and context rehydration.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use meridian_store::DocumentStore;

use crate::schema::Interaction;

const SESSION_FILE: &str = "memory/session.json";
const LONG_TERM_FILE: &str = "memory/long_term.json";
const PREFERENCES_FILE: &str = "memory/preferences.json";

/// How many items from the previous session are replayed into the ring at
/// startup.
const REHYDRATE_ITEMS: usize = 10;

/// Fraction of capacity retained after a prune pass.
const PRUNE_KEEP_FRACTION: f64 = 0.7;

#[derive(Debug, Clone)]
pub struct MemoryParams {
    pub session_size: usize,
    pub long_term_size: usize,
    pub max_age_days: i64,
    pub prune_threshold: f64,
    pub relevance_window: usize,
    pub relevance_floor: f64,
    pub relevance_top_k: usize,
}

impl Default for MemoryParams {
    fn default() -> Self {
        Self {
            session_size: 20,
            long_term_size: 1000,
            max_age_days: 90,
            prune_threshold: 0.8,
            relevance_window: 100,
            relevance_floor: 0.2,
            relevance_top_k: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: String,
    pub started_at: String,
    pub query_count: usize,
    #[serde(default)]
    pub last_topic: Option<String>,
    #[serde(default)]
    pub tone: Option<String>,
    #[serde(default)]
    pub verbosity: Option<String>,
}

impl Default for SessionMetadata {
    fn default() -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            started_at: Utc::now().to_rfc3339(),
            query_count: 0,
            last_topic: None,
            tone: None,
            verbosity: None,
        }
    }
}

/// Persisted shape of `memory/session.json`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct SessionDoc {
    #[serde(default)]
    items: Vec<Interaction>,
    #[serde(default)]
    metadata: Option<SessionMetadata>,
    #[serde(default)]
    saved_at: String,
}

#[derive(Debug, Clone)]
pub struct MemoryStats {
    pub session_count: usize,
    pub long_term_count: usize,
    pub long_term_capacity: usize,
    pub preference_count: usize,
    pub disk_bytes: u64,
}

pub struct MemoryManager {
    store: Arc<DocumentStore>,
    params: MemoryParams,
    session: VecDeque<Interaction>,
    long_term: Vec<Interaction>,
    preferences: HashMap<String, String>,
    metadata: SessionMetadata,
}

impl MemoryManager {
    /// Load persisted state and rehydrate context from the previous session:
    /// its last few interactions seed the ring and its topic/tone/verbosity
    /// metadata carries forward under a fresh session id.
    pub fn open(store: Arc<DocumentStore>, params: MemoryParams) -> Self {
        let previous: SessionDoc = store.load_or_default(SESSION_FILE);
        let long_term: Vec<Interaction> = store.load_or_default(LONG_TERM_FILE);
        let preferences: HashMap<String, String> = store.load_or_default(PREFERENCES_FILE);

        let mut session = VecDeque::with_capacity(params.session_size);
        let carried = previous.items.len().min(REHYDRATE_ITEMS);
        for item in previous.items.into_iter().rev().take(carried).rev() {
            session.push_back(item);
        }

        let mut metadata = SessionMetadata::default();
        if let Some(prev_meta) = previous.metadata {
            metadata.last_topic = prev_meta.last_topic;
            metadata.tone = prev_meta.tone;
            metadata.verbosity = prev_meta.verbosity;
        }

        if carried > 0 {
            info!(items = carried, "context rehydrated from previous session");
        }

        let mut manager = Self {
            store,
            params,
            session,
            long_term,
            preferences,
            metadata,
        };
        manager.maybe_prune();
        manager
    }

    pub fn metadata(&self) -> &SessionMetadata {
        &self.metadata
    }

    pub fn set_tone(&mut self, tone: Option<String>) {
        self.metadata.tone = tone;
        self.save_session();
    }

    pub fn set_verbosity(&mut self, verbosity: Option<String>) {
        self.metadata.verbosity = verbosity;
        self.save_session();
    }

    // ── Recording ────────────────────────────────────────────────────────────

    /// Append a completed interaction.  Promotion into the long-term pool
    /// happens here; both documents are persisted before returning so the
    /// next prompt never races an in-flight write.
    pub fn record(&mut self, interaction: Interaction) {
        self.metadata.query_count += 1;
        self.metadata.last_topic = extract_topic(&interaction.prompt);

        if self.session.len() >= self.params.session_size {
            self.session.pop_front();
        }

        if self.is_important(&interaction) {
            self.long_term.push(interaction.clone());
            self.maybe_prune();
        }

        self.session.push_back(interaction);
        self.save_session();
        self.save_long_term();
    }

    /// Promotion rule: an interaction is worth keeping past the session when
    /// the user reacted to it, it was confidently answered, it was a long
    /// prompt, external sources were consulted, or it was code/math work.
    fn is_important(&self, interaction: &Interaction) -> bool {
        interaction.feedback.is_some()
            || interaction.confidence >= 0.8
            || interaction.prompt.split_whitespace().count() > 15
            || interaction.used_fallback
            || matches!(interaction.kind.as_str(), "code" | "math")
    }

    /// Attach (or replace) feedback on the most recent interaction, in both
    /// the ring and the long-term pool.
    pub fn attach_feedback(&mut self, feedback: crate::schema::FeedbackRecord) -> Option<String> {
        let last = self.session.back_mut()?;
        let question_id = last.question_id.clone();
        last.feedback = Some(feedback.clone());

        if let Some(stored) = self
            .long_term
            .iter_mut()
            .rev()
            .find(|i| i.question_id == question_id)
        {
            stored.feedback = Some(feedback);
        } else {
            // Feedback always promotes: clone the now-annotated interaction in.
            let annotated = self.session.back().expect("just accessed").clone();
            self.long_term.push(annotated);
        }

        self.save_session();
        self.save_long_term();
        Some(question_id)
    }

    pub fn last_interaction(&self) -> Option<&Interaction> {
        self.session.back()
    }

    pub fn session_items(&self) -> impl Iterator<Item = &Interaction> {
        self.session.iter()
    }

    // ── Relevance lookup ─────────────────────────────────────────────────────

    /// Lexical-overlap lookup against the most recent slice of the long-term
    /// pool.  Deliberately cheap and deterministic; a better retriever can
    /// replace this behind the same signature.
    pub fn relevant_context(&self, query: &str) -> Vec<&Interaction> {
        let query_tokens = tokenize(query);
        if query_tokens.is_empty() {
            return Vec::new();
        }
        let denominator = query_tokens.len().max(1) as f64;

        let window_start = self.long_term.len().saturating_sub(self.params.relevance_window);
        let mut scored: Vec<(f64, &Interaction)> = self.long_term[window_start..]
            .iter()
            .filter_map(|item| {
                let overlap = tokenize(&item.prompt).intersection(&query_tokens).count() as f64;
                let score = overlap / denominator;
                (score >= self.params.relevance_floor).then_some((score, item))
            })
            .collect();

        scored.sort_by(|(a, _), (b, _)| b.total_cmp(a));
        scored
            .into_iter()
            .take(self.params.relevance_top_k)
            .map(|(_, item)| item)
            .collect()
    }

    /// Recent-exchange context string for LLM prompt construction.
    pub fn context_string(&self, max_pairs: usize) -> String {
        let mut lines = Vec::new();
        let start = self.session.len().saturating_sub(max_pairs);
        for item in self.session.iter().skip(start) {
            lines.push(format!("User: {}", item.prompt));
            let response = if item.final_text.len() > 200 {
                let cut = item
                    .final_text
                    .char_indices()
                    .take_while(|(i, _)| *i < 200)
                    .last()
                    .map(|(i, c)| i + c.len_utf8())
                    .unwrap_or(0);
                format!("{}…", &item.final_text[..cut])
            } else {
                item.final_text.clone()
            };
            lines.push(format!("Assistant: {response}"));
        }
        lines.join("\n")
    }

    // ── Pruning ──────────────────────────────────────────────────────────────

    fn maybe_prune(&mut self) {
        let threshold =
            (self.params.long_term_size as f64 * self.params.prune_threshold) as usize;
        if self.long_term.len() >= threshold.max(1) {
            self.prune();
        }
    }

    /// Score-and-keep prune: retention favors newer, longer, feedback-bearing
    /// and fallback-using interactions; stored error markers penalize.
    /// Deterministic for a given pool, and idempotent — pruning an
    /// already-pruned pool changes nothing.
    pub fn prune(&mut self) -> usize {
        let target = (self.params.long_term_size as f64 * PRUNE_KEEP_FRACTION) as usize;
        if self.long_term.len() <= target {
            return 0;
        }

        let now = Utc::now();
        let max_age = self.params.max_age_days;

        let mut scored: Vec<(f64, Interaction)> = std::mem::take(&mut self.long_term)
            .into_iter()
            .map(|item| {
                let mut score = 0.0;

                let age_days = (now - item.timestamp).num_days();
                if age_days < max_age {
                    score += (max_age - age_days) as f64 / max_age as f64 * 10.0;
                }

                let response_len = item.final_text.len();
                if response_len > 100 {
                    score += (response_len as f64 / 100.0).min(5.0);
                }

                if item.feedback.is_some() {
                    score += 5.0;
                }
                if item.used_fallback {
                    score += 3.0;
                }
                if item.has_error_marker() {
                    score -= 2.0;
                }

                (score, item)
            })
            .collect();

        // Tie-break on timestamp so the ordering is fully deterministic.
        scored.sort_by(|(sa, ia), (sb, ib)| {
            sb.total_cmp(sa).then_with(|| ib.timestamp.cmp(&ia.timestamp))
        });

        let before = scored.len();
        self.long_term = scored.into_iter().take(target).map(|(_, item)| item).collect();
        // Restore chronological order for the window-based relevance scan.
        self.long_term.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

        let removed = before - self.long_term.len();
        info!(removed, kept = self.long_term.len(), "pruned long-term memory");
        self.save_long_term();
        removed
    }

    // ── Preferences ──────────────────────────────────────────────────────────

    pub fn set_preference(&mut self, key: &str, value: &str) {
        self.preferences.insert(key.to_string(), value.to_string());
        if let Err(err) = self.store.save(PREFERENCES_FILE, &self.preferences) {
            warn!(%err, "could not persist preferences");
        }
    }

    pub fn preference(&self, key: &str) -> Option<&str> {
        self.preferences.get(key).map(String::as_str)
    }

    pub fn preferences(&self) -> &HashMap<String, String> {
        &self.preferences
    }

    // ── Persistence & reporting ──────────────────────────────────────────────

    pub fn save_session(&self) {
        let doc = SessionDoc {
            items: self.session.iter().cloned().collect(),
            metadata: Some(self.metadata.clone()),
            saved_at: Utc::now().to_rfc3339(),
        };
        if let Err(err) = self.store.save(SESSION_FILE, &doc) {
            warn!(%err, "could not persist session memory");
        }
    }

    fn save_long_term(&self) {
        if let Err(err) = self.store.save(LONG_TERM_FILE, &self.long_term) {
            warn!(%err, "could not persist long-term memory");
        }
    }

    pub fn reset_session(&mut self) {
        self.session.clear();
        self.metadata = SessionMetadata::default();
        self.save_session();
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            session_count: self.session.len(),
            long_term_count: self.long_term.len(),
            long_term_capacity: self.params.long_term_size,
            preference_count: self.preferences.len(),
            disk_bytes: self.store.dir_size_bytes("memory"),
        }
    }

    pub fn summary(&self) -> String {
        let stats = self.stats();
        let prune_at =
            (self.params.long_term_size as f64 * self.params.prune_threshold) as usize;
        format!(
            "Memory & Learning\n\
             ─────────────────────────────────────────────\n\
             Session items:        {}/{}\n\
             Long-term stored:     {}/{}\n\
             Preferences:          {}\n\
             Storage size:         {:.2} KB\n\
             Queries this session: {}\n\
             Last topic:           {}\n\
             Next prune at:        {} conversations\n\
             Commands: #memory | #prune_memory | #export_memory",
            stats.session_count,
            self.params.session_size,
            stats.long_term_count,
            stats.long_term_capacity,
            stats.preference_count,
            stats.disk_bytes as f64 / 1024.0,
            self.metadata.query_count,
            self.metadata.last_topic.as_deref().unwrap_or("n/a"),
            prune_at,
        )
    }

    /// Write a timestamped full backup and return its path.
    pub fn export(&self) -> anyhow::Result<String> {
        #[derive(Serialize)]
        struct Backup<'a> {
            export_timestamp: String,
            session: Vec<&'a Interaction>,
            long_term: &'a [Interaction],
            preferences: &'a HashMap<String, String>,
        }

        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let rel = format!("memory/exports/backup_{stamp}.json");
        let backup = Backup {
            export_timestamp: Utc::now().to_rfc3339(),
            session: self.session.iter().collect(),
            long_term: &self.long_term,
            preferences: &self.preferences,
        };
        self.store.save(&rel, &backup)?;
        Ok(self.store.path(&rel).display().to_string())
    }
}

fn tokenize(text: &str) -> BTreeSet<String> {
    text.split(|ch: char| !ch.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// First three significant words of a prompt, used for topic carry-over.
fn extract_topic(prompt: &str) -> Option<String> {
    const SKIP: &[&str] = &["what", "when", "where", "which", "how", "does", "can"];
    let words: Vec<&str> = prompt
        .split_whitespace()
        .filter(|w| w.len() > 3 && !SKIP.contains(&w.to_lowercase().as_str()))
        .take(3)
        .collect();
    (!words.is_empty()).then(|| words.join(" ").to_lowercase())
}

// ── Tests ────────────────────────────────────────────────────────────────────
