//! Keyword-counter query classification.
//!
//! Each vocabulary is disjoint and counted independently; ties break by a
//! fixed priority: metacognitive > follow_up > web_research ≥ code > math >
//! conceptual.  Classification is a pure function of the prompt text plus the
//! clock snapshot — nothing here mutates state.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use meridian_clock::ClockSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    Direct,
    Math,
    Code,
    WebResearch,
    Conceptual,
    FollowUp,
    Metacognitive,
}

impl QueryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryKind::Direct => "direct",
            QueryKind::Math => "math",
            QueryKind::Code => "code",
            QueryKind::WebResearch => "web_research",
            QueryKind::Conceptual => "conceptual",
            QueryKind::FollowUp => "follow_up",
            QueryKind::Metacognitive => "metacognitive",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub kind: QueryKind,
    pub confidence: f64,
    pub time_sensitive: bool,
    pub needs_live_data: bool,
}

const TEMPORAL_KEYWORDS: &[&str] = &[
    "latest", "newest", "recent", "recently", "current", "currently", "now", "today",
    "this year", "2025", "2024", "emerging", "just", "most recent", "up-to-date",
    "trending", "breaking", "modern", "contemporary", "present",
];

const WEB_RESEARCH_KEYWORDS: &[&str] = &[
    "latest", "2025", "2024", "published", "papers", "studies", "advancements",
    "research", "published in", "recent", "news", "current", "today", "this year",
    "breakthrough", "development",
];

const CODE_KEYWORDS: &[&str] = &[
    "write", "script", "code", "python", "recursive", "visualize", "implement",
    "function", "class", "algorithm", "program", "java", "javascript", "c++",
    "create a",
];

const FOLLOW_UP_KEYWORDS: &[&str] = &[
    "try again", "recalculate", "retry", "redo that", "do that again",
    "explain further", "give an example", "tell me more", "elaborate", "more details",
];

const MATH_KEYWORDS: &[&str] = &[
    "if", "how many", "how much", "calculate", "total", "rate", "per", "cost",
    "all but", "solve", "compute",
];

const META_KEYWORDS: &[&str] = &[
    "limitation", "how do you", "what can you", "explain yourself", "your capabilities",
];

const RETRY_PHRASES: &[&str] = &["try again", "recalculate", "retry", "redo that", "do that again"];

const EXPANSION_PHRASES: &[&str] =
    &["explain further", "give an example", "tell me more", "elaborate", "more details"];

static HAS_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d").expect("valid number regex"));
static MULTI_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+.*\d+").expect("valid multi-number regex"));

fn count_hits(haystack: &str, keywords: &[&str]) -> usize {
    keywords.iter().filter(|kw| haystack.contains(*kw)).count()
}

/// True for prompts that ask to re-run the previous question verbatim.
pub fn is_retry(prompt: &str) -> bool {
    let lower = prompt.to_lowercase();
    RETRY_PHRASES.iter().any(|p| lower.contains(p))
}

/// True for prompts that build on the previous answer (need prior context).
pub fn is_expansion(prompt: &str) -> bool {
    let lower = prompt.to_lowercase();
    EXPANSION_PHRASES.iter().any(|p| lower.contains(p))
}

pub fn classify(prompt: &str, clock: &ClockSnapshot) -> Classification {
    let lower = prompt.to_lowercase();

    let temporal_score = count_hits(&lower, TEMPORAL_KEYWORDS);
    let web_score = count_hits(&lower, WEB_RESEARCH_KEYWORDS);
    let code_score = count_hits(&lower, CODE_KEYWORDS);
    let follow_up_score = count_hits(&lower, FOLLOW_UP_KEYWORDS);
    let mut math_score = count_hits(&lower, MATH_KEYWORDS);

    // Numbers plus relational wording is a strong math signal even when the
    // math vocabulary itself is absent.
    if HAS_NUMBER.is_match(prompt)
        && ["more", "less", "than", "equal", "divide", "multiply"]
            .iter()
            .any(|w| lower.contains(w))
    {
        math_score += 2;
    }

    let time_sensitive = temporal_score > 0
        || ["who is", "what is", "president", "currently", "right now"]
            .iter()
            .any(|w| lower.contains(w));
    let needs_live_data = time_sensitive || web_score >= 2;

    let word_count = prompt.split_whitespace().count();
    let is_meta = lower.starts_with("#correct")
        || lower.starts_with("#incorrect")
        || count_hits(&lower, META_KEYWORDS) > 0;

    let (kind, confidence) = if is_meta {
        (QueryKind::Metacognitive, 0.9)
    } else if follow_up_score > 0 {
        (QueryKind::FollowUp, 0.9)
    } else if web_score >= 2 || temporal_score >= 2 {
        (QueryKind::WebResearch, 0.85)
    } else if (web_score == 1 || temporal_score == 1) && word_count > 10 {
        (QueryKind::WebResearch, 0.75)
    } else if code_score >= 2 {
        (QueryKind::Code, 0.85)
    } else if code_score == 1 && (lower.contains("write") || lower.contains("create")) {
        (QueryKind::Code, 0.80)
    } else if math_score >= 2 {
        (QueryKind::Math, 0.85)
    } else if MULTI_NUMBER.is_match(prompt) {
        (QueryKind::Math, 0.70)
    } else {
        (QueryKind::Conceptual, 0.60)
    };

    // Clock state does not change the kind, only downstream temporal policy;
    // it is threaded here so classification stays the single entry point.
    let _ = clock;

    Classification {
        kind,
        confidence,
        time_sensitive,
        needs_live_data,
    }
}

/// Temporal policy derived from a classification and the clock.
#[derive(Debug, Clone, Serialize)]
pub struct TemporalAnalysis {
    pub time_sensitive: bool,
    pub needs_live_data: bool,
    pub is_post_cutoff: bool,
    /// Time-sensitive *and* the clock is past the model's knowledge cutoff.
    pub temporal_uncertain: bool,
    /// Forces the fallback cascade regardless of local confidence.
    pub forces_fallback: bool,
}

pub fn temporal_analysis(classification: &Classification, clock: &ClockSnapshot) -> TemporalAnalysis {
    let is_post_cutoff = clock.is_post_cutoff();
    let temporal_uncertain = classification.time_sensitive && is_post_cutoff;
    TemporalAnalysis {
        time_sensitive: classification.time_sensitive,
        needs_live_data: classification.needs_live_data,
        is_post_cutoff,
        temporal_uncertain,
        forces_fallback: temporal_uncertain || classification.needs_live_data,
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_clock::TimeSync;
    use std::time::Duration;

    fn snapshot() -> ClockSnapshot {
        TimeSync::new("2023-12-31", Duration::from_secs(60), None).now()
    }

    #[test]
    fn president_query_is_time_sensitive() {
        let c = classify("Who is the president of the United States right now?", &snapshot());
        assert!(c.time_sensitive);
        assert!(c.needs_live_data);
    }

    #[test]
    fn rate_problem_classifies_as_math() {
        let c = classify(
            "If 5 machines make 5 widgets in 5 minutes, how many machines for 100 widgets in 100 minutes?",
            &snapshot(),
        );
        assert_eq!(c.kind, QueryKind::Math);
        assert!(c.confidence >= 0.85);
    }

    #[test]
    fn code_request_classifies_as_code() {
        let c = classify("Write a python function to sort a list", &snapshot());
        assert_eq!(c.kind, QueryKind::Code);
    }

    #[test]
    fn research_query_classifies_as_web_research() {
        let c = classify("What are the latest AI research papers published this year?", &snapshot());
        assert_eq!(c.kind, QueryKind::WebResearch);
    }

    #[test]
    fn follow_up_outranks_code_vocabulary() {
        // "give an example" plus code words — follow_up wins by priority.
        let c = classify("give an example of that function code", &snapshot());
        assert_eq!(c.kind, QueryKind::FollowUp);
        assert_eq!(c.confidence, 0.9);
    }

    #[test]
    fn meta_outranks_follow_up() {
        let c = classify("explain yourself and tell me more", &snapshot());
        assert_eq!(c.kind, QueryKind::Metacognitive);
    }

    #[test]
    fn plain_question_is_conceptual() {
        let c = classify("why is the sky blue", &snapshot());
        assert_eq!(c.kind, QueryKind::Conceptual);
        assert_eq!(c.confidence, 0.60);
    }

    #[test]
    fn retry_detection() {
        assert!(is_retry("try again"));
        assert!(is_retry("please recalculate"));
        assert!(!is_retry("what is a retrial"));
    }

    #[test]
    fn expansion_detection() {
        assert!(is_expansion("tell me more about that"));
        assert!(!is_expansion("what time is it"));
    }

    #[test]
    fn temporal_analysis_forces_fallback_post_cutoff() {
        let clock = snapshot();
        let c = classify("who is the president right now", &clock);
        let analysis = temporal_analysis(&c, &clock);
        assert!(analysis.temporal_uncertain);
        assert!(analysis.forces_fallback);
    }

    #[test]
    fn conceptual_query_does_not_force_fallback() {
        let clock = snapshot();
        let c = classify("why is the sky blue", &clock);
        let analysis = temporal_analysis(&c, &clock);
        assert!(!analysis.forces_fallback);
    }
}
