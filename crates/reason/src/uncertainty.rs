//! Response-confidence scoring.
//!
//! Pure function over text: start at 1.0 and deduct for uncertainty phrases,
//! brevity, repetition, error markers, and incomplete code.  The caller
//! compares the score against its threshold (default 0.6) to decide whether
//! the fallback cascade runs.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};
use serde::Serialize;

pub const DEFAULT_THRESHOLD: f64 = 0.6;

const MIN_RESPONSE_LENGTH: usize = 20;
const MAX_REPETITION_RATIO: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Empty,
    TooShort,
    UncertainLanguage,
    Repetition,
    ErrorMarker,
    IncompleteCode,
}

#[derive(Debug, Clone, Serialize)]
pub struct UncertaintyReport {
    pub confidence: f64,
    pub triggers: BTreeSet<Trigger>,
    pub should_fallback: bool,
    /// How many uncertainty phrases matched (drives the sliding deduction).
    pub uncertain_matches: usize,
    pub repetition_ratio: f64,
}

static UNCERTAIN: LazyLock<Regex> = LazyLock::new(|| {
    let patterns = [
        r"\bi'?m not sure\b",
        r"\bi don'?t know\b",
        r"\bpossibly\b",
        r"\bmaybe\b",
        r"\bperhaps\b",
        r"\bmight be\b",
        r"\bcould be\b",
        r"\bi think\b",
        r"\bi believe\b",
        r"\bunsure\b",
        r"\buncertain\b",
        r"\bcan'?t help\b",
        r"\bdon'?t have enough information\b",
        r"\bnot confident\b",
        r"\bneed more context\b",
        r"\bclarify\b",
        r"\bnot clear\b",
        r"\bsorry.*unable\b",
        r"\bi apologize.*cannot\b",
        r"\bthis is beyond my\b",
        r"\btoo complex for me\b",
        r"\bstruggling to\b",
        r"\bdifficult to\b",
        r"\bcannot complete\b",
        r"\bunable to handle\b",
    ];
    RegexBuilder::new(&patterns.join("|"))
        .case_insensitive(true)
        .build()
        .expect("valid uncertainty regex")
});

/// Transport/tool failure markers plus runtime exception names.  Both sets
/// count — a response quoting a traceback is as untrustworthy as one
/// reporting a timeout.
static ERROR_MARKERS: LazyLock<Regex> = LazyLock::new(|| {
    let patterns = [
        r"⚠",
        r"✗",
        r"Error:",
        r"Failed:",
        r"\btimeout\b",
        r"\bnot found\b",
        r"\bcannot access\b",
        r"\bpermission denied\b",
        r"\berror\b",
        r"\bfailed\b",
        r"\bfailure\b",
        r"\bexception\b",
        r"\btraceback\b",
        r"\bstack trace\b",
        r"\bsyntax error\b",
        r"SyntaxError",
        r"NameError",
        r"TypeError",
        r"ValueError",
        r"execution failed",
        r"LLM timeout",
        r"LLM error",
    ];
    RegexBuilder::new(&patterns.join("|"))
        .case_insensitive(true)
        .build()
        .expect("valid error regex")
});

static CODE_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    RegexBuilder::new(r"```(?:[a-z]+)?\s*\n(.*?)```")
        .dot_matches_new_line(true)
        .build()
        .expect("valid code block regex")
});

static INCOMPLETE_CODE: LazyLock<Regex> = LazyLock::new(|| {
    RegexBuilder::new(r"\.\.\.+|#\s*TODO|#\s*FIXME|(?m)^\s*pass\s*$")
        .build()
        .expect("valid incomplete-code regex")
});

pub fn assess(response: &str) -> UncertaintyReport {
    assess_with_threshold(response, DEFAULT_THRESHOLD)
}

pub fn assess_with_threshold(response: &str, threshold: f64) -> UncertaintyReport {
    let clean = response.trim();
    let mut triggers = BTreeSet::new();

    if clean.is_empty() {
        triggers.insert(Trigger::Empty);
        return UncertaintyReport {
            confidence: 0.0,
            triggers,
            should_fallback: true,
            uncertain_matches: 0,
            repetition_ratio: 0.0,
        };
    }

    let uncertain_matches = UNCERTAIN.find_iter(clean).count();
    let repetition_ratio = repetition_ratio(clean);

    let mut confidence = 1.0_f64;

    if uncertain_matches > 0 {
        triggers.insert(Trigger::UncertainLanguage);
        let extra = (uncertain_matches - 1) as f64;
        confidence -= (0.4 + extra * 0.1).min(0.6);
    }

    if clean.chars().count() < MIN_RESPONSE_LENGTH {
        triggers.insert(Trigger::TooShort);
        confidence -= 0.4;
    }

    if repetition_ratio > MAX_REPETITION_RATIO {
        triggers.insert(Trigger::Repetition);
        confidence -= 0.3;
    }

    if ERROR_MARKERS.is_match(clean) {
        triggers.insert(Trigger::ErrorMarker);
        confidence -= 0.4;
    }

    if has_incomplete_code(clean) {
        triggers.insert(Trigger::IncompleteCode);
        confidence -= 0.3;
    }

    let confidence = confidence.clamp(0.0, 1.0);
    UncertaintyReport {
        confidence,
        triggers,
        should_fallback: confidence < threshold,
        uncertain_matches,
        repetition_ratio,
    }
}

/// 1 − unique/total over whitespace words; texts under five words never
/// count as repetitive.
fn repetition_ratio(text: &str) -> f64 {
    let words: Vec<String> = text.split_whitespace().map(|w| w.to_lowercase()).collect();
    if words.len() < 5 {
        return 0.0;
    }
    let unique: BTreeSet<&String> = words.iter().collect();
    1.0 - unique.len() as f64 / words.len() as f64
}

fn has_incomplete_code(text: &str) -> bool {
    CODE_BLOCK.captures_iter(text).any(|cap| {
        let code = cap[1].trim();
        code.is_empty() || INCOMPLETE_CODE.is_match(&cap[1])
    })
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_response_is_zero_confidence() {
        let report = assess("");
        assert_eq!(report.confidence, 0.0);
        assert!(report.should_fallback);
        assert!(report.triggers.contains(&Trigger::Empty));

        let report = assess("   \n  ");
        assert_eq!(report.confidence, 0.0);
    }

    #[test]
    fn confident_answer_passes() {
        let report = assess(
            "To compute a factorial use recursion: multiply n by the factorial of n minus one, \
             stopping at one.",
        );
        assert!(report.confidence >= 0.9, "got {}", report.confidence);
        assert!(!report.should_fallback);
    }

    #[test]
    fn uncertain_language_deducts() {
        let report = assess("I'm not sure about that, but maybe it could work out fine somehow.");
        assert!(report.triggers.contains(&Trigger::UncertainLanguage));
        assert!(report.uncertain_matches >= 2);
        assert!(report.should_fallback);
    }

    #[test]
    fn uncertain_deduction_caps_at_point_six() {
        // Seven distinct uncertain phrases; the deduction must cap, not floor
        // the score below the cap alone would allow.
        let report = assess(
            "I'm not sure. maybe. perhaps. might be. could be. I think so. I believe it is so here.",
        );
        assert!(report.confidence >= 0.4 - 1e-9);
    }

    #[test]
    fn short_answer_deducts() {
        let report = assess("Yes.");
        assert!(report.triggers.contains(&Trigger::TooShort));
        assert!((report.confidence - 0.6).abs() < 1e-9);
    }

    #[test]
    fn repetition_deducts() {
        let report = assess("the the the the the the the the answer answer answer answer");
        assert!(report.triggers.contains(&Trigger::Repetition));
    }

    #[test]
    fn error_markers_deduct() {
        let report = assess("⚠ LLM timeout - try a shorter prompt, the model did not respond");
        assert!(report.triggers.contains(&Trigger::ErrorMarker));
        assert!(report.confidence <= 0.6);
    }

    #[test]
    fn short_error_response_falls_back() {
        let report = assess("⚠ LLM timeout");
        assert!(report.triggers.contains(&Trigger::ErrorMarker));
        assert!(report.triggers.contains(&Trigger::TooShort));
        assert!(report.should_fallback);
    }

    #[test]
    fn exception_names_count_as_errors() {
        let report = assess("That raised a TypeError in the interpreter, so the call never finished running.");
        assert!(report.triggers.contains(&Trigger::ErrorMarker));
    }

    #[test]
    fn incomplete_code_deducts() {
        let report = assess("Here's the code:\n```python\n...\npass\n```\nHope that is a helpful start for you.");
        assert!(report.triggers.contains(&Trigger::IncompleteCode));
    }

    #[test]
    fn complete_code_does_not_deduct() {
        let report = assess(
            "Here's the code:\n```python\ndef add(a, b):\n    return a + b\n```\nThis adds two numbers together.",
        );
        assert!(!report.triggers.contains(&Trigger::IncompleteCode));
        assert!(!report.should_fallback);
    }

    #[test]
    fn empty_code_block_deducts() {
        let report = assess("Try this:\n```python\n\n```\nwhich should solve the whole problem nicely.");
        assert!(report.triggers.contains(&Trigger::IncompleteCode));
    }

    #[test]
    fn threshold_override_changes_gate() {
        let text = "This is a reasonably confident and complete answer to the question you asked.";
        assert!(!assess_with_threshold(text, 0.6).should_fallback);
        assert!(assess_with_threshold(text, 1.1).should_fallback);
    }
}
