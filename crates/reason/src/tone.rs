//! Response tone and verbosity inference.  Purely advisory: the detected
//! style shapes a template descriptor and a system-prompt modifier, never a
//! failure mode.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tone {
    Technical,
    Conversational,
    Advisory,
    Concise,
}

impl Tone {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tone::Technical => "technical",
            Tone::Conversational => "conversational",
            Tone::Advisory => "advisory",
            Tone::Concise => "concise",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "technical" => Some(Tone::Technical),
            "conversational" => Some(Tone::Conversational),
            "advisory" => Some(Tone::Advisory),
            "concise" => Some(Tone::Concise),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Short,
    Medium,
    Long,
}

impl Verbosity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verbosity::Short => "short",
            Verbosity::Medium => "medium",
            Verbosity::Long => "long",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "short" => Some(Verbosity::Short),
            "medium" => Some(Verbosity::Medium),
            "long" => Some(Verbosity::Long),
            _ => None,
        }
    }
}

/// Formatting descriptor derived from tone × verbosity.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseTemplate {
    pub style: &'static str,
    pub max_lines: Option<u32>,
    pub include_code: bool,
    pub include_examples: bool,
    pub format: &'static str,
}

const TECHNICAL_KEYWORDS: &[&str] = &[
    "explain", "implement", "code", "algorithm", "function", "debug", "error", "syntax",
    "compile", "binary", "variable", "class", "method", "optimization", "complexity",
    "performance", "architecture", "design pattern", "api", "protocol", "data structure",
];
const TECHNICAL_EXPLICIT: &[&str] = &["be technical", "give me technical", "formally", "precisely"];

const CONVERSATIONAL_KEYWORDS: &[&str] = &[
    "tell me", "what's", "how's", "story", "chat", "discuss", "opinion", "think", "casual",
    "simple", "layman", "eli5", "in simple terms", "easy to understand",
];
const CONVERSATIONAL_EXPLICIT: &[&str] =
    &["casually", "conversationally", "like explaining to a friend", "simply"];

const ADVISORY_KEYWORDS: &[&str] = &[
    "how do i", "how should i", "what should", "guide", "tutorial", "step by step",
    "walkthrough", "instructions", "teach", "learn", "best practice", "recommend",
    "suggest", "advice", "help me",
];
const ADVISORY_EXPLICIT: &[&str] = &["guide me", "teach me", "show me how", "step by step"];

const CONCISE_KEYWORDS: &[&str] = &[
    "briefly", "quick", "short", "summarize", "tldr", "in brief", "just tell me",
    "bottom line", "key points", "overview",
];
const CONCISE_EXPLICIT: &[&str] = &["be brief", "short answer", "concise", "quick answer", "tldr"];

const SHORT_CUES: &[&str] = &["briefly", "quick", "short", "tldr", "summary", "concise"];
const LONG_CUES: &[&str] =
    &["detailed", "comprehensive", "in depth", "thoroughly", "explain fully", "elaborate"];
const EXPANSION_CUES: &[&str] =
    &["explain further", "more detail", "tell me more", "elaborate", "expand"];

fn score(haystack: &str, keywords: &[&str]) -> usize {
    keywords.iter().filter(|kw| haystack.contains(*kw)).count()
}

/// Detect the tone for a query.  An explicit override (e.g. a persisted
/// `#tone` preference) always wins with full confidence.
pub fn detect_tone(query: &str, override_tone: Option<&str>) -> (Tone, f64) {
    if let Some(tone) = override_tone.and_then(Tone::parse) {
        return (tone, 1.0);
    }

    let lower = query.to_lowercase();

    for (tone, phrases) in [
        (Tone::Technical, TECHNICAL_EXPLICIT),
        (Tone::Conversational, CONVERSATIONAL_EXPLICIT),
        (Tone::Advisory, ADVISORY_EXPLICIT),
        (Tone::Concise, CONCISE_EXPLICIT),
    ] {
        if phrases.iter().any(|p| lower.contains(p)) {
            return (tone, 0.95);
        }
    }

    let scores = [
        (Tone::Technical, score(&lower, TECHNICAL_KEYWORDS)),
        (Tone::Conversational, score(&lower, CONVERSATIONAL_KEYWORDS)),
        (Tone::Advisory, score(&lower, ADVISORY_KEYWORDS)),
        (Tone::Concise, score(&lower, CONCISE_KEYWORDS)),
    ];
    let (best, hits) = scores
        .iter()
        .max_by_key(|(_, hits)| *hits)
        .copied()
        .expect("non-empty score table");

    if hits == 0 {
        return (Tone::Conversational, 0.5);
    }
    (best, (hits as f64 / 10.0).min(0.95))
}

pub fn detect_verbosity(query: &str, override_verbosity: Option<&str>) -> Verbosity {
    if let Some(level) = override_verbosity.and_then(Verbosity::parse) {
        return level;
    }

    let lower = query.to_lowercase();
    if SHORT_CUES.iter().any(|c| lower.contains(c)) {
        return Verbosity::Short;
    }
    if LONG_CUES.iter().any(|c| lower.contains(c)) || EXPANSION_CUES.iter().any(|c| lower.contains(c))
    {
        return Verbosity::Long;
    }
    Verbosity::Medium
}

pub fn template(tone: Tone, verbosity: Verbosity) -> ResponseTemplate {
    use Tone::*;
    use Verbosity::*;
    match (tone, verbosity) {
        (Technical, Short) => ResponseTemplate { style: "technical_concise", max_lines: Some(10), include_code: true, include_examples: false, format: "bullet_points" },
        (Technical, Medium) => ResponseTemplate { style: "technical_standard", max_lines: Some(30), include_code: true, include_examples: true, format: "structured" },
        (Technical, Long) => ResponseTemplate { style: "technical_comprehensive", max_lines: None, include_code: true, include_examples: true, format: "detailed_sections" },
        (Conversational, Short) => ResponseTemplate { style: "casual_brief", max_lines: Some(5), include_code: false, include_examples: false, format: "paragraph" },
        (Conversational, Medium) => ResponseTemplate { style: "casual_standard", max_lines: Some(15), include_code: false, include_examples: true, format: "paragraph" },
        (Conversational, Long) => ResponseTemplate { style: "casual_detailed", max_lines: None, include_code: false, include_examples: true, format: "story_like" },
        (Advisory, Short) => ResponseTemplate { style: "advisory_quick", max_lines: Some(8), include_code: true, include_examples: false, format: "numbered_steps" },
        (Advisory, Medium) => ResponseTemplate { style: "advisory_standard", max_lines: Some(25), include_code: true, include_examples: true, format: "step_by_step" },
        (Advisory, Long) => ResponseTemplate { style: "advisory_comprehensive", max_lines: None, include_code: true, include_examples: true, format: "tutorial" },
        (Concise, Short) => ResponseTemplate { style: "minimal", max_lines: Some(3), include_code: false, include_examples: false, format: "single_line" },
        (Concise, Medium) => ResponseTemplate { style: "brief", max_lines: Some(7), include_code: true, include_examples: false, format: "bullet_points" },
        (Concise, Long) => ResponseTemplate { style: "concise_detailed", max_lines: Some(15), include_code: true, include_examples: false, format: "compact_sections" },
    }
}

/// Addition to the LLM system prompt steering style and length.
pub fn prompt_modifier(tone: Tone, verbosity: Verbosity) -> &'static str {
    use Tone::*;
    use Verbosity::*;
    match (tone, verbosity) {
        (Technical, Short) => "Respond technically and concisely. Use precise terminology. Include code only if essential.",
        (Technical, Medium) => "Provide a technical explanation with examples and code where appropriate. Be clear and precise.",
        (Technical, Long) => "Give a comprehensive technical explanation with detailed examples, code, and edge cases. Be thorough.",
        (Conversational, Short) => "Answer casually and briefly, like explaining to a friend. Keep it simple.",
        (Conversational, Medium) => "Explain conversationally with examples. Be friendly and clear without excessive detail.",
        (Conversational, Long) => "Provide a detailed, friendly explanation as if having an in-depth conversation. Use analogies and examples.",
        (Advisory, Short) => "Give step-by-step guidance in numbered format. Be direct and actionable.",
        (Advisory, Medium) => "Provide clear step-by-step instructions with explanations. Include examples and tips.",
        (Advisory, Long) => "Give comprehensive tutorial-style guidance with detailed steps, examples, and best practices.",
        (Concise, Short) => "Answer in 1-2 sentences maximum. Be direct and to the point.",
        (Concise, Medium) => "Provide a brief, focused answer with key points only. No fluff.",
        (Concise, Long) => "Give a detailed but compact answer. Include important details without unnecessary elaboration.",
    }
}

/// Header line shown above a response, e.g. `[Tone: Technical | Length: Brief]`.
pub fn header(tone: Tone, verbosity: Verbosity) -> String {
    let verbosity_label = match verbosity {
        Verbosity::Short => "Brief",
        Verbosity::Medium => "Standard",
        Verbosity::Long => "Detailed",
    };
    let mut tone_label = tone.as_str().to_string();
    if let Some(first) = tone_label.get_mut(0..1) {
        first.make_ascii_uppercase();
    }
    format!("[Tone: {tone_label} | Length: {verbosity_label}]")
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn technical_query_detected() {
        let (tone, _) = detect_tone("Explain how the binary search algorithm works", None);
        assert_eq!(tone, Tone::Technical);
    }

    #[test]
    fn advisory_query_detected() {
        let (tone, _) = detect_tone("How do I set up a Python virtual environment?", None);
        assert_eq!(tone, Tone::Advisory);
    }

    #[test]
    fn explicit_phrase_wins_with_high_confidence() {
        let (tone, confidence) = detect_tone("be brief: what is quantum computing", None);
        assert_eq!(tone, Tone::Concise);
        assert_eq!(confidence, 0.95);
    }

    #[test]
    fn override_beats_detection() {
        let (tone, confidence) = detect_tone("explain the algorithm", Some("concise"));
        assert_eq!(tone, Tone::Concise);
        assert_eq!(confidence, 1.0);
    }

    #[test]
    fn unknown_override_falls_through_to_detection() {
        let (tone, _) = detect_tone("explain the algorithm", Some("sarcastic"));
        assert_eq!(tone, Tone::Technical);
    }

    #[test]
    fn default_tone_is_conversational() {
        let (tone, confidence) = detect_tone("hmm", None);
        assert_eq!(tone, Tone::Conversational);
        assert_eq!(confidence, 0.5);
    }

    #[test]
    fn verbosity_cues() {
        assert_eq!(detect_verbosity("briefly, what is rust", None), Verbosity::Short);
        assert_eq!(detect_verbosity("explain fully with all the caveats", None), Verbosity::Long);
        assert_eq!(detect_verbosity("tell me more", None), Verbosity::Long);
        assert_eq!(detect_verbosity("what is rust", None), Verbosity::Medium);
    }

    #[test]
    fn verbosity_override_wins() {
        assert_eq!(detect_verbosity("briefly, what is rust", Some("long")), Verbosity::Long);
    }

    #[test]
    fn template_bounds_match_style() {
        let t = template(Tone::Concise, Verbosity::Short);
        assert_eq!(t.max_lines, Some(3));
        assert!(!t.include_code);

        let t = template(Tone::Technical, Verbosity::Long);
        assert_eq!(t.max_lines, None);
        assert!(t.include_code);
    }

    #[test]
    fn header_renders_labels() {
        assert_eq!(header(Tone::Technical, Verbosity::Short), "[Tone: Technical | Length: Brief]");
    }
}
