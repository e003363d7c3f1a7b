//! Closed-form solvers for a fixed catalog of word-problem shapes.
//!
//! Detection runs as an ordered table of `(detect, solve)` pairs over the raw
//! prompt.  Every solver emits steps carrying the literal numbers it worked
//! with and a `verified` flag computed by substituting the result back into
//! the constraints it extracted (tolerance 1e-2).  A failed or implausible
//! substitution yields `verified = false`, which keeps a heuristic
//! mis-detection from short-circuiting the pipeline.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::ReasoningStep;

const TOLERANCE: f64 = 1e-2;

#[derive(Debug, Clone, Serialize)]
pub enum SolverAnswer {
    /// A single numeric quantity (rate problems, literal counts).
    Quantity(f64),
    /// A smaller/larger value pair (difference problems).
    Pair { smaller: f64, larger: f64 },
    /// Final value plus the total percentage change from the start.
    Percentage { final_value: f64, total_change_pct: f64 },
    /// A procedural plan with an identification key.
    Procedure {
        plan: Vec<String>,
        identification: Vec<(String, String)>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct SolverResult {
    pub answer: SolverAnswer,
    pub verified: bool,
    pub steps: Vec<ReasoningStep>,
}

impl SolverResult {
    /// User-facing rendering of the answer.
    pub fn display_text(&self) -> String {
        match &self.answer {
            SolverAnswer::Quantity(value) => format_quantity(*value),
            SolverAnswer::Pair { smaller, .. } => format!("${smaller:.2}"),
            SolverAnswer::Percentage { final_value, total_change_pct } => format!(
                "Final value: ${} (total change {:+.2}%)",
                format_money(*final_value),
                total_change_pct
            ),
            SolverAnswer::Procedure { plan, identification } => {
                let mut lines: Vec<String> = plan.clone();
                lines.push(String::new());
                lines.push("Identification:".to_string());
                for (key, value) in identification {
                    lines.push(format!("  {key}: {value}"));
                }
                lines.join("\n")
            }
        }
    }
}

fn format_quantity(value: f64) -> String {
    if (value - value.round()).abs() < 1e-9 {
        format!("{}", value.round() as i64)
    } else {
        format!("{value}")
    }
}

/// Thousands-separated money rendering with two decimals.
fn format_money(value: f64) -> String {
    let rendered = format!("{value:.2}");
    let (int_part, frac_part) = rendered.split_once('.').expect("two-decimal format");
    let negative = int_part.starts_with('-');
    let digits: Vec<char> = int_part.trim_start_matches('-').chars().collect();

    let mut grouped = String::new();
    for (i, ch) in digits.iter().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(*ch);
    }
    format!("{}{grouped}.{frac_part}", if negative { "-" } else { "" })
}

// ── Detection ────────────────────────────────────────────────────────────────

static RATE_ROLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+\s+(machines?|cats?|workers?|people)").expect("rate regex"));
static INTEGERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d+(?:,\d+)*\b").expect("integer regex"));
static DECIMALS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$?(\d+(?:,\d+)*(?:\.\d+)?)").expect("decimal regex"));
static PCT_CHANGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(increase[sd]?|decrease[sd]?)\s+by\s+(\d+(?:\.\d+)?)\s*%").expect("pct regex")
});
static ALL_BUT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"all but (\d+)").expect("all-but regex"));
static ALL_BUT_TOTAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:had|has)\s+(\d+)").expect("all-but total regex"));
static ALL_BUT_COUNT_NOUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s+(?:sheep|items?|things?|objects?)").expect("count regex"));

fn integers_in(text: &str) -> Vec<f64> {
    INTEGERS
        .find_iter(text)
        .filter_map(|m| m.as_str().replace(',', "").parse().ok())
        .collect()
}

fn decimals_in(text: &str) -> Vec<f64> {
    DECIMALS
        .captures_iter(text)
        .filter_map(|c| c[1].replace(',', "").parse().ok())
        .collect()
}

/// Try every shape in order; the first detector that fires owns the prompt.
pub fn detect_and_solve(prompt: &str) -> Option<SolverResult> {
    let lower = prompt.to_lowercase();

    // Compound percentage changes.
    if (lower.contains('%') || lower.contains("percent"))
        && ["increase", "decrease", "grows", "shrinks", "gain", "loss"]
            .iter()
            .any(|w| lower.contains(w))
    {
        let initial = decimals_in(prompt).into_iter().next();
        let changes: Vec<(bool, f64)> = PCT_CHANGE
            .captures_iter(&lower)
            .filter_map(|c| {
                let increase = c[1].starts_with("increase");
                c[2].parse().ok().map(|pct| (increase, pct))
            })
            .collect();
        if let (Some(initial), false) = (initial, changes.is_empty()) {
            return Some(solve_compound_percentage(initial, &changes));
        }
    }

    // Rate problems ("N machines make M widgets in T minutes…").
    if RATE_ROLE.is_match(&lower) {
        let numbers = integers_in(prompt);
        if numbers.len() >= 5 {
            return Some(solve_rate(
                numbers[0], // workers
                numbers[1], // units produced
                numbers[2], // time taken
                numbers[3], // target units
                numbers[4], // target time
            ));
        }
    }

    // Difference problems ("total T, A costs D more than B").
    if (lower.contains("cost") || lower.contains("costs")) && lower.contains("more than") {
        let numbers = decimals_in(&lower);
        if numbers.len() >= 2 {
            return Some(solve_difference(numbers[0], numbers[1]));
        }
    }

    // Literal "all but K".
    if lower.contains("all but") {
        let total = ALL_BUT_TOTAL
            .captures(&lower)
            .or_else(|| ALL_BUT_COUNT_NOUN.captures(&lower))
            .and_then(|c| c[1].parse::<f64>().ok());
        if let Some(total) = total {
            return Some(solve_all_but(total, &lower));
        }
    }

    // Three-switch / three-bulb puzzle.
    if lower.contains("switch")
        && lower.contains("bulb")
        && ["one time", "one trip", "once", "figure out"]
            .iter()
            .any(|w| lower.contains(w))
    {
        return Some(solve_light_switch());
    }

    None
}

// ── Solvers ──────────────────────────────────────────────────────────────────

fn solve_rate(workers: f64, units: f64, time: f64, target_units: f64, target_time: f64) -> SolverResult {
    let denom = workers * time;
    let rate_per_worker = units / denom;
    let required_rate = target_units / target_time;
    let workers_needed = required_rate / rate_per_worker;
    let verify_units = workers_needed * rate_per_worker * target_time;

    let plausible = denom != 0.0
        && target_time != 0.0
        && rate_per_worker.is_finite()
        && workers_needed.is_finite()
        && workers_needed > 0.0;
    let verified = plausible && (verify_units - target_units).abs() < TOLERANCE;

    let steps = vec![
        ReasoningStep::new(1, "Calculate production rate per worker per time unit")
            .with_detail(format!("{units} / ({workers} × {time})"))
            .with_result(format!("{rate_per_worker} units per worker per time unit")),
        ReasoningStep::new(2, "Calculate required total production rate")
            .with_detail(format!("{target_units} / {target_time}"))
            .with_result(format!("{required_rate} units per time unit")),
        ReasoningStep::new(3, "Calculate number of workers needed")
            .with_detail(format!("{required_rate} / {rate_per_worker}"))
            .with_result(format!("{} workers", format_quantity(workers_needed))),
        ReasoningStep::new(4, "Verify the answer")
            .with_detail(format!(
                "{} × {rate_per_worker} × {target_time}",
                format_quantity(workers_needed)
            ))
            .with_result(format!(
                "{verify_units} units (should equal {target_units}) {}",
                if verified { "✓" } else { "✗" }
            )),
    ];

    SolverResult {
        answer: SolverAnswer::Quantity(workers_needed),
        verified,
        steps,
    }
}

fn solve_difference(total: f64, difference: f64) -> SolverResult {
    let smaller = (total - difference) / 2.0;
    let larger = smaller + difference;
    let verify_total = smaller + larger;
    let verify_diff = larger - smaller;

    // A negative "price" means the extracted numbers were not a real
    // total/difference pair.
    let plausible = smaller.is_finite() && smaller >= 0.0;
    let verified = plausible
        && (verify_total - total).abs() < TOLERANCE
        && (verify_diff - difference).abs() < TOLERANCE;

    let steps = vec![
        ReasoningStep::new(1, "Define variables")
            .with_detail(format!("smaller = x, larger = x + {difference}")),
        ReasoningStep::new(2, "Set up equation from total")
            .with_detail(format!("x + (x + {difference}) = {total}"))
            .with_result(format!("2x + {difference} = {total}")),
        ReasoningStep::new(3, "Solve for the smaller item")
            .with_detail(format!("x = ({total} - {difference}) / 2"))
            .with_result(format!("{smaller}")),
        ReasoningStep::new(4, "Calculate the larger item")
            .with_detail(format!("{smaller} + {difference}"))
            .with_result(format!("{larger}")),
        ReasoningStep::new(5, "Verify the answer")
            .with_detail(format!(
                "{smaller} + {larger} = {verify_total}, {larger} - {smaller} = {verify_diff}"
            ))
            .with_result(if verified { "✓ Verified" } else { "✗ Verification failed" }),
    ];

    SolverResult {
        answer: SolverAnswer::Pair { smaller, larger },
        verified,
        steps,
    }
}

fn solve_all_but(total: f64, lower_prompt: &str) -> SolverResult {
    let remaining = ALL_BUT
        .captures(lower_prompt)
        .and_then(|c| c[1].parse::<f64>().ok());

    let (remaining, verified) = match remaining {
        Some(k) if k <= total => (k, true),
        Some(k) => (k, false), // "all but 12" of 9 — extraction is implausible
        None => (total, false),
    };

    let steps = vec![
        ReasoningStep::new(1, "Parse the logical statement")
            .with_detail("'all but X' literally means X remain"),
        ReasoningStep::new(2, "Apply the literal interpretation")
            .with_detail(format!("started with {}, 'all but {}' remain", format_quantity(total), format_quantity(remaining)))
            .with_result(format_quantity(remaining)),
        ReasoningStep::new(3, "Verify logical consistency")
            .with_detail(format!(
                "{} remaining out of {} {}",
                format_quantity(remaining),
                format_quantity(total),
                if verified { "✓" } else { "✗" }
            )),
    ];

    SolverResult {
        answer: SolverAnswer::Quantity(remaining),
        verified,
        steps,
    }
}

fn solve_compound_percentage(initial: f64, changes: &[(bool, f64)]) -> SolverResult {
    let mut steps = vec![
        ReasoningStep::new(1, "Starting value").with_result(format!("${}", format_money(initial))),
    ];

    let mut current = initial;
    let mut n = 2;
    for (period, (increase, pct)) in changes.iter().enumerate() {
        let multiplier = if *increase { 1.0 + pct / 100.0 } else { 1.0 - pct / 100.0 };
        let next = current * multiplier;
        let sign = if *increase { "+" } else { "-" };
        steps.push(
            ReasoningStep::new(n, format!("Q{}: apply {sign}{pct}% change", period + 1))
                .with_detail(format!("${} × {multiplier}", format_money(current)))
                .with_result(format!("${}", format_money(next))),
        );
        current = next;
        n += 1;
    }

    let total_change_pct = (current - initial) / initial * 100.0;
    steps.push(
        ReasoningStep::new(n, "Calculate total percentage change from start")
            .with_detail(format!(
                "(({}  - {}) / {}) × 100",
                format_money(current),
                format_money(initial),
                format_money(initial)
            ))
            .with_result(format!("{total_change_pct:+.2}%")),
    );

    // Substitute back: replay the changes and require the same final value.
    let replayed = changes.iter().fold(initial, |acc, (inc, pct)| {
        acc * if *inc { 1.0 + pct / 100.0 } else { 1.0 - pct / 100.0 }
    });
    let verified = initial > 0.0
        && current.is_finite()
        && total_change_pct.is_finite()
        && (replayed - current).abs() < TOLERANCE;

    SolverResult {
        answer: SolverAnswer::Percentage { final_value: current, total_change_pct },
        verified,
        steps,
    }
}

fn solve_light_switch() -> SolverResult {
    let steps = vec![
        ReasoningStep::new(1, "Understand the constraint")
            .with_detail("3 switches control 3 bulbs in another room, only one trip allowed"),
        ReasoningStep::new(2, "Identify available signals")
            .with_detail("a bulb's state (on/off) and its warmth (recent activity)"),
        ReasoningStep::new(3, "Design the strategy")
            .with_detail("switch A on for 10 minutes then off; switch B on; switch C untouched"),
        ReasoningStep::new(4, "Execute and observe")
            .with_detail("on entry, check each bulb's state and temperature"),
        ReasoningStep::new(5, "Verify uniqueness")
            .with_detail("three signatures: (on, hot), (off, warm), (off, cold)")
            .with_result("✓ each bulb maps to exactly one switch"),
    ];

    SolverResult {
        answer: SolverAnswer::Procedure {
            plan: vec![
                "1. Turn ON switch A and wait 10 minutes".to_string(),
                "2. Turn OFF switch A".to_string(),
                "3. Turn ON switch B".to_string(),
                "4. Leave switch C OFF".to_string(),
                "5. Enter the room immediately".to_string(),
            ],
            identification: vec![
                ("Switch A".to_string(), "bulb that is OFF but warm to the touch".to_string()),
                ("Switch B".to_string(), "bulb that is ON".to_string()),
                ("Switch C".to_string(), "bulb that is OFF and cold".to_string()),
            ],
        },
        verified: true,
        steps,
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widget_rate_problem() {
        let result = detect_and_solve(
            "If 5 machines make 5 widgets in 5 minutes, how many machines for 100 widgets in 100 minutes?",
        )
        .expect("rate shape detected");
        assert!(result.verified);
        match result.answer {
            SolverAnswer::Quantity(n) => assert!((n - 5.0).abs() < 1e-9),
            other => panic!("unexpected answer {other:?}"),
        }
        assert_eq!(result.display_text(), "5");
        assert!(result.steps.len() >= 4);
    }

    #[test]
    fn bat_and_ball() {
        let result = detect_and_solve(
            "A bat and a ball cost $1.10. The bat costs $1.00 more than the ball. How much does the ball cost?",
        )
        .expect("difference shape detected");
        assert!(result.verified);
        assert_eq!(result.display_text(), "$0.05");
    }

    #[test]
    fn compound_percentage_portfolio() {
        let result = detect_and_solve(
            "$15,000 increases by 18%, then decreases by 12%, then increases by 25%. Final value and total change?",
        )
        .expect("percentage shape detected");
        assert!(result.verified);
        match result.answer {
            SolverAnswer::Percentage { final_value, total_change_pct } => {
                assert!((final_value - 19470.0).abs() < 0.01);
                assert!((total_change_pct - 29.80).abs() < 0.01);
            }
            other => panic!("unexpected answer {other:?}"),
        }
        let text = result.display_text();
        assert!(text.contains("$19,470.00"), "got {text}");
        assert!(text.contains("+29.80%"), "got {text}");
    }

    #[test]
    fn all_but_literal() {
        let result = detect_and_solve("A farmer had 17 sheep. All but 9 died. How many are left?")
            .expect("all-but shape detected");
        assert!(result.verified);
        assert_eq!(result.display_text(), "9");
    }

    #[test]
    fn all_but_implausible_count_is_unverified() {
        let result = detect_and_solve("A farmer had 3 sheep. All but 9 died.")
            .expect("all-but shape detected");
        assert!(!result.verified);
    }

    #[test]
    fn light_switch_puzzle() {
        let result = detect_and_solve(
            "Three switches control three bulbs in another room. You may enter the room only once. How do you figure out which switch controls which bulb?",
        )
        .expect("switch puzzle detected");
        assert!(result.verified);
        assert!(result.display_text().contains("Switch B"));
    }

    #[test]
    fn unknown_shapes_return_none() {
        assert!(detect_and_solve("What is the capital of France?").is_none());
        assert!(detect_and_solve("Tell me about machine learning").is_none());
    }

    #[test]
    fn negative_difference_is_unverified() {
        // "Total" smaller than "difference" — heuristic extraction went wrong.
        let result = detect_and_solve("It costs $1 which is $5 more than the other one cost")
            .expect("difference shape detected");
        assert!(!result.verified);
    }

    #[test]
    fn money_formatting_groups_thousands() {
        assert_eq!(format_money(19470.0), "19,470.00");
        assert_eq!(format_money(1234567.891), "1,234,567.89");
        assert_eq!(format_money(999.5), "999.50");
    }
}
