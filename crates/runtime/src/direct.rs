//! Deterministic pre-LLM responders for recognized command-shaped prompts.
//!
//! Matching is an ordered table: the first matcher that recognizes the input
//! produces a tagged command, and the first match wins.  No LLM call, no
//! reasoning trace beyond the single synthesized step the controller adds.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde_json::json;
use tracing::debug;

use meridian_config::AppConfig;
use meridian_memory::MemoryManager;
use meridian_tools as tools;

use crate::evaluator;

const SHELL_TIMEOUT: Duration = Duration::from_secs(30);

/// A recognized direct command, tagged with everything needed to run it.
#[derive(Debug, Clone, PartialEq)]
pub enum DirectCommand {
    Identity,
    ListDir(String),
    Pwd,
    ReadFile(String),
    WriteFile { path: String, content: String },
    ChangeDir(String),
    /// Full git invocation passed through to the shell.
    Git(String),
    Find { pattern: String, path: String },
    Grep { pattern: String, target: String },
    /// A command on the closed shell allowlist, run verbatim.
    SafeShell(String),
    Arithmetic(String),
    ReverseString(String),
    RecallPreference(String),
    ConfigDump,
    JsonSynthesis { name: String, raw: String },
}

static MATH_EXTRACT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:what\s+is|calculate|compute|solve)\s+([0-9\s+\-*/×÷().,^]+)")
        .expect("valid math regex")
});

static REVERSE_EXTRACT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)reverse\s+(?:this\s+)?string:?\s*['"]?([^'"]+?)['"]?\s*$"#)
        .expect("valid reverse regex")
});

static REVERSE_QUOTED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)reverse\s+['"]([^'"]+)['"]"#).expect("valid quoted reverse regex")
});

static NAMED_ENTITY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)named\s+(\w+)").expect("valid name regex"));

/// `write <path>: <content>` — the colon must follow the path token
/// directly, so natural-language "write a function that…" never matches.
static WRITE_FILE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?si)^write\s+(?:file\s+)?(\S+?)\s*:\s*(.+)$").expect("valid write regex")
});

const IDENTITY_TRIGGERS: &[&str] = &[
    "who are you",
    "identify yourself",
    "what are you",
    "tell me about yourself",
];

/// The ordered matcher table.  Returns the first command whose shape fits.
pub fn match_command(input: &str) -> Option<DirectCommand> {
    let trimmed = input.trim();
    let lower = trimmed.to_lowercase();

    if IDENTITY_TRIGGERS.iter().any(|t| lower.contains(t)) {
        return Some(DirectCommand::Identity);
    }

    if matches!(lower.as_str(), "ls" | "list files" | "show files" | "list directory") {
        return Some(DirectCommand::ListDir(".".to_string()));
    }
    if lower.starts_with("ls ") {
        return Some(DirectCommand::ListDir(trimmed[3..].trim().to_string()));
    }

    if matches!(lower.as_str(), "pwd" | "current directory" | "where am i") {
        return Some(DirectCommand::Pwd);
    }

    if lower.starts_with("cat ") {
        return Some(DirectCommand::ReadFile(trimmed[4..].trim().to_string()));
    }

    if lower.starts_with("write ") {
        if let Some(captures) = WRITE_FILE.captures(trimmed) {
            let path = captures[1].to_string();
            // Require something path-shaped; bare words stay with the LLM.
            if path.contains('.') || path.contains('/') {
                return Some(DirectCommand::WriteFile {
                    path,
                    content: captures[2].trim().to_string(),
                });
            }
        }
    }

    if lower.starts_with("cd ") {
        return Some(DirectCommand::ChangeDir(trimmed[3..].trim().to_string()));
    }

    if lower.starts_with("git ") {
        return Some(DirectCommand::Git(trimmed.to_string()));
    }

    if lower.starts_with("find ") {
        let spec = trimmed[5..].trim();
        let (pattern, path) = match spec.split_once(" in ") {
            Some((pattern, path)) => (pattern.trim(), path.trim()),
            None => (spec, "."),
        };
        return Some(DirectCommand::Find {
            pattern: pattern.to_string(),
            path: path.to_string(),
        });
    }

    if lower.starts_with("grep ") {
        let spec = trimmed[5..].trim();
        let (pattern, target) = match spec.split_once(" in ") {
            Some((pattern, target)) => (pattern.trim(), target.trim()),
            None => (spec, "."),
        };
        return Some(DirectCommand::Grep {
            pattern: pattern.to_string(),
            target: target.to_string(),
        });
    }

    if tools::is_safe_command(&lower) {
        return Some(DirectCommand::SafeShell(trimmed.to_string()));
    }

    if ["what is", "calculate", "compute", "solve"].iter().any(|w| lower.contains(w)) {
        if let Some(captures) = MATH_EXTRACT.captures(&lower) {
            let expr = captures[1].trim().to_string();
            if expr.chars().any(|c| c.is_ascii_digit()) {
                return Some(DirectCommand::Arithmetic(expr));
            }
        }
    }

    if lower.contains("reverse") && lower.contains("string") {
        if let Some(captures) = REVERSE_EXTRACT
            .captures(trimmed)
            .or_else(|| REVERSE_QUOTED.captures(trimmed))
        {
            return Some(DirectCommand::ReverseString(captures[1].trim().to_string()));
        }
    }

    if ["what's my", "what is my", "do you remember", "recall"]
        .iter()
        .any(|p| lower.contains(p))
    {
        return Some(DirectCommand::RecallPreference(lower));
    }

    if ["check your", "current configuration", "which model", "what model"]
        .iter()
        .any(|p| lower.contains(p))
    {
        return Some(DirectCommand::ConfigDump);
    }

    if lower.contains("json") && (lower.contains("output") || lower.contains("object")) {
        if let Some(captures) = NAMED_ENTITY.captures(trimmed) {
            return Some(DirectCommand::JsonSynthesis {
                name: captures[1].to_string(),
                raw: lower,
            });
        }
    }

    None
}

/// Execute a matched command.  Returns the user-facing text, or `None` when
/// the command turns out not to apply (e.g. unevaluable arithmetic) so the
/// pipeline continues to the LLM.
pub async fn run_command(
    command: DirectCommand,
    config: &AppConfig,
    memory: &MemoryManager,
) -> Option<String> {
    debug!(?command, "running direct command");
    match command {
        DirectCommand::Identity => Some(config.agent.identity.clone()),

        DirectCommand::ListDir(path) => Some(unwrap_report(tools::list_directory(&path))),
        DirectCommand::Pwd => Some(tools::current_directory()),
        DirectCommand::ReadFile(path) => Some(unwrap_report(tools::read_file(&path))),
        DirectCommand::WriteFile { path, content } => {
            Some(unwrap_report(tools::write_file(&path, &content)))
        }
        DirectCommand::ChangeDir(path) => Some(unwrap_report(tools::change_directory(&path))),

        DirectCommand::Git(full) | DirectCommand::SafeShell(full) => {
            match tools::run_shell(&full, SHELL_TIMEOUT).await {
                Ok((_, output)) => Some(output),
                Err(err) => Some(format!("⚠ {err}")),
            }
        }

        DirectCommand::Find { pattern, path } => Some(unwrap_report(tools::find_files(&pattern, &path))),
        DirectCommand::Grep { pattern, target } => Some(unwrap_report(tools::grep_files(&pattern, &target))),

        DirectCommand::Arithmetic(expr) => evaluator::evaluate(&expr)
            .map(|value| format!("The answer is {}", evaluator::format_result(value))),

        DirectCommand::ReverseString(text) => {
            let reversed: String = text.chars().rev().collect();
            Some(format!("Reversed: {reversed}"))
        }

        DirectCommand::RecallPreference(query) => recall_preference(&query, memory),

        DirectCommand::ConfigDump => {
            let dump = json!({
                "model_path": config.llm.model_path,
                "llm_engine": config.llm.binary_path,
                "base_dir": config.agent.base_dir,
                "memory_system": "enabled",
                "data_storage": {
                    "conversations": "memory/long_term.json",
                    "metrics": "metrics.json",
                    "logs": "logs/",
                },
            });
            Some(serde_json::to_string_pretty(&dump).unwrap_or_default())
        }

        DirectCommand::JsonSynthesis { name, raw } => {
            let mut skills = Vec::new();
            if raw.contains("python") {
                skills.push("Python");
            }
            if raw.contains("ai") || raw.contains("artificial intelligence") {
                skills.push("AI Development");
            }
            if raw.contains("code") || raw.contains("coding") {
                skills.push("Coding");
            }
            let object = json!({ "name": name, "skills": skills });
            Some(serde_json::to_string_pretty(&object).unwrap_or_default())
        }
    }
}

/// Try to match and run in one step.
pub async fn handle(input: &str, config: &AppConfig, memory: &MemoryManager) -> Option<String> {
    let command = match_command(input)?;
    run_command(command, config, memory).await
}

fn unwrap_report(result: anyhow::Result<String>) -> String {
    result.unwrap_or_else(|err| format!("⚠ {err}"))
}

/// Answer "what's my X" style prompts from the preference bag, or from the
/// most relevant remembered exchange.
fn recall_preference(query: &str, memory: &MemoryManager) -> Option<String> {
    for (key, value) in memory.preferences() {
        if query.contains(key.as_str()) {
            return Some(format!("Your {key} is {value}"));
        }
    }

    memory
        .relevant_context(query)
        .first()
        .map(|item| format!("Based on our previous conversation: {}", item.final_text))
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use meridian_memory::MemoryParams;
    use meridian_store::DocumentStore;

    fn fixtures() -> (tempfile::TempDir, AppConfig, MemoryManager) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DocumentStore::open(dir.path()).unwrap());
        let memory = MemoryManager::open(store, MemoryParams::default());
        (dir, AppConfig::default(), memory)
    }

    #[test]
    fn identity_is_matched() {
        assert_eq!(match_command("Who are you?"), Some(DirectCommand::Identity));
    }

    #[test]
    fn listing_variants_are_matched() {
        assert_eq!(match_command("ls"), Some(DirectCommand::ListDir(".".to_string())));
        assert_eq!(match_command("list files"), Some(DirectCommand::ListDir(".".to_string())));
        assert_eq!(match_command("ls /tmp"), Some(DirectCommand::ListDir("/tmp".to_string())));
    }

    #[test]
    fn arithmetic_is_extracted() {
        assert_eq!(
            match_command("what is 8 × 7 + 6"),
            Some(DirectCommand::Arithmetic("8 × 7 + 6".to_string()))
        );
    }

    #[test]
    fn word_problems_are_not_arithmetic() {
        // A rate word problem has words the character class rejects mid-expression.
        let matched = match_command("what is the answer if 5 machines make 5 widgets");
        assert!(!matches!(matched, Some(DirectCommand::Arithmetic(_))));
    }

    #[test]
    fn write_file_is_matched_for_path_shaped_targets() {
        assert_eq!(
            match_command("write notes.txt: remember the milk"),
            Some(DirectCommand::WriteFile {
                path: "notes.txt".to_string(),
                content: "remember the milk".to_string(),
            })
        );
        assert_eq!(
            match_command("Write file src/config.toml: threads = 4"),
            Some(DirectCommand::WriteFile {
                path: "src/config.toml".to_string(),
                content: "threads = 4".to_string(),
            })
        );
    }

    #[test]
    fn code_generation_requests_are_not_write_commands() {
        // Prose "write a …" requests belong to the LLM, not the file tool.
        assert_eq!(match_command("write a python function that sorts: quickly"), None);
        assert_eq!(match_command("write a poem about autumn"), None);
        // A bare word before the colon is not path-shaped.
        assert_eq!(match_command("write summary: the meeting went well"), None);
    }

    #[test]
    fn reverse_string_is_extracted() {
        assert_eq!(
            match_command("reverse this string: Meridian"),
            Some(DirectCommand::ReverseString("Meridian".to_string()))
        );
    }

    #[test]
    fn first_match_wins_over_later_matchers() {
        // "what is 2+2" hits arithmetic before any later matcher.
        assert!(matches!(
            match_command("what is 2+2"),
            Some(DirectCommand::Arithmetic(_))
        ));
    }

    #[test]
    fn plain_questions_are_not_matched() {
        assert_eq!(match_command("why is the sky blue"), None);
        assert_eq!(match_command("tell me about rust"), None);
    }

    #[tokio::test]
    async fn arithmetic_runs_to_an_answer() {
        let (_dir, config, memory) = fixtures();
        let reply = handle("what is 8 × 7 + 6", &config, &memory).await.unwrap();
        assert_eq!(reply, "The answer is 62");
    }

    #[tokio::test]
    async fn unevaluable_arithmetic_falls_through() {
        let (_dir, config, memory) = fixtures();
        // Matches the arithmetic shape but the expression is degenerate.
        assert!(handle("calculate ((3", &config, &memory).await.is_none());
    }

    #[tokio::test]
    async fn write_command_creates_the_file() {
        let (dir, config, memory) = fixtures();
        let target = dir.path().join("out.txt");
        let reply = handle(
            &format!("write {}: hello from the handler", target.display()),
            &config,
            &memory,
        )
        .await
        .unwrap();
        assert!(reply.contains("Wrote"));
        assert_eq!(
            std::fs::read_to_string(&target).unwrap(),
            "hello from the handler"
        );
    }

    #[tokio::test]
    async fn reverse_runs() {
        let (_dir, config, memory) = fixtures();
        let reply = handle("reverse this string: abc", &config, &memory).await.unwrap();
        assert_eq!(reply, "Reversed: cba");
    }

    #[tokio::test]
    async fn identity_reply_uses_configured_identity() {
        let (_dir, config, memory) = fixtures();
        let reply = handle("who are you", &config, &memory).await.unwrap();
        assert!(reply.contains("Meridian"));
    }

    #[tokio::test]
    async fn safe_shell_command_runs() {
        let (_dir, config, memory) = fixtures();
        let reply = handle("hostname", &config, &memory).await.unwrap();
        assert!(!reply.is_empty());
    }

    #[tokio::test]
    async fn preference_recall_reads_the_bag() {
        let (_dir, config, mut memory) = fixtures();
        memory.set_preference("favorite color", "teal");
        let reply = handle("what's my favorite color?", &config, &memory).await.unwrap();
        assert!(reply.contains("teal"));
    }

    #[tokio::test]
    async fn json_synthesis_builds_object() {
        let (_dir, config, memory) = fixtures();
        let reply = handle(
            "Give me a JSON object for a user named Ada who does Python and AI",
            &config,
            &memory,
        )
        .await
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(value["name"], "Ada");
        assert!(value["skills"].as_array().unwrap().iter().any(|s| s == "Python"));
    }

    #[tokio::test]
    async fn config_dump_is_json() {
        let (_dir, config, memory) = fixtures();
        let reply = handle("check your current configuration", &config, &memory).await.unwrap();
        assert!(serde_json::from_str::<serde_json::Value>(&reply).is_ok());
    }
}
