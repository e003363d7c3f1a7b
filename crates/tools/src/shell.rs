//! Bounded shell execution with a closed command allowlist.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::debug;

/// Commands the direct handler may run verbatim.  This list is closed: it is
/// compiled in and cannot be extended at runtime.
pub const SAFE_COMMANDS: &[&str] = &[
    "whoami", "hostname", "date", "uptime", "df", "du", "which", "whereis",
];

/// True when the first word of `input` is on the closed allowlist.
pub fn is_safe_command(input: &str) -> bool {
    input
        .split_whitespace()
        .next()
        .map(|word| SAFE_COMMANDS.contains(&word))
        .unwrap_or(false)
}

/// Run a shell command with a wall-clock deadline.  stdout and stderr are
/// merged into the returned output; a timeout kills the child.
pub async fn run_shell(command: &str, timeout: Duration) -> Result<(bool, String)> {
    debug!(command, "running shell command");

    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("spawn shell for '{command}'"))?;

    let waited = tokio::time::timeout(timeout, async {
        let output = child.wait_with_output().await?;
        anyhow::Ok(output)
    })
    .await;

    match waited {
        Ok(output) => {
            let output = output?;
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            if !output.stderr.is_empty() {
                if !text.is_empty() {
                    text.push('\n');
                }
                text.push_str(&String::from_utf8_lossy(&output.stderr));
            }
            Ok((output.status.success(), text.trim().to_string()))
        }
        Err(_) => Ok((
            false,
            format!("Command timeout ({}s limit)", timeout.as_secs()),
        )),
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowlist_accepts_listed_commands() {
        assert!(is_safe_command("whoami"));
        assert!(is_safe_command("date +%Y"));
    }

    #[test]
    fn allowlist_rejects_everything_else() {
        assert!(!is_safe_command("rm -rf /"));
        assert!(!is_safe_command("curl http://example.com"));
        assert!(!is_safe_command(""));
    }

    #[tokio::test]
    async fn echo_succeeds() {
        let (ok, output) = run_shell("echo hello", Duration::from_secs(5)).await.unwrap();
        assert!(ok);
        assert_eq!(output, "hello");
    }

    #[tokio::test]
    async fn failing_command_reports_failure() {
        let (ok, _) = run_shell("exit 3", Duration::from_secs(5)).await.unwrap();
        assert!(!ok);
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let (ok, output) = run_shell("sleep 5", Duration::from_millis(100)).await.unwrap();
        assert!(!ok);
        assert!(output.contains("timeout"));
    }
}
