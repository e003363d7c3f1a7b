//! Deterministic filesystem operations: listing, reading, searching.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use globset::Glob;
use regex::RegexBuilder;
use walkdir::WalkDir;

/// Byte cap applied to file reads and grep output so a single command can't
/// flood the terminal.
const MAX_OUTPUT_BYTES: usize = 65536;

const MAX_GREP_MATCHES: usize = 100;
const MAX_FIND_RESULTS: usize = 200;

/// Find the largest byte offset ≤ `max` that falls on a UTF-8 character
/// boundary.  Safe to use as `&s[..truncate_byte_boundary(s, max)]`.
fn truncate_byte_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    end
}

fn truncated(content: String) -> String {
    if content.len() > MAX_OUTPUT_BYTES {
        let end = truncate_byte_boundary(&content, MAX_OUTPUT_BYTES);
        format!("{}…[truncated at {} bytes]", &content[..end], MAX_OUTPUT_BYTES)
    } else {
        content
    }
}

pub fn list_directory(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let mut entries: Vec<(String, bool, u64)> = fs::read_dir(path)
        .with_context(|| format!("list directory {}", path.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| {
            let meta = entry.metadata().ok();
            let is_dir = meta.as_ref().map(|m| m.is_dir()).unwrap_or(false);
            let size = meta.map(|m| m.len()).unwrap_or(0);
            (entry.file_name().to_string_lossy().into_owned(), is_dir, size)
        })
        .collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    if entries.is_empty() {
        return Ok(format!("{} is empty", path.display()));
    }

    let mut lines = vec![format!("Contents of {}:", path.display())];
    for (name, is_dir, size) in entries {
        if is_dir {
            lines.push(format!("  {name}/"));
        } else {
            lines.push(format!("  {name} ({size} bytes)"));
        }
    }
    Ok(lines.join("\n"))
}

pub fn current_directory() -> String {
    std::env::current_dir()
        .map(|dir| dir.display().to_string())
        .unwrap_or_else(|_| "<unknown>".to_string())
}

pub fn read_file(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let content =
        fs::read_to_string(path).with_context(|| format!("read file {}", path.display()))?;
    Ok(truncated(content))
}

pub fn write_file(path: impl AsRef<Path>, content: &str) -> Result<String> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content).with_context(|| format!("write file {}", path.display()))?;
    Ok(format!("Wrote {} bytes to {}", content.len(), path.display()))
}

pub fn change_directory(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    std::env::set_current_dir(path)
        .with_context(|| format!("change directory to {}", path.display()))?;
    Ok(format!("Now in {}", current_directory()))
}

/// Find files whose names match a glob (or substring when the pattern has no
/// glob metacharacters) under `root`.
pub fn find_files(pattern: &str, root: impl AsRef<Path>) -> Result<String> {
    let root = root.as_ref();
    let effective = if pattern.contains(['*', '?', '[']) {
        pattern.to_string()
    } else {
        format!("*{pattern}*")
    };
    let matcher = Glob::new(&effective)
        .with_context(|| format!("invalid pattern {effective}"))?
        .compile_matcher();

    let mut hits: Vec<PathBuf> = Vec::new();
    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        if matcher.is_match(entry.file_name().to_string_lossy().as_ref()) {
            hits.push(entry.into_path());
            if hits.len() >= MAX_FIND_RESULTS {
                break;
            }
        }
    }

    if hits.is_empty() {
        return Ok(format!("No files matching '{pattern}' under {}", root.display()));
    }
    let mut lines = vec![format!("Found {} file(s) matching '{pattern}':", hits.len())];
    lines.extend(hits.iter().map(|p| format!("  {}", p.display())));
    Ok(lines.join("\n"))
}

/// Search file contents for a pattern.  `target` may be a single file or a
/// directory to walk.  Binary-looking files are skipped.
pub fn grep_files(pattern: &str, target: impl AsRef<Path>) -> Result<String> {
    let target = target.as_ref();
    let regex = RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .with_context(|| format!("invalid search pattern {pattern}"))?;

    let files: Vec<PathBuf> = if target.is_file() {
        vec![target.to_path_buf()]
    } else {
        WalkDir::new(target)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect()
    };

    let mut matches = Vec::new();
    'outer: for file in files {
        let Ok(content) = fs::read_to_string(&file) else {
            continue; // non-UTF-8 or unreadable
        };
        for (line_no, line) in content.lines().enumerate() {
            if regex.is_match(line) {
                matches.push(format!("{}:{}: {}", file.display(), line_no + 1, line.trim()));
                if matches.len() >= MAX_GREP_MATCHES {
                    break 'outer;
                }
            }
        }
    }

    if matches.is_empty() {
        bail!("no matches for '{pattern}' in {}", target.display());
    }
    Ok(truncated(matches.join("\n")))
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("notes.txt"), "alpha line\nbeta widget line\n").unwrap();
        fs::write(dir.path().join("other.md"), "gamma\n").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/deep.txt"), "widget in a subdir\n").unwrap();
        dir
    }

    #[test]
    fn listing_shows_files_and_dirs() {
        let dir = workspace();
        let listing = list_directory(dir.path()).unwrap();
        assert!(listing.contains("notes.txt"));
        assert!(listing.contains("sub/"));
    }

    #[test]
    fn read_roundtrips_written_file() {
        let dir = workspace();
        let path = dir.path().join("out.txt");
        write_file(&path, "hello").unwrap();
        assert_eq!(read_file(&path).unwrap(), "hello");
    }

    #[test]
    fn find_matches_by_substring() {
        let dir = workspace();
        let result = find_files("deep", dir.path()).unwrap();
        assert!(result.contains("deep.txt"));
        assert!(!result.contains("notes.txt"));
    }

    #[test]
    fn grep_walks_directories() {
        let dir = workspace();
        let result = grep_files("widget", dir.path()).unwrap();
        assert!(result.contains("notes.txt"));
        assert!(result.contains("deep.txt"));
    }

    #[test]
    fn grep_single_file() {
        let dir = workspace();
        let result = grep_files("beta", dir.path().join("notes.txt")).unwrap();
        assert!(result.contains(":2:"));
    }

    #[test]
    fn grep_no_match_is_error() {
        let dir = workspace();
        assert!(grep_files("zzzz", dir.path()).is_err());
    }
}
