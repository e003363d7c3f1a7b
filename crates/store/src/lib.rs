//! Typed JSON documents on disk with atomic writes.
//!
//! Every persisted document in the system goes through this store:
//! writes are write-temp-then-rename so a partial file is never observed,
//! reads fall back to `Default` (with a logged warning) when the file is
//! missing or malformed, and each file path is serialized by its own mutex.
//! Rolling logs use the JSON-lines helpers instead of whole-document writes.

use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

#[derive(Debug)]
pub struct DocumentStore {
    base_dir: PathBuf,
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl DocumentStore {
    /// Open a store rooted at `base_dir`, creating the directory if needed.
    pub fn open(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)
            .with_context(|| format!("create store directory {}", base_dir.display()))?;
        Ok(Self {
            base_dir,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Absolute path of a document, relative to the store root.
    pub fn path(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.base_dir.join(rel)
    }

    fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().expect("lock table poisoned");
        locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Load a document, returning `Default` when the file is missing or
    /// malformed.  Malformed content is a non-fatal warning, never an error.
    pub fn load_or_default<T>(&self, rel: impl AsRef<Path>) -> T
    where
        T: DeserializeOwned + Default,
    {
        let path = self.path(rel);
        let guard = self.lock_for(&path);
        let _held = guard.lock().expect("file lock poisoned");

        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(_) => return T::default(),
        };

        match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(err) => {
                warn!(path = %path.display(), %err, "malformed document, using default");
                T::default()
            }
        }
    }

    /// Atomically persist a document: serialize, write a sibling temp file,
    /// then rename over the target.
    pub fn save<T: Serialize>(&self, rel: impl AsRef<Path>, value: &T) -> Result<()> {
        let path = self.path(rel);
        let guard = self.lock_for(&path);
        let _held = guard.lock().expect("file lock poisoned");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create parent of {}", path.display()))?;
        }

        let rendered = serde_json::to_string_pretty(value).context("serialize document")?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, rendered).with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
        Ok(())
    }

    /// Append one record to a JSON-lines file, creating it if absent.
    pub fn append_jsonl<T: Serialize>(&self, rel: impl AsRef<Path>, record: &T) -> Result<()> {
        let path = self.path(rel);
        let guard = self.lock_for(&path);
        let _held = guard.lock().expect("file lock poisoned");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(record).context("serialize jsonl record")?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// Read every parseable record from a JSON-lines file.  Unparseable lines
    /// are skipped; a missing file yields an empty list.
    pub fn read_jsonl<T: DeserializeOwned>(&self, rel: impl AsRef<Path>) -> Vec<T> {
        let path = self.path(rel);
        let guard = self.lock_for(&path);
        let _held = guard.lock().expect("file lock poisoned");

        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(_) => return Vec::new(),
        };

        BufReader::new(file)
            .lines()
            .filter_map(|line| {
                let line = line.ok()?;
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    return None;
                }
                serde_json::from_str(trimmed).ok()
            })
            .collect()
    }

    pub fn exists(&self, rel: impl AsRef<Path>) -> bool {
        self.path(rel).exists()
    }

    /// Last-modified time, used by TTL-based caches for lazy eviction.
    pub fn modified(&self, rel: impl AsRef<Path>) -> Option<SystemTime> {
        fs::metadata(self.path(rel)).and_then(|m| m.modified()).ok()
    }

    pub fn remove(&self, rel: impl AsRef<Path>) -> Result<()> {
        let path = self.path(rel);
        let guard = self.lock_for(&path);
        let _held = guard.lock().expect("file lock poisoned");
        if path.exists() {
            fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
        }
        Ok(())
    }

    /// Total on-disk size of all regular files under a subdirectory.
    pub fn dir_size_bytes(&self, rel: impl AsRef<Path>) -> u64 {
        let dir = self.path(rel);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => return 0,
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.metadata().ok())
            .filter(|meta| meta.is_file())
            .map(|meta| meta.len())
            .sum()
    }

    /// List file names (not paths) under a subdirectory.
    pub fn list_dir(&self, rel: impl AsRef<Path>) -> Vec<String> {
        let dir = self.path(rel);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect()
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
    struct Doc {
        name: String,
        count: u32,
    }

    fn store() -> (tempfile::TempDir, DocumentStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn save_then_load_roundtrips() {
        let (_dir, store) = store();
        let doc = Doc { name: "widget".to_string(), count: 3 };
        store.save("memory/doc.json", &doc).unwrap();
        let loaded: Doc = store.load_or_default("memory/doc.json");
        assert_eq!(loaded, doc);
    }

    #[test]
    fn missing_file_yields_default() {
        let (_dir, store) = store();
        let loaded: Doc = store.load_or_default("nope.json");
        assert_eq!(loaded, Doc::default());
    }

    #[test]
    fn malformed_file_yields_default() {
        let (_dir, store) = store();
        fs::write(store.path("bad.json"), "{not json").unwrap();
        let loaded: Doc = store.load_or_default("bad.json");
        assert_eq!(loaded, Doc::default());
    }

    #[test]
    fn leftover_temp_file_is_never_read() {
        let (_dir, store) = store();
        let doc = Doc { name: "kept".to_string(), count: 1 };
        store.save("doc.json", &doc).unwrap();

        // Simulate a crash mid-write: a stale temp file beside the document.
        fs::write(store.path("doc.tmp"), "{\"name\":\"partial").unwrap();

        let loaded: Doc = store.load_or_default("doc.json");
        assert_eq!(loaded.name, "kept");
    }

    #[test]
    fn jsonl_append_and_read() {
        let (_dir, store) = store();
        for i in 0..3u32 {
            store
                .append_jsonl("logs/events.jsonl", &Doc { name: format!("e{i}"), count: i })
                .unwrap();
        }
        let records: Vec<Doc> = store.read_jsonl("logs/events.jsonl");
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].name, "e2");
    }

    #[test]
    fn jsonl_skips_unparseable_lines() {
        let (_dir, store) = store();
        store.append_jsonl("log.jsonl", &Doc { name: "ok".to_string(), count: 1 }).unwrap();
        {
            let mut file = fs::OpenOptions::new()
                .append(true)
                .open(store.path("log.jsonl"))
                .unwrap();
            writeln!(file, "garbage line").unwrap();
        }
        let records: Vec<Doc> = store.read_jsonl("log.jsonl");
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let (_dir, store) = store();
        store.save("x.json", &Doc::default()).unwrap();
        store.remove("x.json").unwrap();
        store.remove("x.json").unwrap();
        assert!(!store.exists("x.json"));
    }
}
