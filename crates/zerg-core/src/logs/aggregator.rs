//! Read-side log aggregation.
//!
//! Merges `workers/*.jsonl` plus `orchestrator.jsonl` by timestamp at read
//! time; nothing aggregated is written to disk. Parsed entries are cached
//! per file with mtime invalidation and LRU eviction.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use parking_lot::Mutex;
use serde_json::Value;

/// Bound on the per-file entry cache.
const MAX_CACHED_FILES: usize = 100;

/// Query parameters for filtering log entries. All filters AND together.
#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    /// Worker id; `"orchestrator"` selects the orchestrator's entries.
    pub worker_id: Option<Value>,
    pub task_id: Option<String>,
    /// Log level (exact match).
    pub level: Option<String>,
    pub phase: Option<String>,
    pub event: Option<String>,
    /// Task execution level (matched against `data.level`).
    pub zerg_level: Option<u32>,
    /// ISO-8601 lower bound (inclusive).
    pub since: Option<String>,
    /// ISO-8601 upper bound (inclusive).
    pub until: Option<String>,
    /// Case-insensitive substring search in `message`.
    pub search: Option<String>,
    pub limit: Option<usize>,
}

struct CachedFile {
    mtime: SystemTime,
    entries: Vec<Value>,
    /// LRU tick of last access.
    last_used: u64,
}

#[derive(Default)]
struct Cache {
    files: HashMap<PathBuf, CachedFile>,
    tick: u64,
}

/// Aggregates structured JSONL logs from all workers.
pub struct LogAggregator {
    log_dir: PathBuf,
    workers_dir: PathBuf,
    tasks_dir: PathBuf,
    cache: Mutex<Cache>,
}

impl LogAggregator {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        let log_dir = log_dir.into();
        Self {
            workers_dir: log_dir.join("workers"),
            tasks_dir: log_dir.join("tasks"),
            log_dir,
            cache: Mutex::new(Cache::default()),
        }
    }

    /// Query log entries, merged across files and sorted by timestamp.
    pub fn query(&self, query: &LogQuery) -> Vec<Value> {
        let mut filtered: Vec<Value> = self
            .read_all_entries()
            .into_iter()
            .filter(|entry| matches_query(entry, query))
            .collect();

        filtered.sort_by(|a, b| ts_of(a).cmp(ts_of(b)));

        if let Some(limit) = query.limit {
            filtered.truncate(limit);
        }
        filtered
    }

    /// All task ids seen in log entries or artifact directories, sorted.
    pub fn list_tasks(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .read_all_entries()
            .iter()
            .filter_map(|e| e.get("task_id").and_then(Value::as_str))
            .map(str::to_owned)
            .collect();

        if let Ok(entries) = std::fs::read_dir(&self.tasks_dir) {
            for entry in entries.flatten() {
                if entry.path().is_dir() {
                    if let Some(name) = entry.file_name().to_str() {
                        ids.push(name.to_owned());
                    }
                }
            }
        }

        ids.sort();
        ids.dedup();
        ids
    }

    /// Existing artifact paths for a task, by artifact name.
    pub fn task_artifacts(&self, task_id: &str) -> Vec<(String, PathBuf)> {
        let task_dir = self.tasks_dir.join(task_id);
        [
            "execution.jsonl",
            "claude_output.txt",
            "verification_output.txt",
            "git_diff.patch",
        ]
        .iter()
        .filter_map(|name| {
            let path = task_dir.join(name);
            path.exists().then(|| ((*name).to_owned(), path))
        })
        .collect()
    }

    /// Read all entries with per-file mtime caching.
    fn read_all_entries(&self) -> Vec<Value> {
        let mut files: Vec<PathBuf> = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&self.workers_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
                    files.push(path);
                }
            }
        }
        let orchestrator = self.log_dir.join("orchestrator.jsonl");
        if orchestrator.exists() {
            files.push(orchestrator);
        }
        files.sort();

        let mut cache = self.cache.lock();
        cache.tick += 1;
        let tick = cache.tick;
        let mut all = Vec::new();

        for path in files {
            let Ok(mtime) = std::fs::metadata(&path).and_then(|m| m.modified()) else {
                continue;
            };

            let hit = cache
                .files
                .get(&path)
                .is_some_and(|cached| cached.mtime == mtime);
            if hit {
                let cached = cache
                    .files
                    .get_mut(&path)
                    .unwrap_or_else(|| unreachable!());
                cached.last_used = tick;
                all.extend(cached.entries.iter().cloned());
                continue;
            }

            let entries = read_jsonl(&path);
            all.extend(entries.iter().cloned());
            cache.files.insert(
                path,
                CachedFile {
                    mtime,
                    entries,
                    last_used: tick,
                },
            );

            // LRU eviction.
            while cache.files.len() > MAX_CACHED_FILES {
                let Some(oldest) = cache
                    .files
                    .iter()
                    .min_by_key(|(_, c)| c.last_used)
                    .map(|(p, _)| p.clone())
                else {
                    break;
                };
                cache.files.remove(&oldest);
            }
        }

        all
    }
}

fn ts_of(entry: &Value) -> &str {
    entry.get("ts").and_then(Value::as_str).unwrap_or("")
}

fn matches_query(entry: &Value, query: &LogQuery) -> bool {
    if let Some(worker_id) = &query.worker_id {
        if entry.get("worker_id") != Some(worker_id) {
            return false;
        }
    }
    if let Some(task_id) = &query.task_id {
        if entry.get("task_id").and_then(Value::as_str) != Some(task_id) {
            return false;
        }
    }
    if let Some(level) = &query.level {
        if entry.get("level").and_then(Value::as_str) != Some(level) {
            return false;
        }
    }
    if let Some(phase) = &query.phase {
        if entry.get("phase").and_then(Value::as_str) != Some(phase) {
            return false;
        }
    }
    if let Some(event) = &query.event {
        if entry.get("event").and_then(Value::as_str) != Some(event) {
            return false;
        }
    }
    if let Some(zerg_level) = query.zerg_level {
        let matches = entry
            .get("data")
            .and_then(|d| d.get("level"))
            .and_then(Value::as_u64)
            == Some(u64::from(zerg_level));
        if !matches {
            return false;
        }
    }
    let ts = ts_of(entry);
    if let Some(since) = &query.since {
        if ts < since.as_str() {
            return false;
        }
    }
    if let Some(until) = &query.until {
        if ts > until.as_str() {
            return false;
        }
    }
    if let Some(search) = &query.search {
        let message = entry
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if !message.to_lowercase().contains(&search.to_lowercase()) {
            return false;
        }
    }
    true
}

/// Parse a JSONL file, skipping blank and malformed lines.
fn read_jsonl(path: &Path) -> Vec<Value> {
    let Ok(text) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}
