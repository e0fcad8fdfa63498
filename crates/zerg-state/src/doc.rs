//! The on-disk state document and its record types.
//!
//! One [`StateDoc`] per feature, serialized as JSON. Workers and levels are
//! keyed by their stringified ids so the document stays a plain JSON object.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{LevelMergeStatus, LevelRunStatus, TaskStatus, WorkerStatus};

/// Per-task persisted state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub status: TaskStatus,
    pub level: u32,
    #[serde(default)]
    pub worker_id: Option<u32>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
}

impl TaskState {
    /// A fresh record for a task at the given level.
    pub fn new(level: u32) -> Self {
        Self {
            status: TaskStatus::Todo,
            level,
            worker_id: None,
            started_at: None,
            completed_at: None,
            claimed_at: None,
            retry_count: 0,
            next_retry_at: None,
            duration_ms: None,
            error: None,
        }
    }
}

/// Per-worker persisted state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerState {
    pub status: WorkerStatus,
    pub branch: String,
    #[serde(default)]
    pub current_task: Option<String>,
    #[serde(default)]
    pub tasks_completed: u32,
    #[serde(default)]
    pub context_usage: f64,
    #[serde(default)]
    pub port: Option<u16>,
}

impl WorkerState {
    pub fn new(branch: impl Into<String>) -> Self {
        Self {
            status: WorkerStatus::Initializing,
            branch: branch.into(),
            current_task: None,
            tasks_completed: 0,
            context_usage: 0.0,
            port: None,
        }
    }
}

/// Per-level persisted state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelState {
    pub status: LevelRunStatus,
    #[serde(default)]
    pub merge_status: Option<LevelMergeStatus>,
    #[serde(default)]
    pub merge_commit: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Default for LevelState {
    fn default() -> Self {
        Self {
            status: LevelRunStatus::Pending,
            merge_status: None,
            merge_commit: None,
            started_at: None,
            completed_at: None,
        }
    }
}

/// An append-only audit record. The `data` payload is opaque JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub timestamp: DateTime<Utc>,
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// The full durable state for one feature build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDoc {
    pub feature: String,
    pub started_at: DateTime<Utc>,
    pub current_level: u32,
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskState>,
    #[serde(default)]
    pub workers: BTreeMap<String, WorkerState>,
    #[serde(default)]
    pub levels: BTreeMap<String, LevelState>,
    #[serde(default)]
    pub execution_log: Vec<ExecutionEvent>,
    #[serde(default)]
    pub metrics: Option<serde_json::Value>,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl StateDoc {
    /// The initial document created on first load when no file exists.
    pub fn initial(feature: &str) -> Self {
        Self {
            feature: feature.to_owned(),
            started_at: Utc::now(),
            current_level: 0,
            tasks: BTreeMap::new(),
            workers: BTreeMap::new(),
            levels: BTreeMap::new(),
            execution_log: Vec::new(),
            metrics: None,
            paused: false,
            error: None,
        }
    }

    /// Look up a worker record by numeric id.
    pub fn worker(&self, worker_id: u32) -> Option<&WorkerState> {
        self.workers.get(&worker_id.to_string())
    }

    /// Mutable worker lookup by numeric id.
    pub fn worker_mut(&mut self, worker_id: u32) -> Option<&mut WorkerState> {
        self.workers.get_mut(&worker_id.to_string())
    }

    /// Look up a level record by number.
    pub fn level(&self, level: u32) -> Option<&LevelState> {
        self.levels.get(&level.to_string())
    }

    /// Level record for `level`, created as pending if missing.
    pub fn level_entry(&mut self, level: u32) -> &mut LevelState {
        self.levels.entry(level.to_string()).or_default()
    }

    /// Append an event in the current critical section.
    pub fn push_event(&mut self, event: &str, data: serde_json::Value) {
        self.execution_log.push(ExecutionEvent {
            timestamp: Utc::now(),
            event: event.to_owned(),
            data,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_matches_contract() {
        let doc = StateDoc::initial("auth-rework");
        assert_eq!(doc.feature, "auth-rework");
        assert_eq!(doc.current_level, 0);
        assert!(doc.tasks.is_empty());
        assert!(doc.workers.is_empty());
        assert!(doc.levels.is_empty());
        assert!(doc.execution_log.is_empty());
        assert!(doc.metrics.is_none());
        assert!(!doc.paused);
        assert!(doc.error.is_none());
    }

    #[test]
    fn doc_round_trips_through_json() {
        let mut doc = StateDoc::initial("roundtrip");
        doc.tasks.insert("T1".into(), TaskState::new(1));
        doc.workers.insert(
            "0".into(),
            WorkerState::new("zerg/roundtrip/worker-0"),
        );
        doc.level_entry(1).merge_status = Some(LevelMergeStatus::Pending);
        doc.push_event("test_event", serde_json::json!({"k": "v"}));

        let json = serde_json::to_string(&doc).unwrap();
        let back: StateDoc = serde_json::from_str(&json).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn workers_and_levels_key_by_string() {
        let mut doc = StateDoc::initial("keys");
        doc.workers.insert("3".into(), WorkerState::new("b"));
        doc.level_entry(2);

        let json = serde_json::to_value(&doc).unwrap();
        assert!(json["workers"].get("3").is_some());
        assert!(json["levels"].get("2").is_some());
        assert_eq!(doc.worker(3).unwrap().branch, "b");
        assert!(doc.level(2).is_some());
        assert!(doc.level(9).is_none());
    }

    #[test]
    fn task_state_defaults_fill_missing_fields() {
        let raw = serde_json::json!({"status": "pending", "level": 2});
        let task: TaskState = serde_json::from_value(raw).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.level, 2);
        assert_eq!(task.retry_count, 0);
        assert!(task.worker_id.is_none());
        assert!(task.next_retry_at.is_none());
    }
}
