//! Task status transitions, claims, and retry bookkeeping.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use crate::doc::TaskState;
use crate::error::StateError;
use crate::models::TaskStatus;

use super::StateStore;

/// A task stuck in `in_progress` past the stale timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleTask {
    pub task_id: String,
    pub worker_id: Option<u32>,
    pub elapsed_seconds: i64,
}

impl StateStore {
    /// Seed task records from the graph. Existing records are left alone so
    /// a resumed build keeps its progress.
    pub fn register_tasks<'a>(
        &self,
        tasks: impl IntoIterator<Item = (&'a str, u32)>,
    ) -> Result<(), StateError> {
        let tasks: Vec<(String, u32)> = tasks
            .into_iter()
            .map(|(id, level)| (id.to_owned(), level))
            .collect();
        self.atomic_update(|doc| {
            for (id, level) in tasks {
                doc.tasks.entry(id).or_insert_with(|| TaskState::new(level));
            }
        })
    }

    /// Set a task's status, maintaining timestamps and appending the audit
    /// event in the same critical section.
    ///
    /// - `in_progress` stamps `started_at`.
    /// - `claimed` stamps `claimed_at` (preserved by later transitions).
    /// - `complete` stamps `completed_at` and derives `duration_ms`.
    pub fn set_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        worker_id: Option<u32>,
        error: Option<&str>,
    ) -> Result<(), StateError> {
        let task_id = task_id.to_owned();
        let error = error.map(str::to_owned);
        self.atomic_update(move |doc| {
            let now = Utc::now();
            let task = doc
                .tasks
                .entry(task_id.clone())
                .or_insert_with(|| TaskState::new(0));

            task.status = status;
            if let Some(wid) = worker_id {
                task.worker_id = Some(wid);
            }
            match status {
                TaskStatus::InProgress => task.started_at = Some(now),
                TaskStatus::Claimed => task.claimed_at = Some(now),
                TaskStatus::Complete => {
                    task.completed_at = Some(now);
                    if let Some(started) = task.started_at {
                        task.duration_ms =
                            Some((now - started).num_milliseconds());
                    }
                }
                _ => {}
            }
            if let Some(err) = error {
                task.error = Some(err);
            }

            doc.push_event(
                "task_status",
                json!({
                    "task_id": task_id,
                    "status": status.to_string(),
                    "worker_id": worker_id,
                }),
            );
        })
    }

    /// Atomic test-and-set claim. Succeeds only from `todo` or `pending`;
    /// on success the task carries the caller's worker id.
    pub fn claim_task(&self, task_id: &str, worker_id: u32) -> Result<bool, StateError> {
        let task_id = task_id.to_owned();
        self.atomic_update(move |doc| {
            let Some(task) = doc.tasks.get_mut(&task_id) else {
                return false;
            };
            if !task.status.is_claimable() {
                return false;
            }
            task.status = TaskStatus::Claimed;
            task.claimed_at = Some(Utc::now());
            task.worker_id = Some(worker_id);
            doc.push_event(
                "task_claimed",
                json!({"task_id": task_id, "worker_id": worker_id}),
            );
            true
        })
    }

    /// Clear a task's worker assignment if `worker_id` owns it. Silent on
    /// missing tasks or foreign assignments.
    pub fn release_task(&self, task_id: &str, worker_id: u32) -> Result<(), StateError> {
        let task_id = task_id.to_owned();
        self.atomic_update(move |doc| {
            let released = match doc.tasks.get_mut(&task_id) {
                Some(task) if task.worker_id == Some(worker_id) => {
                    task.worker_id = None;
                    true
                }
                _ => false,
            };
            if released {
                doc.push_event(
                    "task_released",
                    json!({"task_id": task_id, "worker_id": worker_id}),
                );
            }
        })
    }

    /// Increment the retry counter and record the next ready moment.
    /// Returns the new count.
    pub fn increment_task_retry(
        &self,
        task_id: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<u32, StateError> {
        let task_id = task_id.to_owned();
        self.atomic_update(move |doc| {
            let task = doc
                .tasks
                .entry(task_id)
                .or_insert_with(|| TaskState::new(0));
            task.retry_count += 1;
            task.next_retry_at = Some(next_retry_at);
            task.retry_count
        })
    }

    /// Record (or clear) the moment a retry becomes ready.
    pub fn set_task_retry_schedule(
        &self,
        task_id: &str,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), StateError> {
        let task_id = task_id.to_owned();
        self.atomic_update(move |doc| {
            if let Some(task) = doc.tasks.get_mut(&task_id) {
                task.next_retry_at = next_retry_at;
            }
        })
    }

    /// Clear retry count and schedule (manual retry path).
    pub fn reset_task_retry(&self, task_id: &str) -> Result<(), StateError> {
        let task_id = task_id.to_owned();
        self.atomic_update(move |doc| {
            if let Some(task) = doc.tasks.get_mut(&task_id) {
                task.retry_count = 0;
                task.next_retry_at = None;
            }
        })
    }

    /// Current retry count (0 for unknown tasks).
    pub fn get_task_retry_count(&self, task_id: &str) -> u32 {
        self.snapshot()
            .tasks
            .get(task_id)
            .map(|t| t.retry_count)
            .unwrap_or(0)
    }

    /// Current status of a task, if it exists.
    pub fn get_task_status(&self, task_id: &str) -> Option<TaskStatus> {
        self.snapshot().tasks.get(task_id).map(|t| t.status)
    }

    /// Tasks in `waiting_retry` whose backoff has elapsed.
    pub fn get_tasks_ready_for_retry(&self) -> Vec<String> {
        let now = Utc::now();
        self.snapshot()
            .tasks
            .iter()
            .filter(|(_, t)| {
                t.status == TaskStatus::WaitingRetry
                    && t.next_retry_at.is_some_and(|at| at <= now)
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Tasks in `in_progress` whose `started_at` is older than the timeout.
    pub fn get_stale_in_progress_tasks(&self, timeout_seconds: u64) -> Vec<StaleTask> {
        let now = Utc::now();
        let timeout = Duration::seconds(timeout_seconds as i64);
        self.snapshot()
            .tasks
            .iter()
            .filter_map(|(id, t)| {
                if t.status != TaskStatus::InProgress {
                    return None;
                }
                let started = t.started_at?;
                let elapsed = now - started;
                (elapsed > timeout).then(|| StaleTask {
                    task_id: id.clone(),
                    worker_id: t.worker_id,
                    elapsed_seconds: elapsed.num_seconds(),
                })
            })
            .collect()
    }

    /// Ids of permanently failed tasks.
    pub fn get_failed_tasks(&self) -> Vec<String> {
        self.snapshot()
            .tasks
            .iter()
            .filter(|(_, t)| t.status == TaskStatus::Failed)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Ids of completed tasks (dependency satisfaction input).
    pub fn completed_task_ids(&self) -> HashSet<String> {
        self.snapshot()
            .tasks
            .iter()
            .filter(|(_, t)| t.status == TaskStatus::Complete)
            .map(|(id, _)| id.clone())
            .collect()
    }
}
