//! Task retry management: backoff scheduling, retry-ready requeue, stale
//! task reaping, and the permanent-failure policy.

use std::sync::Arc;

use chrono::{Duration, Utc};
use parking_lot::Mutex;
use serde_json::json;

use zerg_state::{StateError, StateStore, TaskStatus};

use crate::backoff::calculate_delay;
use crate::config::WorkersConfig;
use crate::levels::LevelController;
use crate::logs::{LogEvent, LogFields, LogLevel, StructuredLogWriter};

/// Encapsulates all retry-related behavior for one feature.
pub struct TaskRetryManager {
    config: WorkersConfig,
    store: StateStore,
    levels: Arc<Mutex<LevelController>>,
    writer: Option<Arc<StructuredLogWriter>>,
}

impl TaskRetryManager {
    pub fn new(
        config: WorkersConfig,
        store: StateStore,
        levels: Arc<Mutex<LevelController>>,
        writer: Option<Arc<StructuredLogWriter>>,
    ) -> Self {
        Self {
            config,
            store,
            levels,
            writer,
        }
    }

    /// Requeue tasks whose backoff has elapsed. Returns the requeued ids.
    ///
    /// A requeued task drops its previous worker assignment so any live
    /// worker can claim it.
    pub fn check_retry_ready_tasks(&self) -> Result<Vec<String>, StateError> {
        let ready = self.store.get_tasks_ready_for_retry();
        for task_id in &ready {
            tracing::info!(task_id, "backoff elapsed, requeueing for retry");
            let id = task_id.clone();
            self.store.atomic_update(move |doc| {
                if let Some(task) = doc.tasks.get_mut(&id) {
                    task.status = TaskStatus::Pending;
                    task.next_retry_at = None;
                    task.worker_id = None;
                }
                doc.push_event("task_retry_ready", json!({"task_id": id}));
            })?;
            self.levels.lock().reset_task(task_id);
        }
        Ok(ready)
    }

    /// Reap tasks stuck in `in_progress` past the stale timeout, treating
    /// each as an implicit failure. Returns the ids scheduled for retry.
    pub fn check_stale_tasks(
        &self,
        timeout_override: Option<u64>,
    ) -> Result<Vec<String>, StateError> {
        let timeout_seconds =
            timeout_override.unwrap_or(self.config.task_stale_timeout_seconds);
        let stale = self.store.get_stale_in_progress_tasks(timeout_seconds);
        let mut requeued = Vec::new();

        for task in stale {
            tracing::warn!(
                task_id = %task.task_id,
                elapsed = task.elapsed_seconds,
                timeout = timeout_seconds,
                worker_id = ?task.worker_id,
                "task stale"
            );
            self.store.append_event(
                "task_stale_detected",
                json!({
                    "task_id": task.task_id,
                    "worker_id": task.worker_id,
                    "elapsed_seconds": task.elapsed_seconds,
                    "timeout_seconds": timeout_seconds,
                }),
            )?;
            if let Some(writer) = &self.writer {
                writer.emit(
                    LogLevel::Warn,
                    &format!(
                        "Task {} timed out after {}s",
                        task.task_id, task.elapsed_seconds
                    ),
                    LogFields::task(&task.task_id)
                        .event(LogEvent::TaskFailed)
                        .data(json!({
                            "worker_id": task.worker_id,
                            "elapsed_seconds": task.elapsed_seconds,
                            "reason": "stale_timeout",
                        })),
                );
            }

            let error = format!(
                "Task stale: in_progress for {}s exceeds {}s timeout",
                task.elapsed_seconds, timeout_seconds
            );
            let scheduled = self.handle_task_failure(
                &task.task_id,
                task.worker_id.unwrap_or(0),
                &error,
            )?;
            if scheduled {
                requeued.push(task.task_id);
            }
        }

        if !requeued.is_empty() {
            tracing::info!(count = requeued.len(), "requeued stale tasks for retry");
        }
        Ok(requeued)
    }

    /// Apply the retry policy to a failed task.
    ///
    /// Below the retry budget: schedule a backoff retry and move the task to
    /// `waiting_retry`, returning `true`. At the budget: mark it permanently
    /// failed, returning `false`.
    pub fn handle_task_failure(
        &self,
        task_id: &str,
        worker_id: u32,
        error: &str,
    ) -> Result<bool, StateError> {
        let retry_count = self.store.get_task_retry_count(task_id);

        if retry_count < self.config.retry_attempts {
            let delay = calculate_delay(
                retry_count + 1,
                self.config.backoff_strategy,
                self.config.backoff_base_seconds,
                self.config.backoff_max_seconds,
            );
            let next_retry_at = Utc::now() + Duration::milliseconds((delay * 1000.0) as i64);
            let new_count = self.store.increment_task_retry(task_id, next_retry_at)?;
            tracing::warn!(
                task_id,
                attempt = new_count,
                max = self.config.retry_attempts,
                delay_seconds = delay as u64,
                error,
                "task failed, retry scheduled"
            );
            self.store
                .set_task_status(task_id, TaskStatus::WaitingRetry, None, Some(error))?;
            self.store.append_event(
                "task_retry_scheduled",
                json!({
                    "task_id": task_id,
                    "worker_id": worker_id,
                    "retry_count": new_count,
                    "backoff_seconds": delay.round() as u64,
                    "next_retry_at": next_retry_at,
                    "error": error,
                }),
            )?;
            if let Some(writer) = &self.writer {
                writer.emit(
                    LogLevel::Warn,
                    &format!("Task {task_id} retry {new_count} scheduled in {delay:.0}s"),
                    LogFields::task(task_id)
                        .event(LogEvent::TaskFailed)
                        .data(json!({"backoff_seconds": delay.round() as u64})),
                );
            }
            Ok(true)
        } else {
            tracing::error!(task_id, retry_count, error, "task failed permanently");
            self.levels.lock().mark_task_failed(task_id, Some(error));
            self.store.set_task_status(
                task_id,
                TaskStatus::Failed,
                Some(worker_id),
                Some(&format!("Failed after {retry_count} retries: {error}")),
            )?;
            self.store.append_event(
                "task_failed_permanent",
                json!({
                    "task_id": task_id,
                    "worker_id": worker_id,
                    "retry_count": retry_count,
                    "error": error,
                }),
            )?;
            Ok(false)
        }
    }

    /// Manually retry a permanently failed task: reset the retry budget and
    /// requeue. Returns `false` when the task is not in `failed`.
    pub fn retry_task(&self, task_id: &str) -> Result<bool, StateError> {
        let status = self.store.get_task_status(task_id);
        if status != Some(TaskStatus::Failed) {
            tracing::warn!(task_id, ?status, "task is not failed, cannot retry");
            return Ok(false);
        }
        self.store.reset_task_retry(task_id)?;
        let id = task_id.to_owned();
        self.store.atomic_update(move |doc| {
            if let Some(task) = doc.tasks.get_mut(&id) {
                task.status = TaskStatus::Pending;
                task.worker_id = None;
                task.error = None;
            }
            doc.push_event("task_manual_retry", json!({"task_id": id}));
        })?;
        self.levels.lock().reset_task(task_id);
        tracing::info!(task_id, "task queued for retry");
        Ok(true)
    }

    /// Retry every permanently failed task. Returns the requeued ids.
    pub fn retry_all_failed(&self) -> Result<Vec<String>, StateError> {
        let failed = self.store.get_failed_tasks();
        let mut retried = Vec::new();
        for task_id in failed {
            if self.retry_task(&task_id)? {
                retried.push(task_id);
            }
        }
        tracing::info!(count = retried.len(), "queued failed tasks for retry");
        Ok(retried)
    }
}
