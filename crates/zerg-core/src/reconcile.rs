//! State reconciliation: aligning the in-memory level controller with the
//! durable state, and repairing damage left by dead workers.
//!
//! Two modes: a light periodic pass (default every 60 s) and a thorough
//! pass before each level transition. Workers write their completions
//! straight to the shared state file, so the sync service is how those
//! completions become visible to orchestration.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;

use zerg_state::{StateError, StateStore, TaskStatus};

use crate::levels::LevelController;
use crate::retry::TaskRetryManager;

/// What a reconciliation pass observed and did.
#[derive(Debug, Clone, Default)]
pub struct ReconciliationResult {
    /// Tasks examined.
    pub checked: usize,
    /// Human-readable divergences between disk and memory.
    pub divergences: Vec<String>,
    /// Fixes applied (state was mutated).
    pub fixes: Vec<String>,
}

/// Compares disk truth against the in-memory controller and repairs
/// critical divergences.
pub struct StateReconciler {
    store: StateStore,
    levels: Arc<Mutex<LevelController>>,
}

impl StateReconciler {
    pub fn new(store: StateStore, levels: Arc<Mutex<LevelController>>) -> Self {
        Self { store, levels }
    }

    /// Light periodic check: log divergences, reset in-progress tasks whose
    /// worker is dead, and re-create missing level records.
    pub fn reconcile_periodic(
        &self,
        active_worker_ids: &HashSet<u32>,
    ) -> Result<ReconciliationResult, StateError> {
        let doc = self.store.reload()?;
        let mut result = ReconciliationResult::default();
        let mut levels = self.levels.lock();

        for (task_id, task) in &doc.tasks {
            result.checked += 1;

            let memory_status = levels.task_status(task_id);
            if memory_status.is_some() && memory_status != Some(task.status) {
                result.divergences.push(format!(
                    "task {task_id}: disk={} memory={}",
                    task.status,
                    memory_status.map(|s| s.to_string()).unwrap_or_default(),
                ));
            }

            // In-progress with a dead (or missing) worker: reset to pending.
            let in_flight = matches!(
                task.status,
                TaskStatus::InProgress | TaskStatus::Claimed
            );
            let worker_dead = task
                .worker_id
                .map(|id| !active_worker_ids.contains(&id))
                .unwrap_or(true);
            if in_flight && worker_dead {
                let id = task_id.clone();
                let worker = task.worker_id;
                self.store.atomic_update(move |doc| {
                    if let Some(task) = doc.tasks.get_mut(&id) {
                        task.status = TaskStatus::Pending;
                        task.worker_id = None;
                    }
                    doc.push_event(
                        "state_reconcile_fix",
                        json!({
                            "task_id": id,
                            "reason": "dead_worker",
                            "worker_id": worker,
                        }),
                    );
                })?;
                levels.reset_task(task_id);
                result.fixes.push(format!(
                    "task {task_id}: reset from dead worker {:?}",
                    task.worker_id
                ));
                tracing::warn!(
                    task_id,
                    worker_id = ?task.worker_id,
                    "reset in-progress task with dead worker"
                );
            }
        }

        // Re-create level records the controller lost.
        let task_levels: HashSet<u32> = doc.tasks.values().map(|t| t.level).collect();
        for level in task_levels {
            if levels.ensure_level(level) {
                result.fixes.push(format!("level {level}: record re-created"));
                tracing::warn!(level, "re-created missing level record");
            }
        }

        if !result.divergences.is_empty() {
            tracing::info!(
                divergences = result.divergences.len(),
                fixes = result.fixes.len(),
                "periodic reconciliation found divergences"
            );
        }
        Ok(result)
    }

    /// Thorough pass before advancing from `level`: reap in-progress tasks
    /// owned by dead workers through the retry manager, then recompute the
    /// level's counters.
    pub fn reconcile_level_transition(
        &self,
        level: u32,
        active_worker_ids: &HashSet<u32>,
        retry: &TaskRetryManager,
    ) -> Result<ReconciliationResult, StateError> {
        let doc = self.store.reload()?;
        let mut result = ReconciliationResult::default();

        for (task_id, task) in &doc.tasks {
            if task.level != level {
                continue;
            }
            result.checked += 1;
            if !task.status.is_terminal() {
                result
                    .divergences
                    .push(format!("task {task_id}: non-terminal ({})", task.status));
            }

            let in_flight = matches!(
                task.status,
                TaskStatus::InProgress | TaskStatus::Claimed
            );
            let worker_dead = task
                .worker_id
                .map(|id| !active_worker_ids.contains(&id))
                .unwrap_or(true);
            if in_flight && worker_dead {
                let error = format!(
                    "worker {:?} died before completing task at level {level}",
                    task.worker_id
                );
                retry.handle_task_failure(task_id, task.worker_id.unwrap_or(0), &error)?;
                result
                    .fixes
                    .push(format!("task {task_id}: reaped from dead worker"));
            }
        }

        self.levels.lock().recount_level(level);
        Ok(result)
    }
}

/// Synchronises the level controller with persisted task state and
/// reassigns tasks stranded on dead workers.
pub struct StateSyncService {
    store: StateStore,
    levels: Arc<Mutex<LevelController>>,
    reconciler: StateReconciler,
}

impl StateSyncService {
    pub fn new(store: StateStore, levels: Arc<Mutex<LevelController>>) -> Self {
        let reconciler = StateReconciler::new(store.clone(), Arc::clone(&levels));
        Self {
            store,
            levels,
            reconciler,
        }
    }

    /// Mirror disk task statuses into the level controller. Idempotent:
    /// already-synced tasks are left alone.
    pub fn sync_from_disk(&self) -> Result<(), StateError> {
        let doc = self.store.reload()?;
        let mut levels = self.levels.lock();

        for (task_id, task) in &doc.tasks {
            let memory = levels.task_status(task_id);
            match task.status {
                TaskStatus::Complete if memory != Some(TaskStatus::Complete) => {
                    levels.mark_task_complete(task_id);
                    tracing::info!(task_id, "synced completion from disk");
                }
                TaskStatus::Failed if memory != Some(TaskStatus::Failed) => {
                    levels.mark_task_failed(task_id, task.error.as_deref());
                    tracing::info!(task_id, "synced failure from disk");
                }
                TaskStatus::InProgress | TaskStatus::Claimed => {
                    let in_flight = matches!(
                        memory,
                        Some(TaskStatus::InProgress)
                            | Some(TaskStatus::Claimed)
                            | Some(TaskStatus::Verifying)
                    );
                    if !in_flight {
                        levels.mark_task_in_progress(task_id, task.worker_id);
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Clear worker assignments from claimable tasks whose worker is not in
    /// the active set, so a live worker can claim them.
    pub fn reassign_stranded_tasks(
        &self,
        active_worker_ids: &HashSet<u32>,
    ) -> Result<Vec<String>, StateError> {
        let active = active_worker_ids.clone();
        self.store.atomic_update(move |doc| {
            let mut reassigned = Vec::new();
            for (task_id, task) in doc.tasks.iter_mut() {
                let stranded = task.status.is_claimable()
                    && task
                        .worker_id
                        .is_some_and(|id| !active.contains(&id));
                if stranded {
                    let worker = task.worker_id.take();
                    tracing::info!(
                        task_id,
                        worker_id = ?worker,
                        "reassigned stranded task"
                    );
                    reassigned.push((task_id.clone(), worker));
                }
            }
            for (task_id, worker) in &reassigned {
                doc.push_event(
                    "worker_reassigned",
                    json!({"task_id": task_id, "worker_id": worker}),
                );
            }
            reassigned.into_iter().map(|(id, _)| id).collect()
        })
    }

    pub fn reconcile_periodic(
        &self,
        active_worker_ids: &HashSet<u32>,
    ) -> Result<ReconciliationResult, StateError> {
        self.reconciler.reconcile_periodic(active_worker_ids)
    }

    pub fn reconcile_level_transition(
        &self,
        level: u32,
        active_worker_ids: &HashSet<u32>,
        retry: &TaskRetryManager,
    ) -> Result<ReconciliationResult, StateError> {
        self.reconciler
            .reconcile_level_transition(level, active_worker_ids, retry)
    }
}
