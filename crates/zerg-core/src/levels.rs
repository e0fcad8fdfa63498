//! Level-based execution control.
//!
//! In-memory view of which tasks belong to which level and how far each
//! level has progressed. Enforces the rule that level N+1 cannot start until
//! level N is resolved (every task terminal). Failed tasks do not block
//! resolution; the orchestrator surfaces them as warnings and proceeds.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use thiserror::Error;

use zerg_state::{TaskStatus, level_name};

/// Errors from level transitions.
#[derive(Debug, Error)]
pub enum LevelError {
    #[error("level {0} does not exist")]
    UnknownLevel(u32),

    #[error("cannot start level {level}: level {blocking_level} not resolved")]
    PriorLevelUnresolved { level: u32, blocking_level: u32 },
}

/// Progress counters for one level.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelProgress {
    pub level: u32,
    pub name: String,
    pub total_tasks: u32,
    pub completed_tasks: u32,
    pub failed_tasks: u32,
    pub in_progress_tasks: u32,
    pub status: zerg_state::LevelRunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl LevelProgress {
    fn new(level: u32, total_tasks: u32) -> Self {
        Self {
            level,
            name: level_name(level),
            total_tasks,
            completed_tasks: 0,
            failed_tasks: 0,
            in_progress_tasks: 0,
            status: zerg_state::LevelRunStatus::Pending,
            started_at: None,
            completed_at: None,
        }
    }

    /// Every task is terminal (complete or failed).
    pub fn is_resolved(&self) -> bool {
        self.completed_tasks + self.failed_tasks == self.total_tasks
    }
}

#[derive(Debug, Clone)]
struct TrackedTask {
    level: u32,
    status: TaskStatus,
    assigned_worker: Option<u32>,
}

/// Tracks task completion within levels and controls level transitions.
#[derive(Debug, Default)]
pub struct LevelController {
    levels: HashMap<u32, LevelProgress>,
    tasks: HashMap<String, TrackedTask>,
    current_level: u32,
    started: bool,
}

impl LevelController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index tasks and build per-level totals. Resets any prior state.
    pub fn initialize<'a>(&mut self, tasks: impl IntoIterator<Item = (&'a str, u32)>) {
        self.tasks.clear();
        self.levels.clear();
        self.current_level = 0;
        self.started = false;

        let mut level_totals: HashMap<u32, u32> = HashMap::new();
        for (task_id, level) in tasks {
            self.tasks.insert(
                task_id.to_owned(),
                TrackedTask {
                    level,
                    status: TaskStatus::Todo,
                    assigned_worker: None,
                },
            );
            *level_totals.entry(level).or_default() += 1;
        }

        for (level, total) in level_totals {
            self.levels.insert(level, LevelProgress::new(level, total));
        }

        tracing::info!(
            tasks = self.tasks.len(),
            levels = self.levels.len(),
            "level controller initialized"
        );
    }

    /// Start a level. Requires every earlier level to be resolved. Returns
    /// the task ids in the level.
    pub fn start_level(&mut self, level: u32) -> Result<Vec<String>, LevelError> {
        if !self.levels.contains_key(&level) {
            return Err(LevelError::UnknownLevel(level));
        }
        for prior in 1..level {
            if let Some(progress) = self.levels.get(&prior) {
                if !progress.is_resolved() {
                    return Err(LevelError::PriorLevelUnresolved {
                        level,
                        blocking_level: prior,
                    });
                }
            }
        }

        let progress = self
            .levels
            .get_mut(&level)
            .ok_or(LevelError::UnknownLevel(level))?;
        progress.status = zerg_state::LevelRunStatus::Running;
        progress.started_at = Some(Utc::now());
        self.current_level = level;
        self.started = true;

        let task_ids = self.tasks_for_level(level);
        tracing::info!(
            level,
            name = %level_name(level),
            tasks = task_ids.len(),
            "started level"
        );
        Ok(task_ids)
    }

    /// All task ids at a level.
    pub fn tasks_for_level(&self, level: u32) -> Vec<String> {
        let mut ids: Vec<String> = self
            .tasks
            .iter()
            .filter(|(_, t)| t.level == level)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Task ids at a level still in `todo` or `pending`.
    pub fn pending_tasks_for_level(&self, level: u32) -> Vec<String> {
        let mut ids: Vec<String> = self
            .tasks
            .iter()
            .filter(|(_, t)| {
                t.level == level
                    && matches!(t.status, TaskStatus::Todo | TaskStatus::Pending)
            })
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Mark a task complete. Returns `true` when this resolves the level.
    pub fn mark_task_complete(&mut self, task_id: &str) -> bool {
        let Some(task) = self.tasks.get_mut(task_id) else {
            tracing::warn!(task_id, "unknown task");
            return false;
        };
        let was_in_progress = matches!(
            task.status,
            TaskStatus::InProgress | TaskStatus::Claimed | TaskStatus::Verifying
        );
        task.status = TaskStatus::Complete;
        let level = task.level;

        if let Some(progress) = self.levels.get_mut(&level) {
            progress.completed_tasks += 1;
            if was_in_progress {
                progress.in_progress_tasks = progress.in_progress_tasks.saturating_sub(1);
            }
        }
        tracing::info!(task_id, "task complete");

        if self.is_level_resolved(level) {
            if let Some(progress) = self.levels.get_mut(&level) {
                progress.status = zerg_state::LevelRunStatus::Complete;
                progress.completed_at = Some(Utc::now());
            }
            tracing::info!(level, "level resolved");
            return true;
        }
        false
    }

    /// Mark a task failed. The level's failed counter absorbs it.
    pub fn mark_task_failed(&mut self, task_id: &str, error: Option<&str>) {
        let Some(task) = self.tasks.get_mut(task_id) else {
            tracing::warn!(task_id, "unknown task");
            return;
        };
        let was_in_progress = matches!(
            task.status,
            TaskStatus::InProgress | TaskStatus::Claimed | TaskStatus::Verifying
        );
        task.status = TaskStatus::Failed;
        let level = task.level;

        if let Some(progress) = self.levels.get_mut(&level) {
            progress.failed_tasks += 1;
            if was_in_progress {
                progress.in_progress_tasks = progress.in_progress_tasks.saturating_sub(1);
            }
        }
        tracing::error!(task_id, error = error.unwrap_or("unknown error"), "task failed");
    }

    /// Mark a task in progress, optionally recording the worker.
    pub fn mark_task_in_progress(&mut self, task_id: &str, worker_id: Option<u32>) {
        let Some(task) = self.tasks.get_mut(task_id) else {
            return;
        };
        let already = matches!(
            task.status,
            TaskStatus::InProgress | TaskStatus::Claimed | TaskStatus::Verifying
        );
        task.status = TaskStatus::InProgress;
        if worker_id.is_some() {
            task.assigned_worker = worker_id;
        }
        let level = task.level;
        if !already {
            if let Some(progress) = self.levels.get_mut(&level) {
                progress.in_progress_tasks += 1;
            }
        }
        tracing::debug!(task_id, ?worker_id, "task in progress");
    }

    /// Reset a task to `pending`, rolling back whichever counter its old
    /// status contributed to.
    pub fn reset_task(&mut self, task_id: &str) {
        let Some(task) = self.tasks.get_mut(task_id) else {
            return;
        };
        let old_status = task.status;
        task.status = TaskStatus::Pending;
        task.assigned_worker = None;
        let level = task.level;

        if let Some(progress) = self.levels.get_mut(&level) {
            match old_status {
                TaskStatus::Complete => {
                    progress.completed_tasks = progress.completed_tasks.saturating_sub(1);
                    // A reset complete task un-resolves the level.
                    if progress.status == zerg_state::LevelRunStatus::Complete {
                        progress.status = zerg_state::LevelRunStatus::Running;
                        progress.completed_at = None;
                    }
                }
                TaskStatus::Failed => {
                    progress.failed_tasks = progress.failed_tasks.saturating_sub(1);
                }
                TaskStatus::InProgress | TaskStatus::Claimed | TaskStatus::Verifying => {
                    progress.in_progress_tasks =
                        progress.in_progress_tasks.saturating_sub(1);
                }
                _ => {}
            }
        }
        tracing::info!(task_id, "reset task to pending");
    }

    /// All tasks completed successfully.
    pub fn is_level_complete(&self, level: u32) -> bool {
        self.levels
            .get(&level)
            .is_some_and(|p| p.completed_tasks == p.total_tasks)
    }

    /// All tasks terminal (complete or failed).
    pub fn is_level_resolved(&self, level: u32) -> bool {
        self.levels.get(&level).is_some_and(LevelProgress::is_resolved)
    }

    /// Current level resolved and a next level exists. Before the first
    /// level starts this answers whether any level exists.
    pub fn can_advance(&self) -> bool {
        if !self.started || self.current_level == 0 {
            return !self.levels.is_empty();
        }
        if !self.is_level_resolved(self.current_level) {
            return false;
        }
        self.levels.contains_key(&(self.current_level + 1))
    }

    /// Advance to the next level (the lowest level when not yet started).
    /// Returns the new level number, or `None` when no levels remain.
    pub fn advance_level(&mut self) -> Result<Option<u32>, LevelError> {
        let next = if self.started {
            self.current_level + 1
        } else {
            match self.levels.keys().min() {
                Some(&min) => min,
                None => return Ok(None),
            }
        };

        if !self.levels.contains_key(&next) {
            tracing::info!("no more levels to advance to");
            return Ok(None);
        }

        self.start_level(next)?;
        Ok(Some(next))
    }

    pub fn current_level(&self) -> u32 {
        self.current_level
    }

    pub fn total_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn level_progress(&self, level: u32) -> Option<&LevelProgress> {
        self.levels.get(&level)
    }

    /// Status of a task, if tracked.
    pub fn task_status(&self, task_id: &str) -> Option<TaskStatus> {
        self.tasks.get(task_id).map(|t| t.status)
    }

    /// Worker assigned to a task, if any.
    pub fn task_worker(&self, task_id: &str) -> Option<u32> {
        self.tasks.get(task_id).and_then(|t| t.assigned_worker)
    }

    /// Level of a task, if tracked.
    pub fn task_level(&self, task_id: &str) -> Option<u32> {
        self.tasks.get(task_id).map(|t| t.level)
    }

    /// Every level resolved.
    pub fn all_levels_resolved(&self) -> bool {
        self.levels.values().all(LevelProgress::is_resolved)
    }

    /// Any task permanently failed.
    pub fn any_failed(&self) -> bool {
        self.levels.values().any(|p| p.failed_tasks > 0)
    }

    /// Recompute a level's counters from tracked task statuses. Used by the
    /// reconciler after fixing divergences.
    pub fn recount_level(&mut self, level: u32) {
        let (mut completed, mut failed, mut in_progress) = (0u32, 0u32, 0u32);
        for task in self.tasks.values().filter(|t| t.level == level) {
            match task.status {
                TaskStatus::Complete => completed += 1,
                TaskStatus::Failed => failed += 1,
                TaskStatus::InProgress | TaskStatus::Claimed | TaskStatus::Verifying => {
                    in_progress += 1
                }
                _ => {}
            }
        }
        if let Some(progress) = self.levels.get_mut(&level) {
            progress.completed_tasks = completed;
            progress.failed_tasks = failed;
            progress.in_progress_tasks = in_progress;
        }
    }

    /// Re-create a missing level record from tracked tasks. Returns whether
    /// a record was created.
    pub fn ensure_level(&mut self, level: u32) -> bool {
        if self.levels.contains_key(&level) {
            return false;
        }
        let total = self.tasks.values().filter(|t| t.level == level).count() as u32;
        if total == 0 {
            return false;
        }
        self.levels.insert(level, LevelProgress::new(level, total));
        self.recount_level(level);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> LevelController {
        let mut c = LevelController::new();
        c.initialize([("T1", 1), ("T2", 1), ("T3", 2)]);
        c
    }

    #[test]
    fn initialize_builds_level_totals() {
        let c = controller();
        assert_eq!(c.total_levels(), 2);
        assert_eq!(c.level_progress(1).unwrap().total_tasks, 2);
        assert_eq!(c.level_progress(2).unwrap().total_tasks, 1);
        assert_eq!(c.level_progress(1).unwrap().name, "foundation");
        assert_eq!(c.current_level(), 0);
    }

    #[test]
    fn start_level_requires_prior_resolution() {
        let mut c = controller();
        let err = c.start_level(2).unwrap_err();
        assert!(matches!(
            err,
            LevelError::PriorLevelUnresolved {
                level: 2,
                blocking_level: 1
            }
        ));

        let ids = c.start_level(1).unwrap();
        assert_eq!(ids, vec!["T1".to_string(), "T2".to_string()]);
        assert_eq!(c.current_level(), 1);
    }

    #[test]
    fn unknown_level_rejected() {
        let mut c = controller();
        assert!(matches!(c.start_level(9), Err(LevelError::UnknownLevel(9))));
    }

    #[test]
    fn completion_resolves_level_and_signals() {
        let mut c = controller();
        c.start_level(1).unwrap();
        c.mark_task_in_progress("T1", Some(0));
        c.mark_task_in_progress("T2", Some(1));

        assert!(!c.mark_task_complete("T1"));
        assert!(!c.is_level_resolved(1));
        assert!(c.mark_task_complete("T2"), "second completion resolves");
        assert!(c.is_level_complete(1));
        assert_eq!(c.level_progress(1).unwrap().in_progress_tasks, 0);
        assert!(c.level_progress(1).unwrap().completed_at.is_some());
    }

    #[test]
    fn failed_tasks_resolve_but_do_not_complete() {
        let mut c = controller();
        c.start_level(1).unwrap();
        c.mark_task_complete("T1");
        c.mark_task_failed("T2", Some("verification failed"));

        assert!(c.is_level_resolved(1), "failure counts toward resolution");
        assert!(!c.is_level_complete(1), "failure blocks completion");
        assert!(c.any_failed());
    }

    #[test]
    fn can_advance_and_advance_level() {
        let mut c = controller();
        assert!(c.can_advance(), "can start the first level");

        assert_eq!(c.advance_level().unwrap(), Some(1));
        assert!(!c.can_advance(), "level 1 unresolved");

        c.mark_task_complete("T1");
        c.mark_task_complete("T2");
        assert!(c.can_advance());
        assert_eq!(c.advance_level().unwrap(), Some(2));

        c.mark_task_complete("T3");
        assert_eq!(c.advance_level().unwrap(), None, "no level 3");
        assert!(c.all_levels_resolved());
    }

    #[test]
    fn reset_task_rolls_back_counters() {
        let mut c = controller();
        c.start_level(1).unwrap();
        c.mark_task_complete("T1");
        assert_eq!(c.level_progress(1).unwrap().completed_tasks, 1);

        c.reset_task("T1");
        assert_eq!(c.level_progress(1).unwrap().completed_tasks, 0);
        assert_eq!(c.task_status("T1"), Some(TaskStatus::Pending));

        // Failed rollback too.
        c.mark_task_failed("T2", None);
        c.reset_task("T2");
        assert_eq!(c.level_progress(1).unwrap().failed_tasks, 0);

        // In-progress rollback.
        c.mark_task_in_progress("T1", Some(4));
        assert_eq!(c.task_worker("T1"), Some(4));
        c.reset_task("T1");
        assert_eq!(c.level_progress(1).unwrap().in_progress_tasks, 0);
        assert_eq!(c.task_worker("T1"), None);
    }

    #[test]
    fn duplicate_in_progress_marks_count_once() {
        let mut c = controller();
        c.start_level(1).unwrap();
        c.mark_task_in_progress("T1", Some(0));
        c.mark_task_in_progress("T1", Some(0));
        assert_eq!(c.level_progress(1).unwrap().in_progress_tasks, 1);
    }

    #[test]
    fn recount_fixes_skewed_counters() {
        let mut c = controller();
        c.start_level(1).unwrap();
        c.mark_task_complete("T1");
        c.mark_task_failed("T2", None);

        // Skew the counters, then recount.
        if let Some(p) = c.levels.get_mut(&1) {
            p.completed_tasks = 9;
            p.in_progress_tasks = 9;
        }
        c.recount_level(1);
        let p = c.level_progress(1).unwrap();
        assert_eq!(p.completed_tasks, 1);
        assert_eq!(p.failed_tasks, 1);
        assert_eq!(p.in_progress_tasks, 0);
    }

    #[test]
    fn ensure_level_recreates_missing_record() {
        let mut c = controller();
        c.levels.remove(&2);
        assert!(c.ensure_level(2));
        assert_eq!(c.level_progress(2).unwrap().total_tasks, 1);
        assert!(!c.ensure_level(2), "already present");
        assert!(!c.ensure_level(42), "no tasks at that level");
    }
}
