//! The orchestrator main loop.
//!
//! Drives a feature build to completion: advance levels, dispatch ready
//! tasks to workers, reconcile state, reap stale work, and trigger the
//! level merge when a level resolves. Worker processes communicate with the
//! loop exclusively through the shared filesystem (state JSON, heartbeat
//! files, branch tips).

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use zerg_state::{
    ExitCode, LevelRunStatus, StateStore, TaskStatus, WorkerStatus, validate_feature_name,
};

use crate::config::ZergConfig;
use crate::git::worker_branch_name;
use crate::graph::TaskGraph;
use crate::heartbeat::HeartbeatMonitor;
use crate::launcher::{SpawnRequest, WorkerLauncher};
use crate::levels::LevelController;
use crate::logs::{LogEvent, LogFields, LogLevel, StructuredLogWriter, WriterId};
use crate::merge::{MergeCoordinator, MergeFlowResult};
use crate::ports::PortAllocator;
use crate::reconcile::StateSyncService;
use crate::retry::TaskRetryManager;
use crate::worktree::WorktreeManager;

/// Callback invoked after each successful level merge.
pub type LevelCompleteCallback = Box<dyn Fn(u32, &MergeFlowResult) + Send + Sync>;

/// Everything the orchestrator needs to run one feature build.
pub struct Orchestrator {
    config: ZergConfig,
    feature: String,
    graph: TaskGraph,
    store: StateStore,
    levels: Arc<Mutex<LevelController>>,
    retry: TaskRetryManager,
    sync: StateSyncService,
    merge: MergeCoordinator,
    launcher: Arc<dyn WorkerLauncher>,
    worktrees: Option<WorktreeManager>,
    repo_root: PathBuf,
    ports: PortAllocator,
    heartbeats: HeartbeatMonitor,
    writer: Option<Arc<StructuredLogWriter>>,
    stop_file: PathBuf,
    cancel: CancellationToken,
    callbacks: Vec<LevelCompleteCallback>,
}

impl Orchestrator {
    /// Build an orchestrator. `worktrees` of `None` runs every worker in
    /// the repository root (single-tree mode, used by tests).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ZergConfig,
        feature: &str,
        graph: TaskGraph,
        store: StateStore,
        merge: MergeCoordinator,
        launcher: Arc<dyn WorkerLauncher>,
        worktrees: Option<WorktreeManager>,
        repo_root: PathBuf,
    ) -> Result<Self> {
        validate_feature_name(feature).context("invalid feature name")?;

        let levels = Arc::new(Mutex::new(LevelController::new()));
        let writer = StructuredLogWriter::new(
            repo_root.join(&config.directories.logs),
            WriterId::Orchestrator,
            feature,
            config.logging.max_size_mb,
        )
        .ok()
        .map(Arc::new);

        let retry = TaskRetryManager::new(
            config.workers.clone(),
            store.clone(),
            Arc::clone(&levels),
            writer.clone(),
        );
        let sync = StateSyncService::new(store.clone(), Arc::clone(&levels));
        let ports = PortAllocator::new(&config.ports);
        let heartbeat_dir = repo_root.join(&config.directories.logs).join("heartbeats");
        let heartbeats = HeartbeatMonitor::new(
            heartbeat_dir,
            config.workers.heartbeat_stale_seconds,
            config.workers.heartbeat_stalled_seconds,
        );
        let stop_file = repo_root
            .join(&config.directories.state)
            .join(format!("{feature}.stop"));

        Ok(Self {
            config,
            feature: feature.to_owned(),
            graph,
            store,
            levels,
            retry,
            sync,
            merge,
            launcher,
            worktrees,
            repo_root,
            ports,
            heartbeats,
            writer,
            stop_file,
            cancel: CancellationToken::new(),
            callbacks: Vec::new(),
        })
    }

    /// Token that cancels the run from another task.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Register a callback invoked after each successful level merge.
    pub fn on_level_complete(&mut self, callback: LevelCompleteCallback) {
        self.callbacks.push(callback);
    }

    /// Run the build to completion (or pause / cancellation).
    pub async fn run(&mut self) -> Result<ExitCode> {
        self.initialize()?;

        let tick = Duration::from_millis(self.config.orchestrator.tick_interval_ms);
        let reconcile_every =
            Duration::from_secs(self.config.orchestrator.reconcile_interval_seconds);
        let mut last_reconcile = tokio::time::Instant::now();

        loop {
            // Stop requests win over everything else.
            if self.cancel.is_cancelled() || self.stop_file.exists() {
                return self.shutdown().await;
            }

            if self.store.is_paused() {
                tokio::time::sleep(tick).await;
                let _ = self.store.reload();
                continue;
            }

            self.sync.sync_from_disk()?;

            let active = self.active_worker_ids().await;
            if last_reconcile.elapsed() >= reconcile_every {
                self.declare_stalled_workers()?;
                self.sync.reconcile_periodic(&active)?;
                last_reconcile = tokio::time::Instant::now();
            }

            self.retry.check_retry_ready_tasks()?;
            self.retry.check_stale_tasks(None)?;

            let current = self.levels.lock().current_level();
            let resolved = current > 0 && self.levels.lock().is_level_resolved(current);

            if resolved {
                match self.complete_level(current, &active).await? {
                    LevelOutcome::Advanced => {}
                    LevelOutcome::Finished => return self.finish().await,
                    LevelOutcome::Paused(code) => return Ok(code),
                }
                continue;
            }

            self.dispatch_ready_tasks().await?;

            tokio::select! {
                () = tokio::time::sleep(tick) => {}
                () = self.cancel.cancelled() => {}
            }
        }
    }

    /// Seed state, initialize the level controller, and start level 1.
    fn initialize(&mut self) -> Result<()> {
        let task_levels: Vec<(String, u32)> = self
            .graph
            .tasks()
            .iter()
            .map(|t| (t.id.clone(), t.level))
            .collect();

        self.store
            .register_tasks(task_levels.iter().map(|(id, level)| (id.as_str(), *level)))?;
        for level in self.graph.levels() {
            self.store.init_level(level)?;
        }
        self.levels
            .lock()
            .initialize(task_levels.iter().map(|(id, level)| (id.as_str(), *level)));

        self.store.append_event(
            "rush_started",
            json!({
                "feature": self.feature,
                "tasks": self.graph.tasks().len(),
                "levels": self.graph.level_count(),
            }),
        )?;

        let first = self
            .levels
            .lock()
            .advance_level()
            .context("failed to start first level")?;
        if let Some(level) = first {
            self.begin_level(level)?;
        }
        Ok(())
    }

    /// Mark a level running and its tasks eligible for claiming.
    fn begin_level(&self, level: u32) -> Result<()> {
        self.store.set_current_level(level)?;
        self.store.set_level_status(level, LevelRunStatus::Running)?;
        for task in self.graph.level_tasks(level) {
            if self.store.get_task_status(&task.id) == Some(TaskStatus::Todo) {
                self.store
                    .set_task_status(&task.id, TaskStatus::Pending, None, None)?;
            }
        }
        self.emit(
            LogLevel::Info,
            &format!("Level {level} started"),
            LogFields::default()
                .event(LogEvent::LevelStarted)
                .data(json!({"level": level})),
        );
        Ok(())
    }

    /// Mark workers whose heartbeat crossed the stalled threshold.
    fn declare_stalled_workers(&self) -> Result<()> {
        for worker_id in self.heartbeats.stalled_worker_ids() {
            let already = self
                .store
                .get_workers()
                .get(&worker_id)
                .map(|w| w.status == WorkerStatus::Stalled)
                .unwrap_or(true);
            if already {
                continue;
            }
            tracing::warn!(worker_id, "worker declared stalled");
            self.store
                .update_worker_status(worker_id, WorkerStatus::Stalled)?;
            self.store.append_event(
                "heartbeat_stale",
                json!({"worker_id": worker_id, "declared": "stalled"}),
            )?;
            self.emit(
                LogLevel::Warn,
                &format!("Worker {worker_id} stalled"),
                LogFields::default()
                    .event(LogEvent::HeartbeatStale)
                    .data(json!({"worker_id": worker_id})),
            );
        }
        Ok(())
    }

    /// Workers currently considered alive: launcher-live union
    /// heartbeat-fresh.
    async fn active_worker_ids(&self) -> HashSet<u32> {
        let mut active = self.heartbeats.active_worker_ids();
        for (id, _) in self.launcher.get_all_workers().await {
            if self.launcher.monitor(id).await.is_alive() {
                active.insert(id);
            }
        }
        active
    }

    /// Resolve a finished level: reconcile, merge, advance (or finish).
    async fn complete_level(
        &mut self,
        level: u32,
        active: &HashSet<u32>,
    ) -> Result<LevelOutcome> {
        self.sync
            .reconcile_level_transition(level, active, &self.retry)?;

        // Reconciliation may have reopened tasks (reaped stragglers).
        if !self.levels.lock().is_level_resolved(level) {
            return Ok(LevelOutcome::Advanced);
        }

        let failed = self.levels.lock().level_progress(level).map(|p| p.failed_tasks);
        if let Some(failed) = failed {
            if failed > 0 {
                tracing::warn!(level, failed, "level resolved with failed tasks");
            }
        }

        let branches = self.merge.mergeable_branches().unwrap_or_default();
        self.emit(
            LogLevel::Info,
            &format!("Merging level {level}"),
            LogFields::default()
                .event(LogEvent::MergeStarted)
                .data(json!({"level": level, "branches": branches})),
        );

        let result = self
            .merge
            .full_merge_flow(
                level,
                Some(branches),
                &self.config.orchestrator.target_branch,
            )
            .await;

        if result.success {
            self.store.set_level_status(level, LevelRunStatus::Complete)?;
            self.store.append_event(
                "level_complete",
                json!({"level": level, "merge_commit": result.merge_commit}),
            )?;
            self.emit(
                LogLevel::Info,
                &format!("Level {level} complete"),
                LogFields::default()
                    .event(LogEvent::LevelComplete)
                    .data(json!({"level": level, "merge_commit": result.merge_commit})),
            );
            for callback in &self.callbacks {
                callback(level, &result);
            }

            let next = self.levels.lock().advance_level()?;
            match next {
                Some(next) => {
                    self.begin_level(next)?;
                    Ok(LevelOutcome::Advanced)
                }
                None => Ok(LevelOutcome::Finished),
            }
        } else if result.is_conflict() {
            // Conflicts pause the build for human intervention.
            tracing::error!(
                level,
                files = ?result.conflicting_files,
                "merge conflict, pausing"
            );
            self.store.set_paused(true)?;
            self.store.append_event(
                "merge_conflict",
                json!({
                    "level": level,
                    "conflicting_files": result.conflicting_files,
                    "error": result.error,
                }),
            )?;
            Ok(LevelOutcome::Paused(ExitCode::Blocked))
        } else {
            let error = result
                .error
                .clone()
                .unwrap_or_else(|| "merge failed".to_owned());
            tracing::error!(level, error = %error, "merge failed, pausing");
            self.store.set_error(Some(&error))?;
            self.store.set_paused(true)?;
            self.store
                .append_event("merge_failed", json!({"level": level, "error": error}))?;
            Ok(LevelOutcome::Paused(ExitCode::Blocked))
        }
    }

    /// Dispatch ready tasks at the current level to available workers.
    async fn dispatch_ready_tasks(&self) -> Result<()> {
        let doc = self.store.snapshot();
        let current = doc.current_level;

        // The orchestrator advances on resolution, so a permanently failed
        // dependency satisfies readiness: downstream tasks still run and
        // their own verification decides their fate.
        let satisfied: HashSet<String> = doc
            .tasks
            .iter()
            .filter(|(_, t)| t.status.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();

        let in_flight: Vec<(String, Option<u32>)> = doc
            .tasks
            .iter()
            .filter(|(_, t)| {
                matches!(t.status, TaskStatus::Claimed | TaskStatus::InProgress)
            })
            .map(|(id, t)| (id.clone(), t.worker_id))
            .collect();
        let busy: HashSet<u32> = in_flight.iter().filter_map(|(_, w)| *w).collect();

        let capacity = self.config.workers.count as usize;
        let mut available = capacity.saturating_sub(in_flight.len());
        if available == 0 {
            return Ok(());
        }

        let ready: Vec<&crate::graph::TaskSpec> = self
            .graph
            .ready_tasks(&satisfied)
            .into_iter()
            .filter(|t| t.level == current)
            .filter(|t| {
                doc.tasks
                    .get(&t.id)
                    .map(|state| state.status.is_claimable())
                    .unwrap_or(false)
            })
            .collect();

        let mut next_worker = 0u32;
        let mut claimed_now: HashSet<u32> = HashSet::new();
        for task in ready {
            if available == 0 {
                break;
            }
            // Lowest free worker id.
            let worker_id = loop {
                if !busy.contains(&next_worker) && !claimed_now.contains(&next_worker) {
                    break next_worker;
                }
                next_worker += 1;
            };
            if worker_id >= self.config.workers.count {
                break;
            }

            if self.dispatch_task(&task.id, worker_id).await? {
                claimed_now.insert(worker_id);
                available -= 1;
            }
        }
        Ok(())
    }

    /// Claim one task for one worker and spawn (or reuse) the worker.
    async fn dispatch_task(&self, task_id: &str, worker_id: u32) -> Result<bool> {
        if !self.store.claim_task(task_id, worker_id)? {
            return Ok(false);
        }

        let branch = worker_branch_name(&self.feature, worker_id);
        let worktree_path = match &self.worktrees {
            Some(manager) => {
                match manager.create_for_worker(
                    &self.feature,
                    worker_id,
                    &self.config.orchestrator.target_branch,
                ) {
                    Ok(info) => info.path,
                    Err(e) => {
                        tracing::error!(task_id, worker_id, error = %e, "worktree creation failed");
                        self.store.release_task(task_id, worker_id)?;
                        self.store
                            .set_task_status(task_id, TaskStatus::Pending, None, None)?;
                        return Ok(false);
                    }
                }
            }
            None => self.repo_root.clone(),
        };

        self.store.register_worker(worker_id, &branch)?;
        self.store.set_worker_task(worker_id, Some(task_id))?;

        let port = match self
            .ports
            .allocate_for_worker_async(worker_id, 1)
            .await
        {
            Ok(ports) => ports.first().copied(),
            Err(e) => {
                tracing::warn!(worker_id, error = %e, "port allocation failed");
                None
            }
        };
        self.store.set_worker_port(worker_id, port)?;

        let request = SpawnRequest {
            worker_id,
            feature: self.feature.clone(),
            worktree_path,
            branch,
            port,
        };
        let spawn = self.launcher.spawn(&request).await;
        if !spawn.success {
            tracing::error!(
                task_id,
                worker_id,
                error = ?spawn.error,
                "worker spawn failed, requeueing task"
            );
            if let Some(port) = port {
                self.ports.release(port);
            }
            self.store
                .update_worker_status(worker_id, WorkerStatus::Crashed)?;
            self.store.set_worker_task(worker_id, None)?;
            self.store.release_task(task_id, worker_id)?;
            self.store
                .set_task_status(task_id, TaskStatus::Pending, None, None)?;
            return Ok(false);
        }

        self.store
            .update_worker_status(worker_id, WorkerStatus::Running)?;
        self.store.append_event(
            "task_dispatched",
            json!({"task_id": task_id, "worker_id": worker_id}),
        )?;
        self.emit(
            LogLevel::Info,
            &format!("Dispatched {task_id} to worker {worker_id}"),
            LogFields::task(task_id)
                .event(LogEvent::WorkerSpawned)
                .data(json!({"worker_id": worker_id})),
        );
        Ok(true)
    }

    /// Every level resolved: record the final outcome.
    async fn finish(&self) -> Result<ExitCode> {
        let any_failed = self.levels.lock().any_failed();
        let code = if any_failed {
            ExitCode::Error
        } else {
            ExitCode::Success
        };

        let doc = self.store.snapshot();
        let count = |status: TaskStatus| {
            doc.tasks.values().filter(|t| t.status == status).count()
        };
        self.store.update_metrics(json!({
            "total_tasks": doc.tasks.len(),
            "completed_tasks": count(TaskStatus::Complete),
            "failed_tasks": count(TaskStatus::Failed),
            "total_retries": doc.tasks.values().map(|t| t.retry_count).sum::<u32>(),
            "levels": doc.levels.len(),
        }))?;
        self.store.append_event(
            "rush_finished",
            json!({"feature": self.feature, "exit_code": code.code()}),
        )?;
        self.ports.release_all();
        let _ = self.launcher.terminate_all().await;
        tracing::info!(feature = %self.feature, ?code, "build finished");
        Ok(code)
    }

    /// External stop: terminate workers gracefully, pause, and exit.
    async fn shutdown(&self) -> Result<ExitCode> {
        tracing::info!(feature = %self.feature, "stop requested, shutting down");
        let results = self.launcher.terminate_all().await;
        self.store.set_paused(true)?;
        self.store.append_event(
            "rush_stopped",
            json!({"terminated_workers": results.len()}),
        )?;
        self.ports.release_all();
        let _ = std::fs::remove_file(&self.stop_file);
        Ok(ExitCode::Checkpoint)
    }

    fn emit(&self, level: LogLevel, message: &str, fields: LogFields) {
        if let Some(writer) = &self.writer {
            writer.emit(level, message, fields);
        }
    }
}

enum LevelOutcome {
    /// Work continues (next level started or level reopened).
    Advanced,
    /// No levels remain; the build is over.
    Finished,
    /// The orchestrator paused for intervention.
    Paused(ExitCode),
}
