//! Process-backed worker launcher.
//!
//! Spawns the configured worker command in the worker's worktree with a
//! seeded environment, waits for the worker's first heartbeat as the
//! readiness signal, and terminates gracefully (SIGTERM, then kill after
//! the grace period).

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use zerg_state::WorkerStatus;

use crate::git::is_worker_branch;

use super::{SpawnRequest, SpawnResult, WorkerHandle, WorkerLauncher};

/// Tuning for the process launcher.
#[derive(Debug, Clone)]
pub struct ProcessLauncherConfig {
    /// Shell command each worker runs.
    pub command: String,
    /// How long to wait for the first heartbeat before calling the spawn
    /// failed.
    pub spawn_timeout: Duration,
    /// Additional spawn attempts after a failed one.
    pub spawn_retries: u32,
    /// Grace period between SIGTERM and force kill.
    pub terminate_grace: Duration,
    /// Directory workers write heartbeat files into.
    pub heartbeat_dir: PathBuf,
    /// State directory forwarded to workers.
    pub state_dir: PathBuf,
    /// Log directory forwarded to workers.
    pub log_dir: PathBuf,
    /// Extra environment for every worker.
    pub extra_env: HashMap<String, String>,
}

/// One recorded spawn attempt, kept for observability.
#[derive(Debug, Clone)]
pub struct SpawnAttempt {
    pub worker_id: u32,
    pub attempt: u32,
    pub success: bool,
    pub error: Option<String>,
    pub at: chrono::DateTime<Utc>,
}

struct ManagedWorker {
    child: Child,
    handle: WorkerHandle,
}

/// Launcher backed by local OS processes.
pub struct ProcessLauncher {
    config: ProcessLauncherConfig,
    workers: Mutex<HashMap<u32, ManagedWorker>>,
    attempts: parking_lot::Mutex<Vec<SpawnAttempt>>,
}

impl ProcessLauncher {
    pub fn new(config: ProcessLauncherConfig) -> Self {
        Self {
            config,
            workers: Mutex::new(HashMap::new()),
            attempts: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Every spawn attempt made so far.
    pub fn spawn_attempts(&self) -> Vec<SpawnAttempt> {
        self.attempts.lock().clone()
    }

    fn record_attempt(&self, worker_id: u32, attempt: u32, error: Option<&str>) {
        self.attempts.lock().push(SpawnAttempt {
            worker_id,
            attempt,
            success: error.is_none(),
            error: error.map(str::to_owned),
            at: Utc::now(),
        });
    }

    fn heartbeat_path(&self, worker_id: u32) -> PathBuf {
        self.config
            .heartbeat_dir
            .join(format!("worker-{worker_id}.json"))
    }

    /// One spawn attempt: start the process and wait for its heartbeat.
    async fn try_spawn(&self, request: &SpawnRequest) -> Result<Child, String> {
        // A fresh spawn must observe a fresh heartbeat.
        let heartbeat = self.heartbeat_path(request.worker_id);
        let _ = std::fs::remove_file(&heartbeat);
        if let Err(e) = std::fs::create_dir_all(&self.config.heartbeat_dir) {
            return Err(format!("failed to create heartbeat dir: {e}"));
        }

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&self.config.command)
            .current_dir(&request.worktree_path)
            .env("ZERG_FEATURE", &request.feature)
            .env("ZERG_WORKER_ID", request.worker_id.to_string())
            .env("ZERG_BRANCH", &request.branch)
            .env("ZERG_STATE_DIR", &self.config.state_dir)
            .env("ZERG_LOG_DIR", &self.config.log_dir)
            .env("ZERG_HEARTBEAT_DIR", &self.config.heartbeat_dir)
            .kill_on_drop(true);
        if let Some(port) = request.port {
            command.env("ZERG_PORT", port.to_string());
        }
        for (key, value) in &self.config.extra_env {
            command.env(key, value);
        }

        let mut child = command
            .spawn()
            .map_err(|e| format!("failed to spawn worker process: {e}"))?;

        // Readiness: the worker's heartbeat file appears within the spawn
        // timeout. A process that exits non-zero first is a spawn failure.
        let deadline = tokio::time::Instant::now() + self.config.spawn_timeout;
        loop {
            if heartbeat.exists() {
                return Ok(child);
            }
            match child.try_wait() {
                Ok(Some(status)) if !status.success() => {
                    return Err(format!(
                        "worker exited during spawn (exit {})",
                        status.code().unwrap_or(-1)
                    ));
                }
                Ok(Some(_)) => {
                    // Exited cleanly before heartbeating; treat the spawn as
                    // complete so one-shot workers are observable.
                    return Ok(child);
                }
                Ok(None) => {}
                Err(e) => return Err(format!("failed to poll worker: {e}")),
            }
            if tokio::time::Instant::now() >= deadline {
                let _ = child.kill().await;
                return Err(format!(
                    "worker produced no heartbeat within {}s",
                    self.config.spawn_timeout.as_secs()
                ));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn stop_worker(managed: &mut ManagedWorker, grace: Duration) -> bool {
        // Already exited?
        if let Ok(Some(_)) = managed.child.try_wait() {
            return false;
        }

        #[cfg(unix)]
        if let Some(pid) = managed.child.id() {
            // SAFETY: signalling a child pid we own.
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }

        let graceful = tokio::time::timeout(grace, managed.child.wait()).await;
        match graceful {
            Ok(_) => {}
            Err(_) => {
                tracing::warn!(
                    worker_id = managed.handle.worker_id,
                    "graceful stop timed out, killing"
                );
                let _ = managed.child.kill().await;
            }
        }
        managed.handle.status = WorkerStatus::Stopped;
        true
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn spawn(&self, request: &SpawnRequest) -> SpawnResult {
        if !is_worker_branch(&request.feature, &request.branch) {
            let error = format!(
                "invalid worker branch {:?} for feature {:?}",
                request.branch, request.feature
            );
            self.record_attempt(request.worker_id, 0, Some(&error));
            return SpawnResult::failed(request.worker_id, error);
        }
        if !request.worktree_path.exists() {
            let error = format!(
                "worktree does not exist: {}",
                request.worktree_path.display()
            );
            self.record_attempt(request.worker_id, 0, Some(&error));
            return SpawnResult::failed(request.worker_id, error);
        }

        // A respawn replaces the previous handle; stop the old process.
        {
            let mut workers = self.workers.lock().await;
            if let Some(mut old) = workers.remove(&request.worker_id) {
                tracing::info!(worker_id = request.worker_id, "replacing existing worker");
                Self::stop_worker(&mut old, self.config.terminate_grace).await;
            }
        }

        let mut last_error = String::new();
        for attempt in 0..=self.config.spawn_retries {
            match self.try_spawn(request).await {
                Ok(child) => {
                    self.record_attempt(request.worker_id, attempt, None);
                    let handle = WorkerHandle {
                        worker_id: request.worker_id,
                        pid: child.id(),
                        branch: request.branch.clone(),
                        status: WorkerStatus::Running,
                        exit_code: None,
                        spawned_at: Utc::now(),
                    };
                    self.workers.lock().await.insert(
                        request.worker_id,
                        ManagedWorker {
                            child,
                            handle: handle.clone(),
                        },
                    );
                    tracing::info!(
                        worker_id = request.worker_id,
                        pid = ?handle.pid,
                        attempt,
                        "worker spawned"
                    );
                    return SpawnResult::ok(handle);
                }
                Err(error) => {
                    tracing::warn!(
                        worker_id = request.worker_id,
                        attempt,
                        error = %error,
                        "spawn attempt failed"
                    );
                    self.record_attempt(request.worker_id, attempt, Some(&error));
                    last_error = error;
                }
            }
        }
        SpawnResult::failed(request.worker_id, last_error)
    }

    async fn monitor(&self, worker_id: u32) -> WorkerStatus {
        let mut workers = self.workers.lock().await;
        let Some(managed) = workers.get_mut(&worker_id) else {
            return WorkerStatus::Stopped;
        };
        if managed.handle.status == WorkerStatus::Stopped {
            return WorkerStatus::Stopped;
        }
        match managed.child.try_wait() {
            Ok(Some(status)) => {
                let code = status.code();
                if code == Some(0) {
                    managed.handle.status = WorkerStatus::Stopped;
                } else {
                    managed.handle.status = WorkerStatus::Crashed;
                    managed.handle.exit_code = code;
                }
                managed.handle.status
            }
            Ok(None) => managed.handle.status,
            Err(_) => WorkerStatus::Stopped,
        }
    }

    async fn terminate(&self, worker_id: u32) -> bool {
        let mut workers = self.workers.lock().await;
        let Some(managed) = workers.get_mut(&worker_id) else {
            return false;
        };
        let stopped = Self::stop_worker(managed, self.config.terminate_grace).await;
        if !stopped && managed.handle.status != WorkerStatus::Crashed {
            // Already exited before we got here; normalize the handle.
            managed.handle.status = WorkerStatus::Stopped;
        }
        stopped
    }

    async fn get_all_workers(&self) -> BTreeMap<u32, WorkerHandle> {
        self.workers
            .lock()
            .await
            .iter()
            .map(|(id, managed)| (*id, managed.handle.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// A worker command that writes its heartbeat then sleeps.
    const HEARTBEATING_WORKER: &str = concat!(
        "printf '{\"worker_id\": %s, \"ts\": \"2026-01-01T00:00:00Z\"}' ",
        "\"$ZERG_WORKER_ID\" > \"$ZERG_HEARTBEAT_DIR/worker-$ZERG_WORKER_ID.json\" ",
        "&& sleep 30"
    );

    fn launcher(dir: &TempDir, command: &str) -> ProcessLauncher {
        ProcessLauncher::new(ProcessLauncherConfig {
            command: command.to_owned(),
            spawn_timeout: Duration::from_secs(5),
            spawn_retries: 1,
            terminate_grace: Duration::from_secs(2),
            heartbeat_dir: dir.path().join("heartbeats"),
            state_dir: dir.path().join("state"),
            log_dir: dir.path().join("logs"),
            extra_env: HashMap::new(),
        })
    }

    fn request(dir: &TempDir, worker_id: u32) -> SpawnRequest {
        let worktree = dir.path().join(format!("worker-{worker_id}"));
        std::fs::create_dir_all(&worktree).unwrap();
        SpawnRequest {
            worker_id,
            feature: "feat".into(),
            worktree_path: worktree,
            branch: format!("zerg/feat/worker-{worker_id}"),
            port: None,
        }
    }

    #[tokio::test]
    async fn spawns_and_terminates_heartbeating_worker() {
        let dir = TempDir::new().unwrap();
        let launcher = launcher(&dir, HEARTBEATING_WORKER);

        let result = launcher.spawn(&request(&dir, 0)).await;
        assert!(result.success, "error: {:?}", result.error);
        assert!(result.handle.as_ref().unwrap().pid.is_some());
        assert_eq!(launcher.monitor(0).await, WorkerStatus::Running);

        assert!(launcher.terminate(0).await);
        assert_eq!(launcher.monitor(0).await, WorkerStatus::Stopped);
        assert!(!launcher.terminate(0).await, "already stopped");
    }

    #[tokio::test]
    async fn bad_branch_name_is_a_hard_error() {
        let dir = TempDir::new().unwrap();
        let launcher = launcher(&dir, HEARTBEATING_WORKER);

        let mut bad = request(&dir, 0);
        bad.branch = "feature/wrong-prefix".into();
        let result = launcher.spawn(&bad).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("invalid worker branch"));
    }

    #[tokio::test]
    async fn missing_worktree_fails_spawn() {
        let dir = TempDir::new().unwrap();
        let launcher = launcher(&dir, HEARTBEATING_WORKER);

        let mut bad = request(&dir, 0);
        bad.worktree_path = dir.path().join("does-not-exist");
        let result = launcher.spawn(&bad).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("worktree does not exist"));
    }

    #[tokio::test]
    async fn early_nonzero_exit_consumes_retry_budget() {
        let dir = TempDir::new().unwrap();
        let launcher = launcher(&dir, "exit 7");

        let result = launcher.spawn(&request(&dir, 0)).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("exited during spawn"));
        // One initial try plus one retry.
        assert_eq!(launcher.spawn_attempts().len(), 2);
        assert!(launcher.spawn_attempts().iter().all(|a| !a.success));
    }

    #[tokio::test]
    async fn crash_after_ready_is_reported_with_exit_code() {
        let dir = TempDir::new().unwrap();
        let command = concat!(
            "printf '{}' > \"$ZERG_HEARTBEAT_DIR/worker-$ZERG_WORKER_ID.json\"",
            " && exit 3"
        );
        let launcher = launcher(&dir, command);

        let result = launcher.spawn(&request(&dir, 0)).await;
        assert!(result.success, "error: {:?}", result.error);

        // Give the process a moment to exit.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(launcher.monitor(0).await, WorkerStatus::Crashed);
        let handle = &launcher.get_all_workers().await[&0];
        assert_eq!(handle.exit_code, Some(3));
        // A crashed worker is not "live": terminate reports false.
        assert!(!launcher.terminate(0).await);
    }

    #[tokio::test]
    async fn respawn_replaces_previous_handle() {
        let dir = TempDir::new().unwrap();
        let launcher = launcher(&dir, HEARTBEATING_WORKER);

        let first = launcher.spawn(&request(&dir, 0)).await;
        let first_pid = first.handle.unwrap().pid;
        let second = launcher.spawn(&request(&dir, 0)).await;
        assert!(second.success);
        let workers = launcher.get_all_workers().await;
        assert_eq!(workers.len(), 1);
        assert_ne!(workers[&0].pid, first_pid);

        launcher.terminate_all().await;
    }

    #[tokio::test]
    async fn status_summary_reflects_live_workers() {
        let dir = TempDir::new().unwrap();
        let launcher = launcher(&dir, HEARTBEATING_WORKER);
        launcher.spawn(&request(&dir, 0)).await;
        launcher.spawn(&request(&dir, 1)).await;

        let summary = launcher.get_status_summary().await;
        assert_eq!(summary.alive, 2);
        assert_eq!(summary.by_status.get("running"), Some(&2));

        let results = launcher.terminate_all().await;
        assert_eq!(results.len(), 2);
        assert!(results.values().all(|ok| *ok));
        assert_eq!(launcher.get_status_summary().await.alive, 0);
    }
}
