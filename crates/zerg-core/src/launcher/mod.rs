//! The worker launcher contract.
//!
//! A launcher provisions isolated worker processes attached to a worktree on
//! a branch, monitors them, and terminates them. The trait is object-safe so
//! the orchestrator can hold `Arc<dyn WorkerLauncher>` and tests can swap in
//! a scripted implementation.

pub mod process;

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use zerg_state::WorkerStatus;

pub use process::{ProcessLauncher, ProcessLauncherConfig};

/// What the orchestrator asks a launcher to start.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub worker_id: u32,
    pub feature: String,
    /// The worker's worktree. Must already exist; the launcher attaches.
    pub worktree_path: PathBuf,
    /// Must match `zerg/{feature}/worker-{id}`; violations are hard errors.
    pub branch: String,
    /// Port leased for this worker, if any.
    pub port: Option<u16>,
}

/// Handle to a spawned (or previously spawned) worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub worker_id: u32,
    pub pid: Option<u32>,
    pub branch: String,
    pub status: WorkerStatus,
    pub exit_code: Option<i32>,
    pub spawned_at: DateTime<Utc>,
}

/// Outcome of a spawn attempt.
#[derive(Debug, Clone)]
pub struct SpawnResult {
    pub success: bool,
    pub worker_id: u32,
    pub handle: Option<WorkerHandle>,
    pub error: Option<String>,
}

impl SpawnResult {
    pub fn ok(handle: WorkerHandle) -> Self {
        Self {
            success: true,
            worker_id: handle.worker_id,
            handle: Some(handle),
            error: None,
        }
    }

    pub fn failed(worker_id: u32, error: impl Into<String>) -> Self {
        Self {
            success: false,
            worker_id,
            handle: None,
            error: Some(error.into()),
        }
    }
}

/// Totals by worker status plus the alive count.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusSummary {
    pub by_status: BTreeMap<String, usize>,
    pub alive: usize,
}

/// Spawns, monitors, and terminates isolated worker processes.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Start a worker. A repeated spawn for the same id replaces the
    /// previous handle; the old process is stopped first.
    async fn spawn(&self, request: &SpawnRequest) -> SpawnResult;

    /// Non-blocking status query. Unknown ids report `Stopped`.
    async fn monitor(&self, worker_id: u32) -> WorkerStatus;

    /// Graceful stop, then force after the grace period. Returns `true`
    /// only when a live worker was transitioned to stopped; unknown ids and
    /// already-stopped workers return `false`.
    async fn terminate(&self, worker_id: u32) -> bool;

    /// Handles for every known worker.
    async fn get_all_workers(&self) -> BTreeMap<u32, WorkerHandle>;

    /// Terminate every known worker. Returns per-worker success.
    async fn terminate_all(&self) -> BTreeMap<u32, bool> {
        let ids: Vec<u32> = self.get_all_workers().await.into_keys().collect();
        let mut results = BTreeMap::new();
        for id in ids {
            results.insert(id, self.terminate(id).await);
        }
        results
    }

    /// Totals by status and the alive (running + idle + initializing +
    /// ready) count.
    async fn get_status_summary(&self) -> StatusSummary {
        let ids: Vec<u32> = self.get_all_workers().await.into_keys().collect();
        let mut summary = StatusSummary::default();
        for id in ids {
            let status = self.monitor(id).await;
            *summary.by_status.entry(status.to_string()).or_default() += 1;
            if status.is_alive() {
                summary.alive += 1;
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Scripted launcher proving the trait is object-safe and exercising
    /// the provided methods.
    struct ScriptedLauncher {
        workers: Mutex<BTreeMap<u32, WorkerHandle>>,
        fail_ids: Vec<u32>,
    }

    impl ScriptedLauncher {
        fn new(fail_ids: Vec<u32>) -> Self {
            Self {
                workers: Mutex::new(BTreeMap::new()),
                fail_ids,
            }
        }
    }

    #[async_trait]
    impl WorkerLauncher for ScriptedLauncher {
        async fn spawn(&self, request: &SpawnRequest) -> SpawnResult {
            if self.fail_ids.contains(&request.worker_id) {
                return SpawnResult::failed(request.worker_id, "scripted failure");
            }
            let handle = WorkerHandle {
                worker_id: request.worker_id,
                pid: Some(1000 + request.worker_id),
                branch: request.branch.clone(),
                status: WorkerStatus::Running,
                exit_code: None,
                spawned_at: Utc::now(),
            };
            self.workers
                .lock()
                .insert(request.worker_id, handle.clone());
            SpawnResult::ok(handle)
        }

        async fn monitor(&self, worker_id: u32) -> WorkerStatus {
            self.workers
                .lock()
                .get(&worker_id)
                .map(|h| h.status)
                .unwrap_or(WorkerStatus::Stopped)
        }

        async fn terminate(&self, worker_id: u32) -> bool {
            let mut workers = self.workers.lock();
            match workers.get_mut(&worker_id) {
                Some(handle) if handle.status.is_alive() => {
                    handle.status = WorkerStatus::Stopped;
                    true
                }
                _ => false,
            }
        }

        async fn get_all_workers(&self) -> BTreeMap<u32, WorkerHandle> {
            self.workers.lock().clone()
        }
    }

    fn request(worker_id: u32) -> SpawnRequest {
        SpawnRequest {
            worker_id,
            feature: "feat".into(),
            worktree_path: PathBuf::from("/tmp/worker"),
            branch: format!("zerg/feat/worker-{worker_id}"),
            port: None,
        }
    }

    #[tokio::test]
    async fn spawn_monitor_terminate_lifecycle() {
        let launcher: Box<dyn WorkerLauncher> = Box::new(ScriptedLauncher::new(vec![]));

        let result = launcher.spawn(&request(0)).await;
        assert!(result.success);
        assert_eq!(result.worker_id, 0);
        assert_eq!(
            result.handle.as_ref().map(|h| h.status),
            Some(WorkerStatus::Running)
        );

        assert_eq!(launcher.monitor(0).await, WorkerStatus::Running);
        assert!(launcher.terminate(0).await);
        assert_eq!(launcher.monitor(0).await, WorkerStatus::Stopped);
        // Terminate on an already-stopped worker returns false.
        assert!(!launcher.terminate(0).await);
    }

    #[tokio::test]
    async fn unknown_workers_are_stopped_and_unterminatable() {
        let launcher = ScriptedLauncher::new(vec![]);
        assert_eq!(launcher.monitor(42).await, WorkerStatus::Stopped);
        assert!(!launcher.terminate(42).await);
    }

    #[tokio::test]
    async fn terminate_all_covers_every_worker() {
        let launcher = ScriptedLauncher::new(vec![1]);
        for id in 0..4 {
            launcher.spawn(&request(id)).await;
        }
        // Worker 1 failed to spawn, so only 0, 2, 3 are known.
        let results = launcher.terminate_all().await;
        assert_eq!(results.len(), 3);
        assert!(results.values().all(|ok| *ok));
    }

    #[tokio::test]
    async fn status_summary_counts_alive() {
        let launcher = ScriptedLauncher::new(vec![]);
        launcher.spawn(&request(0)).await;
        launcher.spawn(&request(1)).await;
        launcher.terminate(1).await;

        let summary = launcher.get_status_summary().await;
        assert_eq!(summary.alive, 1);
        assert_eq!(summary.by_status.get("running"), Some(&1));
        assert_eq!(summary.by_status.get("stopped"), Some(&1));
    }
}
