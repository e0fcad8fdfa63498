//! End-to-end orchestration over a real git repository.
//!
//! Workers are simulated by a scripted launcher that, on spawn, performs
//! the worker's whole job: commit work on its branch and write the task
//! completion into the shared state file, exactly as an external worker
//! process would.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use zerg_core::config::ZergConfig;
use zerg_core::git::GitOps;
use zerg_core::graph::TaskGraph;
use zerg_core::launcher::{SpawnRequest, SpawnResult, WorkerHandle, WorkerLauncher};
use zerg_core::merge::MergeCoordinator;
use zerg_core::orchestrator::Orchestrator;
use zerg_state::{ExitCode, LevelMergeStatus, StateStore, TaskStatus, WorkerStatus};
use zerg_test_utils::{create_temp_repo, git, two_level_graph};

/// What a scripted worker does for one task.
#[derive(Clone)]
enum WorkerScript {
    /// Commit `(file, content)` on the worker branch, then complete.
    CommitAndComplete(String, String),
    /// Mark the task permanently failed on disk.
    Fail,
}

/// Launcher that executes the worker's job inline during `spawn`.
struct InlineWorkerLauncher {
    store: StateStore,
    repo: PathBuf,
    scripts: BTreeMap<String, WorkerScript>,
    workers: Mutex<BTreeMap<u32, WorkerHandle>>,
}

impl InlineWorkerLauncher {
    fn new(store: StateStore, repo: &Path, scripts: BTreeMap<String, WorkerScript>) -> Self {
        Self {
            store,
            repo: repo.to_path_buf(),
            scripts,
            workers: Mutex::new(BTreeMap::new()),
        }
    }

    /// Commit `content` into `file` on `branch`, creating the branch off
    /// main when needed.
    fn commit_on_worker_branch(&self, branch: &str, file: &str, content: &str) {
        let branch_exists = std::process::Command::new("git")
            .args(["rev-parse", "--verify", &format!("refs/heads/{branch}")])
            .current_dir(&self.repo)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false);
        if branch_exists {
            git(&self.repo, &["checkout", branch]);
        } else {
            git(&self.repo, &["checkout", "-b", branch, "main"]);
        }
        let path = self.repo.join(file);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content).unwrap();
        git(&self.repo, &["add", "."]);
        git(&self.repo, &["commit", "-m", &format!("work on {file}")]);
        git(&self.repo, &["checkout", "main"]);
    }
}

#[async_trait]
impl WorkerLauncher for InlineWorkerLauncher {
    async fn spawn(&self, request: &SpawnRequest) -> SpawnResult {
        let handle = WorkerHandle {
            worker_id: request.worker_id,
            pid: Some(1000 + request.worker_id),
            branch: request.branch.clone(),
            status: WorkerStatus::Running,
            exit_code: None,
            spawned_at: chrono::Utc::now(),
        };
        self.workers
            .lock()
            .insert(request.worker_id, handle.clone());

        // The worker discovers its task from the shared state, does the
        // work, and writes the outcome back.
        let doc = self.store.reload().unwrap();
        let task_id = doc
            .worker(request.worker_id)
            .and_then(|w| w.current_task.clone())
            .expect("dispatched worker has a current task");

        self.store
            .set_task_status(&task_id, TaskStatus::InProgress, Some(request.worker_id), None)
            .unwrap();

        match self.scripts.get(&task_id).cloned() {
            Some(WorkerScript::CommitAndComplete(file, content)) => {
                self.commit_on_worker_branch(&request.branch, &file, &content);
                self.store
                    .set_task_status(
                        &task_id,
                        TaskStatus::Complete,
                        Some(request.worker_id),
                        None,
                    )
                    .unwrap();
                self.store
                    .record_worker_completion(request.worker_id)
                    .unwrap();
            }
            Some(WorkerScript::Fail) => {
                // Permanent failure written by the worker side.
                self.store
                    .atomic_update(|doc| {
                        let task = doc.tasks.get_mut(&task_id).unwrap();
                        task.status = TaskStatus::Failed;
                        task.retry_count = 3;
                        task.error = Some("scripted failure".into());
                    })
                    .unwrap();
            }
            None => panic!("no script for task {task_id}"),
        }

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

fn fast_config() -> ZergConfig {
    let mut config = ZergConfig::default();
    config.workers.count = 2;
    config.orchestrator.tick_interval_ms = 20;
    config
}

fn build_orchestrator(
    repo: &Path,
    scripts: BTreeMap<String, WorkerScript>,
    graph: TaskGraph,
) -> (Orchestrator, StateStore) {
    let config = fast_config();
    let state_dir = repo.join(config.directories.state.clone());
    let store = StateStore::open("feat", &state_dir).unwrap();
    let launcher = Arc::new(InlineWorkerLauncher::new(store.clone(), repo, scripts));
    let merge = MergeCoordinator::new(
        "feat",
        store.clone(),
        GitOps::new(repo).unwrap(),
        vec![],
    );
    let orchestrator = Orchestrator::new(
        config,
        "feat",
        graph,
        store.clone(),
        merge,
        launcher,
        None,
        repo.to_path_buf(),
    )
    .unwrap();
    (orchestrator, store)
}

#[tokio::test]
async fn two_level_graph_runs_to_completion() {
    let (_dir, repo) = create_temp_repo();

    let scripts = BTreeMap::from([
        (
            "T1".to_string(),
            WorkerScript::CommitAndComplete("a.rs".into(), "fn a() {}\n".into()),
        ),
        (
            "T2".to_string(),
            WorkerScript::CommitAndComplete("b.rs".into(), "fn b() {}\n".into()),
        ),
        (
            "T3".to_string(),
            WorkerScript::CommitAndComplete("a.rs".into(), "fn a() { /* v2 */ }\n".into()),
        ),
    ]);
    let graph = TaskGraph::from_value(two_level_graph()).unwrap();
    let (mut orchestrator, store) = build_orchestrator(&repo, scripts, graph);

    let code = tokio::time::timeout(std::time::Duration::from_secs(60), orchestrator.run())
        .await
        .expect("orchestrator should finish")
        .unwrap();
    assert_eq!(code, ExitCode::Success);

    let doc = store.reload().unwrap();
    // Every task complete; no failures.
    for id in ["T1", "T2", "T3"] {
        assert_eq!(doc.tasks[id].status, TaskStatus::Complete, "{id}");
        assert!(doc.tasks[id].completed_at.is_some());
    }
    assert_eq!(doc.current_level, 2);

    // Both levels complete with a merge commit recorded.
    for level in [1u32, 2] {
        let record = doc.level(level).unwrap();
        assert_eq!(record.status, zerg_state::LevelRunStatus::Complete);
        assert_eq!(record.merge_status, Some(LevelMergeStatus::Complete));
        assert!(record.merge_commit.is_some(), "level {level} merge commit");
    }

    // Worker output landed on main through the level merges.
    assert_eq!(git(&repo, &["branch", "--show-current"]), "main");
    assert!(repo.join("a.rs").exists());
    assert!(repo.join("b.rs").exists());
    assert!(
        std::fs::read_to_string(repo.join("a.rs"))
            .unwrap()
            .contains("v2"),
        "level 2 modification merged"
    );

    // Staging branches were ephemeral.
    let branches = git(&repo, &["branch", "--list", "zerg/feat/staging-*"]);
    assert!(branches.is_empty(), "staging branches deleted: {branches}");

    // The audit trail records the build skeleton.
    let events: Vec<&str> = doc
        .execution_log
        .iter()
        .map(|e| e.event.as_str())
        .collect();
    assert!(events.contains(&"rush_started"));
    assert!(events.contains(&"task_dispatched"));
    assert!(events.contains(&"level_complete"));
    assert!(events.contains(&"rush_finished"));
}

#[tokio::test]
async fn merge_conflict_pauses_the_build() {
    let (_dir, repo) = create_temp_repo();

    // Both level-1 workers write the same file with different contents:
    // declared intents differ, actual trees collide.
    let scripts = BTreeMap::from([
        (
            "T1".to_string(),
            WorkerScript::CommitAndComplete("shared.txt".into(), "from T1\n".into()),
        ),
        (
            "T2".to_string(),
            WorkerScript::CommitAndComplete("shared.txt".into(), "from T2\n".into()),
        ),
        (
            "T3".to_string(),
            WorkerScript::CommitAndComplete("c.rs".into(), "fn c() {}\n".into()),
        ),
    ]);
    let graph = TaskGraph::from_value(two_level_graph()).unwrap();
    let (mut orchestrator, store) = build_orchestrator(&repo, scripts, graph);

    let code = tokio::time::timeout(std::time::Duration::from_secs(60), orchestrator.run())
        .await
        .expect("orchestrator should pause")
        .unwrap();
    assert_eq!(code, ExitCode::Blocked);

    let doc = store.reload().unwrap();
    assert!(doc.paused, "conflict pauses the orchestrator");
    assert_eq!(
        doc.level(1).unwrap().merge_status,
        Some(LevelMergeStatus::Conflict)
    );
    let conflict_event = doc
        .execution_log
        .iter()
        .find(|e| e.event == "merge_conflict")
        .expect("conflict event recorded");
    assert_eq!(
        conflict_event.data["conflicting_files"][0],
        "shared.txt"
    );

    // Staging was cleaned up; T3 never ran.
    let branches = git(&repo, &["branch", "--list", "zerg/feat/staging-*"]);
    assert!(branches.is_empty());
    assert_ne!(doc.tasks["T3"].status, TaskStatus::Complete);
}

#[tokio::test]
async fn failed_task_resolves_level_but_fails_the_build() {
    let (_dir, repo) = create_temp_repo();

    let scripts = BTreeMap::from([
        (
            "T1".to_string(),
            WorkerScript::CommitAndComplete("a.rs".into(), "fn a() {}\n".into()),
        ),
        ("T2".to_string(), WorkerScript::Fail),
        (
            "T3".to_string(),
            WorkerScript::CommitAndComplete("a.rs".into(), "fn a2() {}\n".into()),
        ),
    ]);
    let graph = TaskGraph::from_value(two_level_graph()).unwrap();
    let (mut orchestrator, store) = build_orchestrator(&repo, scripts, graph);

    let code = tokio::time::timeout(std::time::Duration::from_secs(60), orchestrator.run())
        .await
        .expect("orchestrator should finish")
        .unwrap();

    // The failed task does not block level resolution, but the overall
    // build outcome is an error.
    assert_eq!(code, ExitCode::Error);

    let doc = store.reload().unwrap();
    assert_eq!(doc.tasks["T1"].status, TaskStatus::Complete);
    assert_eq!(doc.tasks["T2"].status, TaskStatus::Failed);
    assert_eq!(
        doc.level(1).unwrap().merge_status,
        Some(LevelMergeStatus::Complete),
        "merge proceeds for a resolved level with failures"
    );
    // The failed dependency satisfied readiness, so T3 still ran.
    assert_eq!(doc.tasks["T3"].status, TaskStatus::Complete);
}
