//! `zerg rush`: run the orchestrator for a feature build.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use zerg_core::config::ZergConfig;
use zerg_core::git::GitOps;
use zerg_core::graph::TaskGraph;
use zerg_core::launcher::{ProcessLauncher, ProcessLauncherConfig};
use zerg_core::merge::MergeCoordinator;
use zerg_core::orchestrator::Orchestrator;
use zerg_core::worktree::WorktreeManager;
use zerg_state::{ExitCode, FeatureLock, StateStore};

pub async fn run_rush(
    repo_root: &Path,
    feature: &str,
    graph_path: Option<PathBuf>,
    workers_override: Option<u32>,
    target_override: Option<String>,
) -> Result<ExitCode> {
    let mut config = ZergConfig::load(repo_root)?;
    if let Some(workers) = workers_override {
        config.workers.count = workers;
    }
    if let Some(target) = target_override {
        config.orchestrator.target_branch = target;
    }

    // One orchestrator per feature: take the advisory session lock.
    let specs_dir = repo_root.join(&config.directories.specs);
    let lock = FeatureLock::new(&specs_dir, feature)?;
    if !lock.acquire()? {
        let holder = lock.check();
        bail!(
            "feature {feature:?} is already locked{}",
            holder
                .map(|info| format!(" by pid {} ({}s ago)", info.pid, info.age_seconds as u64))
                .unwrap_or_default()
        );
    }

    let result = run_locked(repo_root, feature, graph_path, &config).await;
    lock.release();
    result
}

async fn run_locked(
    repo_root: &Path,
    feature: &str,
    graph_path: Option<PathBuf>,
    config: &ZergConfig,
) -> Result<ExitCode> {
    let graph_path = graph_path.unwrap_or_else(|| {
        repo_root
            .join(&config.directories.specs)
            .join(feature)
            .join("tasks.json")
    });
    let graph = TaskGraph::from_file(&graph_path)
        .with_context(|| format!("failed to load task graph at {}", graph_path.display()))?;

    println!(
        "Starting rush for {feature}: {} tasks across {} levels, {} workers",
        graph.tasks().len(),
        graph.level_count(),
        config.workers.count
    );
    if let Some((minutes, path)) = Some(graph.critical_path()).filter(|(m, _)| *m > 0) {
        println!("Critical path: ~{minutes} min via {}", path.join(" -> "));
    }

    let state_dir = repo_root.join(&config.directories.state);
    let log_dir = repo_root.join(&config.directories.logs);
    let store = StateStore::open(feature, &state_dir)?;

    let git = GitOps::new(repo_root)?;
    let merge = MergeCoordinator::new(
        feature,
        store.clone(),
        git,
        config.required_gates(),
    );

    let worktrees = WorktreeManager::new(
        repo_root,
        Some(repo_root.join(&config.directories.worktrees)),
    )?;

    let launcher = Arc::new(ProcessLauncher::new(ProcessLauncherConfig {
        command: config.workers.worker_command.clone(),
        spawn_timeout: Duration::from_secs(config.workers.spawn_timeout_seconds),
        spawn_retries: config.workers.spawn_retries,
        terminate_grace: Duration::from_secs(config.workers.terminate_grace_seconds),
        heartbeat_dir: log_dir.join("heartbeats"),
        state_dir: state_dir.clone(),
        log_dir: log_dir.clone(),
        extra_env: HashMap::new(),
    }));

    let mut orchestrator = Orchestrator::new(
        config.clone(),
        feature,
        graph,
        store,
        merge,
        launcher,
        Some(worktrees),
        repo_root.to_path_buf(),
    )?;

    let code = orchestrator.run().await?;
    match code {
        ExitCode::Success => println!("Rush complete."),
        ExitCode::Error => println!("Rush finished with failed tasks."),
        ExitCode::Checkpoint => println!("Rush stopped at a checkpoint."),
        ExitCode::Blocked => {
            println!("Rush paused for intervention; resolve and run `zerg retry`.")
        }
        ExitCode::Escalation => println!("Rush escalated."),
    }
    Ok(code)
}
