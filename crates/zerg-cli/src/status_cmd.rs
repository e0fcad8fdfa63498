//! `zerg status`: print a feature's current state.

use std::path::Path;

use anyhow::Result;

use zerg_core::config::ZergConfig;
use zerg_state::{StateStore, TaskStatus};

pub fn run_status(repo_root: &Path, feature: &str) -> Result<()> {
    let config = ZergConfig::load(repo_root)?;
    let store = StateStore::open(feature, repo_root.join(&config.directories.state))?;
    let doc = store.reload()?;

    println!("Feature: {}", doc.feature);
    println!("Started: {}", doc.started_at.to_rfc3339());
    println!("Current level: {}", doc.current_level);
    if doc.paused {
        println!("Paused: yes");
    }
    if let Some(error) = &doc.error {
        println!("Error: {error}");
    }

    let total = doc.tasks.len();
    let count =
        |status: TaskStatus| doc.tasks.values().filter(|t| t.status == status).count();
    println!(
        "\nTasks: {total} total, {} complete, {} failed, {} in progress, {} waiting retry",
        count(TaskStatus::Complete),
        count(TaskStatus::Failed),
        count(TaskStatus::InProgress),
        count(TaskStatus::WaitingRetry),
    );

    if !doc.levels.is_empty() {
        println!("\nLevels:");
        for (level, record) in &doc.levels {
            let merge = record
                .merge_status
                .map(|s| format!(", merge {s}"))
                .unwrap_or_default();
            let commit = record
                .merge_commit
                .as_deref()
                .map(|c| format!(" @ {}", &c[..8.min(c.len())]))
                .unwrap_or_default();
            println!("  {level}: {}{merge}{commit}", record.status);
        }
    }

    if !doc.workers.is_empty() {
        println!("\nWorkers:");
        for (id, worker) in &doc.workers {
            let task = worker
                .current_task
                .as_deref()
                .map(|t| format!(" on {t}"))
                .unwrap_or_default();
            println!(
                "  {id}: {}{task} ({} done, branch {})",
                worker.status, worker.tasks_completed, worker.branch
            );
        }
    }

    let failed: Vec<&String> = doc
        .tasks
        .iter()
        .filter(|(_, t)| t.status == TaskStatus::Failed)
        .map(|(id, _)| id)
        .collect();
    if !failed.is_empty() {
        println!("\nFailed tasks (retry with `zerg retry`):");
        for id in failed {
            let error = doc.tasks[id].error.as_deref().unwrap_or("unknown error");
            println!("  {id}: {error}");
        }
    }

    Ok(())
}
