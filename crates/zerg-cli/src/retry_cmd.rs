//! `zerg retry`: requeue failed tasks and clear the paused state.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Result, bail};
use parking_lot::Mutex;

use zerg_core::config::ZergConfig;
use zerg_core::levels::LevelController;
use zerg_core::retry::TaskRetryManager;
use zerg_state::StateStore;

pub fn run_retry(
    repo_root: &Path,
    feature: &str,
    task_id: Option<&str>,
    all_failed: bool,
) -> Result<()> {
    let config = ZergConfig::load(repo_root)?;
    let store = StateStore::open(feature, repo_root.join(&config.directories.state))?;
    store.reload()?;

    // Rebuild the controller view from disk so counters stay honest.
    let doc = store.snapshot();
    let mut controller = LevelController::new();
    controller.initialize(doc.tasks.iter().map(|(id, t)| (id.as_str(), t.level)));
    let levels = Arc::new(Mutex::new(controller));

    let manager = TaskRetryManager::new(config.workers.clone(), store.clone(), levels, None);

    let retried = match (task_id, all_failed) {
        (Some(task_id), false) => {
            if !manager.retry_task(task_id)? {
                bail!("task {task_id:?} is not in a failed state");
            }
            vec![task_id.to_owned()]
        }
        (None, true) => manager.retry_all_failed()?,
        (Some(_), true) => bail!("pass either a task id or --all-failed, not both"),
        (None, false) => bail!("pass a task id or --all-failed"),
    };

    if retried.is_empty() {
        println!("No failed tasks to retry.");
        return Ok(());
    }

    // Resuming after an operator retry clears the pause and the recoverable
    // error so the orchestrator can pick the work back up.
    store.set_paused(false)?;
    store.set_error(None)?;

    println!("Queued {} task(s) for retry:", retried.len());
    for task_id in retried {
        println!("  {task_id}");
    }
    Ok(())
}
