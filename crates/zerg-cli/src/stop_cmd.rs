//! `zerg stop`: signal a running orchestrator to shut down gracefully.

use std::path::Path;

use anyhow::{Context, Result};

use zerg_core::config::ZergConfig;

pub fn run_stop(repo_root: &Path, feature: &str) -> Result<()> {
    let config = ZergConfig::load(repo_root)?;
    let state_dir = repo_root.join(&config.directories.state);
    std::fs::create_dir_all(&state_dir)
        .with_context(|| format!("failed to create {}", state_dir.display()))?;

    // The orchestrator checks this marker each tick; on the next tick it
    // terminates workers, pauses, and exits.
    let stop_file = state_dir.join(format!("{feature}.stop"));
    std::fs::write(&stop_file, b"")
        .with_context(|| format!("failed to write {}", stop_file.display()))?;

    println!("Stop requested for {feature}; the orchestrator will exit on its next tick.");
    Ok(())
}
