//! `zerg merge`: run the level merge flow directly.

use std::path::Path;

use anyhow::{Result, bail};

use zerg_core::config::ZergConfig;
use zerg_core::git::GitOps;
use zerg_core::merge::MergeCoordinator;
use zerg_state::StateStore;

pub async fn run_merge(
    repo_root: &Path,
    feature: &str,
    level: u32,
    target: &str,
) -> Result<()> {
    let config = ZergConfig::load(repo_root)?;
    let store = StateStore::open(feature, repo_root.join(&config.directories.state))?;
    let coordinator = MergeCoordinator::new(
        feature,
        store,
        GitOps::new(repo_root)?,
        config.required_gates(),
    );

    let branches = coordinator.mergeable_branches()?;
    println!(
        "Merging level {level} for {feature}: {} worker branch(es) into {target}",
        branches.len()
    );
    for branch in &branches {
        println!("  {branch}");
    }

    let result = coordinator.full_merge_flow(level, Some(branches), target).await;

    for gate in &result.gate_results {
        println!("  gate {}: {} ({}ms)", gate.name, gate.outcome, gate.duration_ms);
    }

    if result.success {
        match result.merge_commit {
            Some(commit) => println!("Merge complete: {commit}"),
            None => println!("Merge complete (nothing to merge)."),
        }
        Ok(())
    } else if result.is_conflict() {
        eprintln!("\nMerge conflict:");
        for file in &result.conflicting_files {
            eprintln!("  {file}");
        }
        eprintln!("\nResolve manually and re-run.");
        bail!("merge conflict at level {level}");
    } else {
        bail!(
            "merge failed at level {level}: {}",
            result.error.unwrap_or_else(|| "unknown error".into())
        );
    }
}
