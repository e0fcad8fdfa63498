//! Repository root and active-feature resolution for CLI commands.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};

use zerg_core::feature::detect_feature;
use zerg_state::validate_feature_name;

/// Resolve the repository root: explicit flag or the current directory.
pub fn repo_root(flag: Option<PathBuf>) -> Result<PathBuf> {
    let root = match flag {
        Some(path) => path,
        None => std::env::current_dir().context("failed to resolve current directory")?,
    };
    if !root.exists() {
        bail!("repository root does not exist: {}", root.display());
    }
    Ok(root)
}

/// Resolve the feature: explicit flag, then `ZERG_FEATURE`, then
/// `.gsd/.current-feature`, then the newest state file.
pub fn require_feature(repo_root: &std::path::Path, flag: Option<String>) -> Result<String> {
    let feature = match flag {
        Some(feature) => feature,
        None => detect_feature(repo_root).context(
            "no active feature; pass --feature, set ZERG_FEATURE, or run from a \
             repository with zerg state",
        )?,
    };
    validate_feature_name(&feature)?;
    Ok(feature)
}
