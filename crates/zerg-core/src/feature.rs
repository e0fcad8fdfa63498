//! Active-feature resolution.
//!
//! The feature is resolved once at process start and then passed explicitly;
//! nothing here mutates process-global state. Priority:
//!
//! 1. `ZERG_FEATURE` env var (terminal-scoped, multi-epic safe)
//! 2. `.gsd/.current-feature` (explicit user intent)
//! 3. newest state file under the state directory

use std::path::Path;

pub use zerg_state::validate_feature_name;

/// Env var overriding the active feature for this terminal session.
pub const FEATURE_ENV_VAR: &str = "ZERG_FEATURE";

/// Detect the active feature for a repository root, or `None` when nothing
/// identifies one.
pub fn detect_feature(repo_root: &Path) -> Option<String> {
    if let Ok(env_feature) = std::env::var(FEATURE_ENV_VAR) {
        let trimmed = env_feature.trim();
        if !trimmed.is_empty() {
            return Some(trimmed.to_owned());
        }
    }

    let current_file = repo_root.join(".gsd").join(".current-feature");
    if let Ok(contents) = std::fs::read_to_string(&current_file) {
        let name = contents.trim();
        if !name.is_empty() {
            return Some(name.to_owned());
        }
    }

    newest_state_feature(&repo_root.join(".zerg").join("state"))
}

/// Stem of the most recently modified `*.json` state file.
fn newest_state_feature(state_dir: &Path) -> Option<String> {
    let entries = std::fs::read_dir(state_dir).ok()?;
    let mut newest: Option<(std::time::SystemTime, String)> = None;

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let Ok(mtime) = entry.metadata().and_then(|m| m.modified()) else {
            continue;
        };
        match &newest {
            Some((best, _)) if *best >= mtime => {}
            _ => newest = Some((mtime, stem.to_owned())),
        }
    }

    newest.map(|(_, stem)| stem)
}
