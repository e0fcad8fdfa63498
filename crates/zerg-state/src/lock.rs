//! Feature-scoped advisory lock file.
//!
//! A plain file containing `"{pid}:{unix_ts}"`, created with
//! `O_CREAT|O_EXCL` so concurrent acquisitions cannot race. Locks are stale
//! after two hours; corrupt or unreadable locks are removed rather than
//! trusted.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::StateError;

/// Linux kernel maximum pid.
const MAX_PID: u32 = 4_194_304;

/// A lock older than this is considered abandoned.
pub const STALE_AFTER_SECONDS: f64 = 7200.0;

/// Information about an active lock.
#[derive(Debug, Clone, PartialEq)]
pub struct LockInfo {
    pub pid: u32,
    pub timestamp: f64,
    pub age_seconds: f64,
}

/// Validate a feature name: alphanumeric start, then alphanumerics, dots,
/// hyphens, underscores. Rejects separators and traversal outright.
pub fn validate_feature_name(feature: &str) -> Result<(), StateError> {
    let invalid = || StateError::InvalidFeature(feature.to_owned());

    if feature.is_empty()
        || feature.contains("..")
        || feature.contains('/')
        || feature.contains('\\')
    {
        return Err(invalid());
    }
    let mut chars = feature.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() => {}
        _ => return Err(invalid()),
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')) {
        return Err(invalid());
    }
    Ok(())
}

/// Advisory lock for one feature, stored under the specs directory.
pub struct FeatureLock {
    lock_path: PathBuf,
}

impl FeatureLock {
    pub fn new(specs_dir: impl Into<PathBuf>, feature: &str) -> Result<Self, StateError> {
        validate_feature_name(feature)?;
        Ok(Self {
            lock_path: specs_dir.into().join(feature).join(".lock"),
        })
    }

    /// Try to acquire the lock. Returns `false` when another live session
    /// holds it. Stale (>2h) and corrupt locks are removed first.
    pub fn acquire(&self) -> Result<bool, StateError> {
        if self.lock_path.exists() {
            match read_lock(&self.lock_path) {
                Some((_pid, ts)) if now_ts() - ts <= STALE_AFTER_SECONDS => {
                    return Ok(false);
                }
                // Stale or unparseable: remove, best-effort.
                _ => {
                    if let Err(e) = fs::remove_file(&self.lock_path) {
                        tracing::debug!(error = %e, "stale lock cleanup failed");
                    }
                }
            }
        }

        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent).map_err(|e| StateError::io(parent, e))?;
        }

        // create_new is O_CREAT|O_EXCL: exactly one contender wins.
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
        {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(StateError::io(&self.lock_path, e)),
        };

        let content = format!("{}:{}", std::process::id(), now_ts());
        file.write_all(content.as_bytes())
            .map_err(|e| StateError::io(&self.lock_path, e))?;
        Ok(true)
    }

    /// Release the lock if owned by this process. Corrupt locks are removed
    /// as cleanup; locks owned by other pids are left intact.
    pub fn release(&self) {
        if !self.lock_path.exists() {
            return;
        }
        if let Some((pid, _ts)) = read_lock(&self.lock_path) {
            if pid != std::process::id() {
                return;
            }
        }
        if let Err(e) = fs::remove_file(&self.lock_path) {
            tracing::debug!(error = %e, "lock release cleanup failed");
        }
    }

    /// Active lock info, or `None` when unlocked, stale, or corrupt.
    pub fn check(&self) -> Option<LockInfo> {
        let (pid, timestamp) = read_lock(&self.lock_path)?;
        let age_seconds = now_ts() - timestamp;
        if age_seconds > STALE_AFTER_SECONDS {
            return None;
        }
        Some(LockInfo {
            pid,
            timestamp,
            age_seconds,
        })
    }
}

fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Parse `"pid:timestamp"` with bounds checking. `None` on anything corrupt
/// or out of range.
fn read_lock(path: &Path) -> Option<(u32, f64)> {
    let content = fs::read_to_string(path).ok()?;
    let content = content.trim();
    let (pid_str, ts_str) = content.split_once(':')?;
    let pid: u32 = pid_str.parse().ok()?;
    let ts: f64 = ts_str.parse().ok()?;
    if pid < 1 || pid > MAX_PID {
        return None;
    }
    if ts <= 0.0 || ts > now_ts() + 86400.0 {
        return None;
    }
    Some((pid, ts))
}
