//! Configuration for zerg, loaded from `.zerg/config.toml`.
//!
//! Every section and field is defaulted so an empty or missing file yields a
//! working configuration.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::backoff::BackoffStrategy;
use crate::gates::GateConfig;

/// Worker pool and retry tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    /// Maximum concurrent workers.
    pub count: u32,
    /// Retry budget per task before permanent failure.
    pub retry_attempts: u32,
    pub backoff_strategy: BackoffStrategy,
    pub backoff_base_seconds: u32,
    pub backoff_max_seconds: u32,
    /// A task `in_progress` longer than this is reaped as an implicit
    /// failure, independent of heartbeats.
    pub task_stale_timeout_seconds: u64,
    pub spawn_timeout_seconds: u64,
    pub spawn_retries: u32,
    /// Grace period between SIGTERM and force kill.
    pub terminate_grace_seconds: u64,
    pub heartbeat_interval_seconds: u64,
    pub heartbeat_stale_seconds: u64,
    pub heartbeat_stalled_seconds: u64,
    /// Command the launcher runs for each worker.
    pub worker_command: String,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: 5,
            retry_attempts: 3,
            backoff_strategy: BackoffStrategy::Exponential,
            backoff_base_seconds: 30,
            backoff_max_seconds: 300,
            task_stale_timeout_seconds: 600,
            spawn_timeout_seconds: 60,
            spawn_retries: 2,
            terminate_grace_seconds: 10,
            heartbeat_interval_seconds: 15,
            heartbeat_stale_seconds: 60,
            heartbeat_stalled_seconds: 180,
            worker_command: "claude".to_owned(),
        }
    }
}

/// Structured log sizing and artifact retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub max_size_mb: u64,
    pub retain_on_success: bool,
    pub retain_on_failure: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            max_size_mb: 50,
            retain_on_success: false,
            retain_on_failure: true,
        }
    }
}

/// Port allocation range.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    pub range_start: u16,
    pub range_end: u16,
    pub ports_per_worker: u16,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            range_start: 49152,
            range_end: 65535,
            ports_per_worker: 10,
        }
    }
}

/// Filesystem layout, relative to the repository root.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoriesConfig {
    pub state: PathBuf,
    pub logs: PathBuf,
    pub worktrees: PathBuf,
    pub specs: PathBuf,
}

impl Default for DirectoriesConfig {
    fn default() -> Self {
        Self {
            state: PathBuf::from(".zerg/state"),
            logs: PathBuf::from(".zerg/logs"),
            worktrees: PathBuf::from(".zerg-worktrees"),
            specs: PathBuf::from(".gsd/specs"),
        }
    }
}

/// Orchestrator loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub tick_interval_ms: u64,
    pub reconcile_interval_seconds: u64,
    pub target_branch: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            reconcile_interval_seconds: 60,
            target_branch: "main".to_owned(),
        }
    }
}

/// Top-level zerg configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ZergConfig {
    pub workers: WorkersConfig,
    pub logging: LoggingConfig,
    pub ports: PortsConfig,
    pub directories: DirectoriesConfig,
    pub orchestrator: OrchestratorConfig,
    /// Quality gates run pre- and post-merge. Empty means no gates.
    pub gates: Vec<GateConfig>,
}

impl ZergConfig {
    /// Path of the config file under a repository root.
    pub fn path_in(repo_root: &Path) -> PathBuf {
        repo_root.join(".zerg").join("config.toml")
    }

    /// Load configuration from `.zerg/config.toml` under `repo_root`.
    /// A missing file yields the defaults; a malformed file is an error.
    pub fn load(repo_root: &Path) -> Result<Self> {
        let path = Self::path_in(repo_root);
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("failed to parse config at {}", path.display()))
    }

    /// Only the gates marked required (the set merge validation runs).
    pub fn required_gates(&self) -> Vec<GateConfig> {
        self.gates.iter().filter(|g| g.required).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_contract() {
        let cfg = ZergConfig::default();
        assert_eq!(cfg.workers.count, 5);
        assert_eq!(cfg.workers.retry_attempts, 3);
        assert_eq!(cfg.workers.backoff_strategy, BackoffStrategy::Exponential);
        assert_eq!(cfg.workers.backoff_base_seconds, 30);
        assert_eq!(cfg.workers.backoff_max_seconds, 300);
        assert_eq!(cfg.workers.task_stale_timeout_seconds, 600);
        assert_eq!(cfg.ports.range_start, 49152);
        assert_eq!(cfg.ports.range_end, 65535);
        assert_eq!(cfg.logging.max_size_mb, 50);
        assert!(!cfg.logging.retain_on_success);
        assert!(cfg.logging.retain_on_failure);
        assert_eq!(cfg.directories.state, PathBuf::from(".zerg/state"));
        assert_eq!(cfg.orchestrator.target_branch, "main");
        assert!(cfg.gates.is_empty());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = ZergConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.workers.count, 5);
    }

    #[test]
    fn partial_file_overrides_only_named_fields() {
        let dir = TempDir::new().unwrap();
        let conf_dir = dir.path().join(".zerg");
        std::fs::create_dir_all(&conf_dir).unwrap();
        std::fs::write(
            conf_dir.join("config.toml"),
            r#"
[workers]
count = 2
backoff_strategy = "linear"

[[gates]]
name = "lint"
command = "cargo clippy"
timeout_seconds = 120
required = true
"#,
        )
        .unwrap();

        let cfg = ZergConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.workers.count, 2);
        assert_eq!(cfg.workers.backoff_strategy, BackoffStrategy::Linear);
        // Untouched fields keep defaults.
        assert_eq!(cfg.workers.retry_attempts, 3);
        assert_eq!(cfg.gates.len(), 1);
        assert_eq!(cfg.required_gates().len(), 1);
        assert_eq!(cfg.gates[0].name, "lint");
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let conf_dir = dir.path().join(".zerg");
        std::fs::create_dir_all(&conf_dir).unwrap();
        std::fs::write(conf_dir.join("config.toml"), "workers = 5").unwrap();
        assert!(ZergConfig::load(dir.path()).is_err());
    }
}
