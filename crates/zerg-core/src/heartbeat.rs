//! Worker heartbeats.
//!
//! Each worker periodically writes a small JSON file describing its current
//! task and step progress. The monitor classifies workers by heartbeat age:
//! fresh, stale (first threshold), or stalled (second threshold). The
//! reconciler and retry manager use this to detect tasks owned by dead
//! workers.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One heartbeat file's contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub worker_id: u32,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub step: Option<String>,
    #[serde(default)]
    pub progress_pct: u32,
    #[serde(default)]
    pub current_step: u32,
    #[serde(default)]
    pub total_steps: u32,
    #[serde(default)]
    pub step_states: Vec<String>,
    pub ts: DateTime<Utc>,
}

/// Liveness classification by heartbeat age.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Fresh,
    /// Older than the stale threshold.
    Stale,
    /// Older than the stalled threshold; the worker is declared dead.
    Stalled,
}

/// One monitor observation.
#[derive(Debug, Clone)]
pub struct HeartbeatReport {
    pub worker_id: u32,
    pub age_seconds: i64,
    pub liveness: Liveness,
    pub heartbeat: Heartbeat,
}

/// Writes this worker's heartbeat file atomically (temp + rename) so the
/// monitor never observes a partial document.
#[derive(Debug, Clone)]
pub struct HeartbeatWriter {
    dir: PathBuf,
    worker_id: u32,
}

impl HeartbeatWriter {
    pub fn new(dir: impl Into<PathBuf>, worker_id: u32) -> Self {
        Self {
            dir: dir.into(),
            worker_id,
        }
    }

    fn path(&self) -> PathBuf {
        heartbeat_path(&self.dir, self.worker_id)
    }

    /// Write a heartbeat with step progress.
    pub fn write_progress(
        &self,
        task_id: Option<&str>,
        step: Option<&str>,
        progress_pct: u32,
        current_step: u32,
        total_steps: u32,
        step_states: &[String],
    ) -> std::io::Result<()> {
        self.write(&Heartbeat {
            worker_id: self.worker_id,
            task_id: task_id.map(str::to_owned),
            step: step.map(str::to_owned),
            progress_pct,
            current_step,
            total_steps,
            step_states: step_states.to_vec(),
            ts: Utc::now(),
        })
    }

    /// Write a bare liveness beat.
    pub fn beat(&self, task_id: Option<&str>) -> std::io::Result<()> {
        self.write_progress(task_id, None, 0, 0, 0, &[])
    }

    fn write(&self, heartbeat: &Heartbeat) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_vec(heartbeat)?;
        let tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        std::fs::write(tmp.path(), &json)?;
        tmp.persist(self.path()).map_err(|e| e.error)?;
        Ok(())
    }
}

fn heartbeat_path(dir: &Path, worker_id: u32) -> PathBuf {
    dir.join(format!("worker-{worker_id}.json"))
}

/// Reads heartbeat files and classifies worker liveness.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    dir: PathBuf,
    stale_threshold_seconds: i64,
    stalled_threshold_seconds: i64,
}

impl HeartbeatMonitor {
    pub fn new(
        dir: impl Into<PathBuf>,
        stale_threshold_seconds: u64,
        stalled_threshold_seconds: u64,
    ) -> Self {
        Self {
            dir: dir.into(),
            stale_threshold_seconds: stale_threshold_seconds as i64,
            stalled_threshold_seconds: stalled_threshold_seconds as i64,
        }
    }

    /// Read one worker's heartbeat, if present and parseable.
    pub fn read(&self, worker_id: u32) -> Option<Heartbeat> {
        let text = std::fs::read_to_string(heartbeat_path(&self.dir, worker_id)).ok()?;
        serde_json::from_str(&text).ok()
    }

    /// Observe every heartbeat file in the directory.
    pub fn check(&self) -> Vec<HeartbeatReport> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let now = Utc::now();
        let mut reports = Vec::new();

        for entry in entries.flatten() {
            let path = entry.path();
            let Some(worker_id) = parse_worker_file(&path) else {
                continue;
            };
            let Ok(text) = std::fs::read_to_string(&path) else {
                continue;
            };
            let Ok(heartbeat) = serde_json::from_str::<Heartbeat>(&text) else {
                tracing::warn!(worker_id, "unparseable heartbeat file");
                continue;
            };

            let age_seconds = (now - heartbeat.ts).num_seconds();
            let liveness = if age_seconds > self.stalled_threshold_seconds {
                Liveness::Stalled
            } else if age_seconds > self.stale_threshold_seconds {
                Liveness::Stale
            } else {
                Liveness::Fresh
            };
            if liveness != Liveness::Fresh {
                tracing::warn!(worker_id, age_seconds, ?liveness, "heartbeat stale");
            }
            reports.push(HeartbeatReport {
                worker_id,
                age_seconds,
                liveness,
                heartbeat,
            });
        }

        reports.sort_by_key(|r| r.worker_id);
        reports
    }

    /// Workers whose heartbeat is not past the stale threshold.
    pub fn active_worker_ids(&self) -> HashSet<u32> {
        self.check()
            .into_iter()
            .filter(|r| r.liveness == Liveness::Fresh)
            .map(|r| r.worker_id)
            .collect()
    }

    /// Workers past the stalled threshold, declared dead.
    pub fn stalled_worker_ids(&self) -> HashSet<u32> {
        self.check()
            .into_iter()
            .filter(|r| r.liveness == Liveness::Stalled)
            .map(|r| r.worker_id)
            .collect()
    }
}

/// `worker-{id}.json` -> id
fn parse_worker_file(path: &Path) -> Option<u32> {
    let name = path.file_name()?.to_str()?;
    let id = name.strip_prefix("worker-")?.strip_suffix(".json")?;
    id.parse().ok()
}
