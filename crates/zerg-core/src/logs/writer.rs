//! Structured JSONL log writer and per-task artifact capture.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::LoggingConfig;

/// Log severity for structured entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Execution phases for structured logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogPhase {
    Claim,
    Execute,
    Verify,
    Commit,
    Cleanup,
}

impl fmt::Display for LogPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Claim => "claim",
            Self::Execute => "execute",
            Self::Verify => "verify",
            Self::Commit => "commit",
            Self::Cleanup => "cleanup",
        };
        f.write_str(s)
    }
}

/// Structured log event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    VerificationPassed,
    VerificationFailed,
    ArtifactCaptured,
    LevelStarted,
    LevelComplete,
    MergeStarted,
    MergeComplete,
    HeartbeatStale,
    EscalationCreated,
    EscalationResolved,
    WorkerAutoRestarted,
    WorkerSpawned,
    WorkerExited,
    WorkerReassigned,
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TaskStarted => "task_started",
            Self::TaskCompleted => "task_completed",
            Self::TaskFailed => "task_failed",
            Self::VerificationPassed => "verification_passed",
            Self::VerificationFailed => "verification_failed",
            Self::ArtifactCaptured => "artifact_captured",
            Self::LevelStarted => "level_started",
            Self::LevelComplete => "level_complete",
            Self::MergeStarted => "merge_started",
            Self::MergeComplete => "merge_complete",
            Self::HeartbeatStale => "heartbeat_stale",
            Self::EscalationCreated => "escalation_created",
            Self::EscalationResolved => "escalation_resolved",
            Self::WorkerAutoRestarted => "worker_auto_restarted",
            Self::WorkerSpawned => "worker_spawned",
            Self::WorkerExited => "worker_exited",
            Self::WorkerReassigned => "worker_reassigned",
        };
        f.write_str(s)
    }
}

/// Who is writing: a numbered worker or the orchestrator itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterId {
    Worker(u32),
    Orchestrator,
}

impl WriterId {
    fn json_value(self) -> serde_json::Value {
        match self {
            Self::Worker(id) => json!(id),
            Self::Orchestrator => json!("orchestrator"),
        }
    }

    fn file_path(self, log_dir: &Path) -> PathBuf {
        match self {
            Self::Worker(id) => log_dir.join("workers").join(format!("worker-{id}.jsonl")),
            Self::Orchestrator => log_dir.join("orchestrator.jsonl"),
        }
    }
}

/// Optional fields for one structured entry.
#[derive(Debug, Clone, Default)]
pub struct LogFields {
    pub task_id: Option<String>,
    pub phase: Option<LogPhase>,
    pub event: Option<LogEvent>,
    pub data: Option<serde_json::Value>,
    pub duration_ms: Option<i64>,
}

impl LogFields {
    pub fn task(task_id: &str) -> Self {
        Self {
            task_id: Some(task_id.to_owned()),
            ..Self::default()
        }
    }

    pub fn event(mut self, event: LogEvent) -> Self {
        self.event = Some(event);
        self
    }

    pub fn phase(mut self, phase: LogPhase) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn duration_ms(mut self, ms: i64) -> Self {
        self.duration_ms = Some(ms);
        self
    }
}

/// Appends structured JSONL entries to a per-writer file.
///
/// Thread-safe: emits serialize under a mutex. When the file grows past the
/// size cap it is renamed to `*.jsonl.1` (replacing any previous rotation)
/// and a fresh file is opened. Rotation failures are logged and ignored.
pub struct StructuredLogWriter {
    file_path: PathBuf,
    file: Mutex<File>,
    max_size_bytes: u64,
    writer_id: WriterId,
    feature: String,
}

impl StructuredLogWriter {
    pub fn new(
        log_dir: impl Into<PathBuf>,
        writer_id: WriterId,
        feature: &str,
        max_size_mb: u64,
    ) -> std::io::Result<Self> {
        let log_dir = log_dir.into();
        let file_path = writer_id.file_path(&log_dir);
        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().append(true).create(true).open(&file_path)?;

        Ok(Self {
            file_path,
            file: Mutex::new(file),
            max_size_bytes: max_size_mb * 1024 * 1024,
            writer_id,
            feature: feature.to_owned(),
        })
    }

    /// Path of the active log file.
    pub fn path(&self) -> &Path {
        &self.file_path
    }

    /// Write one structured entry.
    pub fn emit(&self, level: LogLevel, message: &str, fields: LogFields) {
        let mut entry = json!({
            "ts": Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            "level": level.to_string(),
            "worker_id": self.writer_id.json_value(),
            "feature": self.feature,
            "message": message,
        });
        let map = entry.as_object_mut().unwrap_or_else(|| unreachable!());
        if let Some(task_id) = fields.task_id {
            map.insert("task_id".into(), json!(task_id));
        }
        if let Some(phase) = fields.phase {
            map.insert("phase".into(), json!(phase.to_string()));
        }
        if let Some(event) = fields.event {
            map.insert("event".into(), json!(event.to_string()));
        }
        if let Some(data) = fields.data {
            map.insert("data".into(), data);
        }
        if let Some(ms) = fields.duration_ms {
            map.insert("duration_ms".into(), json!(ms));
        }

        let line = format!("{entry}\n");
        let mut file = self.file.lock();
        self.rotate_if_needed(&mut file);
        if let Err(e) = file.write_all(line.as_bytes()).and_then(|()| file.flush()) {
            tracing::warn!(error = %e, "structured log write failed");
        }
    }

    /// Rotate when the file exceeds the size cap. Best-effort.
    fn rotate_if_needed(&self, file: &mut File) {
        let size = match file.metadata() {
            Ok(meta) => meta.len(),
            Err(_) => return,
        };
        if size <= self.max_size_bytes {
            return;
        }

        let rotated = self.file_path.with_extension("jsonl.1");
        let result = fs::rename(&self.file_path, &rotated).and_then(|()| {
            OpenOptions::new()
                .append(true)
                .create(true)
                .open(&self.file_path)
        });
        match result {
            Ok(fresh) => {
                *file = fresh;
                tracing::debug!(path = %self.file_path.display(), "rotated log file");
            }
            Err(e) => tracing::debug!(error = %e, "log rotation failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Task artifacts
// ---------------------------------------------------------------------------

/// Names of the per-task artifact files.
const ARTIFACT_NAMES: [&str; 4] = [
    "execution.jsonl",
    "claude_output.txt",
    "verification_output.txt",
    "git_diff.patch",
];

/// Captures per-task artifacts into `tasks/{task_id}/`.
pub struct TaskArtifactCapture {
    task_dir: PathBuf,
}

impl TaskArtifactCapture {
    pub fn new(log_dir: impl Into<PathBuf>, task_id: &str) -> std::io::Result<Self> {
        let task_dir = log_dir.into().join("tasks").join(task_id);
        fs::create_dir_all(&task_dir)?;
        Ok(Self { task_dir })
    }

    pub fn task_dir(&self) -> &Path {
        &self.task_dir
    }

    /// Capture agent stdout/stderr.
    pub fn capture_agent_output(&self, stdout: &str, stderr: &str) -> std::io::Result<()> {
        let mut out = String::new();
        if !stdout.is_empty() {
            out.push_str("=== STDOUT ===\n");
            out.push_str(stdout);
            out.push('\n');
        }
        if !stderr.is_empty() {
            out.push_str("=== STDERR ===\n");
            out.push_str(stderr);
            out.push('\n');
        }
        fs::write(self.task_dir.join("claude_output.txt"), out)
    }

    /// Capture verification command output.
    pub fn capture_verification(
        &self,
        stdout: &str,
        stderr: &str,
        exit_code: i32,
    ) -> std::io::Result<()> {
        let mut out = format!("Exit code: {exit_code}\n");
        if !stdout.is_empty() {
            out.push_str("=== STDOUT ===\n");
            out.push_str(stdout);
            out.push('\n');
        }
        if !stderr.is_empty() {
            out.push_str("=== STDERR ===\n");
            out.push_str(stderr);
            out.push('\n');
        }
        fs::write(self.task_dir.join("verification_output.txt"), out)
    }

    /// Capture the git diff of the worker's changes.
    pub fn capture_git_diff(&self, diff_text: &str) -> std::io::Result<()> {
        fs::write(self.task_dir.join("git_diff.patch"), diff_text)
    }

    /// Append an event to `execution.jsonl`, stamping `ts` when absent.
    pub fn write_event(&self, mut event: serde_json::Value) -> std::io::Result<()> {
        if let Some(map) = event.as_object_mut() {
            map.entry("ts").or_insert_with(|| {
                json!(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true))
            });
        }
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(self.task_dir.join("execution.jsonl"))?;
        writeln!(file, "{event}")
    }

    /// Apply the retention policy after task completion. When retention says
    /// no, the whole artifact directory is removed (best-effort).
    pub fn cleanup(&self, success: bool, config: &LoggingConfig) {
        let retain = (success && config.retain_on_success)
            || (!success && config.retain_on_failure);
        if retain {
            return;
        }
        if let Err(e) = fs::remove_dir_all(&self.task_dir) {
            tracing::debug!(error = %e, "artifact cleanup failed");
        }
    }

    /// Paths of existing artifacts, by name.
    pub fn artifact_paths(&self) -> Vec<(String, PathBuf)> {
        ARTIFACT_NAMES
            .iter()
            .filter_map(|name| {
                let path = self.task_dir.join(name);
                path.exists().then(|| ((*name).to_owned(), path))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn read_lines(path: &Path) -> Vec<serde_json::Value> {
        fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn emit_writes_one_json_object_per_line() {
        let dir = TempDir::new().unwrap();
        let writer =
            StructuredLogWriter::new(dir.path(), WriterId::Worker(2), "feat", 50).unwrap();

        writer.emit(LogLevel::Info, "claimed task", LogFields::task("T1"));
        writer.emit(
            LogLevel::Warn,
            "verification failed",
            LogFields::task("T1")
                .event(LogEvent::VerificationFailed)
                .phase(LogPhase::Verify)
                .data(json!({"exit_code": 1}))
                .duration_ms(1200),
        );

        let entries = read_lines(writer.path());
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["level"], "info");
        assert_eq!(entries[0]["worker_id"], 2);
        assert_eq!(entries[0]["feature"], "feat");
        assert_eq!(entries[0]["task_id"], "T1");
        assert!(entries[0]["ts"].as_str().unwrap().ends_with('Z'));
        assert_eq!(entries[1]["event"], "verification_failed");
        assert_eq!(entries[1]["phase"], "verify");
        assert_eq!(entries[1]["data"]["exit_code"], 1);
        assert_eq!(entries[1]["duration_ms"], 1200);
    }

    #[test]
    fn orchestrator_writes_to_root_file() {
        let dir = TempDir::new().unwrap();
        let writer =
            StructuredLogWriter::new(dir.path(), WriterId::Orchestrator, "feat", 50).unwrap();
        writer.emit(LogLevel::Info, "tick", LogFields::default());

        assert!(dir.path().join("orchestrator.jsonl").exists());
        let entries = read_lines(writer.path());
        assert_eq!(entries[0]["worker_id"], "orchestrator");
    }

    #[test]
    fn rotation_renames_to_dot_one() {
        let dir = TempDir::new().unwrap();
        // Cap of 0 MB forces rotation as soon as anything is in the file.
        let writer =
            StructuredLogWriter::new(dir.path(), WriterId::Worker(0), "feat", 0).unwrap();

        writer.emit(LogLevel::Info, "first", LogFields::default());
        writer.emit(LogLevel::Info, "second", LogFields::default());
        writer.emit(LogLevel::Info, "third", LogFields::default());

        let rotated = writer.path().with_extension("jsonl.1");
        assert!(rotated.exists(), "rotated file should exist");
        // The active file holds only the latest entry.
        let entries = read_lines(writer.path());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["message"], "third");
    }

    #[test]
    fn artifacts_capture_and_list() {
        let dir = TempDir::new().unwrap();
        let capture = TaskArtifactCapture::new(dir.path(), "T1").unwrap();

        capture.capture_agent_output("hello", "oops").unwrap();
        capture.capture_verification("ok", "", 0).unwrap();
        capture.capture_git_diff("--- a\n+++ b\n").unwrap();
        capture.write_event(json!({"event": "step_done", "step": 1})).unwrap();

        let names: Vec<String> = capture
            .artifact_paths()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(
            names,
            vec![
                "execution.jsonl",
                "claude_output.txt",
                "verification_output.txt",
                "git_diff.patch"
            ]
        );

        let output =
            fs::read_to_string(capture.task_dir().join("claude_output.txt")).unwrap();
        assert!(output.contains("=== STDOUT ===\nhello"));
        assert!(output.contains("=== STDERR ===\noops"));

        let events = read_lines(&capture.task_dir().join("execution.jsonl"));
        assert_eq!(events[0]["event"], "step_done");
        assert!(events[0]["ts"].is_string(), "ts stamped when absent");
    }

    #[test]
    fn retention_policy_governs_cleanup() {
        let dir = TempDir::new().unwrap();
        let config = LoggingConfig {
            max_size_mb: 50,
            retain_on_success: false,
            retain_on_failure: true,
        };

        let success = TaskArtifactCapture::new(dir.path(), "ok-task").unwrap();
        success.capture_git_diff("diff").unwrap();
        success.cleanup(true, &config);
        assert!(!success.task_dir().exists(), "success artifacts dropped");

        let failure = TaskArtifactCapture::new(dir.path(), "bad-task").unwrap();
        failure.capture_git_diff("diff").unwrap();
        failure.cleanup(false, &config);
        assert!(failure.task_dir().exists(), "failure artifacts retained");
    }
}
