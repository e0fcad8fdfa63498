use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Execution status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    Pending,
    Claimed,
    InProgress,
    Verifying,
    Complete,
    Failed,
    WaitingRetry,
    Blocked,
}

impl TaskStatus {
    /// Whether the status is terminal (no further transitions expected).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Whether a task in this status can be claimed by a worker.
    pub fn is_claimable(self) -> bool {
        matches!(self, Self::Todo | Self::Pending)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Todo => "todo",
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::InProgress => "in_progress",
            Self::Verifying => "verifying",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::WaitingRetry => "waiting_retry",
            Self::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "todo" => Ok(Self::Todo),
            "pending" => Ok(Self::Pending),
            "claimed" => Ok(Self::Claimed),
            "in_progress" => Ok(Self::InProgress),
            "verifying" => Ok(Self::Verifying),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            "waiting_retry" => Ok(Self::WaitingRetry),
            "blocked" => Ok(Self::Blocked),
            other => Err(StatusParseError::new("task status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Status of a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Initializing,
    Ready,
    Running,
    Idle,
    Checkpointing,
    Stopping,
    Stopped,
    Crashed,
    Blocked,
    Stalled,
}

impl WorkerStatus {
    /// Whether the worker counts toward the launcher's `alive` total.
    pub fn is_alive(self) -> bool {
        matches!(
            self,
            Self::Running | Self::Idle | Self::Initializing | Self::Ready
        )
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Idle => "idle",
            Self::Checkpointing => "checkpointing",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Crashed => "crashed",
            Self::Blocked => "blocked",
            Self::Stalled => "stalled",
        };
        f.write_str(s)
    }
}

impl FromStr for WorkerStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initializing" => Ok(Self::Initializing),
            "ready" => Ok(Self::Ready),
            "running" => Ok(Self::Running),
            "idle" => Ok(Self::Idle),
            "checkpointing" => Ok(Self::Checkpointing),
            "stopping" => Ok(Self::Stopping),
            "stopped" => Ok(Self::Stopped),
            "crashed" => Ok(Self::Crashed),
            "blocked" => Ok(Self::Blocked),
            "stalled" => Ok(Self::Stalled),
            other => Err(StatusParseError::new("worker status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Run status of a level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LevelRunStatus {
    Pending,
    Running,
    Complete,
}

impl fmt::Display for LevelRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Complete => "complete",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------

/// State of the level-merge protocol for a single level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LevelMergeStatus {
    Pending,
    Waiting,
    Collecting,
    Merging,
    Validating,
    Rebasing,
    Complete,
    Conflict,
    Failed,
}

impl fmt::Display for LevelMergeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Waiting => "waiting",
            Self::Collecting => "collecting",
            Self::Merging => "merging",
            Self::Validating => "validating",
            Self::Rebasing => "rebasing",
            Self::Complete => "complete",
            Self::Conflict => "conflict",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for LevelMergeStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "waiting" => Ok(Self::Waiting),
            "collecting" => Ok(Self::Collecting),
            "merging" => Ok(Self::Merging),
            "validating" => Ok(Self::Validating),
            "rebasing" => Ok(Self::Rebasing),
            "complete" => Ok(Self::Complete),
            "conflict" => Ok(Self::Conflict),
            "failed" => Ok(Self::Failed),
            other => Err(StatusParseError::new("level merge status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Outcome of running a single quality gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateOutcome {
    Pass,
    Fail,
    Skip,
    Timeout,
    Error,
}

impl fmt::Display for GateOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Skip => "skip",
            Self::Timeout => "timeout",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------

/// Process exit codes produced by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success,
    Error,
    Checkpoint,
    Blocked,
    Escalation,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Error => 1,
            Self::Checkpoint => 2,
            Self::Blocked => 3,
            Self::Escalation => 4,
        }
    }
}

// ---------------------------------------------------------------------------

/// Error returned when parsing an invalid status string.
#[derive(Debug, Clone)]
pub struct StatusParseError {
    kind: &'static str,
    value: String,
}

impl StatusParseError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_owned(),
        }
    }
}

impl fmt::Display for StatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {:?}", self.kind, self.value)
    }
}

impl std::error::Error for StatusParseError {}

// ---------------------------------------------------------------------------
// Level names
// ---------------------------------------------------------------------------

/// Human name for a level number.
///
/// Levels 1 through 5 carry the conventional wave names; anything higher
/// falls back to `level_{n}`.
pub fn level_name(level: u32) -> String {
    match level {
        1 => "foundation".to_owned(),
        2 => "core".to_owned(),
        3 => "integration".to_owned(),
        4 => "commands".to_owned(),
        5 => "quality".to_owned(),
        n => format!("level_{n}"),
    }
}
