//! Ordered step execution within a task.
//!
//! Tasks may carry a list of TDD-style steps (write test, verify fail,
//! implement, verify pass, format, commit). Steps run in strict order; the
//! first failure fails the task at that step number and marks the remainder
//! skipped. Tasks without steps run in classic mode and report success.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::gates::run_shell_command;
use crate::heartbeat::HeartbeatWriter;

const MAX_CAPTURED_OUTPUT: usize = 10_000;

/// TDD step action kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    WriteTest,
    VerifyFail,
    Implement,
    VerifyPass,
    Format,
    Commit,
}

/// How a step's exit code is judged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepVerify {
    /// Expect exit code 0.
    #[default]
    ExitCode,
    /// Expect a non-zero exit (a test that should fail).
    ExitCodeNonzero,
    /// No verification.
    None,
}

/// Execution state of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl StepState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// One step as declared in the task graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    /// 1-indexed step number.
    pub step: u32,
    pub action: StepAction,
    #[serde(default)]
    pub file: Option<String>,
    /// Command to run; a step without one is documentation-only.
    #[serde(default)]
    pub run: Option<String>,
    #[serde(default)]
    pub verify: StepVerify,
    #[serde(default)]
    pub code_snippet: Option<String>,
}

/// Result of executing one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_number: u32,
    pub action: StepAction,
    pub state: StepState,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: i64,
    pub error_message: Option<String>,
}

/// Result of executing a task's steps (or classic mode).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRunResult {
    pub task_id: String,
    pub success: bool,
    /// 1-indexed number of the step that failed, if any.
    pub failed_step: Option<u32>,
    pub step_results: Vec<StepResult>,
    pub total_duration_ms: i64,
    pub error_message: Option<String>,
}

/// Executes a task's steps in strict order.
pub struct StepExecutor {
    task_id: String,
    working_dir: PathBuf,
    default_timeout: Duration,
    heartbeat: Option<HeartbeatWriter>,
    step_states: Vec<StepState>,
}

impl StepExecutor {
    pub fn new(
        task_id: &str,
        working_dir: impl Into<PathBuf>,
        default_timeout: Duration,
        heartbeat: Option<HeartbeatWriter>,
    ) -> Self {
        Self {
            task_id: task_id.to_owned(),
            working_dir: working_dir.into(),
            default_timeout,
            heartbeat,
            step_states: Vec::new(),
        }
    }

    /// Execute all steps. Empty step lists are classic mode: success with no
    /// step-level tracking.
    pub async fn execute(&mut self, steps: &[StepSpec]) -> TaskRunResult {
        let start = Instant::now();

        if steps.is_empty() {
            tracing::debug!(task_id = %self.task_id, "no steps, classic mode");
            return TaskRunResult {
                task_id: self.task_id.clone(),
                success: true,
                failed_step: None,
                step_results: Vec::new(),
                total_duration_ms: 0,
                error_message: None,
            };
        }

        let total = steps.len();
        self.step_states = vec![StepState::Pending; total];
        let mut step_results = Vec::with_capacity(total);

        tracing::info!(task_id = %self.task_id, steps = total, "executing steps");

        for (idx, step) in steps.iter().enumerate() {
            let step_number = step.step;
            self.step_states[idx] = StepState::InProgress;
            self.update_heartbeat(step_number, total as u32);

            let result = self.execute_step(step).await;
            let failed = result.state == StepState::Failed;
            step_results.push(result);

            if failed {
                self.step_states[idx] = StepState::Failed;
                for remaining in &mut self.step_states[idx + 1..] {
                    *remaining = StepState::Skipped;
                }
                self.update_heartbeat(step_number, total as u32);

                let error_message = step_results
                    .last()
                    .and_then(|r| r.error_message.clone());
                tracing::warn!(
                    task_id = %self.task_id,
                    step = step_number,
                    action = ?step.action,
                    "task failed at step"
                );
                return TaskRunResult {
                    task_id: self.task_id.clone(),
                    success: false,
                    failed_step: Some(step_number),
                    step_results,
                    total_duration_ms: elapsed_ms(start),
                    error_message,
                };
            }

            self.step_states[idx] = StepState::Completed;
        }

        self.update_heartbeat(total as u32, total as u32);
        tracing::info!(task_id = %self.task_id, steps = total, "all steps completed");
        TaskRunResult {
            task_id: self.task_id.clone(),
            success: true,
            failed_step: None,
            step_results,
            total_duration_ms: elapsed_ms(start),
            error_message: None,
        }
    }

    async fn execute_step(&self, step: &StepSpec) -> StepResult {
        let Some(command) = step.run.as_deref().filter(|c| !c.is_empty()) else {
            // Documentation-only step.
            return StepResult {
                step_number: step.step,
                action: step.action,
                state: StepState::Completed,
                exit_code: None,
                stdout: String::new(),
                stderr: String::new(),
                duration_ms: 0,
                error_message: None,
            };
        };

        let start = Instant::now();
        match run_shell_command(command, &self.working_dir, self.default_timeout).await {
            Ok(output) if output.timed_out => StepResult {
                step_number: step.step,
                action: step.action,
                state: StepState::Failed,
                exit_code: None,
                stdout: String::new(),
                stderr: String::new(),
                duration_ms: output.duration_ms,
                error_message: Some(format!(
                    "step {} timed out after {}s",
                    step.step,
                    self.default_timeout.as_secs()
                )),
            },
            Ok(output) => {
                let exit_code = output.exit_code.unwrap_or(-1);
                let passed = verify_exit_code(exit_code, step.verify);
                let error_message = (!passed)
                    .then(|| format_verification_error(exit_code, step.verify, &output.stderr));
                StepResult {
                    step_number: step.step,
                    action: step.action,
                    state: if passed {
                        StepState::Completed
                    } else {
                        StepState::Failed
                    },
                    exit_code: output.exit_code,
                    stdout: truncate(output.stdout),
                    stderr: truncate(output.stderr),
                    duration_ms: output.duration_ms,
                    error_message,
                }
            }
            Err(e) => StepResult {
                step_number: step.step,
                action: step.action,
                state: StepState::Failed,
                exit_code: None,
                stdout: String::new(),
                stderr: String::new(),
                duration_ms: elapsed_ms(start),
                error_message: Some(format!("execution error: {e}")),
            },
        }
    }

    /// Heartbeat updates are best-effort; a failure must not fail the step.
    fn update_heartbeat(&self, current_step: u32, total_steps: u32) {
        let Some(writer) = &self.heartbeat else {
            return;
        };
        let progress_pct = if total_steps > 0 {
            current_step * 100 / total_steps
        } else {
            0
        };
        let states: Vec<String> = self
            .step_states
            .iter()
            .map(|s| s.as_str().to_owned())
            .collect();
        if let Err(e) = writer.write_progress(
            Some(&self.task_id),
            Some(&format!("step_{current_step}")),
            progress_pct,
            current_step,
            total_steps,
            &states,
        ) {
            tracing::debug!(error = %e, "heartbeat update failed");
        }
    }
}

fn verify_exit_code(exit_code: i32, mode: StepVerify) -> bool {
    match mode {
        StepVerify::ExitCode => exit_code == 0,
        StepVerify::ExitCodeNonzero => exit_code != 0,
        StepVerify::None => true,
    }
}

fn format_verification_error(exit_code: i32, mode: StepVerify, stderr: &str) -> String {
    let mut msg = match mode {
        StepVerify::ExitCode => format!("expected exit code 0 but got {exit_code}"),
        StepVerify::ExitCodeNonzero => {
            format!("expected non-zero exit code but got {exit_code}")
        }
        StepVerify::None => format!("verification failed with exit code {exit_code}"),
    };
    if !stderr.is_empty() {
        let mut preview: String = stderr.chars().take(200).collect();
        if stderr.chars().count() > 200 {
            preview.push_str("...");
        }
        msg.push_str(": ");
        msg.push_str(&preview);
    }
    msg
}

fn truncate(mut s: String) -> String {
    if s.len() > MAX_CAPTURED_OUTPUT {
        let mut end = MAX_CAPTURED_OUTPUT;
        while end > 0 && !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
    }
    s
}

fn elapsed_ms(start: Instant) -> i64 {
    i64::try_from(start.elapsed().as_millis()).unwrap_or(i64::MAX)
}
