//! Quality gate execution.
//!
//! Gates are configured shell commands (lint, test, build) run against a
//! working tree with a timeout. Outcomes classify as pass, fail, skip,
//! timeout, or error; the merge coordinator runs the required set before and
//! after each level merge.

use std::path::Path;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use zerg_state::GateOutcome;

/// One configured quality gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateConfig {
    pub name: String,
    pub command: String,
    #[serde(default = "default_gate_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_gate_timeout() -> u64 {
    300
}

fn default_required() -> bool {
    true
}

/// Result of running one gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateRunResult {
    pub name: String,
    pub outcome: GateOutcome,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: i64,
}

impl GateRunResult {
    fn skipped(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            outcome: GateOutcome::Skip,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 0,
        }
    }
}

/// Counts by outcome across one gate run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GateSummary {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub timed_out: usize,
    pub errored: usize,
}

impl GateSummary {
    pub fn of(results: &[GateRunResult]) -> Self {
        let mut summary = Self::default();
        for r in results {
            match r.outcome {
                GateOutcome::Pass => summary.passed += 1,
                GateOutcome::Fail => summary.failed += 1,
                GateOutcome::Skip => summary.skipped += 1,
                GateOutcome::Timeout => summary.timed_out += 1,
                GateOutcome::Error => summary.errored += 1,
            }
        }
        summary
    }
}

/// Captured output of a shell command run with a timeout.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: i64,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Run `command` through `sh -c` in `cwd`, capturing output, with a timeout.
///
/// stdout/stderr are read concurrently with waiting so a chatty child cannot
/// deadlock on a full pipe. On timeout the child is killed and `timed_out`
/// is set.
pub async fn run_shell_command(
    command: &str,
    cwd: &Path,
    timeout: Duration,
) -> std::io::Result<CommandOutput> {
    let start = Instant::now();

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    let read_stdout = async {
        let mut buf = Vec::new();
        if let Some(ref mut pipe) = stdout_pipe {
            pipe.read_to_end(&mut buf).await.ok();
        }
        String::from_utf8_lossy(&buf).into_owned()
    };
    let read_stderr = async {
        let mut buf = Vec::new();
        if let Some(ref mut pipe) = stderr_pipe {
            pipe.read_to_end(&mut buf).await.ok();
        }
        String::from_utf8_lossy(&buf).into_owned()
    };

    match tokio::time::timeout(timeout, async {
        let (wait, stdout, stderr) = tokio::join!(child.wait(), read_stdout, read_stderr);
        (wait, stdout, stderr)
    })
    .await
    {
        Ok((wait, stdout, stderr)) => {
            let status = wait?;
            Ok(CommandOutput {
                exit_code: status.code(),
                stdout,
                stderr,
                duration_ms: elapsed_ms(start),
                timed_out: false,
            })
        }
        Err(_) => {
            let _ = child.kill().await;
            Ok(CommandOutput {
                exit_code: None,
                stdout: String::new(),
                stderr: String::new(),
                duration_ms: elapsed_ms(start),
                timed_out: true,
            })
        }
    }
}

fn elapsed_ms(start: Instant) -> i64 {
    i64::try_from(start.elapsed().as_millis()).unwrap_or(i64::MAX)
}

/// Executes configured gates against a working tree.
#[derive(Debug, Clone, Default)]
pub struct GateRunner;

impl GateRunner {
    pub fn new() -> Self {
        Self
    }

    /// Run a single gate.
    pub async fn run_gate(&self, gate: &GateConfig, cwd: &Path) -> GateRunResult {
        let timeout = Duration::from_secs(gate.timeout_seconds.max(1));

        match run_shell_command(&gate.command, cwd, timeout).await {
            Ok(output) if output.timed_out => {
                tracing::warn!(gate = %gate.name, "gate timed out");
                GateRunResult {
                    name: gate.name.clone(),
                    outcome: GateOutcome::Timeout,
                    exit_code: None,
                    stdout: output.stdout,
                    stderr: format!(
                        "gate {:?} timed out after {}s",
                        gate.name, gate.timeout_seconds
                    ),
                    duration_ms: output.duration_ms,
                }
            }
            Ok(output) => {
                let outcome = if output.exit_code == Some(0) {
                    GateOutcome::Pass
                } else {
                    GateOutcome::Fail
                };
                GateRunResult {
                    name: gate.name.clone(),
                    outcome,
                    exit_code: output.exit_code,
                    stdout: output.stdout,
                    stderr: output.stderr,
                    duration_ms: output.duration_ms,
                }
            }
            Err(e) => {
                tracing::warn!(gate = %gate.name, error = %e, "gate failed to execute");
                GateRunResult {
                    name: gate.name.clone(),
                    outcome: GateOutcome::Error,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: format!("failed to execute gate {:?}: {e}", gate.name),
                    duration_ms: 0,
                }
            }
        }
    }

    /// Run gates in order. With `required_only`, non-required gates are
    /// recorded as skipped. Returns `(all_passed, results)` where skips do
    /// not count against passing.
    pub async fn run_all(
        &self,
        gates: &[GateConfig],
        cwd: &Path,
        required_only: bool,
    ) -> (bool, Vec<GateRunResult>) {
        let mut results = Vec::with_capacity(gates.len());
        for gate in gates {
            if required_only && !gate.required {
                results.push(GateRunResult::skipped(&gate.name));
                continue;
            }
            results.push(self.run_gate(gate, cwd).await);
        }
        let all_passed = results
            .iter()
            .all(|r| matches!(r.outcome, GateOutcome::Pass | GateOutcome::Skip));
        (all_passed, results)
    }
}
