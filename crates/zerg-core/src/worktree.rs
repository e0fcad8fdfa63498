//! Git worktree management for worker isolation.
//!
//! Each worker runs in its own worktree checked out on its own branch.
//! Worktrees share the object store of the main repository but have
//! independent working directories and index files, so workers cannot
//! trample each other's trees.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::git::worker_branch_name;

/// Errors from worktree operations.
#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("not a git repository: {0}")]
    NotAGitRepo(PathBuf),

    #[error("git command failed: {message}")]
    GitCommand {
        message: String,
        #[source]
        source: std::io::Error,
    },

    #[error("git {command} failed (exit {code}): {stderr}")]
    GitExit {
        command: String,
        code: i32,
        stderr: String,
    },

    /// The worktree path exists but is checked out on a different branch.
    #[error("worktree path exists with unexpected branch: expected {expected}, found {found}")]
    BranchMismatch { expected: String, found: String },

    #[error("failed to parse worktree list output: {0}")]
    ParseError(String),
}

/// One registered worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: Option<String>,
    pub head_commit: String,
}

/// Manages worker worktrees under a base directory.
///
/// Git serialises worktree operations with a lock file on the shared object
/// store; an internal mutex keeps concurrent spawns from racing on it.
#[derive(Debug)]
pub struct WorktreeManager {
    repo_path: PathBuf,
    worktree_base: PathBuf,
    git_lock: Arc<Mutex<()>>,
}

impl Clone for WorktreeManager {
    fn clone(&self) -> Self {
        Self {
            repo_path: self.repo_path.clone(),
            worktree_base: self.worktree_base.clone(),
            git_lock: Arc::clone(&self.git_lock),
        }
    }
}

impl WorktreeManager {
    /// Create a manager. `worktree_base` defaults to `.zerg-worktrees`
    /// inside the repository when not given.
    pub fn new(
        repo_path: impl Into<PathBuf>,
        worktree_base: Option<PathBuf>,
    ) -> Result<Self, WorktreeError> {
        let repo_path = repo_path.into();

        let output = Command::new("git")
            .args(["rev-parse", "--git-dir"])
            .current_dir(&repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git rev-parse".into(),
                source: e,
            })?;
        if !output.status.success() {
            return Err(WorktreeError::NotAGitRepo(repo_path));
        }

        let worktree_base =
            worktree_base.unwrap_or_else(|| repo_path.join(".zerg-worktrees"));

        Ok(Self {
            repo_path,
            worktree_base,
            git_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn worktree_base(&self) -> &Path {
        &self.worktree_base
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Path where a worker's worktree lives.
    pub fn worker_path(&self, worker_id: u32) -> PathBuf {
        self.worktree_base.join(format!("worker-{worker_id}"))
    }

    /// Create the worktree for a worker on its branch, branching off
    /// `start_point` when the branch does not exist yet.
    ///
    /// Idempotent: an existing worktree on the expected branch is returned
    /// as-is; one on a different branch is a [`WorktreeError::BranchMismatch`].
    pub fn create_for_worker(
        &self,
        feature: &str,
        worker_id: u32,
        start_point: &str,
    ) -> Result<WorktreeInfo, WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let branch = worker_branch_name(feature, worker_id);
        let path = self.worker_path(worker_id);

        if let Ok(existing) = self.find_by_path(&path) {
            match existing.branch.as_deref() {
                Some(found) if found == branch => {
                    tracing::info!(path = %path.display(), branch = %branch, "worktree exists");
                    return Ok(existing);
                }
                Some(found) => {
                    return Err(WorktreeError::BranchMismatch {
                        expected: branch,
                        found: found.to_owned(),
                    });
                }
                None => return Ok(existing),
            }
        }

        std::fs::create_dir_all(&self.worktree_base).map_err(|e| {
            WorktreeError::GitCommand {
                message: format!(
                    "failed to create worktree base {}",
                    self.worktree_base.display()
                ),
                source: e,
            }
        })?;

        let branch_exists = self.branch_exists(&branch)?;
        let output = if branch_exists {
            self.git_output(&["worktree", "add"], &[&path.to_string_lossy(), &branch])?
        } else {
            self.git_output(
                &["worktree", "add", "-b", &branch],
                &[&path.to_string_lossy(), start_point],
            )?
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            self.cleanup_partial(&path);
            return Err(WorktreeError::GitExit {
                command: "worktree add".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        self.find_by_path(&path)
    }

    /// Remove a worktree by path. Idempotent; unregistered directories are
    /// cleaned up directly.
    pub fn remove(&self, path: &Path) -> Result<(), WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        if self.find_by_path(path).is_err() {
            if path.exists() {
                tracing::warn!(
                    path = %path.display(),
                    "directory not registered as worktree, removing"
                );
                let _ = std::fs::remove_dir_all(path);
            }
            return Ok(());
        }

        let output = self.git_output(
            &["worktree", "remove", "--force"],
            &[&path.to_string_lossy()],
        )?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if stderr.contains("is not a working tree") {
                return Ok(());
            }
            return Err(WorktreeError::GitExit {
                command: "worktree remove".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }
        Ok(())
    }

    /// All registered worktrees.
    pub fn list(&self) -> Result<Vec<WorktreeInfo>, WorktreeError> {
        let output = self.git_output(&["worktree", "list", "--porcelain"], &[])?;
        if !output.status.success() {
            return Err(WorktreeError::GitExit {
                command: "worktree list".into(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        parse_porcelain(&String::from_utf8_lossy(&output.stdout))
    }

    /// Prune references to worktrees whose directories disappeared.
    pub fn prune(&self) -> Result<(), WorktreeError> {
        let output = self.git_output(&["worktree", "prune"], &[])?;
        if !output.status.success() {
            return Err(WorktreeError::GitExit {
                command: "worktree prune".into(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(())
    }

    fn branch_exists(&self, branch: &str) -> Result<bool, WorktreeError> {
        let output = self.git_output(
            &["rev-parse", "--verify"],
            &[&format!("refs/heads/{branch}")],
        )?;
        Ok(output.status.success())
    }

    fn git_output(
        &self,
        args: &[&str],
        trailing: &[&str],
    ) -> Result<std::process::Output, WorktreeError> {
        Command::new("git")
            .args(args)
            .args(trailing)
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: format!("failed to run git {}", args.join(" ")),
                source: e,
            })
    }

    fn find_by_path(&self, path: &Path) -> Result<WorktreeInfo, WorktreeError> {
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        for wt in self.list()? {
            let wt_canonical = wt.path.canonicalize().unwrap_or_else(|_| wt.path.clone());
            if wt_canonical == canonical {
                return Ok(wt);
            }
        }
        Err(WorktreeError::ParseError(format!(
            "worktree not found at path: {}",
            path.display()
        )))
    }

    fn cleanup_partial(&self, path: &Path) {
        if path.exists() {
            tracing::warn!(path = %path.display(), "cleaning up partial worktree");
            let _ = std::fs::remove_dir_all(path);
        }
        let _ = self.prune();
    }
}

/// Parse `git worktree list --porcelain` output: blank-line-separated blocks
/// of `worktree <path>` / `HEAD <sha>` / `branch refs/heads/<name>` (or
/// `detached` / `bare`).
fn parse_porcelain(output: &str) -> Result<Vec<WorktreeInfo>, WorktreeError> {
    let mut worktrees = Vec::new();
    let mut path: Option<PathBuf> = None;
    let mut head: Option<String> = None;
    let mut branch: Option<String> = None;

    let mut commit =
        |path: &mut Option<PathBuf>, head: &mut Option<String>, branch: &mut Option<String>| {
            if let (Some(p), Some(h)) = (path.take(), head.take()) {
                worktrees.push(WorktreeInfo {
                    path: p,
                    branch: branch.take(),
                    head_commit: h,
                });
            } else {
                *path = None;
                *head = None;
                *branch = None;
            }
        };

    for line in output.lines() {
        if line.is_empty() {
            commit(&mut path, &mut head, &mut branch);
            continue;
        }
        if let Some(rest) = line.strip_prefix("worktree ") {
            path = Some(PathBuf::from(rest));
        } else if let Some(rest) = line.strip_prefix("HEAD ") {
            head = Some(rest.to_owned());
        } else if let Some(rest) = line.strip_prefix("branch ") {
            branch = Some(
                rest.strip_prefix("refs/heads/")
                    .unwrap_or(rest)
                    .to_owned(),
            );
        }
        // `bare`, `detached`, `prunable` are ignored.
    }
    commit(&mut path, &mut head, &mut branch);

    Ok(worktrees)
}
