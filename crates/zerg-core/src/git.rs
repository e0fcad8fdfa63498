//! Git operations for merge coordination.
//!
//! Thin wrapper over the `git` CLI. Git does not support concurrent
//! ref-mutating operations on the same repository (it takes lock files on
//! the shared object store), so all mutating operations serialize through an
//! internal mutex.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use thiserror::Error;

/// Errors from git operations.
#[derive(Debug, Error)]
pub enum GitError {
    /// The path is not a git repository.
    #[error("not a git repository: {0}")]
    NotAGitRepo(PathBuf),

    /// The git binary failed to execute.
    #[error("git command failed: {message}")]
    Command {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// A git command exited non-zero.
    #[error("git {command} failed (exit {code}): {stderr}")]
    Exit {
        command: String,
        code: i32,
        stderr: String,
    },

    /// A merge hit conflicts. The merge has been aborted; the conflicting
    /// file list is captured for the operator.
    #[error("merge conflict merging {branch}: {}", files.join(", "))]
    MergeConflict { branch: String, files: Vec<String> },
}

/// Conventional branch name for a worker.
pub fn worker_branch_name(feature: &str, worker_id: u32) -> String {
    format!("zerg/{feature}/worker-{worker_id}")
}

/// Conventional branch name for a level's ephemeral staging branch.
pub fn staging_branch_name(feature: &str, level: u32) -> String {
    format!("zerg/{feature}/staging-{level}")
}

/// Whether `branch` matches `zerg/{feature}/worker-{digits}`.
pub fn is_worker_branch(feature: &str, branch: &str) -> bool {
    let Some(rest) = branch.strip_prefix("zerg/") else {
        return false;
    };
    let Some(rest) = rest.strip_prefix(feature) else {
        return false;
    };
    let Some(id) = rest.strip_prefix("/worker-") else {
        return false;
    };
    !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit())
}

/// Git CLI wrapper rooted at one repository.
#[derive(Debug)]
pub struct GitOps {
    repo_path: PathBuf,
    /// Serialises ref-mutating operations.
    git_lock: Arc<Mutex<()>>,
}

impl Clone for GitOps {
    fn clone(&self) -> Self {
        Self {
            repo_path: self.repo_path.clone(),
            git_lock: Arc::clone(&self.git_lock),
        }
    }
}

impl GitOps {
    /// Create a wrapper, verifying `repo_path` is a git repository.
    pub fn new(repo_path: impl Into<PathBuf>) -> Result<Self, GitError> {
        let repo_path = repo_path.into();
        let output = Command::new("git")
            .args(["rev-parse", "--git-dir"])
            .current_dir(&repo_path)
            .output()
            .map_err(|e| GitError::Command {
                message: "failed to run git rev-parse".into(),
                source: e,
            })?;
        if !output.status.success() {
            return Err(GitError::NotAGitRepo(repo_path));
        }
        Ok(Self {
            repo_path,
            git_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Run a git command, returning trimmed stdout.
    fn run(&self, args: &[&str]) -> Result<String, GitError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| GitError::Command {
                message: format!("failed to run git {}", args.join(" ")),
                source: e,
            })?;
        if !output.status.success() {
            return Err(GitError::Exit {
                command: args.join(" "),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Name of the currently checked-out branch; empty when detached.
    pub fn current_branch(&self) -> Result<String, GitError> {
        self.run(&["branch", "--show-current"])
    }

    /// Resolve a revision to a commit id.
    pub fn rev_parse(&self, rev: &str) -> Result<String, GitError> {
        self.run(&["rev-parse", rev])
    }

    pub fn checkout(&self, branch: &str) -> Result<(), GitError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.run(&["checkout", branch]).map(|_| ())
    }

    /// Detach HEAD at its current commit, releasing any branch lock held by
    /// the current worktree.
    pub fn detach_head(&self) -> Result<(), GitError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.run(&["checkout", "--detach", "HEAD"]).map(|_| ())
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool, GitError> {
        let output = Command::new("git")
            .args(["rev-parse", "--verify"])
            .arg(format!("refs/heads/{branch}"))
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| GitError::Command {
                message: "failed to run git rev-parse --verify".into(),
                source: e,
            })?;
        Ok(output.status.success())
    }

    /// Create (or reset) `branch` at `start_point` without checking it out.
    pub fn create_branch(&self, branch: &str, start_point: &str) -> Result<(), GitError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.run(&["branch", "-f", branch, start_point]).map(|_| ())
    }

    /// Create the ephemeral staging branch for a level off the target tip.
    /// Returns the staging branch name.
    pub fn create_staging_branch(
        &self,
        feature: &str,
        level: u32,
        target: &str,
    ) -> Result<String, GitError> {
        let staging = staging_branch_name(feature, level);
        self.create_branch(&staging, target)?;
        tracing::info!(staging = %staging, target, "created staging branch");
        Ok(staging)
    }

    /// Force-delete a branch. Missing branches are a no-op.
    pub fn delete_branch(&self, branch: &str) -> Result<(), GitError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        match self.run(&["branch", "-D", branch]) {
            Ok(_) => Ok(()),
            Err(GitError::Exit { stderr, .. }) if stderr.contains("not found") => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Merge `branch` into the current branch with `--no-ff` and the given
    /// message. Returns the merge commit id.
    ///
    /// Conflicts abort the in-progress merge and surface as
    /// [`GitError::MergeConflict`] with the conflicting file list.
    pub fn merge(&self, branch: &str, message: &str) -> Result<String, GitError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        match self.run(&["merge", "--no-ff", "-m", message, branch]) {
            Ok(_) => self.run(&["rev-parse", "HEAD"]),
            Err(GitError::Exit { stderr, command, code }) => {
                let files = self.conflicting_files()?;
                if !files.is_empty() {
                    let _ = self.run(&["merge", "--abort"]);
                    return Err(GitError::MergeConflict {
                        branch: branch.to_owned(),
                        files,
                    });
                }
                Err(GitError::Exit {
                    stderr,
                    command,
                    code,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Files currently in the unmerged state.
    pub fn conflicting_files(&self) -> Result<Vec<String>, GitError> {
        let stdout = self.run(&["diff", "--name-only", "--diff-filter=U"])?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_owned)
            .collect())
    }

    /// Abort any in-progress merge. No-op when none is in progress.
    pub fn abort_merge(&self) {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = self.run(&["merge", "--abort"]) {
            tracing::debug!(error = %e, "merge --abort was a no-op");
        }
    }

    /// Worker branches for a feature, in name order.
    pub fn list_worker_branches(&self, feature: &str) -> Result<Vec<String>, GitError> {
        let pattern = format!("zerg/{feature}/worker-*");
        let stdout = self.run(&[
            "branch",
            "--list",
            &pattern,
            "--format=%(refname:short)",
        ])?;
        let mut branches: Vec<String> = stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_owned)
            .collect();
        branches.sort();
        Ok(branches)
    }

    /// Delete every zerg branch for a feature (workers and staging).
    /// Returns the number deleted.
    pub fn delete_feature_branches(&self, feature: &str) -> Result<usize, GitError> {
        let pattern = format!("zerg/{feature}/*");
        let stdout = self.run(&[
            "branch",
            "--list",
            &pattern,
            "--format=%(refname:short)",
        ])?;
        let mut deleted = 0;
        for branch in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
            self.delete_branch(branch)?;
            deleted += 1;
        }
        Ok(deleted)
    }

    /// Diff between two revisions (for artifact capture).
    pub fn diff_range(&self, base: &str, head: &str) -> Result<String, GitError> {
        self.run(&["diff", &format!("{base}...{head}")])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerg_test_utils::{commit_on_branch, create_temp_repo, git};

    #[test]
    fn branch_naming_and_validation() {
        assert_eq!(worker_branch_name("auth", 3), "zerg/auth/worker-3");
        assert_eq!(staging_branch_name("auth", 2), "zerg/auth/staging-2");

        assert!(is_worker_branch("auth", "zerg/auth/worker-0"));
        assert!(is_worker_branch("auth", "zerg/auth/worker-12"));
        assert!(!is_worker_branch("auth", "zerg/auth/worker-"));
        assert!(!is_worker_branch("auth", "zerg/auth/worker-x"));
        assert!(!is_worker_branch("auth", "zerg/other/worker-0"));
        assert!(!is_worker_branch("auth", "feature/auth/worker-0"));
        assert!(!is_worker_branch("auth", "zerg/auth/staging-1"));
    }

    #[test]
    fn new_rejects_non_repo() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(matches!(
            GitOps::new(dir.path()),
            Err(GitError::NotAGitRepo(_))
        ));
    }

    #[test]
    fn staging_branch_snapshots_target_tip() {
        let (_dir, repo) = create_temp_repo();
        let ops = GitOps::new(&repo).unwrap();

        let staging = ops.create_staging_branch("feat", 1, "main").unwrap();
        assert_eq!(staging, "zerg/feat/staging-1");
        assert!(ops.branch_exists(&staging).unwrap());
        assert_eq!(
            ops.rev_parse(&staging).unwrap(),
            ops.rev_parse("main").unwrap()
        );
    }

    #[test]
    fn merge_returns_commit_id() {
        let (_dir, repo) = create_temp_repo();
        let ops = GitOps::new(&repo).unwrap();
        commit_on_branch(&repo, "zerg/feat/worker-0", "w0.txt", "from worker 0\n");

        let staging = ops.create_staging_branch("feat", 1, "main").unwrap();
        ops.checkout(&staging).unwrap();
        let commit = ops
            .merge("zerg/feat/worker-0", "Merge zerg/feat/worker-0 into staging")
            .unwrap();
        assert_eq!(commit, ops.rev_parse("HEAD").unwrap());
        assert!(repo.join("w0.txt").exists());
    }

    #[test]
    fn conflicting_merge_aborts_and_lists_files() {
        let (_dir, repo) = create_temp_repo();
        let ops = GitOps::new(&repo).unwrap();
        commit_on_branch(&repo, "zerg/feat/worker-0", "shared.txt", "worker zero\n");
        commit_on_branch(&repo, "zerg/feat/worker-1", "shared.txt", "worker one\n");

        let staging = ops.create_staging_branch("feat", 1, "main").unwrap();
        ops.checkout(&staging).unwrap();
        ops.merge("zerg/feat/worker-0", "merge w0").unwrap();

        let err = ops.merge("zerg/feat/worker-1", "merge w1").unwrap_err();
        match err {
            GitError::MergeConflict { branch, files } => {
                assert_eq!(branch, "zerg/feat/worker-1");
                assert_eq!(files, vec!["shared.txt".to_string()]);
            }
            other => panic!("expected conflict, got {other}"),
        }
        // The merge was aborted: tree is clean.
        assert!(ops.conflicting_files().unwrap().is_empty());
        assert_eq!(git(&repo, &["status", "--porcelain"]), "");
    }

    #[test]
    fn delete_branch_is_idempotent() {
        let (_dir, repo) = create_temp_repo();
        let ops = GitOps::new(&repo).unwrap();
        commit_on_branch(&repo, "zerg/feat/worker-0", "x.txt", "x\n");

        ops.delete_branch("zerg/feat/worker-0").unwrap();
        assert!(!ops.branch_exists("zerg/feat/worker-0").unwrap());
        ops.delete_branch("zerg/feat/worker-0").unwrap();
        ops.delete_branch("zerg/never-existed").unwrap();
    }

    #[test]
    fn lists_worker_branches_in_order() {
        let (_dir, repo) = create_temp_repo();
        let ops = GitOps::new(&repo).unwrap();
        commit_on_branch(&repo, "zerg/feat/worker-1", "a.txt", "a\n");
        commit_on_branch(&repo, "zerg/feat/worker-0", "b.txt", "b\n");
        commit_on_branch(&repo, "zerg/other/worker-0", "c.txt", "c\n");

        let branches = ops.list_worker_branches("feat").unwrap();
        assert_eq!(
            branches,
            vec![
                "zerg/feat/worker-0".to_string(),
                "zerg/feat/worker-1".to_string()
            ]
        );
    }

    #[test]
    fn detach_head_releases_branch() {
        let (_dir, repo) = create_temp_repo();
        let ops = GitOps::new(&repo).unwrap();

        ops.detach_head().unwrap();
        assert_eq!(ops.current_branch().unwrap(), "");
        ops.checkout("main").unwrap();
        assert_eq!(ops.current_branch().unwrap(), "main");
    }

    #[test]
    fn delete_feature_branches_sweeps_everything() {
        let (_dir, repo) = create_temp_repo();
        let ops = GitOps::new(&repo).unwrap();
        commit_on_branch(&repo, "zerg/feat/worker-0", "a.txt", "a\n");
        commit_on_branch(&repo, "zerg/feat/worker-1", "b.txt", "b\n");
        ops.create_staging_branch("feat", 1, "main").unwrap();

        let deleted = ops.delete_feature_branches("feat").unwrap();
        assert_eq!(deleted, 3);
        assert!(ops.list_worker_branches("feat").unwrap().is_empty());
    }

    #[test]
    fn diff_range_captures_changes() {
        let (_dir, repo) = create_temp_repo();
        let ops = GitOps::new(&repo).unwrap();
        commit_on_branch(&repo, "zerg/feat/worker-0", "new.txt", "content\n");

        let diff = ops.diff_range("main", "zerg/feat/worker-0").unwrap();
        assert!(diff.contains("new.txt"));
        assert!(diff.contains("+content"));
    }
}
