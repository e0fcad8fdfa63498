//! Shared test utilities for zerg integration tests.
//!
//! Provides temp git repositories with initial commits (the merge and
//! worktree tests need real repos) and task-graph JSON builders.

use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

/// Run a git command in `dir`, panicking with stderr on failure.
///
/// Test-only helper; production code goes through the git ops module.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap_or_else(|e| panic!("git {} failed to run: {e}", args.join(" ")));
    assert!(
        output.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_owned()
}

/// Create a temporary git repository with `main` checked out and an initial
/// commit. Returns the TempDir (keep it alive) and the repo path.
pub fn create_temp_repo() -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let repo = dir.path().to_path_buf();

    git(&repo, &["init", "-b", "main"]);
    git(&repo, &["config", "user.email", "test@zerg.dev"]);
    git(&repo, &["config", "user.name", "Zerg Test"]);
    std::fs::write(repo.join("README.md"), "# Test repo\n").expect("write README");
    std::fs::write(repo.join(".gitignore"), ".zerg/\n").expect("write .gitignore");
    git(&repo, &["add", "."]);
    git(&repo, &["commit", "-m", "Initial commit"]);

    (dir, repo)
}

/// Create a branch off `main` with one commit touching `file` with
/// `content`, then return to `main`.
pub fn commit_on_branch(repo: &Path, branch: &str, file: &str, content: &str) {
    git(repo, &["checkout", "-b", branch, "main"]);
    let path = repo.join(file);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create parent dirs");
    }
    std::fs::write(&path, content).expect("write file");
    git(repo, &["add", "."]);
    git(repo, &["commit", "-m", &format!("Change {file} on {branch}")]);
    git(repo, &["checkout", "main"]);
}

/// A minimal task object for graph JSON fixtures.
pub fn task_json(
    id: &str,
    level: u32,
    deps: &[&str],
    creates: &[&str],
    modifies: &[&str],
) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "title": format!("Task {id}"),
        "description": "",
        "level": level,
        "dependencies": deps,
        "files": {"create": creates, "modify": modifies, "read": []},
        "acceptance_criteria": ["done"],
        "verification": {"command": "true", "timeout_seconds": 30},
    })
}

/// Wrap tasks into a graph document.
pub fn graph_json(tasks: &[serde_json::Value]) -> serde_json::Value {
    serde_json::json!({"tasks": tasks})
}

/// The two-level, three-task graph used by end-to-end scenarios:
/// T1 and T2 at level 1, T3 at level 2 depending on both.
pub fn two_level_graph() -> serde_json::Value {
    graph_json(&[
        task_json("T1", 1, &[], &["a.rs"], &[]),
        task_json("T2", 1, &[], &["b.rs"], &[]),
        task_json("T3", 2, &["T1", "T2"], &[], &["a.rs"]),
    ])
}
