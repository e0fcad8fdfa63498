//! Level merge coordination.
//!
//! After a level resolves, worker branches are collected into an ephemeral
//! staging branch created off the target's tip, quality gates run before and
//! after the merges, and staging is finally merged back into the target.
//! Every step is observable as a merge-status transition on the level
//! record. Conflicts are never auto-resolved: the flow aborts, cleans up
//! staging, and reports the conflicting files.

use chrono::{DateTime, Utc};

use zerg_state::{LevelMergeStatus, StateStore};

use crate::gates::{GateConfig, GateRunResult, GateRunner};
use crate::git::{GitError, GitOps, staging_branch_name};

/// Outcome of a full level merge flow.
#[derive(Debug, Clone)]
pub struct MergeFlowResult {
    pub success: bool,
    pub level: u32,
    pub source_branches: Vec<String>,
    pub target_branch: String,
    pub merge_commit: Option<String>,
    pub gate_results: Vec<GateRunResult>,
    pub conflicting_files: Vec<String>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl MergeFlowResult {
    fn base(level: u32, source_branches: Vec<String>, target: &str) -> Self {
        Self {
            success: false,
            level,
            source_branches,
            target_branch: target.to_owned(),
            merge_commit: None,
            gate_results: Vec::new(),
            conflicting_files: Vec::new(),
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// Whether the flow failed on a merge conflict.
    pub fn is_conflict(&self) -> bool {
        !self.conflicting_files.is_empty()
    }
}

/// Coordinates branch merging and quality gates for one feature.
pub struct MergeCoordinator {
    feature: String,
    store: StateStore,
    git: GitOps,
    gates: GateRunner,
    gate_configs: Vec<GateConfig>,
}

impl MergeCoordinator {
    pub fn new(
        feature: &str,
        store: StateStore,
        git: GitOps,
        gate_configs: Vec<GateConfig>,
    ) -> Self {
        Self {
            feature: feature.to_owned(),
            store,
            git,
            gates: GateRunner::new(),
            gate_configs,
        }
    }

    /// Worker branches that would participate in a merge right now.
    pub fn mergeable_branches(&self) -> Result<Vec<String>, GitError> {
        self.git.list_worker_branches(&self.feature)
    }

    /// Delete every zerg branch for the feature. Returns the count.
    pub fn cleanup_feature_branches(&self) -> Result<usize, GitError> {
        self.git.delete_feature_branches(&self.feature)
    }

    fn set_status(&self, level: u32, status: LevelMergeStatus) {
        if let Err(e) = self.store.set_level_merge_status(level, status) {
            tracing::warn!(level, %status, error = %e, "failed to persist merge status");
        }
    }

    /// Execute the complete merge flow for a level.
    ///
    /// `worker_branches` of `None` auto-detects from the repository. The
    /// caller-supplied order is the merge order, so the resulting commit DAG
    /// is deterministic for identical inputs. All failure paths abort any
    /// half-done merge and delete the staging branch.
    pub async fn full_merge_flow(
        &self,
        level: u32,
        worker_branches: Option<Vec<String>>,
        target: &str,
    ) -> MergeFlowResult {
        tracing::info!(level, target, "starting full merge flow");

        // Step 1: collect worker branches.
        self.set_status(level, LevelMergeStatus::Collecting);
        let branches = match worker_branches {
            Some(branches) => branches,
            None => match self.mergeable_branches() {
                Ok(branches) => branches,
                Err(e) => {
                    self.set_status(level, LevelMergeStatus::Failed);
                    let mut result = MergeFlowResult::base(level, Vec::new(), target);
                    result.error = Some(e.to_string());
                    return result;
                }
            },
        };

        // Nothing to merge resolves vacuously: a fully-reaped level must not
        // wedge the build.
        if branches.is_empty() {
            tracing::info!(level, "no worker branches, merge is vacuous");
            let _ = self
                .store
                .append_event("level_merge_skipped", serde_json::json!({"level": level}));
            self.set_status(level, LevelMergeStatus::Complete);
            let mut result = MergeFlowResult::base(level, Vec::new(), target);
            result.success = true;
            return result;
        }

        let mut result = MergeFlowResult::base(level, branches.clone(), target);
        match self.run_flow(level, &branches, target, &mut result).await {
            Ok(commit) => {
                result.success = true;
                result.merge_commit = Some(commit.clone());
                self.set_status(level, LevelMergeStatus::Complete);
                if let Err(e) = self.store.set_level_merge_commit(level, Some(&commit)) {
                    tracing::warn!(level, error = %e, "failed to persist merge commit");
                }
                result
            }
            Err(flow_error) => {
                self.abort(level, target);
                let status = if result.conflicting_files.is_empty() {
                    LevelMergeStatus::Failed
                } else {
                    LevelMergeStatus::Conflict
                };
                self.set_status(level, status);
                result.error = Some(flow_error);
                result
            }
        }
    }

    /// The fallible middle of the flow. Any `Err` triggers abort + cleanup
    /// in the caller; conflict details are recorded on `result` before
    /// returning the error string.
    async fn run_flow(
        &self,
        level: u32,
        branches: &[String],
        target: &str,
        result: &mut MergeFlowResult,
    ) -> Result<String, String> {
        // Step 2: staging branch off the target tip.
        self.set_status(level, LevelMergeStatus::Waiting);
        let staging = self
            .git
            .create_staging_branch(&self.feature, level, target)
            .map_err(|e| e.to_string())?;
        self.set_status(level, LevelMergeStatus::Merging);

        // Step 3: pre-merge gates against the current tree.
        if !self.gate_configs.is_empty() {
            self.set_status(level, LevelMergeStatus::Validating);
            tracing::info!(level, "running pre-merge gates");
            let (passed, gate_results) = self
                .gates
                .run_all(&self.gate_configs, self.git.repo_path(), true)
                .await;
            result.gate_results.extend(gate_results);
            if !passed {
                return Err("Pre-merge gates failed".to_owned());
            }
            self.set_status(level, LevelMergeStatus::Merging);
        }

        // Step 4: merge worker branches into staging, in input order.
        self.git.checkout(&staging).map_err(|e| e.to_string())?;
        for branch in branches {
            tracing::info!(branch = %branch, staging = %staging, "merging worker branch");
            let message = format!("Merge {branch} into {staging}");
            match self.git.merge(branch, &message) {
                Ok(commit) => {
                    let short = &commit[..8.min(commit.len())];
                    tracing::info!(branch = %branch, commit = %short, "merged");
                }
                Err(GitError::MergeConflict { files, .. }) => {
                    result.conflicting_files = files.clone();
                    return Err(format!("Merge conflict: {}", files.join(", ")));
                }
                Err(e) => return Err(e.to_string()),
            }
        }

        // Step 5: post-merge gates against staging.
        if !self.gate_configs.is_empty() {
            self.set_status(level, LevelMergeStatus::Validating);
            tracing::info!(level, "running post-merge gates");
            let (passed, gate_results) = self
                .gates
                .run_all(&self.gate_configs, self.git.repo_path(), true)
                .await;
            result.gate_results.extend(gate_results);
            if !passed {
                return Err("Post-merge gates failed".to_owned());
            }
        }

        // Step 6: finalize. Detach HEAD first so deleting staging later is
        // not blocked by a worktree lock on it.
        self.set_status(level, LevelMergeStatus::Rebasing);
        if self.git.current_branch().map_err(|e| e.to_string())? == staging {
            self.git.detach_head().map_err(|e| e.to_string())?;
        }
        self.git.checkout(target).map_err(|e| e.to_string())?;
        let message = format!("ZERG: Complete level merge from {staging}");
        let commit = self
            .git
            .merge(&staging, &message)
            .map_err(|e| e.to_string())?;
        let short = &commit[..8.min(commit.len())];
        tracing::info!(level, commit = %short, "finalized level merge");

        // Step 7: drop staging.
        self.git.delete_branch(&staging).map_err(|e| e.to_string())?;
        Ok(commit)
    }

    /// Undo any half-done merge and remove the staging branch.
    fn abort(&self, level: u32, target: &str) {
        tracing::info!(level, "aborting merge");
        self.git.abort_merge();

        let staging = staging_branch_name(&self.feature, level);
        match self.git.branch_exists(&staging) {
            Ok(true) => {
                // Move off staging before deleting it.
                if let Err(e) = self.git.checkout(target) {
                    tracing::warn!(error = %e, "failed to checkout target during abort");
                }
                if let Err(e) = self.git.delete_branch(&staging) {
                    tracing::warn!(error = %e, "failed to delete staging during abort");
                }
            }
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, "failed to query staging during abort"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use zerg_test_utils::{commit_on_branch, create_temp_repo, git};

    fn coordinator(
        repo: &std::path::Path,
        state_dir: &TempDir,
        gates: Vec<GateConfig>,
    ) -> (MergeCoordinator, StateStore) {
        let store = StateStore::open("feat", state_dir.path()).unwrap();
        let coordinator = MergeCoordinator::new(
            "feat",
            store.clone(),
            GitOps::new(repo).unwrap(),
            gates,
        );
        (coordinator, store)
    }

    fn gate(name: &str, command: &str) -> GateConfig {
        GateConfig {
            name: name.to_owned(),
            command: command.to_owned(),
            timeout_seconds: 30,
            required: true,
        }
    }

    #[tokio::test]
    async fn merges_worker_branches_into_target() {
        let (_dir, repo) = create_temp_repo();
        let state_dir = TempDir::new().unwrap();
        commit_on_branch(&repo, "zerg/feat/worker-0", "w0.txt", "zero\n");
        commit_on_branch(&repo, "zerg/feat/worker-1", "w1.txt", "one\n");
        let (coordinator, store) = coordinator(&repo, &state_dir, vec![]);

        let result = coordinator
            .full_merge_flow(
                1,
                Some(vec![
                    "zerg/feat/worker-0".into(),
                    "zerg/feat/worker-1".into(),
                ]),
                "main",
            )
            .await;

        assert!(result.success, "error: {:?}", result.error);
        let commit = result.merge_commit.expect("merge commit recorded");
        assert!(repo.join("w0.txt").exists());
        assert!(repo.join("w1.txt").exists());
        assert_eq!(git(&repo, &["rev-parse", "HEAD"]), commit);
        assert_eq!(git(&repo, &["branch", "--show-current"]), "main");

        // Staging is gone; state carries the protocol outcome.
        let ops = GitOps::new(&repo).unwrap();
        assert!(!ops.branch_exists("zerg/feat/staging-1").unwrap());
        assert_eq!(
            store.get_level_merge_status(1),
            Some(LevelMergeStatus::Complete)
        );
        assert_eq!(
            store.reload().unwrap().level(1).unwrap().merge_commit.as_deref(),
            Some(commit.as_str())
        );

        // The finalize commit carries the conventional message.
        let log = git(&repo, &["log", "-1", "--format=%s"]);
        assert_eq!(log, "ZERG: Complete level merge from zerg/feat/staging-1");
    }

    #[tokio::test]
    async fn zero_branches_is_vacuous_success() {
        let (_dir, repo) = create_temp_repo();
        let state_dir = TempDir::new().unwrap();
        let (coordinator, store) = coordinator(&repo, &state_dir, vec![]);

        let result = coordinator.full_merge_flow(1, Some(vec![]), "main").await;
        assert!(result.success);
        assert!(result.merge_commit.is_none());
        assert_eq!(
            store.get_level_merge_status(1),
            Some(LevelMergeStatus::Complete)
        );
        assert!(
            store
                .reload()
                .unwrap()
                .execution_log
                .iter()
                .any(|e| e.event == "level_merge_skipped")
        );
    }

    #[tokio::test]
    async fn conflict_aborts_cleans_up_and_reports_files() {
        let (_dir, repo) = create_temp_repo();
        let state_dir = TempDir::new().unwrap();
        // Scenario F: both workers change the same file.
        commit_on_branch(&repo, "zerg/feat/worker-0", "src/auth.rs", "worker zero\n");
        commit_on_branch(&repo, "zerg/feat/worker-1", "src/auth.rs", "worker one\n");
        let (coordinator, store) = coordinator(&repo, &state_dir, vec![]);

        let result = coordinator
            .full_merge_flow(
                1,
                Some(vec![
                    "zerg/feat/worker-0".into(),
                    "zerg/feat/worker-1".into(),
                ]),
                "main",
            )
            .await;

        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().starts_with("Merge conflict"));
        assert_eq!(result.conflicting_files, vec!["src/auth.rs".to_string()]);
        assert!(result.is_conflict());
        assert_eq!(
            store.get_level_merge_status(1),
            Some(LevelMergeStatus::Conflict)
        );

        // Staging deleted, tree clean, back on target.
        let ops = GitOps::new(&repo).unwrap();
        assert!(!ops.branch_exists("zerg/feat/staging-1").unwrap());
        assert_eq!(git(&repo, &["status", "--porcelain"]), "");
        assert_eq!(git(&repo, &["branch", "--show-current"]), "main");
        // Target tip unchanged.
        assert!(!repo.join("src/auth.rs").exists());
    }

    #[tokio::test]
    async fn pre_merge_gate_failure_stops_before_merging() {
        let (_dir, repo) = create_temp_repo();
        let state_dir = TempDir::new().unwrap();
        commit_on_branch(&repo, "zerg/feat/worker-0", "w0.txt", "zero\n");
        let (coordinator, store) =
            coordinator(&repo, &state_dir, vec![gate("lint", "false")]);

        let result = coordinator
            .full_merge_flow(1, Some(vec!["zerg/feat/worker-0".into()]), "main")
            .await;

        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Pre-merge gates failed"));
        assert_eq!(result.gate_results.len(), 1);
        assert!(!repo.join("w0.txt").exists(), "no merge happened");
        assert_eq!(
            store.get_level_merge_status(1),
            Some(LevelMergeStatus::Failed)
        );
        let ops = GitOps::new(&repo).unwrap();
        assert!(!ops.branch_exists("zerg/feat/staging-1").unwrap());
    }

    #[tokio::test]
    async fn post_merge_gate_failure_rolls_back() {
        let (_dir, repo) = create_temp_repo();
        let state_dir = TempDir::new().unwrap();
        commit_on_branch(&repo, "zerg/feat/worker-0", "w0.txt", "zero\n");
        // Passes on the pre-merge tree (w0.txt absent), fails on staging
        // after the merge introduces it.
        let (coordinator, store) =
            coordinator(&repo, &state_dir, vec![gate("no-w0", "test ! -f w0.txt")]);

        let result = coordinator
            .full_merge_flow(1, Some(vec!["zerg/feat/worker-0".into()]), "main")
            .await;

        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Post-merge gates failed"));
        // Pre and post runs both recorded.
        assert_eq!(result.gate_results.len(), 2);
        assert_eq!(
            store.get_level_merge_status(1),
            Some(LevelMergeStatus::Failed)
        );

        // Target untouched, staging gone.
        assert_eq!(git(&repo, &["branch", "--show-current"]), "main");
        assert!(!repo.join("w0.txt").exists());
        let ops = GitOps::new(&repo).unwrap();
        assert!(!ops.branch_exists("zerg/feat/staging-1").unwrap());
    }

    #[tokio::test]
    async fn merge_order_follows_input_order() {
        let (_dir, repo) = create_temp_repo();
        let state_dir = TempDir::new().unwrap();
        commit_on_branch(&repo, "zerg/feat/worker-1", "b.txt", "b\n");
        commit_on_branch(&repo, "zerg/feat/worker-0", "a.txt", "a\n");
        let (coordinator, _store) = coordinator(&repo, &state_dir, vec![]);

        // Caller order: worker-1 first.
        let result = coordinator
            .full_merge_flow(
                1,
                Some(vec![
                    "zerg/feat/worker-1".into(),
                    "zerg/feat/worker-0".into(),
                ]),
                "main",
            )
            .await;
        assert!(result.success);

        // First-parent history on staging-side merges reflects input order.
        let log = git(&repo, &["log", "--format=%s"]);
        let w1_pos = log.find("Merge zerg/feat/worker-1").unwrap();
        let w0_pos = log.find("Merge zerg/feat/worker-0").unwrap();
        assert!(
            w0_pos < w1_pos,
            "worker-0 merged after worker-1 appears earlier in the log"
        );
    }

    #[tokio::test]
    async fn status_transitions_are_persisted_in_order() {
        let (_dir, repo) = create_temp_repo();
        let state_dir = TempDir::new().unwrap();
        commit_on_branch(&repo, "zerg/feat/worker-0", "w0.txt", "zero\n");
        let (coordinator, store) = coordinator(&repo, &state_dir, vec![gate("ok", "true")]);

        let result = coordinator
            .full_merge_flow(1, Some(vec!["zerg/feat/worker-0".into()]), "main")
            .await;
        assert!(result.success);

        let statuses: Vec<String> = store
            .reload()
            .unwrap()
            .execution_log
            .iter()
            .filter(|e| e.event == "level_merge_status")
            .map(|e| e.data["merge_status"].as_str().unwrap().to_owned())
            .collect();
        assert_eq!(
            statuses,
            vec![
                "collecting",
                "waiting",
                "merging",
                "validating",
                "merging",
                "validating",
                "rebasing",
                "complete"
            ]
        );
    }
}
