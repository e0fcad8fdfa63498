//! Level records and the merge-status protocol fields.

use chrono::Utc;
use serde_json::json;

use crate::error::StateError;
use crate::models::{LevelMergeStatus, LevelRunStatus};

use super::StateStore;

impl StateStore {
    /// Ensure a level record exists (pending, no merge status).
    pub fn init_level(&self, level: u32) -> Result<(), StateError> {
        self.atomic_update(move |doc| {
            doc.level_entry(level);
        })
    }

    pub fn set_current_level(&self, level: u32) -> Result<(), StateError> {
        self.atomic_update(move |doc| {
            doc.current_level = level;
        })
    }

    /// Set a level's run status, stamping started/completed timestamps on
    /// the running/complete transitions.
    pub fn set_level_status(
        &self,
        level: u32,
        status: LevelRunStatus,
    ) -> Result<(), StateError> {
        self.atomic_update(move |doc| {
            let now = Utc::now();
            let record = doc.level_entry(level);
            record.status = status;
            match status {
                LevelRunStatus::Running => record.started_at = Some(now),
                LevelRunStatus::Complete => record.completed_at = Some(now),
                LevelRunStatus::Pending => {}
            }
            doc.push_event(
                "level_status",
                json!({"level": level, "status": status.to_string()}),
            );
        })
    }

    /// Record a merge-protocol transition for a level.
    pub fn set_level_merge_status(
        &self,
        level: u32,
        status: LevelMergeStatus,
    ) -> Result<(), StateError> {
        self.atomic_update(move |doc| {
            doc.level_entry(level).merge_status = Some(status);
            doc.push_event(
                "level_merge_status",
                json!({"level": level, "merge_status": status.to_string()}),
            );
        })
    }

    pub fn get_level_merge_status(&self, level: u32) -> Option<LevelMergeStatus> {
        self.snapshot().level(level).and_then(|l| l.merge_status)
    }

    /// Record the merge commit produced for a level.
    pub fn set_level_merge_commit(
        &self,
        level: u32,
        commit: Option<&str>,
    ) -> Result<(), StateError> {
        let commit = commit.map(str::to_owned);
        self.atomic_update(move |doc| {
            doc.level_entry(level).merge_commit = commit.clone();
            doc.push_event(
                "level_merge_commit",
                json!({"level": level, "merge_commit": commit}),
            );
        })
    }
}
