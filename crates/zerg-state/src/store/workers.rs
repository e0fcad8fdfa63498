//! Worker records in the state document.

use std::collections::BTreeMap;

use serde_json::json;

use crate::doc::WorkerState;
use crate::error::StateError;
use crate::models::WorkerStatus;

use super::StateStore;

impl StateStore {
    /// Register a worker with its branch. Re-registering an id resets the
    /// record (a respawn replaces the previous incarnation).
    pub fn register_worker(&self, worker_id: u32, branch: &str) -> Result<(), StateError> {
        let branch = branch.to_owned();
        self.atomic_update(move |doc| {
            doc.workers
                .insert(worker_id.to_string(), WorkerState::new(branch.clone()));
            doc.push_event(
                "worker_registered",
                json!({"worker_id": worker_id, "branch": branch}),
            );
        })
    }

    pub fn update_worker_status(
        &self,
        worker_id: u32,
        status: WorkerStatus,
    ) -> Result<(), StateError> {
        self.atomic_update(move |doc| {
            let known = match doc.worker_mut(worker_id) {
                Some(worker) => {
                    worker.status = status;
                    true
                }
                None => false,
            };
            if known {
                doc.push_event(
                    "worker_status",
                    json!({"worker_id": worker_id, "status": status.to_string()}),
                );
            }
        })
    }

    /// Point a worker at its current task (or clear it with `None`).
    pub fn set_worker_task(
        &self,
        worker_id: u32,
        task_id: Option<&str>,
    ) -> Result<(), StateError> {
        let task_id = task_id.map(str::to_owned);
        self.atomic_update(move |doc| {
            if let Some(worker) = doc.worker_mut(worker_id) {
                worker.current_task = task_id;
            }
        })
    }

    /// Bump the completed-task counter and clear the current task.
    pub fn record_worker_completion(&self, worker_id: u32) -> Result<(), StateError> {
        self.atomic_update(move |doc| {
            if let Some(worker) = doc.worker_mut(worker_id) {
                worker.tasks_completed += 1;
                worker.current_task = None;
            }
        })
    }

    pub fn set_worker_port(
        &self,
        worker_id: u32,
        port: Option<u16>,
    ) -> Result<(), StateError> {
        self.atomic_update(move |doc| {
            if let Some(worker) = doc.worker_mut(worker_id) {
                worker.port = port;
            }
        })
    }

    /// All worker records, keyed by numeric id.
    pub fn get_workers(&self) -> BTreeMap<u32, WorkerState> {
        self.snapshot()
            .workers
            .into_iter()
            .filter_map(|(key, state)| key.parse::<u32>().ok().map(|id| (id, state)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn worker_lifecycle_round_trip() {
        let dir = TempDir::new().unwrap();
        let s = StateStore::open("workers-test", dir.path()).unwrap();

        s.register_worker(0, "zerg/workers-test/worker-0").unwrap();
        s.update_worker_status(0, WorkerStatus::Running).unwrap();
        s.set_worker_task(0, Some("T1")).unwrap();
        s.set_worker_port(0, Some(50123)).unwrap();

        let workers = s.get_workers();
        let w = &workers[&0];
        assert_eq!(w.status, WorkerStatus::Running);
        assert_eq!(w.current_task.as_deref(), Some("T1"));
        assert_eq!(w.port, Some(50123));
        assert_eq!(w.tasks_completed, 0);

        s.record_worker_completion(0).unwrap();
        let w = &s.get_workers()[&0];
        assert_eq!(w.tasks_completed, 1);
        assert!(w.current_task.is_none());
    }

    #[test]
    fn reregistration_replaces_record() {
        let dir = TempDir::new().unwrap();
        let s = StateStore::open("workers-test", dir.path()).unwrap();

        s.register_worker(1, "zerg/workers-test/worker-1").unwrap();
        s.record_worker_completion(1).unwrap();
        s.register_worker(1, "zerg/workers-test/worker-1").unwrap();

        let w = &s.get_workers()[&1];
        assert_eq!(w.tasks_completed, 0);
        assert_eq!(w.status, WorkerStatus::Initializing);
    }

    #[test]
    fn updates_to_unknown_workers_are_silent() {
        let dir = TempDir::new().unwrap();
        let s = StateStore::open("workers-test", dir.path()).unwrap();
        s.update_worker_status(9, WorkerStatus::Running).unwrap();
        assert!(s.get_workers().is_empty());
    }
}
