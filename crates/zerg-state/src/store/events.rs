//! Execution log, pause/resume, error tracking, and metrics.

use crate::doc::ExecutionEvent;
use crate::error::StateError;

use super::StateStore;

impl StateStore {
    /// Append an event to the execution log.
    pub fn append_event(
        &self,
        event: &str,
        data: serde_json::Value,
    ) -> Result<(), StateError> {
        let event = event.to_owned();
        self.atomic_update(move |doc| {
            doc.push_event(&event, data);
        })?;
        Ok(())
    }

    /// Most recent events (all of them when `limit` is `None`).
    pub fn get_events(&self, limit: Option<usize>) -> Vec<ExecutionEvent> {
        let log = self.snapshot().execution_log;
        match limit {
            Some(n) if n < log.len() => log[log.len() - n..].to_vec(),
            _ => log,
        }
    }

    pub fn set_paused(&self, paused: bool) -> Result<(), StateError> {
        self.atomic_update(move |doc| {
            doc.paused = paused;
        })
    }

    pub fn is_paused(&self) -> bool {
        self.snapshot().paused
    }

    /// Set or clear the global recoverable error.
    pub fn set_error(&self, error: Option<&str>) -> Result<(), StateError> {
        let error = error.map(str::to_owned);
        self.atomic_update(move |doc| {
            doc.error = error;
        })
    }

    pub fn get_error(&self) -> Option<String> {
        self.snapshot().error
    }

    pub fn update_metrics(&self, metrics: serde_json::Value) -> Result<(), StateError> {
        self.atomic_update(move |doc| {
            doc.metrics = Some(metrics);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn event_log_appends_in_order() {
        let dir = TempDir::new().unwrap();
        let s = StateStore::open("events-test", dir.path()).unwrap();

        s.append_event("first", serde_json::json!({"n": 1})).unwrap();
        s.append_event("second", serde_json::json!({"n": 2})).unwrap();
        s.append_event("third", serde_json::json!({"n": 3})).unwrap();

        let events = s.get_events(None);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].event, "first");
        assert_eq!(events[2].event, "third");
        assert!(events[0].timestamp <= events[2].timestamp);

        let last_two = s.get_events(Some(2));
        assert_eq!(last_two.len(), 2);
        assert_eq!(last_two[0].event, "second");
    }

    #[test]
    fn pause_and_error_round_trip() {
        let dir = TempDir::new().unwrap();
        let s = StateStore::open("events-test", dir.path()).unwrap();

        assert!(!s.is_paused());
        s.set_paused(true).unwrap();
        assert!(s.is_paused());

        assert!(s.get_error().is_none());
        s.set_error(Some("merge failed")).unwrap();
        assert_eq!(s.get_error().as_deref(), Some("merge failed"));
        s.set_error(None).unwrap();
        assert!(s.get_error().is_none());
    }

    #[test]
    fn metrics_stored_opaquely() {
        let dir = TempDir::new().unwrap();
        let s = StateStore::open("events-test", dir.path()).unwrap();
        s.update_metrics(serde_json::json!({"tasks_per_minute": 1.5}))
            .unwrap();
        let doc = s.reload().unwrap();
        assert_eq!(doc.metrics.unwrap()["tasks_per_minute"], 1.5);
    }
}
