//! Typed accessors over the persistence layer.
//!
//! Every write goes through [`PersistenceLayer::atomic_update`] and appends
//! its audit event inside the same critical section, so the event order is
//! always consistent with the state order. Read accessors consult the
//! in-memory mirror; call [`StateStore::reload`] (or the sync service) first
//! when cross-process freshness matters.

mod events;
mod levels;
mod tasks;
mod workers;

use std::sync::Arc;

pub use tasks::StaleTask;

use crate::doc::StateDoc;
use crate::error::StateError;
use crate::persistence::PersistenceLayer;

/// Typed views over a feature's durable state.
#[derive(Clone)]
pub struct StateStore {
    persistence: Arc<PersistenceLayer>,
}

impl StateStore {
    pub fn new(persistence: Arc<PersistenceLayer>) -> Self {
        Self { persistence }
    }

    /// Convenience constructor building the persistence layer too.
    pub fn open(
        feature: &str,
        state_dir: impl Into<std::path::PathBuf>,
    ) -> Result<Self, StateError> {
        Ok(Self::new(Arc::new(PersistenceLayer::new(feature, state_dir)?)))
    }

    /// The underlying persistence layer.
    pub fn persistence(&self) -> &Arc<PersistenceLayer> {
        &self.persistence
    }

    /// Feature this store belongs to.
    pub fn feature(&self) -> &str {
        self.persistence.feature()
    }

    /// Refresh the in-memory mirror from disk (shared lock).
    pub fn reload(&self) -> Result<StateDoc, StateError> {
        self.persistence.load()
    }

    /// Copy of the in-memory mirror, without disk I/O.
    pub fn snapshot(&self) -> StateDoc {
        self.persistence.snapshot()
    }

    /// Run a multi-step mutation in one locked read-modify-write cycle.
    pub fn atomic_update<R>(
        &self,
        f: impl FnOnce(&mut StateDoc) -> R,
    ) -> Result<R, StateError> {
        self.persistence.atomic_update(f)
    }
}
