//! Durable state for zerg feature builds.
//!
//! A feature's entire execution state lives in a single JSON document on a
//! shared filesystem. Worker processes and the orchestrator coordinate
//! exclusively through this document, guarded by advisory file locks, plus
//! a handful of sibling marker files (feature lock, stop flag).

pub mod doc;
pub mod error;
pub mod lock;
pub mod models;
pub mod persistence;
pub mod store;

pub use doc::{ExecutionEvent, LevelState, StateDoc, TaskState, WorkerState};
pub use error::StateError;
pub use lock::{FeatureLock, LockInfo, validate_feature_name};
pub use models::{
    ExitCode, GateOutcome, LevelMergeStatus, LevelRunStatus, TaskStatus, WorkerStatus, level_name,
};
pub use persistence::PersistenceLayer;
pub use store::StateStore;
