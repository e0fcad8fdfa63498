use std::path::PathBuf;

use thiserror::Error;

/// Errors from the persistence layer and state store.
#[derive(Debug, Error)]
pub enum StateError {
    /// The state file exists but is not parseable JSON. Never silently
    /// overwritten; the `.bak` sibling is the recovery path.
    #[error("state file corrupt at {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// An I/O failure while reading, writing, or locking state.
    #[error("state I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The feature advisory lock is held by another live process.
    #[error("feature {feature:?} is locked by pid {pid}")]
    LockHeld { feature: String, pid: u32 },

    /// The feature name failed validation (path traversal, bad characters).
    #[error("invalid feature name: {0:?}")]
    InvalidFeature(String),
}

impl StateError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
