//! Low-level state persistence with cross-process file locking.
//!
//! The state JSON is shared between the orchestrator and worker processes
//! via the filesystem, so every read-modify-write cycle takes an exclusive
//! advisory lock on a sibling `.lock` file and every read-only load takes a
//! shared one. Within a process, a mutex over the in-memory mirror
//! serializes accessors.
//!
//! Writes are atomic: serialize to a temp file in the same directory, fsync,
//! then rename over the target. A `.bak` sibling of the previous contents is
//! written first so corruption is always manually recoverable.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt;
use parking_lot::Mutex;

use crate::doc::StateDoc;
use crate::error::StateError;

/// RAII guard over an advisory file lock. Releases on all exit paths.
struct FileLock {
    file: File,
}

impl FileLock {
    fn open(path: &Path) -> Result<File, StateError> {
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| StateError::io(path, e))
    }

    /// Block until the exclusive lock is held.
    fn exclusive(path: &Path) -> Result<Self, StateError> {
        let file = Self::open(path)?;
        file.lock_exclusive()
            .map_err(|e| StateError::io(path, e))?;
        Ok(Self { file })
    }

    /// Block until a shared lock is held.
    fn shared(path: &Path) -> Result<Self, StateError> {
        let file = Self::open(path)?;
        file.lock_shared().map_err(|e| StateError::io(path, e))?;
        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            tracing::debug!(error = %e, "lock release failed");
        }
    }
}

/// Durable JSON state for one feature, at `<state_dir>/<feature>.json`.
///
/// The in-memory mirror starts empty and is populated on first
/// [`load`](Self::load) or [`atomic_update`](Self::atomic_update). Multi-step
/// mutations compose inside a single `atomic_update` closure; the reload and
/// save happen exactly once per call, and the file lock is held for the whole
/// read-modify-write cycle.
pub struct PersistenceLayer {
    feature: String,
    state_dir: PathBuf,
    state_file: PathBuf,
    lock_path: PathBuf,
    mirror: Mutex<Option<StateDoc>>,
}

impl PersistenceLayer {
    /// Create a persistence layer for `feature`, ensuring `state_dir` exists.
    pub fn new(feature: &str, state_dir: impl Into<PathBuf>) -> Result<Self, StateError> {
        let state_dir = state_dir.into();
        fs::create_dir_all(&state_dir).map_err(|e| StateError::io(&state_dir, e))?;

        let state_file = state_dir.join(format!("{feature}.json"));
        let lock_path = state_dir.join(format!("{feature}.lock"));

        Ok(Self {
            feature: feature.to_owned(),
            state_dir,
            state_file,
            lock_path,
            mirror: Mutex::new(None),
        })
    }

    /// Feature name this layer persists.
    pub fn feature(&self) -> &str {
        &self.feature
    }

    /// Path to the state JSON file.
    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    /// Cross-process atomic read-modify-write.
    ///
    /// Acquires the in-process mutex and the exclusive file lock, reloads
    /// the latest state from disk so the mirror reflects concurrent writers,
    /// runs `f` against the mirror, then saves and releases the lock.
    ///
    /// A state file that turns unparseable mid-run is tolerated here (the
    /// mirror is kept, or initial state is used when there is no mirror yet)
    /// so a half-written file from a crashed writer cannot wedge every
    /// participant; the strict corruption check lives in [`Self::load`].
    pub fn atomic_update<R>(
        &self,
        f: impl FnOnce(&mut StateDoc) -> R,
    ) -> Result<R, StateError> {
        let mut mirror = self.mirror.lock();
        let _flock = FileLock::exclusive(&self.lock_path)?;

        // Reload latest state from disk under the lock.
        match fs::read_to_string(&self.state_file) {
            Ok(text) => match serde_json::from_str::<StateDoc>(&text) {
                Ok(doc) => *mirror = Some(doc),
                Err(e) => {
                    if mirror.is_none() {
                        tracing::warn!(
                            feature = %self.feature,
                            error = %e,
                            "state file unparseable, starting from initial state"
                        );
                        *mirror = Some(StateDoc::initial(&self.feature));
                    }
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if mirror.is_none() {
                    *mirror = Some(StateDoc::initial(&self.feature));
                }
            }
            Err(e) => return Err(StateError::io(&self.state_file, e)),
        }

        let doc = mirror
            .get_or_insert_with(|| StateDoc::initial(&self.feature));
        let out = f(doc);

        self.raw_save(doc)?;
        tracing::debug!(feature = %self.feature, "saved state");
        Ok(out)
    }

    /// Load state from disk under a shared lock.
    ///
    /// Creates (in memory) the initial state when no file exists yet. A file
    /// that exists but fails to parse raises [`StateError::Corrupt`]; it is
    /// never silently overwritten.
    pub fn load(&self) -> Result<StateDoc, StateError> {
        let mut mirror = self.mirror.lock();
        let _flock = FileLock::shared(&self.lock_path)?;

        let doc = match fs::read_to_string(&self.state_file) {
            Ok(text) => serde_json::from_str::<StateDoc>(&text).map_err(|e| {
                StateError::Corrupt {
                    path: self.state_file.clone(),
                    source: e,
                }
            })?,
            Err(e) if e.kind() == ErrorKind::NotFound => StateDoc::initial(&self.feature),
            Err(e) => return Err(StateError::io(&self.state_file, e)),
        };

        *mirror = Some(doc.clone());
        tracing::debug!(feature = %self.feature, "loaded state");
        Ok(doc)
    }

    /// Read the in-memory mirror without touching disk.
    ///
    /// Returns the initial state if nothing has been loaded yet. Used by
    /// read accessors between sync points.
    pub fn snapshot(&self) -> StateDoc {
        self.mirror
            .lock()
            .clone()
            .unwrap_or_else(|| StateDoc::initial(&self.feature))
    }

    /// Save the current mirror to disk under the exclusive lock.
    pub fn save(&self) -> Result<(), StateError> {
        let mirror = self.mirror.lock();
        let _flock = FileLock::exclusive(&self.lock_path)?;
        let doc = mirror
            .clone()
            .unwrap_or_else(|| StateDoc::initial(&self.feature));
        self.raw_save(&doc)
    }

    /// Delete the state file. Missing file is a no-op.
    pub fn delete(&self) -> Result<(), StateError> {
        match fs::remove_file(&self.state_file) {
            Ok(()) => {
                tracing::info!(feature = %self.feature, "deleted state");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateError::io(&self.state_file, e)),
        }
    }

    /// Whether the state file exists on disk.
    pub fn exists(&self) -> bool {
        self.state_file.exists()
    }

    /// Async [`Self::load`], offloaded to a blocking thread.
    pub async fn load_async(self: Arc<Self>) -> Result<StateDoc, StateError> {
        let path = self.state_file.clone();
        tokio::task::spawn_blocking(move || self.load())
            .await
            .map_err(|e| StateError::io(path, std::io::Error::other(e)))?
    }

    /// Async [`Self::save`], offloaded to a blocking thread.
    pub async fn save_async(self: Arc<Self>) -> Result<(), StateError> {
        let path = self.state_file.clone();
        tokio::task::spawn_blocking(move || self.save())
            .await
            .map_err(|e| StateError::io(path, std::io::Error::other(e)))?
    }

    /// Write `doc` to disk: `.bak` of the previous contents, then temp file
    /// + fsync + atomic rename. Called with the exclusive lock held.
    fn raw_save(&self, doc: &StateDoc) -> Result<(), StateError> {
        // Backup the previous contents. Best-effort: a failed backup must
        // not fail the save.
        if self.state_file.exists() {
            let backup = self.state_dir.join(format!("{}.json.bak", self.feature));
            if let Err(e) = fs::copy(&self.state_file, &backup) {
                tracing::warn!(error = %e, "state backup failed");
            }
        }

        let mut tmp = tempfile::Builder::new()
            .prefix(&format!("{}_", self.feature))
            .suffix(".tmp")
            .tempfile_in(&self.state_dir)
            .map_err(|e| StateError::io(&self.state_dir, e))?;

        let json = serde_json::to_vec_pretty(doc).map_err(|e| {
            StateError::io(
                &self.state_file,
                std::io::Error::new(ErrorKind::InvalidData, e),
            )
        })?;
        tmp.write_all(&json)
            .map_err(|e| StateError::io(&self.state_file, e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| StateError::io(&self.state_file, e))?;

        tmp.persist(&self.state_file)
            .map_err(|e| StateError::io(&self.state_file, e.error))?;
        Ok(())
    }
}
