//! Persistent store for the feature-state document.
//!
//! All mutations funnel through [`StateStore::mutate`], which holds the
//! global `state` lock for the duration of read-compute-write. Writes go to
//! a sibling temp file and are renamed over the destination, so a reader
//! never observes a half-written document.
//!
//! Initialization happens exactly once: if a state document already exists
//! it is authoritative and is never overwritten, so progress survives
//! orchestrator restarts.

use crate::catalog::Catalog;
use crate::errors::StateError;
use crate::lock::DirLock;
use crate::state::StateDocument;
use anyhow::Context;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the global state mutex.
const STATE_LOCK: &str = "state";

pub struct StateStore {
    state_path: PathBuf,
    locks: DirLock,
    lock_timeout: Duration,
    catalog_ids: Vec<String>,
}

impl StateStore {
    pub fn new(
        state_path: &Path,
        locks_dir: &Path,
        lock_timeout: Duration,
        catalog: &Catalog,
    ) -> Self {
        Self {
            state_path: state_path.to_path_buf(),
            locks: DirLock::new(locks_dir),
            lock_timeout,
            catalog_ids: catalog.ids(),
        }
    }

    /// Load the current state, initializing from the catalog on first run.
    ///
    /// Once a state document exists it is authoritative; initialization is a
    /// no-op on every later call.
    pub fn load(&self) -> Result<StateDocument, StateError> {
        let _guard = self.locks.acquire(STATE_LOCK, self.lock_timeout)?;
        if self.state_path.exists() {
            return self.read_document();
        }
        let doc = StateDocument::from_ids(&self.catalog_ids);
        doc.validate()?;
        self.write_document(&doc)?;
        Ok(doc)
    }

    /// Deep-copied view of the current state. Does not take the lock; the
    /// atomic rename on write guarantees a consistent read.
    pub fn snapshot(&self) -> Result<StateDocument, StateError> {
        self.read_document()
    }

    /// Read-modify-write under the state lock.
    ///
    /// `f` mutates the document in place and returns a value. If `f` errors
    /// the mutation is abandoned without a write. On success the document is
    /// validated against the invariants and persisted atomically, but only
    /// when it actually changed. Critical sections must stay short: no
    /// external I/O inside `f`.
    pub fn mutate<T, E>(&self, f: impl FnOnce(&mut StateDocument) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StateError>,
    {
        let _guard = self
            .locks
            .acquire(STATE_LOCK, self.lock_timeout)
            .map_err(|e| E::from(StateError::from(e)))?;

        let mut doc = if self.state_path.exists() {
            self.read_document().map_err(E::from)?
        } else {
            StateDocument::from_ids(&self.catalog_ids)
        };
        let before = doc.clone();

        let value = f(&mut doc)?;

        if doc != before {
            doc.validate().map_err(E::from)?;
            self.write_document(&doc).map_err(E::from)?;
        }
        Ok(value)
    }

    fn read_document(&self) -> Result<StateDocument, StateError> {
        let content = std::fs::read_to_string(&self.state_path)
            .with_context(|| format!("Failed to read state file: {}", self.state_path.display()))?;
        let doc: StateDocument = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse state JSON: {}", self.state_path.display()))?;
        Ok(doc)
    }

    fn write_document(&self, doc: &StateDocument) -> Result<(), StateError> {
        if let Some(parent) = self.state_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create state directory")?;
        }
        let json = serde_json::to_string_pretty(doc).context("Failed to serialize state")?;
        let tmp = self.state_path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .with_context(|| format!("Failed to write temp state file: {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.state_path)
            .with_context(|| format!("Failed to commit state file: {}", self.state_path.display()))?;
        Ok(())
    }
}
