//! Per-request scratch areas.
//!
//! Each request gets one private directory for the lifetime of its attempt
//! sequence (retries share it). The remote phase writes page images there;
//! nothing else touches it.
//!
//! Release is explicit and returns a [`CleanupFailure`] the worker logs and
//! drops. A [`ScratchArea`] that is dropped without being released (panic,
//! cancelled future) releases itself, so every acquired area gets exactly one
//! removal attempt on every exit path.

use crate::error::{CleanupFailure, PoolError};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct Counters {
    acquired: AtomicUsize,
    released: AtomicUsize,
    release_failures: AtomicUsize,
}

/// Snapshot of scratch-area bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchStats {
    pub acquired: usize,
    /// Removal attempts, successful or not.
    pub released: usize,
    pub release_failures: usize,
}

/// Allocates scratch areas under a fixed root.
#[derive(Debug, Clone)]
pub struct ScratchManager {
    root: Option<PathBuf>,
    counters: Arc<Counters>,
}

impl ScratchManager {
    /// `root = None` uses the system temp directory.
    pub fn new(root: Option<PathBuf>) -> Self {
        Self {
            root,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Create a fresh, empty directory for one request.
    ///
    /// Fails only when the OS refuses (missing root, disk full, fd limit).
    pub fn acquire(&self, label: &str) -> Result<ScratchArea, PoolError> {
        let mut builder = tempfile::Builder::new();
        let prefix = format!("pdf2md-{}-", sanitise(label));
        builder.prefix(&prefix);

        let dir = match &self.root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .map_err(|source| PoolError::Resource {
            root: self.root.clone().unwrap_or_else(std::env::temp_dir),
            source,
        })?;

        self.counters.acquired.fetch_add(1, Ordering::SeqCst);
        let path = dir.path().to_path_buf();
        debug!("Acquired scratch area {}", path.display());

        Ok(ScratchArea {
            dir: Some(dir),
            path,
            counters: Arc::clone(&self.counters),
        })
    }

    pub fn stats(&self) -> ScratchStats {
        ScratchStats {
            acquired: self.counters.acquired.load(Ordering::SeqCst),
            released: self.counters.released.load(Ordering::SeqCst),
            release_failures: self.counters.release_failures.load(Ordering::SeqCst),
        }
    }
}

/// An exclusively-owned working directory tied to one request.
#[derive(Debug)]
pub struct ScratchArea {
    dir: Option<TempDir>,
    path: PathBuf,
    counters: Arc<Counters>,
}

impl ScratchArea {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_released(&self) -> bool {
        self.dir.is_none()
    }

    /// Remove the directory. Idempotent: later calls are no-ops returning `Ok`.
    pub fn release(&mut self) -> Result<(), CleanupFailure> {
        let Some(dir) = self.dir.take() else {
            return Ok(());
        };
        self.counters.released.fetch_add(1, Ordering::SeqCst);
        dir.close().map_err(|source| {
            self.counters.release_failures.fetch_add(1, Ordering::SeqCst);
            CleanupFailure {
                path: self.path.clone(),
                source,
            }
        })?;
        debug!("Released scratch area {}", self.path.display());
        Ok(())
    }
}

impl Drop for ScratchArea {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("{}", e);
        }
    }
}

/// Keep directory prefixes portable: display names are user-supplied.
fn sanitise(label: &str) -> String {
    let cleaned: String = label
        .chars()
        .take(32)
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "work".to_string()
    } else {
        cleaned
    }
}
