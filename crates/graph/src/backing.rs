//! Durable stores behind an [`ObjectGraph`](crate::ObjectGraph).

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::GraphError;
use crate::node::Snapshot;

/// Durable storage for graph snapshots.
///
/// `store` must be all-or-nothing: after a failed store, `load` returns the
/// previously stored snapshot.
pub trait Backing: Send + 'static {
    fn load(&mut self) -> Result<Option<Snapshot>, GraphError>;
    fn store(&mut self, snapshot: &Snapshot) -> Result<(), GraphError>;
}

// ---------------------------------------------------------------------------
// JsonFileBacking
// ---------------------------------------------------------------------------

/// Stores the graph as a JSON document, replaced atomically on every commit.
#[derive(Debug, Clone)]
pub struct JsonFileBacking {
    path: PathBuf,
}

impl JsonFileBacking {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Backing for JsonFileBacking {
    fn load(&mut self) -> Result<Option<Snapshot>, GraphError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&mut self, snapshot: &Snapshot) -> Result<(), GraphError> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent)?;

        let bytes = serde_json::to_vec_pretty(snapshot)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| GraphError::Io(e.error))?;

        debug!(path = %self.path.display(), nodes = snapshot.len(), "graph persisted");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryBacking
// ---------------------------------------------------------------------------

/// In-memory store. Clones share state, so a test can keep a handle and
/// inspect what was committed, or make commits fail.
#[derive(Debug, Clone, Default)]
pub struct MemoryBacking {
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    stored: Option<Snapshot>,
    commits: usize,
    reject: Option<String>,
}

impl MemoryBacking {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful stores.
    pub fn commits(&self) -> usize {
        self.inner.lock().unwrap().commits
    }

    /// The last stored snapshot.
    pub fn stored(&self) -> Option<Snapshot> {
        self.inner.lock().unwrap().stored.clone()
    }

    /// Makes every following store fail with `reason` (or succeed again with `None`).
    pub fn reject_commits(&self, reason: Option<&str>) {
        self.inner.lock().unwrap().reject = reason.map(str::to_string);
    }
}

impl Backing for MemoryBacking {
    fn load(&mut self) -> Result<Option<Snapshot>, GraphError> {
        Ok(self.inner.lock().unwrap().stored.clone())
    }

    fn store(&mut self, snapshot: &Snapshot) -> Result<(), GraphError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(reason) = &inner.reject {
            return Err(GraphError::Rejected(reason.clone()));
        }
        inner.stored = Some(snapshot.clone());
        inner.commits += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn json_file_missing_loads_none() {
        let dir = TempDir::new().unwrap();
        let mut backing = JsonFileBacking::new(dir.path().join("graph.json"));
        assert!(backing.load().unwrap().is_none());
    }

    #[test]
    fn json_file_store_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/graph.json");
        let mut backing = JsonFileBacking::new(&path);

        let snapshot = Snapshot {
            next_id: 3,
            ..Snapshot::default()
        };
        backing.store(&snapshot).unwrap();
        assert!(path.exists());
        assert_eq!(backing.load().unwrap(), Some(snapshot));
    }

    #[test]
    fn json_file_corrupt_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("graph.json");
        std::fs::write(&path, b"{ not json").unwrap();
        let mut backing = JsonFileBacking::new(&path);
        assert!(matches!(backing.load(), Err(GraphError::Json(_))));
    }

    #[test]
    fn memory_rejection_keeps_previous_snapshot() {
        let handle = MemoryBacking::new();
        let mut backing = handle.clone();

        let first = Snapshot {
            next_id: 1,
            ..Snapshot::default()
        };
        backing.store(&first).unwrap();

        handle.reject_commits(Some("disk full"));
        let second = Snapshot {
            next_id: 2,
            ..Snapshot::default()
        };
        assert!(matches!(backing.store(&second), Err(GraphError::Rejected(_))));
        assert_eq!(handle.stored(), Some(first));
        assert_eq!(handle.commits(), 1);
    }
}
