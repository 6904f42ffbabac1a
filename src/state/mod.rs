// ABOUTME: Durable store of service records, one JSON file per service.
// ABOUTME: Writes are atomic (temp file + rename); per-service locks serialize reconciliations.

mod error;
mod lock;
mod record;

pub use error::StateError;
pub use lock::{BrokenLock, LockInfo, ServiceLock};
pub use record::{
    DatabaseRef, DatabaseRequest, NodeClass, NodeRef, Readiness, RollbackPoint, ServiceRecord,
    ServiceSpec,
    ServiceStatus,
};

use crate::types::{DatabaseId, NodeId, ServiceName};
use std::io::Write;
use std::path::{Path, PathBuf};

const SERVICES_DIR: &str = "services";
const LOCKS_DIR: &str = "locks";
const ARCHIVE_DIR: &str = "archive";

/// Default location, following the XDG state directory convention.
pub fn default_state_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".local/state/shipyard"))
}

/// The single source of truth for what this tool has deployed.
///
/// Each record is updated atomically on its own; there are no cross-record
/// transactions. Concurrent writers to the same record are kept apart by
/// [`ServiceLock`], not by the store itself.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StateError> {
        let root = root.into();
        for dir in [SERVICES_DIR, LOCKS_DIR, ARCHIVE_DIR] {
            let path = root.join(dir);
            std::fs::create_dir_all(&path).map_err(|e| StateError::io(&path, e))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, name: &ServiceName) -> PathBuf {
        self.root.join(SERVICES_DIR).join(format!("{}.json", name))
    }

    pub fn get(&self, name: &ServiceName) -> Result<Option<ServiceRecord>, StateError> {
        let path = self.record_path(name);
        match std::fs::read(&path) {
            Ok(bytes) => parse_record(&path, &bytes).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StateError::io(&path, e)),
        }
    }

    /// Like [`get`](Self::get), but a missing record is an error.
    pub fn require(&self, name: &ServiceName) -> Result<ServiceRecord, StateError> {
        self.get(name)?
            .ok_or_else(|| StateError::NotFound(name.to_string()))
    }

    /// Insert or replace a record. Readers see either the old or the new
    /// record, never a partial write.
    pub fn put(&self, record: &ServiceRecord) -> Result<(), StateError> {
        let path = self.record_path(&record.name);
        let json = serde_json::to_vec_pretty(record).map_err(|source| StateError::Serialize {
            service: record.name.to_string(),
            source,
        })?;
        write_atomic(&path, &json)?;
        tracing::debug!(service = %record.name, status = %record.status, "record committed");
        Ok(())
    }

    /// Remove a record. Removing a missing record is not an error.
    pub fn delete(&self, name: &ServiceName) -> Result<(), StateError> {
        let path = self.record_path(name);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateError::io(&path, e)),
        }
    }

    /// All records, ordered by name.
    pub fn list(&self) -> Result<Vec<ServiceRecord>, StateError> {
        let dir = self.root.join(SERVICES_DIR);
        let entries = std::fs::read_dir(&dir).map_err(|e| StateError::io(&dir, e))?;

        let mut records = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| StateError::io(&dir, e))?.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let bytes = std::fs::read(&path).map_err(|e| StateError::io(&path, e))?;
            records.push(parse_record(&path, &bytes)?);
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    /// Keep a copy of a terminated record, with its warnings, for later inspection.
    pub fn archive(&self, record: &ServiceRecord) -> Result<PathBuf, StateError> {
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let path = self
            .root
            .join(ARCHIVE_DIR)
            .join(format!("{}-{}.json", record.name, stamp));
        let json = serde_json::to_vec_pretty(record).map_err(|source| StateError::Serialize {
            service: record.name.to_string(),
            source,
        })?;
        write_atomic(&path, &json)?;
        Ok(path)
    }

    /// Take the exclusive lock for reconciling `name`.
    pub fn lock(&self, name: &ServiceName, force: bool) -> Result<ServiceLock, StateError> {
        ServiceLock::acquire(&self.root.join(LOCKS_DIR), name, force)
    }

    /// Active services whose record references the node.
    pub fn referencing_node(&self, id: &NodeId) -> Result<Vec<ServiceName>, StateError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|r| r.status != ServiceStatus::Absent && r.references_node(id))
            .map(|r| r.name)
            .collect())
    }

    /// Active services whose record references the database.
    pub fn referencing_database(&self, id: &DatabaseId) -> Result<Vec<ServiceName>, StateError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|r| r.status != ServiceStatus::Absent && r.references_database(id))
            .map(|r| r.name)
            .collect())
    }
}

fn parse_record(path: &Path, bytes: &[u8]) -> Result<ServiceRecord, StateError> {
    serde_json::from_slice(bytes).map_err(|e| StateError::Corrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Write via a temp file in the same directory, then rename over the target.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StateError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut file = tempfile::NamedTempFile::new_in(dir).map_err(|e| StateError::io(dir, e))?;
    file.write_all(contents)
        .and_then(|_| file.as_file().sync_all())
        .map_err(|e| StateError::io(file.path(), e))?;
    file.persist(path)
        .map_err(|e| StateError::io(path, e.error))?;
    Ok(())
}
