// ABOUTME: Per-service lock preventing concurrent reconciliations of the same service.
// ABOUTME: Uses atomic file creation with holder info stored under <state_dir>/locks/.

use super::StateError;
use crate::types::ServiceName;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Locks older than this are assumed abandoned.
const STALE_AFTER_HOURS: i64 = 1;

/// An unreadable lock file younger than this is treated as held.
const UNREADABLE_GRACE: Duration = Duration::from_secs(30);

/// Information about who holds a service lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Hostname of the machine that holds the lock.
    pub holder: String,
    /// Process ID of the lock holder.
    pub pid: u32,
    /// When the lock was acquired.
    pub started_at: DateTime<Utc>,
    pub service: String,
}

impl LockInfo {
    pub fn new(service: &ServiceName) -> Self {
        Self {
            holder: this_host(),
            pid: std::process::id(),
            started_at: Utc::now(),
            service: service.to_string(),
        }
    }

    pub fn is_stale(&self) -> bool {
        let age = Utc::now() - self.started_at;
        age.num_hours() >= STALE_AFTER_HOURS
    }

    /// Held by a process on this machine that no longer exists.
    pub fn is_orphaned(&self) -> bool {
        self.holder == this_host() && !process_alive(self.pid)
    }
}

fn this_host() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

// Without procfs there is no cheap liveness check; assume the holder lives.
#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

/// Why an existing lock was removed before acquiring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokenLock {
    Stale(LockInfo),
    Orphaned(LockInfo),
    Forced(LockInfo),
    Unreadable,
}

impl std::fmt::Display for BrokenLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokenLock::Stale(info) => write!(
                f,
                "broke stale lock held by {} (pid {}) since {}",
                info.holder, info.pid, info.started_at
            ),
            BrokenLock::Orphaned(info) => write!(
                f,
                "broke lock of exited process {} on {}",
                info.pid, info.holder
            ),
            BrokenLock::Forced(info) => write!(
                f,
                "forcibly broke lock held by {} (pid {}) since {}",
                info.holder, info.pid, info.started_at
            ),
            BrokenLock::Unreadable => write!(f, "broke unreadable lock file"),
        }
    }
}

/// A held service lock. The lock file is removed when this is dropped.
#[derive(Debug)]
pub struct ServiceLock {
    path: PathBuf,
    service: ServiceName,
    broken: Option<BrokenLock>,
}

impl ServiceLock {
    /// Acquire the lock for `service` in `dir`.
    ///
    /// The lock file appears with its content already written, so two
    /// processes racing for the same lock cannot both succeed and neither
    /// sees a half-written one. An existing lock is broken when it is stale,
    /// orphaned, or `force` is set; otherwise `LockHeld` is returned. A lock
    /// that cannot be parsed is only broken once it is older than a grace
    /// period.
    pub(crate) fn acquire(dir: &Path, service: &ServiceName, force: bool) -> Result<Self, StateError> {
        let path = dir.join(format!("{}.lock", service));
        let info = LockInfo::new(service);
        let content = serde_json::to_vec(&info).map_err(|source| StateError::Serialize {
            service: service.to_string(),
            source,
        })?;

        if try_create(&path, &content)? {
            tracing::debug!(service = %service, "lock acquired");
            return Ok(Self::held(path, service, None));
        }

        let broken = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<LockInfo>(&bytes) {
                Ok(existing) if force => BrokenLock::Forced(existing),
                Ok(existing) if existing.is_stale() => BrokenLock::Stale(existing),
                Ok(existing) if existing.is_orphaned() => BrokenLock::Orphaned(existing),
                Ok(existing) => {
                    return Err(StateError::LockHeld {
                        service: service.to_string(),
                        holder: existing.holder,
                        pid: existing.pid,
                        started_at: existing.started_at,
                    });
                }
                Err(_) if force => BrokenLock::Unreadable,
                Err(_) => {
                    let modified = std::fs::metadata(&path)
                        .and_then(|m| m.modified())
                        .map_err(|e| StateError::io(&path, e))?;
                    let age = SystemTime::now()
                        .duration_since(modified)
                        .unwrap_or_default();
                    if age < UNREADABLE_GRACE {
                        return Err(StateError::LockPending {
                            service: service.to_string(),
                            since: DateTime::<Utc>::from(modified),
                        });
                    }
                    BrokenLock::Unreadable
                }
            },
            // Released between our create attempt and the read.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return if try_create(&path, &content)? {
                    Ok(Self::held(path, service, None))
                } else {
                    Err(StateError::Lock(format!(
                        "lock for {} changed hands while acquiring",
                        service
                    )))
                };
            }
            Err(e) => return Err(StateError::io(&path, e)),
        };

        tracing::debug!(service = %service, "{}", broken);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StateError::io(&path, e)),
        }

        if !try_create(&path, &content)? {
            return Err(StateError::Lock(format!(
                "lock for {} acquired by another process during break",
                service
            )));
        }

        Ok(Self::held(path, service, Some(broken)))
    }

    fn held(path: PathBuf, service: &ServiceName, broken: Option<BrokenLock>) -> Self {
        Self {
            path,
            service: service.clone(),
            broken,
        }
    }

    pub fn service(&self) -> &ServiceName {
        &self.service
    }

    /// The lock this one replaced, if any had to be broken.
    pub fn broken(&self) -> Option<&BrokenLock> {
        self.broken.as_ref()
    }

    /// Release explicitly, surfacing removal errors that `Drop` can only log.
    pub fn release(mut self) -> Result<(), StateError> {
        // Leaves an empty path behind so Drop has nothing to do.
        let path = std::mem::take(&mut self.path);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateError::io(path, e)),
        }
    }
}

impl Drop for ServiceLock {
    fn drop(&mut self) {
        if self.path.as_os_str().is_empty() {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(service = %self.service, "failed to remove lock file {}: {}", self.path.display(), e);
        }
    }
}

/// Write the lock to a temp file, then link it into place without replacing
/// an existing one.
fn try_create(path: &Path, content: &[u8]) -> Result<bool, StateError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut file = tempfile::NamedTempFile::new_in(dir).map_err(|e| StateError::io(dir, e))?;
    file.write_all(content)
        .and_then(|_| file.as_file().sync_all())
        .map_err(|e| StateError::io(file.path(), e))?;

    match file.persist_noclobber(path) {
        Ok(_) => Ok(true),
        Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(StateError::io(path, e.error)),
    }
}
