// ABOUTME: Errors from the durable service state store.
// ABOUTME: Distinguishes I/O trouble, corrupt records and lock contention.

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state store I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize record for {service}: {source}")]
    Serialize {
        service: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("corrupt state record {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("no record for service {0}")]
    NotFound(String),

    #[error("{service} is locked by {holder} (pid {pid}) since {started_at}")]
    LockHeld {
        service: String,
        holder: String,
        pid: u32,
        started_at: DateTime<Utc>,
    },

    #[error("{service} has a lock file written at {since} that cannot be read yet")]
    LockPending {
        service: String,
        since: DateTime<Utc>,
    },

    #[error("lock error: {0}")]
    Lock(String),
}

impl StateError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
