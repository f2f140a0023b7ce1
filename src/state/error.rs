//! Error types for the state tracker.

use std::path::PathBuf;

use thiserror::Error;

use super::types::SyncStatus;

#[derive(Error, Debug)]
pub enum StateError {
    /// Failed to open or create the database file.
    #[error("Failed to open database at {path}: {source}")]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },

    #[error("Database migration failed: {0}")]
    Migration(#[from] rusqlite::Error),

    #[error("Database query failed: {0}")]
    Query(String),

    /// Another connection holds the write lock past the busy timeout.
    #[error("Database busy: {0}")]
    Busy(String),

    #[error("Failed to spawn blocking task: {0}")]
    Spawn(#[from] tokio::task::JoinError),

    #[error("Database schema version {found} is newer than supported version {expected}")]
    UnsupportedSchemaVersion { found: i32, expected: i32 },

    /// A completed record was asked to complete under a different key.
    /// Always a programming error; never retried.
    #[error("State conflict for {key}: completed as '{existing}', refusing '{requested}'")]
    Conflict {
        key: String,
        existing: String,
        requested: String,
    },

    /// The claim went stale and another worker re-claimed the item.
    #[error("Claim on {key} was taken over by another worker")]
    ClaimLost { key: String },

    #[error("Illegal transition for {key}: {from} -> {to}")]
    InvalidTransition {
        key: String,
        from: String,
        to: SyncStatus,
    },
}

impl StateError {
    /// Create a Query (or Busy) error from a rusqlite error.
    pub fn query(source: rusqlite::Error) -> Self {
        match source.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked) => {
                Self::Busy(source.to_string())
            }
            _ => Self::Query(source.to_string()),
        }
    }

    /// Lock contention is worth retrying. Nothing else here is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy(_))
    }
}
