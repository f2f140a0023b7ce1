//! Types for the state tracker.

use chrono::{DateTime, Utc};

/// Identity of a tracked item.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SyncKey {
    pub provider_id: String,
    pub media_id: String,
}

impl SyncKey {
    pub fn new(provider_id: impl Into<String>, media_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            media_id: media_id.into(),
        }
    }
}

impl std::fmt::Display for SyncKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider_id, self.media_id)
    }
}

/// Proof of ownership handed out by a successful claim. Settling the item
/// (complete or fail) requires the token of the current claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimToken(String);

impl ClaimToken {
    pub(crate) fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Status of an item in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Seen by a listing, never claimed.
    Pending,
    /// Claimed by a worker. Re-claimable once stalled.
    InProgress,
    /// Stored at its destination. Terminal.
    Completed,
    /// Last attempt failed; eligible for another claim.
    Failed,
}

impl SyncStatus {
    /// Convert to the string stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parse from the string stored in the database.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the ledger.
#[derive(Debug, Clone)]
pub struct SyncRecord {
    pub key: SyncKey,
    pub filename: Option<String>,
    /// Set only once completed.
    pub destination_key: Option<String>,
    pub last_error: Option<String>,
    pub bytes_transferred: Option<u64>,
    pub first_seen_at: DateTime<Utc>,
    pub last_attempted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Number of failed attempts.
    pub attempt_count: u32,
    pub status: SyncStatus,
}

/// Counters recorded against a sync run.
#[derive(Debug, Clone, Default)]
pub struct SyncRunStats {
    pub items_seen: u64,
    pub items_completed: u64,
    pub items_failed: u64,
    pub items_skipped: u64,
    /// The run was cancelled or aborted before draining the catalog.
    pub interrupted: bool,
}

/// Summary of the ledger.
#[derive(Debug, Clone, Default)]
pub struct SyncSummary {
    pub total: u64,
    pub pending: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub failed: u64,
    pub last_sync_started: Option<DateTime<Utc>>,
    pub last_sync_completed: Option<DateTime<Utc>>,
    pub last_sync_interrupted: bool,
}
