//! State store trait and SQLite implementation.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension};

use super::error::StateError;
use super::schema;
use super::types::{ClaimToken, SyncKey, SyncRecord, SyncRunStats, SyncStatus, SyncSummary};
use crate::clock::{Clock, SystemClock};

/// Default age after which an `in_progress` claim counts as abandoned.
pub const DEFAULT_STALL_THRESHOLD: Duration = Duration::from_secs(2 * 60 * 60);

/// How long a writer waits on another connection's lock before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const RECORD_COLUMNS: &str = "provider_id, media_id, filename, status, attempt_count, last_error, last_attempted_at, destination_key, bytes_transferred, first_seen_at, completed_at";

/// Ledger operations.
///
/// Object-safe so it can be shared as `Arc<dyn StateStore>` across transfer
/// workers. Every transition is a single guarded write.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Record that a listing saw the item. Creates a `pending` record on
    /// first sight and never touches an existing record's status.
    async fn observe(&self, key: &SyncKey, filename: &str) -> Result<(), StateError>;

    async fn get(&self, key: &SyncKey) -> Result<Option<SyncRecord>, StateError>;

    /// Atomically move `absent | pending | failed | stalled in_progress` to
    /// `in_progress` under a fresh [`ClaimToken`]. Returns `None` when the
    /// item is completed or actively claimed elsewhere.
    async fn try_claim(&self, key: &SyncKey) -> Result<Option<ClaimToken>, StateError>;

    /// `in_progress -> completed` for the holder of `claim`. Repeating with
    /// the same destination key is a no-op; a different key on a completed
    /// record is a [`StateError::Conflict`]. A claim re-taken by another
    /// worker is [`StateError::ClaimLost`].
    async fn complete(
        &self,
        key: &SyncKey,
        claim: &ClaimToken,
        destination_key: &str,
        bytes_transferred: u64,
    ) -> Result<(), StateError>;

    /// `in_progress -> failed` for the holder of `claim`, bumping the
    /// attempt count.
    async fn fail(&self, key: &SyncKey, claim: &ClaimToken, error: &str) -> Result<(), StateError>;

    async fn summary(&self) -> Result<SyncSummary, StateError>;

    async fn list_by_status(&self, status: SyncStatus) -> Result<Vec<SyncRecord>, StateError>;

    /// Move every `failed` record back to `pending` with a clean slate.
    /// Returns the number of records reset.
    async fn reset_failed(&self) -> Result<u64, StateError>;

    /// Start a run in the ledger and return its row id.
    async fn start_sync_run(&self, run_uuid: &str) -> Result<i64, StateError>;

    async fn complete_sync_run(&self, run_id: i64, stats: &SyncRunStats) -> Result<(), StateError>;
}

/// SQLite implementation of the ledger.
pub struct SqliteStateStore {
    /// rusqlite::Connection is not Sync.
    conn: Mutex<Connection>,
    path: PathBuf,
    stall_threshold: Duration,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for SqliteStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStateStore")
            .field("path", &self.path)
            .field("stall_threshold", &self.stall_threshold)
            .finish_non_exhaustive()
    }
}

impl SqliteStateStore {
    /// Open or create a database at the given path.
    pub async fn open(path: &Path) -> Result<Self, StateError> {
        let path = path.to_path_buf();
        let path_clone = path.clone();

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path_clone).map_err(|e| StateError::Open {
                path: path_clone.clone(),
                source: e,
            })?;

            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(StateError::Migration)?;
            conn.pragma_update(None, "synchronous", "NORMAL")
                .map_err(StateError::Migration)?;
            conn.busy_timeout(BUSY_TIMEOUT)
                .map_err(StateError::Migration)?;

            schema::migrate(&conn)?;

            Ok::<_, StateError>(conn)
        })
        .await??;

        Ok(Self::from_connection(conn, path))
    }

    /// Open an in-memory database (for testing).
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StateError> {
        let conn = Connection::open_in_memory().map_err(|e| StateError::Open {
            path: PathBuf::from(":memory:"),
            source: e,
        })?;
        schema::migrate(&conn)?;
        Ok(Self::from_connection(conn, PathBuf::from(":memory:")))
    }

    fn from_connection(conn: Connection, path: PathBuf) -> Self {
        Self {
            conn: Mutex::new(conn),
            path,
            stall_threshold: DEFAULT_STALL_THRESHOLD,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_stall_threshold(mut self, threshold: Duration) -> Self {
        self.stall_threshold = threshold;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn now_ts(&self) -> i64 {
        self.clock.now().timestamp()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StateError> {
        self.conn
            .lock()
            .map_err(|e| StateError::Query(e.to_string()))
    }
}

fn read_record(conn: &Connection, key: &SyncKey) -> Result<Option<SyncRecord>, StateError> {
    conn.query_row(
        &format!(
            "SELECT {} FROM sync_records WHERE provider_id = ?1 AND media_id = ?2",
            RECORD_COLUMNS
        ),
        [&key.provider_id, &key.media_id],
        |row| Ok(row_to_sync_record(row)),
    )
    .optional()
    .map_err(StateError::query)
}

/// Token of the claim currently recorded for `key`.
fn claim_holder(conn: &Connection, key: &SyncKey) -> Result<Option<String>, StateError> {
    conn.query_row(
        "SELECT claim_token FROM sync_records WHERE provider_id = ?1 AND media_id = ?2",
        [&key.provider_id, &key.media_id],
        |row| row.get::<_, Option<String>>(0),
    )
    .optional()
    .map(Option::flatten)
    .map_err(StateError::query)
}

fn count_with_status(conn: &Connection, status: SyncStatus) -> Result<u64, StateError> {
    let count = conn
        .query_row(
            "SELECT COUNT(*) FROM sync_records WHERE status = ?1",
            [status.as_str()],
            |row| row.get::<_, i64>(0),
        )
        .map_err(StateError::query)?;
    Ok(count.max(0) as u64)
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn observe(&self, key: &SyncKey, filename: &str) -> Result<(), StateError> {
        let now = self.now_ts();
        let conn = self.lock()?;

        // Only the filename is refreshed; status and history are preserved.
        conn.execute(
            r#"
            INSERT INTO sync_records (provider_id, media_id, filename, status, first_seen_at)
            VALUES (?1, ?2, ?3, 'pending', ?4)
            ON CONFLICT(provider_id, media_id) DO UPDATE SET
                filename = excluded.filename
            "#,
            rusqlite::params![&key.provider_id, &key.media_id, filename, now],
        )
        .map_err(StateError::query)?;

        Ok(())
    }

    async fn get(&self, key: &SyncKey) -> Result<Option<SyncRecord>, StateError> {
        let conn = self.lock()?;
        read_record(&conn, key)
    }

    async fn try_claim(&self, key: &SyncKey) -> Result<Option<ClaimToken>, StateError> {
        let now = self.now_ts();
        let stall_secs = i64::try_from(self.stall_threshold.as_secs()).unwrap_or(i64::MAX);
        let stalled_before = now.saturating_sub(stall_secs);
        let token = ClaimToken::generate();

        let conn = self.lock()?;

        // One statement: the conflict clause's WHERE is the guard, so a lost
        // race shows up as zero changed rows.
        let changed = conn
            .execute(
                r#"
                INSERT INTO sync_records (provider_id, media_id, status, last_attempted_at, first_seen_at, claim_token)
                VALUES (?1, ?2, 'in_progress', ?3, ?3, ?5)
                ON CONFLICT(provider_id, media_id) DO UPDATE SET
                    status = 'in_progress',
                    last_attempted_at = excluded.last_attempted_at,
                    claim_token = excluded.claim_token
                WHERE sync_records.status IN ('pending', 'failed')
                   OR (sync_records.status = 'in_progress'
                       AND COALESCE(sync_records.last_attempted_at, 0) < ?4)
                "#,
                rusqlite::params![
                    &key.provider_id,
                    &key.media_id,
                    now,
                    stalled_before,
                    token.as_str()
                ],
            )
            .map_err(StateError::query)?;

        if changed == 1 {
            tracing::debug!(key = %key, "Claimed");
            Ok(Some(token))
        } else {
            tracing::debug!(key = %key, "Claim refused");
            Ok(None)
        }
    }

    async fn complete(
        &self,
        key: &SyncKey,
        claim: &ClaimToken,
        destination_key: &str,
        bytes_transferred: u64,
    ) -> Result<(), StateError> {
        let now = self.now_ts();
        let conn = self.lock()?;

        let changed = conn
            .execute(
                r#"
                UPDATE sync_records SET
                    status = 'completed',
                    destination_key = ?3,
                    bytes_transferred = ?4,
                    completed_at = ?5,
                    last_error = NULL
                WHERE provider_id = ?1 AND media_id = ?2
                  AND status = 'in_progress' AND claim_token = ?6
                "#,
                rusqlite::params![
                    &key.provider_id,
                    &key.media_id,
                    destination_key,
                    i64::try_from(bytes_transferred).unwrap_or(i64::MAX),
                    now,
                    claim.as_str(),
                ],
            )
            .map_err(StateError::query)?;

        if changed == 1 {
            return Ok(());
        }

        match read_record(&conn, key)? {
            Some(existing) if existing.status == SyncStatus::Completed => {
                let stored = existing.destination_key.unwrap_or_default();
                if stored == destination_key {
                    tracing::debug!(key = %key, "Already completed with the same destination");
                    Ok(())
                } else {
                    Err(StateError::Conflict {
                        key: key.to_string(),
                        existing: stored,
                        requested: destination_key.to_string(),
                    })
                }
            }
            Some(_) if claim_holder(&conn, key)?.as_deref() != Some(claim.as_str()) => {
                Err(StateError::ClaimLost {
                    key: key.to_string(),
                })
            }
            other => Err(StateError::InvalidTransition {
                key: key.to_string(),
                from: other.map_or("absent", |r| r.status.as_str()).to_string(),
                to: SyncStatus::Completed,
            }),
        }
    }

    async fn fail(&self, key: &SyncKey, claim: &ClaimToken, error: &str) -> Result<(), StateError> {
        let now = self.now_ts();
        let conn = self.lock()?;

        let changed = conn
            .execute(
                r#"
                UPDATE sync_records SET
                    status = 'failed',
                    attempt_count = attempt_count + 1,
                    last_error = ?3,
                    last_attempted_at = ?4
                WHERE provider_id = ?1 AND media_id = ?2
                  AND status = 'in_progress' AND claim_token = ?5
                "#,
                rusqlite::params![&key.provider_id, &key.media_id, error, now, claim.as_str()],
            )
            .map_err(StateError::query)?;

        if changed == 1 {
            return Ok(());
        }

        match read_record(&conn, key)? {
            Some(_) if claim_holder(&conn, key)?.as_deref() != Some(claim.as_str()) => {
                Err(StateError::ClaimLost {
                    key: key.to_string(),
                })
            }
            other => Err(StateError::InvalidTransition {
                key: key.to_string(),
                from: other.map_or("absent", |r| r.status.as_str()).to_string(),
                to: SyncStatus::Failed,
            }),
        }
    }

    async fn summary(&self) -> Result<SyncSummary, StateError> {
        let conn = self.lock()?;

        let total = conn
            .query_row("SELECT COUNT(*) FROM sync_records", [], |row| {
                row.get::<_, i64>(0)
            })
            .map_err(StateError::query)?
            .max(0) as u64;

        let last_sync: Option<(Option<i64>, Option<i64>, i64)> = conn
            .query_row(
                "SELECT started_at, completed_at, interrupted FROM sync_runs ORDER BY id DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(StateError::query)?;

        let (last_sync_started, last_sync_completed, last_sync_interrupted) = match last_sync {
            Some((started, completed, interrupted)) => (
                started.and_then(ts_to_datetime),
                completed.and_then(ts_to_datetime),
                interrupted != 0,
            ),
            None => (None, None, false),
        };

        Ok(SyncSummary {
            total,
            pending: count_with_status(&conn, SyncStatus::Pending)?,
            in_progress: count_with_status(&conn, SyncStatus::InProgress)?,
            completed: count_with_status(&conn, SyncStatus::Completed)?,
            failed: count_with_status(&conn, SyncStatus::Failed)?,
            last_sync_started,
            last_sync_completed,
            last_sync_interrupted,
        })
    }

    async fn list_by_status(&self, status: SyncStatus) -> Result<Vec<SyncRecord>, StateError> {
        let conn = self.lock()?;

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM sync_records WHERE status = ?1 ORDER BY first_seen_at, media_id",
                RECORD_COLUMNS
            ))
            .map_err(StateError::query)?;

        let records = stmt
            .query_map([status.as_str()], |row| Ok(row_to_sync_record(row)))
            .map_err(StateError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StateError::query)?;

        Ok(records)
    }

    async fn reset_failed(&self) -> Result<u64, StateError> {
        let conn = self.lock()?;

        let rows = conn
            .execute(
                "UPDATE sync_records SET status = 'pending', attempt_count = 0, last_error = NULL WHERE status = 'failed'",
                [],
            )
            .map_err(StateError::query)?;

        Ok(rows as u64)
    }

    async fn start_sync_run(&self, run_uuid: &str) -> Result<i64, StateError> {
        let started_at = self.now_ts();
        let conn = self.lock()?;

        conn.execute(
            "INSERT INTO sync_runs (run_uuid, started_at) VALUES (?1, ?2)",
            rusqlite::params![run_uuid, started_at],
        )
        .map_err(StateError::query)?;

        Ok(conn.last_insert_rowid())
    }

    async fn complete_sync_run(&self, run_id: i64, stats: &SyncRunStats) -> Result<(), StateError> {
        let completed_at = self.now_ts();
        let conn = self.lock()?;

        conn.execute(
            "UPDATE sync_runs SET completed_at = ?1, items_seen = ?2, items_completed = ?3, items_failed = ?4, items_skipped = ?5, interrupted = ?6 WHERE id = ?7",
            rusqlite::params![
                completed_at,
                stats.items_seen as i64,
                stats.items_completed as i64,
                stats.items_failed as i64,
                stats.items_skipped as i64,
                i64::from(stats.interrupted),
                run_id
            ],
        )
        .map_err(StateError::query)?;

        Ok(())
    }
}

fn ts_to_datetime(ts: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(ts, 0).single()
}

/// Convert a database row to a SyncRecord.
fn row_to_sync_record(row: &rusqlite::Row<'_>) -> SyncRecord {
    let provider_id: String = row.get(0).unwrap_or_default();
    let media_id: String = row.get(1).unwrap_or_default();
    let filename: Option<String> = row.get(2).ok().flatten();
    let status_str: String = row.get(3).unwrap_or_default();
    let attempt_count: i64 = row.get(4).unwrap_or(0);
    let last_error: Option<String> = row.get(5).ok().flatten();
    let last_attempted_at: Option<i64> = row.get(6).ok().flatten();
    let destination_key: Option<String> = row.get(7).ok().flatten();
    let bytes_transferred: Option<i64> = row.get(8).ok().flatten();
    let first_seen_at: i64 = row.get(9).unwrap_or(0);
    let completed_at: Option<i64> = row.get(10).ok().flatten();

    SyncRecord {
        key: SyncKey {
            provider_id,
            media_id,
        },
        filename,
        destination_key,
        last_error,
        bytes_transferred: bytes_transferred.map(|b| b.max(0) as u64),
        first_seen_at: ts_to_datetime(first_seen_at).unwrap_or(DateTime::UNIX_EPOCH),
        last_attempted_at: last_attempted_at.and_then(ts_to_datetime),
        completed_at: completed_at.and_then(ts_to_datetime),
        attempt_count: attempt_count.max(0) as u32,
        status: SyncStatus::from_str(&status_str).unwrap_or(SyncStatus::Pending),
    }
}
