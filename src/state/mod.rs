//! State tracker: the durable per-item ledger.
//!
//! Each `(provider_id, media_id)` pair moves through
//! `pending -> in_progress -> {completed | failed}`, with `failed` eligible
//! for another claim and `completed` terminal. Claims are guarded writes at
//! the database, so concurrent workers (or processes sharing the file) never
//! transfer the same item twice.

pub mod db;
pub mod error;
pub mod schema;
pub mod types;

pub use db::{SqliteStateStore, StateStore};
pub use error::StateError;
pub use types::{ClaimToken, SyncKey, SyncRecord, SyncRunStats, SyncStatus, SyncSummary};
