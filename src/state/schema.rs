//! Ledger schema and forward-only migrations, tracked in `PRAGMA user_version`.

use rusqlite::Connection;

use super::error::StateError;

pub const SCHEMA_VERSION: i32 = 2;

/// Timestamps are unix seconds (UTC).
const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS sync_records (
    provider_id TEXT NOT NULL,
    media_id TEXT NOT NULL,
    filename TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    attempt_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    last_attempted_at INTEGER,
    destination_key TEXT,
    bytes_transferred INTEGER,
    first_seen_at INTEGER NOT NULL,
    completed_at INTEGER,
    PRIMARY KEY (provider_id, media_id)
);

CREATE INDEX IF NOT EXISTS idx_sync_records_status ON sync_records(status);
CREATE INDEX IF NOT EXISTS idx_sync_records_claim ON sync_records(status, last_attempted_at);

CREATE TABLE IF NOT EXISTS sync_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_uuid TEXT NOT NULL,
    started_at INTEGER NOT NULL,
    completed_at INTEGER,
    items_seen INTEGER DEFAULT 0,
    items_completed INTEGER DEFAULT 0,
    items_failed INTEGER DEFAULT 0,
    items_skipped INTEGER DEFAULT 0,
    interrupted INTEGER DEFAULT 0
);
"#;

/// Claims carry an owner token so a stalled worker cannot settle a re-claimed item.
const SCHEMA_V2: &str = r#"
ALTER TABLE sync_records ADD COLUMN claim_token TEXT;
"#;

/// DDL that brings a database from version `n - 1` to `n`, at index `n - 1`.
const STEPS: [&str; SCHEMA_VERSION as usize] = [SCHEMA_V1, SCHEMA_V2];

pub(crate) fn schema_version(conn: &Connection) -> Result<i32, StateError> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}

/// Apply every step past the stored version inside one transaction.
pub(crate) fn migrate(conn: &Connection) -> Result<(), StateError> {
    let found = schema_version(conn)?;
    if found > SCHEMA_VERSION {
        return Err(StateError::UnsupportedSchemaVersion {
            found,
            expected: SCHEMA_VERSION,
        });
    }
    if found == SCHEMA_VERSION {
        return Ok(());
    }

    let pending = &STEPS[found.max(0) as usize..];
    let mut batch = String::from("BEGIN;\n");
    for step in pending {
        batch.push_str(step);
    }
    batch.push_str(&format!("PRAGMA user_version = {};\nCOMMIT;", SCHEMA_VERSION));
    conn.execute_batch(&batch)?;

    tracing::debug!(from = found, to = SCHEMA_VERSION, "Migrated ledger schema");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns(conn: &Connection, table: &str) -> Vec<String> {
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({})", table))
            .unwrap();
        stmt.query_map([], |row| row.get::<_, String>(1))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap()
    }

    #[test]
    fn test_fresh_database_reaches_current_version() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), SCHEMA_VERSION);
        let cols = columns(&conn, "sync_records");
        for expected in [
            "provider_id",
            "media_id",
            "status",
            "attempt_count",
            "destination_key",
            "claim_token",
        ] {
            assert!(cols.iter().any(|c| c == expected), "missing column {}", expected);
        }
        assert!(columns(&conn, "sync_runs").iter().any(|c| c == "interrupted"));
    }

    #[test]
    fn test_rerun_keeps_rows() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        conn.execute(
            "INSERT INTO sync_records (provider_id, media_id, first_seen_at) VALUES ('p', 'm', 0)",
            [],
        )
        .unwrap();
        migrate(&conn).unwrap();
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM sync_records", [], |row| row.get(0))
            .unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn test_v1_database_gains_claim_token() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA_V1).unwrap();
        conn.pragma_update(None, "user_version", 1).unwrap();
        conn.execute(
            "INSERT INTO sync_records (provider_id, media_id, status, first_seen_at) VALUES ('p', 'm', 'completed', 0)",
            [],
        )
        .unwrap();

        migrate(&conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), 2);
        assert!(columns(&conn, "sync_records").iter().any(|c| c == "claim_token"));
        let status: String = conn
            .query_row("SELECT status FROM sync_records", [], |row| row.get(0))
            .unwrap();
        assert_eq!(status, "completed");
    }

    #[test]
    fn test_newer_database_refused() {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1)
            .unwrap();
        assert!(matches!(
            migrate(&conn),
            Err(StateError::UnsupportedSchemaVersion { found, .. }) if found == SCHEMA_VERSION + 1
        ));
    }
}
