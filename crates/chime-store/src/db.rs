use rusqlite::Connection;

use crate::error::Result;

/// Initialise the job store schema in `conn`.
///
/// `jobs` holds every not-yet-complete record with its lifecycle state as a
/// column; `completions` is the append-only terminal collection. The
/// `(state, scheduled_at)` index keeps both the queue poll and the backlog
/// query efficient with thousands of scheduled jobs.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id           TEXT    NOT NULL PRIMARY KEY,
            scheduled_at TEXT    NOT NULL,   -- RFC 3339
            args         TEXT    NOT NULL,   -- opaque JSON payload
            shards       TEXT    NOT NULL,   -- JSON array of shard numbers
            state        TEXT    NOT NULL DEFAULT 'registered',
            created_at   TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_jobs_state_scheduled
            ON jobs (state, scheduled_at);

        CREATE TABLE IF NOT EXISTS completions (
            job_id           TEXT    NOT NULL PRIMARY KEY,
            job              TEXT    NOT NULL,   -- encoded JobDefinition
            http_status      INTEGER,            -- NULL when no response arrived
            detail           TEXT,
            execution_start  TEXT    NOT NULL,
            duration_ms      INTEGER NOT NULL,
            execution_lag_ms INTEGER NOT NULL,
            completed_at     TEXT    NOT NULL
        ) STRICT;
        ",
    )?;
    Ok(())
}
