use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `schedules` table (idempotent) and an index on
/// `(enabled, next_run)` so the due query stays an index range scan.
/// Timestamp columns hold canonical UTC strings (`YYYY-MM-DDTHH:MM:SSZ`),
/// which is what makes the lexical `next_run <= ?` comparison correct.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schedules (
            id               TEXT    NOT NULL PRIMARY KEY,
            params           TEXT    NOT NULL,   -- opaque JSON payload
            recurrence_rule  TEXT    NOT NULL,   -- RFC 5545 RRULE
            next_run         TEXT    NOT NULL,   -- ISO-8601 UTC
            created_at       TEXT    NOT NULL,   -- ISO-8601 UTC
            enabled          INTEGER NOT NULL DEFAULT 1,
            is_test          INTEGER NOT NULL DEFAULT 0,
            expires_at       TEXT                -- ISO-8601 UTC or NULL
        );

        CREATE INDEX IF NOT EXISTS idx_schedules_due ON schedules (enabled, next_run);
        ",
    )?;
    Ok(())
}
