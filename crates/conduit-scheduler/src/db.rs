use rusqlite::Connection;

use crate::error::StoreError;

/// Initialise the source schema in `conn`.
///
/// Creates the `sources` table. Safe to call on an existing database.
pub fn init_db(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS sources (
            id               TEXT    NOT NULL PRIMARY KEY,
            kind             TEXT    NOT NULL,
            schedule         TEXT    NOT NULL,
            timezone         TEXT    NOT NULL DEFAULT '',
            status           TEXT    NOT NULL DEFAULT 'active',
            last_sync_at     TEXT,               -- RFC 3339 or NULL
            sync_count       INTEGER NOT NULL DEFAULT 0,
            error_count      INTEGER NOT NULL DEFAULT 0,
            last_error       TEXT,
            last_sync_result TEXT,               -- JSON-encoded SyncResult
            created_at       TEXT    NOT NULL,
            updated_at       TEXT    NOT NULL
        ) STRICT;
        ",
    )?;
    Ok(())
}
