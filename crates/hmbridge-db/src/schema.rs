//! Idempotent schema creation for the `devices` table.

use rusqlite::Connection;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS devices (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp DATETIME DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now')),
        interface TEXT NOT NULL,
        device_id TEXT DEFAULT '',
        param TEXT DEFAULT '',
        value TEXT DEFAULT '',
        UNIQUE(device_id, param)
    );
    CREATE INDEX IF NOT EXISTS idx_device_param ON devices(device_id, param);
";

/// Creates the `devices` table and its `(device_id, param)` index if absent.
///
/// Safe to call on every write.
///
/// # Errors
///
/// Returns the underlying SQLite error if a statement fails.
pub fn ensure_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_schema_is_idempotent() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        ensure_schema(&conn).expect("first run should succeed");
        ensure_schema(&conn).expect("second run should succeed");

        let index_exists: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'index' AND name = 'idx_device_param')",
                [],
                |row| row.get(0),
            )
            .expect("should query sqlite_master");
        assert!(index_exists, "supporting index should exist");
    }

    #[test]
    fn unique_constraint_rejects_plain_duplicate_insert() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        ensure_schema(&conn).expect("schema should be created");

        let insert = "INSERT INTO devices (interface, device_id, param, value) VALUES ('HmIP-RF', 'A:1', 'LEVEL', '1')";
        conn.execute(insert, []).expect("first insert succeeds");
        let err = conn.execute(insert, []).expect_err("duplicate pair must be rejected");
        assert!(err.to_string().contains("UNIQUE"));
    }
}
