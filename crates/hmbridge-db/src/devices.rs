//! Queries against the `devices` table.

use hmbridge_types::{base_device_id, DeviceEvent};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

/// A persisted event row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceRecord {
    pub id: i64,
    pub timestamp: String,
    pub interface: String,
    pub device_id: String,
    pub param: String,
    pub value: String,
}

impl DeviceRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            timestamp: row.get(1)?,
            interface: row.get(2)?,
            device_id: row.get(3)?,
            param: row.get(4)?,
            value: row.get(5)?,
        })
    }
}

const SELECT_COLUMNS: &str = "SELECT id, timestamp, interface, device_id, param, value FROM devices";

/// Inserts the event, or updates `value`, `interface` and `timestamp` of the
/// existing `(device_id, param)` row.
///
/// # Errors
///
/// Returns the underlying SQLite error if the statement fails.
pub fn upsert_event(conn: &Connection, event: &DeviceEvent) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO devices (interface, device_id, param, value, timestamp)
         VALUES (?1, ?2, ?3, ?4, strftime('%Y-%m-%d %H:%M:%f', 'now'))
         ON CONFLICT(device_id, param) DO UPDATE SET
             value = excluded.value,
             interface = excluded.interface,
             timestamp = strftime('%Y-%m-%d %H:%M:%f', 'now')",
        params![event.interface, event.device_id, event.param, event.value],
    )?;
    Ok(())
}

/// Fetches the row for an exact `(device_id, param)` pair.
///
/// # Errors
///
/// Returns the underlying SQLite error if the query fails.
pub fn get_record(
    conn: &Connection,
    device_id: &str,
    param: &str,
) -> Result<Option<DeviceRecord>, rusqlite::Error> {
    conn.query_row(
        &format!("{SELECT_COLUMNS} WHERE device_id = ?1 AND param = ?2"),
        params![device_id, param],
        DeviceRecord::from_row,
    )
    .optional()
}

/// Lists every row belonging to a physical device.
///
/// `device_id` is reduced to its base identity first, so `"ABC123:1"` and
/// `"ABC123"` both match rows for `ABC123`, `ABC123:0`, `ABC123:1`, ...
///
/// # Errors
///
/// Returns the underlying SQLite error if the query fails.
pub fn records_for_device(
    conn: &Connection,
    device_id: &str,
) -> Result<Vec<DeviceRecord>, rusqlite::Error> {
    let base = base_device_id(device_id);
    let mut stmt = conn.prepare(&format!(
        "{SELECT_COLUMNS}
         WHERE device_id = ?1 OR substr(device_id, 1, length(?1) + 1) = ?1 || ':'
         ORDER BY device_id, param"
    ))?;
    let records = stmt
        .query_map(params![base], DeviceRecord::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(records)
}

/// Counts all persisted rows.
///
/// # Errors
///
/// Returns the underlying SQLite error if the query fails.
pub fn count_records(conn: &Connection) -> Result<i64, rusqlite::Error> {
    conn.query_row("SELECT COUNT(*) FROM devices", [], |row| row.get(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ensure_schema;

    fn test_db() -> Connection {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        ensure_schema(&conn).expect("schema should be created");
        conn
    }

    fn event(device_id: &str, param: &str, value: &str) -> DeviceEvent {
        DeviceEvent {
            interface: "HmIP-RF".to_string(),
            device_id: device_id.to_string(),
            param: param.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn upsert_inserts_then_updates_in_place() {
        let conn = test_db();
        upsert_event(&conn, &event("ABC123:1", "LEVEL", "50")).expect("insert");
        let first = get_record(&conn, "ABC123:1", "LEVEL")
            .expect("query")
            .expect("row exists");

        let mut update = event("ABC123:1", "LEVEL", "75");
        update.interface = "VirtualDevices".to_string();
        upsert_event(&conn, &update).expect("update");

        let second = get_record(&conn, "ABC123:1", "LEVEL")
            .expect("query")
            .expect("row exists");
        assert_eq!(second.id, first.id, "surrogate key is stable");
        assert_eq!(second.value, "75");
        assert_eq!(second.interface, "VirtualDevices");
        assert!(second.timestamp >= first.timestamp);
        assert_eq!(count_records(&conn).expect("count"), 1);
    }

    #[test]
    fn distinct_params_get_distinct_rows() {
        let conn = test_db();
        upsert_event(&conn, &event("ABC123:1", "LEVEL", "50")).expect("insert");
        upsert_event(&conn, &event("ABC123:1", "WINDOW_STATE", "OPEN")).expect("insert");
        upsert_event(&conn, &event("ABC123:2", "LEVEL", "10")).expect("insert");
        assert_eq!(count_records(&conn).expect("count"), 3);
    }

    #[test]
    fn records_for_device_uses_base_identity() {
        let conn = test_db();
        upsert_event(&conn, &event("ABC123", "OPERATING_VOLTAGE", "3.0")).expect("insert");
        upsert_event(&conn, &event("ABC123:1", "LEVEL", "50")).expect("insert");
        upsert_event(&conn, &event("ABC123:2", "LEVEL", "10")).expect("insert");
        upsert_event(&conn, &event("ABC1234:1", "LEVEL", "99")).expect("insert");

        let rows = records_for_device(&conn, "ABC123:7").expect("query");
        let ids: Vec<&str> = rows.iter().map(|r| r.device_id.as_str()).collect();
        assert_eq!(ids, vec!["ABC123", "ABC123:1", "ABC123:2"]);
    }

    #[test]
    fn get_record_unknown_pair_is_none() {
        let conn = test_db();
        assert!(get_record(&conn, "NOPE:1", "LEVEL").expect("query").is_none());
    }
}
