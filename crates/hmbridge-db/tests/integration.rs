use hmbridge_db::{
    count_records, create_pool, get_record, DbRuntimeSettings, PersistenceGateway,
};
use hmbridge_types::DeviceEvent;

fn level_event(value: &str) -> DeviceEvent {
    DeviceEvent {
        interface: "HmIP-RF".to_string(),
        device_id: "ABC123:1".to_string(),
        param: "LEVEL".to_string(),
        value: value.to_string(),
    }
}

#[test]
fn repeated_event_leaves_exactly_one_row() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("events.db");
    let pool = create_pool(path.to_str().expect("utf-8 path"), DbRuntimeSettings::default())
        .expect("failed to create pool");
    let gateway = PersistenceGateway::new(pool.clone());

    assert!(gateway.upsert(&level_event("50")));
    let first = {
        let conn = pool.get().expect("connection");
        get_record(&conn, "ABC123:1", "LEVEL")
            .expect("query")
            .expect("row exists")
    };

    assert!(gateway.upsert(&level_event("50")));

    let conn = pool.get().expect("connection");
    assert_eq!(count_records(&conn).expect("count"), 1);
    let second = get_record(&conn, "ABC123:1", "LEVEL")
        .expect("query")
        .expect("row exists");
    assert_eq!(second.value, "50");
    assert!(second.timestamp >= first.timestamp, "timestamp is refreshed");
}

#[test]
fn schema_is_created_lazily_and_recreated_after_drop() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("events.db");
    let pool = create_pool(path.to_str().expect("utf-8 path"), DbRuntimeSettings::default())
        .expect("failed to create pool");
    let gateway = PersistenceGateway::new(pool.clone());

    {
        let conn = pool.get().expect("connection");
        let exists: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'devices')",
                [],
                |row| row.get(0),
            )
            .expect("should query sqlite_master");
        assert!(!exists, "no table before the first write");
    }

    assert!(gateway.upsert(&level_event("10")));

    pool.get()
        .expect("connection")
        .execute_batch("DROP TABLE devices;")
        .expect("drop table");

    assert!(gateway.upsert(&level_event("20")));
    let rows = gateway.records_for_device("ABC123").expect("query");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].value, "20");
}

#[test]
fn unavailable_storage_reports_failure_without_panicking() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("missing-dir").join("events.db");
    let pool = create_pool(
        path.to_str().expect("utf-8 path"),
        DbRuntimeSettings {
            busy_timeout_ms: 200,
            pool_max_size: 1,
            idle_timeout_secs: 60,
        },
    )
    .expect("pool creation does not touch the file");
    let gateway = PersistenceGateway::new(pool);

    assert!(!gateway.upsert(&level_event("50")));
    assert!(gateway.try_upsert(&level_event("50")).is_err());
}
