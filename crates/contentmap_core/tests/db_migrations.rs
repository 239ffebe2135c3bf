use contentmap_core::db::migrations::{current_user_version, latest_version};
use contentmap_core::db::{open_db, open_db_in_memory, DbError};
use rusqlite::Connection;

#[test]
fn open_db_in_memory_creates_bookkeeping_tables() {
    let conn = open_db_in_memory().unwrap();

    assert_eq!(current_user_version(&conn).unwrap(), latest_version());
    assert_object_exists(&conn, "table", "orm_locks");
    assert_object_exists(&conn, "table", "orm_sequences");
    assert_object_exists(&conn, "index", "idx_orm_locks_owner");
}

#[test]
fn reopening_a_migrated_file_keeps_version_and_locks() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("contentmap.db");

    let conn_first = open_db(&path).unwrap();
    conn_first
        .execute(
            "INSERT INTO orm_locks (objectid, login, sessionid) VALUES ('Chapter:1', 'ann', 's1')",
            [],
        )
        .unwrap();
    drop(conn_first);

    let conn_second = open_db(&path).unwrap();
    assert_eq!(current_user_version(&conn_second).unwrap(), latest_version());
    let locks: i64 = conn_second
        .query_row("SELECT COUNT(*) FROM orm_locks", [], |row| row.get(0))
        .unwrap();
    assert_eq!(locks, 1);
}

#[test]
fn opening_database_with_newer_schema_version_returns_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("future.db");

    let conn = Connection::open(&path).unwrap();
    conn.execute_batch("PRAGMA user_version = 999;").unwrap();
    drop(conn);

    let err = open_db(&path).unwrap_err();
    match err {
        DbError::UnsupportedSchemaVersion {
            db_version,
            latest_supported,
        } => {
            assert_eq!(db_version, 999);
            assert_eq!(latest_supported, latest_version());
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn lock_rows_get_an_acquisition_timestamp_by_default() {
    let conn = open_db_in_memory().unwrap();
    conn.execute(
        "INSERT INTO orm_locks (objectid, login, sessionid) VALUES ('Book:7', 'bob', 's2')",
        [],
    )
    .unwrap();
    let acquired_at: i64 = conn
        .query_row(
            "SELECT acquired_at FROM orm_locks WHERE objectid = 'Book:7'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert!(acquired_at > 0);
}

fn assert_object_exists(conn: &Connection, kind: &str, name: &str) {
    let exists: i64 = conn
        .query_row(
            "SELECT EXISTS(
                SELECT 1
                FROM sqlite_master
                WHERE type = ?1 AND name = ?2
            );",
            [kind, name],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(exists, 1, "{kind} {name} does not exist");
}
