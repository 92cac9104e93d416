use asqlite::Database;
use pretty_assertions::assert_eq;
use rusqlite::types::Value;

fn temp_db(name: &str) -> (tempfile::TempDir, String) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(name).to_string_lossy().into_owned();
    (dir, path)
}

#[tokio::test]
async fn test_dump_round_trips_into_a_fresh_database() {
    let (_dir, path) = temp_db("dump_src.db");
    let db = Database::open(&path).unwrap();
    let session = db.session();
    session
        .execute_batch(
            "CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT, raw BLOB);
             CREATE INDEX v_idx ON t (v);
             INSERT INTO t (v, raw) VALUES ('it''s here', x'0102'), (NULL, NULL);",
        )
        .await
        .unwrap();

    let script = session.dump().await.unwrap();
    assert_eq!(script.first().map(String::as_str), Some("BEGIN TRANSACTION;"));
    assert_eq!(script.last().map(String::as_str), Some("COMMIT;"));

    let (_dir2, restored_path) = temp_db("dump_restored.db");
    let restored = Database::open(&restored_path).unwrap();
    let restored_session = restored.session();
    restored_session.execute_batch(&script.join("\n")).await.unwrap();

    let row = restored_session
        .fetch_one("SELECT v, raw FROM t WHERE id = 1", [])
        .await
        .unwrap();
    assert_eq!(row[0], Value::Text("it's here".to_string()));
    assert_eq!(row[1], Value::Blob(vec![0x01, 0x02]));

    let row = restored_session
        .fetch_one("SELECT count(*) FROM sqlite_master WHERE type = 'index' AND name = 'v_idx'", [])
        .await
        .unwrap();
    assert_eq!(row[0], Value::Integer(1));
}

#[tokio::test]
async fn test_dump_inside_a_transaction_sees_uncommitted_writes() {
    let (_dir, path) = temp_db("dump_tx.db");
    let db = Database::open(&path).unwrap();
    let session = db.session();
    session
        .execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)")
        .await
        .unwrap();

    session.begin().await.unwrap();
    session
        .execute("INSERT INTO t (v) VALUES ('pending')", [])
        .await
        .unwrap();

    // The dump routes to the pinned connection and includes the pending row.
    let script = session.dump().await.unwrap();
    assert!(script.iter().any(|stmt| stmt.contains("'pending'")));

    session.rollback().await.unwrap();
    let script = session.dump().await.unwrap();
    assert!(!script.iter().any(|stmt| stmt.contains("'pending'")));
}
