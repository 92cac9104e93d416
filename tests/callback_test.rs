use std::sync::{Arc, Mutex};

use asqlite::Database;
use rusqlite::hooks::{AuthAction, Authorization};
use rusqlite::types::Value;

fn temp_db(name: &str) -> (tempfile::TempDir, String) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(name).to_string_lossy().into_owned();
    (dir, path)
}

async fn open_with_table(path: &str) -> Database {
    let db = Database::open(path).unwrap();
    db.session()
        .execute_batch("CREATE TABLE IF NOT EXISTS t (id INTEGER PRIMARY KEY, v TEXT)")
        .await
        .unwrap();
    db
}

#[tokio::test]
async fn test_trace_observes_session_statements() {
    let (_dir, path) = temp_db("trace.db");
    let db = open_with_table(&path).await;
    let session = db.session();

    let traced: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&traced);
    session
        .set_trace(Some(Arc::new(move |sql: &str| {
            sink.lock().unwrap().push(sql.to_string());
        })))
        .await
        .unwrap();

    session
        .execute("INSERT INTO t (v) VALUES ('traced')", [])
        .await
        .unwrap();
    session.fetch_all("SELECT v FROM t", []).await.unwrap();

    let seen = traced.lock().unwrap().clone();
    assert!(seen.iter().any(|sql| sql.contains("INSERT INTO t")));
    assert!(seen.iter().any(|sql| sql.contains("SELECT v FROM t")));

    // After clearing, statements no longer reach the callback.
    session.set_trace(None).await.unwrap();
    let before = traced.lock().unwrap().len();
    session
        .execute("INSERT INTO t (v) VALUES ('silent')", [])
        .await
        .unwrap();
    assert_eq!(traced.lock().unwrap().len(), before);
}

#[tokio::test]
async fn test_trace_observes_transaction_statements() {
    let (_dir, path) = temp_db("trace_tx.db");
    let db = open_with_table(&path).await;
    let session = db.session();

    let traced: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&traced);
    session
        .set_trace(Some(Arc::new(move |sql: &str| {
            sink.lock().unwrap().push(sql.to_string());
        })))
        .await
        .unwrap();

    // The transaction pins the callback-bearing connection, so hooks keep
    // observing statements inside it.
    session.begin().await.unwrap();
    session
        .execute("INSERT INTO t (v) VALUES ('inside')", [])
        .await
        .unwrap();
    session.commit().await.unwrap();

    let seen = traced.lock().unwrap().clone();
    assert!(seen.iter().any(|sql| sql.contains("BEGIN")));
    assert!(seen.iter().any(|sql| sql.contains("INSERT INTO t")));
    assert!(seen.iter().any(|sql| sql.contains("COMMIT")));
}

#[tokio::test]
async fn test_panicking_trace_does_not_fail_the_statement() {
    let (_dir, path) = temp_db("trace_panic.db");
    let db = open_with_table(&path).await;
    let session = db.session();

    session
        .set_trace(Some(Arc::new(|_sql: &str| {
            panic!("misbehaving trace callback");
        })))
        .await
        .unwrap();

    // Tracing failures are swallowed; the statement itself succeeds.
    session
        .execute("INSERT INTO t (v) VALUES ('fine')", [])
        .await
        .unwrap();
}

#[tokio::test]
async fn test_authorizer_denies_then_allows_after_clear() {
    let (_dir, path) = temp_db("auth.db");
    let db = open_with_table(&path).await;
    let session = db.session();
    session
        .execute("INSERT INTO t (v) VALUES ('protected')", [])
        .await
        .unwrap();

    session
        .set_authorizer(Some(Arc::new(|ctx: &rusqlite::hooks::AuthContext<'_>| {
            match ctx.action {
                AuthAction::Delete { .. } => Authorization::Deny,
                _ => Authorization::Allow,
            }
        })))
        .await
        .unwrap();

    assert!(session.execute("DELETE FROM t", []).await.is_err());
    // Reads are still allowed.
    session.fetch_all("SELECT v FROM t", []).await.unwrap();

    session.set_authorizer(None).await.unwrap();
    session.execute("DELETE FROM t", []).await.unwrap();
}

#[tokio::test]
async fn test_panicking_authorizer_denies() {
    let (_dir, path) = temp_db("auth_panic.db");
    let db = open_with_table(&path).await;
    let session = db.session();

    session
        .set_authorizer(Some(Arc::new(|_ctx: &rusqlite::hooks::AuthContext<'_>| {
            panic!("misbehaving authorizer");
        })))
        .await
        .unwrap();

    // Fail-secure: a panic inside the authorizer behaves like Deny.
    assert!(session.execute("SELECT 1", []).await.is_err());
}

const LONG_QUERY: &str = "WITH RECURSIVE c(x) AS (VALUES(1) UNION ALL \
                          SELECT x + 1 FROM c WHERE x < 200000) \
                          SELECT count(*) FROM c";

#[tokio::test]
async fn test_progress_handler_interrupts_long_statement() {
    let (_dir, path) = temp_db("progress.db");
    let db = open_with_table(&path).await;
    let session = db.session();

    session
        .set_progress_handler(10, Some(Arc::new(|| true)))
        .await
        .unwrap();
    assert!(session.fetch_all(LONG_QUERY, []).await.is_err());

    session.set_progress_handler(0, None).await.unwrap();
    let result = session.fetch_all(LONG_QUERY, []).await.unwrap();
    assert_eq!(result.rows[0][0], Value::Integer(200000));
}

#[tokio::test]
async fn test_panicking_progress_handler_continues() {
    let (_dir, path) = temp_db("progress_panic.db");
    let db = open_with_table(&path).await;
    let session = db.session();

    session
        .set_progress_handler(100, Some(Arc::new(|| -> bool {
            panic!("misbehaving progress handler");
        })))
        .await
        .unwrap();

    // Fail-open: the statement runs to completion.
    let result = session.fetch_all(LONG_QUERY, []).await.unwrap();
    assert_eq!(result.rows[0][0], Value::Integer(200000));
}

#[tokio::test]
async fn test_scalar_function_lifecycle() {
    let (_dir, path) = temp_db("scalar.db");
    let db = open_with_table(&path).await;
    let session = db.session();

    session
        .create_function(
            "double",
            1,
            Arc::new(|args: &[Value]| match args[0] {
                Value::Integer(n) => Ok(Value::Integer(n * 2)),
                ref other => Err(format!("expected integer, got {other:?}").into()),
            }),
        )
        .await
        .unwrap();

    let row = session.fetch_one("SELECT double(21)", []).await.unwrap();
    assert_eq!(row[0], Value::Integer(42));

    // Callable errors surface as a clean statement error.
    assert!(session.fetch_one("SELECT double('nope')", []).await.is_err());

    session.remove_function("double", 1).await.unwrap();
    assert!(session.fetch_one("SELECT double(21)", []).await.is_err());
}

#[tokio::test]
async fn test_panicking_scalar_function_becomes_statement_error() {
    let (_dir, path) = temp_db("scalar_panic.db");
    let db = open_with_table(&path).await;
    let session = db.session();

    session
        .create_function(
            "boom",
            0,
            Arc::new(|_args: &[Value]| -> Result<Value, asqlite::callbacks::ScalarError> {
                panic!("misbehaving function");
            }),
        )
        .await
        .unwrap();

    // The panic is contained; only this statement fails.
    assert!(session.fetch_one("SELECT boom()", []).await.is_err());
    let row = session.fetch_one("SELECT 1", []).await.unwrap();
    assert_eq!(row[0], Value::Integer(1));
}

#[tokio::test]
async fn test_dropped_session_releases_its_hooks() {
    let (_dir, path) = temp_db("dropped_hooks.db");
    let db = Database::builder(&path).pool_size(1).build().unwrap();
    db.session()
        .execute_batch("CREATE TABLE IF NOT EXISTS t (id INTEGER PRIMARY KEY, v TEXT)")
        .await
        .unwrap();

    // Dropped without close: the dedicated connection returns to the pool
    // and must come back with its function stripped.
    let session = db.session();
    session
        .create_function("forty_two", 0, Arc::new(|_args: &[Value]| Ok(Value::Integer(42))))
        .await
        .unwrap();
    let row = session.fetch_one("SELECT forty_two()", []).await.unwrap();
    assert_eq!(row[0], Value::Integer(42));
    drop(session);

    // With pool_size 1 the next session reuses that same connection.
    let fresh = db.session();
    assert!(fresh.fetch_one("SELECT forty_two()", []).await.is_err());
    let row = fresh.fetch_one("SELECT 1", []).await.unwrap();
    assert_eq!(row[0], Value::Integer(1));
}

#[tokio::test]
async fn test_registrations_are_per_session() {
    let (_dir, path) = temp_db("per_session.db");
    let db = open_with_table(&path).await;

    let registered = db.session();
    let plain = db.session();

    registered
        .create_function("forty_two", 0, Arc::new(|_args: &[Value]| Ok(Value::Integer(42))))
        .await
        .unwrap();

    let row = registered.fetch_one("SELECT forty_two()", []).await.unwrap();
    assert_eq!(row[0], Value::Integer(42));

    // The other session's connections never saw the registration.
    assert!(plain.fetch_one("SELECT forty_two()", []).await.is_err());
}
