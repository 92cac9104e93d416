//! Serializes a database into a SQL script that recreates it, in the shape
//! of the shell's `.dump` output: schema statements from `sqlite_master`
//! followed by one `INSERT` per row, wrapped in a transaction.

use rusqlite::Connection;
use rusqlite::types::ValueRef;
use tracing::debug;

/// Double-quote one identifier, doubling embedded quotes.
fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote a possibly qualified name (`schema.table`) segment by segment.
fn quote_qualified(ident: &str) -> String {
    ident
        .split('.')
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(".")
}

/// Render one column value as a SQL literal.
fn literal(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => "NULL".to_string(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(r) => r.to_string(),
        ValueRef::Text(t) => {
            let text = String::from_utf8_lossy(t);
            format!("'{}'", text.replace('\'', "''"))
        }
        ValueRef::Blob(b) => {
            let mut hex = String::with_capacity(b.len() * 2);
            for byte in b {
                hex.push_str(&format!("{byte:02x}"));
            }
            format!("X'{hex}'")
        }
    }
}

/// Produce the statements that recreate `conn`'s main schema and data.
pub(crate) fn run(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut script = vec!["BEGIN TRANSACTION;".to_string()];
    let mut tables: Vec<String> = Vec::new();

    {
        let mut stmt = conn.prepare(
            "SELECT type, name, sql FROM sqlite_master \
             WHERE sql IS NOT NULL ORDER BY type, name",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let kind: String = row.get(0)?;
            let name: String = row.get(1)?;
            let sql: String = row.get(2)?;
            match kind.as_str() {
                "table" => {
                    // Internal tables keep their schema but are not data-dumped.
                    if !name.starts_with("sqlite_") {
                        tables.push(name);
                    }
                    script.push(format!("{sql};"));
                }
                "index" => {
                    if !name.starts_with("sqlite_") {
                        script.push(format!("{sql};"));
                    }
                }
                "trigger" | "view" => script.push(format!("{sql};")),
                _ => {}
            }
        }
    }

    for table in &tables {
        let quoted = quote_qualified(table);
        let mut stmt = conn.prepare(&format!("SELECT * FROM {quoted}"))?;
        let columns: Vec<String> = stmt
            .column_names()
            .iter()
            .map(|c| quote_ident(c))
            .collect();
        let column_list = columns.join(", ");

        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(columns.len());
            for i in 0..columns.len() {
                values.push(literal(row.get_ref(i)?));
            }
            script.push(format!(
                "INSERT INTO {quoted} ({column_list}) VALUES ({});",
                values.join(", ")
            ));
        }
    }

    script.push("COMMIT;".to_string());
    debug!(statements = script.len(), "database dumped");
    Ok(script)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            r#"CREATE TABLE "odd ""name""" (id INTEGER PRIMARY KEY, note TEXT, raw BLOB);
               CREATE INDEX note_idx ON "odd ""name""" (note);
               INSERT INTO "odd ""name""" (note, raw) VALUES ('it''s fine', x'deadbeef');
               INSERT INTO "odd ""name""" (note, raw) VALUES (NULL, NULL);"#,
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_script_restores_schema_and_data() {
        let source = seeded();
        let script = run(&source).unwrap();
        assert_eq!(script.first().map(String::as_str), Some("BEGIN TRANSACTION;"));
        assert_eq!(script.last().map(String::as_str), Some("COMMIT;"));

        let restored = Connection::open_in_memory().unwrap();
        restored.execute_batch(&script.join("\n")).unwrap();

        let note: String = restored
            .query_row(
                r#"SELECT note FROM "odd ""name""" WHERE note IS NOT NULL"#,
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(note, "it's fine");

        let blob: Vec<u8> = restored
            .query_row(
                r#"SELECT raw FROM "odd ""name""" WHERE raw IS NOT NULL"#,
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(blob, vec![0xde, 0xad, 0xbe, 0xef]);

        let indexes: i64 = restored
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type = 'index' AND name = 'note_idx'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(indexes, 1);
    }

    #[test]
    fn test_literals() {
        assert_eq!(literal(ValueRef::Null), "NULL");
        assert_eq!(literal(ValueRef::Integer(-7)), "-7");
        assert_eq!(literal(ValueRef::Real(1.5)), "1.5");
        assert_eq!(literal(ValueRef::Text(b"a'b")), "'a''b'");
        assert_eq!(literal(ValueRef::Blob(&[0x00, 0xff])), "X'00ff'");
    }

    #[test]
    fn test_empty_database_is_just_the_wrapper() {
        let conn = Connection::open_in_memory().unwrap();
        let script = run(&conn).unwrap();
        assert_eq!(script, vec!["BEGIN TRANSACTION;", "COMMIT;"]);
    }
}
