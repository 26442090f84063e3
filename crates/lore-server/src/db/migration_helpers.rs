// crates/lore-server/src/db/migration_helpers.rs
// Schema step helper utilities

use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

/// Check if a table (or virtual table) exists in the database
pub fn table_exists(conn: &Connection, table_name: &str) -> bool {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type='table' AND name=?",
        [table_name],
        |_| Ok(true),
    )
    .unwrap_or(false)
}

/// Check if a column exists in a table
pub fn column_exists(conn: &Connection, table_name: &str, column_name: &str) -> bool {
    conn.query_row(
        "SELECT 1 FROM pragma_table_info(?) WHERE name=?",
        [table_name, column_name],
        |_| Ok(true),
    )
    .unwrap_or(false)
}

/// Add a column to a table if it doesn't already exist
pub fn add_column_if_missing(
    conn: &Connection,
    table_name: &str,
    column_name: &str,
    column_def: &str,
) -> Result<()> {
    if column_exists(conn, table_name, column_name) {
        return Ok(());
    }

    info!("Migrating {} to add {} column", table_name, column_name);
    let sql = format!(
        "ALTER TABLE {} ADD COLUMN {} {}",
        table_name, column_name, column_def
    );
    conn.execute(&sql, [])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_exists_in_memory() {
        let conn = Connection::open_in_memory().unwrap();
        assert!(!table_exists(&conn, "test_table"));
        conn.execute("CREATE TABLE test_table (id INTEGER)", [])
            .unwrap();
        assert!(table_exists(&conn, "test_table"));
    }

    #[test]
    fn column_exists_in_memory() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute("CREATE TABLE test_table (id INTEGER, name TEXT)", [])
            .unwrap();
        assert!(column_exists(&conn, "test_table", "id"));
        assert!(column_exists(&conn, "test_table", "name"));
        assert!(!column_exists(&conn, "test_table", "email"));
    }

    #[test]
    fn add_column_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute("CREATE TABLE test_table (id INTEGER)", [])
            .unwrap();
        add_column_if_missing(&conn, "test_table", "name", "TEXT").unwrap();
        assert!(column_exists(&conn, "test_table", "name"));
        add_column_if_missing(&conn, "test_table", "name", "TEXT").unwrap();
    }
}
