// Database migration helper utilities

use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

/// Check if a table exists in the database
pub fn table_exists(conn: &Connection, table_name: &str) -> bool {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type='table' AND name=?",
        [table_name],
        |_| Ok(true),
    ).unwrap_or(false)
}

/// Check if a column exists in a table
pub fn column_exists(conn: &Connection, table_name: &str, column_name: &str) -> bool {
    conn.query_row(
        "SELECT 1 FROM pragma_table_info(?) WHERE name=?",
        [table_name, column_name],
        |_| Ok(true),
    ).unwrap_or(false)
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
    let sql = format!("ALTER TABLE {} ADD COLUMN {} {}", table_name, column_name, column_def);
    conn.execute(&sql, [])?;
    Ok(())
}

/// Create a table if it doesn't exist (with logging)
pub fn create_table_if_missing(
    conn: &Connection,
    table_name: &str,
    sql: &str,
) -> Result<()> {
    if table_exists(conn, table_name) {
        return Ok(());
    }

    info!("Creating {} table", table_name);
    conn.execute_batch(sql)?;
    Ok(())
}
