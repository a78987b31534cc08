// Outbound cursor bookkeeping.

use rusqlite::Connection;

/// Clamp a cursor that points past the local op log back to the log's
/// latest cursor, so a peer that raced ahead (e.g. after a local prune)
/// doesn't get stuck waiting for a cursor that will never exist.
pub fn normalize_outbound_cursor(conn: &Connection, cursor: Option<&str>) -> rusqlite::Result<Option<String>> {
    let Some(cursor) = cursor else { return Ok(None) };

    let latest: Option<String> = conn
        .query_row(
            "SELECT created_at || '|' || op_id FROM replication_ops
             ORDER BY created_at DESC, op_id DESC LIMIT 1",
            [],
            |r| r.get(0),
        )
        .ok();

    match latest {
        Some(latest) if cursor.as_str() > latest.as_str() => Ok(Some(latest)),
        _ => Ok(Some(cursor.to_string())),
    }
}
