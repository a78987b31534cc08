// Append-only replication op log: emission and idempotent ingestion.

use crate::error::Result;
use crate::utils::json::canonicalize;
use crate::utils::now_rfc3339;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use uuid::Uuid;

/// Record exactly one op for a local mutation (`remember`/`remember_observation`/
/// `forget`). Returns the new op's id.
pub fn emit(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
    op_type: &str,
    payload: &Value,
    rev: i64,
    clock_updated_at: &str,
    clock_device_id: &str,
) -> Result<String> {
    let op_id = Uuid::new_v4().to_string();
    let created_at = now_rfc3339();
    let payload_str = serde_json::to_string(&canonicalize(payload))?;

    conn.execute(
        "INSERT INTO replication_ops
            (op_id, entity_type, entity_id, op_type, payload, rev, clock_updated_at, clock_device_id, device_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8, ?9)",
        params![
            op_id,
            entity_type,
            entity_id,
            op_type,
            payload_str,
            rev,
            clock_updated_at,
            clock_device_id,
            created_at,
        ],
    )?;

    Ok(op_id)
}

/// Record an inbound op into the local log, but only if its `op_id` isn't
/// already present — so relay chains (peer A -> B -> C) don't duplicate.
/// Returns whether a row was inserted.
pub fn record_if_absent(
    conn: &Connection,
    op_id: &str,
    entity_type: &str,
    entity_id: &str,
    op_type: &str,
    payload: &Value,
    rev: i64,
    clock_updated_at: &str,
    clock_device_id: &str,
    device_id: &str,
    created_at: &str,
) -> Result<bool> {
    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM replication_ops WHERE op_id = ?", [op_id], |r| r.get(0))
        .optional()?;
    if exists.is_some() {
        return Ok(false);
    }

    let payload_str = serde_json::to_string(&canonicalize(payload))?;
    conn.execute(
        "INSERT INTO replication_ops
            (op_id, entity_type, entity_id, op_type, payload, rev, clock_updated_at, clock_device_id, device_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            op_id,
            entity_type,
            entity_id,
            op_type,
            payload_str,
            rev,
            clock_updated_at,
            clock_device_id,
            device_id,
            created_at,
        ],
    )?;
    Ok(true)
}

/// Ops strictly after `since` (a `created_at|op_id` cursor, or `None` for
/// the beginning of the log), ordered by cursor, capped at `limit`.
pub fn ops_since(conn: &Connection, since: Option<&str>, limit: usize) -> Result<Vec<crate::db::types::ReplicationOp>> {
    let (created_at, op_id) = match since {
        Some(cursor) => split_cursor(cursor),
        None => (String::new(), String::new()),
    };

    let mut stmt = conn.prepare(
        "SELECT op_id, entity_type, entity_id, op_type, payload, rev, clock_updated_at, clock_device_id, device_id, created_at
         FROM replication_ops
         WHERE (created_at > ?1) OR (created_at = ?1 AND op_id > ?2)
         ORDER BY created_at ASC, op_id ASC
         LIMIT ?3",
    )?;

    let rows = stmt.query_map(params![created_at, op_id, limit as i64], |row| {
        let payload_str: String = row.get(4)?;
        Ok(crate::db::types::ReplicationOp {
            op_id: row.get(0)?,
            entity_type: row.get(1)?,
            entity_id: row.get(2)?,
            op_type: row.get(3)?,
            payload: serde_json::from_str(&payload_str).unwrap_or(Value::Null),
            rev: row.get(5)?,
            clock_updated_at: row.get(6)?,
            clock_device_id: row.get(7)?,
            device_id: row.get(8)?,
            created_at: row.get(9)?,
        })
    })?;

    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn split_cursor(cursor: &str) -> (String, String) {
    match cursor.split_once('|') {
        Some((created_at, op_id)) => (created_at.to_string(), op_id.to_string()),
        None => (cursor.to_string(), String::new()),
    }
}
