// Raw-event ingest (§4.1): idempotent `record`/`record_batch`, per-session
// monotonic `event_seq` allocation, and the reliability counters that back
// `dropped_event_rate`.

use crate::error::Result;
use crate::utils::now_rfc3339;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::BTreeSet;

/// One event as submitted by an ingest call, before a `event_seq` is assigned.
#[derive(Debug, Clone)]
pub struct RawEventInput {
    pub event_id: String,
    pub event_type: String,
    pub payload: Value,
    pub ts_wall_ms: Option<i64>,
    pub ts_mono_ms: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordBatchResult {
    pub inserted: usize,
    pub skipped_duplicate: usize,
    pub skipped_invalid: usize,
    pub skipped_conflict: usize,
}

impl RecordBatchResult {
    pub fn skipped(&self) -> usize {
        self.skipped_duplicate + self.skipped_invalid + self.skipped_conflict
    }
}

fn bump_counter(conn: &Connection, name: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO raw_event_reliability_counters (name, value) VALUES (?1, 1)
         ON CONFLICT(name) DO UPDATE SET value = value + 1",
        params![name],
    )?;
    Ok(())
}

/// Ensure a `raw_event_sessions` row exists, without clobbering fields a
/// prior call (e.g. an explicit session-start) may have already set.
fn ensure_session_row(conn: &Connection, opencode_session_id: &str) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO raw_event_sessions (opencode_session_id, last_received_event_seq, last_flushed_event_seq)
         VALUES (?1, 0, 0)",
        params![opencode_session_id],
    )?;
    Ok(())
}

/// Register or refresh the raw-event session row's descriptive fields
/// (called once at ingest session start; `record`/`record_batch` only touch
/// the sequence counters).
pub fn start_session(conn: &Connection, opencode_session_id: &str, cwd: Option<&str>, project: Option<&str>, started_at: &str) -> Result<()> {
    ensure_session_row(conn, opencode_session_id)?;
    conn.execute(
        "UPDATE raw_event_sessions SET cwd = ?1, project = ?2, started_at = ?3 WHERE opencode_session_id = ?4",
        params![cwd, project, started_at, opencode_session_id],
    )?;
    Ok(())
}

fn last_received_seq(conn: &Connection, opencode_session_id: &str) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT last_received_event_seq FROM raw_event_sessions WHERE opencode_session_id = ?1",
        params![opencode_session_id],
        |row| row.get(0),
    )?)
}

/// `record` (§4.1): idempotent by `(opencode_session_id, event_id)`. Returns
/// `false` (and bumps `skipped_duplicate`) if the event was already stored.
pub fn record(
    conn: &Connection,
    opencode_session_id: &str,
    event_id: &str,
    event_type: &str,
    payload: &Value,
    ts_wall_ms: Option<i64>,
    ts_mono_ms: Option<i64>,
) -> Result<bool> {
    if event_id.is_empty() || event_type.is_empty() {
        bump_counter(conn, "skipped_invalid")?;
        return Ok(false);
    }

    ensure_session_row(conn, opencode_session_id)?;

    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM raw_events WHERE opencode_session_id = ?1 AND event_id = ?2",
            params![opencode_session_id, event_id],
            |row| row.get(0),
        )
        .optional()?;
    if exists.is_some() {
        bump_counter(conn, "skipped_duplicate")?;
        return Ok(false);
    }

    let next_seq = last_received_seq(conn, opencode_session_id)? + 1;
    let now = now_rfc3339();

    let inserted = conn.execute(
        "INSERT OR IGNORE INTO raw_events
            (opencode_session_id, event_seq, event_id, event_type, ts_wall_ms, ts_mono_ms, payload_json, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![opencode_session_id, next_seq, event_id, event_type, ts_wall_ms, ts_mono_ms, serde_json::to_string(payload)?, now],
    )?;

    if inserted == 0 {
        bump_counter(conn, "skipped_conflict")?;
        return Ok(false);
    }

    conn.execute(
        "UPDATE raw_event_sessions
         SET last_received_event_seq = ?1, last_seen_ts_wall_ms = COALESCE(?2, last_seen_ts_wall_ms)
         WHERE opencode_session_id = ?3",
        params![next_seq, ts_wall_ms, opencode_session_id],
    )?;
    bump_counter(conn, "inserted")?;
    Ok(true)
}

/// `record_batch` (§4.1): pre-scans existing `event_id`s in chunks of 500 to
/// short-circuit duplicates, then inserts the remainder under a single
/// seq-range allocation.
pub fn record_batch(conn: &Connection, opencode_session_id: &str, events: &[RawEventInput]) -> Result<RecordBatchResult> {
    ensure_session_row(conn, opencode_session_id)?;

    let mut result = RecordBatchResult::default();

    let mut existing_ids: BTreeSet<String> = BTreeSet::new();
    for chunk in events.chunks(500) {
        let ids: Vec<&str> = chunk.iter().map(|e| e.event_id.as_str()).filter(|id| !id.is_empty()).collect();
        if ids.is_empty() {
            continue;
        }
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!("SELECT event_id FROM raw_events WHERE opencode_session_id = ? AND event_id IN ({placeholders})");
        let mut stmt = conn.prepare(&sql)?;
        let query_params = std::iter::once(opencode_session_id.to_string()).chain(ids.iter().map(|s| s.to_string()));
        let rows = stmt.query_map(params_from_iter(query_params), |row| row.get::<_, String>(0))?;
        for row in rows {
            existing_ids.insert(row?);
        }
    }

    let mut valid: Vec<&RawEventInput> = Vec::new();
    let mut seen_in_batch: BTreeSet<&str> = BTreeSet::new();
    for event in events {
        if event.event_id.is_empty() || event.event_type.is_empty() {
            result.skipped_invalid += 1;
            continue;
        }
        if existing_ids.contains(&event.event_id) || !seen_in_batch.insert(event.event_id.as_str()) {
            result.skipped_duplicate += 1;
            continue;
        }
        valid.push(event);
    }

    if valid.is_empty() {
        return Ok(result);
    }

    let start_seq = last_received_seq(conn, opencode_session_id)? + 1;
    let now = now_rfc3339();
    let mut last_seen_ts_wall_ms = None;

    for (offset, event) in valid.iter().enumerate() {
        let seq = start_seq + offset as i64;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO raw_events
                (opencode_session_id, event_seq, event_id, event_type, ts_wall_ms, ts_mono_ms, payload_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                opencode_session_id,
                seq,
                event.event_id,
                event.event_type,
                event.ts_wall_ms,
                event.ts_mono_ms,
                serde_json::to_string(&event.payload)?,
                now,
            ],
        )?;
        if inserted == 0 {
            result.skipped_conflict += 1;
            continue;
        }
        result.inserted += 1;
        if event.ts_wall_ms.is_some() {
            last_seen_ts_wall_ms = event.ts_wall_ms;
        }
    }

    let end_seq = start_seq + valid.len() as i64 - 1;
    conn.execute(
        "UPDATE raw_event_sessions
         SET last_received_event_seq = ?1, last_seen_ts_wall_ms = COALESCE(?2, last_seen_ts_wall_ms)
         WHERE opencode_session_id = ?3",
        params![end_seq, last_seen_ts_wall_ms, opencode_session_id],
    )?;

    for _ in 0..result.inserted {
        bump_counter(conn, "inserted")?;
    }
    for _ in 0..result.skipped_invalid {
        bump_counter(conn, "skipped_invalid")?;
    }
    for _ in 0..result.skipped_duplicate {
        bump_counter(conn, "skipped_duplicate")?;
    }
    for _ in 0..result.skipped_conflict {
        bump_counter(conn, "skipped_conflict")?;
    }

    Ok(result)
}

/// Events for a session in extraction order (§4.1 ordering guarantee):
/// `ts_mono_ms ASC NULLS LAST, event_seq ASC`.
pub fn events_in_range(conn: &Connection, opencode_session_id: &str, start_seq: i64, end_seq: i64) -> Result<Vec<crate::db::types::RawEvent>> {
    let mut stmt = conn.prepare(
        "SELECT id, opencode_session_id, event_seq, event_id, event_type, ts_wall_ms, ts_mono_ms, payload_json, created_at
         FROM raw_events
         WHERE opencode_session_id = ?1 AND event_seq BETWEEN ?2 AND ?3
         ORDER BY (ts_mono_ms IS NULL) ASC, ts_mono_ms ASC, event_seq ASC",
    )?;
    let rows = stmt.query_map(params![opencode_session_id, start_seq, end_seq], |row| {
        let payload_str: String = row.get(7)?;
        Ok(crate::db::types::RawEvent {
            id: row.get(0)?,
            opencode_session_id: row.get(1)?,
            event_seq: row.get(2)?,
            event_id: row.get(3)?,
            event_type: row.get(4)?,
            ts_wall_ms: row.get(5)?,
            ts_mono_ms: row.get(6)?,
            payload_json: serde_json::from_str(&payload_str).unwrap_or(Value::Null),
            created_at: row.get(8)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::run_all_migrations;
    use serde_json::json;

    #[test]
    fn record_assigns_increasing_seq_and_rejects_duplicates() {
        let conn = Connection::open_in_memory().unwrap();
        run_all_migrations(&conn).unwrap();

        assert!(record(&conn, "s1", "e1", "tool.execute.after", &json!({}), Some(1), Some(1)).unwrap());
        assert!(record(&conn, "s1", "e2", "tool.execute.after", &json!({}), Some(2), Some(2)).unwrap());
        assert!(!record(&conn, "s1", "e1", "tool.execute.after", &json!({}), Some(3), Some(3)).unwrap());

        let seqs: Vec<i64> = {
            let mut stmt = conn.prepare("SELECT event_seq FROM raw_events WHERE opencode_session_id = 's1' ORDER BY event_seq").unwrap();
            stmt.query_map([], |r| r.get(0)).unwrap().collect::<rusqlite::Result<Vec<_>>>().unwrap()
        };
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn record_rejects_missing_event_id_or_type() {
        let conn = Connection::open_in_memory().unwrap();
        run_all_migrations(&conn).unwrap();
        assert!(!record(&conn, "s1", "", "tool.execute.after", &json!({}), None, None).unwrap());
        assert!(!record(&conn, "s1", "e1", "", &json!({}), None, None).unwrap());
    }

    #[test]
    fn record_batch_dedups_against_existing_and_within_batch() {
        let conn = Connection::open_in_memory().unwrap();
        run_all_migrations(&conn).unwrap();
        record(&conn, "s1", "e1", "tool.execute.after", &json!({}), None, None).unwrap();

        let events = vec![
            RawEventInput { event_id: "e1".into(), event_type: "tool.execute.after".into(), payload: json!({}), ts_wall_ms: None, ts_mono_ms: None },
            RawEventInput { event_id: "e2".into(), event_type: "tool.execute.after".into(), payload: json!({}), ts_wall_ms: None, ts_mono_ms: None },
            RawEventInput { event_id: "e2".into(), event_type: "tool.execute.after".into(), payload: json!({}), ts_wall_ms: None, ts_mono_ms: None },
            RawEventInput { event_id: "".into(), event_type: "tool.execute.after".into(), payload: json!({}), ts_wall_ms: None, ts_mono_ms: None },
        ];

        let result = record_batch(&conn, "s1", &events).unwrap();
        assert_eq!(result.inserted, 1);
        assert_eq!(result.skipped_duplicate, 2);
        assert_eq!(result.skipped_invalid, 1);
    }

    #[test]
    fn events_in_range_orders_by_mono_then_seq() {
        let conn = Connection::open_in_memory().unwrap();
        run_all_migrations(&conn).unwrap();
        record(&conn, "s1", "e1", "a", &json!({}), None, Some(200)).unwrap();
        record(&conn, "s1", "e2", "a", &json!({}), None, Some(100)).unwrap();
        record(&conn, "s1", "e3", "a", &json!({}), None, None).unwrap();

        let events = events_in_range(&conn, "s1", 1, 3).unwrap();
        let ids: Vec<&str> = events.iter().map(|e| e.event_id.as_str()).collect();
        assert_eq!(ids, vec!["e2", "e1", "e3"]);
    }
}
