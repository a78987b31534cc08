// Flush-batch state machine (§4.1): pending -> claimed -> completed/failed,
// keyed by `(opencode_session_id, start_event_seq, end_event_seq, extractor_version)`.

use crate::db::types::{FlushBatchStatus, RawEventFlushBatch};
use crate::error::{Error, Result};
use crate::utils::now_rfc3339;
use rusqlite::{params, Connection, OptionalExtension};

fn row_to_batch(row: &rusqlite::Row) -> rusqlite::Result<RawEventFlushBatch> {
    Ok(RawEventFlushBatch {
        id: row.get("id")?,
        opencode_session_id: row.get("opencode_session_id")?,
        start_event_seq: row.get("start_event_seq")?,
        end_event_seq: row.get("end_event_seq")?,
        extractor_version: row.get("extractor_version")?,
        status: row.get("status")?,
        attempt_count: row.get("attempt_count")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

/// `get_or_create_batch`: upserts by the unique key. If the existing batch is
/// already `completed`, the caller should skip re-extraction and advance
/// `last_flushed_event_seq` to `end_event_seq` itself.
pub fn get_or_create_batch(conn: &Connection, opencode_session_id: &str, start_event_seq: i64, end_event_seq: i64, extractor_version: &str) -> Result<RawEventFlushBatch> {
    let existing = conn
        .query_row(
            "SELECT id, opencode_session_id, start_event_seq, end_event_seq, extractor_version, status, attempt_count, created_at, updated_at
             FROM raw_event_flush_batches
             WHERE opencode_session_id = ?1 AND start_event_seq = ?2 AND end_event_seq = ?3 AND extractor_version = ?4",
            params![opencode_session_id, start_event_seq, end_event_seq, extractor_version],
            row_to_batch,
        )
        .optional()?;

    if let Some(batch) = existing {
        return Ok(batch);
    }

    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO raw_event_flush_batches
            (opencode_session_id, start_event_seq, end_event_seq, extractor_version, status, attempt_count, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?5)",
        params![opencode_session_id, start_event_seq, end_event_seq, extractor_version, now],
    )?;
    let id = conn.last_insert_rowid();
    get_batch(conn, id)?.ok_or_else(|| Error::Other("flush batch vanished after insert".to_string()))
}

pub fn get_batch(conn: &Connection, id: i64) -> Result<Option<RawEventFlushBatch>> {
    conn.query_row(
        "SELECT id, opencode_session_id, start_event_seq, end_event_seq, extractor_version, status, attempt_count, created_at, updated_at
         FROM raw_event_flush_batches WHERE id = ?1",
        params![id],
        row_to_batch,
    )
    .optional()
    .map_err(Error::from)
}

/// `claim`: atomic conditional transition from any claimable status
/// (`pending`, `failed`, plus legacy `started`/`error`) to `claimed`, with
/// `attempt_count++`. Returns `false` if another worker already holds it.
pub fn claim_batch(conn: &Connection, id: i64) -> Result<bool> {
    let claimable = FlushBatchStatus::claimable_values();
    let placeholders = claimable.iter().map(|_| "?").collect::<Vec<_>>().join(",");
    let now = now_rfc3339();

    let sql = format!(
        "UPDATE raw_event_flush_batches
         SET status = 'claimed', attempt_count = attempt_count + 1, updated_at = ?
         WHERE id = ? AND status IN ({placeholders})"
    );
    let mut params_vec: Vec<&dyn rusqlite::ToSql> = vec![&now, &id];
    for value in claimable {
        params_vec.push(value);
    }

    let updated = conn.execute(&sql, params_vec.as_slice())?;
    Ok(updated == 1)
}

/// Mark a batch `completed` and advance `last_flushed_event_seq` in the
/// session row to `end_event_seq`. Both writes happen in the same call so a
/// caller awaiting this function sees both durable or neither.
pub fn complete_batch(conn: &Connection, id: i64) -> Result<()> {
    let batch = get_batch(conn, id)?.ok_or_else(|| Error::NotFound(format!("flush batch {id} not found")))?;
    let now = now_rfc3339();

    conn.execute(
        "UPDATE raw_event_flush_batches SET status = 'completed', updated_at = ?1 WHERE id = ?2",
        params![now, id],
    )?;
    conn.execute(
        "UPDATE raw_event_sessions SET last_flushed_event_seq = ?1
         WHERE opencode_session_id = ?2 AND last_flushed_event_seq < ?1",
        params![batch.end_event_seq, batch.opencode_session_id],
    )?;
    Ok(())
}

/// Mark a batch `failed` without advancing `last_flushed_event_seq`,
/// preserving at-least-once semantics for a later reclaim.
pub fn fail_batch(conn: &Connection, id: i64) -> Result<()> {
    let now = now_rfc3339();
    conn.execute(
        "UPDATE raw_event_flush_batches SET status = 'failed', updated_at = ?1 WHERE id = ?2",
        params![now, id],
    )?;
    Ok(())
}
