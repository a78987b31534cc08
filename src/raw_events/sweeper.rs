// Periodic sweeper (§4.1): retention, stuck-batch recovery, and idle/queued
// flush dispatch. The three duties are sync conn-level queries; actually
// invoking the Observer Pipeline for `sessions_needing_flush` is the async
// caller's job (see `crate::observer::pipeline`), kept out of this module so
// a `Connection` borrow never has to cross an `.await`.

use crate::db::types::FlushBatchStatus;
use crate::error::Result;
use crate::utils::now_rfc3339;
use rusqlite::{params, params_from_iter, Connection};
use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub raw_events_deleted: usize,
    pub samples_deleted: usize,
    pub batches_recovered: usize,
    /// Queue-driven sessions first, then idle-only sessions, deduplicated.
    pub sessions_needing_flush: Vec<String>,
}

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before epoch").as_millis() as i64
}

fn retention_sweep(conn: &Connection, raw_event_ttl_days: i64, sample_ttl_days: i64) -> Result<(usize, usize)> {
    let events_cutoff = (chrono::Utc::now() - chrono::Duration::days(raw_event_ttl_days)).to_rfc3339();
    let raw_events_deleted = conn.execute("DELETE FROM raw_events WHERE created_at < ?1", params![events_cutoff])?;

    let samples_cutoff = (chrono::Utc::now() - chrono::Duration::days(sample_ttl_days)).to_rfc3339();
    let samples_deleted = conn.execute("DELETE FROM raw_event_reliability_samples WHERE bucket_ts < ?1", params![samples_cutoff])?;

    Ok((raw_events_deleted, samples_deleted))
}

fn stuck_recovery(conn: &Connection, stuck_threshold_minutes: i64) -> Result<usize> {
    let cutoff = (chrono::Utc::now() - chrono::Duration::minutes(stuck_threshold_minutes)).to_rfc3339();
    let in_progress = FlushBatchStatus::in_progress_values();
    let placeholders = in_progress.iter().map(|_| "?").collect::<Vec<_>>().join(",");
    let now = now_rfc3339();

    let sql = format!(
        "UPDATE raw_event_flush_batches
         SET status = 'failed', updated_at = ?
         WHERE status IN ({placeholders}) AND updated_at < ?"
    );
    let mut query_params: Vec<&dyn rusqlite::ToSql> = vec![&now];
    for value in in_progress {
        query_params.push(value);
    }
    query_params.push(&cutoff);

    Ok(conn.execute(&sql, query_params.as_slice())?)
}

fn queued_sessions(conn: &Connection) -> Result<Vec<String>> {
    let mut non_terminal: Vec<&str> = vec!["pending"];
    non_terminal.extend(FlushBatchStatus::in_progress_values().iter().copied());

    let placeholders = non_terminal.iter().map(|_| "?").collect::<Vec<_>>().join(",");
    let sql = format!("SELECT DISTINCT opencode_session_id FROM raw_event_flush_batches WHERE status IN ({placeholders})");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(non_terminal.iter().copied()), |row| row.get::<_, String>(0))?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn idle_sessions(conn: &Connection, idle_threshold_minutes: i64) -> Result<Vec<String>> {
    let cutoff_ms = now_ms() - idle_threshold_minutes * 60_000;
    let mut stmt = conn.prepare(
        "SELECT opencode_session_id FROM raw_event_sessions
         WHERE last_seen_ts_wall_ms IS NOT NULL AND last_seen_ts_wall_ms < ?1
           AND last_received_event_seq > last_flushed_event_seq",
    )?;
    let rows = stmt.query_map(params![cutoff_ms], |row| row.get::<_, String>(0))?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Run one sweep pass: retention, stuck recovery, and compute the ordered,
/// deduplicated list of sessions the caller should dispatch to the Observer
/// Pipeline (queue-driven sessions take priority over idle-only ones).
pub fn run_sweep(conn: &Connection, raw_event_ttl_days: i64, sample_ttl_days: i64, stuck_threshold_minutes: i64, idle_threshold_minutes: i64) -> Result<SweepReport> {
    let (raw_events_deleted, samples_deleted) = retention_sweep(conn, raw_event_ttl_days, sample_ttl_days)?;
    let batches_recovered = stuck_recovery(conn, stuck_threshold_minutes)?;

    let queued = queued_sessions(conn)?;
    let idle = idle_sessions(conn, idle_threshold_minutes)?;

    let mut seen: BTreeSet<String> = BTreeSet::new();
    let mut sessions_needing_flush = Vec::new();
    for session in queued.into_iter().chain(idle) {
        if seen.insert(session.clone()) {
            sessions_needing_flush.push(session);
        }
    }

    Ok(SweepReport { raw_events_deleted, samples_deleted, batches_recovered, sessions_needing_flush })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::run_all_migrations;
    use crate::raw_events::flush::{claim_batch, get_or_create_batch};
    use crate::raw_events::queue::record;
    use serde_json::json;

    #[test]
    fn stuck_batches_are_recovered_after_threshold() {
        let conn = Connection::open_in_memory().unwrap();
        run_all_migrations(&conn).unwrap();
        record(&conn, "s1", "e1", "a", &json!({}), None, None).unwrap();
        let batch = get_or_create_batch(&conn, "s1", 1, 1, "v1").unwrap();
        claim_batch(&conn, batch.id).unwrap();

        let stale_updated_at = (chrono::Utc::now() - chrono::Duration::minutes(30)).to_rfc3339();
        conn.execute("UPDATE raw_event_flush_batches SET updated_at = ?1 WHERE id = ?2", params![stale_updated_at, batch.id]).unwrap();

        let report = run_sweep(&conn, 30, 14, 5, 2).unwrap();
        assert_eq!(report.batches_recovered, 1);

        let status: String = conn.query_row("SELECT status FROM raw_event_flush_batches WHERE id = ?1", [batch.id], |r| r.get(0)).unwrap();
        assert_eq!(status, "failed");
    }

    #[test]
    fn retention_sweep_deletes_old_raw_events() {
        let conn = Connection::open_in_memory().unwrap();
        run_all_migrations(&conn).unwrap();
        record(&conn, "s1", "e1", "a", &json!({}), None, None).unwrap();

        let stale = (chrono::Utc::now() - chrono::Duration::days(60)).to_rfc3339();
        conn.execute("UPDATE raw_events SET created_at = ?1", params![stale]).unwrap();

        let report = run_sweep(&conn, 30, 14, 5, 2).unwrap();
        assert_eq!(report.raw_events_deleted, 1);

        let count: i64 = conn.query_row("SELECT COUNT(*) FROM raw_events", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn queued_session_takes_priority_over_idle_only() {
        let conn = Connection::open_in_memory().unwrap();
        run_all_migrations(&conn).unwrap();
        record(&conn, "s-queued", "e1", "a", &json!({}), None, None).unwrap();
        get_or_create_batch(&conn, "s-queued", 1, 1, "v1").unwrap();

        record(&conn, "s-idle", "e1", "a", &json!({}), Some(1), None).unwrap();
        conn.execute("UPDATE raw_event_sessions SET last_seen_ts_wall_ms = 1 WHERE opencode_session_id = 's-idle'", []).unwrap();

        let report = run_sweep(&conn, 30, 14, 5, 0).unwrap();
        assert_eq!(report.sessions_needing_flush.first().map(String::as_str), Some("s-queued"));
        assert!(report.sessions_needing_flush.contains(&"s-idle".to_string()));
    }
}
