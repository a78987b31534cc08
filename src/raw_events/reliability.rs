// Reliability metrics (§4.1): the gate numbers `maintenance status` and the
// sync preflight check against `Config::gate_*`.

use crate::error::Result;
use chrono::{Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReliabilityReport {
    pub flush_success_rate: f64,
    pub dropped_event_rate: f64,
    pub session_boundary_accuracy: f64,
    pub retry_depth_max: i64,
}

fn counter(conn: &Connection, name: &str) -> Result<i64> {
    Ok(conn
        .query_row("SELECT value FROM raw_event_reliability_counters WHERE name = ?1", params![name], |row| row.get(0))
        .optional()?
        .unwrap_or(0))
}

/// Compute the reliability surface over a trailing window of `window_hours`.
/// `flush_success_rate` and `retry_depth_max` are scoped to batches touched
/// in the window; `dropped_event_rate` reads the cumulative counters (the
/// only events that ever produce a skip are never persisted as rows, so a
/// windowed count would need the bucketed samples table, which maintenance
/// populates separately); `session_boundary_accuracy` is a point-in-time
/// ratio over all sessions that have ever received an event.
pub fn reliability_report(conn: &Connection, window_hours: i64) -> Result<ReliabilityReport> {
    let cutoff = (Utc::now() - Duration::hours(window_hours)).to_rfc3339();

    let (completed, failed, retry_depth_max): (i64, i64, Option<i64>) = conn.query_row(
        "SELECT
            SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END),
            SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END),
            MAX(attempt_count - 1)
         FROM raw_event_flush_batches WHERE updated_at >= ?1",
        params![cutoff],
        |row| Ok((row.get::<_, Option<i64>>(0)?.unwrap_or(0), row.get::<_, Option<i64>>(1)?.unwrap_or(0), row.get(2)?)),
    )?;

    let flush_success_rate = if completed + failed > 0 { completed as f64 / (completed + failed) as f64 } else { 1.0 };

    let inserted = counter(conn, "inserted")?;
    let skipped_invalid = counter(conn, "skipped_invalid")?;
    let skipped_conflict = counter(conn, "skipped_conflict")?;
    let dropped_total = skipped_invalid + skipped_conflict;
    let dropped_denominator = inserted + dropped_total;
    let dropped_event_rate = if dropped_denominator > 0 { dropped_total as f64 / dropped_denominator as f64 } else { 0.0 };

    let (with_started_at, with_events): (i64, i64) = conn.query_row(
        "SELECT
            SUM(CASE WHEN started_at IS NOT NULL THEN 1 ELSE 0 END),
            COUNT(*)
         FROM raw_event_sessions WHERE last_received_event_seq > 0",
        [],
        |row| Ok((row.get::<_, Option<i64>>(0)?.unwrap_or(0), row.get(1)?)),
    )?;
    let session_boundary_accuracy = if with_events > 0 { with_started_at as f64 / with_events as f64 } else { 1.0 };

    Ok(ReliabilityReport {
        flush_success_rate,
        dropped_event_rate,
        session_boundary_accuracy,
        retry_depth_max: retry_depth_max.unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::run_all_migrations;
    use crate::raw_events::flush::{claim_batch, complete_batch, fail_batch, get_or_create_batch};
    use crate::raw_events::queue::{record, start_session};
    use serde_json::json;

    #[test]
    fn flush_success_rate_reflects_completed_vs_failed() {
        let conn = Connection::open_in_memory().unwrap();
        run_all_migrations(&conn).unwrap();
        record(&conn, "s1", "e1", "a", &json!({}), None, None).unwrap();
        record(&conn, "s1", "e2", "a", &json!({}), None, None).unwrap();

        let batch_a = get_or_create_batch(&conn, "s1", 1, 1, "v1").unwrap();
        claim_batch(&conn, batch_a.id).unwrap();
        complete_batch(&conn, batch_a.id).unwrap();

        let batch_b = get_or_create_batch(&conn, "s1", 2, 2, "v1").unwrap();
        claim_batch(&conn, batch_b.id).unwrap();
        fail_batch(&conn, batch_b.id).unwrap();

        let report = reliability_report(&conn, 24).unwrap();
        assert!((report.flush_success_rate - 0.5).abs() < 1e-9);
        assert_eq!(report.retry_depth_max, 0);
    }

    #[test]
    fn dropped_event_rate_counts_invalid_and_conflict() {
        let conn = Connection::open_in_memory().unwrap();
        run_all_migrations(&conn).unwrap();
        record(&conn, "s1", "e1", "a", &json!({}), None, None).unwrap();
        record(&conn, "s1", "", "a", &json!({}), None, None).unwrap();

        let report = reliability_report(&conn, 24).unwrap();
        assert!(report.dropped_event_rate > 0.0);
    }

    #[test]
    fn session_boundary_accuracy_requires_started_at() {
        let conn = Connection::open_in_memory().unwrap();
        run_all_migrations(&conn).unwrap();
        start_session(&conn, "s1", Some("/tmp"), None, "2024-01-01T00:00:00Z").unwrap();
        record(&conn, "s1", "e1", "a", &json!({}), None, None).unwrap();
        record(&conn, "s2", "e2", "a", &json!({}), None, None).unwrap();

        let report = reliability_report(&conn, 24).unwrap();
        assert!((report.session_boundary_accuracy - 0.5).abs() < 1e-9);
    }
}
