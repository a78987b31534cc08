// Maintenance-triggered, sync-preflight migrations: legacy import-key
// rewriting and replication-op backfill for rows predating replication.

use super::apply::canonicalize_import_key;
use super::log::emit;
use crate::error::Result;
use crate::utils::json::canonicalize;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

/// Rewrites up to `limit` memory rows still carrying a
/// `legacy:memory_item:<n>` import key into the canonical
/// `<device_id>:<n>` form, using the row's own `clock_device_id`.
/// Returns the number of rows rewritten.
pub fn migrate_legacy_import_keys(conn: &Connection, limit: usize) -> Result<usize> {
    let mut stmt = conn.prepare(
        "SELECT id, import_key, metadata FROM memory_items
         WHERE import_key LIKE 'legacy:memory_item:%'
         LIMIT ?1",
    )?;
    let rows: Vec<(i64, String, String)> = stmt
        .query_map(params![limit as i64], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut migrated = 0;
    for (id, import_key, metadata_json) in rows {
        let metadata: Value = serde_json::from_str(&metadata_json).unwrap_or(Value::Null);
        let device_id = metadata
            .get("clock_device_id")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown-device");

        if let Some(canonical) = canonicalize_import_key(&import_key, device_id) {
            conn.execute(
                "UPDATE memory_items SET import_key = ?1 WHERE id = ?2",
                params![canonical, id],
            )?;
            migrated += 1;
        }
    }

    Ok(migrated)
}

/// Emits a missing `upsert` replication op for up to `limit` memory rows
/// that have no corresponding op in the log (rows created before
/// replication was enabled on this device). Bounded per call so a large
/// backlog drains over several preflights instead of stalling a sync pass.
pub fn backfill_replication_ops(conn: &Connection, limit: usize) -> Result<usize> {
    let mut stmt = conn.prepare(
        "SELECT m.id, m.session_id, m.kind, m.title, m.body_text, m.subtitle, m.facts, m.concepts,
                m.files_read, m.files_modified, m.prompt_number, m.user_prompt_id, m.confidence,
                m.tags_text, m.active, m.created_at, m.updated_at, m.deleted_at, m.rev, m.metadata,
                m.import_key
         FROM memory_items m
         LEFT JOIN replication_ops o ON o.entity_type = 'memory_item' AND o.entity_id = m.import_key
         WHERE o.op_id IS NULL
         LIMIT ?1",
    )?;

    let rows: Vec<(i64, Value, i64, String, String, bool)> = stmt
        .query_map(params![limit as i64], |row| {
            let metadata_raw: String = row.get(19)?;
            let mut metadata: Value = serde_json::from_str(&metadata_raw).unwrap_or(Value::Null);
            if let Value::Object(ref mut map) = metadata {
                map.entry("clock_device_id").or_insert_with(|| Value::String("unknown-device".into()));
            }

            let payload = serde_json::json!({
                "session_id": row.get::<_, i64>(1)?,
                "kind": row.get::<_, String>(2)?,
                "title": row.get::<_, String>(3)?,
                "body_text": row.get::<_, String>(4)?,
                "subtitle": row.get::<_, Option<String>>(5)?,
                "facts": serde_json::from_str::<Value>(&row.get::<_, String>(6)?).unwrap_or(Value::Array(vec![])),
                "concepts": serde_json::from_str::<Value>(&row.get::<_, String>(7)?).unwrap_or(Value::Array(vec![])),
                "files_read": serde_json::from_str::<Value>(&row.get::<_, String>(8)?).unwrap_or(Value::Array(vec![])),
                "files_modified": serde_json::from_str::<Value>(&row.get::<_, String>(9)?).unwrap_or(Value::Array(vec![])),
                "prompt_number": row.get::<_, Option<i64>>(10)?,
                "user_prompt_id": row.get::<_, Option<i64>>(11)?,
                "confidence": row.get::<_, f64>(12)?,
                "tags_text": row.get::<_, String>(13)?,
                "active": row.get::<_, bool>(14)?,
                "created_at": row.get::<_, String>(15)?,
                "deleted_at": row.get::<_, Option<String>>(17)?,
                "import_key": row.get::<_, String>(20)?,
                "metadata": metadata.clone(),
            });

            let updated_at: String = row.get(16)?;
            let rev: i64 = row.get(18)?;
            let device_id = metadata
                .get("clock_device_id")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown-device")
                .to_string();

            Ok((row.get::<_, i64>(0)?, payload, rev, updated_at, device_id, false))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut backfilled = 0;
    for (_id, payload, rev, updated_at, device_id, _deleted) in rows {
        let import_key = payload.get("import_key").and_then(|v| v.as_str()).unwrap_or_default();
        let already: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM replication_ops WHERE entity_type='memory_item' AND entity_id=?",
                [import_key],
                |r| r.get(0),
            )
            .optional()?;
        if already.is_some() {
            continue;
        }

        emit(conn, "memory_item", import_key, "upsert", &canonicalize(&payload), rev, &updated_at, &device_id)?;
        backfilled += 1;
    }

    Ok(backfilled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::run_all_migrations;

    fn seed_session(conn: &Connection) {
        conn.execute(
            "INSERT INTO sessions (started_at, cwd, user) VALUES ('2024-01-01T00:00:00Z', '/tmp', 'u')",
            [],
        )
        .unwrap();
    }

    #[test]
    fn migrate_legacy_import_keys_rewrites_prefixed_keys() {
        let conn = Connection::open_in_memory().unwrap();
        run_all_migrations(&conn).unwrap();
        seed_session(&conn);
        conn.execute(
            "INSERT INTO memory_items (session_id, kind, title, body_text, created_at, updated_at, import_key, metadata)
             VALUES (1, 'note', 't', 'b', '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z', 'legacy:memory_item:7', '{\"clock_device_id\":\"dev-a\"}')",
            [],
        )
        .unwrap();

        let migrated = migrate_legacy_import_keys(&conn, 10).unwrap();
        assert_eq!(migrated, 1);

        let key: String = conn.query_row("SELECT import_key FROM memory_items", [], |r| r.get(0)).unwrap();
        assert_eq!(key, "dev-a:7");
    }

    #[test]
    fn backfill_replication_ops_emits_missing_ops() {
        let conn = Connection::open_in_memory().unwrap();
        run_all_migrations(&conn).unwrap();
        seed_session(&conn);
        conn.execute(
            "INSERT INTO memory_items (session_id, kind, title, body_text, created_at, updated_at, import_key, metadata)
             VALUES (1, 'note', 't', 'b', '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z', 'dev-a:1', '{\"clock_device_id\":\"dev-a\"}')",
            [],
        )
        .unwrap();

        let count: i64 = conn.query_row("SELECT COUNT(*) FROM replication_ops", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 0);

        let backfilled = backfill_replication_ops(&conn, 10).unwrap();
        assert_eq!(backfilled, 1);

        let count: i64 = conn.query_row("SELECT COUNT(*) FROM replication_ops", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn backfill_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_all_migrations(&conn).unwrap();
        seed_session(&conn);
        conn.execute(
            "INSERT INTO memory_items (session_id, kind, title, body_text, created_at, updated_at, import_key, metadata)
             VALUES (1, 'note', 't', 'b', '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z', 'dev-a:1', '{\"clock_device_id\":\"dev-a\"}')",
            [],
        )
        .unwrap();

        backfill_replication_ops(&conn, 10).unwrap();
        let second_pass = backfill_replication_ops(&conn, 10).unwrap();
        assert_eq!(second_pass, 0);
    }
}
