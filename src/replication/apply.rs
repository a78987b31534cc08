// Inbound op sanitization and application.

use crate::db::types::ReplicationOp;
use crate::error::Result;
use crate::replication::clock::{is_newer, Clock};
use crate::utils::now_rfc3339;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

const FUTURE_CLAMP_SLACK_SECS: i64 = 300;

/// Sanitize an op received from `source_device_id` before it touches the
/// op log or gets applied:
/// - trust `device_id` only when it matches the sender, else substitute;
/// - clamp a `created_at` implausibly far in the future to `received_at`;
/// - default missing clock fields;
/// - rewrite legacy `legacy:memory_item:<n>` import keys to canonical form.
pub fn sanitize_inbound(mut op: ReplicationOp, source_device_id: &str, received_at: &str) -> ReplicationOp {
    if op.device_id != source_device_id {
        op.device_id = source_device_id.to_string();
    }

    if let (Ok(created), Ok(received)) = (
        DateTime::parse_from_rfc3339(&op.created_at),
        DateTime::parse_from_rfc3339(received_at),
    ) {
        let received: DateTime<Utc> = received.into();
        let created: DateTime<Utc> = created.into();
        if created > received + Duration::seconds(FUTURE_CLAMP_SLACK_SECS) {
            op.created_at = received_at.to_string();
        }
    }

    if op.clock_updated_at.is_empty() {
        op.clock_updated_at = op.created_at.clone();
    }
    if op.clock_device_id.is_empty() {
        op.clock_device_id = op.device_id.clone();
    }
    if op.rev < 1 {
        op.rev = 1;
    }

    if let Some(key) = op.payload.get("import_key").and_then(|v| v.as_str()) {
        if let Some(canonical) = canonicalize_import_key(key, &op.clock_device_id) {
            if let Value::Object(map) = &mut op.payload {
                map.insert("import_key".to_string(), Value::String(canonical.clone()));
            }
            op.entity_id = canonical;
        }
    }

    op
}

/// Rewrites `legacy:memory_item:<n>` into `<device_id>:<n>`. Returns `None`
/// for keys that are already canonical (not matching the legacy prefix).
pub fn canonicalize_import_key(key: &str, device_id: &str) -> Option<String> {
    let suffix = key.strip_prefix("legacy:memory_item:")?;
    Some(format!("{device_id}:{suffix}"))
}

/// Given a canonical `<device_id>:<suffix>` import key, returns the legacy
/// `legacy:memory_item:<suffix>` form a not-yet-migrated local row might
/// still carry (see `canonicalize_import_key`, its inverse).
fn legacy_alias(canonical_key: &str) -> Option<String> {
    let suffix = canonical_key.split_once(':')?.1;
    Some(format!("legacy:memory_item:{suffix}"))
}

fn find_by_import_key(conn: &Connection, import_key: &str) -> Result<Option<(i64, i64, String, String)>> {
    conn.query_row(
        "SELECT id, rev, updated_at, metadata FROM memory_items WHERE import_key = ?",
        [import_key],
        |row| {
            let metadata: String = row.get(3)?;
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, metadata))
        },
    )
    .optional()
    .map_err(Into::into)
}

/// Apply a sanitized op to `memory_items`. Looks up the existing row by
/// `import_key` (canonical, then the legacy alias it may still carry if
/// `migrate_legacy_import_keys` hasn't reached it yet), compares clocks, and
/// applies only if the candidate is strictly newer (idempotent, commutative
/// under LWW). A row matched via its legacy alias is rewritten onto the
/// canonical key as part of the same apply, so later ops for the same
/// entity collapse onto this row through the fast canonical-key path.
pub fn apply_op(conn: &Connection, op: &ReplicationOp) -> Result<bool> {
    let candidate_clock: Clock = (op.rev, op.clock_updated_at.clone(), op.clock_device_id.clone());

    let mut existing = find_by_import_key(conn, &op.entity_id)?;
    if existing.is_none() {
        if let Some(alias) = legacy_alias(&op.entity_id) {
            existing = find_by_import_key(conn, &alias)?;
        }
    }

    let Some((id, existing_rev, existing_updated_at, existing_metadata)) = existing else {
        return apply_insert(conn, op);
    };

    let existing_metadata: Value = serde_json::from_str(&existing_metadata).unwrap_or(Value::Null);
    let existing_device_id = existing_metadata
        .get("clock_device_id")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let existing_clock: Clock = (existing_rev, existing_updated_at, existing_device_id);

    if !is_newer(&candidate_clock, &existing_clock) {
        return Ok(false);
    }

    match op.op_type.as_str() {
        "delete" => {
            conn.execute(
                "UPDATE memory_items SET active = 0, deleted_at = ?1, updated_at = ?1, rev = ?2, import_key = ?3 WHERE id = ?4",
                params![op.clock_updated_at, op.rev, op.entity_id, id],
            )?;
        }
        _ => apply_upsert_columns(conn, id, op)?,
    }

    Ok(true)
}

fn apply_insert(conn: &Connection, op: &ReplicationOp) -> Result<bool> {
    if op.op_type == "delete" {
        // Nothing to delete locally; a delete for an entity we've never
        // seen is a no-op, not an error.
        return Ok(false);
    }

    let p = &op.payload;
    let session_id = p.get("session_id").and_then(|v| v.as_i64()).unwrap_or(0);
    conn.execute(
        "INSERT INTO memory_items
            (session_id, kind, title, body_text, subtitle, facts, concepts, files_read, files_modified,
             prompt_number, user_prompt_id, confidence, tags_text, active, created_at, updated_at,
             deleted_at, rev, metadata, import_key)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
        params![
            session_id,
            p.get("kind").and_then(|v| v.as_str()).unwrap_or("note"),
            p.get("title").and_then(|v| v.as_str()).unwrap_or(""),
            p.get("body_text").and_then(|v| v.as_str()).unwrap_or(""),
            p.get("subtitle").and_then(|v| v.as_str()),
            p.get("facts").map(|v| v.to_string()).unwrap_or_else(|| "[]".to_string()),
            p.get("concepts").map(|v| v.to_string()).unwrap_or_else(|| "[]".to_string()),
            p.get("files_read").map(|v| v.to_string()).unwrap_or_else(|| "[]".to_string()),
            p.get("files_modified").map(|v| v.to_string()).unwrap_or_else(|| "[]".to_string()),
            p.get("prompt_number").and_then(|v| v.as_i64()),
            p.get("user_prompt_id").and_then(|v| v.as_i64()),
            p.get("confidence").and_then(|v| v.as_f64()).unwrap_or(1.0),
            p.get("tags_text").and_then(|v| v.as_str()).unwrap_or(""),
            1,
            op.clock_updated_at,
            op.clock_updated_at,
            None::<String>,
            op.rev,
            p.get("metadata").map(|v| v.to_string()).unwrap_or_else(|| "{}".to_string()),
            op.entity_id,
        ],
    )?;
    let _ = conn.last_insert_rowid();
    let _ = now_rfc3339();
    Ok(true)
}

fn apply_upsert_columns(conn: &Connection, id: i64, op: &ReplicationOp) -> Result<()> {
    let p = &op.payload;
    conn.execute(
        "UPDATE memory_items SET
            kind = ?1, title = ?2, body_text = ?3, subtitle = ?4, facts = ?5, concepts = ?6,
            files_read = ?7, files_modified = ?8, prompt_number = ?9, user_prompt_id = ?10,
            confidence = ?11, tags_text = ?12, active = 1, updated_at = ?13, deleted_at = NULL,
            rev = ?14, metadata = ?15, import_key = ?16
         WHERE id = ?17",
        params![
            p.get("kind").and_then(|v| v.as_str()).unwrap_or("note"),
            p.get("title").and_then(|v| v.as_str()).unwrap_or(""),
            p.get("body_text").and_then(|v| v.as_str()).unwrap_or(""),
            p.get("subtitle").and_then(|v| v.as_str()),
            p.get("facts").map(|v| v.to_string()).unwrap_or_else(|| "[]".to_string()),
            p.get("concepts").map(|v| v.to_string()).unwrap_or_else(|| "[]".to_string()),
            p.get("files_read").map(|v| v.to_string()).unwrap_or_else(|| "[]".to_string()),
            p.get("files_modified").map(|v| v.to_string()).unwrap_or_else(|| "[]".to_string()),
            p.get("prompt_number").and_then(|v| v.as_i64()),
            p.get("user_prompt_id").and_then(|v| v.as_i64()),
            p.get("confidence").and_then(|v| v.as_f64()).unwrap_or(1.0),
            p.get("tags_text").and_then(|v| v.as_str()).unwrap_or(""),
            op.clock_updated_at,
            op.rev,
            p.get("metadata").map(|v| v.to_string()).unwrap_or_else(|| "{}".to_string()),
            op.entity_id,
            id,
        ],
    )?;
    Ok(())
}
