// Memory store writes (§4.2): remember / remember_observation / forget,
// plus the shared row mapper used by retrieval and replication.

use super::tags::derive_tags;
use crate::db::types::{MemoryItem, MemoryKind};
use crate::error::{Error, Result};
use crate::replication::log::emit as emit_replication_op;
use crate::utils::json::canonicalize;
use crate::utils::now_rfc3339;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use uuid::Uuid;

pub fn row_to_memory_item(row: &Row) -> rusqlite::Result<MemoryItem> {
    let parse_list = |raw: String| -> Vec<String> { serde_json::from_str(&raw).unwrap_or_default() };
    let parse_json = |raw: String| -> Value { serde_json::from_str(&raw).unwrap_or(Value::Null) };

    Ok(MemoryItem {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        kind: row.get("kind")?,
        title: row.get("title")?,
        body_text: row.get("body_text")?,
        subtitle: row.get("subtitle")?,
        facts: parse_list(row.get("facts")?),
        concepts: parse_list(row.get("concepts")?),
        files_read: parse_list(row.get("files_read")?),
        files_modified: parse_list(row.get("files_modified")?),
        prompt_number: row.get("prompt_number")?,
        user_prompt_id: row.get("user_prompt_id")?,
        confidence: row.get("confidence")?,
        tags_text: row.get("tags_text")?,
        active: row.get::<_, i64>("active")? != 0,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        deleted_at: row.get("deleted_at")?,
        rev: row.get("rev")?,
        metadata: parse_json(row.get("metadata")?),
        import_key: row.get("import_key")?,
    })
}

pub fn get_memory_item(conn: &Connection, id: i64) -> Result<Option<MemoryItem>> {
    conn.query_row(
        "SELECT id, session_id, kind, title, body_text, subtitle, facts, concepts, files_read,
                files_modified, prompt_number, user_prompt_id, confidence, tags_text, active,
                created_at, updated_at, deleted_at, rev, metadata, import_key
         FROM memory_items WHERE id = ?",
        [id],
        row_to_memory_item,
    )
    .optional()
    .map_err(Error::from)
}

fn memory_item_payload(item: &MemoryItem) -> Value {
    serde_json::json!({
        "session_id": item.session_id,
        "kind": item.kind,
        "title": item.title,
        "body_text": item.body_text,
        "subtitle": item.subtitle,
        "facts": item.facts,
        "concepts": item.concepts,
        "files_read": item.files_read,
        "files_modified": item.files_modified,
        "prompt_number": item.prompt_number,
        "user_prompt_id": item.user_prompt_id,
        "confidence": item.confidence,
        "tags_text": item.tags_text,
        "active": item.active,
        "created_at": item.created_at,
        "deleted_at": item.deleted_at,
        "import_key": item.import_key,
        "metadata": item.metadata,
    })
}

#[derive(Debug, Clone, Default)]
pub struct RememberOptions {
    pub tags: Option<String>,
    pub metadata: Option<Value>,
    pub user_prompt_id: Option<i64>,
    pub subtitle: Option<String>,
    pub facts: Vec<String>,
    pub concepts: Vec<String>,
    pub files_read: Vec<String>,
    pub files_modified: Vec<String>,
    pub prompt_number: Option<i64>,
}

/// `remember` (§4.2). Validates `kind`, derives `tags_text` when omitted,
/// assigns `import_key`/`rev`/timestamps, and records exactly one
/// replication op. If `metadata.flush_batch` is set, probes for an
/// identical `(session, kind, title, body, metadata)` row first so a
/// replayed flush doesn't double-insert.
pub fn remember(
    conn: &Connection,
    session_id: i64,
    kind: &str,
    title: &str,
    body: &str,
    confidence: f64,
    device_id: &str,
    opts: RememberOptions,
) -> Result<i64> {
    let kind = MemoryKind::parse(kind)?;

    let mut metadata = opts.metadata.unwrap_or_else(|| Value::Object(serde_json::Map::new()));
    if !metadata.is_object() {
        metadata = Value::Object(serde_json::Map::new());
    }

    if metadata.get("flush_batch").is_some() {
        let metadata_json = serde_json::to_string(&canonicalize(&metadata))?;
        if let Some(existing_id) = probe_flush_batch_duplicate(conn, session_id, kind.as_str(), title, body, &metadata_json)? {
            return Ok(existing_id);
        }
    }

    if let Value::Object(map) = &mut metadata {
        map.insert("clock_device_id".to_string(), Value::String(device_id.to_string()));
    }

    let tags_text = opts.tags.unwrap_or_else(|| derive_tags(title, &opts.concepts, &opts.files_read, &opts.files_modified));
    let import_key = Uuid::new_v4().to_string();
    let now = now_rfc3339();

    conn.execute(
        "INSERT INTO memory_items
            (session_id, kind, title, body_text, subtitle, facts, concepts, files_read, files_modified,
             prompt_number, user_prompt_id, confidence, tags_text, active, created_at, updated_at,
             rev, metadata, import_key)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, 1, ?14, ?14, 1, ?15, ?16)",
        params![
            session_id,
            kind.as_str(),
            title,
            body,
            opts.subtitle,
            serde_json::to_string(&opts.facts)?,
            serde_json::to_string(&opts.concepts)?,
            serde_json::to_string(&opts.files_read)?,
            serde_json::to_string(&opts.files_modified)?,
            opts.prompt_number,
            opts.user_prompt_id,
            confidence,
            tags_text,
            now,
            serde_json::to_string(&metadata)?,
            import_key,
        ],
    )?;

    let id = conn.last_insert_rowid();
    let item = get_memory_item(conn, id)?.expect("row just inserted");
    crate::db::schema::fts::index_item(conn, id)?;
    emit_replication_op(conn, "memory_item", &item.import_key, "upsert", &memory_item_payload(&item), item.rev, &item.updated_at, device_id)?;

    Ok(id)
}

/// `remember_observation` (§4.2): structurally identical to `remember` with
/// `kind` fixed to `observation`, persisting the structured fields that
/// `tags::derive_tags` also reads from when the caller omits explicit tags.
#[allow(clippy::too_many_arguments)]
pub fn remember_observation(
    conn: &Connection,
    session_id: i64,
    title: &str,
    body: &str,
    confidence: f64,
    device_id: &str,
    opts: RememberOptions,
) -> Result<i64> {
    remember(conn, session_id, MemoryKind::Observation.as_str(), title, body, confidence, device_id, opts)
}

fn probe_flush_batch_duplicate(
    conn: &Connection,
    session_id: i64,
    kind: &str,
    title: &str,
    body: &str,
    metadata_json: &str,
) -> Result<Option<i64>> {
    conn.query_row(
        "SELECT id FROM memory_items
         WHERE session_id = ?1 AND kind = ?2 AND title = ?3 AND body_text = ?4 AND metadata = ?5
         LIMIT 1",
        params![session_id, kind, title, body, metadata_json],
        |row| row.get(0),
    )
    .optional()
    .map_err(Error::from)
}

/// `forget` (§4.2): soft-deletes a memory item and records a `delete` op.
pub fn forget(conn: &Connection, id: i64, device_id: &str) -> Result<()> {
    let Some(existing) = get_memory_item(conn, id)? else {
        return Err(Error::NotFound(format!("memory item {id} not found")));
    };

    let now = now_rfc3339();
    let new_rev = existing.rev + 1;

    conn.execute(
        "UPDATE memory_items SET active = 0, deleted_at = ?1, updated_at = ?1, rev = ?2 WHERE id = ?3",
        params![now, new_rev, id],
    )?;
    crate::db::schema::fts::deindex_item(conn, id)?;

    let mut payload = memory_item_payload(&existing);
    if let Value::Object(ref mut map) = payload {
        map.insert("active".to_string(), Value::Bool(false));
        map.insert("deleted_at".to_string(), Value::String(now.clone()));
    }

    emit_replication_op(conn, "memory_item", &existing.import_key, "delete", &payload, new_rev, &now, device_id)?;
    Ok(())
}
