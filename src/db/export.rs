// Import/export of the entity tables as a versioned JSON document (§6
// "Import/export of the entity tables as a versioned JSON document", §8
// round-trip law: "export -> import of the entity tables preserves all
// fields modulo local IDs; import_key matches across round-trip").
//
// Sessions are cross-device-identified the same way memory items are: by
// `import_key`. Export backfills a missing session `import_key` before
// reading it out, so a session created locally (never replicated) still
// round-trips stably. `user_prompts`/`session_summaries`/`artifacts` carry
// no `import_key` of their own (§3) — they're exported nested under their
// owning session and re-homed onto whatever local session id that
// session's `import_key` resolves to on import, deduped on a natural key
// so re-running an import is a no-op.
//
// Memory items are imported through the same `replication::apply::apply_op`
// + `replication::log::emit` path a live sync pass uses: an imported row is
// just an upsert this device is observing for the first time, and emitting
// it into the local op log means it propagates to peers on the next sync
// pass exactly like one written by `remember`.

use crate::db::types::{Artifact, MemoryItem, Session, SessionSummary, UserPrompt};
use crate::error::Result;
use crate::replication::apply::apply_op;
use crate::replication::log::emit as emit_replication_op;
use crate::utils::now_rfc3339;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

pub const EXPORT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedSession {
    pub session: Session,
    pub user_prompts: Vec<UserPrompt>,
    pub session_summaries: Vec<SessionSummary>,
    pub artifacts: Vec<Artifact>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedMemoryItem {
    pub item: MemoryItem,
    pub session_import_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportDocument {
    pub version: u32,
    pub exported_at: String,
    pub sessions: Vec<ExportedSession>,
    pub memory_items: Vec<ExportedMemoryItem>,
}

/// Assigns an `import_key` to every session that lacks one, then reads out
/// every session with its prompts/summaries/artifacts and every memory
/// item (active and soft-deleted alike, so a deletion round-trips too).
pub fn export_all(conn: &Connection) -> Result<ExportDocument> {
    backfill_session_import_keys(conn)?;

    let session_ids: Vec<i64> = conn
        .prepare("SELECT id FROM sessions ORDER BY id")?
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut sessions = Vec::with_capacity(session_ids.len());
    let mut session_import_key_by_id = HashMap::with_capacity(session_ids.len());
    for id in session_ids {
        let session = get_session(conn, id)?;
        session_import_key_by_id.insert(id, session.import_key.clone().unwrap_or_default());
        sessions.push(ExportedSession {
            user_prompts: list_user_prompts(conn, id)?,
            session_summaries: list_session_summaries(conn, id)?,
            artifacts: list_artifacts(conn, id)?,
            session,
        });
    }

    let mut stmt = conn.prepare(
        "SELECT id, session_id, kind, title, body_text, subtitle, facts, concepts, files_read,
                files_modified, prompt_number, user_prompt_id, confidence, tags_text, active,
                created_at, updated_at, deleted_at, rev, metadata, import_key
         FROM memory_items ORDER BY id",
    )?;
    let memory_items = stmt
        .query_map([], crate::db::memory::row_to_memory_item)?
        .collect::<rusqlite::Result<Vec<_>>>()?
        .into_iter()
        .map(|item| ExportedMemoryItem {
            session_import_key: session_import_key_by_id.get(&item.session_id).cloned().unwrap_or_default(),
            item,
        })
        .collect();

    Ok(ExportDocument { version: EXPORT_VERSION, exported_at: now_rfc3339(), sessions, memory_items })
}

fn backfill_session_import_keys(conn: &Connection) -> Result<()> {
    let ids: Vec<i64> = conn
        .prepare("SELECT id FROM sessions WHERE import_key IS NULL")?
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for id in ids {
        conn.execute("UPDATE sessions SET import_key = ?1 WHERE id = ?2", params![Uuid::new_v4().to_string(), id])?;
    }
    Ok(())
}

fn get_session(conn: &Connection, id: i64) -> Result<Session> {
    Ok(conn.query_row(
        "SELECT id, started_at, ended_at, cwd, project, git_remote, git_branch, user, tool_version,
                metadata, import_key
         FROM sessions WHERE id = ?",
        [id],
        row_to_session,
    )?)
}

fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<Session> {
    let metadata: String = row.get("metadata")?;
    Ok(Session {
        id: row.get("id")?,
        started_at: row.get("started_at")?,
        ended_at: row.get("ended_at")?,
        cwd: row.get("cwd")?,
        project: row.get("project")?,
        git_remote: row.get("git_remote")?,
        git_branch: row.get("git_branch")?,
        user: row.get("user")?,
        tool_version: row.get("tool_version")?,
        metadata: serde_json::from_str(&metadata).unwrap_or(Value::Null),
        import_key: row.get("import_key")?,
    })
}

fn list_user_prompts(conn: &Connection, session_id: i64) -> Result<Vec<UserPrompt>> {
    let mut stmt = conn.prepare(
        "SELECT id, session_id, prompt_text, prompt_number, created_at, metadata
         FROM user_prompts WHERE session_id = ? ORDER BY id",
    )?;
    let rows = stmt.query_map([session_id], |row| {
        let metadata: String = row.get(5)?;
        Ok(UserPrompt {
            id: row.get(0)?,
            session_id: row.get(1)?,
            prompt_text: row.get(2)?,
            prompt_number: row.get(3)?,
            created_at: row.get(4)?,
            metadata: serde_json::from_str(&metadata).unwrap_or(Value::Null),
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn list_session_summaries(conn: &Connection, session_id: i64) -> Result<Vec<SessionSummary>> {
    let mut stmt = conn.prepare(
        "SELECT id, session_id, memory_item_id, request, investigated, learned, completed,
                next_steps, notes, files_read, files_edited, prompt_number, created_at
         FROM session_summaries WHERE session_id = ? ORDER BY id",
    )?;
    let rows = stmt.query_map([session_id], |row| {
        let files_read: String = row.get(9)?;
        let files_edited: String = row.get(10)?;
        Ok(SessionSummary {
            id: row.get(0)?,
            session_id: row.get(1)?,
            memory_item_id: row.get(2)?,
            request: row.get(3)?,
            investigated: row.get(4)?,
            learned: row.get(5)?,
            completed: row.get(6)?,
            next_steps: row.get(7)?,
            notes: row.get(8)?,
            files_read: serde_json::from_str(&files_read).unwrap_or_default(),
            files_edited: serde_json::from_str(&files_edited).unwrap_or_default(),
            prompt_number: row.get(11)?,
            created_at: row.get(12)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn list_artifacts(conn: &Connection, session_id: i64) -> Result<Vec<Artifact>> {
    let mut stmt = conn.prepare(
        "SELECT id, session_id, kind, path, content_text, content_hash, metadata, created_at
         FROM artifacts WHERE session_id = ? ORDER BY id",
    )?;
    let rows = stmt.query_map([session_id], |row| {
        let metadata: String = row.get(6)?;
        Ok(Artifact {
            id: row.get(0)?,
            session_id: row.get(1)?,
            kind: row.get(2)?,
            path: row.get(3)?,
            content_text: row.get(4)?,
            content_hash: row.get(5)?,
            metadata: serde_json::from_str(&metadata).unwrap_or(Value::Null),
            created_at: row.get(7)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportReport {
    pub sessions_created: usize,
    pub sessions_matched: usize,
    pub user_prompts_inserted: usize,
    pub session_summaries_inserted: usize,
    pub artifacts_inserted: usize,
    pub memory_items_applied: usize,
    pub memory_items_skipped: usize,
}

/// Applies an `ExportDocument` (§6, §8 round-trip law). Sessions are
/// matched (or created) by `import_key`; everything nested under a session
/// is re-homed onto the resolved local session id. Memory items go through
/// the same clock-compared upsert a live sync pass uses, so an import never
/// regresses a row that's newer locally, and the import is recorded into
/// the local op log so it propagates to peers afterward.
pub fn import_document(conn: &Connection, doc: &ExportDocument, device_id: &str) -> Result<ImportReport> {
    let mut report = ImportReport::default();
    let mut session_id_by_import_key: HashMap<String, i64> = HashMap::new();

    for exported in &doc.sessions {
        let import_key = exported.session.import_key.clone().unwrap_or_default();
        if import_key.is_empty() {
            continue;
        }

        let local_id = match find_session_by_import_key(conn, &import_key)? {
            Some(id) => {
                report.sessions_matched += 1;
                id
            }
            None => {
                report.sessions_created += 1;
                insert_session(conn, &exported.session, &import_key)?
            }
        };
        session_id_by_import_key.insert(import_key, local_id);

        for prompt in &exported.user_prompts {
            if insert_user_prompt_if_absent(conn, local_id, prompt)? {
                report.user_prompts_inserted += 1;
            }
        }
        for summary in &exported.session_summaries {
            if insert_session_summary_if_absent(conn, local_id, summary)? {
                report.session_summaries_inserted += 1;
            }
        }
        for artifact in &exported.artifacts {
            if insert_artifact_if_absent(conn, local_id, artifact)? {
                report.artifacts_inserted += 1;
            }
        }
    }

    for exported in &doc.memory_items {
        let Some(&session_id) = session_id_by_import_key.get(&exported.session_import_key) else {
            report.memory_items_skipped += 1;
            continue;
        };
        if apply_memory_item(conn, session_id, &exported.item, device_id)? {
            report.memory_items_applied += 1;
        } else {
            report.memory_items_skipped += 1;
        }
    }

    Ok(report)
}

fn find_session_by_import_key(conn: &Connection, import_key: &str) -> Result<Option<i64>> {
    Ok(conn.query_row("SELECT id FROM sessions WHERE import_key = ?", [import_key], |r| r.get(0)).optional()?)
}

fn insert_session(conn: &Connection, session: &Session, import_key: &str) -> Result<i64> {
    conn.execute(
        "INSERT INTO sessions (started_at, ended_at, cwd, project, git_remote, git_branch, user, tool_version, metadata, import_key)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            session.started_at,
            session.ended_at,
            session.cwd,
            session.project,
            session.git_remote,
            session.git_branch,
            session.user,
            session.tool_version,
            serde_json::to_string(&session.metadata)?,
            import_key,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn insert_user_prompt_if_absent(conn: &Connection, session_id: i64, prompt: &UserPrompt) -> Result<bool> {
    let exists: Option<i64> = conn
        .query_row(
            "SELECT id FROM user_prompts WHERE session_id = ?1 AND prompt_text = ?2 AND created_at = ?3",
            params![session_id, prompt.prompt_text, prompt.created_at],
            |r| r.get(0),
        )
        .optional()?;
    if exists.is_some() {
        return Ok(false);
    }
    conn.execute(
        "INSERT INTO user_prompts (session_id, prompt_text, prompt_number, created_at, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![session_id, prompt.prompt_text, prompt.prompt_number, prompt.created_at, serde_json::to_string(&prompt.metadata)?],
    )?;
    Ok(true)
}

fn insert_session_summary_if_absent(conn: &Connection, session_id: i64, summary: &SessionSummary) -> Result<bool> {
    let exists: Option<i64> = conn
        .query_row(
            "SELECT id FROM session_summaries WHERE session_id = ?1 AND created_at = ?2 AND request = ?3",
            params![session_id, summary.created_at, summary.request],
            |r| r.get(0),
        )
        .optional()?;
    if exists.is_some() {
        return Ok(false);
    }
    conn.execute(
        "INSERT INTO session_summaries
            (session_id, memory_item_id, request, investigated, learned, completed, next_steps,
             notes, files_read, files_edited, prompt_number, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            session_id,
            summary.memory_item_id,
            summary.request,
            summary.investigated,
            summary.learned,
            summary.completed,
            summary.next_steps,
            summary.notes,
            serde_json::to_string(&summary.files_read)?,
            serde_json::to_string(&summary.files_edited)?,
            summary.prompt_number,
            summary.created_at,
        ],
    )?;
    Ok(true)
}

fn insert_artifact_if_absent(conn: &Connection, session_id: i64, artifact: &Artifact) -> Result<bool> {
    let metadata_json = serde_json::to_string(&artifact.metadata)?;
    let changed = conn.execute(
        "INSERT OR IGNORE INTO artifacts (session_id, kind, path, content_text, content_hash, metadata, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![session_id, artifact.kind, artifact.path, artifact.content_text, artifact.content_hash, metadata_json, artifact.created_at],
    )?;
    Ok(changed > 0)
}

/// Upserts one imported memory item via the same clock-compared apply path
/// `replication::apply::apply_op` uses for an inbound sync op, then emits it
/// into the local op log so it's visible to the next outbound sync pass.
fn apply_memory_item(conn: &Connection, session_id: i64, item: &MemoryItem, device_id: &str) -> Result<bool> {
    let mut payload = serde_json::json!({
        "session_id": session_id,
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
        "deleted_at": item.deleted_at,
        "import_key": item.import_key,
        "metadata": item.metadata,
    });
    let clock_device_id = item.clock().2;
    if let Value::Object(map) = &mut payload {
        if let Value::Object(metadata) = map.get_mut("metadata").expect("metadata key set above") {
            metadata.insert("clock_device_id".to_string(), Value::String(clock_device_id.clone()));
        }
    }

    let op_type = if item.active { "upsert" } else { "delete" };
    let op = crate::db::types::ReplicationOp {
        op_id: Uuid::new_v4().to_string(),
        entity_type: "memory_item".to_string(),
        entity_id: item.import_key.clone(),
        op_type: op_type.to_string(),
        payload,
        rev: item.rev,
        clock_updated_at: item.updated_at.clone(),
        clock_device_id: clock_device_id.clone(),
        device_id: device_id.to_string(),
        created_at: now_rfc3339(),
    };

    let applied = apply_op(conn, &op)?;
    if applied {
        emit_replication_op(conn, "memory_item", &item.import_key, op_type, &op.payload, op.rev, &op.clock_updated_at, &clock_device_id)?;
    }
    Ok(applied)
}
