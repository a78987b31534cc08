// Session lifecycle (§3): sessions, the opencode-session-id mapping, user
// prompts, and artifacts. The Observer Pipeline is the main caller; `remember`
// itself only needs a `session_id` and never touches these tables directly.

use crate::error::{Error, Result};
use crate::utils::now_rfc3339;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;

use crate::db::types::{Artifact, Session, SessionSummary, UserPrompt};

fn row_to_session(row: &Row) -> rusqlite::Result<Session> {
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

pub fn get_session(conn: &Connection, id: i64) -> Result<Option<Session>> {
    conn.query_row(
        "SELECT id, started_at, ended_at, cwd, project, git_remote, git_branch, user, tool_version, metadata, import_key
         FROM sessions WHERE id = ?1",
        params![id],
        row_to_session,
    )
    .optional()
    .map_err(Error::from)
}

/// Look up the local session bound to an external opencode session id.
pub fn find_by_opencode_external_id(conn: &Connection, external_id: &str) -> Result<Option<i64>> {
    conn.query_row(
        "SELECT session_id FROM opencode_sessions WHERE external_id = ?1",
        params![external_id],
        |row| row.get(0),
    )
    .optional()
    .map_err(Error::from)
}

#[derive(Debug, Clone, Default)]
pub struct NewSession {
    pub project: Option<String>,
    pub git_remote: Option<String>,
    pub git_branch: Option<String>,
    pub tool_version: Option<String>,
    pub metadata: Option<Value>,
}

/// Creates a new session row. Callers that have an opencode external session
/// id should follow with `bind_opencode_session`.
pub fn start_session(conn: &Connection, cwd: &str, user: &str, opts: NewSession) -> Result<i64> {
    let metadata = opts.metadata.unwrap_or_else(|| Value::Object(serde_json::Map::new()));
    let now = now_rfc3339();

    conn.execute(
        "INSERT INTO sessions (started_at, cwd, project, git_remote, git_branch, user, tool_version, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![now, cwd, opts.project, opts.git_remote, opts.git_branch, user, opts.tool_version, serde_json::to_string(&metadata)?],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn bind_opencode_session(conn: &Connection, session_id: i64, external_id: &str) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO opencode_sessions (external_id, session_id, created_at) VALUES (?1, ?2, ?3)",
        params![external_id, session_id, now_rfc3339()],
    )?;
    Ok(())
}

/// Binds or creates the local session for a flush payload carrying an
/// external opencode session id: returns the existing mapping's session if
/// present, otherwise creates one and records the mapping.
pub fn open_or_create_for_opencode(conn: &Connection, external_id: &str, cwd: &str, user: &str, opts: NewSession) -> Result<i64> {
    if let Some(existing) = find_by_opencode_external_id(conn, external_id)? {
        return Ok(existing);
    }
    let session_id = start_session(conn, cwd, user, opts)?;
    bind_opencode_session(conn, session_id, external_id)?;
    Ok(session_id)
}

pub fn end_session(conn: &Connection, session_id: i64) -> Result<()> {
    conn.execute(
        "UPDATE sessions SET ended_at = ?1 WHERE id = ?2 AND ended_at IS NULL",
        params![now_rfc3339(), session_id],
    )?;
    Ok(())
}

fn row_to_user_prompt(row: &Row) -> rusqlite::Result<UserPrompt> {
    let metadata: String = row.get("metadata")?;
    Ok(UserPrompt {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        prompt_text: row.get("prompt_text")?,
        prompt_number: row.get("prompt_number")?,
        created_at: row.get("created_at")?,
        metadata: serde_json::from_str(&metadata).unwrap_or(Value::Null),
    })
}

/// Persists a (already sanitized) user prompt and returns its row id.
pub fn record_user_prompt(conn: &Connection, session_id: i64, prompt_text: &str, prompt_number: Option<i64>, metadata: Option<Value>) -> Result<i64> {
    let metadata = metadata.unwrap_or_else(|| Value::Object(serde_json::Map::new()));
    conn.execute(
        "INSERT INTO user_prompts (session_id, prompt_text, prompt_number, created_at, metadata) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![session_id, prompt_text, prompt_number, now_rfc3339(), serde_json::to_string(&metadata)?],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn user_prompt(conn: &Connection, id: i64) -> Result<Option<UserPrompt>> {
    conn.query_row(
        "SELECT id, session_id, prompt_text, prompt_number, created_at, metadata FROM user_prompts WHERE id = ?1",
        params![id],
        row_to_user_prompt,
    )
    .optional()
    .map_err(Error::from)
}

fn row_to_artifact(row: &Row) -> rusqlite::Result<Artifact> {
    let metadata: String = row.get("metadata")?;
    Ok(Artifact {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        kind: row.get("kind")?,
        path: row.get("path")?,
        content_text: row.get("content_text")?,
        content_hash: row.get("content_hash")?,
        metadata: serde_json::from_str(&metadata).unwrap_or(Value::Null),
        created_at: row.get("created_at")?,
    })
}

/// Persists an artifact, deduplicated within a session by
/// `(kind, content_hash, metadata)`. Returns the existing row id on a
/// duplicate rather than erroring, matching `remember`'s idempotent-write
/// posture for replayed flush batches.
pub fn record_artifact(conn: &Connection, session_id: i64, kind: &str, path: Option<&str>, content_text: &str, metadata: Option<Value>) -> Result<i64> {
    use sha2::{Digest, Sha256};
    let content_hash = hex::encode(Sha256::digest(content_text.as_bytes()));
    let metadata = metadata.unwrap_or_else(|| Value::Object(serde_json::Map::new()));
    let metadata_json = serde_json::to_string(&metadata)?;

    let existing = conn
        .query_row(
            "SELECT id FROM artifacts WHERE session_id = ?1 AND kind = ?2 AND content_hash = ?3 AND metadata = ?4",
            params![session_id, kind, content_hash, metadata_json],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok(id);
    }

    conn.execute(
        "INSERT INTO artifacts (session_id, kind, path, content_text, content_hash, metadata, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![session_id, kind, path, content_text, content_hash, metadata_json, now_rfc3339()],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn artifact(conn: &Connection, id: i64) -> Result<Option<Artifact>> {
    conn.query_row(
        "SELECT id, session_id, kind, path, content_text, content_hash, metadata, created_at FROM artifacts WHERE id = ?1",
        params![id],
        row_to_artifact,
    )
    .optional()
    .map_err(Error::from)
}

fn row_to_session_summary(row: &Row) -> rusqlite::Result<SessionSummary> {
    let parse_list = |raw: String| -> Vec<String> { serde_json::from_str(&raw).unwrap_or_default() };
    Ok(SessionSummary {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        memory_item_id: row.get("memory_item_id")?,
        request: row.get("request")?,
        investigated: row.get("investigated")?,
        learned: row.get("learned")?,
        completed: row.get("completed")?,
        next_steps: row.get("next_steps")?,
        notes: row.get("notes")?,
        files_read: parse_list(row.get("files_read")?),
        files_edited: parse_list(row.get("files_edited")?),
        prompt_number: row.get("prompt_number")?,
        created_at: row.get("created_at")?,
    })
}

#[derive(Debug, Clone, Default)]
pub struct NewSessionSummary {
    pub memory_item_id: Option<i64>,
    pub request: String,
    pub investigated: String,
    pub learned: String,
    pub completed: String,
    pub next_steps: String,
    pub notes: String,
    pub files_read: Vec<String>,
    pub files_edited: Vec<String>,
    pub prompt_number: Option<i64>,
}

/// Persists the narrative structure for one prompt turn, optionally linked
/// to the companion `session_summary` memory item.
pub fn record_session_summary(conn: &Connection, session_id: i64, summary: NewSessionSummary) -> Result<i64> {
    conn.execute(
        "INSERT INTO session_summaries
            (session_id, memory_item_id, request, investigated, learned, completed, next_steps, notes,
             files_read, files_edited, prompt_number, created_at)
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
            now_rfc3339(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn session_summary(conn: &Connection, id: i64) -> Result<Option<SessionSummary>> {
    conn.query_row(
        "SELECT id, session_id, memory_item_id, request, investigated, learned, completed, next_steps, notes,
                files_read, files_edited, prompt_number, created_at
         FROM session_summaries WHERE id = ?1",
        params![id],
        row_to_session_summary,
    )
    .optional()
    .map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::run_all_migrations;

    #[test]
    fn open_or_create_for_opencode_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_all_migrations(&conn).unwrap();

        let first = open_or_create_for_opencode(&conn, "ext-1", "/tmp/proj", "dev", NewSession::default()).unwrap();
        let second = open_or_create_for_opencode(&conn, "ext-1", "/tmp/proj", "dev", NewSession::default()).unwrap();
        assert_eq!(first, second);

        let count: i64 = conn.query_row("SELECT COUNT(*) FROM sessions", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn end_session_sets_ended_at_once() {
        let conn = Connection::open_in_memory().unwrap();
        run_all_migrations(&conn).unwrap();
        let id = start_session(&conn, "/tmp", "dev", NewSession::default()).unwrap();

        end_session(&conn, id).unwrap();
        let session = get_session(&conn, id).unwrap().unwrap();
        assert!(session.ended_at.is_some());
    }

    #[test]
    fn record_artifact_dedups_by_kind_hash_metadata() {
        let conn = Connection::open_in_memory().unwrap();
        run_all_migrations(&conn).unwrap();
        let session_id = start_session(&conn, "/tmp", "dev", NewSession::default()).unwrap();

        let first = record_artifact(&conn, session_id, "diff", None, "same content", None).unwrap();
        let second = record_artifact(&conn, session_id, "diff", None, "same content", None).unwrap();
        assert_eq!(first, second);

        let count: i64 = conn.query_row("SELECT COUNT(*) FROM artifacts", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn record_user_prompt_round_trips() {
        let conn = Connection::open_in_memory().unwrap();
        run_all_migrations(&conn).unwrap();
        let session_id = start_session(&conn, "/tmp", "dev", NewSession::default()).unwrap();

        let id = record_user_prompt(&conn, session_id, "fix the bug", Some(1), None).unwrap();
        let prompt = user_prompt(&conn, id).unwrap().unwrap();
        assert_eq!(prompt.prompt_text, "fix the bug");
        assert_eq!(prompt.prompt_number, Some(1));
    }

    #[test]
    fn record_session_summary_round_trips_structured_fields() {
        let conn = Connection::open_in_memory().unwrap();
        run_all_migrations(&conn).unwrap();
        let session_id = start_session(&conn, "/tmp", "dev", NewSession::default()).unwrap();

        let input = NewSessionSummary {
            request: "fix login bug".into(),
            learned: "token refresh was racing".into(),
            files_edited: vec!["src/auth.rs".into()],
            prompt_number: Some(3),
            ..Default::default()
        };
        let id = record_session_summary(&conn, session_id, input).unwrap();
        let summary = session_summary(&conn, id).unwrap().unwrap();
        assert_eq!(summary.request, "fix login bug");
        assert_eq!(summary.files_edited, vec!["src/auth.rs".to_string()]);
        assert_eq!(summary.prompt_number, Some(3));
    }
}
