// Schema migrations: one `migrate_*`/`create_table_if_missing` call per
// entity group, applied in dependency order. All migrations are idempotent
// so `run_all_migrations` is safe to call on every process start.

pub mod fts;
pub mod vectors;

use crate::db::migration_helpers::create_table_if_missing;
use anyhow::Result;
use rusqlite::Connection;

/// Embedding dimensionality for `vec_memory`. Changing this requires
/// `vectors::migrate_vec_tables` to drop and recreate the vector table.
pub const EMBEDDING_DIM: usize = 1536;

pub fn run_all_migrations(conn: &Connection) -> Result<()> {
    migrate_sessions(conn)?;
    migrate_opencode_sessions(conn)?;
    migrate_memory_items(conn)?;
    migrate_session_summaries(conn)?;
    migrate_user_prompts(conn)?;
    migrate_artifacts(conn)?;
    vectors::migrate_vec_tables(conn)?;
    migrate_vec_memory(conn)?;
    fts::migrate_memory_fts(conn)?;
    migrate_raw_events(conn)?;
    migrate_replication(conn)?;
    migrate_sync(conn)?;
    migrate_usage_events(conn)?;
    Ok(())
}

fn migrate_sessions(conn: &Connection) -> Result<()> {
    create_table_if_missing(
        conn,
        "sessions",
        "CREATE TABLE sessions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            started_at TEXT NOT NULL,
            ended_at TEXT,
            cwd TEXT NOT NULL,
            project TEXT,
            git_remote TEXT,
            git_branch TEXT,
            user TEXT NOT NULL,
            tool_version TEXT,
            metadata TEXT NOT NULL DEFAULT '{}',
            import_key TEXT UNIQUE
        );
        CREATE INDEX IF NOT EXISTS idx_sessions_project ON sessions(project);",
    )
}

fn migrate_opencode_sessions(conn: &Connection) -> Result<()> {
    create_table_if_missing(
        conn,
        "opencode_sessions",
        "CREATE TABLE opencode_sessions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            external_id TEXT NOT NULL UNIQUE,
            session_id INTEGER NOT NULL REFERENCES sessions(id),
            created_at TEXT NOT NULL
        );",
    )
}

fn migrate_memory_items(conn: &Connection) -> Result<()> {
    create_table_if_missing(
        conn,
        "memory_items",
        "CREATE TABLE memory_items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id INTEGER NOT NULL REFERENCES sessions(id),
            kind TEXT NOT NULL,
            title TEXT NOT NULL,
            body_text TEXT NOT NULL,
            subtitle TEXT,
            facts TEXT NOT NULL DEFAULT '[]',
            concepts TEXT NOT NULL DEFAULT '[]',
            files_read TEXT NOT NULL DEFAULT '[]',
            files_modified TEXT NOT NULL DEFAULT '[]',
            prompt_number INTEGER,
            user_prompt_id INTEGER,
            confidence REAL NOT NULL DEFAULT 1.0,
            tags_text TEXT NOT NULL DEFAULT '',
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT,
            rev INTEGER NOT NULL DEFAULT 1,
            metadata TEXT NOT NULL DEFAULT '{}',
            import_key TEXT NOT NULL UNIQUE
        );
        CREATE INDEX IF NOT EXISTS idx_memory_items_session ON memory_items(session_id);
        CREATE INDEX IF NOT EXISTS idx_memory_items_kind ON memory_items(kind);
        CREATE INDEX IF NOT EXISTS idx_memory_items_active ON memory_items(active);",
    )
}

fn migrate_session_summaries(conn: &Connection) -> Result<()> {
    create_table_if_missing(
        conn,
        "session_summaries",
        "CREATE TABLE session_summaries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id INTEGER NOT NULL REFERENCES sessions(id),
            memory_item_id INTEGER REFERENCES memory_items(id),
            request TEXT NOT NULL DEFAULT '',
            investigated TEXT NOT NULL DEFAULT '',
            learned TEXT NOT NULL DEFAULT '',
            completed TEXT NOT NULL DEFAULT '',
            next_steps TEXT NOT NULL DEFAULT '',
            notes TEXT NOT NULL DEFAULT '',
            files_read TEXT NOT NULL DEFAULT '[]',
            files_edited TEXT NOT NULL DEFAULT '[]',
            prompt_number INTEGER,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_session_summaries_session ON session_summaries(session_id);",
    )
}

fn migrate_user_prompts(conn: &Connection) -> Result<()> {
    create_table_if_missing(
        conn,
        "user_prompts",
        "CREATE TABLE user_prompts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id INTEGER NOT NULL REFERENCES sessions(id),
            prompt_text TEXT NOT NULL,
            prompt_number INTEGER,
            created_at TEXT NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}'
        );
        CREATE INDEX IF NOT EXISTS idx_user_prompts_session ON user_prompts(session_id);",
    )
}

fn migrate_artifacts(conn: &Connection) -> Result<()> {
    create_table_if_missing(
        conn,
        "artifacts",
        "CREATE TABLE artifacts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id INTEGER NOT NULL REFERENCES sessions(id),
            kind TEXT NOT NULL,
            path TEXT,
            content_text TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            UNIQUE(session_id, kind, content_hash, metadata)
        );",
    )
}

/// `vec_memory`: one row per `(memory_id, chunk_index, model)`, via the
/// `sqlite-vec` virtual table module. Dimension drift is handled by
/// `vectors::migrate_vec_tables`, which drops the table before this recreates
/// it with the current `EMBEDDING_DIM`.
fn migrate_vec_memory(conn: &Connection) -> Result<()> {
    create_table_if_missing(
        conn,
        "vec_memory",
        &format!(
            "CREATE VIRTUAL TABLE vec_memory USING vec0(
                memory_id INTEGER PARTITION KEY,
                chunk_index INTEGER,
                +model TEXT,
                +content_hash TEXT,
                embedding float[{EMBEDDING_DIM}]
            );"
        ),
    )
}

fn migrate_raw_events(conn: &Connection) -> Result<()> {
    create_table_if_missing(
        conn,
        "raw_events",
        "CREATE TABLE raw_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            opencode_session_id TEXT NOT NULL,
            event_seq INTEGER NOT NULL,
            event_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            ts_wall_ms INTEGER,
            ts_mono_ms INTEGER,
            payload_json TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            UNIQUE(opencode_session_id, event_id),
            UNIQUE(opencode_session_id, event_seq)
        );
        CREATE INDEX IF NOT EXISTS idx_raw_events_ordering
            ON raw_events(opencode_session_id, ts_mono_ms, event_seq);",
    )?;
    create_table_if_missing(
        conn,
        "raw_event_sessions",
        "CREATE TABLE raw_event_sessions (
            opencode_session_id TEXT PRIMARY KEY,
            cwd TEXT,
            project TEXT,
            started_at TEXT,
            last_seen_ts_wall_ms INTEGER,
            last_received_event_seq INTEGER NOT NULL DEFAULT 0,
            last_flushed_event_seq INTEGER NOT NULL DEFAULT 0
        );",
    )?;
    create_table_if_missing(
        conn,
        "raw_event_flush_batches",
        "CREATE TABLE raw_event_flush_batches (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            opencode_session_id TEXT NOT NULL,
            start_event_seq INTEGER NOT NULL,
            end_event_seq INTEGER NOT NULL,
            extractor_version TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            attempt_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(opencode_session_id, start_event_seq, end_event_seq, extractor_version)
        );
        CREATE INDEX IF NOT EXISTS idx_flush_batches_status ON raw_event_flush_batches(status);",
    )?;
    create_table_if_missing(
        conn,
        "raw_event_reliability_counters",
        "CREATE TABLE raw_event_reliability_counters (
            name TEXT PRIMARY KEY,
            value INTEGER NOT NULL DEFAULT 0
        );",
    )?;
    create_table_if_missing(
        conn,
        "raw_event_reliability_samples",
        "CREATE TABLE raw_event_reliability_samples (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            bucket_ts TEXT NOT NULL,
            metric TEXT NOT NULL,
            value REAL NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_reliability_samples_bucket
            ON raw_event_reliability_samples(metric, bucket_ts);",
    )
}

fn migrate_replication(conn: &Connection) -> Result<()> {
    create_table_if_missing(
        conn,
        "replication_ops",
        "CREATE TABLE replication_ops (
            op_id TEXT PRIMARY KEY,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            op_type TEXT NOT NULL,
            payload TEXT NOT NULL,
            rev INTEGER NOT NULL,
            clock_updated_at TEXT NOT NULL,
            clock_device_id TEXT NOT NULL,
            device_id TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_replication_ops_cursor
            ON replication_ops(created_at, op_id);
        CREATE INDEX IF NOT EXISTS idx_replication_ops_entity
            ON replication_ops(entity_type, entity_id);",
    )?;
    create_table_if_missing(
        conn,
        "replication_cursors",
        "CREATE TABLE replication_cursors (
            peer_device_id TEXT PRIMARY KEY,
            last_applied_cursor TEXT,
            last_acked_cursor TEXT
        );",
    )
}

fn migrate_sync(conn: &Connection) -> Result<()> {
    create_table_if_missing(
        conn,
        "sync_peers",
        "CREATE TABLE sync_peers (
            peer_device_id TEXT PRIMARY KEY,
            name TEXT,
            pinned_fingerprint TEXT NOT NULL,
            public_key TEXT NOT NULL,
            addresses TEXT NOT NULL DEFAULT '[]',
            last_seen_at TEXT,
            last_sync_at TEXT,
            last_error TEXT,
            project_filter_include TEXT NOT NULL DEFAULT '[]',
            project_filter_exclude TEXT NOT NULL DEFAULT '[]'
        );",
    )?;
    create_table_if_missing(
        conn,
        "sync_devices",
        "CREATE TABLE sync_devices (
            device_id TEXT PRIMARY KEY,
            public_key TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            created_at TEXT NOT NULL
        );",
    )?;
    create_table_if_missing(
        conn,
        "sync_nonces",
        "CREATE TABLE sync_nonces (
            device_id TEXT NOT NULL,
            nonce TEXT NOT NULL,
            seen_at TEXT NOT NULL,
            PRIMARY KEY(device_id, nonce)
        );",
    )?;
    create_table_if_missing(
        conn,
        "sync_attempts",
        "CREATE TABLE sync_attempts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            peer_device_id TEXT NOT NULL,
            ok INTEGER NOT NULL,
            ops_in INTEGER NOT NULL DEFAULT 0,
            ops_out INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_sync_attempts_peer ON sync_attempts(peer_device_id, created_at);",
    )?;
    create_table_if_missing(
        conn,
        "sync_daemon_state",
        "CREATE TABLE sync_daemon_state (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            last_ok_at TEXT,
            last_error TEXT,
            updated_at TEXT NOT NULL
        );",
    )
}

fn migrate_usage_events(conn: &Connection) -> Result<()> {
    create_table_if_missing(
        conn,
        "usage_events",
        "CREATE TABLE usage_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event TEXT NOT NULL,
            tokens_read INTEGER NOT NULL DEFAULT 0,
            tokens_written INTEGER NOT NULL DEFAULT 0,
            tokens_saved INTEGER NOT NULL DEFAULT 0,
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_usage_events_event ON usage_events(event, created_at);",
    )
}

/// Rebuild the FTS5 index over `memory_items` from scratch. Delegates to
/// [`fts::rebuild_memory_fts`]; kept as a crate-visible re-export so callers
/// (the connection pool, maintenance CLI) don't need to know the submodule.
pub fn rebuild_memory_fts(conn: &Connection) -> Result<()> {
    fts::rebuild_memory_fts(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_all_migrations_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_all_migrations(&conn).unwrap();
        run_all_migrations(&conn).unwrap();

        for table in [
            "sessions",
            "opencode_sessions",
            "memory_items",
            "session_summaries",
            "user_prompts",
            "artifacts",
            "raw_events",
            "raw_event_sessions",
            "raw_event_flush_batches",
            "replication_ops",
            "replication_cursors",
            "sync_peers",
            "sync_devices",
            "usage_events",
        ] {
            assert!(
                crate::db::migration_helpers::table_exists(&conn, table),
                "missing table {table}"
            );
        }
    }

    #[test]
    fn memory_items_import_key_is_unique() {
        let conn = Connection::open_in_memory().unwrap();
        run_all_migrations(&conn).unwrap();
        conn.execute(
            "INSERT INTO sessions (started_at, cwd, user) VALUES ('2024-01-01T00:00:00Z', '/tmp', 'u')",
            [],
        )
        .unwrap();
        let insert = "INSERT INTO memory_items
            (session_id, kind, title, body_text, created_at, updated_at, import_key)
            VALUES (1, 'note', 't', 'b', '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z', 'k1')";
        conn.execute(insert, []).unwrap();
        assert!(conn.execute(insert, []).is_err());
    }
}
