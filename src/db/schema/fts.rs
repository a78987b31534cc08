// Full-text search (FTS5) migrations for memory_items.

use anyhow::Result;
use rusqlite::Connection;

/// Migrate to add the FTS5 full-text search table over `memory_items`.
pub fn migrate_memory_fts(conn: &Connection) -> Result<()> {
    let fts_exists: bool = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name='memory_fts'",
            [],
            |_| Ok(true),
        )
        .unwrap_or(false);

    if !fts_exists {
        tracing::info!("Creating FTS5 full-text search table for memory items");
        conn.execute_batch(
            "CREATE VIRTUAL TABLE IF NOT EXISTS memory_fts USING fts5(
                title,
                body_text,
                tags_text,
                memory_id UNINDEXED,
                content='',
                tokenize='porter unicode61 remove_diacritics 1'
            );",
        )?;

        rebuild_memory_fts(conn)?;
    }

    Ok(())
}

/// Rebuild the FTS5 index from `memory_items`. Call after a bulk import or
/// when the index needs refreshing independent of normal insert triggers.
pub fn rebuild_memory_fts(conn: &Connection) -> Result<()> {
    tracing::info!("Rebuilding FTS5 memory search index");

    conn.execute("DELETE FROM memory_fts", [])?;

    let inserted = conn.execute(
        "INSERT INTO memory_fts(rowid, title, body_text, tags_text, memory_id)
         SELECT id, title, body_text, tags_text, id FROM memory_items WHERE active = 1",
        [],
    )?;

    tracing::info!("FTS5 index rebuilt with {} entries", inserted);
    Ok(())
}

/// Index (or reindex) one memory item's current title/body/tags into
/// `memory_fts`. Called from `memory::store::remember` on every write so the
/// index stays current without a full rebuild; safe to call on an id that's
/// already indexed since it deletes any existing row first.
pub fn index_item(conn: &Connection, memory_id: i64) -> Result<()> {
    conn.execute("DELETE FROM memory_fts WHERE memory_id = ?", [memory_id])?;
    conn.execute(
        "INSERT INTO memory_fts(rowid, title, body_text, tags_text, memory_id)
         SELECT id, title, body_text, tags_text, id FROM memory_items WHERE id = ? AND active = 1",
        [memory_id],
    )?;
    Ok(())
}

/// Remove one memory item from `memory_fts`. Called from
/// `memory::store::forget` so soft-deleted items stop surfacing in FTS
/// candidate generation immediately, without waiting for a rebuild.
pub fn deindex_item(conn: &Connection, memory_id: i64) -> Result<()> {
    conn.execute("DELETE FROM memory_fts WHERE memory_id = ?", [memory_id])?;
    Ok(())
}

/// Rebuild the FTS5 index for a single session's memory items.
pub fn rebuild_memory_fts_for_session(conn: &Connection, session_id: i64) -> Result<()> {
    tracing::debug!("Rebuilding FTS5 index for session {}", session_id);

    conn.execute(
        "DELETE FROM memory_fts WHERE memory_id IN (SELECT id FROM memory_items WHERE session_id = ?)",
        [session_id],
    )?;

    conn.execute(
        "INSERT INTO memory_fts(rowid, title, body_text, tags_text, memory_id)
         SELECT id, title, body_text, tags_text, id FROM memory_items
         WHERE session_id = ? AND active = 1",
        [session_id],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::run_all_migrations;

    fn seed_item(conn: &Connection, session_id: i64, title: &str) {
        conn.execute(
            "INSERT INTO memory_items
                (session_id, kind, title, body_text, tags_text, created_at, updated_at, import_key)
             VALUES (?, 'note', ?, 'body text here', 'tag', '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z', ?)",
            rusqlite::params![session_id, title, format!("k-{title}")],
        )
        .unwrap();
    }

    #[test]
    fn rebuild_memory_fts_indexes_active_items_only() {
        let conn = Connection::open_in_memory().unwrap();
        run_all_migrations(&conn).unwrap();
        conn.execute(
            "INSERT INTO sessions (started_at, cwd, user) VALUES ('2024-01-01T00:00:00Z', '/tmp', 'u')",
            [],
        )
        .unwrap();
        seed_item(&conn, 1, "hello world");
        conn.execute("UPDATE memory_items SET active = 0 WHERE title = 'hello world'", [])
            .unwrap();
        seed_item(&conn, 1, "second item");

        rebuild_memory_fts(&conn).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM memory_fts", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
