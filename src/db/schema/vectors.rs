// Vector table migrations for memory embeddings storage.

use super::EMBEDDING_DIM;
use anyhow::Result;
use rusqlite::Connection;

/// Drop `vec_memory` if its embedding dimension no longer matches
/// [`EMBEDDING_DIM`], so the caller can recreate it at the current width.
/// `sqlite-vec` virtual tables don't support `ALTER TABLE`, so a dimension
/// change is a drop-and-rebuild; callers must re-run the embedding backfill
/// afterward since the dropped table's rows are lost.
pub fn migrate_vec_tables(conn: &Connection) -> Result<()> {
    let current_dim: Option<i64> = conn
        .query_row(
            "SELECT sql FROM sqlite_master WHERE type='table' AND name='vec_memory'",
            [],
            |row| {
                let sql: String = row.get(0)?;
                if let Some(start) = sql.find("float[") {
                    let rest = &sql[start + 6..];
                    if let Some(end) = rest.find(']') {
                        if let Ok(dim) = rest[..end].parse::<i64>() {
                            return Ok(Some(dim));
                        }
                    }
                }
                Ok(None)
            },
        )
        .unwrap_or(None);

    if let Some(dim) = current_dim {
        if dim != EMBEDDING_DIM as i64 {
            tracing::info!(
                "Migrating vec_memory from {} to {} dimensions",
                dim,
                EMBEDDING_DIM
            );
            conn.execute_batch("DROP TABLE IF EXISTS vec_memory;")?;
        }
    }

    Ok(())
}
