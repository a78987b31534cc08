// Vector storage (§3 MemoryVector, §4.2 derived fields): writes one row per
// `(memory_id, chunk_index, model)` into the `vec_memory` virtual table and
// serves nearest-neighbor queries for hybrid retrieval's semantic leg.

use crate::error::Result;
use rusqlite::{params, Connection, OptionalExtension};

/// Serialize an `f32` embedding into the little-endian byte blob sqlite-vec's
/// `vec0` module expects for a `float[N]` column.
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Cosine distance converted to a bounded `(0, 1]` similarity, matching
/// `ranking::semantic_similarity`'s contract for a generic distance metric.
pub fn distance_to_similarity(distance: f32) -> f64 {
    1.0 / (1.0 + distance.max(0.0) as f64)
}

/// Insert one chunk's embedding, skipping if a row with the same
/// `(memory_id, chunk_index, model, content_hash)` already exists — this is
/// what makes vector backfill idempotent and restartable.
pub fn upsert_chunk(
    conn: &Connection,
    memory_id: i64,
    chunk_index: i64,
    model: &str,
    content_hash: &str,
    embedding: &[f32],
) -> Result<bool> {
    let existing_hash: Option<String> = conn
        .query_row(
            "SELECT content_hash FROM vec_memory WHERE memory_id = ?1 AND chunk_index = ?2 AND model = ?3",
            params![memory_id, chunk_index, model],
            |row| row.get(0),
        )
        .optional()?;

    if existing_hash.as_deref() == Some(content_hash) {
        return Ok(false);
    }

    if existing_hash.is_some() {
        conn.execute(
            "DELETE FROM vec_memory WHERE memory_id = ?1 AND chunk_index = ?2 AND model = ?3",
            params![memory_id, chunk_index, model],
        )?;
    }

    conn.execute(
        "INSERT INTO vec_memory (memory_id, chunk_index, model, content_hash, embedding)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![memory_id, chunk_index, model, content_hash, embedding_to_bytes(embedding)],
    )?;
    Ok(true)
}

/// Drop all chunks for a memory (used before re-embedding under a new model
/// or when content changed enough that the chunk count shifted).
pub fn delete_chunks(conn: &Connection, memory_id: i64) -> Result<()> {
    conn.execute("DELETE FROM vec_memory WHERE memory_id = ?1", params![memory_id])?;
    Ok(())
}

/// Memory ids with at least one active item lacking any vector row under
/// `model`, oldest first, capped at `limit` — the work-list for backfill.
pub fn ids_missing_vectors(conn: &Connection, model: &str, limit: usize) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT m.id FROM memory_items m
         LEFT JOIN vec_memory v ON v.memory_id = m.id AND v.model = ?1
         WHERE m.active = 1 AND v.memory_id IS NULL
         GROUP BY m.id
         ORDER BY m.created_at ASC
         LIMIT ?2",
    )?;
    let ids = stmt
        .query_map(params![model, limit as i64], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    Ok(ids)
}

/// One nearest-neighbor hit: the memory id and its best (smallest-distance)
/// chunk similarity under `model`.
#[derive(Debug, Clone)]
pub struct SemanticHit {
    pub memory_id: i64,
    pub similarity: f64,
}

/// Approximate k-NN over `vec_memory`, ranking by cosine distance ascending
/// and keeping only each memory's closest chunk. `k` bounds the raw chunk
/// scan, not the deduplicated memory count, so ask for more than `limit`
/// when a memory is expected to have several chunks.
pub fn nearest(conn: &Connection, query_embedding: &[f32], model: &str, k: usize) -> Result<Vec<SemanticHit>> {
    let bytes = embedding_to_bytes(query_embedding);
    let mut stmt = conn.prepare(
        "SELECT memory_id, MIN(vec_distance_cosine(embedding, ?1)) as distance
         FROM vec_memory
         WHERE model = ?2
         GROUP BY memory_id
         ORDER BY distance ASC
         LIMIT ?3",
    )?;

    let rows = stmt.query_map(params![bytes, model, k as i64], |row| {
        let memory_id: i64 = row.get(0)?;
        let distance: f32 = row.get(1)?;
        Ok((memory_id, distance))
    })?;

    let mut hits = Vec::new();
    for row in rows {
        let (memory_id, distance) = row?;
        hits.push(SemanticHit { memory_id, similarity: distance_to_similarity(distance) });
    }
    Ok(hits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::run_all_migrations;

    fn seed_session_and_memory(conn: &Connection) -> i64 {
        conn.execute(
            "INSERT INTO sessions (started_at, cwd, user) VALUES ('2024-01-01T00:00:00Z', '/tmp', 'u')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO memory_items (session_id, kind, title, body_text, created_at, updated_at, import_key)
             VALUES (1, 'note', 't', 'b', '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z', 'k1')",
            [],
        )
        .unwrap();
        conn.last_insert_rowid()
    }

    fn unit_vector(dim: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; dim];
        v[hot] = 1.0;
        v
    }

    #[test]
    fn upsert_chunk_is_idempotent_on_unchanged_hash() {
        let conn = Connection::open_in_memory().unwrap();
        run_all_migrations(&conn).unwrap();
        let id = seed_session_and_memory(&conn);
        let embedding = unit_vector(crate::db::schema::EMBEDDING_DIM, 0);

        assert!(upsert_chunk(&conn, id, 0, "m1", "hash-a", &embedding).unwrap());
        assert!(!upsert_chunk(&conn, id, 0, "m1", "hash-a", &embedding).unwrap());

        let count: i64 = conn.query_row("SELECT COUNT(*) FROM vec_memory", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn upsert_chunk_replaces_on_changed_hash() {
        let conn = Connection::open_in_memory().unwrap();
        run_all_migrations(&conn).unwrap();
        let id = seed_session_and_memory(&conn);
        let embedding = unit_vector(crate::db::schema::EMBEDDING_DIM, 0);

        upsert_chunk(&conn, id, 0, "m1", "hash-a", &embedding).unwrap();
        assert!(upsert_chunk(&conn, id, 0, "m1", "hash-b", &embedding).unwrap());

        let count: i64 = conn.query_row("SELECT COUNT(*) FROM vec_memory", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn ids_missing_vectors_finds_unembedded_active_items() {
        let conn = Connection::open_in_memory().unwrap();
        run_all_migrations(&conn).unwrap();
        let id = seed_session_and_memory(&conn);

        let missing = ids_missing_vectors(&conn, "m1", 10).unwrap();
        assert_eq!(missing, vec![id]);

        let embedding = unit_vector(crate::db::schema::EMBEDDING_DIM, 0);
        upsert_chunk(&conn, id, 0, "m1", "hash-a", &embedding).unwrap();
        assert!(ids_missing_vectors(&conn, "m1", 10).unwrap().is_empty());
    }

    #[test]
    fn nearest_ranks_closest_chunk_first() {
        let conn = Connection::open_in_memory().unwrap();
        run_all_migrations(&conn).unwrap();
        let dim = crate::db::schema::EMBEDDING_DIM;
        let id_a = seed_session_and_memory(&conn);
        conn.execute(
            "INSERT INTO memory_items (session_id, kind, title, body_text, created_at, updated_at, import_key)
             VALUES (1, 'note', 't2', 'b2', '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z', 'k2')",
            [],
        )
        .unwrap();
        let id_b = conn.last_insert_rowid();

        upsert_chunk(&conn, id_a, 0, "m1", "h1", &unit_vector(dim, 0)).unwrap();
        upsert_chunk(&conn, id_b, 0, "m1", "h2", &unit_vector(dim, 1)).unwrap();

        let query = unit_vector(dim, 0);
        let hits = nearest(&conn, &query, "m1", 10).unwrap();
        assert_eq!(hits[0].memory_id, id_a);
        assert!(hits[0].similarity > hits[1].similarity);
    }

    #[test]
    fn distance_to_similarity_is_bounded_and_monotonic() {
        assert!((distance_to_similarity(0.0) - 1.0).abs() < 1e-9);
        assert!(distance_to_similarity(0.5) > distance_to_similarity(2.0));
        assert!((distance_to_similarity(-1.0) - 1.0).abs() < 1e-9);
    }
}
