// Hybrid retrieval (§4.4): FTS, semantic, and fuzzy candidate generation,
// query-class routing, reranking, and timeline expansion. Semantic search
// needs an externally-computed query embedding (the embedder is an async
// HTTP client, out of reach of a `rusqlite::Connection` closure), so this
// module accepts precomputed `vectors::SemanticHit`s rather than owning the
// embed call itself — see `crate::retrieval::hybrid_recall` for the async
// orchestration that ties FTS + semantic + fuzzy together.

use super::ranking::{
    days_ago, fts_combined_score, kind_rank, merged_rerank_score, RankedMemory, RecallRow,
    FUZZY_ACCEPT_THRESHOLD, RECALL_KIND_PRIORITY, TASK_KIND_PRIORITY,
};
use super::vectors::SemanticHit;
use crate::db::types::MemoryItem;
use crate::error::Result;
use crate::utils::text::{normalize_words, sequence_matcher_ratio, token_overlap_fraction};
use rusqlite::{params, Connection, Row};
use std::collections::BTreeSet;

/// Predicate bundle shared by all three candidate sources.
#[derive(Debug, Clone, Default)]
pub struct RecallFilters {
    pub kind: Option<String>,
    pub session_id: Option<i64>,
    pub project: Option<String>,
    /// Only candidates with `updated_at >= since` (RFC-3339).
    pub since: Option<String>,
}

/// The three query classes that drive retrieval routing (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryClass {
    Task,
    Recall,
    Default,
}

const TASK_KEYWORDS: &[&str] = &["todo", "pending", "next", "resume", "backlog", "unfinished", "in progress"];
const RECALL_KEYWORDS: &[&str] = &["remember", "recap", "summary", "summarize", "what did we", "last time"];

pub const TASK_RECENCY_DAYS: f64 = 365.0;
pub const RECALL_RECENCY_DAYS: f64 = 180.0;

/// Classify a query string into task / recall / default routing, per §4.4's
/// keyword lists. Task keywords are checked first: a query that mentions
/// both ("what's left from last time") routes as task, matching the
/// priority order the source checks in.
pub fn classify_query(query: &str) -> QueryClass {
    let lowered = query.to_lowercase();
    if TASK_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        QueryClass::Task
    } else if RECALL_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        QueryClass::Recall
    } else {
        QueryClass::Default
    }
}

const FTS_BOOLEAN_KEYWORDS: &[&str] = &["and", "or", "not", "near"];

/// Build an FTS5 MATCH expression from free text: strip boolean keywords
/// (which FTS5 would otherwise interpret as operators) and OR-join the
/// remaining tokens so any one matching word surfaces a candidate.
fn build_fts_match(query: &str) -> Option<String> {
    let tokens: Vec<String> = normalize_words(query.split_whitespace())
        .into_iter()
        .filter(|t| !FTS_BOOLEAN_KEYWORDS.contains(&t.as_str()))
        .collect();

    if tokens.is_empty() {
        return None;
    }

    Some(tokens.iter().map(|t| format!("\"{t}\"")).collect::<Vec<_>>().join(" OR "))
}

fn row_to_recall_row(row: &Row) -> rusqlite::Result<RecallRow> {
    Ok(RecallRow {
        memory_id: row.get("memory_id")?,
        kind: row.get("kind")?,
        title: row.get("title")?,
        body_text: row.get("body_text")?,
        tags_text: row.get("tags_text")?,
        session_id: row.get("session_id")?,
        project: row.get("project")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn project_predicate_sql() -> &'static str {
    "(?5 IS NULL OR s.project = ?5 OR s.project LIKE '%/' || ?5)"
}

/// FTS candidate generation: `-bm25(...)` plus recency and kind bonuses,
/// filtered by `active=1` and any provided predicates.
pub fn fts_candidates(conn: &Connection, query: &str, limit: usize, filters: &RecallFilters) -> Result<Vec<RankedMemory>> {
    let Some(fts_match) = build_fts_match(query) else { return Ok(Vec::new()) };

    let sql = format!(
        "SELECT m.id as memory_id, m.kind, m.title, m.body_text, m.tags_text, m.session_id,
                s.project, m.created_at, m.updated_at,
                bm25(memory_fts, 1.0, 1.0, 0.25) as bm25
         FROM memory_fts
         JOIN memory_items m ON m.id = memory_fts.memory_id
         JOIN sessions s ON s.id = m.session_id
         WHERE memory_fts MATCH ?1
           AND m.active = 1
           AND (?2 IS NULL OR m.kind = ?2)
           AND (?3 IS NULL OR m.session_id = ?3)
           AND {project}
           AND (?6 IS NULL OR m.updated_at >= ?6)
         ORDER BY bm25
         LIMIT ?7",
        project = project_predicate_sql(),
    );

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        params![fts_match, filters.kind, filters.session_id, 0i64, filters.project, filters.since, limit as i64],
        |row| {
            let recall_row = row_to_recall_row(row)?;
            let bm25: f64 = row.get("bm25")?;
            Ok((recall_row, bm25))
        },
    )?;

    let mut out = Vec::new();
    for row in rows {
        let (recall_row, bm25) = row?;
        let score = fts_combined_score(bm25, days_ago(&recall_row.updated_at), &recall_row.kind);
        out.push(RankedMemory { row: recall_row, score });
    }
    Ok(out)
}

/// Semantic candidate generation from precomputed nearest-neighbor hits:
/// joins back to `memory_items`/`sessions` to apply the same filters the
/// other two sources use, and to fetch the row content for pack assembly.
pub fn semantic_candidates(conn: &Connection, hits: &[SemanticHit], filters: &RecallFilters) -> Result<Vec<RankedMemory>> {
    let mut out = Vec::new();
    for hit in hits {
        let sql = format!(
            "SELECT m.id as memory_id, m.kind, m.title, m.body_text, m.tags_text, m.session_id,
                    s.project, m.created_at, m.updated_at
             FROM memory_items m
             JOIN sessions s ON s.id = m.session_id
             WHERE m.id = ?1 AND m.active = 1
               AND (?2 IS NULL OR m.kind = ?2)
               AND (?3 IS NULL OR m.session_id = ?3)
               AND {project}
               AND (?6 IS NULL OR m.updated_at >= ?6)",
            project = project_predicate_sql(),
        );
        let mut stmt = conn.prepare(&sql)?;
        let found = stmt
            .query_map(
                params![hit.memory_id, filters.kind, filters.session_id, 0i64, filters.project, filters.since],
                row_to_recall_row,
            )?
            .next();

        if let Some(row) = found {
            out.push(RankedMemory { row: row?, score: hit.similarity });
        }
    }
    Ok(out)
}

/// Fuzzy fallback (§4.4): scores recent active candidates by
/// `max(token_overlap_fraction, sequence_matcher_ratio)` against the query,
/// accepting only matches scoring at or above [`FUZZY_ACCEPT_THRESHOLD`].
pub fn fuzzy_candidates(conn: &Connection, query: &str, limit: usize, filters: &RecallFilters, scan_window: usize) -> Result<Vec<RankedMemory>> {
    let query_tokens = normalize_words(query.split_whitespace());

    let sql = format!(
        "SELECT m.id as memory_id, m.kind, m.title, m.body_text, m.tags_text, m.session_id,
                s.project, m.created_at, m.updated_at
         FROM memory_items m
         JOIN sessions s ON s.id = m.session_id
         WHERE m.active = 1
           AND (?1 IS NULL OR m.kind = ?1)
           AND (?2 IS NULL OR m.session_id = ?2)
           AND {project}
           AND (?5 IS NULL OR m.updated_at >= ?5)
         ORDER BY m.updated_at DESC
         LIMIT ?6",
        project = project_predicate_sql(),
    );

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        params![filters.kind, filters.session_id, 0i64, filters.project, filters.since, scan_window as i64],
        row_to_recall_row,
    )?;

    let mut out = Vec::new();
    for row in rows {
        let row = row?;
        let haystack = format!("{} {}", row.title, row.body_text);
        let score = token_overlap_fraction(&query_tokens, &haystack).max(sequence_matcher_ratio(query, &row.title));
        if score >= FUZZY_ACCEPT_THRESHOLD {
            out.push(RankedMemory { row, score });
        }
    }
    out.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    out.truncate(limit);
    Ok(out)
}

/// Deduplicate candidates from multiple sources by `memory_id`, keeping the
/// highest-scoring occurrence.
pub fn dedup_by_memory_id(mut candidates: Vec<RankedMemory>) -> Vec<RankedMemory> {
    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    let mut seen = BTreeSet::new();
    candidates.retain(|c| seen.insert(c.row.memory_id));
    candidates
}

/// Apply query-class-specific reranking and recency clipping (§4.4).
/// `merged` must already be deduplicated.
pub fn rerank_for_class(class: QueryClass, mut merged: Vec<RankedMemory>) -> Vec<RankedMemory> {
    match class {
        QueryClass::Task => {
            merged.retain(|c| days_ago(&c.row.updated_at) <= TASK_RECENCY_DAYS);
            merged.sort_by(|a, b| {
                let rank_a = kind_rank(&a.row.kind, TASK_KIND_PRIORITY);
                let rank_b = kind_rank(&b.row.kind, TASK_KIND_PRIORITY);
                rank_a.cmp(&rank_b).then_with(|| b.row.updated_at.cmp(&a.row.updated_at))
            });
        }
        QueryClass::Recall => {
            merged.sort_by(|a, b| {
                let rank_a = kind_rank(&a.row.kind, RECALL_KIND_PRIORITY);
                let rank_b = kind_rank(&b.row.kind, RECALL_KIND_PRIORITY);
                rank_a.cmp(&rank_b).then_with(|| b.row.updated_at.cmp(&a.row.updated_at))
            });
        }
        QueryClass::Default => {
            for c in &mut merged {
                c.score = merged_rerank_score(c.score, days_ago(&c.row.updated_at), &c.row.kind);
            }
            merged.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

            let recent: Vec<_> = merged.iter().filter(|c| days_ago(&c.row.updated_at) <= RECALL_RECENCY_DAYS).cloned().collect();
            if !recent.is_empty() {
                merged = recent;
            }
        }
    }
    merged
}

/// Timeline expansion (§4.4): fetch `depth_before` preceding and
/// `depth_after` succeeding items from the anchor's session, chronologically
/// ordered with the anchor included.
pub fn timeline_expand(conn: &Connection, anchor_id: i64, depth_before: usize, depth_after: usize) -> Result<Vec<MemoryItem>> {
    use super::store::row_to_memory_item;

    let Some(anchor) = super::store::get_memory_item(conn, anchor_id)? else {
        return Ok(Vec::new());
    };

    let select_cols = "id, session_id, kind, title, body_text, subtitle, facts, concepts, files_read,
                files_modified, prompt_number, user_prompt_id, confidence, tags_text, active,
                created_at, updated_at, deleted_at, rev, metadata, import_key";

    let mut before_stmt = conn.prepare(&format!(
        "SELECT {select_cols} FROM memory_items
         WHERE session_id = ?1 AND active = 1 AND created_at < ?2
         ORDER BY created_at DESC LIMIT ?3"
    ))?;
    let mut before: Vec<MemoryItem> = before_stmt
        .query_map(params![anchor.session_id, anchor.created_at, depth_before as i64], row_to_memory_item)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    before.reverse();

    let mut after_stmt = conn.prepare(&format!(
        "SELECT {select_cols} FROM memory_items
         WHERE session_id = ?1 AND active = 1 AND created_at > ?2
         ORDER BY created_at ASC LIMIT ?3"
    ))?;
    let after: Vec<MemoryItem> = after_stmt
        .query_map(params![anchor.session_id, anchor.created_at, depth_after as i64], row_to_memory_item)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut timeline = before;
    timeline.push(anchor);
    timeline.extend(after);
    Ok(timeline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::store::{remember, RememberOptions};
    use crate::db::schema::run_all_migrations;

    fn seed_session(conn: &Connection, project: &str) -> i64 {
        conn.execute(
            "INSERT INTO sessions (started_at, cwd, user, project) VALUES ('2024-01-01T00:00:00Z', '/tmp', 'u', ?1)",
            params![project],
        )
        .unwrap();
        conn.last_insert_rowid()
    }

    #[test]
    fn classify_query_detects_task_keywords() {
        assert_eq!(classify_query("what's still pending"), QueryClass::Task);
        assert_eq!(classify_query("remember what we discussed"), QueryClass::Recall);
        assert_eq!(classify_query("login flow"), QueryClass::Default);
    }

    #[test]
    fn build_fts_match_strips_boolean_keywords() {
        let m = build_fts_match("login and session").unwrap();
        assert!(!m.to_lowercase().contains("\"and\""));
        assert!(m.contains("login"));
        assert!(m.contains("session"));
    }

    #[test]
    fn build_fts_match_empty_for_only_keywords() {
        assert!(build_fts_match("and or not").is_none());
    }

    #[test]
    fn fts_candidates_finds_matching_memory_and_respects_project_filter() {
        let conn = Connection::open_in_memory().unwrap();
        run_all_migrations(&conn).unwrap();
        let session_id = seed_session(&conn, "alpha");
        remember(&conn, session_id, "note", "Fix login bug", "investigated the auth flow", 0.9, "dev-a", RememberOptions::default()).unwrap();

        let hits = fts_candidates(&conn, "login", 10, &RecallFilters::default()).unwrap();
        assert_eq!(hits.len(), 1);

        let filtered = fts_candidates(
            &conn,
            "login",
            10,
            &RecallFilters { project: Some("beta".to_string()), ..Default::default() },
        )
        .unwrap();
        assert!(filtered.is_empty());
    }

    #[test]
    fn dedup_by_memory_id_keeps_highest_score() {
        let row = RecallRow {
            memory_id: 1,
            kind: "note".into(),
            title: "t".into(),
            body_text: "b".into(),
            tags_text: "".into(),
            session_id: 1,
            project: None,
            created_at: "2024-01-01T00:00:00Z".into(),
            updated_at: "2024-01-01T00:00:00Z".into(),
        };
        let candidates = vec![
            RankedMemory { row: row.clone(), score: 0.2 },
            RankedMemory { row, score: 0.9 },
        ];
        let deduped = dedup_by_memory_id(candidates);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].score, 0.9);
    }

    #[test]
    fn timeline_expand_includes_anchor_between_neighbors() {
        let conn = Connection::open_in_memory().unwrap();
        run_all_migrations(&conn).unwrap();
        let session_id = seed_session(&conn, "alpha");

        let mut ids = Vec::new();
        for i in 0..5 {
            let id = remember(&conn, session_id, "note", &format!("item {i}"), "b", 1.0, "dev-a", RememberOptions::default()).unwrap();
            conn.execute(
                "UPDATE memory_items SET created_at = ?1 WHERE id = ?2",
                params![format!("2024-01-0{}T00:00:00Z", i + 1), id],
            )
            .unwrap();
            ids.push(id);
        }

        let timeline = timeline_expand(&conn, ids[2], 1, 1).unwrap();
        assert_eq!(timeline.len(), 3);
        assert_eq!(timeline[1].id, ids[2]);
    }
}
