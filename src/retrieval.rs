// Hybrid recall orchestration (§4.4): ties the FTS, semantic, and fuzzy
// candidate generators in `db::memory::retrieval` together behind the
// query-class routing rules. Lives outside `db::` because computing the
// query embedding is an async HTTP call — the same prepare/await/persist
// split `maintenance::backfill_vectors` and the Observer Pipeline use, just
// with the "persist" step replaced by a read.

use crate::db::memory::ranking::RankedMemory;
use crate::db::memory::retrieval::{
    classify_query, dedup_by_memory_id, fts_candidates, fuzzy_candidates, rerank_for_class, semantic_candidates, QueryClass,
    RecallFilters,
};
use crate::db::memory::vectors::nearest;
use crate::db::pool::DatabasePool;
use crate::embeddings::Embedder;
use crate::error::Result;

const FUZZY_SCAN_WINDOW: usize = 200;

/// Result of one hybrid recall call: the routing class it took (useful for
/// callers reporting on retrieval behavior, e.g. `hybrid-eval`), the final
/// reranked items, and how many semantic candidates fed into them.
#[derive(Debug, Clone, PartialEq)]
pub struct HybridRecall {
    pub class: QueryClass,
    pub items: Vec<RankedMemory>,
    pub semantic_candidates: usize,
}

/// Run FTS + semantic + fuzzy-fallback candidate generation, merge, and
/// rerank for `context` (§4.4). `embedder` is `None` when semantic search
/// is unavailable (no embeddings provider configured) — FTS and fuzzy still
/// run, just without a semantic contribution.
pub async fn hybrid_recall(
    pool: &DatabasePool,
    embedder: Option<(&Embedder, &str)>,
    context: &str,
    limit: usize,
    filters: RecallFilters,
) -> Result<HybridRecall> {
    let class = classify_query(context);
    let query_embedding = match embedder {
        Some((embedder, _)) => Some(embedder.embed(context).await?),
        None => None,
    };
    let model = embedder.map(|(_, model)| model.to_string());
    let context_owned = context.to_string();

    pool.run(move |conn| -> Result<HybridRecall> {
        let fts = fts_candidates(conn, &context_owned, limit, &filters)?;

        let semantic = match (&query_embedding, &model) {
            (Some(query_embedding), Some(model)) => {
                let hits = nearest(conn, query_embedding, model, limit)?;
                semantic_candidates(conn, &hits, &filters)?
            }
            _ => Vec::new(),
        };
        let semantic_candidates = semantic.len();

        let mut merged = dedup_by_memory_id(fts.into_iter().chain(semantic).collect());
        if merged.is_empty() {
            merged = fuzzy_candidates(conn, &context_owned, limit, &filters, FUZZY_SCAN_WINDOW)?;
        }

        let mut items = rerank_for_class(class, merged);
        items.truncate(limit);

        Ok(HybridRecall { class, items, semantic_candidates })
    })
    .await
}
