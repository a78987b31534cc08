// Pack assembly (§4.5): three labeled sections built from deduplicated
// retrieval candidates, budget-enforced, with savings metrics recorded as a
// usage event.

use super::ranking::{estimated_token_cost, kind_rank, PACK_KIND_PRIORITY};
use crate::db::types::MemoryItem;
use crate::error::Result;
use crate::utils::now_rfc3339;
use crate::utils::text::normalize_words;
use rusqlite::{params, Connection};
use std::collections::{BTreeMap, BTreeSet};

pub const TIMELINE_MAX_ITEMS: usize = 3;

#[derive(Debug, Clone)]
pub struct PackItem {
    pub memory_id: i64,
    pub kind: String,
    pub title: String,
    pub body_text: String,
    pub token_cost: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PackMetrics {
    pub work_tokens_unique: i64,
    pub pack_tokens: i64,
    pub tokens_saved: i64,
    pub avoided_work_saved: i64,
    pub compression_ratio: f64,
    pub semantic_candidates: usize,
    pub semantic_hits: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Pack {
    pub summary: Vec<PackItem>,
    pub timeline: Vec<PackItem>,
    pub observations: Vec<PackItem>,
    pub metrics: PackMetrics,
}

impl Pack {
    pub fn all_items(&self) -> impl Iterator<Item = &PackItem> {
        self.summary.iter().chain(self.timeline.iter()).chain(self.observations.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.summary.is_empty() && self.timeline.is_empty() && self.observations.is_empty()
    }
}

fn to_pack_item(item: &MemoryItem) -> PackItem {
    PackItem {
        memory_id: item.id,
        kind: item.kind.clone(),
        title: item.title.clone(),
        body_text: item.body_text.clone(),
        token_cost: estimated_token_cost(&item.body_text),
    }
}

fn discovery_group(item: &MemoryItem) -> String {
    item.metadata
        .get("discovery_group")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("session:{}", item.session_id))
}

/// `work_tokens_unique`: sum, over distinct discovery groups, of the largest
/// estimated token cost among that group's candidates.
fn work_tokens_unique(candidates: &[MemoryItem]) -> i64 {
    let mut max_per_group: BTreeMap<String, i64> = BTreeMap::new();
    for item in candidates {
        let cost = estimated_token_cost(&item.body_text) as i64;
        let entry = max_per_group.entry(discovery_group(item)).or_insert(0);
        *entry = (*entry).max(cost);
    }
    max_per_group.values().sum()
}

/// Sum, over distinct discovery groups, of the largest *reported*
/// `discovery_tokens` among that group's candidates; groups with no reported
/// value contribute nothing (there's no known figure to compare against).
fn known_discovery_tokens_sum(candidates: &[MemoryItem]) -> i64 {
    let mut max_per_group: BTreeMap<String, i64> = BTreeMap::new();
    for item in candidates {
        if let Some(tokens) = item.metadata.get("discovery_tokens").and_then(|v| v.as_i64()) {
            let entry = max_per_group.entry(discovery_group(item)).or_insert(0);
            *entry = (*entry).max(tokens);
        }
    }
    max_per_group.values().sum()
}

fn tag_overlap(tags_text: &str, context_tokens: &BTreeSet<String>) -> usize {
    tags_text.split_whitespace().filter(|t| context_tokens.contains(*t)).count()
}

/// Walk sections in Summary -> Timeline -> Observations order, accumulating
/// estimated token cost, stopping once the next item would exceed `budget` —
/// but only after at least one item has already been emitted, so a single
/// oversized item still gets through rather than producing an empty pack.
fn apply_budget(summary: Vec<PackItem>, timeline: Vec<PackItem>, observations: Vec<PackItem>, budget: usize) -> (Vec<PackItem>, Vec<PackItem>, Vec<PackItem>) {
    let mut total = 0usize;
    let mut emitted_any = false;
    let mut out = (Vec::new(), Vec::new(), Vec::new());

    macro_rules! fill {
        ($items:expr, $out:expr) => {
            for item in $items {
                if emitted_any && total + item.token_cost > budget {
                    return out;
                }
                total += item.token_cost;
                emitted_any = true;
                $out.push(item);
            }
        };
    }

    fill!(summary, out.0);
    fill!(timeline, out.1);
    fill!(observations, out.2);
    out
}

/// Assemble a pack from deduplicated candidates (§4.5). `semantic_candidate_ids`
/// is the set of memory ids the semantic leg of retrieval surfaced, used only
/// to compute the `semantic_hits` overlap metric.
pub fn assemble_pack(candidates: &[MemoryItem], context: &str, token_budget: Option<usize>, semantic_candidate_ids: &BTreeSet<i64>) -> Pack {
    let context_tokens: BTreeSet<String> = normalize_words(context.split_whitespace()).into_iter().collect();

    let mut summary_candidates: Vec<&MemoryItem> = candidates.iter().filter(|m| m.kind == "session_summary").collect();
    summary_candidates.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    let summary_items: Vec<PackItem> = summary_candidates.into_iter().take(1).map(to_pack_item).collect();

    let mut timeline_candidates: Vec<&MemoryItem> = candidates.iter().filter(|m| m.kind != "session_summary").collect();
    timeline_candidates.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    let timeline_candidates: Vec<&MemoryItem> = timeline_candidates.into_iter().take(TIMELINE_MAX_ITEMS).collect();
    let timeline_ids: BTreeSet<i64> = timeline_candidates.iter().map(|m| m.id).collect();
    let timeline_items: Vec<PackItem> = timeline_candidates.iter().map(|m| to_pack_item(m)).collect();

    let mut observation_candidates: Vec<&MemoryItem> =
        candidates.iter().filter(|m| m.kind != "session_summary" && !timeline_ids.contains(&m.id)).collect();
    observation_candidates.sort_by(|a, b| {
        kind_rank(&a.kind, PACK_KIND_PRIORITY)
            .cmp(&kind_rank(&b.kind, PACK_KIND_PRIORITY))
            .then_with(|| tag_overlap(&b.tags_text, &context_tokens).cmp(&tag_overlap(&a.tags_text, &context_tokens)))
            .then_with(|| b.updated_at.cmp(&a.updated_at))
    });
    let observation_items: Vec<PackItem> = observation_candidates.iter().map(|m| to_pack_item(m)).collect();

    let (summary, timeline, observations) = match token_budget {
        Some(budget) => apply_budget(summary_items, timeline_items, observation_items, budget),
        None => (summary_items, timeline_items, observation_items),
    };

    let pack_tokens: i64 = summary.iter().chain(timeline.iter()).chain(observations.iter()).map(|i| i.token_cost as i64).sum();
    let work_tokens_unique = work_tokens_unique(candidates);
    let tokens_saved = (work_tokens_unique - pack_tokens).max(0);
    let avoided_work_saved = (known_discovery_tokens_sum(candidates) - pack_tokens).max(0);
    let compression_ratio = if work_tokens_unique > 0 { pack_tokens as f64 / work_tokens_unique as f64 } else { 0.0 };

    let pack_ids: BTreeSet<i64> = summary.iter().chain(timeline.iter()).chain(observations.iter()).map(|i| i.memory_id).collect();
    let semantic_hits = pack_ids.intersection(semantic_candidate_ids).count();

    Pack {
        summary,
        timeline,
        observations,
        metrics: PackMetrics {
            work_tokens_unique,
            pack_tokens,
            tokens_saved,
            avoided_work_saved,
            compression_ratio,
            semantic_candidates: semantic_candidate_ids.len(),
            semantic_hits,
        },
    }
}

/// Record a `UsageEvent{event="pack", ...}` row for a pack's metrics, unless
/// the caller opted out with `log_usage=false`.
pub fn record_pack_usage(conn: &Connection, pack: &Pack, log_usage: bool) -> Result<()> {
    if !log_usage {
        return Ok(());
    }

    let metadata = serde_json::json!({
        "work_tokens_unique": pack.metrics.work_tokens_unique,
        "compression_ratio": pack.metrics.compression_ratio,
        "avoided_work_saved": pack.metrics.avoided_work_saved,
        "semantic_candidates": pack.metrics.semantic_candidates,
        "semantic_hits": pack.metrics.semantic_hits,
        "summary_count": pack.summary.len(),
        "timeline_count": pack.timeline.len(),
        "observation_count": pack.observations.len(),
    });

    conn.execute(
        "INSERT INTO usage_events (event, tokens_read, tokens_written, tokens_saved, metadata, created_at)
         VALUES ('pack', 0, ?1, ?2, ?3, ?4)",
        params![pack.metrics.pack_tokens, pack.metrics.tokens_saved, serde_json::to_string(&metadata)?, now_rfc3339()],
    )?;
    Ok(())
}
