// db/memory/ranking.rs
// Hybrid retrieval scoring: FTS/semantic/fuzzy combination, kind bonuses,
// recency decay, and pack token-budget accounting.

/// One candidate surfaced by FTS, semantic, or fuzzy search, carrying enough
/// context to be scored and reranked without a second query round-trip.
#[derive(Debug, Clone)]
pub struct RecallRow {
    pub memory_id: i64,
    pub kind: String,
    pub title: String,
    pub body_text: String,
    pub tags_text: String,
    pub session_id: i64,
    pub project: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// A recall row plus its computed score, ready for sort/truncate.
#[derive(Debug, Clone)]
pub struct RankedMemory {
    pub row: RecallRow,
    pub score: f64,
}

/// Kind-priority bonus added to the FTS/merged score. Higher-signal kinds
/// rank above lower-signal ones when other terms are close.
pub fn kind_bonus(kind: &str) -> f64 {
    match kind {
        "session_summary" => 0.25,
        "decision" => 0.20,
        "note" => 0.15,
        "observation" => 0.10,
        "entities" => 0.05,
        _ => 0.0,
    }
}

/// Ordinal rank used when sorting by kind alone (lower sorts first). Mirrors
/// the pack-assembly priority order and the task/recall query-class orders.
pub fn kind_rank(kind: &str, order: &[&str]) -> usize {
    order.iter().position(|k| *k == kind).unwrap_or(order.len())
}

pub const PACK_KIND_PRIORITY: &[&str] = &[
    "decision", "feature", "bugfix", "refactor", "change", "discovery", "exploration", "note",
];

pub const TASK_KIND_PRIORITY: &[&str] = &["note", "decision", "observation"];

pub const RECALL_KIND_PRIORITY: &[&str] = &["session_summary", "decision", "note", "observation"];

/// Recency term with a one-week falloff: `1 / (1 + days_ago / 7)`. A fresh
/// item scores 1.0; a week-old item scores 0.5; decays smoothly after that.
pub fn recency_score(days_ago: f64) -> f64 {
    1.0 / (1.0 + days_ago.max(0.0) / 7.0)
}

/// Transform a vector distance into a bounded similarity in `(0, 1]`.
pub fn semantic_similarity(distance: f32) -> f64 {
    1.0 / (1.0 + distance.max(0.0) as f64)
}

/// Combine a raw FTS5 `bm25()` score (lower is better) with recency and kind
/// bonus into one ascending-is-worse, descending-is-better ranking score.
/// `bm25` is negated because FTS5 reports it as a cost, not a similarity.
pub fn fts_combined_score(bm25: f64, days_ago: f64, kind: &str) -> f64 {
    -bm25 + recency_score(days_ago) + kind_bonus(kind)
}

/// Reranking formula for the default (non task/recall) query class:
/// `score * 1.5 + recency + kind_bonus`.
pub fn merged_rerank_score(base_score: f64, days_ago: f64, kind: &str) -> f64 {
    base_score * 1.5 + recency_score(days_ago) + kind_bonus(kind)
}

/// Fuzzy-fallback acceptance threshold (§4.4): candidates below this score
/// are dropped rather than surfaced as a weak match.
pub const FUZZY_ACCEPT_THRESHOLD: f64 = 0.18;

/// Days a memory was last touched, given an RFC-3339/SQLite-format timestamp.
/// Returns `0.0` (treated as "now") on unparsable input, and clamps negative
/// deltas (clock skew) to zero rather than producing a bonus for the future.
pub fn days_ago(updated_at: &str) -> f64 {
    let parsed = chrono::DateTime::parse_from_rfc3339(updated_at)
        .map(|dt| dt.naive_utc())
        .or_else(|_| chrono::NaiveDateTime::parse_from_str(updated_at, "%Y-%m-%d %H:%M:%S"))
        .or_else(|_| chrono::NaiveDateTime::parse_from_str(updated_at, "%Y-%m-%dT%H:%M:%S"));

    let Ok(dt) = parsed else {
        return 0.0;
    };

    let now = chrono::Utc::now().naive_utc();
    ((now - dt).num_seconds() as f64 / 86400.0).max(0.0)
}

/// Estimated token cost of one pack item's body, per §4.5's pack budgeting
/// rule: `max(8, len(body) / 4)`.
pub fn estimated_token_cost(body_text: &str) -> usize {
    (body_text.len() / 4).max(8)
}

#[cfg(test)]
mod kind_bonus_tests {
    use super::*;

    #[test]
    fn session_summary_outranks_decision() {
        assert!(kind_bonus("session_summary") > kind_bonus("decision"));
    }

    #[test]
    fn unknown_kind_has_no_bonus() {
        assert_eq!(kind_bonus("made_up_kind"), 0.0);
    }

    #[test]
    fn pack_priority_puts_decision_before_note() {
        let decision = kind_rank("decision", PACK_KIND_PRIORITY);
        let note = kind_rank("note", PACK_KIND_PRIORITY);
        assert!(decision < note);
    }

    #[test]
    fn unlisted_kind_sorts_last() {
        let rank = kind_rank("nonsense", PACK_KIND_PRIORITY);
        assert_eq!(rank, PACK_KIND_PRIORITY.len());
    }
}

#[cfg(test)]
mod recency_tests {
    use super::*;

    #[test]
    fn zero_days_ago_scores_one() {
        assert!((recency_score(0.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn one_week_ago_scores_half() {
        assert!((recency_score(7.0) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn negative_days_ago_is_clamped() {
        assert!((recency_score(-5.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn monotonically_decreasing_in_days() {
        assert!(recency_score(1.0) > recency_score(30.0));
        assert!(recency_score(30.0) > recency_score(365.0));
    }
}

#[cfg(test)]
mod semantic_similarity_tests {
    use super::*;

    #[test]
    fn zero_distance_is_perfect_similarity() {
        assert!((semantic_similarity(0.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn larger_distance_is_lower_similarity() {
        assert!(semantic_similarity(0.5) > semantic_similarity(2.0));
    }

    #[test]
    fn negative_distance_is_clamped() {
        assert!((semantic_similarity(-1.0) - 1.0).abs() < 1e-9);
    }
}


#[cfg(test)]
mod days_ago_tests {
    use super::*;

    #[test]
    fn invalid_timestamp_treated_as_now() {
        assert_eq!(days_ago("not-a-date"), 0.0);
    }

    #[test]
    fn rfc3339_parses() {
        let ts = (chrono::Utc::now() - chrono::Duration::days(10)).to_rfc3339();
        let d = days_ago(&ts);
        assert!(d > 9.0 && d < 11.0);
    }

    #[test]
    fn sqlite_default_format_parses() {
        let ts = (chrono::Utc::now() - chrono::Duration::days(3))
            .naive_utc()
            .format("%Y-%m-%d %H:%M:%S")
            .to_string();
        let d = days_ago(&ts);
        assert!(d > 2.0 && d < 4.0);
    }

    #[test]
    fn future_timestamp_is_clamped_to_zero() {
        let ts = (chrono::Utc::now() + chrono::Duration::days(5)).to_rfc3339();
        assert_eq!(days_ago(&ts), 0.0);
    }
}

#[cfg(test)]
mod token_cost_tests {
    use super::*;

    #[test]
    fn short_body_floors_at_eight_tokens() {
        assert_eq!(estimated_token_cost("hi"), 8);
    }

    #[test]
    fn long_body_scales_by_four_chars_per_token() {
        let body = "x".repeat(400);
        assert_eq!(estimated_token_cost(&body), 100);
    }
}
