// Maintenance jobs (§4.7, §9, §6): backfill and prune passes over rows
// written before a feature existed, plus the sweep-to-flush dispatch loop
// and the reliability gate. Mirrors the shape of the teacher's idle-time
// `background::BackgroundWorker` (periodic, pool-driven, counts what it
// did) but as a set of one-shot jobs a CLI subcommand or the sync daemon
// tick calls directly, since there is no LLM-driven "scan for new work"
// concern here — only deterministic backlog drains with known work-lists.

use crate::config::Config;
use crate::db::memory::store::get_memory_item;
use crate::db::memory::tags::derive_tags;
use crate::db::memory::vectors::{ids_missing_vectors, upsert_chunk};
use crate::db::pool::DatabasePool;
use crate::embeddings::{chunk_content, content_hash, Embedder};
use crate::error::Result;
use crate::observer::pipeline::{run_flush, FlushOutcome, FlushRequest};
use crate::observer::provider::Observer;
use crate::raw_events::reliability::{reliability_report, ReliabilityReport};
use crate::raw_events::sweeper::{run_sweep, SweepReport};
use crate::replication::migrate::{backfill_replication_ops, migrate_legacy_import_keys};
use crate::utils::now_rfc3339;
use rusqlite::{params, Connection, OptionalExtension};

const EMBED_CHUNK_CHARS: usize = 2_000;
const EMBED_CHUNK_OVERLAP: usize = 200;

/// Recomputes `tags_text` for rows that carry none, via the same
/// `derive_tags` logic `remember` runs at write time. Idempotent: a second
/// pass over an already-tagged corpus touches nothing (§8 round-trip law).
pub async fn backfill_tags(pool: &DatabasePool, limit: usize) -> Result<usize> {
    pool.run(move |conn| backfill_tags_sync(conn, limit)).await
}

fn backfill_tags_sync(conn: &Connection, limit: usize) -> Result<usize> {
    let mut stmt = conn.prepare(
        "SELECT id, title, concepts, files_read, files_modified FROM memory_items
         WHERE tags_text = '' OR tags_text IS NULL
         LIMIT ?1",
    )?;
    let rows: Vec<(i64, String, String, String, String)> = stmt
        .query_map(params![limit as i64], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut updated = 0;
    for (id, title, concepts_json, files_read_json, files_modified_json) in rows {
        let concepts: Vec<String> = serde_json::from_str(&concepts_json).unwrap_or_default();
        let files_read: Vec<String> = serde_json::from_str(&files_read_json).unwrap_or_default();
        let files_modified: Vec<String> = serde_json::from_str(&files_modified_json).unwrap_or_default();
        let tags = derive_tags(&title, &concepts, &files_read, &files_modified);
        if tags.is_empty() {
            continue;
        }
        conn.execute("UPDATE memory_items SET tags_text = ?1 WHERE id = ?2", params![tags, id])?;
        updated += 1;
    }
    Ok(updated)
}

/// Stamps `metadata.discovery_tokens` on observer-sourced memory rows that
/// predate the field (or whose observer call didn't report usage), using
/// the same per-item fallback `observer::pipeline::persist_observer_result`
/// uses for uninstrumented responses.
pub async fn backfill_discovery_tokens(pool: &DatabasePool, limit: usize) -> Result<usize> {
    pool.run(move |conn| backfill_discovery_tokens_sync(conn, limit)).await
}

fn backfill_discovery_tokens_sync(conn: &Connection, limit: usize) -> Result<usize> {
    use crate::db::memory::ranking::estimated_token_cost;

    let mut stmt = conn.prepare(
        "SELECT id, body_text, metadata FROM memory_items
         WHERE metadata LIKE '%discovery_group%' AND metadata NOT LIKE '%discovery_tokens%'
         LIMIT ?1",
    )?;
    let rows: Vec<(i64, String, String)> = stmt
        .query_map(params![limit as i64], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut updated = 0;
    for (id, body_text, metadata_json) in rows {
        let mut metadata: serde_json::Value = serde_json::from_str(&metadata_json).unwrap_or(serde_json::Value::Null);
        let Some(map) = metadata.as_object_mut() else { continue };
        map.insert("discovery_tokens".to_string(), serde_json::json!(estimated_token_cost(&body_text)));
        conn.execute(
            "UPDATE memory_items SET metadata = ?1 WHERE id = ?2",
            params![serde_json::to_string(&metadata)?, id],
        )?;
        updated += 1;
    }
    Ok(updated)
}

/// Embeds and stores vectors for active memory rows missing one under
/// `model`, via the same async/sync split the Observer Pipeline uses: list
/// the work under one connection, call the embeddings API without holding
/// it, then write the chunks back under a second connection.
pub async fn backfill_vectors(pool: &DatabasePool, embedder: &Embedder, model: &str, limit: usize) -> Result<usize> {
    let model_owned = model.to_string();
    let targets: Vec<(i64, String, String)> = {
        let model_owned = model_owned.clone();
        pool.run(move |conn| -> Result<_> {
            let ids = ids_missing_vectors(conn, &model_owned, limit)?;
            let mut out = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(item) = get_memory_item(conn, id)? {
                    out.push((id, item.title, item.body_text));
                }
            }
            Ok(out)
        })
        .await?
    };

    if targets.is_empty() {
        return Ok(0);
    }

    let mut chunk_sets: Vec<(i64, Vec<String>)> = Vec::with_capacity(targets.len());
    let mut flattened = Vec::new();
    for (id, title, body) in &targets {
        let chunks = chunk_content(title, body, EMBED_CHUNK_CHARS, EMBED_CHUNK_OVERLAP);
        flattened.extend(chunks.clone());
        chunk_sets.push((*id, chunks));
    }

    let embeddings = embedder.embed_batch(&flattened).await?;

    let mut cursor = 0usize;
    let mut writes: Vec<(i64, i64, String, Vec<f32>)> = Vec::new();
    for (id, chunks) in chunk_sets {
        for (chunk_index, chunk) in chunks.iter().enumerate() {
            let embedding = embeddings.get(cursor).cloned().unwrap_or_default();
            writes.push((id, chunk_index as i64, content_hash(chunk), embedding));
            cursor += 1;
        }
    }

    let model_for_write = model_owned;
    pool.run(move |conn| -> Result<usize> {
        let mut written = 0;
        for (memory_id, chunk_index, hash, embedding) in writes {
            if upsert_chunk(conn, memory_id, chunk_index, &model_for_write, &hash, &embedding)? {
                written += 1;
            }
        }
        Ok(written)
    })
    .await
}

/// Soft-deletes `observation`-kind rows older than `older_than_days` with
/// confidence below `min_confidence`, the same way `forget` deletes any
/// other memory: a `deleted_at` stamp and a replication `delete` op, never
/// a hard row removal (so it still converges across devices under LWW).
pub async fn prune_observations(pool: &DatabasePool, device_id: &str, older_than_days: i64, min_confidence: f64, limit: usize) -> Result<usize> {
    let device_id = device_id.to_string();
    pool.run(move |conn| prune_sync(conn, &device_id, "observation", older_than_days, min_confidence, limit)).await
}

/// Soft-deletes any active memory row older than `older_than_days` with
/// confidence below `min_confidence`, regardless of kind.
pub async fn prune_memories(pool: &DatabasePool, device_id: &str, older_than_days: i64, min_confidence: f64, limit: usize) -> Result<usize> {
    let device_id = device_id.to_string();
    pool.run(move |conn| prune_sync(conn, &device_id, "%", older_than_days, min_confidence, limit)).await
}

fn prune_sync(conn: &Connection, device_id: &str, kind_pattern: &str, older_than_days: i64, min_confidence: f64, limit: usize) -> Result<usize> {
    use crate::db::memory::forget;

    let cutoff = (chrono::Utc::now() - chrono::Duration::days(older_than_days)).to_rfc3339();
    let mut stmt = conn.prepare(
        "SELECT id FROM memory_items
         WHERE active = 1 AND kind LIKE ?1 AND confidence < ?2 AND created_at < ?3
         LIMIT ?4",
    )?;
    let ids: Vec<i64> = stmt
        .query_map(params![kind_pattern, min_confidence, cutoff, limit as i64], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut pruned = 0;
    for id in ids {
        forget(conn, id, device_id)?;
        pruned += 1;
    }
    Ok(pruned)
}

/// Collapses `project` values down to their basename (e.g. `/home/u/proj`
/// and `proj` become the same project) across `sessions`, for rows recorded
/// before the ingest path started normalizing at write time.
pub async fn normalize_projects(pool: &DatabasePool) -> Result<usize> {
    pool.run(normalize_projects_sync).await
}

fn normalize_projects_sync(conn: &Connection) -> Result<usize> {
    let mut stmt = conn.prepare("SELECT DISTINCT project FROM sessions WHERE project IS NOT NULL")?;
    let projects: Vec<String> = stmt.query_map([], |row| row.get(0))?.collect::<rusqlite::Result<Vec<_>>>()?;

    let mut updated = 0;
    for project in projects {
        let basename = project.rsplit(['/', '\\']).next().unwrap_or(&project).to_string();
        if basename == project || basename.is_empty() {
            continue;
        }
        updated += conn.execute("UPDATE sessions SET project = ?1 WHERE project = ?2", params![basename, project])?;
    }
    Ok(updated)
}

/// Renames one project across every session that carries it.
pub async fn rename_project(pool: &DatabasePool, from: &str, to: &str) -> Result<usize> {
    let (from, to) = (from.to_string(), to.to_string());
    pool.run(move |conn| -> Result<usize> { Ok(conn.execute("UPDATE sessions SET project = ?1 WHERE project = ?2", params![to, from])?) })
        .await
}

/// Wraps the two preflight migrations replication keeps under
/// `replication::migrate`: rewriting legacy import keys and emitting ops
/// for rows that predate replication being enabled on this device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplicationMigrationReport {
    pub legacy_keys_rewritten: usize,
    pub ops_backfilled: usize,
}

pub async fn migrate_replication_backlog(pool: &DatabasePool, limit: usize) -> Result<ReplicationMigrationReport> {
    pool.run(move |conn| -> Result<ReplicationMigrationReport> {
        let legacy_keys_rewritten = migrate_legacy_import_keys(conn, limit)?;
        let ops_backfilled = backfill_replication_ops(conn, limit)?;
        Ok(ReplicationMigrationReport { legacy_keys_rewritten, ops_backfilled })
    })
    .await
}

/// Runs the periodic retention/stuck-batch/dispatch sweep (§4.1) and then
/// drives the Observer Pipeline for every session it surfaced, resolving
/// each session's pending range from `raw_event_sessions` directly since
/// the sweeper itself never holds a connection across the Observer's
/// `.await`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepDispatchReport {
    pub sweep: SweepReport,
    pub outcomes: Vec<(String, String)>,
}

pub async fn sweep_and_dispatch(pool: &DatabasePool, observer: &dyn Observer, device_id: &str, config: &Config) -> Result<SweepDispatchReport> {
    let sweep = pool
        .run(move |conn| {
            run_sweep(
                conn,
                config_i64(config.retention_raw_event_days),
                config_i64(config.retention_ingest_sample_days),
                STUCK_THRESHOLD_MINUTES,
                IDLE_THRESHOLD_MINUTES,
            )
        })
        .await?;

    let mut outcomes = Vec::with_capacity(sweep.sessions_needing_flush.len());
    for opencode_session_id in &sweep.sessions_needing_flush {
        let Some(bounds) = pool
            .run({
                let opencode_session_id = opencode_session_id.clone();
                move |conn| session_flush_bounds(conn, &opencode_session_id)
            })
            .await?
        else {
            continue;
        };

        if bounds.start_event_seq > bounds.end_event_seq {
            continue;
        }

        let req = FlushRequest {
            opencode_session_id: opencode_session_id.clone(),
            cwd: bounds.cwd,
            project: bounds.project,
            user: "unknown".to_string(),
            start_event_seq: bounds.start_event_seq,
            end_event_seq: bounds.end_event_seq,
            extractor_version: "v1".to_string(),
            observer_max_chars: config.observer_max_chars,
            observer_max_events: config.observer_max_events,
        };

        let outcome = run_flush(pool, observer, device_id, req).await;
        outcomes.push((opencode_session_id.clone(), describe_outcome(outcome)));
    }

    Ok(SweepDispatchReport { sweep, outcomes })
}

pub const STUCK_THRESHOLD_MINUTES: i64 = 10;
pub const IDLE_THRESHOLD_MINUTES: i64 = 5;

fn config_i64(days: u64) -> i64 {
    days.try_into().unwrap_or(i64::MAX)
}

fn describe_outcome(outcome: Result<FlushOutcome>) -> String {
    match outcome {
        Ok(FlushOutcome::AlreadyCompleted) => "already_completed".to_string(),
        Ok(FlushOutcome::ClaimFailed) => "claim_failed".to_string(),
        Ok(FlushOutcome::TrivialSkip { .. }) => "trivial_skip".to_string(),
        Ok(FlushOutcome::Processed { memory_ids, .. }) => format!("processed:{}", memory_ids.len()),
        Err(e) => format!("error:{e}"),
    }
}

struct SessionFlushBounds {
    cwd: String,
    project: Option<String>,
    start_event_seq: i64,
    end_event_seq: i64,
}

fn session_flush_bounds(conn: &Connection, opencode_session_id: &str) -> Result<Option<SessionFlushBounds>> {
    let row: Option<(Option<String>, Option<String>, i64, i64)> = conn
        .query_row(
            "SELECT cwd, project, last_flushed_event_seq, last_received_event_seq
             FROM raw_event_sessions WHERE opencode_session_id = ?1",
            params![opencode_session_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()?;

    Ok(row.map(|(cwd, project, last_flushed, last_received)| SessionFlushBounds {
        cwd: cwd.unwrap_or_default(),
        project,
        start_event_seq: last_flushed + 1,
        end_event_seq: last_received,
    }))
}

/// Computes the reliability surface and checks it against `Config::gate_*`,
/// for the `raw-events gate` CLI subcommand (§7, §9 open-question decision:
/// thresholds are configuration, not hardcoded).
#[derive(Debug, Clone, PartialEq)]
pub struct GateResult {
    pub report: ReliabilityReport,
    pub passed: bool,
    pub failures: Vec<String>,
}

pub async fn gate(pool: &DatabasePool, config: &Config, window_hours: i64) -> Result<GateResult> {
    let report = pool.run(move |conn| reliability_report(conn, window_hours)).await?;

    let mut failures = Vec::new();
    if report.flush_success_rate < config.gate_success_rate {
        failures.push(format!("flush_success_rate {:.4} < {:.4}", report.flush_success_rate, config.gate_success_rate));
    }
    if report.dropped_event_rate > config.gate_dropped_rate {
        failures.push(format!("dropped_event_rate {:.4} > {:.4}", report.dropped_event_rate, config.gate_dropped_rate));
    }
    if report.session_boundary_accuracy < config.gate_boundary_accuracy {
        failures.push(format!(
            "session_boundary_accuracy {:.4} < {:.4}",
            report.session_boundary_accuracy, config.gate_boundary_accuracy
        ));
    }
    if report.retry_depth_max > config.gate_retry_depth_max {
        failures.push(format!("retry_depth_max {} > {}", report.retry_depth_max, config.gate_retry_depth_max));
    }

    Ok(GateResult { passed: failures.is_empty(), failures, report })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::{remember, RememberOptions};
    use crate::db::schema::run_all_migrations;

    async fn seeded_pool() -> DatabasePool {
        let pool = DatabasePool::open_in_memory().await.unwrap();
        pool.interact(|conn| {
            run_all_migrations(conn)?;
            conn.execute("INSERT INTO sessions (started_at, cwd, user) VALUES (?1, '/tmp', 'u')", params![now_rfc3339()])?;
            Ok::<_, anyhow::Error>(())
        })
        .await
        .unwrap();
        pool
    }

    #[tokio::test]
    async fn backfill_tags_fills_empty_tags_and_is_idempotent() {
        let pool = seeded_pool().await;
        pool.interact(|conn| {
            let mut opts = RememberOptions::default();
            opts.tags = Some(String::new());
            remember(conn, 1, "note", "Fix the login bug", "body", 1.0, "dev-a", opts)?;
            Ok::<_, anyhow::Error>(())
        })
        .await
        .unwrap();

        let updated = backfill_tags(&pool, 100).await.unwrap();
        assert_eq!(updated, 1);

        let second_pass = backfill_tags(&pool, 100).await.unwrap();
        assert_eq!(second_pass, 0);
    }

    #[tokio::test]
    async fn backfill_discovery_tokens_stamps_missing_field() {
        let pool = seeded_pool().await;
        pool.interact(|conn| {
            let opts = RememberOptions {
                metadata: Some(serde_json::json!({"discovery_group": "oc-1:session"})),
                ..Default::default()
            };
            remember(conn, 1, "note", "t", "this body has several words in it", 1.0, "dev-a", opts)?;
            Ok::<_, anyhow::Error>(())
        })
        .await
        .unwrap();

        let updated = backfill_discovery_tokens(&pool, 100).await.unwrap();
        assert_eq!(updated, 1);
    }

    #[tokio::test]
    async fn prune_memories_soft_deletes_low_confidence_old_rows() {
        let pool = seeded_pool().await;
        pool.interact(|conn| {
            remember(conn, 1, "note", "stale", "body", 0.1, "dev-a", RememberOptions::default())?;
            let old = (chrono::Utc::now() - chrono::Duration::days(90)).to_rfc3339();
            conn.execute("UPDATE memory_items SET created_at = ?1", params![old])?;
            Ok::<_, anyhow::Error>(())
        })
        .await
        .unwrap();

        let pruned = prune_memories(&pool, "dev-a", 30, 0.5, 100).await.unwrap();
        assert_eq!(pruned, 1);
    }

    #[tokio::test]
    async fn normalize_projects_collapses_to_basename() {
        let pool = seeded_pool().await;
        pool.interact(|conn| {
            conn.execute("UPDATE sessions SET project = '/home/dev/my-project' WHERE id = 1", [])?;
            Ok::<_, anyhow::Error>(())
        })
        .await
        .unwrap();

        let updated = normalize_projects(&pool).await.unwrap();
        assert_eq!(updated, 1);

        let project: String = pool.interact(|conn| Ok::<_, anyhow::Error>(conn.query_row("SELECT project FROM sessions WHERE id = 1", [], |r| r.get(0))?)).await.unwrap();
        assert_eq!(project, "my-project");
    }

    #[tokio::test]
    async fn rename_project_updates_matching_sessions() {
        let pool = seeded_pool().await;
        pool.interact(|conn| {
            conn.execute("UPDATE sessions SET project = 'old-name' WHERE id = 1", [])?;
            Ok::<_, anyhow::Error>(())
        })
        .await
        .unwrap();

        let renamed = rename_project(&pool, "old-name", "new-name").await.unwrap();
        assert_eq!(renamed, 1);
    }

    #[tokio::test]
    async fn gate_fails_when_success_rate_below_threshold() {
        let pool = seeded_pool().await;
        pool.interact(|conn| {
            crate::raw_events::record(conn, "s1", "e1", "a", &serde_json::json!({}), None, None)?;
            let batch = crate::raw_events::get_or_create_batch(conn, "s1", 1, 1, "v1")?;
            crate::raw_events::claim_batch(conn, batch.id)?;
            crate::raw_events::fail_batch(conn, batch.id)?;
            Ok::<_, anyhow::Error>(())
        })
        .await
        .unwrap();

        let config = Config::default();
        let result = gate(&pool, &config, 24).await.unwrap();
        assert!(!result.passed);
        assert!(result.failures.iter().any(|f| f.contains("flush_success_rate")));
    }

    #[tokio::test]
    async fn sweep_and_dispatch_resolves_bounds_and_advances_cursor() {
        use crate::observer::types::ParsedOutput;
        use async_trait::async_trait;

        struct EmptyObserver;
        #[async_trait]
        impl Observer for EmptyObserver {
            async fn observe(&self, _context: &crate::observer::types::ObserverContext) -> Result<ParsedOutput> {
                Ok(ParsedOutput {
                    observations: vec![],
                    summary: Some(crate::observer::types::ObservedSummary {
                        request: "r".into(),
                        learned: "l".into(),
                        ..Default::default()
                    }),
                    skip_summary_reason: None,
                    usage: None,
                })
            }
        }

        let pool = seeded_pool().await;
        pool.interact(|conn| {
            crate::raw_events::record(conn, "oc-9", "e1", "user.prompt", &serde_json::json!({"text": "do something useful", "prompt_number": 1}), None, Some(1))?;
            conn.execute("UPDATE raw_event_sessions SET last_seen_ts_wall_ms = 1 WHERE opencode_session_id = 'oc-9'", [])?;
            Ok::<_, anyhow::Error>(())
        })
        .await
        .unwrap();

        let config = Config::default();
        let report = sweep_and_dispatch(&pool, &EmptyObserver, "dev-a", &config).await.unwrap();
        assert!(report.sweep.sessions_needing_flush.contains(&"oc-9".to_string()));
        assert_eq!(report.outcomes.len(), 1);
    }
}
