// Maintenance CLI dispatch (§6 "embed, backfill-tags, ... db prune-..."):
// argument plumbing over `codemem::maintenance` and `codemem::retrieval`, one
// arm per subcommand. Every job here is a one-shot over a lightweight pool,
// matching `DatabasePool::open_light`'s intended call sites.

use super::DbAction;
use codemem::config::Config;
use codemem::db::memory::retrieval::RecallFilters;
use codemem::db::pool::DatabasePool;
use codemem::embeddings::{Embedder, EmbedderConfig};
use codemem::error::Result;
use codemem::identity::DeviceIdentity;
use codemem::maintenance::{
    backfill_discovery_tokens, backfill_tags, backfill_vectors, gate, normalize_projects, prune_memories, prune_observations,
    rename_project, sweep_and_dispatch,
};
use codemem::observer::provider::{HttpObserver, HttpObserverConfig};
use codemem::raw_events::{reliability_report, run_sweep};
use codemem::retrieval::hybrid_recall;

pub async fn run_maintenance(config: &Config, identity: &DeviceIdentity, command: crate::cli::Commands) -> Result<()> {
    use crate::cli::Commands;

    match command {
        Commands::BackfillTags { limit } => {
            let pool = DatabasePool::open_light(&config.db_path()).await?;
            let updated = backfill_tags(&pool, limit).await?;
            println!("backfilled tags on {updated} row(s)");
        }
        Commands::BackfillDiscoveryTokens { limit } => {
            let pool = DatabasePool::open_light(&config.db_path()).await?;
            let updated = backfill_discovery_tokens(&pool, limit).await?;
            println!("backfilled discovery tokens on {updated} row(s)");
        }
        Commands::Embed { limit } => {
            let pool = DatabasePool::open_light(&config.db_path()).await?;
            let embedder_config = EmbedderConfig::from_config(config);
            let model = embedder_config.model.clone();
            let embedder = Embedder::new(embedder_config)?;
            let written = backfill_vectors(&pool, &embedder, &model, limit).await?;
            println!("embedded {written} chunk(s)");
        }
        Commands::FlushRawEvents => {
            let pool = DatabasePool::open(&config.db_path()).await?;
            let observer = HttpObserver::new(HttpObserverConfig::from_config(config))?;
            let report = sweep_and_dispatch(&pool, &observer, &identity.device_id, config).await?;
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({
                "raw_events_deleted": report.sweep.raw_events_deleted,
                "samples_deleted": report.sweep.samples_deleted,
                "batches_recovered": report.sweep.batches_recovered,
                "outcomes": report.outcomes,
            }))?);
        }
        Commands::RawEventsStatus { window_hours } => {
            let pool = DatabasePool::open_light(&config.db_path()).await?;
            let report = pool.run(move |conn| reliability_report(conn, window_hours)).await?;
            println!(
                "{}",
                serde_json::json!({
                    "flush_success_rate": report.flush_success_rate,
                    "dropped_event_rate": report.dropped_event_rate,
                    "session_boundary_accuracy": report.session_boundary_accuracy,
                    "retry_depth_max": report.retry_depth_max,
                })
            );
        }
        Commands::RawEventsRetry => {
            let pool = DatabasePool::open_light(&config.db_path()).await?;
            let raw_ttl = config.retention_raw_event_days as i64;
            let sample_ttl = config.retention_ingest_sample_days as i64;
            let report = pool
                .run(move |conn| {
                    run_sweep(
                        conn,
                        raw_ttl,
                        sample_ttl,
                        codemem::maintenance::STUCK_THRESHOLD_MINUTES,
                        codemem::maintenance::IDLE_THRESHOLD_MINUTES,
                    )
                })
                .await?;
            println!(
                "{}",
                serde_json::json!({
                    "raw_events_deleted": report.raw_events_deleted,
                    "samples_deleted": report.samples_deleted,
                    "batches_recovered": report.batches_recovered,
                    "sessions_needing_flush": report.sessions_needing_flush,
                })
            );
        }
        Commands::RawEventsGate { window_hours } => {
            let pool = DatabasePool::open_light(&config.db_path()).await?;
            let result = gate(&pool, config, window_hours).await?;
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({
                "passed": result.passed,
                "failures": result.failures,
                "flush_success_rate": result.report.flush_success_rate,
                "dropped_event_rate": result.report.dropped_event_rate,
                "session_boundary_accuracy": result.report.session_boundary_accuracy,
                "retry_depth_max": result.report.retry_depth_max,
            }))?);
            if !result.passed {
                std::process::exit(1);
            }
        }
        Commands::PackBenchmark { context, limit, token_budget } => {
            let pool = DatabasePool::open_light(&config.db_path()).await?;
            let recall = hybrid_recall(&pool, None, &context, limit, RecallFilters::default()).await?;
            let ids: Vec<i64> = recall.items.iter().map(|r| r.row.memory_id).collect();
            let semantic_ids: std::collections::BTreeSet<i64> = ids.iter().copied().collect();
            let items = pool
                .run(move |conn| {
                    let mut out = Vec::with_capacity(ids.len());
                    for id in ids {
                        if let Some(item) = codemem::db::memory::get_memory_item(conn, id)? {
                            out.push(item);
                        }
                    }
                    Ok::<_, codemem::error::Error>(out)
                })
                .await?;
            let pack = codemem::db::memory::assemble_pack(&items, &context, token_budget, &semantic_ids);
            println!(
                "{}",
                serde_json::json!({
                    "summary_count": pack.summary.len(),
                    "timeline_count": pack.timeline.len(),
                    "observation_count": pack.observations.len(),
                    "pack_tokens": pack.metrics.pack_tokens,
                    "work_tokens_unique": pack.metrics.work_tokens_unique,
                    "tokens_saved": pack.metrics.tokens_saved,
                    "compression_ratio": pack.metrics.compression_ratio,
                    "semantic_candidates": pack.metrics.semantic_candidates,
                    "semantic_hits": pack.metrics.semantic_hits,
                })
            );
        }
        Commands::HybridEval { context, limit } => {
            let pool = DatabasePool::open_light(&config.db_path()).await?;
            let recall = hybrid_recall(&pool, None, &context, limit, RecallFilters::default()).await?;
            println!(
                "{}",
                serde_json::json!({
                    "class": format!("{:?}", recall.class),
                    "semantic_candidates": recall.semantic_candidates,
                    "hits": recall.items.iter().map(|r| serde_json::json!({
                        "memory_id": r.row.memory_id,
                        "kind": r.row.kind,
                        "title": r.row.title,
                        "score": r.score,
                    })).collect::<Vec<_>>(),
                })
            );
        }
        Commands::Db { action } => run_db(config, identity, action).await?,
        _ => unreachable!("run_maintenance called with a non-maintenance command"),
    }
    Ok(())
}

async fn run_db(config: &Config, identity: &DeviceIdentity, action: DbAction) -> Result<()> {
    let pool = DatabasePool::open_light(&config.db_path()).await?;
    match action {
        DbAction::PruneObservations { older_than_days, min_confidence, limit } => {
            let pruned = prune_observations(&pool, &identity.device_id, older_than_days, min_confidence, limit).await?;
            println!("pruned {pruned} observation(s)");
        }
        DbAction::PruneMemories { older_than_days, min_confidence, limit } => {
            let pruned = prune_memories(&pool, &identity.device_id, older_than_days, min_confidence, limit).await?;
            println!("pruned {pruned} memory item(s)");
        }
        DbAction::NormalizeProjects => {
            let updated = normalize_projects(&pool).await?;
            println!("normalized {updated} session project value(s)");
        }
        DbAction::RenameProject { from, to } => {
            let updated = rename_project(&pool, &from, &to).await?;
            println!("renamed project on {updated} session(s)");
        }
    }
    Ok(())
}
