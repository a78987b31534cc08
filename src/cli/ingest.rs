// Ingest entrypoint (§6 "An ingest entrypoint reading a JSON payload from
// stdin"): the one place an editor/agent plugin's events enter the store.
// Thin by design — it only knows how to turn stdin JSON into
// `raw_events::record_batch` calls; everything downstream (flush, Observer,
// memory writes) is the sweeper's and pipeline's job, not this command's.

use codemem::config::Config;
use codemem::db::pool::DatabasePool;
use codemem::error::{Error, Result};
use codemem::raw_events::{record_batch, start_session, RawEventInput, RecordBatchResult};
use serde::Deserialize;
use serde_json::Value;
use std::io::Read;

#[derive(Debug, Deserialize)]
pub(super) struct IngestEvent {
    event_id: String,
    event_type: String,
    #[serde(default)]
    payload: Value,
    ts_wall_ms: Option<i64>,
    ts_mono_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub(super) struct IngestPayload {
    opencode_session_id: String,
    cwd: Option<String>,
    project: Option<String>,
    started_at: Option<String>,
    #[serde(default)]
    events: Vec<IngestEvent>,
}

/// Registers/refreshes the raw-event session row if descriptive fields are
/// present, then records every event in the batch. Shared by the one-shot
/// `ingest` command and `mcp`/`serve`'s per-line forwarding.
pub(super) async fn ingest_payload(pool: &DatabasePool, payload: IngestPayload) -> Result<RecordBatchResult> {
    let opencode_session_id = payload.opencode_session_id.clone();

    if payload.cwd.is_some() || payload.project.is_some() || payload.started_at.is_some() {
        let started_at = payload.started_at.clone().unwrap_or_else(codemem::utils::now_rfc3339);
        let cwd = payload.cwd.clone();
        let project = payload.project.clone();
        let session_id = opencode_session_id.clone();
        pool.run(move |conn| start_session(conn, &session_id, cwd.as_deref(), project.as_deref(), &started_at)).await?;
    }

    let events: Vec<RawEventInput> = payload
        .events
        .into_iter()
        .map(|e| RawEventInput {
            event_id: e.event_id,
            event_type: e.event_type,
            payload: e.payload,
            ts_wall_ms: e.ts_wall_ms,
            ts_mono_ms: e.ts_mono_ms,
        })
        .collect();

    pool.run(move |conn| record_batch(conn, &opencode_session_id, &events)).await
}

/// Reads one JSON payload from stdin and prints the resulting counters as
/// JSON to stdout.
pub async fn run_ingest(config: &Config) -> Result<()> {
    let mut raw = String::new();
    std::io::stdin().read_to_string(&mut raw).map_err(Error::Io)?;
    let payload: IngestPayload =
        serde_json::from_str(&raw).map_err(|e| Error::InvalidInput(format!("malformed ingest payload: {e}")))?;

    let pool = DatabasePool::open_light(&config.db_path()).await?;
    let result = ingest_payload(&pool, payload).await?;

    println!(
        "{}",
        serde_json::json!({
            "inserted": result.inserted,
            "skipped_duplicate": result.skipped_duplicate,
            "skipped_invalid": result.skipped_invalid,
            "skipped_conflict": result.skipped_conflict,
        })
    );
    Ok(())
}
