// MCP/viewer surface (§6 "mcp / serve to run the viewer/MCP surface that
// forwards to ingest"). The protocol surface itself (tool schemas, RPC
// framing) is explicitly out of scope (§1 Non-goals: "the CLI surface and
// service-manager integration"); what's in scope is that every call this
// surface receives lands in the same `ingest_payload` path the one-shot
// `ingest` command uses. Runs as a long-lived stdio loop: one JSON object
// per line in, one JSON ack per line out, the same framing `Hook` commands
// in the teacher's CLI use for a process a parent supervises over pipes.

use super::ingest::{ingest_payload, IngestPayload};
use codemem::config::Config;
use codemem::db::pool::DatabasePool;
use codemem::error::Result;
use std::io::{BufRead, Write};

pub async fn run_mcp_server(config: &Config) -> Result<()> {
    let pool = DatabasePool::open(&config.db_path()).await?;
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();

    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let ack = match serde_json::from_str::<IngestPayload>(&line) {
            Ok(payload) => match ingest_payload(&pool, payload).await {
                Ok(result) => serde_json::json!({
                    "ok": true,
                    "inserted": result.inserted,
                    "skipped_duplicate": result.skipped_duplicate,
                    "skipped_invalid": result.skipped_invalid,
                    "skipped_conflict": result.skipped_conflict,
                }),
                Err(e) => serde_json::json!({"ok": false, "error": e.to_user_string()}),
            },
            Err(e) => serde_json::json!({"ok": false, "error": format!("malformed request: {e}")}),
        };

        writeln!(stdout, "{ack}")?;
        stdout.flush()?;
    }

    Ok(())
}
