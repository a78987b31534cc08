// Import/export CLI dispatch (§6 "Import/export of the entity tables as a
// versioned JSON document"). Export writes to stdout, import reads from
// stdin — both sides of the round-trip law §8 describes.

use codemem::config::Config;
use codemem::db::export::{export_all, import_document};
use codemem::error::{Error, Result};
use codemem::identity::DeviceIdentity;
use codemem::db::pool::DatabasePool;
use std::io::Read;

pub async fn run_export(config: &Config) -> Result<()> {
    let pool = DatabasePool::open_light(&config.db_path()).await?;
    let doc = pool.run(export_all).await?;
    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(())
}

pub async fn run_import(config: &Config, identity: &DeviceIdentity) -> Result<()> {
    let mut raw = String::new();
    std::io::stdin().read_to_string(&mut raw).map_err(Error::Io)?;
    let doc: codemem::db::export::ExportDocument =
        serde_json::from_str(&raw).map_err(|e| Error::InvalidInput(format!("malformed export document: {e}")))?;

    let pool = DatabasePool::open_light(&config.db_path()).await?;
    let device_id = identity.device_id.clone();
    let report = pool.run(move |conn| import_document(conn, &doc, &device_id)).await?;

    println!(
        "{}",
        serde_json::json!({
            "sessions_created": report.sessions_created,
            "sessions_matched": report.sessions_matched,
            "user_prompts_inserted": report.user_prompts_inserted,
            "session_summaries_inserted": report.session_summaries_inserted,
            "artifacts_inserted": report.artifacts_inserted,
            "memory_items_applied": report.memory_items_applied,
            "memory_items_skipped": report.memory_items_skipped,
        })
    );
    Ok(())
}

/// Dispatches `export`/`import` (kept as one entrypoint since both share
/// the device identity and config the caller already resolved).
pub async fn run_export_import(config: &Config, identity: &DeviceIdentity, is_export: bool) -> Result<()> {
    if is_export {
        run_export(config).await
    } else {
        run_import(config, identity).await
    }
}
