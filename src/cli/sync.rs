// Sync CLI dispatch (§4.8, §6 "sync enable|disable|status|pair|..."). Thin
// wrappers over `sync::daemon`/`sync::pairing`/`db::sync`/`replication::migrate`
// — no business logic lives here, only argument plumbing and JSON/console
// output shaping, the same division `maintenance::gate` draws between the
// computation and the CLI surface that reports it.

use super::{PeersAction, SyncAction};
use codemem::config::Config;
use codemem::db::pool::DatabasePool;
use codemem::db::sync::{list_attempts, list_peers, remove_peer, rename_peer};
use codemem::error::{Error, Result};
use codemem::identity::DeviceIdentity;
use codemem::replication::migrate::migrate_legacy_import_keys;
use codemem::sync::daemon::{run_loop, shutdown_flag, status, tick};
use codemem::sync::pairing::{accept, own_payload, PairingPayload};
use std::io::Read;
use std::sync::atomic::Ordering;

/// Persists `sync_enabled` into the JSONC config file, preserving every
/// other key already present. The config layer only knows how to read a
/// `FileConfig` (§ "Configuration"); writing one back is CLI-only plumbing,
/// so it works on the raw JSON document rather than round-tripping through
/// `FileConfig`'s all-optional struct.
fn set_sync_enabled_in_file(config: &Config, enabled: bool) -> Result<()> {
    let path = config.config_dir.join("config.jsonc");
    let mut doc: serde_json::Value = if path.exists() {
        let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
        jsonc_parser::parse_to_serde_value(&raw, &Default::default())
            .map_err(|e| Error::InvalidInput(format!("malformed config file: {e}")))?
            .unwrap_or(serde_json::json!({}))
    } else {
        serde_json::json!({})
    };

    if !doc.is_object() {
        doc = serde_json::json!({});
    }
    doc.as_object_mut().expect("checked above").insert("sync_enabled".to_string(), serde_json::json!(enabled));

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(Error::Io)?;
    }
    std::fs::write(&path, serde_json::to_string_pretty(&doc)?).map_err(Error::Io)?;
    Ok(())
}

pub async fn run_sync(config: &Config, identity: &DeviceIdentity, action: SyncAction) -> Result<()> {
    match action {
        SyncAction::Enable | SyncAction::Install => {
            set_sync_enabled_in_file(config, true)?;
            println!("sync enabled");
        }
        SyncAction::Disable | SyncAction::Uninstall => {
            set_sync_enabled_in_file(config, false)?;
            println!("sync disabled");
        }
        SyncAction::Status => {
            let pool = DatabasePool::open_light(&config.db_path()).await?;
            let daemon_status = status(&pool, config).await?;
            println!(
                "{}",
                serde_json::json!({
                    "sync_enabled": config.sync_enabled,
                    "pid": daemon_status.pid,
                    "last_ok_at": daemon_status.last_ok_at,
                    "last_error": daemon_status.last_error,
                })
            );
        }
        SyncAction::Pair => {
            let payload = own_payload(identity, config);
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
        SyncAction::PairAccept { name } => {
            let mut raw = String::new();
            std::io::stdin().read_to_string(&mut raw).map_err(Error::Io)?;
            let payload: PairingPayload = serde_json::from_str(&raw)
                .map_err(|e| Error::InvalidInput(format!("malformed pairing payload: {e}")))?;

            let pool = DatabasePool::open_light(&config.db_path()).await?;
            let config_owned = config.clone();
            let peer = pool.run(move |conn| accept(conn, &payload, name, &config_owned)).await?;
            println!("paired with {} ({})", peer.peer_device_id, peer.name.as_deref().unwrap_or("unnamed"));
        }
        SyncAction::Once => {
            let pool = DatabasePool::open(&config.db_path()).await?;
            tick(&pool, identity).await?;
            println!("sync tick complete");
        }
        SyncAction::Daemon => {
            let pool = DatabasePool::open(&config.db_path()).await?;
            let shutdown = shutdown_flag();
            let shutdown_for_signal = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    shutdown_for_signal.store(true, Ordering::SeqCst);
                }
            });
            run_loop(pool, identity.clone(), config.clone(), shutdown).await?;
        }
        SyncAction::Peers { action } => run_peers(config, action).await?,
        SyncAction::Doctor => run_doctor(config).await?,
        SyncAction::RepairLegacyKeys { limit } => {
            let pool = DatabasePool::open_light(&config.db_path()).await?;
            let rewritten = pool.run(move |conn| migrate_legacy_import_keys(conn, limit)).await?;
            println!("rewrote {rewritten} legacy import key(s)");
        }
        SyncAction::Attempts { peer, limit } => {
            let pool = DatabasePool::open_light(&config.db_path()).await?;
            let rows = pool.run(move |conn| list_attempts(conn, peer.as_deref(), limit)).await?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
    }
    Ok(())
}

async fn run_peers(config: &Config, action: PeersAction) -> Result<()> {
    let pool = DatabasePool::open_light(&config.db_path()).await?;
    match action {
        PeersAction::List => {
            let peers = pool.run(list_peers).await?;
            println!("{}", serde_json::to_string_pretty(&peers)?);
        }
        PeersAction::Remove { device_id } => {
            let removed = pool.run(move |conn| remove_peer(conn, &device_id)).await?;
            println!("{}", if removed { "removed" } else { "no such peer" });
        }
        PeersAction::Rename { device_id, name } => {
            let renamed = pool.run(move |conn| rename_peer(conn, &device_id, &name)).await?;
            println!("{}", if renamed { "renamed" } else { "no such peer" });
        }
    }
    Ok(())
}

async fn run_doctor(config: &Config) -> Result<()> {
    let pool = DatabasePool::open_light(&config.db_path()).await?;
    let daemon_status = status(&pool, config).await?;

    let pid_alive = daemon_status.pid.map(pid_is_alive).unwrap_or(false);
    println!(
        "{}",
        serde_json::json!({
            "sync_enabled": config.sync_enabled,
            "pidfile_present": daemon_status.pid.is_some(),
            "pid_alive": pid_alive,
            "last_ok_at": daemon_status.last_ok_at,
            "last_error": daemon_status.last_error,
        })
    );
    Ok(())
}

#[cfg(unix)]
fn pid_is_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_is_alive(_pid: u32) -> bool {
    false
}
