// Sync daemon (§4.8 "Daemon tick", §5 "Sync daemon"): a periodic loop that
// preflights the replication backlog, then runs one pass per configured
// peer, serialized. Adapted from the same idle-loop shape `maintenance`
// borrows from the teacher's `background::BackgroundWorker`, but driven by
// a fixed interval rather than work availability.

use crate::config::Config;
use crate::db::pool::DatabasePool;
use crate::db::sync::{daemon_state, list_peers, prune_nonces, record_daemon_error, record_daemon_ok};
use crate::error::Result;
use crate::identity::DeviceIdentity;
use crate::maintenance::migrate_replication_backlog;
use crate::sync::client::run_peer_pass;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const NONCE_REPLAY_WINDOW_SECS: i64 = 600;
const BACKLOG_MIGRATE_LIMIT: usize = 500;

/// Cooperative shutdown flag. `run_loop` checks it before and after each
/// tick, so a shutdown request drains the in-flight pass rather than
/// killing it mid-write (§5 "Daemon shutdown waits for the current tick to
/// drain, then exits").
pub type ShutdownFlag = Arc<AtomicBool>;

pub fn shutdown_flag() -> ShutdownFlag {
    Arc::new(AtomicBool::new(false))
}

/// One tick: prune expired nonces, migrate/backfill the replication
/// backlog, then run a pass against every configured peer. A per-peer
/// failure is recorded against that peer and doesn't abort the tick; only
/// a failure in the preflight step is treated as the tick's own error.
pub async fn tick(pool: &DatabasePool, identity: &DeviceIdentity) -> Result<()> {
    let _ = pool.run(|conn| prune_nonces(conn, NONCE_REPLAY_WINDOW_SECS)).await;

    migrate_replication_backlog(pool, BACKLOG_MIGRATE_LIMIT).await?;

    let peers = pool.run(list_peers).await?;
    for peer in &peers {
        let outcome = run_peer_pass(pool, identity, &peer.peer_device_id).await;
        if outcome.ok {
            tracing::info!(peer = %peer.peer_device_id, ops_in = outcome.ops_in, ops_out = outcome.ops_out, "sync pass ok");
        } else {
            tracing::warn!(peer = %peer.peer_device_id, error = ?outcome.error, "sync pass failed");
        }
    }

    Ok(())
}

/// Run ticks on `config.sync_interval_s` until `shutdown` is set. Writes a
/// pidfile at `config.sync_pid_path()` for the duration and removes it on
/// exit.
pub async fn run_loop(pool: DatabasePool, identity: DeviceIdentity, config: Config, shutdown: ShutdownFlag) -> Result<()> {
    write_pidfile(&config.sync_pid_path())?;
    let interval = Duration::from_secs(config.sync_interval_s.max(1));

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        match tick(&pool, &identity).await {
            Ok(()) => {
                let _ = pool.run(|conn| record_daemon_ok(conn)).await;
            }
            Err(e) => {
                tracing::error!(error = %e, "sync daemon tick failed");
                let message = e.to_string();
                let _ = pool.run(move |conn| record_daemon_error(conn, &message)).await;
            }
        }

        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(interval).await;
    }

    let _ = std::fs::remove_file(config.sync_pid_path());
    Ok(())
}

fn write_pidfile(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, std::process::id().to_string())?;
    Ok(())
}

/// Summary for `sync status`/`sync doctor`: last successful tick, last
/// error, and whether the pidfile names a process that looks alive.
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonStatus {
    pub last_ok_at: Option<String>,
    pub last_error: Option<String>,
    pub pid: Option<u32>,
}

pub async fn status(pool: &DatabasePool, config: &Config) -> Result<DaemonStatus> {
    let (last_ok_at, last_error) = pool.run(daemon_state).await?;
    let pid = std::fs::read_to_string(config.sync_pid_path())
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok());
    Ok(DaemonStatus { last_ok_at, last_error, pid })
}
