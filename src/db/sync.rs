// Accessors for the sync protocol's own bookkeeping tables: paired peers,
// per-peer replication cursors, nonce replay tracking, attempt history, and
// daemon heartbeat state. `replication::log`/`replication::apply` own the
// op log itself; this module owns everything sync needs around it.

use crate::db::types::{ReplicationCursor, SyncPeer};
use crate::error::Result;
use crate::utils::now_rfc3339;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

fn encode_list(items: &[String]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string())
}

fn decode_list(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn row_to_peer(row: &rusqlite::Row) -> rusqlite::Result<SyncPeer> {
    let addresses: String = row.get(4)?;
    let include: String = row.get(8)?;
    let exclude: String = row.get(9)?;
    Ok(SyncPeer {
        peer_device_id: row.get(0)?,
        name: row.get(1)?,
        pinned_fingerprint: row.get(2)?,
        public_key: row.get(3)?,
        addresses: decode_list(&addresses),
        last_seen_at: row.get(5)?,
        last_sync_at: row.get(6)?,
        last_error: row.get(7)?,
        project_filter_include: decode_list(&include),
        project_filter_exclude: decode_list(&exclude),
    })
}

const PEER_COLUMNS: &str = "peer_device_id, name, pinned_fingerprint, public_key, addresses, \
     last_seen_at, last_sync_at, last_error, project_filter_include, project_filter_exclude";

pub fn get_peer(conn: &Connection, device_id: &str) -> Result<Option<SyncPeer>> {
    let row = conn
        .query_row(
            &format!("SELECT {PEER_COLUMNS} FROM sync_peers WHERE peer_device_id = ?1"),
            [device_id],
            row_to_peer,
        )
        .optional()?;
    Ok(row)
}

pub fn list_peers(conn: &Connection) -> Result<Vec<SyncPeer>> {
    let mut stmt = conn.prepare(&format!("SELECT {PEER_COLUMNS} FROM sync_peers ORDER BY peer_device_id"))?;
    let rows = stmt.query_map([], row_to_peer)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Insert a newly-paired peer, or refresh its trust material (fingerprint,
/// public key, advertised addresses) on re-pairing. Leaves sync history
/// (`last_seen_at`/`last_sync_at`/`last_error`) and project filters alone —
/// re-pairing re-establishes trust, it doesn't reset operational state.
pub fn upsert_peer(conn: &Connection, peer: &SyncPeer) -> Result<()> {
    conn.execute(
        "INSERT INTO sync_peers
            (peer_device_id, name, pinned_fingerprint, public_key, addresses,
             project_filter_include, project_filter_exclude)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(peer_device_id) DO UPDATE SET
            name = COALESCE(excluded.name, sync_peers.name),
            pinned_fingerprint = excluded.pinned_fingerprint,
            public_key = excluded.public_key,
            addresses = excluded.addresses",
        params![
            peer.peer_device_id,
            peer.name,
            peer.pinned_fingerprint,
            peer.public_key,
            encode_list(&peer.addresses),
            encode_list(&peer.project_filter_include),
            encode_list(&peer.project_filter_exclude),
        ],
    )?;
    Ok(())
}

pub fn remove_peer(conn: &Connection, device_id: &str) -> Result<bool> {
    let changed = conn.execute("DELETE FROM sync_peers WHERE peer_device_id = ?1", [device_id])?;
    conn.execute("DELETE FROM replication_cursors WHERE peer_device_id = ?1", [device_id])?;
    Ok(changed > 0)
}

pub fn rename_peer(conn: &Connection, device_id: &str, name: &str) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE sync_peers SET name = ?1 WHERE peer_device_id = ?2",
        params![name, device_id],
    )?;
    Ok(changed > 0)
}

pub fn set_project_filter(conn: &Connection, device_id: &str, include: &[String], exclude: &[String]) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE sync_peers SET project_filter_include = ?1, project_filter_exclude = ?2 WHERE peer_device_id = ?3",
        params![encode_list(include), encode_list(exclude), device_id],
    )?;
    Ok(changed > 0)
}

/// Refresh `last_seen_at` and fold freshly-observed addresses to the front
/// of the stored list (deduplicated), so the most recently reachable
/// address is tried first on the next pass.
pub fn touch_peer_seen(conn: &Connection, device_id: &str, observed_address: Option<&str>) -> Result<()> {
    let now = now_rfc3339();
    if let Some(addr) = observed_address {
        let existing: Option<String> = conn
            .query_row("SELECT addresses FROM sync_peers WHERE peer_device_id = ?1", [device_id], |r| r.get(0))
            .optional()?;
        if let Some(existing) = existing {
            let mut addresses = decode_list(&existing);
            addresses.retain(|a| a != addr);
            addresses.insert(0, addr.to_string());
            conn.execute(
                "UPDATE sync_peers SET last_seen_at = ?1, addresses = ?2 WHERE peer_device_id = ?3",
                params![now, encode_list(&addresses), device_id],
            )?;
            return Ok(());
        }
    }
    conn.execute(
        "UPDATE sync_peers SET last_seen_at = ?1 WHERE peer_device_id = ?2",
        params![now, device_id],
    )?;
    Ok(())
}

pub fn record_sync_success(conn: &Connection, device_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE sync_peers SET last_sync_at = ?1, last_error = NULL WHERE peer_device_id = ?2",
        params![now_rfc3339(), device_id],
    )?;
    Ok(())
}

pub fn record_sync_error(conn: &Connection, device_id: &str, error: &str) -> Result<()> {
    conn.execute(
        "UPDATE sync_peers SET last_error = ?1 WHERE peer_device_id = ?2",
        params![error, device_id],
    )?;
    Ok(())
}

pub fn get_cursor(conn: &Connection, peer_device_id: &str) -> Result<ReplicationCursor> {
    let found = conn
        .query_row(
            "SELECT peer_device_id, last_applied_cursor, last_acked_cursor FROM replication_cursors WHERE peer_device_id = ?1",
            [peer_device_id],
            |row| {
                Ok(ReplicationCursor {
                    peer_device_id: row.get(0)?,
                    last_applied_cursor: row.get(1)?,
                    last_acked_cursor: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(found.unwrap_or(ReplicationCursor {
        peer_device_id: peer_device_id.to_string(),
        last_applied_cursor: None,
        last_acked_cursor: None,
    }))
}

pub fn set_applied_cursor(conn: &Connection, peer_device_id: &str, cursor: Option<&str>) -> Result<()> {
    conn.execute(
        "INSERT INTO replication_cursors (peer_device_id, last_applied_cursor) VALUES (?1, ?2)
         ON CONFLICT(peer_device_id) DO UPDATE SET last_applied_cursor = excluded.last_applied_cursor",
        params![peer_device_id, cursor],
    )?;
    Ok(())
}

pub fn set_acked_cursor(conn: &Connection, peer_device_id: &str, cursor: Option<&str>) -> Result<()> {
    conn.execute(
        "INSERT INTO replication_cursors (peer_device_id, last_acked_cursor) VALUES (?1, ?2)
         ON CONFLICT(peer_device_id) DO UPDATE SET last_acked_cursor = excluded.last_acked_cursor",
        params![peer_device_id, cursor],
    )?;
    Ok(())
}

/// Atomically check-and-record a `(device_id, nonce)` pair. Returns `false`
/// (replay detected) if the pair was already seen.
pub fn check_and_record_nonce(conn: &Connection, device_id: &str, nonce: &str) -> Result<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO sync_nonces (device_id, nonce, seen_at) VALUES (?1, ?2, ?3)",
        params![device_id, nonce, now_rfc3339()],
    )?;
    Ok(inserted > 0)
}

/// Drop nonce records older than `window_secs`, so the replay table doesn't
/// grow unbounded. Call this opportunistically (e.g. once per daemon tick).
pub fn prune_nonces(conn: &Connection, window_secs: i64) -> Result<usize> {
    let cutoff = chrono::Utc::now() - chrono::Duration::seconds(window_secs);
    let changed = conn.execute(
        "DELETE FROM sync_nonces WHERE seen_at < ?1",
        params![cutoff.to_rfc3339()],
    )?;
    Ok(changed)
}

pub fn record_attempt(conn: &Connection, peer_device_id: &str, ok: bool, ops_in: i64, ops_out: i64, error: Option<&str>) -> Result<()> {
    conn.execute(
        "INSERT INTO sync_attempts (peer_device_id, ok, ops_in, ops_out, error, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![peer_device_id, ok as i64, ops_in, ops_out, error, now_rfc3339()],
    )?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncAttemptRow {
    pub id: i64,
    pub peer_device_id: String,
    pub ok: bool,
    pub ops_in: i64,
    pub ops_out: i64,
    pub error: Option<String>,
    pub created_at: String,
}

pub fn list_attempts(conn: &Connection, peer_device_id: Option<&str>, limit: usize) -> Result<Vec<SyncAttemptRow>> {
    let mut stmt = match peer_device_id {
        Some(_) => conn.prepare(
            "SELECT id, peer_device_id, ok, ops_in, ops_out, error, created_at FROM sync_attempts
             WHERE peer_device_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?,
        None => conn.prepare(
            "SELECT id, peer_device_id, ok, ops_in, ops_out, error, created_at FROM sync_attempts
             ORDER BY id DESC LIMIT ?1",
        )?,
    };

    let to_row = |row: &rusqlite::Row| -> rusqlite::Result<SyncAttemptRow> {
        Ok(SyncAttemptRow {
            id: row.get(0)?,
            peer_device_id: row.get(1)?,
            ok: row.get::<_, i64>(2)? != 0,
            ops_in: row.get(3)?,
            ops_out: row.get(4)?,
            error: row.get(5)?,
            created_at: row.get(6)?,
        })
    };

    let rows = match peer_device_id {
        Some(id) => stmt.query_map(params![id, limit as i64], to_row)?,
        None => stmt.query_map(params![limit as i64], to_row)?,
    };
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn daemon_state(conn: &Connection) -> Result<(Option<String>, Option<String>)> {
    let row = conn
        .query_row(
            "SELECT last_ok_at, last_error FROM sync_daemon_state WHERE id = 1",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    Ok(row.unwrap_or((None, None)))
}

pub fn record_daemon_ok(conn: &Connection) -> Result<()> {
    conn.execute(
        "INSERT INTO sync_daemon_state (id, last_ok_at, updated_at) VALUES (1, ?1, ?1)
         ON CONFLICT(id) DO UPDATE SET last_ok_at = excluded.last_ok_at, updated_at = excluded.updated_at",
        params![now_rfc3339()],
    )?;
    Ok(())
}

pub fn record_daemon_error(conn: &Connection, error: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO sync_daemon_state (id, last_error, updated_at) VALUES (1, ?1, ?2)
         ON CONFLICT(id) DO UPDATE SET last_error = excluded.last_error, updated_at = excluded.updated_at",
        params![error, now_rfc3339()],
    )?;
    Ok(())
}
