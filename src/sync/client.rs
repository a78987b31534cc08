// Per-peer sync pass (§4.8 "Per-peer pass"): resolve a reachable address,
// pull ops since the last applied cursor, apply them, then push ops this
// device owes the peer. The daemon runs one pass per peer, serially
// (§5 "Sync daemon ... one pass per peer serialized").

use crate::db::pool::DatabasePool;
use crate::db::sync::{get_cursor, record_attempt, record_sync_error, record_sync_success, set_acked_cursor, set_applied_cursor, touch_peer_seen};
use crate::db::types::{ReplicationOp, SyncPeer};
use crate::error::{Error, Result};
use crate::identity::DeviceIdentity;
use crate::replication::apply::{apply_op, sanitize_inbound};
use crate::replication::filter::passes;
use crate::replication::log::{ops_since, record_if_absent};
use crate::sync::auth;
use crate::utils::now_rfc3339;
use reqwest::StatusCode;
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const STATUS_TIMEOUT: Duration = Duration::from_secs(3);
const OPS_TIMEOUT: Duration = Duration::from_secs(3);
const PUSH_TIMEOUT: Duration = Duration::from_secs(10);
const PULL_PAGE_SIZE: usize = 200;
const PUSH_MAX_BYTES: usize = 1_048_576;
const PUSH_SOURCE_LIMIT: usize = 5_000;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncPassOutcome {
    pub ok: bool,
    pub ops_in: usize,
    pub ops_out: usize,
    pub error: Option<String>,
    pub address_used: Option<String>,
}

#[derive(Deserialize)]
struct StatusResponse {
    device_id: String,
    fingerprint: String,
}

#[derive(Deserialize)]
struct OpsResponse {
    ops: Vec<ReplicationOp>,
    next_cursor: Option<String>,
}

#[derive(Serialize)]
struct PushBody<'a> {
    ops: &'a [ReplicationOp],
}

/// Run one sync pass against `device_id`, recording the attempt and
/// updating peer state regardless of outcome. Returns the outcome rather
/// than `Result` — a failed pass against one peer is routine, not fatal,
/// and the daemon tick keeps going to the next peer either way.
pub async fn run_peer_pass(pool: &DatabasePool, identity: &DeviceIdentity, device_id: &str) -> SyncPassOutcome {
    let peer = {
        let device_id = device_id.to_string();
        match pool.run(move |conn| crate::db::sync::get_peer(conn, &device_id)).await {
            Ok(Some(peer)) => peer,
            Ok(None) => {
                return SyncPassOutcome {
                    error: Some("peer not found".to_string()),
                    ..Default::default()
                }
            }
            Err(e) => {
                return SyncPassOutcome {
                    error: Some(e.to_string()),
                    ..Default::default()
                }
            }
        }
    };

    let outcome = run_pass_inner(pool, identity, &peer).await;

    let device_id = peer.peer_device_id.clone();
    let record = outcome.clone();
    let _ = pool
        .run(move |conn| -> Result<()> {
            record_attempt(conn, &device_id, record.ok, record.ops_in as i64, record.ops_out as i64, record.error.as_deref())?;
            if record.ok {
                record_sync_success(conn, &device_id)?;
            } else if let Some(err) = &record.error {
                record_sync_error(conn, &device_id, err)?;
            }
            Ok(())
        })
        .await;

    outcome
}

async fn run_pass_inner(pool: &DatabasePool, identity: &DeviceIdentity, peer: &SyncPeer) -> SyncPassOutcome {
    let client = match reqwest::Client::builder().build() {
        Ok(c) => c,
        Err(e) => {
            return SyncPassOutcome {
                error: Some(e.to_string()),
                ..Default::default()
            }
        }
    };

    for address in &peer.addresses {
        match try_address(pool, &client, identity, peer, address).await {
            Ok(mut outcome) => {
                outcome.address_used = Some(address.clone());
                let device_id = peer.peer_device_id.clone();
                let address = address.clone();
                let _ = pool.run(move |conn| touch_peer_seen(conn, &device_id, Some(&address))).await;
                return outcome;
            }
            Err(e) => {
                tracing::warn!(peer = %peer.peer_device_id, %address, error = %e, "sync address attempt failed");
            }
        }
    }

    SyncPassOutcome {
        error: Some("no reachable address".to_string()),
        ..Default::default()
    }
}

async fn try_address(pool: &DatabasePool, client: &reqwest::Client, identity: &DeviceIdentity, peer: &SyncPeer, address: &str) -> Result<SyncPassOutcome> {
    let base = format!("http://{address}");

    let status: StatusResponse = request_json(client, identity, &base, "/v1/status", STATUS_TIMEOUT).await?;
    if status.fingerprint != peer.pinned_fingerprint || status.device_id != peer.peer_device_id {
        return Err(Error::Forbidden(format!("peer at {address} presented an unexpected identity")));
    }

    let ops_in = pull_and_apply(pool, client, identity, peer, &base).await?;
    let ops_out = push_outbound(pool, client, identity, peer, &base).await?;

    Ok(SyncPassOutcome {
        ok: true,
        ops_in,
        ops_out,
        error: None,
        address_used: None,
    })
}

async fn pull_and_apply(pool: &DatabasePool, client: &reqwest::Client, identity: &DeviceIdentity, peer: &SyncPeer, base: &str) -> Result<usize> {
    let cursor = {
        let device_id = peer.peer_device_id.clone();
        pool.run(move |conn| get_cursor(conn, &device_id)).await?
    };

    let mut ops_in = 0usize;
    let mut last_applied = cursor.last_applied_cursor.clone();

    loop {
        let query = match &last_applied {
            Some(c) => format!("/v1/ops?since={}&limit={PULL_PAGE_SIZE}", urlencoding::encode(c)),
            None => format!("/v1/ops?limit={PULL_PAGE_SIZE}"),
        };
        let page: OpsResponse = request_json(client, identity, base, &query, OPS_TIMEOUT).await?;
        let page_len = page.ops.len();
        let next_cursor = page.next_cursor.clone();

        if page_len > 0 {
            let source_device_id = peer.peer_device_id.clone();
            let received_at = now_rfc3339();
            let ops = page.ops;
            let applied_cursor = ops.last().map(|op| op.cursor());
            ops_in += ops.len();
            pool.run_with_retry(move |conn| -> Result<()> {
                for op in &ops {
                    let sanitized = sanitize_inbound(op.clone(), &source_device_id, &received_at);
                    record_if_absent(
                        conn,
                        &sanitized.op_id,
                        &sanitized.entity_type,
                        &sanitized.entity_id,
                        &sanitized.op_type,
                        &sanitized.payload,
                        sanitized.rev,
                        &sanitized.clock_updated_at,
                        &sanitized.clock_device_id,
                        &sanitized.device_id,
                        &sanitized.created_at,
                    )?;
                    apply_op(conn, &sanitized)?;
                }
                Ok(())
            })
            .await?;
            last_applied = applied_cursor;
        } else if let Some(next) = next_cursor.clone() {
            last_applied = Some(next);
        }

        if page_len < PULL_PAGE_SIZE && next_cursor.is_none() {
            break;
        }
    }

    let device_id = peer.peer_device_id.clone();
    let cursor_to_store = last_applied.clone();
    pool.run(move |conn| set_applied_cursor(conn, &device_id, cursor_to_store.as_deref())).await?;

    Ok(ops_in)
}

fn resolve_project(conn: &rusqlite::Connection, op: &ReplicationOp) -> Result<Option<String>> {
    let Some(session_id) = op.payload.get("session_id").and_then(|v| v.as_i64()) else {
        return Ok(None);
    };
    let project: Option<String> = conn
        .query_row("SELECT project FROM sessions WHERE id = ?1", [session_id], |r| r.get(0))
        .optional()?;
    Ok(project)
}

async fn push_outbound(pool: &DatabasePool, client: &reqwest::Client, identity: &DeviceIdentity, peer: &SyncPeer, base: &str) -> Result<usize> {
    let cursor = {
        let device_id = peer.peer_device_id.clone();
        pool.run(move |conn| get_cursor(conn, &device_id)).await?
    };

    let include = peer.project_filter_include.clone();
    let exclude = peer.project_filter_exclude.clone();
    let since = cursor.last_acked_cursor.clone();
    let outbound = pool
        .run(move |conn| -> Result<Vec<ReplicationOp>> {
            let candidates = ops_since(conn, since.as_deref(), PUSH_SOURCE_LIMIT)?;
            let mut kept = Vec::new();
            for op in candidates {
                let project = resolve_project(conn, &op)?;
                if passes(project.as_deref(), &include, &exclude) {
                    kept.push(op);
                }
            }
            Ok(kept)
        })
        .await?;

    if outbound.is_empty() {
        return Ok(0);
    }

    let sent = push_chunk(client, identity, base, &outbound).await?;

    if let Some(last) = outbound.last() {
        let device_id = peer.peer_device_id.clone();
        let cursor_value = last.cursor();
        pool.run(move |conn| set_acked_cursor(conn, &device_id, Some(&cursor_value))).await?;
    }

    Ok(sent)
}

/// Push `ops` to the peer, recursively halving the batch on a `413` the
/// way the spec requires ("recursively halving the batch on a 413 whose
/// error is payload_too_large/too_many_ops").
fn push_chunk<'a>(
    client: &'a reqwest::Client,
    identity: &'a DeviceIdentity,
    base: &'a str,
    ops: &'a [ReplicationOp],
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<usize>> + Send + 'a>> {
    Box::pin(async move {
        if ops.is_empty() {
            return Ok(0);
        }

        let body = serde_json::to_vec(&PushBody { ops })?;
        if body.len() > PUSH_MAX_BYTES && ops.len() > 1 {
            let mid = ops.len() / 2;
            let first = push_chunk(client, identity, base, &ops[..mid]).await?;
            let second = push_chunk(client, identity, base, &ops[mid..]).await?;
            return Ok(first + second);
        }

        match send_push(client, identity, base, &body).await {
            Ok(()) => Ok(ops.len()),
            Err(Error::PayloadTooLarge(_)) if ops.len() > 1 => {
                let mid = ops.len() / 2;
                let first = push_chunk(client, identity, base, &ops[..mid]).await?;
                let second = push_chunk(client, identity, base, &ops[mid..]).await?;
                Ok(first + second)
            }
            Err(e) => Err(e),
        }
    })
}

async fn send_push(client: &reqwest::Client, identity: &DeviceIdentity, base: &str, body: &[u8]) -> Result<()> {
    let auth = auth::sign(identity, "POST", "/v1/ops", body);
    let resp = client
        .post(format!("{base}/v1/ops"))
        .timeout(PUSH_TIMEOUT)
        .header(auth::DEVICE_ID_HEADER, &auth.device_id)
        .header(auth::TIMESTAMP_HEADER, &auth.timestamp)
        .header(auth::NONCE_HEADER, &auth.nonce)
        .header(auth::SIGNATURE_HEADER, &auth.signature)
        .header("content-type", "application/json; charset=utf-8")
        .body(body.to_vec())
        .send()
        .await?;

    if resp.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return Err(Error::PayloadTooLarge("peer rejected push as too large".to_string()));
    }
    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(Error::Other(format!("push to {base}/v1/ops failed: {status} {text}")));
    }
    Ok(())
}

async fn request_json<T: serde::de::DeserializeOwned>(
    client: &reqwest::Client,
    identity: &DeviceIdentity,
    base: &str,
    path_and_query: &str,
    timeout: Duration,
) -> Result<T> {
    let auth = auth::sign(identity, "GET", path_and_query, &[]);
    let url = format!("{base}{path_and_query}");
    let resp = client
        .get(&url)
        .timeout(timeout)
        .header(auth::DEVICE_ID_HEADER, &auth.device_id)
        .header(auth::TIMESTAMP_HEADER, &auth.timestamp)
        .header(auth::NONCE_HEADER, &auth.nonce)
        .header(auth::SIGNATURE_HEADER, &auth.signature)
        .send()
        .await?;

    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(Error::Other(format!("request to {url} failed: {status} {text}")));
    }
    Ok(resp.json().await?)
}
