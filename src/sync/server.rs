// Sync server (§4.8 "GET /v1/status", "GET /v1/ops", "POST /v1/ops"): axum
// handlers that authenticate every request against a pinned peer's
// ed25519 key before it touches the op log. Mirrors the teacher's
// `proxy::server`/`web::mod` shape — a small `Router` builder over shared
// state, one handler function per route, `TraceLayer` for request logging.

use crate::db::pool::DatabasePool;
use crate::db::types::ReplicationOp;
use crate::error::Error;
use crate::identity::DeviceIdentity;
use crate::replication::apply::{apply_op, sanitize_inbound};
use crate::replication::filter;
use crate::replication::log::{ops_since, record_if_absent};
use crate::sync::auth::{self, RequestAuth};
use crate::utils::now_rfc3339;
use axum::body::Bytes;
use axum::extract::{OriginalUri, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

const MAX_BODY_BYTES: usize = 1_048_576;
const MAX_OPS_PER_PUSH: usize = 5_000;
const DEFAULT_OPS_LIMIT: usize = 200;
const MAX_OPS_LIMIT: usize = 1_000;
const OPS_OVERFETCH_FACTOR: usize = 8;

#[derive(Clone)]
pub struct SyncServerState {
    pub pool: Arc<DatabasePool>,
    pub identity: Arc<DeviceIdentity>,
    pub addresses: Vec<String>,
}

pub fn router(state: SyncServerState) -> Router {
    Router::new()
        .route("/v1/status", get(status))
        .route("/v1/ops", get(get_ops).post(post_ops))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let error_key = match &self.0 {
            Error::PayloadTooLarge(_) => "payload_too_large",
            Error::TooManyOps(_) => "too_many_ops",
            Error::Unauthorized(_) => "unauthorized",
            Error::Forbidden(_) => "forbidden",
            Error::InvalidInput(_) => "invalid_input",
            _ => "error",
        };
        (
            status,
            Json(serde_json::json!({"error": error_key, "message": self.0.to_user_string()})),
        )
            .into_response()
    }
}

fn extract_auth(headers: &HeaderMap) -> Result<RequestAuth, ApiError> {
    let get = |name: &str| -> Result<String, ApiError> {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| ApiError(Error::Unauthorized(format!("missing {name} header"))))
    };
    Ok(RequestAuth {
        device_id: get(auth::DEVICE_ID_HEADER)?,
        timestamp: get(auth::TIMESTAMP_HEADER)?,
        nonce: get(auth::NONCE_HEADER)?,
        signature: get(auth::SIGNATURE_HEADER)?,
    })
}

#[derive(Serialize)]
struct StatusResponse {
    device_id: String,
    fingerprint: String,
    addresses: Vec<String>,
}

async fn status(
    State(state): State<SyncServerState>,
    headers: HeaderMap,
    OriginalUri(uri): OriginalUri,
    body: Bytes,
) -> Result<Json<StatusResponse>, ApiError> {
    let request_auth = extract_auth(&headers)?;
    let url = uri.to_string();
    state
        .pool
        .run(move |conn| auth::verify(conn, &request_auth, "GET", &url, &body))
        .await
        .map_err(ApiError)?;

    Ok(Json(StatusResponse {
        device_id: state.identity.device_id.clone(),
        fingerprint: state.identity.fingerprint(),
        addresses: state.addresses.clone(),
    }))
}

#[derive(Deserialize)]
struct OpsQuery {
    since: Option<String>,
    limit: Option<usize>,
}

#[derive(Serialize)]
struct OpsResponse {
    ops: Vec<ReplicationOp>,
    next_cursor: Option<String>,
    skipped: Option<usize>,
}

/// The project an op's payload belongs to, resolved via its `session_id`.
/// Ops don't carry `project` directly — it lives on the session row.
fn resolve_project(conn: &rusqlite::Connection, op: &ReplicationOp) -> crate::error::Result<Option<String>> {
    let Some(session_id) = op.payload.get("session_id").and_then(|v| v.as_i64()) else {
        return Ok(None);
    };
    let project: Option<String> = conn
        .query_row("SELECT project FROM sessions WHERE id = ?1", [session_id], |r| r.get(0))
        .optional()?;
    Ok(project)
}

async fn get_ops(
    State(state): State<SyncServerState>,
    headers: HeaderMap,
    OriginalUri(uri): OriginalUri,
    Query(q): Query<OpsQuery>,
    body: Bytes,
) -> Result<Json<OpsResponse>, ApiError> {
    let request_auth = extract_auth(&headers)?;
    let url = uri.to_string();
    let peer = state
        .pool
        .run(move |conn| auth::verify(conn, &request_auth, "GET", &url, &body))
        .await
        .map_err(ApiError)?;

    let limit = q.limit.unwrap_or(DEFAULT_OPS_LIMIT).clamp(1, MAX_OPS_LIMIT);
    let since = q.since;
    let include = peer.project_filter_include;
    let exclude = peer.project_filter_exclude;
    let fetch_n = limit.saturating_mul(OPS_OVERFETCH_FACTOR);

    let (ops, next_cursor, skipped) = state
        .pool
        .run(move |conn| -> crate::error::Result<(Vec<ReplicationOp>, Option<String>, usize)> {
            let fetched = ops_since(conn, since.as_deref(), fetch_n)?;
            let mut kept = Vec::new();
            let mut skipped = 0usize;
            let mut last_cursor = None;
            for op in fetched {
                last_cursor = Some(op.cursor());
                let project = resolve_project(conn, &op)?;
                if filter::passes(project.as_deref(), &include, &exclude) {
                    if kept.len() < limit {
                        kept.push(op);
                    }
                } else {
                    skipped += 1;
                }
            }
            // Only surface next_cursor when filtering emptied the window but
            // the log actually had more to offer — lets the peer advance past
            // a filtered-out gap instead of re-polling it forever.
            let next_cursor = if kept.is_empty() { last_cursor } else { None };
            Ok((kept, next_cursor, skipped))
        })
        .await
        .map_err(ApiError)?;

    Ok(Json(OpsResponse {
        ops,
        next_cursor,
        skipped: if skipped > 0 { Some(skipped) } else { None },
    }))
}

#[derive(Deserialize)]
struct PostOpsRequest {
    ops: Vec<ReplicationOp>,
}

#[derive(Serialize)]
struct PostOpsResponse {
    inserted: usize,
    updated: usize,
}

async fn post_ops(
    State(state): State<SyncServerState>,
    headers: HeaderMap,
    OriginalUri(uri): OriginalUri,
    body: Bytes,
) -> Result<Json<PostOpsResponse>, ApiError> {
    if body.len() > MAX_BODY_BYTES {
        return Err(ApiError(Error::PayloadTooLarge(format!(
            "body is {} bytes, max {MAX_BODY_BYTES}",
            body.len()
        ))));
    }

    let request_auth = extract_auth(&headers)?;
    let url = uri.to_string();
    let auth_body = body.clone();
    let peer = state
        .pool
        .run(move |conn| auth::verify(conn, &request_auth, "POST", &url, &auth_body))
        .await
        .map_err(ApiError)?;

    let parsed: PostOpsRequest =
        serde_json::from_slice(&body).map_err(|e| ApiError(Error::InvalidInput(format!("malformed ops payload: {e}"))))?;

    if parsed.ops.len() > MAX_OPS_PER_PUSH {
        return Err(ApiError(Error::TooManyOps(format!(
            "{} ops exceeds the per-push cap of {MAX_OPS_PER_PUSH}",
            parsed.ops.len()
        ))));
    }

    let source_device_id = peer.peer_device_id.clone();
    let received_at = now_rfc3339();
    let ops = parsed.ops;
    let (inserted, updated) = state
        .pool
        .run_with_retry(move |conn| -> crate::error::Result<(usize, usize)> {
            let mut inserted = 0usize;
            let mut updated = 0usize;
            for op in &ops {
                let sanitized = sanitize_inbound(op.clone(), &source_device_id, &received_at);
                let newly_logged = record_if_absent(
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
                if newly_logged {
                    inserted += 1;
                }
                if apply_op(conn, &sanitized)? {
                    updated += 1;
                }
            }
            Ok((inserted, updated))
        })
        .await
        .map_err(ApiError)?;

    Ok(Json(PostOpsResponse { inserted, updated }))
}
