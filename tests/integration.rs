// Cross-module integration tests: the seams each unit test suite stops
// short of — a real op log fed through the live HTTP sync surface, the
// Observer Pipeline feeding hybrid recall and pack assembly, and
// replication convergence across two independently-built stores.

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use codemem::db::memory::retrieval::RecallFilters;
use codemem::db::memory::{forget, get_memory_item, remember, RememberOptions};
use codemem::db::pool::DatabasePool;
use codemem::db::schema::run_all_migrations;
use codemem::db::sync::upsert_peer;
use codemem::db::types::{ReplicationOp, SyncPeer};
use codemem::error::Error;
use codemem::identity::{load_or_create, DeviceIdentity};
use codemem::observer::pipeline::{run_flush, FlushOutcome, FlushRequest};
use codemem::observer::provider::Observer;
use codemem::observer::types::{ObservedItem, ObservedSummary, ObserverContext, ParsedOutput};
use codemem::raw_events::{record, start_session};
use codemem::replication::apply::{apply_op, sanitize_inbound};
use codemem::retrieval::hybrid_recall;
use codemem::sync::auth::{self, RequestAuth, DEVICE_ID_HEADER, NONCE_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use codemem::sync::server::{router, SyncServerState};
use codemem::utils::now_rfc3339;
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

fn identity_in(dir: &TempDir) -> DeviceIdentity {
    let mut config = codemem::config::Config::default();
    config.data_dir = dir.path().to_path_buf();
    load_or_create(&config).unwrap()
}

fn peer_row(identity: &DeviceIdentity, include: Vec<String>, exclude: Vec<String>) -> SyncPeer {
    SyncPeer {
        peer_device_id: identity.device_id.clone(),
        name: None,
        pinned_fingerprint: identity.fingerprint(),
        public_key: identity.public_key_base64(),
        addresses: vec![],
        last_seen_at: None,
        last_sync_at: None,
        last_error: None,
        project_filter_include: include,
        project_filter_exclude: exclude,
    }
}

fn seed_session(conn: &rusqlite::Connection, project: &str) -> i64 {
    conn.execute(
        "INSERT INTO sessions (started_at, cwd, user, project) VALUES ('2024-01-01T00:00:00Z', '/tmp', 'u', ?1)",
        rusqlite::params![project],
    )
    .unwrap();
    conn.last_insert_rowid()
}

fn build_request(method: &str, path_and_query: &str, auth: &RequestAuth, body: Body) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(path_and_query)
        .header(DEVICE_ID_HEADER, &auth.device_id)
        .header(TIMESTAMP_HEADER, &auth.timestamp)
        .header(NONCE_HEADER, &auth.nonce)
        .header(SIGNATURE_HEADER, &auth.signature)
        .body(body)
        .unwrap()
}

// -- Sync HTTP surface ---------------------------------------------------

#[tokio::test]
async fn get_ops_over_http_returns_an_op_a_peer_can_apply_locally() {
    let server_pool = DatabasePool::open_in_memory().await.unwrap();
    let client_dir = TempDir::new().unwrap();
    let client_identity = identity_in(&client_dir);

    server_pool
        .interact({
            let peer = peer_row(&client_identity, vec![], vec![]);
            move |conn| {
                run_all_migrations(conn)?;
                let session_id = seed_session(conn, "alpha");
                remember(conn, session_id, "note", "Fix login bug", "investigated the auth flow", 0.9, "dev-server", RememberOptions::default())?;
                upsert_peer(conn, &peer)?;
                Ok::<_, anyhow::Error>(())
            }
        })
        .await
        .unwrap();

    let server_dir = TempDir::new().unwrap();
    let server_identity = Arc::new(identity_in(&server_dir));
    let state = SyncServerState { pool: Arc::new(server_pool), identity: server_identity, addresses: vec![] };
    let app = router(state);

    let auth = auth::sign(&client_identity, "GET", "/v1/ops?limit=50", b"");
    let request = build_request("GET", "/v1/ops?limit=50", &auth, Body::empty());
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let ops: Vec<ReplicationOp> = serde_json::from_value(parsed["ops"].clone()).unwrap();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].entity_type, "memory_item");

    // The pulled op applies cleanly against a fresh store on the other side.
    let target = rusqlite::Connection::open_in_memory().unwrap();
    run_all_migrations(&target).unwrap();
    let sanitized = sanitize_inbound(ops[0].clone(), "dev-server", &now_rfc3339());
    assert!(apply_op(&target, &sanitized).unwrap());
    let count: i64 = target.query_row("SELECT COUNT(*) FROM memory_items", [], |r| r.get(0)).unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn post_ops_over_http_is_idempotent_on_replay() {
    let client_dir = TempDir::new().unwrap();
    let client_identity = identity_in(&client_dir);
    let client_pool = DatabasePool::open_in_memory().await.unwrap();

    // `remember` already emits exactly one replication op for the write;
    // pull it back out rather than re-deriving a payload by hand.
    let op_row = client_pool
        .interact(|conn| {
            run_all_migrations(conn)?;
            let session_id = seed_session(conn, "alpha");
            remember(conn, session_id, "note", "Ship the release", "tagged v1.2.0", 0.9, "dev-client", RememberOptions::default())?;
            let row: ReplicationOp = conn.query_row(
                "SELECT op_id, entity_type, entity_id, op_type, payload, rev, clock_updated_at, clock_device_id, device_id, created_at
                 FROM replication_ops ORDER BY created_at DESC LIMIT 1",
                [],
                |r| {
                    Ok(ReplicationOp {
                        op_id: r.get(0)?,
                        entity_type: r.get(1)?,
                        entity_id: r.get(2)?,
                        op_type: r.get(3)?,
                        payload: serde_json::from_str(&r.get::<_, String>(4)?).unwrap(),
                        rev: r.get(5)?,
                        clock_updated_at: r.get(6)?,
                        clock_device_id: r.get(7)?,
                        device_id: r.get(8)?,
                        created_at: r.get(9)?,
                    })
                },
            )?;
            Ok::<_, anyhow::Error>(row)
        })
        .await
        .unwrap();

    let server_pool = DatabasePool::open_in_memory().await.unwrap();
    server_pool
        .interact({
            let peer = peer_row(&client_identity, vec![], vec![]);
            move |conn| {
                run_all_migrations(conn)?;
                upsert_peer(conn, &peer)?;
                Ok::<_, anyhow::Error>(())
            }
        })
        .await
        .unwrap();

    let server_dir = TempDir::new().unwrap();
    let server_identity = Arc::new(identity_in(&server_dir));
    let state = SyncServerState { pool: Arc::new(server_pool), identity: server_identity, addresses: vec![] };
    let app = router(state);

    let body_bytes = serde_json::to_vec(&json!({"ops": [op_row]})).unwrap();

    let first_auth = auth::sign(&client_identity, "POST", "/v1/ops", &body_bytes);
    let first = app
        .clone()
        .oneshot(build_request("POST", "/v1/ops", &first_auth, Body::from(body_bytes.clone())))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    let first_body = to_bytes(first.into_body(), usize::MAX).await.unwrap();
    let first_parsed: serde_json::Value = serde_json::from_slice(&first_body).unwrap();
    assert_eq!(first_parsed["inserted"], 1);
    assert_eq!(first_parsed["updated"], 1);

    // Same op, signed fresh (new nonce) and replayed: already logged by
    // op_id, and not newer than what's already applied, so both zero.
    let second_auth = auth::sign(&client_identity, "POST", "/v1/ops", &body_bytes);
    let second = app
        .clone()
        .oneshot(build_request("POST", "/v1/ops", &second_auth, Body::from(body_bytes)))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    let second_body = to_bytes(second.into_body(), usize::MAX).await.unwrap();
    let second_parsed: serde_json::Value = serde_json::from_slice(&second_body).unwrap();
    assert_eq!(second_parsed["inserted"], 0);
    assert_eq!(second_parsed["updated"], 0);
}

#[tokio::test]
async fn post_ops_over_http_rejects_a_push_over_the_per_call_cap() {
    let client_dir = TempDir::new().unwrap();
    let client_identity = identity_in(&client_dir);

    let server_pool = DatabasePool::open_in_memory().await.unwrap();
    server_pool
        .interact({
            let peer = peer_row(&client_identity, vec![], vec![]);
            move |conn| {
                run_all_migrations(conn)?;
                upsert_peer(conn, &peer)?;
                Ok::<_, anyhow::Error>(())
            }
        })
        .await
        .unwrap();

    let server_dir = TempDir::new().unwrap();
    let server_identity = Arc::new(identity_in(&server_dir));
    let state = SyncServerState { pool: Arc::new(server_pool), identity: server_identity, addresses: vec![] };
    let app = router(state);

    // One minimal op repeated past the 5,000-op per-push cap; contents don't
    // matter, only the count, since the cap check runs right after parsing
    // and before any op is applied — kept tiny so the *count* is what trips
    // the 413, not the separate whole-body byte cap.
    let one_op = ReplicationOp {
        op_id: "a".to_string(),
        entity_type: "m".to_string(),
        entity_id: "d".to_string(),
        op_type: "u".to_string(),
        payload: json!({}),
        rev: 1,
        clock_updated_at: "t".to_string(),
        clock_device_id: "d".to_string(),
        device_id: "d".to_string(),
        created_at: "t".to_string(),
    };
    let ops: Vec<ReplicationOp> = std::iter::repeat(one_op).take(5_001).collect();
    let body_bytes = serde_json::to_vec(&json!({"ops": ops})).unwrap();
    assert!(body_bytes.len() < 1_048_576, "test body must stay under the whole-body cap to isolate the ops-count check");

    let auth = auth::sign(&client_identity, "POST", "/v1/ops", &body_bytes);
    let response = app
        .oneshot(build_request("POST", "/v1/ops", &auth, Body::from(body_bytes)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["error"], "too_many_ops");
}

#[tokio::test]
async fn get_ops_over_http_honors_the_pinned_peers_project_filter() {
    let server_pool = DatabasePool::open_in_memory().await.unwrap();
    let client_dir = TempDir::new().unwrap();
    let client_identity = identity_in(&client_dir);

    server_pool
        .interact({
            let peer = peer_row(&client_identity, vec![], vec!["secret-client".to_string()]);
            move |conn| {
                run_all_migrations(conn)?;
                let included = seed_session(conn, "work/codemem");
                let excluded = seed_session(conn, "work/secret-client");
                remember(conn, included, "note", "included note", "safe to share", 0.9, "dev-server", RememberOptions::default())?;
                remember(conn, excluded, "note", "excluded note", "must stay local", 0.9, "dev-server", RememberOptions::default())?;
                upsert_peer(conn, &peer)?;
                Ok::<_, anyhow::Error>(())
            }
        })
        .await
        .unwrap();

    let server_dir = TempDir::new().unwrap();
    let server_identity = Arc::new(identity_in(&server_dir));
    let state = SyncServerState { pool: Arc::new(server_pool), identity: server_identity, addresses: vec![] };
    let app = router(state);

    let auth = auth::sign(&client_identity, "GET", "/v1/ops?limit=50", b"");
    let request = build_request("GET", "/v1/ops?limit=50", &auth, Body::empty());
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let ops: Vec<ReplicationOp> = serde_json::from_value(parsed["ops"].clone()).unwrap();

    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].payload["title"], "included note");
    assert_eq!(parsed["skipped"], 1);
}

#[tokio::test]
async fn status_endpoint_rejects_a_tampered_url_and_a_replayed_nonce() {
    let server_pool = DatabasePool::open_in_memory().await.unwrap();
    let client_dir = TempDir::new().unwrap();
    let client_identity = identity_in(&client_dir);

    server_pool
        .interact({
            let peer = peer_row(&client_identity, vec![], vec![]);
            move |conn| {
                run_all_migrations(conn)?;
                upsert_peer(conn, &peer)?;
                Ok::<_, anyhow::Error>(())
            }
        })
        .await
        .unwrap();

    let server_dir = TempDir::new().unwrap();
    let server_identity = Arc::new(identity_in(&server_dir));
    let state = SyncServerState { pool: Arc::new(server_pool), identity: server_identity, addresses: vec![] };
    let app = router(state);

    // A signature computed over one URL doesn't verify against another.
    let wrong_url_auth = auth::sign(&client_identity, "GET", "/v1/status", b"");
    let tampered = build_request("GET", "/v1/ops", &wrong_url_auth, Body::empty());
    let response = app.clone().oneshot(tampered).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // A valid request, replayed verbatim, trips the nonce-replay guard.
    let valid_auth = auth::sign(&client_identity, "GET", "/v1/status", b"");
    let first = app
        .clone()
        .oneshot(build_request("GET", "/v1/status", &valid_auth, Body::empty()))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let replayed = app
        .clone()
        .oneshot(build_request("GET", "/v1/status", &valid_auth, Body::empty()))
        .await
        .unwrap();
    assert_eq!(replayed.status(), StatusCode::UNAUTHORIZED);
}

// -- Observer Pipeline -> hybrid recall -> pack assembly ------------------

struct FixedObserver(ParsedOutput);

#[async_trait]
impl Observer for FixedObserver {
    async fn observe(&self, _context: &ObserverContext) -> codemem::error::Result<ParsedOutput> {
        Ok(self.0.clone())
    }
}

#[tokio::test]
async fn a_flushed_turn_is_findable_by_recall_and_lands_in_a_pack() {
    let pool = DatabasePool::open_in_memory().await.unwrap();
    pool.interact(|conn| {
        run_all_migrations(conn)?;
        start_session(conn, "oc-1", Some("/repo"), Some("codemem"), "2024-01-01T00:00:00Z")?;
        record(conn, "oc-1", "e1", "user.prompt", &json!({"text": "fix the login regression", "prompt_number": 1}), Some(1), Some(1))?;
        record(conn, "oc-1", "e2", "tool.call", &json!({"tool": "edit", "input": {"path": "src/auth.rs"}}), Some(2), Some(2))?;
        Ok::<_, anyhow::Error>(())
    })
    .await
    .unwrap();

    let observer = FixedObserver(ParsedOutput {
        observations: vec![ObservedItem {
            kind: "bugfix".to_string(),
            title: "Fixed login regression".to_string(),
            narrative: "Corrected the auth token refresh logic in src/auth.rs".to_string(),
            facts: vec![],
            concepts: vec![],
            files_read: vec![],
            files_modified: vec!["src/auth.rs".to_string()],
            confidence: 0.9,
        }],
        summary: Some(ObservedSummary {
            request: "fix the login regression".to_string(),
            learned: "the refresh token expired early".to_string(),
            ..Default::default()
        }),
        skip_summary_reason: None,
        usage: None,
    });

    let req = FlushRequest {
        opencode_session_id: "oc-1".to_string(),
        cwd: "/repo".to_string(),
        project: Some("codemem".to_string()),
        user: "dev".to_string(),
        start_event_seq: 1,
        end_event_seq: 2,
        extractor_version: "v1".to_string(),
        observer_max_chars: 24_000,
        observer_max_events: 40,
    };

    let outcome = run_flush(&pool, &observer, "dev-a", req).await.unwrap();
    let memory_ids = match outcome {
        FlushOutcome::Processed { memory_ids, .. } => memory_ids,
        other => panic!("expected Processed, got {other:?}"),
    };
    assert_eq!(memory_ids.len(), 2); // one observation + one session_summary

    let recall = hybrid_recall(&pool, None, "login regression", 10, RecallFilters::default()).await.unwrap();
    assert!(!recall.items.is_empty());

    let candidates = pool
        .interact(move |conn| {
            let mut items = Vec::new();
            for id in &memory_ids {
                items.push(get_memory_item(conn, *id)?.unwrap());
            }
            Ok::<_, anyhow::Error>(items)
        })
        .await
        .unwrap();
    let pack = codemem::db::memory::assemble_pack(&candidates, "login regression", None, &Default::default());
    assert!(!pack.is_empty());
    assert_eq!(pack.summary.len(), 1);
}

// -- Replication convergence ----------------------------------------------

#[tokio::test]
async fn applying_ops_from_remember_and_forget_converges_regardless_of_order() {
    let source_pool = DatabasePool::open_in_memory().await.unwrap();
    let ops = source_pool
        .interact(|conn| {
            run_all_migrations(conn)?;
            let session_id = seed_session(conn, "alpha");
            let id_a = remember(conn, session_id, "note", "first note", "body a", 0.9, "dev-a", RememberOptions::default())?;
            let _id_b = remember(conn, session_id, "note", "second note", "body b", 0.9, "dev-a", RememberOptions::default())?;
            forget(conn, id_a, "dev-a")?;

            let mut stmt = conn.prepare(
                "SELECT op_id, entity_type, entity_id, op_type, payload, rev, clock_updated_at, clock_device_id, device_id, created_at
                 FROM replication_ops ORDER BY created_at, op_id",
            )?;
            let ops: Vec<ReplicationOp> = stmt
                .query_map([], |r| {
                    Ok(ReplicationOp {
                        op_id: r.get(0)?,
                        entity_type: r.get(1)?,
                        entity_id: r.get(2)?,
                        op_type: r.get(3)?,
                        payload: serde_json::from_str::<serde_json::Value>(&r.get::<_, String>(4)?).unwrap(),
                        rev: r.get(5)?,
                        clock_updated_at: r.get(6)?,
                        clock_device_id: r.get(7)?,
                        device_id: r.get(8)?,
                        created_at: r.get(9)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok::<_, anyhow::Error>(ops)
        })
        .await
        .unwrap();
    assert_eq!(ops.len(), 3); // two upserts, one delete

    let forward = rusqlite::Connection::open_in_memory().unwrap();
    run_all_migrations(&forward).unwrap();
    for op in &ops {
        apply_op(&forward, op).unwrap();
    }

    let mut reversed = ops.clone();
    reversed.reverse();
    let backward = rusqlite::Connection::open_in_memory().unwrap();
    run_all_migrations(&backward).unwrap();
    for op in &reversed {
        apply_op(&backward, op).unwrap();
    }

    let snapshot = |conn: &rusqlite::Connection| -> Vec<(String, i64, bool)> {
        let mut stmt = conn.prepare("SELECT import_key, rev, active FROM memory_items ORDER BY import_key").unwrap();
        stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?, r.get::<_, i64>(2)? != 0)))
            .unwrap()
            .collect::<rusqlite::Result<Vec<_>>>()
            .unwrap()
    };

    assert_eq!(snapshot(&forward), snapshot(&backward));
    let rows = snapshot(&forward);
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().any(|(_, _, active)| !*active)); // the forgotten one stays inactive
}

#[tokio::test]
async fn sync_error_variants_map_to_the_status_codes_the_server_relies_on() {
    // The ApiError mapping every handler above goes through is grounded in
    // Error::status_code rather than a bespoke literal per handler.
    assert_eq!(Error::Unauthorized("x".to_string()).status_code(), 401);
    assert_eq!(Error::Forbidden("x".to_string()).status_code(), 403);
    assert_eq!(Error::PayloadTooLarge("x".to_string()).status_code(), 413);
    assert_eq!(Error::TooManyOps("x".to_string()).status_code(), 413);
}
