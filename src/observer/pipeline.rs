// Orchestrates one Observer Pipeline run over a flush batch (§4.6): claim,
// assemble context, invoke the Observer, persist, and enforce the
// raw-event-flush-fails-on-empty-output invariant. Split into three phases
// because a `rusqlite::Connection` borrow can't cross the `.await` on
// `Observer::observe` — the same two-phase shape `raw_events::sweeper`
// documents for its own async caller.

use super::provider::Observer;
use super::transcript;
use super::types::{is_trivial_affirmation, ObserverContext, ParsedOutput, PERSISTABLE_OBSERVATION_KINDS};
use crate::db::memory::ranking::estimated_token_cost;
use crate::db::memory::{remember, RememberOptions};
use crate::db::pool::DatabasePool;
use crate::db::session::{self, NewSession, NewSessionSummary};
use crate::db::types::RawEvent;
use crate::error::{Error, Result};
use crate::raw_events::{claim_batch, complete_batch, events_in_range, fail_batch, get_or_create_batch};
use crate::utils::text::strip_private;
use rusqlite::Connection;

#[derive(Debug, Clone)]
pub struct FlushRequest {
    pub opencode_session_id: String,
    pub cwd: String,
    pub project: Option<String>,
    pub user: String,
    pub start_event_seq: i64,
    pub end_event_seq: i64,
    pub extractor_version: String,
    pub observer_max_chars: usize,
    pub observer_max_events: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FlushOutcome {
    /// Batch had already reached `completed`; nothing to do.
    AlreadyCompleted,
    /// Another worker holds the claim; caller should retry later.
    ClaimFailed,
    /// Trivial-request early exit: no Observer call was made.
    TrivialSkip { batch_id: i64, session_id: i64 },
    Processed { batch_id: i64, session_id: i64, memory_ids: Vec<i64>, session_summary_id: Option<i64> },
}

enum Prepared {
    AlreadyCompleted,
    ClaimFailed,
    Trivial { batch_id: i64, session_id: i64 },
    NeedsObserver { batch_id: i64, session_id: i64, context: ObserverContext },
}

fn bash_diff_output(events: &[super::types::ToolEvent]) -> Option<String> {
    events
        .iter()
        .find(|e| e.tool == "bash" && e.input.get("command").and_then(|v| v.as_str()).is_some_and(|c| c.trim().starts_with("git diff")))
        .and_then(|e| e.output.clone())
}

fn prepare_flush(conn: &Connection, req: &FlushRequest) -> Result<Prepared> {
    let batch = get_or_create_batch(conn, &req.opencode_session_id, req.start_event_seq, req.end_event_seq, &req.extractor_version)?;
    if batch.status == "completed" {
        return Ok(Prepared::AlreadyCompleted);
    }
    if !claim_batch(conn, batch.id)? {
        return Ok(Prepared::ClaimFailed);
    }

    let events: Vec<RawEvent> = events_in_range(conn, &req.opencode_session_id, req.start_event_seq, req.end_event_seq)?;
    let session_id = session::open_or_create_for_opencode(
        conn,
        &req.opencode_session_id,
        &req.cwd,
        &req.user,
        NewSession { project: req.project.clone(), ..Default::default() },
    )?;

    let mut latest_prompt_text = String::new();
    let mut latest_prompt_number = None;
    for event in &events {
        if event.event_type != "user.prompt" {
            continue;
        }
        let raw_text = event.payload_json.get("text").and_then(|v| v.as_str()).unwrap_or_default();
        let sanitized = strip_private(raw_text);
        let prompt_number = event.payload_json.get("prompt_number").and_then(|v| v.as_i64());
        session::record_user_prompt(conn, session_id, &sanitized, prompt_number, None)?;
        latest_prompt_text = sanitized;
        latest_prompt_number = prompt_number;
    }

    let mut last_assistant_message = None;
    for event in &events {
        if event.event_type == "assistant.message" {
            if let Some(text) = event.payload_json.get("text").and_then(|v| v.as_str()) {
                last_assistant_message = Some(strip_private(text));
            }
        }
    }

    let tool_events = transcript::build_tool_events(&events, req.observer_max_chars, req.observer_max_events);
    let recent_files = transcript::recent_files(&tool_events);
    let diff_summary = bash_diff_output(&tool_events);

    if is_trivial_affirmation(&latest_prompt_text) && tool_events.is_empty() && last_assistant_message.is_none() {
        return Ok(Prepared::Trivial { batch_id: batch.id, session_id });
    }

    let context = ObserverContext {
        project: req.project.clone(),
        user_prompt: latest_prompt_text,
        prompt_number: latest_prompt_number,
        tool_events,
        last_assistant_message,
        diff_summary,
        recent_files,
    };

    Ok(Prepared::NeedsObserver { batch_id: batch.id, session_id, context })
}

fn persist_observer_result(
    conn: &Connection,
    batch_id: i64,
    session_id: i64,
    opencode_session_id: &str,
    prompt_number: Option<i64>,
    device_id: &str,
    output: ParsedOutput,
) -> Result<(Vec<i64>, Option<i64>)> {
    if output.is_empty_output() {
        fail_batch(conn, batch_id)?;
        return Err(Error::ObserverFailure("observer returned no observations or summary".to_string()));
    }

    let discovery_group = match prompt_number {
        Some(n) => format!("{opencode_session_id}:p{n}"),
        None => format!("{opencode_session_id}:session"),
    };
    let reported_tokens = output.usage.map(|u| u.total_tokens as usize);

    let mut memory_ids = Vec::new();
    for obs in &output.observations {
        if !PERSISTABLE_OBSERVATION_KINDS.contains(&obs.kind.as_str()) {
            continue;
        }
        if obs.title.trim().len() < 3 || obs.narrative.trim().len() < 10 {
            continue;
        }
        let discovery_tokens = reported_tokens.unwrap_or_else(|| estimated_token_cost(&obs.narrative));
        let metadata = serde_json::json!({
            "discovery_group": discovery_group,
            "discovery_tokens": discovery_tokens,
            "discovery_source": "observer",
        });
        let opts = RememberOptions {
            facts: obs.facts.clone(),
            concepts: obs.concepts.clone(),
            files_read: obs.files_read.clone(),
            files_modified: obs.files_modified.clone(),
            prompt_number,
            metadata: Some(metadata),
            ..Default::default()
        };
        let id = remember(conn, session_id, &obs.kind, &obs.title, &obs.narrative, obs.confidence.clamp(0.0, 1.0), device_id, opts)?;
        memory_ids.push(id);
    }

    let mut session_summary_id = None;
    if let Some(summary) = &output.summary {
        let discovery_tokens = reported_tokens.unwrap_or_else(|| estimated_token_cost(&summary.learned));
        let metadata = serde_json::json!({
            "discovery_group": discovery_group,
            "discovery_tokens": discovery_tokens,
            "discovery_source": "observer",
        });
        let opts = RememberOptions {
            prompt_number,
            metadata: Some(metadata),
            files_read: summary.files_read.clone(),
            files_modified: summary.files_edited.clone(),
            ..Default::default()
        };
        let memory_item_id = remember(conn, session_id, "session_summary", &summary.request, &summary.learned, 0.8, device_id, opts)?;
        memory_ids.push(memory_item_id);

        let new_summary = NewSessionSummary {
            memory_item_id: Some(memory_item_id),
            request: summary.request.clone(),
            investigated: summary.investigated.clone(),
            learned: summary.learned.clone(),
            completed: summary.completed.clone(),
            next_steps: summary.next_steps.clone(),
            notes: summary.notes.clone(),
            files_read: summary.files_read.clone(),
            files_edited: summary.files_edited.clone(),
            prompt_number,
        };
        session_summary_id = Some(session::record_session_summary(conn, session_id, new_summary)?);
    }

    complete_batch(conn, batch_id)?;
    session::end_session(conn, session_id)?;
    Ok((memory_ids, session_summary_id))
}

/// Runs the full pipeline for one flush batch against a live pool.
pub async fn run_flush(pool: &DatabasePool, observer: &dyn Observer, device_id: &str, req: FlushRequest) -> Result<FlushOutcome> {
    let prepare_req = req.clone();
    let prepared = pool.run(move |conn| prepare_flush(conn, &prepare_req)).await?;

    match prepared {
        Prepared::AlreadyCompleted => Ok(FlushOutcome::AlreadyCompleted),
        Prepared::ClaimFailed => Ok(FlushOutcome::ClaimFailed),
        Prepared::Trivial { batch_id, session_id } => {
            pool.run(move |conn| -> Result<()> {
                complete_batch(conn, batch_id)?;
                session::end_session(conn, session_id)?;
                Ok(())
            })
            .await?;
            Ok(FlushOutcome::TrivialSkip { batch_id, session_id })
        }
        Prepared::NeedsObserver { batch_id, session_id, context } => {
            let prompt_number = context.prompt_number;
            match observer.observe(&context).await {
                Ok(output) => {
                    let device_id = device_id.to_string();
                    let opencode_session_id = req.opencode_session_id.clone();
                    let (memory_ids, session_summary_id) = pool
                        .run(move |conn| persist_observer_result(conn, batch_id, session_id, &opencode_session_id, prompt_number, &device_id, output))
                        .await?;
                    Ok(FlushOutcome::Processed { batch_id, session_id, memory_ids, session_summary_id })
                }
                Err(e) => {
                    pool.run(move |conn| fail_batch(conn, batch_id)).await?;
                    Err(e)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::run_all_migrations;
    use crate::observer::types::{ObservedItem, ObservedSummary};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    struct FixedObserver(Mutex<ParsedOutput>);

    #[async_trait]
    impl Observer for FixedObserver {
        async fn observe(&self, _context: &ObserverContext) -> Result<ParsedOutput> {
            Ok(self.0.lock().unwrap().clone())
        }
    }

    struct FailingObserver;

    #[async_trait]
    impl Observer for FailingObserver {
        async fn observe(&self, _context: &ObserverContext) -> Result<ParsedOutput> {
            Err(Error::ObserverFailure("boom".into()))
        }
    }

    fn seed_events(pool_conn: &Connection) {
        run_all_migrations(pool_conn).unwrap();
        crate::raw_events::record(pool_conn, "oc-1", "e1", "user.prompt", &json!({"text": "fix the login bug", "prompt_number": 1}), None, Some(1)).unwrap();
        crate::raw_events::record(pool_conn, "oc-1", "e2", "tool.execute.after", &json!({"tool": "edit", "input": {"filePath": "src/auth.rs"}, "output": "wrote file"}), None, Some(2)).unwrap();
        crate::raw_events::record(pool_conn, "oc-1", "e3", "assistant.message", &json!({"text": "Fixed the race condition in token refresh."}), None, Some(3)).unwrap();
    }

    fn base_request() -> FlushRequest {
        FlushRequest {
            opencode_session_id: "oc-1".into(),
            cwd: "/tmp/proj".into(),
            project: Some("proj".into()),
            user: "dev".into(),
            start_event_seq: 1,
            end_event_seq: 3,
            extractor_version: "v1".into(),
            observer_max_chars: 24_000,
            observer_max_events: 40,
        }
    }

    #[tokio::test]
    async fn processes_a_flush_and_persists_observation() {
        let pool = DatabasePool::open_in_memory().await.unwrap();
        pool.interact(|conn| {
            seed_events(conn);
            Ok::<_, anyhow::Error>(())
        })
        .await
        .unwrap();

        let output = ParsedOutput {
            observations: vec![ObservedItem {
                kind: "bugfix".into(),
                title: "Fixed token refresh race".into(),
                narrative: "The refresh token call raced with the logout handler.".into(),
                confidence: 0.9,
                ..Default::default()
            }],
            summary: None,
            skip_summary_reason: None,
            usage: None,
        };
        let observer = FixedObserver(Mutex::new(output));

        let outcome = run_flush(&pool, &observer, "dev-a", base_request()).await.unwrap();
        match outcome {
            FlushOutcome::Processed { memory_ids, .. } => assert_eq!(memory_ids.len(), 1),
            other => panic!("expected Processed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_observer_output_fails_the_batch() {
        let pool = DatabasePool::open_in_memory().await.unwrap();
        pool.interact(|conn| {
            seed_events(conn);
            Ok::<_, anyhow::Error>(())
        })
        .await
        .unwrap();

        let observer = FixedObserver(Mutex::new(ParsedOutput::default()));
        let err = run_flush(&pool, &observer, "dev-a", base_request()).await.unwrap_err();
        assert!(matches!(err, Error::ObserverFailure(_)));

        let status: String = pool
            .interact(|conn| Ok::<_, anyhow::Error>(conn.query_row("SELECT status FROM raw_event_flush_batches LIMIT 1", [], |r| r.get(0))?))
            .await
            .unwrap();
        assert_eq!(status, "failed");
    }

    #[tokio::test]
    async fn observer_error_fails_the_batch_without_advancing_cursor() {
        let pool = DatabasePool::open_in_memory().await.unwrap();
        pool.interact(|conn| {
            seed_events(conn);
            Ok::<_, anyhow::Error>(())
        })
        .await
        .unwrap();

        let err = run_flush(&pool, &FailingObserver, "dev-a", base_request()).await.unwrap_err();
        assert!(matches!(err, Error::ObserverFailure(_)));

        let last_flushed: i64 = pool
            .interact(|conn| Ok::<_, anyhow::Error>(conn.query_row("SELECT last_flushed_event_seq FROM raw_event_sessions WHERE opencode_session_id = 'oc-1'", [], |r| r.get(0))?))
            .await
            .unwrap();
        assert_eq!(last_flushed, 0);
    }

    #[tokio::test]
    async fn trivial_affirmation_with_no_tool_events_skips_observer_call() {
        let pool = DatabasePool::open_in_memory().await.unwrap();
        pool.interact(|conn| {
            run_all_migrations(conn).unwrap();
            crate::raw_events::record(conn, "oc-2", "e1", "user.prompt", &json!({"text": "lgtm", "prompt_number": 1}), None, Some(1)).unwrap();
            Ok::<_, anyhow::Error>(())
        })
        .await
        .unwrap();

        let mut req = base_request();
        req.opencode_session_id = "oc-2".into();
        req.end_event_seq = 1;

        let outcome = run_flush(&pool, &FailingObserver, "dev-a", req).await.unwrap();
        assert!(matches!(outcome, FlushOutcome::TrivialSkip { .. }));
    }

    #[tokio::test]
    async fn already_completed_batch_is_not_reprocessed() {
        let pool = DatabasePool::open_in_memory().await.unwrap();
        pool.interact(|conn| {
            seed_events(conn);
            Ok::<_, anyhow::Error>(())
        })
        .await
        .unwrap();

        let output = ParsedOutput {
            observations: vec![ObservedItem { kind: "note".into(), title: "Noted".into(), narrative: "Something worth remembering here.".into(), ..Default::default() }],
            summary: Some(ObservedSummary { request: "fix login".into(), learned: "token races".into(), ..Default::default() }),
            skip_summary_reason: None,
            usage: None,
        };
        let observer = FixedObserver(Mutex::new(output));

        run_flush(&pool, &observer, "dev-a", base_request()).await.unwrap();
        let second = run_flush(&pool, &observer, "dev-a", base_request()).await.unwrap();
        assert_eq!(second, FlushOutcome::AlreadyCompleted);
    }
}
