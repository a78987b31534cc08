// Row/value types for the entities in the data model. These are plain
// structs hand-mapped from `rusqlite::Row`, not an ORM: the storage layer is
// thin enough that a macro layer would cost more than it saves.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: i64,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub cwd: String,
    pub project: Option<String>,
    pub git_remote: Option<String>,
    pub git_branch: Option<String>,
    pub user: String,
    pub tool_version: Option<String>,
    pub metadata: Value,
    pub import_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpencodeSession {
    pub id: i64,
    pub external_id: String,
    pub session_id: i64,
    pub created_at: String,
}

/// Memory kinds accepted by `remember`/`remember_observation`. `project` is
/// a legacy synonym that maps onto `Decision` with an explicit error surfaced
/// to the caller rather than silently coerced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    SessionSummary,
    Observation,
    Entities,
    Note,
    Decision,
    Discovery,
    Change,
    Feature,
    Bugfix,
    Refactor,
    Exploration,
}

impl MemoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryKind::SessionSummary => "session_summary",
            MemoryKind::Observation => "observation",
            MemoryKind::Entities => "entities",
            MemoryKind::Note => "note",
            MemoryKind::Decision => "decision",
            MemoryKind::Discovery => "discovery",
            MemoryKind::Change => "change",
            MemoryKind::Feature => "feature",
            MemoryKind::Bugfix => "bugfix",
            MemoryKind::Refactor => "refactor",
            MemoryKind::Exploration => "exploration",
        }
    }

    /// Parses a kind string, mapping the legacy `project` synonym onto
    /// `Decision` and rejecting anything else unrecognized.
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        Ok(match raw {
            "session_summary" => MemoryKind::SessionSummary,
            "observation" => MemoryKind::Observation,
            "entities" => MemoryKind::Entities,
            "note" => MemoryKind::Note,
            "decision" => MemoryKind::Decision,
            "discovery" => MemoryKind::Discovery,
            "change" => MemoryKind::Change,
            "feature" => MemoryKind::Feature,
            "bugfix" => MemoryKind::Bugfix,
            "refactor" => MemoryKind::Refactor,
            "exploration" => MemoryKind::Exploration,
            "project" => {
                return Err(crate::error::Error::InvalidInput(
                    "memory kind 'project' is a legacy synonym for 'decision'; use 'decision'"
                        .to_string(),
                ))
            }
            other => {
                return Err(crate::error::Error::InvalidInput(format!(
                    "unknown memory kind: {other}"
                )))
            }
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryItem {
    pub id: i64,
    pub session_id: i64,
    pub kind: String,
    pub title: String,
    pub body_text: String,
    pub subtitle: Option<String>,
    pub facts: Vec<String>,
    pub concepts: Vec<String>,
    pub files_read: Vec<String>,
    pub files_modified: Vec<String>,
    pub prompt_number: Option<i64>,
    pub user_prompt_id: Option<i64>,
    pub confidence: f64,
    pub tags_text: String,
    pub active: bool,
    pub created_at: String,
    pub updated_at: String,
    pub deleted_at: Option<String>,
    pub rev: i64,
    pub metadata: Value,
    pub import_key: String,
}

impl MemoryItem {
    /// `(rev, updated_at, device_id)` used for last-writer-wins comparison.
    pub fn clock(&self) -> (i64, String, String) {
        let device_id = self
            .metadata
            .get("clock_device_id")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        (self.rev, self.updated_at.clone(), device_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: i64,
    pub session_id: i64,
    pub memory_item_id: Option<i64>,
    pub request: String,
    pub investigated: String,
    pub learned: String,
    pub completed: String,
    pub next_steps: String,
    pub notes: String,
    pub files_read: Vec<String>,
    pub files_edited: Vec<String>,
    pub prompt_number: Option<i64>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPrompt {
    pub id: i64,
    pub session_id: i64,
    pub prompt_text: String,
    pub prompt_number: Option<i64>,
    pub created_at: String,
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: i64,
    pub session_id: i64,
    pub kind: String,
    pub path: Option<String>,
    pub content_text: String,
    pub content_hash: String,
    pub metadata: Value,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryVector {
    pub memory_id: i64,
    pub chunk_index: i64,
    pub model: String,
    pub content_hash: String,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    pub id: i64,
    pub opencode_session_id: String,
    pub event_seq: i64,
    pub event_id: String,
    pub event_type: String,
    pub ts_wall_ms: Option<i64>,
    pub ts_mono_ms: Option<i64>,
    pub payload_json: Value,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEventSession {
    pub opencode_session_id: String,
    pub cwd: Option<String>,
    pub project: Option<String>,
    pub started_at: Option<String>,
    pub last_seen_ts_wall_ms: Option<i64>,
    pub last_received_event_seq: i64,
    pub last_flushed_event_seq: i64,
}

/// Canonical flush-batch states. Legacy synonyms (`started`, `running`,
/// `error`) are accepted on every read-side match/claim query but never
/// written by new code paths (SPEC_FULL.md §9 decision).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushBatchStatus {
    Pending,
    Claimed,
    Completed,
    Failed,
}

impl FlushBatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushBatchStatus::Pending => "pending",
            FlushBatchStatus::Claimed => "claimed",
            FlushBatchStatus::Completed => "completed",
            FlushBatchStatus::Failed => "failed",
        }
    }

    /// Canonical values a claim may transition *from*, including legacy
    /// synonyms accepted for backward compatibility.
    pub fn claimable_values() -> &'static [&'static str] {
        &["pending", "failed", "started", "error"]
    }

    /// Canonical values counted as "claimed/running" for stuck-batch recovery,
    /// including legacy synonyms.
    pub fn in_progress_values() -> &'static [&'static str] {
        &["claimed", "started", "running"]
    }

    pub fn normalize(raw: &str) -> &'static str {
        match raw {
            "started" => "claimed",
            "running" => "claimed",
            "error" => "failed",
            "pending" | "claimed" | "completed" | "failed" => {
                match raw {
                    "pending" => "pending",
                    "claimed" => "claimed",
                    "completed" => "completed",
                    _ => "failed",
                }
            }
            _ => "pending",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEventFlushBatch {
    pub id: i64,
    pub opencode_session_id: String,
    pub start_event_seq: i64,
    pub end_event_seq: i64,
    pub extractor_version: String,
    pub status: String,
    pub attempt_count: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationOpType {
    Upsert,
    Delete,
}

impl ReplicationOpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicationOpType::Upsert => "upsert",
            ReplicationOpType::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationOp {
    pub op_id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub op_type: String,
    pub payload: Value,
    pub rev: i64,
    pub clock_updated_at: String,
    pub clock_device_id: String,
    pub device_id: String,
    pub created_at: String,
}

impl ReplicationOp {
    /// Cursor string for this op: `created_at|op_id`, comparable
    /// lexicographically.
    pub fn cursor(&self) -> String {
        format!("{}|{}", self.created_at, self.op_id)
    }

    pub fn clock(&self) -> (i64, String, String) {
        (self.rev, self.clock_updated_at.clone(), self.clock_device_id.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationCursor {
    pub peer_device_id: String,
    pub last_applied_cursor: Option<String>,
    pub last_acked_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncPeer {
    pub peer_device_id: String,
    pub name: Option<String>,
    pub pinned_fingerprint: String,
    pub public_key: String,
    pub addresses: Vec<String>,
    pub last_seen_at: Option<String>,
    pub last_sync_at: Option<String>,
    pub last_error: Option<String>,
    pub project_filter_include: Vec<String>,
    pub project_filter_exclude: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncDevice {
    pub device_id: String,
    pub public_key: String,
    pub fingerprint: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    pub id: i64,
    pub event: String,
    pub tokens_read: i64,
    pub tokens_written: i64,
    pub tokens_saved: i64,
    pub metadata: Value,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_kind_rejects_legacy_project_synonym() {
        let err = MemoryKind::parse("project").unwrap_err();
        assert!(matches!(err, crate::error::Error::InvalidInput(_)));
    }

    #[test]
    fn memory_kind_round_trips_known_values() {
        for raw in [
            "session_summary",
            "observation",
            "entities",
            "note",
            "decision",
            "discovery",
            "change",
            "feature",
            "bugfix",
            "refactor",
            "exploration",
        ] {
            let parsed = MemoryKind::parse(raw).unwrap();
            assert_eq!(parsed.as_str(), raw);
        }
    }

    #[test]
    fn flush_batch_status_normalizes_legacy_synonyms() {
        assert_eq!(FlushBatchStatus::normalize("started"), "claimed");
        assert_eq!(FlushBatchStatus::normalize("running"), "claimed");
        assert_eq!(FlushBatchStatus::normalize("error"), "failed");
        assert_eq!(FlushBatchStatus::normalize("completed"), "completed");
    }

    #[test]
    fn replication_op_cursor_is_created_at_pipe_op_id() {
        let op = ReplicationOp {
            op_id: "op-1".into(),
            entity_type: "memory_item".into(),
            entity_id: "k".into(),
            op_type: "upsert".into(),
            payload: serde_json::json!({}),
            rev: 1,
            clock_updated_at: "2024-01-01T00:00:00Z".into(),
            clock_device_id: "dev-a".into(),
            device_id: "dev-a".into(),
            created_at: "2024-01-01T00:00:01Z".into(),
        };
        assert_eq!(op.cursor(), "2024-01-01T00:00:01Z|op-1");
    }
}
