// Shapes passed into and out of the Observer capability (§4.6), plus the
// keyword/prefix tables that drive tool-event filtering and the
// trivial-request early exit.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tool names that never carry durable signal: UI chrome, shell dispatch
/// wrappers, and the memory tools themselves (extracting from a memory
/// lookup would feed the pipeline its own output).
pub const LOW_SIGNAL_TOOLS: &[&str] =
    &["tui", "shell", "cmd", "task", "slashcommand", "skill", "todowrite", "askuserquestion"];

/// Tool names beginning with this prefix are always dropped, regardless of
/// the `LOW_SIGNAL_TOOLS` exact-match list (`memory_recall`, `memory_pack`, …).
pub const MEMORY_RETRIEVAL_TOOL_PREFIX: &str = "memory_";

/// Normalizes to one of these (after lowercasing and trimming trailing
/// punctuation) and having no tool events or assistant message triggers the
/// trivial-request early exit.
pub const TRIVIAL_PROMPT_AFFIRMATIONS: &[&str] = &[
    "ok", "okay", "yes", "yeah", "yep", "sure", "lgtm", "thanks", "thank you", "continue",
    "proceed", "go ahead", "go on", "sounds good", "do it", "looks good",
];

/// `MemoryKind`s the Observer may emit as observations; anything else is
/// dropped as a malformed extractor result rather than stored.
pub const PERSISTABLE_OBSERVATION_KINDS: &[&str] =
    &["observation", "entities", "note", "decision", "discovery", "change", "feature", "bugfix", "refactor", "exploration"];

/// Tool outputs that carry no signal no matter which tool produced them —
/// dropped before transcript assembly rather than stored verbatim.
pub const LOW_SIGNAL_EXACT_OUTPUTS: &[&str] = &["", "ok", "done", "no output", "(no output)", "null"];

/// Importance tiers used to budget tool events under `max_total_chars` /
/// `max_events`; higher sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ToolImportance {
    Other = 0,
    Read = 1,
    Bash = 2,
    EditWrite = 3,
    Error = 4,
}

/// One tool invocation surfaced to the Observer after dedup/compaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolEvent {
    pub tool: String,
    pub input: Value,
    pub output: Option<String>,
    pub error: Option<String>,
    pub title: Option<String>,
}

impl ToolEvent {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn importance(&self) -> ToolImportance {
        if self.is_error() {
            return ToolImportance::Error;
        }
        match self.tool.as_str() {
            "edit" | "write" | "patch" | "multiedit" => ToolImportance::EditWrite,
            "bash" => ToolImportance::Bash,
            "read" | "grep" | "glob" | "list" => ToolImportance::Read,
            _ => ToolImportance::Other,
        }
    }

    /// Stable dedup signature: tool name, canonical-JSON input, and the
    /// first 200 chars of output or error. `bash:git status`/`bash:git diff`
    /// collapse further in `transcript::dedup_tool_events`.
    pub fn signature(&self) -> String {
        let canonical_input = serde_json::to_string(&crate::utils::json::canonicalize(&self.input)).unwrap_or_default();
        let tail: &str = self.error.as_deref().or(self.output.as_deref()).unwrap_or("");
        let tail_prefix: String = tail.chars().take(200).collect();
        format!("{}|{}|{}", self.tool, canonical_input, tail_prefix)
    }

    /// Approximate char cost for budgeting: tool name, input, output, error.
    pub fn approx_chars(&self) -> usize {
        self.tool.len()
            + serde_json::to_string(&self.input).map(|s| s.len()).unwrap_or(0)
            + self.output.as_ref().map_or(0, |s| s.len())
            + self.error.as_ref().map_or(0, |s| s.len())
    }
}

/// Context handed to the Observer capability for one prompt turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObserverContext {
    pub project: Option<String>,
    pub user_prompt: String,
    pub prompt_number: Option<i64>,
    pub tool_events: Vec<ToolEvent>,
    pub last_assistant_message: Option<String>,
    pub diff_summary: Option<String>,
    pub recent_files: Vec<String>,
}

/// One candidate memory item the Observer wants persisted.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ObservedItem {
    pub kind: String,
    pub title: String,
    pub narrative: String,
    #[serde(default)]
    pub facts: Vec<String>,
    #[serde(default)]
    pub concepts: Vec<String>,
    #[serde(default)]
    pub files_read: Vec<String>,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_confidence() -> f64 {
    0.7
}

/// Narrative structure for a `SessionSummary`, as returned by the Observer.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ObservedSummary {
    pub request: String,
    #[serde(default)]
    pub investigated: String,
    #[serde(default)]
    pub learned: String,
    #[serde(default)]
    pub completed: String,
    #[serde(default)]
    pub next_steps: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub files_read: Vec<String>,
    #[serde(default)]
    pub files_edited: Vec<String>,
}

/// Usage totals reported by the model backing the Observer, when available.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct ObserverUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Result of one Observer invocation.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ParsedOutput {
    #[serde(default)]
    pub observations: Vec<ObservedItem>,
    pub summary: Option<ObservedSummary>,
    pub skip_summary_reason: Option<String>,
    #[serde(default)]
    pub usage: Option<ObserverUsage>,
}

impl ParsedOutput {
    /// The invariant in §4.6 step 8: a raw-event flush must fail (not
    /// silently no-op) if the Observer produced nothing at all.
    pub fn is_empty_output(&self) -> bool {
        self.observations.is_empty() && self.summary.is_none()
    }
}

/// Checks whether a normalized prompt is one of the recognized trivial
/// affirmations (after lowercasing and trimming trailing punctuation/space).
pub fn is_trivial_affirmation(prompt: &str) -> bool {
    let trimmed = prompt.trim().to_lowercase();
    let trimmed = trimmed.trim_end_matches(|c: char| c.is_ascii_punctuation() || c.is_whitespace());
    TRIVIAL_PROMPT_AFFIRMATIONS.contains(&trimmed)
}

/// A tool name is dropped if it exact-matches `LOW_SIGNAL_TOOLS` or begins
/// with the memory-retrieval prefix.
pub fn is_low_signal_tool(tool: &str) -> bool {
    LOW_SIGNAL_TOOLS.contains(&tool) || tool.starts_with(MEMORY_RETRIEVAL_TOOL_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_trivial_affirmation_matches_known_forms() {
        assert!(is_trivial_affirmation("  LGTM!  "));
        assert!(is_trivial_affirmation("ok."));
        assert!(!is_trivial_affirmation("ok but also fix the login bug"));
    }

    #[test]
    fn is_low_signal_tool_matches_exact_and_prefix() {
        assert!(is_low_signal_tool("shell"));
        assert!(is_low_signal_tool("memory_recall"));
        assert!(!is_low_signal_tool("edit"));
    }

    #[test]
    fn tool_event_importance_ranks_error_above_edit_above_bash_above_read() {
        let error = ToolEvent { tool: "read".into(), input: Value::Null, output: None, error: Some("boom".into()), title: None };
        let edit = ToolEvent { tool: "edit".into(), input: Value::Null, output: Some("ok".into()), error: None, title: None };
        let bash = ToolEvent { tool: "bash".into(), input: Value::Null, output: Some("ok".into()), error: None, title: None };
        let read = ToolEvent { tool: "read".into(), input: Value::Null, output: Some("ok".into()), error: None, title: None };
        assert!(error.importance() > edit.importance());
        assert!(edit.importance() > bash.importance());
        assert!(bash.importance() > read.importance());
    }

    #[test]
    fn tool_event_signature_ignores_output_past_200_chars() {
        let a = ToolEvent { tool: "bash".into(), input: Value::Null, output: Some(format!("{}x", "a".repeat(300))), error: None, title: None };
        let b = ToolEvent { tool: "bash".into(), input: Value::Null, output: Some(format!("{}y", "a".repeat(300))), error: None, title: None };
        assert_eq!(a.signature(), b.signature());
    }

    #[test]
    fn parsed_output_empty_only_when_no_observations_and_no_summary() {
        assert!(ParsedOutput::default().is_empty_output());
        let with_summary = ParsedOutput { summary: Some(ObservedSummary::default()), ..Default::default() };
        assert!(!with_summary.is_empty_output());
    }
}
