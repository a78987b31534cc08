// Raw-event -> transcript assembly (§4.6 steps 1-6): tool-event extraction,
// low-signal filtering, compaction, dedup, importance budgeting, and the
// plain-text transcript the Observer reads alongside structured fields.

use super::types::{is_low_signal_tool, ToolEvent, LOW_SIGNAL_EXACT_OUTPUTS};
use crate::db::types::RawEvent;
use crate::utils::text::{redact, strip_private, truncate_text};
use std::collections::HashSet;

/// Per-tool-type output caps (bytes) applied before dedup/budgeting, so one
/// enormous `read` doesn't crowd out everything else.
const MAX_OUTPUT_BYTES_DEFAULT: usize = 2_000;
const MAX_OUTPUT_BYTES_BASH: usize = 4_000;
const MAX_OUTPUT_LINES: usize = 80;

fn compact_output(tool: &str, raw: &str) -> String {
    let sanitized = redact(&strip_private(raw));
    let line_capped: String = sanitized.lines().take(MAX_OUTPUT_LINES).collect::<Vec<_>>().join("\n");
    let cap = if tool == "bash" { MAX_OUTPUT_BYTES_BASH } else { MAX_OUTPUT_BYTES_DEFAULT };
    truncate_text(&line_capped, cap)
}

/// Reads a `bash` tool event's command out of its input payload, used for
/// the `git status`/`git diff` collapse rule.
fn bash_command(event: &ToolEvent) -> Option<&str> {
    event.input.get("command").and_then(|v| v.as_str())
}

/// `git status`/`git diff` invocations collapse to a fixed key so repeated
/// polling within one turn contributes one tool event, not N.
fn collapse_key(event: &ToolEvent) -> Option<&'static str> {
    if event.tool != "bash" {
        return None;
    }
    let command = bash_command(event)?.trim();
    if command == "git status" || command.starts_with("git status ") {
        Some("bash:git status")
    } else if command == "git diff" || command.starts_with("git diff ") {
        Some("bash:git diff")
    } else {
        None
    }
}

/// Extracts `ToolEvent`s from `tool.execute.after` raw events in session
/// order, dropping low-signal tools and compacting outputs. Does not yet
/// dedup or budget — see `dedup_tool_events`/`budget_tool_events`.
pub fn extract_tool_events(events: &[RawEvent]) -> Vec<ToolEvent> {
    events
        .iter()
        .filter(|e| e.event_type == "tool.execute.after")
        .filter_map(|e| {
            let tool = e.payload_json.get("tool")?.as_str()?.to_string();
            if is_low_signal_tool(&tool) {
                return None;
            }
            let input = e.payload_json.get("input").cloned().unwrap_or(serde_json::Value::Null);
            let output = e.payload_json.get("output").and_then(|v| v.as_str()).map(|s| compact_output(&tool, s));
            let error = e.payload_json.get("error").and_then(|v| v.as_str()).map(|s| compact_output(&tool, s));
            let title = e.payload_json.get("title").and_then(|v| v.as_str()).map(str::to_string);

            if output.as_deref().map(|o| LOW_SIGNAL_EXACT_OUTPUTS.contains(&o.trim())).unwrap_or(false) && error.is_none() {
                return None;
            }

            Some(ToolEvent { tool, input, output, error, title })
        })
        .collect()
}

/// Deduplicates by stable signature, with the `git status`/`git diff`
/// collapse applied first. Keeps the first (earliest) occurrence of each key.
pub fn dedup_tool_events(events: Vec<ToolEvent>) -> Vec<ToolEvent> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::new();
    for event in events {
        let key = collapse_key(&event).map(str::to_string).unwrap_or_else(|| event.signature());
        if seen.insert(key) {
            out.push(event);
        }
    }
    out
}

/// Budgets events by importance (error > edit/write > bash > read > other,
/// stable within a tier) until `max_total_chars` or `max_events` is reached.
/// Returns events in their *original* relative order, not importance order,
/// so the transcript the Observer reads stays chronological.
pub fn budget_tool_events(events: Vec<ToolEvent>, max_total_chars: usize, max_events: usize) -> Vec<ToolEvent> {
    let mut indexed: Vec<(usize, ToolEvent)> = events.into_iter().enumerate().collect();
    indexed.sort_by(|a, b| b.1.importance().cmp(&a.1.importance()).then(a.0.cmp(&b.0)));

    let mut kept_indices: HashSet<usize> = HashSet::new();
    let mut total_chars = 0usize;
    for (idx, event) in &indexed {
        if kept_indices.len() >= max_events {
            break;
        }
        let cost = event.approx_chars();
        if !kept_indices.is_empty() && total_chars + cost > max_total_chars {
            continue;
        }
        kept_indices.insert(*idx);
        total_chars += cost;
    }

    indexed.into_iter().filter(|(idx, _)| kept_indices.contains(idx)).map(|(_, e)| e).collect()
}

/// Full pipeline from raw events to a budgeted, deduplicated tool-event list.
pub fn build_tool_events(events: &[RawEvent], max_total_chars: usize, max_events: usize) -> Vec<ToolEvent> {
    let extracted = extract_tool_events(events);
    let deduped = dedup_tool_events(extracted);
    budget_tool_events(deduped, max_total_chars, max_events)
}

/// Builds the plain-text transcript handed to the Observer: the user prompt,
/// then one line per tool event, then the assistant's closing message.
pub fn build_transcript(user_prompt: &str, tool_events: &[ToolEvent], last_assistant_message: Option<&str>) -> String {
    let mut out = String::new();
    out.push_str("User: ");
    out.push_str(redact(user_prompt.trim()).as_str());
    out.push('\n');

    for event in tool_events {
        out.push_str("Tool[");
        out.push_str(&event.tool);
        out.push(']');
        if let Some(title) = &event.title {
            out.push_str(": ");
            out.push_str(title);
        }
        out.push('\n');
        if let Some(error) = &event.error {
            out.push_str("  error: ");
            out.push_str(error);
            out.push('\n');
        } else if let Some(output) = &event.output {
            out.push_str("  output: ");
            out.push_str(output);
            out.push('\n');
        }
    }

    if let Some(message) = last_assistant_message {
        out.push_str("Assistant: ");
        out.push_str(redact(message.trim()).as_str());
        out.push('\n');
    }

    out
}

/// Recent-file list for `ObserverContext.recent_files`: the union of tool
/// inputs' `filePath`/`path` fields across the budgeted event list, in
/// first-seen order, capped at 20.
pub fn recent_files(tool_events: &[ToolEvent]) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::new();
    for event in tool_events {
        for key in ["filePath", "path"] {
            if let Some(path) = event.input.get(key).and_then(|v| v.as_str()) {
                if seen.insert(path.to_string()) {
                    out.push(path.to_string());
                    if out.len() >= 20 {
                        return out;
                    }
                }
            }
        }
    }
    out
}
