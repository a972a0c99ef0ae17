//! Raw log line to `MonitorEvent` classification.

use crate::event::{EventKind, Iteration, MonitorEvent, RawLine, Thinking, ToolCall, ToolResult};
use crate::record::LogRecord;
use crate::summary::{prefix, summarize_result_metadata, summarize_tool_call};
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

pub const SUMMARY_LIMIT: usize = 120;

const RECORD_KINDS: [&str; 3] = ["assistant", "user", "system"];

fn loop_marker() -> &'static Regex {
    static LOOP_MARKER: OnceLock<Regex> = OnceLock::new();
    LOOP_MARKER.get_or_init(|| Regex::new(r"=+\s*LOOP\s+(\d+)\s*=+").expect("valid regex"))
}

/// Parses one physical log line. Returns every event the line yields; most
/// lines yield one or none.
pub fn parse_line(line: &str, loop_id: &str) -> Vec<MonitorEvent> {
    let parsed = serde_json::from_str::<Value>(line.trim()).ok();
    parse_line_with(line, loop_id, parsed.as_ref())
}

/// Same as [`parse_line`] for callers that already hold the JSON form of the
/// line. `parsed` must be `None` when the trimmed line is not valid JSON.
pub fn parse_line_with(line: &str, loop_id: &str, parsed: Option<&Value>) -> Vec<MonitorEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    if let Some(number) = iteration_number(trimmed) {
        return vec![MonitorEvent::new(
            loop_id,
            format!("Iteration {number}"),
            EventKind::Iteration(Iteration {
                iteration_number: number,
            }),
        )];
    }

    let Some(value) = parsed else {
        return vec![MonitorEvent::new(
            loop_id,
            prefix(trimmed, SUMMARY_LIMIT),
            EventKind::Raw(RawLine {
                line: trimmed.to_string(),
            }),
        )];
    };

    parse_record(LogRecord::new(value), loop_id)
        .into_iter()
        .collect()
}

pub fn iteration_number(line: &str) -> Option<u64> {
    loop_marker()
        .captures(line)?
        .get(1)?
        .as_str()
        .parse()
        .ok()
}

fn parse_record(record: LogRecord<'_>, loop_id: &str) -> Option<MonitorEvent> {
    if !record.kind().is_some_and(|kind| RECORD_KINDS.contains(&kind)) {
        return None;
    }
    let entry = record.content()?.first()?;

    match entry.get("type").and_then(Value::as_str)? {
        "tool_use" => {
            let tool_name = string_field(entry, "name");
            let input = entry
                .get("input")
                .cloned()
                .unwrap_or_else(|| Value::Object(Default::default()));
            let summary = summarize_tool_call(&tool_name, &input);
            Some(MonitorEvent::new(
                loop_id,
                summary,
                EventKind::ToolCall(ToolCall {
                    tool_name,
                    tool_use_id: string_field(entry, "id"),
                    input,
                    model: record.model().unwrap_or("unknown").to_string(),
                    session_id: record.session_id().unwrap_or_default().to_string(),
                }),
            ))
        }
        "tool_result" => {
            let metadata = record.tool_use_result();
            let content = match entry.get("content") {
                None | Some(Value::Null) => String::new(),
                Some(Value::String(text)) => text.clone(),
                Some(other) => other.to_string(),
            };
            Some(MonitorEvent::new(
                loop_id,
                summarize_result_metadata(metadata),
                EventKind::ToolResult(ToolResult {
                    tool_use_id: string_field(entry, "tool_use_id"),
                    duration_ms: metadata
                        .and_then(|meta| meta.get("durationMs"))
                        .and_then(crate::record::as_millis),
                    content,
                }),
            ))
        }
        "text" => {
            let text = entry.get("text").and_then(Value::as_str)?;
            if text.trim().is_empty() {
                return None;
            }
            let excerpt = prefix(text, SUMMARY_LIMIT);
            Some(MonitorEvent::new(
                loop_id,
                excerpt.clone(),
                EventKind::Thinking(Thinking {
                    excerpt,
                    full_text: text.to_string(),
                }),
            ))
        }
        _ => None,
    }
}

fn string_field(entry: &Value, key: &str) -> String {
    entry
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
