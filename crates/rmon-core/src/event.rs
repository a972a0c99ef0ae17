use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Process-unique event id. The sequence suffix keeps ids distinct even when
/// several events share the same millisecond.
pub fn next_event_id(now_ms: i64) -> String {
    let seq = EVENT_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("evt_{now_ms}_{seq}")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MonitorEvent {
    pub id: String,
    pub timestamp: i64,
    pub loop_id: String,
    pub summary: String,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl MonitorEvent {
    pub fn new(loop_id: &str, summary: String, kind: EventKind) -> Self {
        let timestamp = crate::now_ms();
        Self {
            id: next_event_id(timestamp),
            timestamp,
            loop_id: loop_id.to_string(),
            summary,
            kind,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    ToolCall(ToolCall),
    ToolResult(ToolResult),
    ToolPaired(ToolPaired),
    Thinking(Thinking),
    Iteration(Iteration),
    Raw(RawLine),
}

impl EventKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            EventKind::ToolCall(_) => "tool_call",
            EventKind::ToolResult(_) => "tool_result",
            EventKind::ToolPaired(_) => "tool_paired",
            EventKind::Thinking(_) => "thinking",
            EventKind::Iteration(_) => "iteration",
            EventKind::Raw(_) => "raw",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub tool_name: String,
    pub tool_use_id: String,
    pub input: Value,
    pub model: String,
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub tool_use_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub content: String,
}

/// A tool call fused with its result. Only the pairer builds these.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolPaired {
    pub tool_name: String,
    pub tool_use_id: String,
    pub input: Value,
    pub model: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub result_content: String,
    pub result_summary: String,
}

impl ToolPaired {
    pub fn from_parts(call: ToolCall, result: ToolResult, result_summary: String) -> Self {
        Self {
            tool_name: call.tool_name,
            tool_use_id: call.tool_use_id,
            input: call.input,
            model: call.model,
            session_id: call.session_id,
            duration_ms: result.duration_ms,
            result_content: result.content,
            result_summary,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Thinking {
    pub excerpt: String,
    pub full_text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Iteration {
    pub iteration_number: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RawLine {
    pub line: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_within_the_same_millisecond() {
        let first = next_event_id(1_700_000_000_000);
        let second = next_event_id(1_700_000_000_000);
        assert_ne!(first, second);
        assert!(first.starts_with("evt_1700000000000_"));
    }

    #[test]
    fn serializes_flat_camel_case_shape() {
        let event = MonitorEvent {
            id: "evt_1_0".to_string(),
            timestamp: 1,
            loop_id: "vm:a.jsonl".to_string(),
            summary: "Iteration 3".to_string(),
            kind: EventKind::Iteration(Iteration {
                iteration_number: 3,
            }),
        };
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["type"], "iteration");
        assert_eq!(value["loopId"], "vm:a.jsonl");
        assert_eq!(value["iterationNumber"], 3);
        assert_eq!(value["summary"], "Iteration 3");
    }

    #[test]
    fn omits_missing_duration() {
        let event = MonitorEvent::new(
            "vm:a.jsonl",
            "completed".to_string(),
            EventKind::ToolResult(ToolResult {
                tool_use_id: "c1".to_string(),
                duration_ms: None,
                content: "ok".to_string(),
            }),
        );
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["type"], "tool_result");
        assert_eq!(value["toolUseId"], "c1");
        assert!(value.get("durationMs").is_none());
    }
}
