use serde_json::{Map, Value};

/// Read-only view over one parsed agent log record.
///
/// The pipeline parses each line once and hands the same `Value` to the
/// parser, metadata extraction and health detection through this view.
#[derive(Debug, Clone, Copy)]
pub struct LogRecord<'a> {
    value: &'a Value,
}

impl<'a> LogRecord<'a> {
    pub fn new(value: &'a Value) -> Self {
        Self { value }
    }

    pub fn kind(&self) -> Option<&'a str> {
        self.value.get("type").and_then(Value::as_str)
    }

    pub fn subtype(&self) -> Option<&'a str> {
        self.value.get("subtype").and_then(Value::as_str)
    }

    pub fn is_assistant(&self) -> bool {
        self.kind() == Some("assistant")
    }

    /// Final session summary written by the agent CLI when a run ends.
    pub fn is_result(&self) -> bool {
        self.kind() == Some("result")
    }

    pub fn is_init(&self) -> bool {
        self.kind() == Some("system") && self.subtype() == Some("init")
    }

    pub fn message(&self) -> Option<&'a Value> {
        self.value.get("message").filter(|message| message.is_object())
    }

    pub fn model(&self) -> Option<&'a str> {
        self.message()?.get("model")?.as_str()
    }

    pub fn stop_reason(&self) -> Option<&'a str> {
        self.message()?.get("stop_reason")?.as_str()
    }

    pub fn content(&self) -> Option<&'a [Value]> {
        self.message()?
            .get("content")?
            .as_array()
            .map(Vec::as_slice)
    }

    pub fn has_tool_use(&self) -> bool {
        self.content()
            .unwrap_or_default()
            .iter()
            .any(|entry| entry.get("type").and_then(Value::as_str) == Some("tool_use"))
    }

    pub fn session_id(&self) -> Option<&'a str> {
        self.value.get("session_id").and_then(Value::as_str)
    }

    pub fn cwd(&self) -> Option<&'a str> {
        self.value.get("cwd").and_then(Value::as_str)
    }

    pub fn is_error(&self) -> bool {
        self.value.get("is_error").is_some_and(is_truthy)
    }

    pub fn duration_ms(&self) -> Option<u64> {
        self.value.get("duration_ms").and_then(as_millis)
    }

    pub fn tool_use_result(&self) -> Option<&'a Map<String, Value>> {
        self.value.get("tool_use_result")?.as_object()
    }
}

/// Non-negative numeric milliseconds; fractional values are rounded.
pub fn as_millis(value: &Value) -> Option<u64> {
    value.as_u64().or_else(|| {
        value
            .as_f64()
            .filter(|ms| ms.is_finite() && *ms >= 0.0)
            .map(|ms| ms.round() as u64)
    })
}

pub fn as_integer(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|number| number.is_finite())
            .map(|number| number.round() as i64)
    })
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
