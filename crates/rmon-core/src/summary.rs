//! Human-readable one-liners for tool calls and tool results.

use crate::basename;
use crate::record::{as_integer, as_millis};
use serde_json::{Map, Value};
use url::Url;

const COMMAND_LIMIT: usize = 60;
const DESCRIPTION_LIMIT: usize = 50;
const QUERY_LIMIT: usize = 50;
const FALLBACK_INPUT_LIMIT: usize = 60;
const URL_FALLBACK_LIMIT: usize = 40;

pub fn summarize_tool_call(tool_name: &str, input: &Value) -> String {
    match tool_name {
        "Glob" => format!("Searching `{}`", field_text(input, "pattern")),
        "Read" => format!("Reading `{}`", basename(&field_text(input, "file_path"))),
        "Edit" => format!("Editing `{}`", basename(&field_text(input, "file_path"))),
        "Write" => format!("Creating `{}`", basename(&field_text(input, "file_path"))),
        "Grep" => format!("Searching for `{}`", field_text(input, "pattern")),
        "Bash" => format!(
            "Running: `{}`",
            truncate(&field_text(input, "command"), COMMAND_LIMIT)
        ),
        "Task" => {
            let model = input
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or("sonnet");
            format!(
                "Spawning {model} subagent: {}",
                truncate(&field_text(input, "description"), DESCRIPTION_LIMIT)
            )
        }
        "WebFetch" => format!("Fetching {}", hostname(&field_text(input, "url"))),
        "WebSearch" => format!(
            "Searching web: `{}`",
            truncate(&field_text(input, "query"), QUERY_LIMIT)
        ),
        other => format!(
            "{other}({})",
            truncate(&input.to_string(), FALLBACK_INPUT_LIMIT)
        ),
    }
}

/// File count wins over exit code, exit code over a bare duration.
pub fn summarize_tool_result(
    num_files: Option<i64>,
    exit_code: Option<i64>,
    duration_ms: Option<u64>,
) -> String {
    let duration = duration_ms.map(|ms| format!(" ({ms}ms)")).unwrap_or_default();
    if let Some(count) = num_files {
        return format!("{count} files found{duration}");
    }
    if let Some(code) = exit_code {
        return format!("exit {code}{duration}");
    }
    match duration_ms {
        Some(ms) => format!("completed ({ms}ms)"),
        None => "completed".to_string(),
    }
}

/// Summary for the `tool_use_result` metadata object logged beside a result.
pub fn summarize_result_metadata(metadata: Option<&Map<String, Value>>) -> String {
    let field = |key: &str| metadata.and_then(|meta| meta.get(key));
    summarize_tool_result(
        field("numFiles").and_then(as_integer),
        field("exitCode").and_then(as_integer),
        field("durationMs").and_then(as_millis),
    )
}

/// Appends `...` when `text` is longer than `max` characters.
pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let head: String = text.chars().take(max).collect();
        format!("{head}...")
    } else {
        text.to_string()
    }
}

pub fn prefix(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

fn field_text(input: &Value, key: &str) -> String {
    match input.get(key) {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}

fn hostname(raw: &str) -> String {
    Url::parse(raw)
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
        .unwrap_or_else(|| prefix(raw, URL_FALLBACK_LIMIT))
}
