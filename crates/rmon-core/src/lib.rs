pub mod config;
pub mod event;
pub mod pairer;
pub mod parser;
pub mod record;
pub mod state;
pub mod summary;
pub mod wire;

pub use config::{AppConfig, ConfigError, HostAuth, HostConfig, PublicHost, ServerConfig};
pub use event::{
    EventKind, Iteration, MonitorEvent, RawLine, Thinking, ToolCall, ToolPaired, ToolResult,
};
pub use pairer::Pairer;
pub use parser::{parse_line, parse_line_with};
pub use record::LogRecord;
pub use state::{make_loop_id, session_started_at, ConnectionStatus, Health, LoopState};
pub use summary::{summarize_tool_call, summarize_tool_result};
pub use wire::{ServerMessage, Snapshot};

/// Milliseconds since the Unix epoch, the timestamp unit used on the wire.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Last path component of a `/`-separated path.
pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
