use crate::config::{HostConfig, PublicHost};
use chrono::{Local, NaiveDate, TimeZone};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Running,
    Completed,
    Errored,
    Stale,
}

impl Health {
    pub fn as_str(self) -> &'static str {
        match self {
            Health::Running => "running",
            Health::Completed => "completed",
            Health::Errored => "errored",
            Health::Stale => "stale",
        }
    }

    /// Completed and errored loops only change on an authoritative result record.
    pub fn is_terminal(self) -> bool {
        matches!(self, Health::Completed | Health::Errored)
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Idle,
    Inactive,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Idle => "idle",
            ConnectionStatus::Inactive => "inactive",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoopState {
    pub loop_id: String,
    pub host_name: String,
    pub host: PublicHost,
    pub session_file: String,
    pub status: ConnectionStatus,
    pub health: Health,
    pub current_iteration: u64,
    pub mode: Option<String>,
    pub branch: Option<String>,
    pub model: Option<String>,
    pub project: Option<String>,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub last_activity: i64,
}

impl LoopState {
    pub fn new(loop_id: String, host: &HostConfig, session_file: &str, now_ms: i64) -> Self {
        Self {
            loop_id,
            host_name: host.name.clone(),
            host: host.public(),
            session_file: session_file.to_string(),
            status: ConnectionStatus::Connected,
            health: Health::Running,
            current_iteration: 0,
            mode: None,
            branch: None,
            model: None,
            project: None,
            started_at: Some(session_started_at(session_file).unwrap_or(now_ms)),
            finished_at: None,
            last_activity: now_ms,
        }
    }
}

pub fn make_loop_id(host: &str, file: &str) -> String {
    format!("{host}:{}", crate::basename(file))
}

fn session_stamp() -> &'static Regex {
    static STAMP: OnceLock<Regex> = OnceLock::new();
    STAMP.get_or_init(|| {
        Regex::new(r"(\d{4})(\d{2})(\d{2})-(\d{2})(\d{2})(\d{2})").expect("valid regex")
    })
}

/// Session start encoded in a log file name as `YYYYMMDD-HHMMSS`, read as
/// local time. Returns epoch milliseconds.
pub fn session_started_at(file: &str) -> Option<i64> {
    let caps = session_stamp().captures(crate::basename(file))?;
    let part = |idx: usize| -> Option<u32> { caps.get(idx)?.as_str().parse().ok() };
    let year = i32::try_from(part(1)?).ok()?;
    let naive = NaiveDate::from_ymd_opt(year, part(2)?, part(3)?)?
        .and_hms_opt(part(4)?, part(5)?, part(6)?)?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|at| at.timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;
    use chrono::Timelike;

    #[test]
    fn loop_id_uses_basename() {
        assert_eq!(
            make_loop_id("builder", "/tmp/ralph/nested/session-1.jsonl"),
            "builder:session-1.jsonl"
        );
        assert_eq!(make_loop_id("h", "plain.jsonl"), "h:plain.jsonl");
    }

    #[test]
    fn start_time_from_file_name() {
        let millis = session_started_at("/tmp/ralph/ralph-20250114-093005.jsonl").expect("stamp");
        let at = Local.timestamp_millis_opt(millis).single().expect("local");
        assert_eq!((at.year(), at.month(), at.day()), (2025, 1, 14));
        assert_eq!((at.hour(), at.minute(), at.second()), (9, 30, 5));
    }

    #[test]
    fn start_time_rejects_invalid_dates() {
        assert_eq!(session_started_at("session.jsonl"), None);
        assert_eq!(session_started_at("ralph-20251340-250000.jsonl"), None);
    }

    #[test]
    fn new_state_defaults() {
        let host = HostConfig::local("laptop", "/tmp/ralph");
        let state = LoopState::new(
            make_loop_id("laptop", "/tmp/ralph/a.jsonl"),
            &host,
            "/tmp/ralph/a.jsonl",
            1_000,
        );
        assert_eq!(state.health, Health::Running);
        assert_eq!(state.status, ConnectionStatus::Connected);
        assert_eq!(state.started_at, Some(1_000));
        assert_eq!(state.last_activity, 1_000);

        let value = serde_json::to_value(&state).expect("serialize");
        assert_eq!(value["loopId"], "laptop:a.jsonl");
        assert_eq!(value["health"], "running");
        assert_eq!(value["currentIteration"], 0);
        assert_eq!(value["host"]["local"], true);
    }

    #[test]
    fn terminal_health() {
        assert!(Health::Completed.is_terminal());
        assert!(Health::Errored.is_terminal());
        assert!(!Health::Stale.is_terminal());
        assert_eq!(Health::Stale.to_string(), "stale");
    }
}
