//! Log sources: discover agent session logs on one host and stream their lines.

mod local;
mod remote;

pub use local::LocalSource;
pub use remote::{RemoteSource, ShellTransport};

use futures_util::future::BoxFuture;
use rmon_core::{ConfigError, HostConfig};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const LOG_EXTENSION: &str = "jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    New,
    Active,
    Inactive,
}

impl FileStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FileStatus::New => "new",
            FileStatus::Active => "active",
            FileStatus::Inactive => "inactive",
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostConnection {
    Connected,
    Disconnected,
    Idle,
}

impl HostConnection {
    pub fn as_str(self) -> &'static str {
        match self {
            HostConnection::Connected => "connected",
            HostConnection::Disconnected => "disconnected",
            HostConnection::Idle => "idle",
        }
    }
}

impl fmt::Display for HostConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    Line {
        host: String,
        file: String,
        text: String,
    },
    Status {
        host: String,
        file: String,
        status: FileStatus,
    },
    Connection {
        host: String,
        status: HostConnection,
    },
    Error {
        host: String,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    AlreadyAbsent,
    Failed(String),
}

impl DeleteOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, DeleteOutcome::Failed(_))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SourceTimings {
    pub discovery_interval: Duration,
    pub tail_interval: Duration,
    pub liveness_interval: Duration,
    pub inactivity_threshold: Duration,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

impl Default for SourceTimings {
    fn default() -> Self {
        Self {
            discovery_interval: Duration::from_secs(10),
            tail_interval: Duration::from_millis(500),
            liveness_interval: Duration::from_secs(30),
            inactivity_threshold: Duration::from_secs(5 * 60),
            reconnect_initial: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
        }
    }
}

/// One host's log discovery and tailing. Implementations only talk to the
/// pipeline through the events they send.
pub trait LogSource: Send + Sync {
    fn host(&self) -> &HostConfig;

    /// Spawns background work. Calling it on a running source is a no-op.
    fn start(&self, events: mpsc::Sender<SourceEvent>);

    /// Cancels all background work. Safe before `start` and when repeated.
    fn stop(&self);

    /// Removes a log file. An already missing file counts as success.
    fn delete_file(&self, path: &str) -> BoxFuture<'static, DeleteOutcome>;
}

pub fn build_source(
    host: &HostConfig,
    timings: SourceTimings,
) -> Result<Arc<dyn LogSource>, ConfigError> {
    if host.local {
        return Ok(Arc::new(LocalSource::new(host.clone(), timings)));
    }
    let transport = ShellTransport::for_host(host)?;
    Ok(Arc::new(RemoteSource::new(host.clone(), transport, timings)))
}

/// Sending half shared by a source's tasks. A closed receiver means the
/// pipeline is gone; sends then fail quietly.
#[derive(Clone)]
pub(crate) struct Emitter {
    host: String,
    tx: mpsc::Sender<SourceEvent>,
}

impl Emitter {
    pub(crate) fn new(host: &str, tx: mpsc::Sender<SourceEvent>) -> Self {
        Self {
            host: host.to_string(),
            tx,
        }
    }

    pub(crate) async fn line(&self, file: &str, text: &str) -> bool {
        self.send(SourceEvent::Line {
            host: self.host.clone(),
            file: file.to_string(),
            text: text.to_string(),
        })
        .await
    }

    pub(crate) async fn status(&self, file: &str, status: FileStatus) -> bool {
        self.send(SourceEvent::Status {
            host: self.host.clone(),
            file: file.to_string(),
            status,
        })
        .await
    }

    pub(crate) async fn connection(&self, status: HostConnection) -> bool {
        self.send(SourceEvent::Connection {
            host: self.host.clone(),
            status,
        })
        .await
    }

    pub(crate) async fn error(&self, message: impl Into<String>) -> bool {
        self.send(SourceEvent::Error {
            host: self.host.clone(),
            message: message.into(),
        })
        .await
    }

    async fn send(&self, event: SourceEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }
}

/// Emits one `line` per non-blank complete line in `pending`, leaving any
/// unterminated tail in place for the next read.
pub(crate) fn drain_lines(pending: &mut Vec<u8>) -> Vec<String> {
    let Some(last_newline) = pending.iter().rposition(|byte| *byte == b'\n') else {
        return Vec::new();
    };
    let complete: Vec<u8> = pending.drain(..=last_newline).collect();
    complete
        .split(|byte| *byte == b'\n')
        .map(|line| String::from_utf8_lossy(line))
        .map(|line| line.trim_end_matches('\r').to_string())
        .filter(|line| !line.trim().is_empty())
        .collect()
}
