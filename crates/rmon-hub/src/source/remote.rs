use super::{
    DeleteOutcome, Emitter, FileStatus, HostConnection, LogSource, SourceEvent, SourceTimings,
    LOG_EXTENSION,
};
use crate::tasks::{lock, TaskSet};
use futures_util::future::BoxFuture;
use rmon_core::{ConfigError, HostAuth, HostConfig};
use std::collections::HashMap;
use std::fmt;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

pub const READY_MARKER: &str = "__RMON_READY__";
pub const FILE_MARKER: &str = "__RMON_FILE__ ";
pub const IDLE_MARKER: &str = "__RMON_IDLE__";
pub const TICK_MARKER: &str = "__RMON_TICK__";
const FIELD_SEPARATOR: char = '\u{1f}';
const TAIL_BACKLOG_LINES: u32 = 10;

const SSH_OPTIONS: [&str; 8] = [
    "-o",
    "ServerAliveInterval=10",
    "-o",
    "ServerAliveCountMax=3",
    "-o",
    "ConnectTimeout=30",
    "-o",
    "StrictHostKeyChecking=accept-new",
];

/// How a remote command is executed. For real hosts this is `ssh` (or
/// `sshpass -e ssh`); tests substitute a local `sh -c`.
#[derive(Clone)]
pub struct ShellTransport {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    remote: bool,
}

impl fmt::Debug for ShellTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let env_keys: Vec<&str> = self.env.iter().map(|(key, _)| key.as_str()).collect();
        f.debug_struct("ShellTransport")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env", &env_keys)
            .field("remote", &self.remote)
            .finish()
    }
}

impl ShellTransport {
    /// Runs `program args... <command>` locally, passing the command verbatim.
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
            env: Vec::new(),
            remote: false,
        }
    }

    pub fn local_shell() -> Self {
        Self::new("sh", &["-c"])
    }

    pub fn for_host(host: &HostConfig) -> Result<Self, ConfigError> {
        let auth = host.auth()?;
        if auth == HostAuth::Local {
            return Ok(Self::local_shell());
        }

        let mut args: Vec<String> = Vec::new();
        let mut env = Vec::new();
        let program = match auth {
            HostAuth::Password(password) => {
                env.push(("SSHPASS".to_string(), password.to_string()));
                args.extend(["-e".to_string(), "ssh".to_string()]);
                "sshpass"
            }
            _ => {
                args.extend(["-o".to_string(), "BatchMode=yes".to_string()]);
                "ssh"
            }
        };
        args.extend(SSH_OPTIONS.iter().map(|opt| opt.to_string()));
        if let HostAuth::Key(key) = auth {
            args.push("-i".to_string());
            args.push(expand_home(key));
        }
        if let Some(port) = host.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        args.push(if host.user.is_empty() {
            host.address.clone()
        } else {
            format!("{}@{}", host.user, host.address)
        });

        Ok(Self {
            program: program.to_string(),
            args,
            env,
            remote: true,
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn command(&self, script: &str) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        if self.remote {
            command.arg(format!("sh -c {}", shell_quote(script)));
        } else {
            command.arg(script);
        }
        for (key, value) in &self.env {
            command.env(key, value);
        }
        command
    }
}

fn expand_home(path: &str) -> String {
    match path.strip_prefix("~/") {
        Some(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest).to_string_lossy().into_owned(),
            None => path.to_string(),
        },
        None => path.to_string(),
    }
}

pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// The single long-lived remote program: rescans `watch_dir`, announces new
/// files and starts one prefixed `tail -F` per file, all on one stdout.
///
/// Every rescan writes a tick, so the script exits on the first scan after
/// its reader goes away; the tails follow through `--pid`.
pub fn multiplex_script(watch_dir: &str, rescan_secs: u64) -> String {
    format!(
        r#"dir={dir}
seen=$(mktemp 2>/dev/null || echo /tmp/rmon-seen-$$)
: > "$seen"
trap 'rm -f "$seen"' EXIT
trap 'exit 0' HUP PIPE TERM
pidopt=""
if tail --pid=$$ -n 0 /dev/null >/dev/null 2>&1; then pidopt="--pid=$$"; fi
echo {ready}
while :; do
  list=""
  if [ -d "$dir" ]; then
    list=$(find "$dir" -type f -name '*.{ext}' 2>/dev/null | sort)
  fi
  if [ -z "$list" ]; then
    echo {idle}
  else
    printf '%s\n' "$list" | while IFS= read -r f; do
      if ! grep -Fxq -- "$f" "$seen"; then
        printf '%s\n' "$f" >> "$seen"
        printf '{file}%s\n' "$f"
        ( tail $pidopt -n {backlog} -F -- "$f" 2>/dev/null | while IFS= read -r l; do printf '%s\037%s\n' "$f" "$l"; done ) &
      fi
    done
  fi
  echo {tick} || exit 0
  sleep {rescan}
done
"#,
        dir = shell_quote(watch_dir),
        ready = READY_MARKER,
        idle = IDLE_MARKER,
        tick = TICK_MARKER,
        file = FILE_MARKER,
        ext = LOG_EXTENSION,
        backlog = TAIL_BACKLOG_LINES,
        rescan = rescan_secs.max(1),
    )
}

#[derive(Debug, PartialEq, Eq)]
pub enum StreamLine<'a> {
    Ready,
    Idle,
    Tick,
    Discovered(&'a str),
    Data { path: &'a str, content: &'a str },
    Noise,
}

pub fn parse_stream_line(line: &str) -> StreamLine<'_> {
    if line == READY_MARKER {
        return StreamLine::Ready;
    }
    if line == IDLE_MARKER {
        return StreamLine::Idle;
    }
    if line == TICK_MARKER {
        return StreamLine::Tick;
    }
    if let Some(path) = line.strip_prefix(FILE_MARKER) {
        if !path.is_empty() {
            return StreamLine::Discovered(path);
        }
    }
    match line.split_once(FIELD_SEPARATOR) {
        Some((path, content)) if !path.is_empty() => StreamLine::Data { path, content },
        _ => StreamLine::Noise,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait now; doubles the next one up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

enum SessionEnd {
    Closed,
    Failed(String),
    PipelineGone,
}

struct Shared {
    host: HostConfig,
    transport: ShellTransport,
    timings: SourceTimings,
    files: Mutex<HashMap<String, Instant>>,
    tasks: TaskSet,
    running: AtomicBool,
}

/// Tails session logs on a remote host over one multiplexed shell session.
pub struct RemoteSource {
    shared: Arc<Shared>,
}

impl RemoteSource {
    pub fn new(host: HostConfig, transport: ShellTransport, timings: SourceTimings) -> Self {
        Self {
            shared: Arc::new(Shared {
                host,
                transport,
                timings,
                files: Mutex::new(HashMap::new()),
                tasks: TaskSet::default(),
                running: AtomicBool::new(false),
            }),
        }
    }

    #[cfg(test)]
    pub fn tracked_files(&self) -> Vec<String> {
        let mut files: Vec<String> = lock(&self.shared.files).keys().cloned().collect();
        files.sort();
        files
    }
}

impl LogSource for RemoteSource {
    fn host(&self) -> &HostConfig {
        &self.shared.host
    }

    fn start(&self, events: mpsc::Sender<SourceEvent>) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let emitter = Emitter::new(&self.shared.host.name, events);
        info!(
            event = "source_start",
            host = %self.shared.host.name,
            kind = "remote",
            program = %self.shared.transport.program(),
            watch_dir = %self.shared.host.watch_dir()
        );
        self.shared.tasks.push(tokio::spawn(session_loop(
            self.shared.clone(),
            emitter.clone(),
        )));
        self.shared
            .tasks
            .push(tokio::spawn(liveness_loop(self.shared.clone(), emitter)));
    }

    fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.tasks.abort_all();
        lock(&self.shared.files).clear();
    }

    fn delete_file(&self, path: &str) -> BoxFuture<'static, DeleteOutcome> {
        let shared = self.shared.clone();
        let path = path.to_string();
        Box::pin(async move {
            lock(&shared.files).remove(&path);
            let mut command = shared
                .transport
                .command(&format!("rm -f -- {}", shell_quote(&path)));
            command
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true);
            match command.status().await {
                Ok(status) if status.success() => {
                    info!(event = "file_deleted", host = %shared.host.name, file = %path);
                }
                Ok(status) => {
                    warn!(event = "file_delete_error", host = %shared.host.name, file = %path, status = %status);
                }
                Err(err) => {
                    warn!(event = "file_delete_error", host = %shared.host.name, file = %path, error = %err);
                }
            }
            DeleteOutcome::Deleted
        })
    }
}

impl Drop for RemoteSource {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn session_loop(shared: Arc<Shared>, emitter: Emitter) {
    let mut backoff = Backoff::new(
        shared.timings.reconnect_initial,
        shared.timings.reconnect_max,
    );
    loop {
        let end = run_session(&shared, &emitter, &mut backoff).await;
        lock(&shared.files).clear();
        match end {
            SessionEnd::PipelineGone => return,
            SessionEnd::Closed => {
                warn!(event = "source_disconnected", host = %shared.host.name);
                if !emitter.connection(HostConnection::Disconnected).await {
                    return;
                }
            }
            SessionEnd::Failed(message) => {
                warn!(event = "source_connect_error", host = %shared.host.name, error = %message);
                if !emitter.error(message).await {
                    return;
                }
            }
        }
        let delay = backoff.next_delay();
        info!(
            event = "source_reconnect",
            host = %shared.host.name,
            delay_ms = delay.as_millis() as u64
        );
        tokio::time::sleep(delay).await;
    }
}

async fn run_session(shared: &Shared, emitter: &Emitter, backoff: &mut Backoff) -> SessionEnd {
    let script = multiplex_script(
        shared.host.watch_dir(),
        shared.timings.discovery_interval.as_secs(),
    );
    let mut command = shared.transport.command(&script);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            return SessionEnd::Failed(format!(
                "failed to start {}: {err}",
                shared.transport.program()
            ))
        }
    };
    let Some(stdout) = child.stdout.take() else {
        return SessionEnd::Failed("session stdout unavailable".to_string());
    };
    let stderr_task = child
        .stderr
        .take()
        .map(|stderr| tokio::spawn(forward_stderr(stderr, emitter.clone())));

    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    let mut connected = false;
    let mut idle = false;
    let end = loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break None,
            Ok(_) => {}
            Err(err) => {
                debug!(event = "session_read_error", host = %shared.host.name, error = %err);
                break None;
            }
        }
        let text = String::from_utf8_lossy(&buf);
        let line = text.trim_end_matches(['\n', '\r']);
        let delivered = match parse_stream_line(line) {
            StreamLine::Ready => {
                if connected {
                    continue;
                }
                connected = true;
                backoff.reset();
                info!(event = "source_connected", host = %shared.host.name);
                emitter.connection(HostConnection::Connected).await
            }
            StreamLine::Idle => {
                if idle {
                    continue;
                }
                idle = true;
                emitter.connection(HostConnection::Idle).await
            }
            StreamLine::Tick => continue,
            StreamLine::Discovered(path) => {
                let mut ok = true;
                if idle {
                    idle = false;
                    ok = emitter.connection(HostConnection::Connected).await;
                }
                ok && track(shared, emitter, path).await
            }
            StreamLine::Data { path, content } => {
                let was_known = lock(&shared.files)
                    .insert(path.to_string(), Instant::now())
                    .is_some();
                let mut ok = true;
                if !was_known {
                    ok = emitter.status(path, FileStatus::New).await;
                }
                if ok && !content.trim().is_empty() {
                    ok = emitter.line(path, content).await;
                }
                ok
            }
            StreamLine::Noise => {
                debug!(event = "session_noise", host = %shared.host.name, line = %line);
                true
            }
        };
        if !delivered {
            break Some(SessionEnd::PipelineGone);
        }
    };

    let _ = child.start_kill();
    let status = child.wait().await;
    if let Some(task) = stderr_task {
        task.abort();
    }
    match end {
        Some(end) => end,
        None if connected => SessionEnd::Closed,
        None => SessionEnd::Failed(match status {
            Ok(status) => format!("session ended before ready ({status})"),
            Err(err) => format!("session ended before ready: {err}"),
        }),
    }
}

async fn track(shared: &Shared, emitter: &Emitter, path: &str) -> bool {
    let is_new = lock(&shared.files)
        .insert(path.to_string(), Instant::now())
        .is_none();
    if !is_new {
        return true;
    }
    info!(event = "file_discovered", host = %shared.host.name, file = %path);
    emitter.status(path, FileStatus::New).await
}

async fn forward_stderr<R>(stderr: R, emitter: Emitter)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        if !emitter.error(line).await {
            return;
        }
    }
}

async fn liveness_loop(shared: Arc<Shared>, emitter: Emitter) {
    let period = shared.timings.liveness_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let threshold = shared.timings.inactivity_threshold;
        let statuses: Vec<(String, FileStatus)> = lock(&shared.files)
            .iter()
            .map(|(path, last_data)| {
                let status = if last_data.elapsed() > threshold {
                    FileStatus::Inactive
                } else {
                    FileStatus::Active
                };
                (path.clone(), status)
            })
            .collect();
        for (path, status) in statuses {
            if !emitter.status(&path, status).await {
                return;
            }
        }
    }
}
