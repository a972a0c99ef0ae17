use crate::buffer::EventBuffer;
use crate::source::{
    build_source, FileStatus, HostConnection, LogSource, SourceEvent, SourceTimings,
};
use crate::tasks::{lock, TaskSet};
use regex::Regex;
use rmon_core::{
    basename, make_loop_id, now_ms, parse_line_with, session_started_at, ConfigError,
    ConnectionStatus, EventKind, Health, HostConfig, LogRecord, LoopState, MonitorEvent, Pairer,
    ServerMessage, Snapshot,
};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

const COMPLETED_STOP_REASONS: [&str; 2] = ["end_turn", "stop_sequence"];
const SOURCE_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
    pub timings: SourceTimings,
    pub maintenance_interval: Duration,
    pub stale_after: Duration,
    pub broadcast_capacity: usize,
    pub snapshot_events: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            timings: SourceTimings::default(),
            maintenance_interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(5 * 60),
            broadcast_capacity: 1024,
            snapshot_events: 100,
        }
    }
}

struct LoopEntry {
    state: LoopState,
    buffer: EventBuffer,
    pairer: Pairer,
}

struct Inner {
    hosts: HashMap<String, HostConfig>,
    host_order: Vec<String>,
    options: PipelineOptions,
    loops: RwLock<HashMap<String, LoopEntry>>,
    updates: broadcast::Sender<ServerMessage>,
    sources: Mutex<HashMap<String, Arc<dyn LogSource>>>,
    tasks: TaskSet,
    started: AtomicBool,
}

/// Owns every loop's state, buffer and pairer. Sources feed it through
/// `ingest`; viewers read through `subscribe_with_snapshot`.
///
/// Every update is broadcast while the loop store's write lock is held, so a
/// snapshot taken under the read lock plus a receiver created under the same
/// lock never misses or repeats an update.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

impl Pipeline {
    pub fn new(hosts: Vec<HostConfig>, options: PipelineOptions) -> Self {
        let (updates, _) = broadcast::channel(options.broadcast_capacity.max(1));
        let host_order = hosts.iter().map(|host| host.name.clone()).collect();
        Self {
            inner: Arc::new(Inner {
                hosts: hosts
                    .into_iter()
                    .map(|host| (host.name.clone(), host))
                    .collect(),
                host_order,
                options,
                loops: RwLock::new(HashMap::new()),
                updates,
                sources: Mutex::new(HashMap::new()),
                tasks: TaskSet::default(),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Starts one log source per host plus the maintenance timer.
    pub fn start(&self) -> Result<(), ConfigError> {
        let mut built = Vec::with_capacity(self.inner.host_order.len());
        for name in &self.inner.host_order {
            if let Some(host) = self.inner.hosts.get(name) {
                built.push(build_source(host, self.inner.options.timings)?);
            }
        }
        self.start_with_sources(built);
        Ok(())
    }

    pub fn start_with_sources(&self, sources: Vec<Arc<dyn LogSource>>) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let (tx, mut rx) = mpsc::channel(SOURCE_CHANNEL_CAPACITY);
        {
            let mut registry = lock(&self.inner.sources);
            for source in sources {
                source.start(tx.clone());
                registry.insert(source.host().name.clone(), source);
            }
        }
        drop(tx);

        let pipeline = self.clone();
        self.inner.tasks.push(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                pipeline.ingest(event).await;
            }
        }));

        let pipeline = self.clone();
        let period = self.inner.options.maintenance_interval;
        self.inner.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                pipeline.run_maintenance().await;
            }
        }));
        info!(event = "pipeline_start", hosts = self.inner.host_order.len());
    }

    /// Stops sources and timers. Safe to call repeatedly or before `start`.
    pub fn stop(&self) {
        let was_started = self.inner.started.swap(false, Ordering::SeqCst);
        let sources: Vec<Arc<dyn LogSource>> = lock(&self.inner.sources).values().cloned().collect();
        for source in sources {
            source.stop();
        }
        self.inner.tasks.abort_all();
        if was_started {
            info!(event = "pipeline_stop");
        }
    }

    pub async fn ingest(&self, event: SourceEvent) {
        match event {
            SourceEvent::Line { host, file, text } => self.handle_line(&host, &file, &text).await,
            SourceEvent::Status { host, file, status } => {
                self.handle_file_status(&host, &file, status).await
            }
            SourceEvent::Connection { host, status } => {
                self.handle_connection(&host, status).await
            }
            SourceEvent::Error { host, message } => {
                warn!(event = "source_error", host = %host, error = %message);
            }
        }
    }

    async fn handle_line(&self, host: &str, file: &str, text: &str) {
        let Some(host_config) = self.inner.hosts.get(host) else {
            debug!(event = "unknown_host", host = %host);
            return;
        };
        let now = now_ms();
        let trimmed = text.trim();
        let parsed = serde_json::from_str::<Value>(trimmed).ok();
        let record = parsed.as_ref().map(LogRecord::new);

        let mut loops = self.inner.loops.write().await;
        let (entry, created) = ensure_loop(&mut loops, host_config, file, now);
        let loop_id = entry.state.loop_id.clone();
        let state = &mut entry.state;

        let mut changed = created;
        state.last_activity = now;
        if state.status != ConnectionStatus::Connected {
            state.status = ConnectionStatus::Connected;
            if state.started_at.is_none() {
                state.started_at = Some(session_started_at(file).unwrap_or(now));
            }
            changed = true;
        }
        if state.health == Health::Stale {
            state.health = Health::Running;
            state.finished_at = None;
            info!(event = "loop_revived", loop_id = %loop_id);
            changed = true;
        }
        changed |= extract_metadata(state, trimmed, record);
        changed |= detect_health(state, trimmed, record, now);
        if changed {
            self.emit_status(state);
        }

        for event in parse_line_with(text, &loop_id, parsed.as_ref()) {
            let event = entry.pairer.process(event);
            if let EventKind::Iteration(iteration) = &event.kind {
                entry.state.current_iteration = iteration.iteration_number;
                self.emit_status(&entry.state);
            }
            entry.buffer.record(event.clone());
            self.emit(ServerMessage::Event {
                loop_id: loop_id.clone(),
                event,
            });
        }
    }

    async fn handle_file_status(&self, host: &str, file: &str, status: FileStatus) {
        let Some(host_config) = self.inner.hosts.get(host) else {
            debug!(event = "unknown_host", host = %host);
            return;
        };
        let now = now_ms();
        let mut loops = self.inner.loops.write().await;
        let (entry, created) = ensure_loop(&mut loops, host_config, file, now);
        let next = match status {
            FileStatus::Inactive => ConnectionStatus::Inactive,
            FileStatus::New | FileStatus::Active => ConnectionStatus::Connected,
        };
        let state = &mut entry.state;
        if !created && state.status == next {
            return;
        }
        state.status = next;
        if next == ConnectionStatus::Connected && state.started_at.is_none() {
            state.started_at = Some(session_started_at(file).unwrap_or(now));
        }
        self.emit_status(state);
    }

    async fn handle_connection(&self, host: &str, status: HostConnection) {
        info!(event = "source_connection", host = %host, status = %status);
        if status != HostConnection::Disconnected {
            return;
        }
        let mut loops = self.inner.loops.write().await;
        for entry in loops.values_mut() {
            if entry.state.host_name != host {
                continue;
            }
            entry.state.status = ConnectionStatus::Disconnected;
            entry.state.started_at = None;
            self.emit_status(&entry.state);
        }
    }

    /// Prunes pending tool calls and reclassifies silent running loops.
    pub async fn run_maintenance(&self) {
        self.run_maintenance_at(now_ms()).await;
    }

    pub async fn run_maintenance_at(&self, now: i64) {
        let stale_after = i64::try_from(self.inner.options.stale_after.as_millis()).unwrap_or(i64::MAX);
        let mut loops = self.inner.loops.write().await;
        for entry in loops.values_mut() {
            let pruned = entry.pairer.prune_stale_at(now);
            if pruned > 0 {
                debug!(event = "pending_pruned", loop_id = %entry.state.loop_id, count = pruned);
            }
            let state = &mut entry.state;
            if state.health != Health::Running || now - state.last_activity <= stale_after {
                continue;
            }
            state.health = if entry.buffer.last().is_some_and(looks_finished) {
                Health::Completed
            } else {
                Health::Stale
            };
            state.finished_at = Some(state.last_activity);
            info!(event = "loop_health", loop_id = %state.loop_id, health = %state.health, reason = "silent");
            self.emit_status(state);
        }
    }

    /// Removes a loop immediately and deletes its log file in the background.
    /// Returns false for unknown loops.
    pub async fn remove_loop(&self, loop_id: &str) -> bool {
        let removed = {
            let mut loops = self.inner.loops.write().await;
            let Some(entry) = loops.remove(loop_id) else {
                return false;
            };
            self.emit(ServerMessage::LoopRemoved {
                loop_id: loop_id.to_string(),
            });
            entry
        };
        info!(event = "loop_removed", loop_id = %loop_id);

        let source = lock(&self.inner.sources)
            .get(&removed.state.host_name)
            .cloned();
        if let Some(source) = source {
            let file = removed.state.session_file.clone();
            let delete = source.delete_file(&file);
            let loop_id = loop_id.to_string();
            tokio::spawn(async move {
                let outcome = delete.await;
                if outcome.is_success() {
                    debug!(event = "loop_file_deleted", loop_id = %loop_id, file = %file, outcome = ?outcome);
                } else {
                    warn!(event = "loop_file_delete_error", loop_id = %loop_id, file = %file, outcome = ?outcome);
                }
            });
        }
        true
    }

    pub async fn loop_states(&self) -> Vec<LoopState> {
        let loops = self.inner.loops.read().await;
        let mut states: Vec<LoopState> = loops.values().map(|entry| entry.state.clone()).collect();
        states.sort_by(|a, b| a.loop_id.cmp(&b.loop_id));
        states
    }

    #[cfg(test)]
    pub async fn loop_state(&self, loop_id: &str) -> Option<LoopState> {
        let loops = self.inner.loops.read().await;
        loops.get(loop_id).map(|entry| entry.state.clone())
    }

    /// Up to `count` most recent buffered events; `None` for unknown loops.
    pub async fn recent_events(&self, loop_id: &str, count: usize) -> Option<Vec<MonitorEvent>> {
        let loops = self.inner.loops.read().await;
        loops.get(loop_id).map(|entry| entry.buffer.recent(count))
    }

    pub async fn subscribe_with_snapshot(&self) -> (Snapshot, broadcast::Receiver<ServerMessage>) {
        let loops = self.inner.loops.read().await;
        let receiver = self.inner.updates.subscribe();
        let mut snapshot = Snapshot {
            loops: BTreeMap::new(),
            recent_events: BTreeMap::new(),
        };
        for (loop_id, entry) in loops.iter() {
            snapshot.loops.insert(loop_id.clone(), entry.state.clone());
            if entry.state.health == Health::Running {
                snapshot.recent_events.insert(
                    loop_id.clone(),
                    entry.buffer.recent(self.inner.options.snapshot_events),
                );
            }
        }
        (snapshot, receiver)
    }

    #[cfg(test)]
    pub fn subscribe(&self) -> broadcast::Receiver<ServerMessage> {
        self.inner.updates.subscribe()
    }

    fn emit_status(&self, state: &LoopState) {
        self.emit(ServerMessage::LoopStatus {
            loop_id: state.loop_id.clone(),
            state: state.clone(),
        });
    }

    fn emit(&self, message: ServerMessage) {
        let _ = self.inner.updates.send(message);
    }
}

fn ensure_loop<'a>(
    loops: &'a mut HashMap<String, LoopEntry>,
    host: &HostConfig,
    file: &str,
    now: i64,
) -> (&'a mut LoopEntry, bool) {
    let loop_id = make_loop_id(&host.name, file);
    let created = !loops.contains_key(&loop_id);
    let entry = loops.entry(loop_id.clone()).or_insert_with(|| {
        info!(event = "loop_discovered", loop_id = %loop_id, file = %file);
        LoopEntry {
            state: LoopState::new(loop_id.clone(), host, file, now),
            buffer: EventBuffer::default(),
            pairer: Pairer::default(),
        }
    });
    (entry, created)
}

fn mode_header() -> &'static Regex {
    static MODE: OnceLock<Regex> = OnceLock::new();
    MODE.get_or_init(|| Regex::new(r"^Mode:\s+(\w+)").expect("valid regex"))
}

fn branch_header() -> &'static Regex {
    static BRANCH: OnceLock<Regex> = OnceLock::new();
    BRANCH.get_or_init(|| Regex::new(r"^Branch:\s+(.+)").expect("valid regex"))
}

fn max_iterations_marker() -> &'static Regex {
    static DONE: OnceLock<Regex> = OnceLock::new();
    DONE.get_or_init(|| Regex::new(r"^Reached max iterations:").expect("valid regex"))
}

fn api_error_signature() -> &'static Regex {
    static API_ERROR: OnceLock<Regex> = OnceLock::new();
    API_ERROR.get_or_init(|| {
        Regex::new(r#""error":\s*\{\s*"type":\s*"(overloaded|rate_limit|internal_error)"#)
            .expect("valid regex")
    })
}

fn set_label(slot: &mut Option<String>, value: &str) -> bool {
    if slot.as_deref() == Some(value) {
        return false;
    }
    *slot = Some(value.to_string());
    true
}

/// Applies header and record metadata. Returns whether anything changed.
fn extract_metadata(state: &mut LoopState, line: &str, record: Option<LogRecord<'_>>) -> bool {
    let mut changed = false;
    if let Some(mode) = mode_header().captures(line).and_then(|caps| caps.get(1)) {
        changed |= set_label(&mut state.mode, mode.as_str());
    }
    if let Some(branch) = branch_header().captures(line).and_then(|caps| caps.get(1)) {
        changed |= set_label(&mut state.branch, branch.as_str().trim());
    }
    let Some(record) = record else {
        return changed;
    };
    if let Some(model) = record.model().filter(|model| !model.is_empty()) {
        changed |= set_label(&mut state.model, model);
    }
    if state.project.is_none() && record.is_init() {
        if let Some(project) = record.cwd().map(basename).filter(|name| !name.is_empty()) {
            state.project = Some(project.to_string());
            changed = true;
        }
    }
    changed
}

/// Derives health from one line. Result records always win; heuristics never
/// touch a terminal loop.
fn detect_health(
    state: &mut LoopState,
    line: &str,
    record: Option<LogRecord<'_>>,
    now: i64,
) -> bool {
    if let Some(record) = record.filter(LogRecord::is_result) {
        state.health = if record.is_error() {
            Health::Errored
        } else {
            Health::Completed
        };
        state.finished_at = match (state.started_at, record.duration_ms().filter(|ms| *ms > 0)) {
            (Some(started), Some(duration)) => {
                Some(started.saturating_add(i64::try_from(duration).unwrap_or(i64::MAX)))
            }
            _ => Some(now),
        };
        info!(event = "loop_health", loop_id = %state.loop_id, health = %state.health, reason = "result");
        return true;
    }
    if state.health.is_terminal() {
        return false;
    }

    let terminal = if max_iterations_marker().is_match(line) {
        Some(Health::Completed)
    } else if let Some(record) = record.filter(LogRecord::is_assistant) {
        match record.stop_reason() {
            Some(reason) if COMPLETED_STOP_REASONS.contains(&reason) && !record.has_tool_use() => {
                Some(Health::Completed)
            }
            Some("error") => Some(Health::Errored),
            _ => None,
        }
    } else {
        None
    };
    let terminal = terminal.or_else(|| {
        api_error_signature()
            .is_match(line)
            .then_some(Health::Errored)
    });

    match terminal {
        Some(health) => {
            state.health = health;
            state.finished_at = Some(state.last_activity);
            info!(event = "loop_health", loop_id = %state.loop_id, health = %health, reason = "heuristic");
            true
        }
        None => false,
    }
}

/// Best guess at whether a silent loop ended on its own: it last produced
/// reasoning text or a finished tool call rather than a dangling call.
fn looks_finished(event: &MonitorEvent) -> bool {
    match &event.kind {
        EventKind::Thinking(_) => true,
        EventKind::ToolPaired(paired) => !paired.result_summary.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::LocalSource;
    use rmon_core::ToolPaired;
    use serde_json::json;
    use std::io::Write;

    const FILE: &str = "/tmp/ralph/build-20250301-101500.jsonl";
    const LOOP_ID: &str = "vm:build-20250301-101500.jsonl";

    fn pipeline() -> Pipeline {
        Pipeline::new(
            vec![HostConfig::local("vm", "/tmp/ralph")],
            PipelineOptions::default(),
        )
    }

    fn line(text: &str) -> SourceEvent {
        SourceEvent::Line {
            host: "vm".to_string(),
            file: FILE.to_string(),
            text: text.to_string(),
        }
    }

    fn drain(rx: &mut broadcast::Receiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    fn events(messages: &[ServerMessage]) -> Vec<&MonitorEvent> {
        messages
            .iter()
            .filter_map(|message| match message {
                ServerMessage::Event { event, .. } => Some(event),
                _ => None,
            })
            .collect()
    }

    fn tool_call_line() -> String {
        json!({
            "type": "assistant",
            "message": {
                "model": "m",
                "content": [{"type": "tool_use", "id": "c1", "name": "Glob", "input": {"pattern": "*.ts"}}]
            }
        })
        .to_string()
    }

    fn tool_result_line() -> String {
        json!({
            "type": "user",
            "message": {"content": [{"type": "tool_result", "tool_use_id": "c1", "content": "a.ts"}]},
            "tool_use_result": {"numFiles": 1, "durationMs": 50}
        })
        .to_string()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn call_and_result_pair_in_buffer() {
        let pipeline = pipeline();
        let mut rx = pipeline.subscribe();
        pipeline.ingest(line(&tool_call_line())).await;
        pipeline.ingest(line(&tool_result_line())).await;

        let messages = drain(&mut rx);
        let emitted = events(&messages);
        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[0].type_name(), "tool_call");
        assert_eq!(emitted[0].summary, "Searching `*.ts`");
        let EventKind::ToolPaired(ToolPaired {
            tool_name,
            duration_ms,
            result_summary,
            ..
        }) = &emitted[1].kind
        else {
            panic!("expected tool_paired");
        };
        assert_eq!(tool_name, "Glob");
        assert_eq!(*duration_ms, Some(50));
        assert_eq!(result_summary, "1 files found (50ms)");
        assert_eq!(emitted[1].id, emitted[0].id);

        let buffered = pipeline.recent_events(LOOP_ID, 100).await.expect("loop");
        assert_eq!(buffered.len(), 1);
        assert_eq!(buffered[0].type_name(), "tool_paired");

        let state = pipeline.loop_state(LOOP_ID).await.expect("state");
        assert_eq!(state.model.as_deref(), Some("m"));
        assert_eq!(state.health, Health::Running);
        assert_eq!(state.started_at, session_started_at(FILE));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn loop_marker_sets_iteration() {
        let pipeline = pipeline();
        let mut rx = pipeline.subscribe();
        pipeline
            .ingest(line("======================== LOOP 7 ========================"))
            .await;

        let messages = drain(&mut rx);
        assert!(messages.iter().any(|message| matches!(
            message,
            ServerMessage::LoopStatus { state, .. } if state.current_iteration == 7
        )));
        assert_eq!(events(&messages).len(), 1);
        let state = pipeline.loop_state(LOOP_ID).await.expect("state");
        assert_eq!(state.current_iteration, 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn header_lines_fill_labels() {
        let pipeline = pipeline();
        pipeline.ingest(line("Mode: build")).await;
        pipeline.ingest(line("Branch: feature/monitor ")).await;
        pipeline
            .ingest(line(
                &json!({"type": "system", "subtype": "init", "cwd": "/home/dev/widgets"}).to_string(),
            ))
            .await;
        pipeline
            .ingest(line(
                &json!({"type": "system", "subtype": "init", "cwd": "/home/dev/other"}).to_string(),
            ))
            .await;

        let state = pipeline.loop_state(LOOP_ID).await.expect("state");
        assert_eq!(state.mode.as_deref(), Some("build"));
        assert_eq!(state.branch.as_deref(), Some("feature/monitor"));
        assert_eq!(state.project.as_deref(), Some("widgets"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn terminal_health_resists_heuristics() {
        let pipeline = pipeline();
        pipeline
            .ingest(line(
                &json!({
                    "type": "assistant",
                    "message": {"stop_reason": "end_turn", "content": [{"type": "text", "text": "All done."}]}
                })
                .to_string(),
            ))
            .await;
        let state = pipeline.loop_state(LOOP_ID).await.expect("state");
        assert_eq!(state.health, Health::Completed);
        assert_eq!(state.finished_at, Some(state.last_activity));

        pipeline
            .ingest(line(r#"{"type":"error","error":{"type":"overloaded_error"}}"#))
            .await;
        let state = pipeline.loop_state(LOOP_ID).await.expect("state");
        assert_eq!(state.health, Health::Completed);

        pipeline
            .ingest(line(r#"{"type":"result","is_error":true,"duration_ms":1000}"#))
            .await;
        let state = pipeline.loop_state(LOOP_ID).await.expect("state");
        assert_eq!(state.health, Health::Errored);
        assert_eq!(
            state.finished_at,
            session_started_at(FILE).map(|started| started + 1000)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn heuristic_health_signals() {
        let pipeline = pipeline();
        pipeline.ingest(line(&tool_call_line())).await;
        let with_tool = json!({
            "type": "assistant",
            "message": {"stop_reason": "end_turn", "content": [{"type": "tool_use", "id": "c9", "name": "Bash", "input": {}}]}
        });
        pipeline.ingest(line(&with_tool.to_string())).await;
        assert_eq!(
            pipeline.loop_state(LOOP_ID).await.expect("state").health,
            Health::Running
        );

        pipeline
            .ingest(line(r#"{"type":"error","error":{"type":"rate_limit_error"}}"#))
            .await;
        assert_eq!(
            pipeline.loop_state(LOOP_ID).await.expect("state").health,
            Health::Errored
        );

        let other = Pipeline::new(
            vec![HostConfig::local("vm", "/tmp/ralph")],
            PipelineOptions::default(),
        );
        other
            .ingest(line("Reached max iterations: 20"))
            .await;
        assert_eq!(
            other.loop_state(LOOP_ID).await.expect("state").health,
            Health::Completed
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn silent_loops_become_stale_or_completed() {
        let pipeline = pipeline();
        pipeline.ingest(line(&tool_call_line())).await;
        let quiet = SourceEvent::Line {
            host: "vm".to_string(),
            file: "/tmp/ralph/thinker.jsonl".to_string(),
            text: json!({
                "type": "assistant",
                "message": {"content": [{"type": "text", "text": "Waiting on review."}]}
            })
            .to_string(),
        };
        pipeline.ingest(quiet).await;

        let later = now_ms() + 6 * 60 * 1000;
        let mut rx = pipeline.subscribe();
        pipeline.run_maintenance_at(later).await;
        assert_eq!(drain(&mut rx).len(), 2);

        let stale = pipeline.loop_state(LOOP_ID).await.expect("state");
        assert_eq!(stale.health, Health::Stale);
        assert_eq!(stale.finished_at, Some(stale.last_activity));
        let done = pipeline.loop_state("vm:thinker.jsonl").await.expect("state");
        assert_eq!(done.health, Health::Completed);

        pipeline.ingest(line("still here")).await;
        let revived = pipeline.loop_state(LOOP_ID).await.expect("state");
        assert_eq!(revived.health, Health::Running);
        assert_eq!(revived.finished_at, None);

        pipeline.run_maintenance_at(now_ms()).await;
        assert_eq!(
            pipeline.loop_state(LOOP_ID).await.expect("state").health,
            Health::Running
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn disconnect_marks_host_loops() {
        let pipeline = pipeline();
        pipeline.ingest(line("hello")).await;
        pipeline
            .ingest(SourceEvent::Connection {
                host: "vm".to_string(),
                status: HostConnection::Disconnected,
            })
            .await;
        let state = pipeline.loop_state(LOOP_ID).await.expect("state");
        assert_eq!(state.status, ConnectionStatus::Disconnected);
        assert_eq!(state.started_at, None);

        pipeline.ingest(line("back again")).await;
        let state = pipeline.loop_state(LOOP_ID).await.expect("state");
        assert_eq!(state.status, ConnectionStatus::Connected);
        assert_eq!(state.started_at, session_started_at(FILE));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn file_status_tracks_connectivity() {
        let pipeline = pipeline();
        let mut rx = pipeline.subscribe();
        let status = |status| SourceEvent::Status {
            host: "vm".to_string(),
            file: FILE.to_string(),
            status,
        };
        pipeline.ingest(status(FileStatus::New)).await;
        pipeline.ingest(status(FileStatus::Active)).await;
        pipeline.ingest(status(FileStatus::Inactive)).await;
        assert_eq!(drain(&mut rx).len(), 2);
        assert_eq!(
            pipeline.loop_state(LOOP_ID).await.expect("state").status,
            ConnectionStatus::Inactive
        );

        pipeline
            .ingest(SourceEvent::Line {
                host: "elsewhere".to_string(),
                file: FILE.to_string(),
                text: "ignored".to_string(),
            })
            .await;
        assert_eq!(pipeline.loop_states().await.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn remove_loop_known_and_unknown() {
        let pipeline = pipeline();
        pipeline.ingest(line(&tool_call_line())).await;
        let mut rx = pipeline.subscribe();

        assert!(!pipeline.remove_loop("vm:missing.jsonl").await);
        assert!(drain(&mut rx).is_empty());

        assert!(pipeline.remove_loop(LOOP_ID).await);
        let messages = drain(&mut rx);
        assert_eq!(
            messages,
            vec![ServerMessage::LoopRemoved {
                loop_id: LOOP_ID.to_string()
            }]
        );
        assert!(pipeline.loop_state(LOOP_ID).await.is_none());
        assert!(pipeline.recent_events(LOOP_ID, 10).await.is_none());

        pipeline.ingest(line(&tool_result_line())).await;
        let buffered = pipeline.recent_events(LOOP_ID, 10).await.expect("recreated");
        assert_eq!(buffered[0].type_name(), "tool_result");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn snapshot_only_carries_running_buffers() {
        let pipeline = pipeline();
        let (snapshot, _rx) = pipeline.subscribe_with_snapshot().await;
        assert!(snapshot.loops.is_empty());
        assert!(snapshot.recent_events.is_empty());

        pipeline.ingest(line("working")).await;
        pipeline
            .ingest(SourceEvent::Line {
                host: "vm".to_string(),
                file: "/tmp/ralph/done.jsonl".to_string(),
                text: r#"{"type":"result","is_error":false}"#.to_string(),
            })
            .await;

        let (snapshot, _rx) = pipeline.subscribe_with_snapshot().await;
        assert_eq!(snapshot.loops.len(), 2);
        assert_eq!(snapshot.recent_events.len(), 1);
        assert_eq!(snapshot.recent_events[LOOP_ID].len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tracked_file_flows_end_to_end() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = dir.path().join("session.jsonl");
        std::fs::write(&log, "").expect("seed");
        let host = HostConfig::local("laptop", dir.path().to_str().expect("utf8"));
        let options = PipelineOptions {
            timings: SourceTimings {
                discovery_interval: Duration::from_millis(50),
                tail_interval: Duration::from_millis(20),
                ..SourceTimings::default()
            },
            ..PipelineOptions::default()
        };
        let pipeline = Pipeline::new(vec![host.clone()], options);
        let mut rx = pipeline.subscribe();
        pipeline.start_with_sources(vec![Arc::new(LocalSource::new(host, options.timings))]);

        let loop_id = "laptop:session.jsonl";
        tokio::time::timeout(Duration::from_secs(5), async {
            while pipeline.loop_state(loop_id).await.is_none() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("loop discovered");

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&log)
            .expect("open");
        writeln!(file, "{}", tool_call_line()).expect("append");
        writeln!(file, "{}", tool_result_line()).expect("append");

        let mut kinds = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), async {
            while kinds.len() < 2 {
                if let Ok(ServerMessage::Event { event, .. }) = rx.recv().await {
                    kinds.push(event.type_name());
                }
            }
        })
        .await
        .expect("events delivered");
        assert_eq!(kinds, vec!["tool_call", "tool_paired"]);

        assert!(pipeline.remove_loop(loop_id).await);
        tokio::time::timeout(Duration::from_secs(5), async {
            while log.exists() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("file deleted");

        pipeline.stop();
        pipeline.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_without_start_is_harmless() {
        let pipeline = pipeline();
        let mut rx = pipeline.subscribe();
        pipeline.stop();
        pipeline.stop();
        assert!(pipeline.loop_states().await.is_empty());
        assert!(drain(&mut rx).is_empty());
        drop(pipeline);
    }
}
