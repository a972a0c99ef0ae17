use super::{
    drain_lines, DeleteOutcome, Emitter, FileStatus, HostConnection, LogSource, SourceEvent,
    SourceTimings, LOG_EXTENSION,
};
use crate::tasks::{lock, TaskSet};
use futures_util::future::BoxFuture;
use rmon_core::HostConfig;
use std::collections::HashMap;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

struct TrackedFile {
    offset: u64,
    pending: Vec<u8>,
    last_data: Instant,
    tail: Option<AbortHandle>,
}

struct Shared {
    host: HostConfig,
    timings: SourceTimings,
    files: Mutex<HashMap<String, TrackedFile>>,
    tasks: TaskSet,
    running: AtomicBool,
}

impl Shared {
    fn untrack(&self, path: &str) -> bool {
        let removed = lock(&self.files).remove(path);
        match removed {
            Some(tracked) => {
                if let Some(tail) = tracked.tail {
                    tail.abort();
                }
                true
            }
            None => false,
        }
    }
}

/// Tails session logs under a directory on this machine.
pub struct LocalSource {
    shared: Arc<Shared>,
}

impl LocalSource {
    pub fn new(host: HostConfig, timings: SourceTimings) -> Self {
        Self {
            shared: Arc::new(Shared {
                host,
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

impl LogSource for LocalSource {
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
            kind = "local",
            watch_dir = %self.shared.host.watch_dir()
        );
        self.shared.tasks.push(tokio::spawn(discovery_loop(
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
        let drained: Vec<TrackedFile> = lock(&self.shared.files).drain().map(|(_, f)| f).collect();
        for tracked in drained {
            if let Some(tail) = tracked.tail {
                tail.abort();
            }
        }
    }

    fn delete_file(&self, path: &str) -> BoxFuture<'static, DeleteOutcome> {
        let shared = self.shared.clone();
        let path = path.to_string();
        Box::pin(async move {
            shared.untrack(&path);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    info!(event = "file_deleted", host = %shared.host.name, file = %path);
                    DeleteOutcome::Deleted
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => DeleteOutcome::AlreadyAbsent,
                Err(err) => {
                    warn!(event = "file_delete_error", host = %shared.host.name, file = %path, error = %err);
                    DeleteOutcome::Failed(err.to_string())
                }
            }
        })
    }
}

impl Drop for LocalSource {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn discovery_loop(shared: Arc<Shared>, emitter: Emitter) {
    if !emitter.connection(HostConnection::Connected).await {
        return;
    }
    let mut idle = false;
    let mut ticker = tokio::time::interval(shared.timings.discovery_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let root = PathBuf::from(shared.host.watch_dir());
        let found = tokio::task::spawn_blocking(move || find_logs(&root))
            .await
            .unwrap_or_default();

        if found.is_empty() {
            if !idle {
                idle = true;
                debug!(event = "source_idle", host = %shared.host.name);
                emitter.connection(HostConnection::Idle).await;
            }
            continue;
        }
        if idle {
            idle = false;
            emitter.connection(HostConnection::Connected).await;
        }

        for path in found {
            if lock(&shared.files).contains_key(&path) {
                continue;
            }
            let offset = match tokio::fs::metadata(&path).await {
                Ok(meta) => meta.len(),
                Err(_) => continue,
            };
            lock(&shared.files).insert(
                path.clone(),
                TrackedFile {
                    offset,
                    pending: Vec::new(),
                    last_data: Instant::now(),
                    tail: None,
                },
            );
            info!(event = "file_discovered", host = %shared.host.name, file = %path, offset);
            emitter.status(&path, FileStatus::New).await;

            let handle = tokio::spawn(tail_loop(shared.clone(), emitter.clone(), path.clone()));
            let abort = handle.abort_handle();
            match lock(&shared.files).get_mut(&path) {
                Some(tracked) => tracked.tail = Some(abort),
                None => abort.abort(),
            }
            shared.tasks.push(handle);
        }
    }
}

async fn tail_loop(shared: Arc<Shared>, emitter: Emitter, path: String) {
    let mut ticker = tokio::time::interval(shared.timings.tail_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match read_appended(&shared, &path).await {
            Ok(Some(lines)) => {
                for line in lines {
                    if !emitter.line(&path, &line).await {
                        return;
                    }
                }
            }
            Ok(None) => return,
            Err(err) => {
                debug!(event = "file_untracked", host = %shared.host.name, file = %path, error = %err);
                lock(&shared.files).remove(&path);
                return;
            }
        }
    }
}

/// Reads the bytes appended since the last poll. `Ok(None)` means the file
/// is no longer tracked.
async fn read_appended(shared: &Shared, path: &str) -> io::Result<Option<Vec<String>>> {
    let len = tokio::fs::metadata(path).await?.len();
    let offset = {
        let mut files = lock(&shared.files);
        let Some(tracked) = files.get_mut(path) else {
            return Ok(None);
        };
        if len < tracked.offset {
            debug!(event = "file_truncated", file = %path, offset = tracked.offset, len);
            tracked.offset = 0;
            tracked.pending.clear();
        }
        tracked.offset
    };
    if len == offset {
        return Ok(Some(Vec::new()));
    }

    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut chunk = Vec::new();
    file.take(len - offset).read_to_end(&mut chunk).await?;

    let mut files = lock(&shared.files);
    let Some(tracked) = files.get_mut(path) else {
        return Ok(None);
    };
    tracked.offset = offset + chunk.len() as u64;
    tracked.last_data = Instant::now();
    tracked.pending.extend_from_slice(&chunk);
    Ok(Some(drain_lines(&mut tracked.pending)))
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
            .map(|(path, tracked)| {
                let status = if tracked.last_data.elapsed() > threshold {
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

fn find_logs(root: &Path) -> Vec<String> {
    let mut found: Vec<String> = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry.path().extension().and_then(|ext| ext.to_str()) == Some(LOG_EXTENSION)
        })
        .filter_map(|entry| entry.path().to_str().map(str::to_string))
        .collect();
    found.sort();
    found
}
