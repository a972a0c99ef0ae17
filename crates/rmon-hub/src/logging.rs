use crate::cli::Settings;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{fmt::MakeWriter, EnvFilter};

const DEFAULT_LOG_STEM: &str = "ralph-monitor";

/// Writes every formatted record to stdout and, when one is open, to the
/// monitor's log file.
#[derive(Clone, Default)]
struct LogSink {
    file: Option<Arc<File>>,
}

struct SinkWriter<'a> {
    file: Option<&'a File>,
}

impl<'a> MakeWriter<'a> for LogSink {
    type Writer = SinkWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        SinkWriter {
            file: self.file.as_deref(),
        }
    }
}

impl Write for SinkWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = io::stdout().write_all(buf);
        if let Some(mut file) = self.file {
            file.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = io::stdout().flush();
        if let Some(mut file) = self.file {
            file.flush()?;
        }
        Ok(())
    }
}

pub fn filter_level(debug: bool) -> String {
    if debug {
        return "debug".to_string();
    }
    match std::env::var("RMON_LOG_LEVEL") {
        Ok(level) if !level.trim().is_empty() => level,
        _ => "info".to_string(),
    }
}

fn env_filter(debug: bool) -> EnvFilter {
    let level = filter_level(debug);
    if debug || std::env::var("RMON_LOG_LEVEL").is_ok() {
        return EnvFilter::new(level);
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Log file for a monitor run: `<log_dir>/<config file stem>.log`, so two
/// monitors started from different host files keep separate logs.
pub fn log_file_path(log_dir: &str, config_path: &Path) -> Option<PathBuf> {
    if log_dir.trim().is_empty() {
        return None;
    }
    let stem = config_path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty())
        .unwrap_or(DEFAULT_LOG_STEM);
    Some(Path::new(log_dir).join(format!("{stem}.log")))
}

fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Installs the global subscriber. Returns the log file path when file
/// output is active; an unopenable file degrades to stdout only.
pub fn init_logging(settings: &Settings) -> Option<PathBuf> {
    let path = log_file_path(&settings.log_dir, &settings.config_path);
    let file = path.as_deref().and_then(|path| match open_log_file(path) {
        Ok(file) => Some(Arc::new(file)),
        Err(err) => {
            eprintln!("log_file_error: {}: {err}", path.display());
            None
        }
    });
    let file_active = file.is_some();
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter(settings.debug))
        .with_writer(LogSink { file })
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    path.filter(|_| file_active)
}
