use anyhow::Result;
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

/// Per-unit transfer events emitted by the replicator and the sync client
pub trait Logger: Send + Sync {
    fn start(&self, _src: &Path, _dst: &Path) {}
    fn copy_done(&self, _src: &Path, _dst: &Path, _bytes: u64) {}
    fn skipped(&self, _src: &Path, _dst: &Path) {}
    fn error(&self, _context: &str, _path: &Path, _msg: &str) {}
    fn done(&self, _units: u64, _failed: u64, _bytes: u64, _seconds: f64) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

/// Timestamped lines appended to a log file
pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
        }
    }
}

impl Logger for TextLogger {
    fn start(&self, src: &Path, dst: &Path) {
        self.line(&format!("START src={} dst={}", src.display(), dst.display()));
    }
    fn copy_done(&self, src: &Path, dst: &Path, bytes: u64) {
        self.line(&format!(
            "COPY src={} dst={} bytes={}",
            src.display(),
            dst.display(),
            bytes
        ));
    }
    fn skipped(&self, src: &Path, dst: &Path) {
        self.line(&format!("SKIP src={} dst={}", src.display(), dst.display()));
    }
    fn error(&self, context: &str, path: &Path, msg: &str) {
        self.line(&format!("ERROR ctx={} path={} msg={}", context, path.display(), msg));
    }
    fn done(&self, units: u64, failed: u64, bytes: u64, seconds: f64) {
        self.line(&format!(
            "DONE units={units} failed={failed} bytes={bytes} seconds={seconds:.3}"
        ));
    }
}

/// Forwards events to `tracing`
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn copy_done(&self, src: &Path, dst: &Path, bytes: u64) {
        tracing::debug!(src = %src.display(), dst = %dst.display(), bytes, "copied");
    }
    fn skipped(&self, src: &Path, dst: &Path) {
        tracing::debug!(src = %src.display(), dst = %dst.display(), "up to date");
    }
    fn error(&self, context: &str, path: &Path, msg: &str) {
        tracing::warn!(context, path = %path.display(), "{msg}");
    }
    fn done(&self, units: u64, failed: u64, bytes: u64, seconds: f64) {
        tracing::info!(units, failed, bytes, seconds, "finished");
    }
}

/// Pick the file logger when a path is given, otherwise forward to tracing
pub fn select(log_file: Option<&Path>) -> Box<dyn Logger> {
    match log_file {
        Some(p) => match TextLogger::new(p) {
            Ok(l) => Box::new(l),
            Err(e) => {
                tracing::warn!(path = %p.display(), error = %e, "cannot open log file");
                Box::new(TracingLogger)
            }
        },
        None => Box::new(TracingLogger),
    }
}
