//! Append-only scheduler log file.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{info, warn};

pub const LOG_FILE_NAME: &str = "scheduler.log";

/// `[2024-01-15T03:00:00.000Z] message`
pub fn format_line(at: DateTime<Utc>, message: &str) -> String {
    format!("[{}] {}", at.to_rfc3339_opts(SecondsFormat::Millis, true), message)
}

/// Opened once per process and shared. Lines are flushed as they are written and never rewritten.
#[derive(Debug)]
pub struct SchedulerLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl SchedulerLog {
    /// Open `<dir>/scheduler.log` for appending, creating the directory if needed.
    pub fn open(dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(LOG_FILE_NAME);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry. I/O failures are reported through tracing and otherwise ignored.
    pub fn write(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        info!(target: "pickly_scheduler::log", "{message}");

        let line = format_line(Utc::now(), message);
        let mut file = self.file.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(err) = writeln!(file, "{line}").and_then(|()| file.flush()) {
            warn!(path = %self.path.display(), error = %err, "failed to append scheduler log");
        }
    }
}
