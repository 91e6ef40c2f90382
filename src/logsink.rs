//! Per-run session log files.
//!
//! Every chunk the agent writes is appended verbatim under a stream tag,
//! and every published event is mirrored as `[system] [seq|type] <json>`.
//! Logs are append-only; rotation is left to the host.

use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::PathBuf,
};

use chrono::Utc;

use crate::models::event::Event;
use crate::{AppError, Result};

/// Origin of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTag {
    /// Agent standard output.
    Stdout,
    /// Agent standard error.
    Stderr,
    /// Supervisor-generated text.
    System,
    /// Human input.
    User,
}

impl StreamTag {
    /// Prefix written before each line.
    #[must_use]
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Stdout => "[stdout]",
            Self::Stderr => "[stderr]",
            Self::System => "[system]",
            Self::User => "[user]",
        }
    }
}

/// Final size of a closed log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogStats {
    /// Bytes written.
    pub byte_size: u64,
    /// Lines written.
    pub line_count: u64,
}

/// Append-only log owned by exactly one supervisor run.
pub trait LogSink: Send + Sync {
    /// Append `text` under `tag`, one prefixed line per input line.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the write fails.
    fn write(&mut self, tag: StreamTag, text: &str) -> Result<()>;

    /// Mirror a sequenced event.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if serialization or the write fails.
    fn write_event(&mut self, event: &Event) -> Result<()> {
        let json = serde_json::to_string(event)
            .map_err(|e| AppError::Io(format!("failed to encode event: {e}")))?;
        let line = format!("[{}|{}] {json}", event.seq, event.payload.type_name());
        self.write(StreamTag::System, &line)
    }

    /// Flush and close; later writes are ignored.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the flush fails.
    fn close(&mut self) -> Result<LogStats>;
}

/// Opens a fresh sink for a session run.
pub trait LogSinkFactory: Send + Sync {
    /// Open a sink and return it with its location.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the log cannot be created.
    fn open(&self, session_id: &str) -> Result<(Box<dyn LogSink>, String)>;
}

/// Factory writing `<log_dir>/<session_id>/<timestamp>.log`.
pub struct FileLogSinkFactory {
    log_dir: PathBuf,
}

impl FileLogSinkFactory {
    /// Construct a factory rooted at `log_dir`.
    #[must_use]
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir }
    }
}

impl LogSinkFactory for FileLogSinkFactory {
    fn open(&self, session_id: &str) -> Result<(Box<dyn LogSink>, String)> {
        let dir = self.log_dir.join(session_id);
        fs::create_dir_all(&dir).map_err(|e| {
            AppError::Io(format!("failed to create log directory {}: {e}", dir.display()))
        })?;

        let path = dir.join(format!("{}.log", Utc::now().format("%Y%m%dT%H%M%S%.3f")));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| AppError::Io(format!("failed to open log {}: {e}", path.display())))?;

        let location = path.display().to_string();
        Ok((Box::new(FileLogSink::new(file)), location))
    }
}

/// Buffered file sink that counts what it writes.
pub struct FileLogSink {
    writer: Option<BufWriter<File>>,
    stats: LogStats,
}

impl FileLogSink {
    fn new(file: File) -> Self {
        Self {
            writer: Some(BufWriter::new(file)),
            stats: LogStats::default(),
        }
    }
}

impl LogSink for FileLogSink {
    fn write(&mut self, tag: StreamTag, text: &str) -> Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };

        for line in text.lines() {
            let rendered = format!("{} {line}\n", tag.prefix());
            writer
                .write_all(rendered.as_bytes())
                .map_err(|e| AppError::Io(format!("log write failed: {e}")))?;
            self.stats.byte_size += rendered.len() as u64;
            self.stats.line_count += 1;
        }
        writer
            .flush()
            .map_err(|e| AppError::Io(format!("log flush failed: {e}")))
    }

    fn close(&mut self) -> Result<LogStats> {
        if let Some(mut writer) = self.writer.take() {
            writer
                .flush()
                .map_err(|e| AppError::Io(format!("log flush failed: {e}")))?;
        }
        Ok(self.stats)
    }
}
