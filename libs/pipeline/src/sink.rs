//! Durable log sink.
//!
//! Every write is flushed and fsync'd before it returns. Two layouts are
//! supported:
//!
//! - **Single file**: records are appended to one file, each one being the
//!   raw payload followed by a separator line carrying the tag and a UTC
//!   timestamp.
//! - **Per-event file**: each event lands in its own file named
//!   `"<tag> <timestamp>"` inside a directory, holding only the payload.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::event::Event;

/// Prefix of the separator line written after each single-file record.
pub const RECORD_SEPARATOR: &str = "\n>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>> ";

/// `asctime`-style UTC timestamp, e.g. `Thu Oct 19 09:05:01 2026`.
const TIMESTAMP_FORMAT: &str = "%a %b %e %H:%M:%S %Y";

/// Same layout with nanoseconds, used for per-event file names.
const FILE_TIMESTAMP_FORMAT: &str = "%a %b %e %H:%M:%S%.9f %Y";

/// Where and how events are persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogLayout {
    /// Append every event to one shared file.
    SingleFile(PathBuf),
    /// Write each event to a fresh file inside this directory.
    PerEventFile(PathBuf),
}

/// Receives drained events, one at a time, from the consumer.
///
/// The consumer is generic over this trait; production uses [`DurableLog`].
pub trait EventWriter: Send + 'static {
    /// Persist one event. Must not return before the write is durable.
    fn write(&mut self, sequence: u64, event: &Event) -> io::Result<()>;

    /// Called once after the last event has been drained.
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

enum Target {
    SingleFile { path: PathBuf, file: File },
    PerEventFile { dir: PathBuf },
}

/// Append-only, fsync'd log of relayed payloads.
pub struct DurableLog {
    target: Target,
}

impl DurableLog {
    /// Open the log, creating the file or directory as needed.
    pub fn open(layout: &LogLayout) -> io::Result<Self> {
        let target = match layout {
            LogLayout::SingleFile(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent)?;
                }
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                info!(path = %path.display(), "Opened single-file log");
                Target::SingleFile {
                    path: path.clone(),
                    file,
                }
            }
            LogLayout::PerEventFile(dir) => {
                fs::create_dir_all(dir)?;
                info!(dir = %dir.display(), "Opened per-event log directory");
                Target::PerEventFile { dir: dir.clone() }
            }
        };

        Ok(Self { target })
    }

    /// Write one event stamped with `at`.
    pub fn write_event(&mut self, event: &Event, at: DateTime<Utc>) -> io::Result<()> {
        match &mut self.target {
            Target::SingleFile { file, .. } => {
                let record = single_file_record(event, at);
                file.write_all(&record)?;
                file.flush()?;
                file.sync_all()
            }
            Target::PerEventFile { dir } => {
                let path = dir.join(event_file_name(&event.tag, at));
                let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
                file.write_all(&event.payload)?;
                file.flush()?;
                file.sync_all()?;
                debug!(path = %path.display(), bytes = event.len(), "Wrote event file");
                Ok(())
            }
        }
    }

    /// Path of the shared file or the event directory.
    pub fn location(&self) -> &Path {
        match &self.target {
            Target::SingleFile { path, .. } => path,
            Target::PerEventFile { dir } => dir,
        }
    }
}

impl EventWriter for DurableLog {
    fn write(&mut self, _sequence: u64, event: &Event) -> io::Result<()> {
        self.write_event(event, Utc::now())
    }

    fn close(&mut self) -> io::Result<()> {
        if let Target::SingleFile { file, .. } = &mut self.target {
            file.flush()?;
            file.sync_all()?;
        }
        info!(location = %self.location().display(), "Closed log sink");
        Ok(())
    }
}

/// Format the separator line that follows a single-file record.
pub fn record_separator(tag: &str, at: DateTime<Utc>) -> String {
    format!("{RECORD_SEPARATOR}{tag} {}\n", at.format(TIMESTAMP_FORMAT))
}

/// Name of the file holding one event in per-event mode.
pub fn event_file_name(tag: &str, at: DateTime<Utc>) -> String {
    format!("{tag} {}", at.format(FILE_TIMESTAMP_FORMAT))
}

fn single_file_record(event: &Event, at: DateTime<Utc>) -> Vec<u8> {
    let separator = record_separator(&event.tag, at);
    let mut record = Vec::with_capacity(event.len() + separator.len());
    record.extend_from_slice(&event.payload);
    record.extend_from_slice(separator.as_bytes());
    record
}
