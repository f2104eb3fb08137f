//! Append-only JSONL event log.
//!
//! Every component writes through one shared `EventLog`; lines are written
//! whole under a mutex and flushed immediately so a crash loses at most the
//! event being written.

use improve_core::{EventKind, LogEvent};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("event log io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EventLogError>;

#[derive(Debug)]
pub struct EventLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl EventLog {
    /// Open (creating if needed) the log for appending.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one timestamped event.
    pub fn append(&self, event: EventKind) -> Result<()> {
        let mut line = LogEvent::now(event).to_line()?;
        line.push('\n');

        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Append, logging instead of failing. Used on paths where a lost event
    /// must not abort the improvement.
    pub fn emit(&self, event: EventKind) {
        let kind = event.as_str();
        if let Err(err) = self.append(event) {
            warn!(kind, error = %err, path = %self.path.display(), "failed to write event");
        }
    }

    /// Read every parseable event. A missing file is an empty log.
    pub fn read_all(path: &Path) -> Result<Vec<LogEvent>> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut events = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match LogEvent::from_line(trimmed) {
                Ok(event) => events.push(event),
                Err(err) => {
                    debug!(line = idx + 1, error = %err, "skipping unparseable event line");
                }
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn append_then_read_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs/events.jsonl");
        let log = EventLog::open(&path).unwrap();

        log.append(EventKind::BacklogRefilled { added: 3 }).unwrap();
        log.emit(EventKind::WorkspaceRemoved {
            branch: "improve/001".to_string(),
        });

        let events = EventLog::read_all(&path).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, EventKind::BacklogRefilled { added: 3 });
        assert_eq!(events[1].event.as_str(), "workspace_removed");
    }

    #[test]
    fn reopen_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.jsonl");
        EventLog::open(&path)
            .unwrap()
            .append(EventKind::BacklogRefilled { added: 1 })
            .unwrap();
        EventLog::open(&path)
            .unwrap()
            .append(EventKind::BacklogRefilled { added: 2 })
            .unwrap();
        assert_eq!(EventLog::read_all(&path).unwrap().len(), 2);
    }

    #[test]
    fn read_all_skips_malformed_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.jsonl");
        std::fs::write(
            &path,
            "not json\n\n{\"ts\":\"2025-01-01T00:00:00Z\",\"kind\":\"backlog_refilled\",\"added\":2}\n{\"kind\":",
        )
        .unwrap();
        let events = EventLog::read_all(&path).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn missing_log_reads_empty() {
        let dir = TempDir::new().unwrap();
        assert!(EventLog::read_all(&dir.path().join("none.jsonl"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn concurrent_writers_produce_whole_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.jsonl");
        let log = Arc::new(EventLog::open(&path).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let log = Arc::clone(&log);
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        log.append(EventKind::BacklogRefilled { added: i }).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(EventLog::read_all(&path).unwrap().len(), 200);
    }
}
