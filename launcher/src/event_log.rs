// Per-process outcome log.
//
// Each process (server, client) appends one line per protocol event to
// its own file. The writer is shared across connection tasks via Arc
// and serializes whole lines through a mutex, so concurrent writers
// never interleave partial lines. This is separate from diagnostic
// logging via the `log` macros.

use anyhow::{Context, Result};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Sent,
    Acked,
    Timeout,
    Closed,
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Sent => "sent",
            EventKind::Acked => "acked",
            EventKind::Timeout => "timeout",
            EventKind::Closed => "closed",
            EventKind::Error => "error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct EventLog {
    file: Mutex<File>,
}

impl EventLog {
    /// Create the log file, truncating any leftover from a previous
    /// run. The parent directory must already exist (the launcher
    /// creates it before spawning).
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .context(format!("Failed to create log file: {}", path.display()))?;

        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Append one event line: `timestamp;event;sequence;detail`.
    /// Sequence is `-` for events that have none.
    pub fn record(&self, kind: EventKind, sequence: Option<u64>, detail: &str) {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let seq = match sequence {
            Some(n) => n.to_string(),
            None => "-".to_string(),
        };
        let line = format!("{timestamp};{kind};{seq};{detail}");

        // A log write failure must not take down the protocol loop;
        // it is reported through the diagnostic channel instead.
        let mut file = match self.file.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = writeln!(file, "{line}") {
            log::error!("Failed to append to event log: {e}");
        }
    }
}
