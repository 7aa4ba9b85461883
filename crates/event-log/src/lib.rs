//! Append-only audit log of admission decisions, sweeps and cost samples.

#![deny(unsafe_code)]

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

pub mod events;

pub use events::RelayEvent;

/// Identifier assigned to each appended record.
pub type EventId = u64;

/// Errors emitted by the event log.
#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialize: {0}")]
    Serde(#[from] serde_json::Error),
}

/// One line of the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord<T = RelayEvent> {
    /// Monotonic id, continues across restarts.
    pub id: EventId,
    pub ts_ms: u64,
    pub payload: T,
}

/// JSONL-backed append-only log. Clones share the id counter and writer lock.
#[derive(Debug, Clone)]
pub struct JsonlEventLog {
    path: PathBuf,
    next_id: Arc<AtomicU64>,
    writer: Arc<Mutex<()>>,
}

impl JsonlEventLog {
    /// Create or open a log at `path`, resuming ids after the last record.
    ///
    /// A final line without its newline is the remainder of an interrupted
    /// append: it is dropped when it does not parse and terminated when it does.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, EventLogError> {
        let p = path.as_ref();
        if !p.exists() {
            OpenOptions::new().create(true).write(true).truncate(true).open(p)?;
        }
        let scan = scan_ids(p)?;
        match scan.tail {
            Tail::Clean => {}
            Tail::Unterminated => OpenOptions::new().append(true).open(p)?.write_all(b"\n")?,
            Tail::Torn { keep_bytes } => OpenOptions::new().write(true).open(p)?.set_len(keep_bytes)?,
        }
        Ok(Self {
            path: p.to_path_buf(),
            next_id: Arc::new(AtomicU64::new(scan.last_id + 1)),
            writer: Arc::new(Mutex::new(())),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a payload; returns the assigned id.
    pub fn append<T: Serialize>(&self, ts_ms: u64, payload: &T) -> Result<EventId, EventLogError> {
        let _guard = self.writer.lock().unwrap_or_else(|p| p.into_inner());
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = serde_json::to_string(&EventRecord { id, ts_ms, payload })?;
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        Ok(id)
    }

    /// Read events with id in [start, end) (half-open range).
    pub fn read_range<T: DeserializeOwned>(
        &self,
        start: EventId,
        end: EventId,
    ) -> Result<Vec<EventRecord<T>>, EventLogError> {
        let reader = BufReader::new(File::open(&self.path)?);
        let mut out = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let rec: EventRecord<T> = serde_json::from_str(&line)?;
            if rec.id >= start && rec.id < end {
                out.push(rec);
            }
        }
        Ok(out)
    }

    /// Every relay event in the log.
    pub fn read_all(&self) -> Result<Vec<EventRecord>, EventLogError> {
        self.read_range(0, EventId::MAX)
    }
}

enum Tail {
    Clean,
    Unterminated,
    Torn { keep_bytes: u64 },
}

struct Scan {
    last_id: EventId,
    tail: Tail,
}

fn scan_ids(path: &Path) -> Result<Scan, EventLogError> {
    #[derive(Deserialize)]
    struct IdOnly {
        id: EventId,
    }
    let mut reader = BufReader::new(File::open(path)?);
    let mut last_id = 0;
    let mut offset = 0u64;
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf)?;
        if n == 0 {
            return Ok(Scan { last_id, tail: Tail::Clean });
        }
        let terminated = buf.last() == Some(&b'\n');
        let line = String::from_utf8_lossy(&buf);
        if line.trim().is_empty() {
            offset += n as u64;
            continue;
        }
        match serde_json::from_str::<IdOnly>(line.trim_end()) {
            Ok(rec) => last_id = last_id.max(rec.id),
            Err(_) if !terminated => {
                return Ok(Scan { last_id, tail: Tail::Torn { keep_bytes: offset } });
            }
            Err(e) => return Err(e.into()),
        }
        if !terminated {
            return Ok(Scan { last_id, tail: Tail::Unterminated });
        }
        offset += n as u64;
    }
}
