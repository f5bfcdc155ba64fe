//! Sync history log: tracks, per destination, the end of the last window that
//! was successfully delivered.
//!
//! The log is an append-only CSV (`destination,end_us,end_utc,committed_at_utc`)
//! so it stays auditable and hand-editable. The watermark of a destination is
//! the maximum `end_us` recorded for it; deleting a destination's rows resets
//! it to the epoch and forces a full resync.

use crate::error::WatermarkError;
use crate::window::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

const HEADER: [&str; 4] = ["destination", "end_us", "end_utc", "committed_at_utc"];

/// One row of the history log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncHistoryRecord {
    /// Destination the window was delivered to.
    pub destination: String,
    /// Exclusive end of the delivered window (microseconds since epoch).
    pub end_us: u64,
    /// `end_us` rendered for humans; ignored when reading.
    #[serde(default)]
    pub end_utc: Option<String>,
    /// Wall-clock time of the commit; ignored when reading.
    #[serde(default)]
    pub committed_at_utc: Option<String>,
}

impl SyncHistoryRecord {
    /// The window end as a timestamp.
    pub fn end(&self) -> Timestamp {
        Timestamp::from_micros(self.end_us)
    }
}

/// Durable per-destination watermark store backed by the history log.
#[derive(Debug)]
pub struct WatermarkStore {
    path: PathBuf,
    watermarks: Mutex<HashMap<String, Timestamp>>,
}

impl WatermarkStore {
    /// Open the store, reading the existing log. A missing file is an empty
    /// store; an unreadable or malformed one is
    /// [`WatermarkError::InvalidWatermarkStore`].
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, WatermarkError> {
        let path = path.into();
        let watermarks = Self::load(&path)?;
        debug!(path = %path.display(), destinations = watermarks.len(), "opened watermark store");
        Ok(Self {
            path,
            watermarks: Mutex::new(watermarks),
        })
    }

    /// Path of the history log.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the log, picking up manual edits made since the last read.
    pub fn reload(&self) -> Result<(), WatermarkError> {
        let fresh = Self::load(&self.path)?;
        *self.lock() = fresh;
        Ok(())
    }

    /// The current watermark for a destination; the epoch if never synced.
    pub fn current_watermark(&self, destination: &str) -> Timestamp {
        self.lock()
            .get(destination)
            .copied()
            .unwrap_or(Timestamp::EPOCH)
    }

    /// Snapshot of all known watermarks, sorted by destination.
    pub fn all_watermarks(&self) -> Vec<(String, Timestamp)> {
        let mut all: Vec<_> = self
            .lock()
            .iter()
            .map(|(dest, ts)| (dest.clone(), *ts))
            .collect();
        all.sort();
        all
    }

    /// Record that everything before `end` was delivered to `destination`.
    ///
    /// The row is flushed and fsynced before returning. The store keeps the
    /// maximum: a commit that does not move the watermark forward is not
    /// written and the existing value is returned.
    pub fn commit(&self, destination: &str, end: Timestamp) -> Result<Timestamp, WatermarkError> {
        let mut watermarks = self.lock();
        let current = watermarks
            .get(destination)
            .copied()
            .unwrap_or(Timestamp::EPOCH);
        if end <= current && watermarks.contains_key(destination) {
            debug!(destination, %end, %current, "commit does not advance watermark");
            return Ok(current);
        }

        self.append(destination, end)
            .map_err(|source| WatermarkError::Append {
                path: self.path.clone(),
                source,
            })?;
        watermarks.insert(destination.to_string(), end);
        info!(destination, %end, "watermark committed");
        Ok(end)
    }

    /// Full history, in file order.
    pub fn history(&self) -> Result<Vec<SyncHistoryRecord>, WatermarkError> {
        let _guard = self.lock();
        Self::read_records(&self.path)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Timestamp>> {
        self.watermarks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn append(&self, destination: &str, end: Timestamp) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)?;
        let needs_header = file.metadata()?.len() == 0;
        if !needs_header && !ends_with_newline(&mut file)? {
            // Hand-edited logs often lose the final newline.
            file.write_all(b"\n")?;
        }
        {
            let mut writer = csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(&mut file);
            if needs_header {
                writer.write_record(HEADER).map_err(csv_to_io)?;
            }
            writer
                .write_record([
                    destination.to_string(),
                    end.as_micros().to_string(),
                    end.to_rfc3339(),
                    Timestamp::now().to_rfc3339(),
                ])
                .map_err(csv_to_io)?;
            writer.flush()?;
        }
        file.sync_all()
    }

    fn load(path: &Path) -> Result<HashMap<String, Timestamp>, WatermarkError> {
        let mut watermarks: HashMap<String, Timestamp> = HashMap::new();
        for record in Self::read_records(path)? {
            let end = record.end();
            watermarks
                .entry(record.destination)
                .and_modify(|existing| *existing = (*existing).max(end))
                .or_insert(end);
        }
        Ok(watermarks)
    }

    fn read_records(path: &Path) -> Result<Vec<SyncHistoryRecord>, WatermarkError> {
        let invalid = |line: u64, msg: String| WatermarkError::InvalidWatermarkStore {
            path: path.to_path_buf(),
            line,
            msg,
        };

        let file = match std::fs::File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(invalid(0, e.to_string())),
        };

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(file);

        let headers = reader
            .headers()
            .map_err(|e| invalid(1, e.to_string()))?
            .clone();
        if headers.is_empty() {
            return Ok(Vec::new());
        }
        for required in ["destination", "end_us"] {
            if !headers.iter().any(|h| h == required) {
                return Err(invalid(1, format!("missing column {required:?}")));
            }
        }

        let mut records = Vec::new();
        for row in reader.deserialize::<SyncHistoryRecord>() {
            let record = row.map_err(|e| {
                let line = e.position().map(|p| p.line()).unwrap_or(0);
                invalid(line, e.to_string())
            })?;
            if record.destination.is_empty() {
                return Err(invalid(0, "empty destination".to_string()));
            }
            records.push(record);
        }
        Ok(records)
    }
}

fn ends_with_newline(file: &mut File) -> std::io::Result<bool> {
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

fn csv_to_io(e: csv::Error) -> std::io::Error {
    std::io::Error::other(e.to_string())
}
