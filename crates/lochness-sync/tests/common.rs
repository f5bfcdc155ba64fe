#![allow(dead_code)]

use async_trait::async_trait;
use lochness_sync::config::{HddSourceConfig, SyncConfig};
use lochness_sync::orchestrator::Clock;
use lochness_transfer::{
    list_entries, ArchiveBlob, Timestamp, Transport, TransportError, TransportKind,
};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub fn secs(s: u64) -> Timestamp {
    Timestamp::from_secs(s)
}

/// Write `contents` under `root` and backdate the file to `mtime`.
pub fn write_file_at(root: &Path, rel: &str, contents: &[u8], mtime: Timestamp) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, contents).unwrap();
    File::options()
        .write(true)
        .open(&path)
        .unwrap()
        .set_modified(mtime.to_system_time())
        .unwrap();
}

/// A config rooted in `dir`, with PHOENIX/GENERAL already created.
pub fn test_config(dir: &Path) -> SyncConfig {
    let phoenix = dir.join("PHOENIX");
    std::fs::create_dir_all(phoenix.join("GENERAL")).unwrap();
    SyncConfig {
        phoenix_root: phoenix,
        lochness_sync_history_csv: dir.join("lochness_sync_history.csv"),
        outbox_dir: dir.join("outbox"),
        state_dir: dir.join("state"),
        ..SyncConfig::default()
    }
}

/// Add an hdd source at `dir/hdd` and one subject whose metadata points at it.
pub fn with_hdd_subject(config: &mut SyncConfig, dir: &Path, study: &str, subject: &str) -> PathBuf {
    let base = dir.join("hdd");
    std::fs::create_dir_all(base.join(study).join(subject)).unwrap();
    config.sources.hdd = Some(HddSourceConfig {
        base: base.clone(),
        protect: true,
    });
    let metadata = config
        .phoenix_root
        .join("GENERAL")
        .join(study)
        .join(format!("{study}_metadata.csv"));
    std::fs::create_dir_all(metadata.parent().unwrap()).unwrap();
    std::fs::write(
        &metadata,
        format!("Active,Consent,Subject ID,HDD\n1,2020-01-01,{subject},hdd.{study}:{subject}\n"),
    )
    .unwrap();
    base.join(study).join(subject)
}

pub fn fixed_clock(t: Timestamp) -> Clock {
    Arc::new(move || t)
}

/// A clock that can be moved between cycles.
pub struct ManualClock(Arc<AtomicU64>);

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self(Arc::new(AtomicU64::new(start.as_micros())))
    }

    pub fn set(&self, t: Timestamp) {
        self.0.store(t.as_micros(), Ordering::SeqCst);
    }

    pub fn clock(&self) -> Clock {
        let now = self.0.clone();
        Arc::new(move || Timestamp::from_micros(now.load(Ordering::SeqCst)))
    }
}

/// Accepts every blob and remembers the entry list of each one.
#[derive(Default)]
pub struct RecordingTransport {
    pub deliveries: Mutex<Vec<Vec<PathBuf>>>,
}

impl RecordingTransport {
    pub fn last_entries(&self) -> Vec<PathBuf> {
        let mut entries = self.deliveries.lock().unwrap().last().cloned().unwrap_or_default();
        entries.sort();
        entries
    }

    pub fn count(&self) -> usize {
        self.deliveries.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Mirror
    }

    async fn push(&self, blob: &ArchiveBlob) -> Result<u64, TransportError> {
        let entries = list_entries(&blob.path).map_err(|e| TransportError::Network {
            msg: e.to_string(),
        })?;
        self.deliveries.lock().unwrap().push(entries);
        Ok(blob.bytes)
    }
}

/// Never finishes a push.
#[derive(Default)]
pub struct StalledTransport {
    pub calls: AtomicUsize,
}

#[async_trait]
impl Transport for StalledTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::SecureCopy
    }

    async fn push(&self, _blob: &ArchiveBlob) -> Result<u64, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}
