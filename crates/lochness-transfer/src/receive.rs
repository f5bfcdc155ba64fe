//! Receiving side: drains an inbox of blobs into the local PHOENIX tree.
//!
//! A blob is acknowledged (deleted) only after every entry landed. Blobs
//! with per-file failures stay in the inbox and are retried on the next
//! poll; malformed blobs are moved aside so they are never retried.
//!
//! Blobs are applied strictly in arrival order. A blob that did not apply
//! cleanly holds back every newer one, so a later retry can never overwrite
//! newer content with older.

use crate::archive::CompressionAlgo;
use crate::unpack::{unpack, UnpackReport};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{error, info, warn};

/// Receiver settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveConfig {
    /// Directory that senders deliver blobs into.
    pub inbox: PathBuf,
    /// Where rejected blobs are moved. Defaults to `<inbox>/quarantine`.
    #[serde(default)]
    pub quarantine_dir: Option<PathBuf>,
}

impl ReceiveConfig {
    /// Effective quarantine directory.
    pub fn quarantine(&self) -> PathBuf {
        self.quarantine_dir
            .clone()
            .unwrap_or_else(|| self.inbox.join("quarantine"))
    }
}

/// What one pass over the inbox did.
#[derive(Debug, Default)]
pub struct ReceiveReport {
    /// Blobs fully applied and removed from the inbox.
    pub processed: Vec<UnpackReport>,
    /// Blobs moved to quarantine, with the reason.
    pub quarantined: Vec<(PathBuf, String)>,
    /// Blobs left in the inbox for another attempt.
    pub incomplete: Vec<PathBuf>,
}

impl ReceiveReport {
    /// Nothing was pending.
    pub fn is_idle(&self) -> bool {
        self.processed.is_empty() && self.quarantined.is_empty() && self.incomplete.is_empty()
    }
}

/// Applies delivered blobs to a destination tree.
#[derive(Debug, Clone)]
pub struct SecureCopyReceive {
    config: ReceiveConfig,
}

impl SecureCopyReceive {
    /// Create a new receiver.
    pub fn new(config: ReceiveConfig) -> Self {
        Self { config }
    }

    /// Completed blobs waiting in the inbox, oldest first.
    ///
    /// Temporary upload names (dotfiles, `.partial`) are never listed.
    pub fn pending(&self) -> std::io::Result<Vec<PathBuf>> {
        let entries = match std::fs::read_dir(&self.config.inbox) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut blobs: Vec<(SystemTime, PathBuf)> = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || name.ends_with(".partial") {
                continue;
            }
            if !CompressionAlgo::is_blob_name(&name) {
                continue;
            }
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            blobs.push((mtime, entry.path()));
        }
        blobs.sort();
        Ok(blobs.into_iter().map(|(_, path)| path).collect())
    }

    /// Unpack every pending blob into `destination_root`.
    ///
    /// Only I/O errors on the inbox itself are returned; per-blob failures
    /// are recorded in the report. The pass stops at the first blob that is
    /// left incomplete; newer blobs wait for the next poll.
    pub async fn receive_all(&self, destination_root: &Path) -> std::io::Result<ReceiveReport> {
        let mut report = ReceiveReport::default();
        let pending = self.pending()?;
        let total = pending.len();
        for (position, blob) in pending.into_iter().enumerate() {
            let root = destination_root.to_path_buf();
            let path = blob.clone();
            let outcome = tokio::task::spawn_blocking(move || unpack(&path, &root))
                .await
                .map_err(std::io::Error::other)?;

            match outcome {
                Ok(unpacked) if unpacked.is_complete() => {
                    tokio::fs::remove_file(&blob).await?;
                    report.processed.push(unpacked);
                }
                Ok(unpacked) => {
                    warn!(
                        blob = %blob.display(),
                        failed = unpacked.failed.len(),
                        held_back = total - position - 1,
                        "blob partially applied; keeping it and newer blobs for retry"
                    );
                    report.incomplete.push(blob);
                    break;
                }
                Err(e) if e.is_structural() => {
                    error!(blob = %blob.display(), error = %e, "rejecting malformed blob");
                    let reason = e.to_string();
                    self.quarantine(&blob).await?;
                    report.quarantined.push((blob, reason));
                }
                Err(e) => {
                    warn!(
                        blob = %blob.display(),
                        error = %e,
                        held_back = total - position - 1,
                        "failed to apply blob; will retry"
                    );
                    report.incomplete.push(blob);
                    break;
                }
            }
        }

        if !report.is_idle() {
            info!(
                processed = report.processed.len(),
                quarantined = report.quarantined.len(),
                incomplete = report.incomplete.len(),
                "inbox drained"
            );
        }
        Ok(report)
    }

    async fn quarantine(&self, blob: &Path) -> std::io::Result<()> {
        let dir = self.config.quarantine();
        tokio::fs::create_dir_all(&dir).await?;
        let name = blob.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        tokio::fs::rename(blob, dir.join(name)).await
    }
}
