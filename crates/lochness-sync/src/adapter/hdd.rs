//! `hdd` source: copies a subject's files from a mounted drive.
//!
//! Source layout is `<base>/<module>/<id>/...` where `module` and `id` come
//! from the subject's `hdd.<module>:<id>` metadata value. Files land under
//! `PHOENIX/{PROTECTED|GENERAL}/<study>/<subject>/` with the same relative
//! structure. A per-subject ledger of [`ModuleFile`] records, kept in the
//! state directory, makes repeated syncs skip files that are unchanged.

use super::{SourceAdapter, SyncStats};
use crate::config::{HddSourceConfig, SyncConfig};
use crate::error::AdapterError;
use crate::subject::Subject;
use async_trait::async_trait;
use lochness_transfer::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const NAME: &str = "hdd";

/// Ledger record for one fetched file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleFile {
    /// Path of the file relative to the subject's source directory.
    pub vendor_file_id: String,
    /// Where the copy was written.
    pub local_path: PathBuf,
    /// `<size>:<mtime_us>` of the source file when it was fetched.
    pub content_key: String,
    /// mtime of the local copy right after it was written.
    pub last_downloaded_mtime: Timestamp,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Ledger {
    files: BTreeMap<String, ModuleFile>,
}

impl Ledger {
    fn load(path: &Path) -> Result<Self, AdapterError> {
        match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                AdapterError::Io(std::io::Error::other(format!(
                    "corrupt ledger {}: {e}",
                    path.display()
                )))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, path: &Path) -> Result<(), AdapterError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.partial");
        let json = serde_json::to_vec_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Local mirror adapter.
///
/// At most one copy runs per subject. The lock is held by the blocking copy
/// itself, so an attempt abandoned on timeout still blocks the next one until
/// it has really stopped.
#[derive(Default)]
pub struct HddAdapter {
    subject_locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl HddAdapter {
    fn subject_lock(&self, ledger: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .subject_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(ledger.to_path_buf()).or_default().clone()
    }
}

/// Raises its flag when dropped, which happens when the awaiting attempt is
/// abandoned.
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

pub(super) fn build(config: &SyncConfig) -> Result<Arc<dyn SourceAdapter>, AdapterError> {
    if config.sources.hdd.is_none() {
        return Err(AdapterError::NotConfigured {
            source_name: NAME.to_string(),
            msg: "missing [sources.hdd] section".to_string(),
        });
    }
    Ok(Arc::new(HddAdapter::default()))
}

/// Ledger location for a subject.
pub fn ledger_path(state_dir: &Path, subject: &Subject) -> PathBuf {
    state_dir
        .join(NAME)
        .join(&subject.study)
        .join(format!("{}.json", subject.id))
}

/// Where a subject's files are placed.
pub fn subject_dir(phoenix_root: &Path, hdd: &HddSourceConfig, subject: &Subject) -> PathBuf {
    let level = if hdd.protect { "PROTECTED" } else { "GENERAL" };
    phoenix_root.join(level).join(&subject.study).join(&subject.id)
}

#[async_trait]
impl SourceAdapter for HddAdapter {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn sync(
        &self,
        config: &SyncConfig,
        subject: &Subject,
        dry_run: bool,
    ) -> Result<SyncStats, AdapterError> {
        let hdd = config.sources.hdd.clone().ok_or_else(|| AdapterError::NotConfigured {
            source_name: NAME.to_string(),
            msg: "missing [sources.hdd] section".to_string(),
        })?;
        let Some(source_id) = subject.source_id(NAME) else {
            return Ok(SyncStats::default());
        };
        if !hdd.base.is_dir() {
            return Err(AdapterError::SourceUnavailable {
                source_name: NAME.to_string(),
                msg: format!("{} is not mounted", hdd.base.display()),
            });
        }

        let source_dir = hdd.base.join(&source_id.module).join(&source_id.id);
        let dest_dir = subject_dir(&config.phoenix_root, &hdd, subject);
        let ledger = ledger_path(&config.state_dir, subject);
        let label = format!("{}/{}", subject.study, subject.id);

        let guard = self.subject_lock(&ledger).lock_owned().await;
        let cancelled = Arc::new(AtomicBool::new(false));
        let _cancel = CancelOnDrop(cancelled.clone());

        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            copy_subject(&source_dir, &dest_dir, &ledger, &label, dry_run, &cancelled)
        })
        .await
        .map_err(std::io::Error::other)?
    }
}

fn content_key(meta: &std::fs::Metadata) -> String {
    let mtime = meta
        .modified()
        .map(Timestamp::from_system_time)
        .unwrap_or(Timestamp::EPOCH);
    format!("{}:{}", meta.len(), mtime.as_micros())
}

fn copy_subject(
    source_dir: &Path,
    dest_dir: &Path,
    ledger_path: &Path,
    label: &str,
    dry_run: bool,
    cancelled: &AtomicBool,
) -> Result<SyncStats, AdapterError> {
    let mut stats = SyncStats::default();
    if !source_dir.is_dir() {
        debug!(subject = label, path = %source_dir.display(), "no hdd data for subject");
        return Ok(stats);
    }

    let mut ledger = Ledger::load(ledger_path)?;
    let mut changed = false;
    let walked = fetch_changed(
        source_dir,
        dest_dir,
        label,
        dry_run,
        cancelled,
        &mut ledger,
        &mut changed,
        &mut stats,
    );

    // Files copied before a failure stay recorded.
    if changed {
        ledger.save(ledger_path)?;
    }
    if let Err(e) = walked {
        warn!(subject = label, fetched = stats.files_fetched, error = %e, "hdd sync stopped early");
        return Err(e);
    }

    if stats.files_fetched > 0 {
        info!(
            subject = label,
            fetched = stats.files_fetched,
            skipped = stats.files_skipped,
            bytes = stats.bytes_fetched,
            dry_run,
            "hdd sync finished"
        );
    }
    Ok(stats)
}

#[allow(clippy::too_many_arguments)]
fn fetch_changed(
    source_dir: &Path,
    dest_dir: &Path,
    label: &str,
    dry_run: bool,
    cancelled: &AtomicBool,
    ledger: &mut Ledger,
    changed: &mut bool,
    stats: &mut SyncStats,
) -> Result<(), AdapterError> {
    for entry in WalkDir::new(source_dir)
        .follow_links(false)
        .sort_by_file_name()
    {
        if cancelled.load(Ordering::Relaxed) {
            return Err(AdapterError::Interrupted {
                source_name: NAME.to_string(),
            });
        }
        let entry = entry.map_err(|e| AdapterError::Io(std::io::Error::other(e)))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(source_dir) else {
            continue;
        };
        let vendor_file_id = rel.to_string_lossy().replace('\\', "/");
        let meta = entry.metadata().map_err(|e| AdapterError::Io(std::io::Error::other(e)))?;
        let key = content_key(&meta);
        let local_path = dest_dir.join(rel);

        let unchanged = ledger
            .files
            .get(&vendor_file_id)
            .is_some_and(|m| m.content_key == key && m.local_path == local_path);
        if unchanged && local_path.is_file() {
            stats.files_skipped += 1;
            continue;
        }

        if dry_run {
            stats.files_fetched += 1;
            stats.bytes_fetched += meta.len();
            info!(subject = label, file = %vendor_file_id, "would fetch");
            continue;
        }

        copy_file(entry.path(), &local_path)?;
        stats.files_fetched += 1;
        stats.bytes_fetched += meta.len();
        let last_downloaded_mtime = std::fs::metadata(&local_path)?
            .modified()
            .map(Timestamp::from_system_time)
            .unwrap_or(Timestamp::EPOCH);
        debug!(subject = label, file = %vendor_file_id, bytes = meta.len(), "fetched");
        ledger.files.insert(
            vendor_file_id.clone(),
            ModuleFile {
                vendor_file_id,
                local_path,
                content_key: key,
                last_downloaded_mtime,
            },
        );
        *changed = true;
    }
    Ok(())
}

/// Copy through a temporary sibling so readers never see a partial file.
/// The copy gets a fresh mtime, which is what puts it in the next window.
fn copy_file(from: &Path, to: &Path) -> std::io::Result<()> {
    let parent = to
        .parent()
        .ok_or_else(|| std::io::Error::other("destination has no parent"))?;
    std::fs::create_dir_all(parent)?;
    let name = to.file_name().unwrap_or_default().to_string_lossy();
    let tmp = parent.join(format!(".{name}.lochness-partial"));
    let placed = std::fs::copy(from, &tmp).and_then(|_| std::fs::rename(&tmp, to));
    if placed.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    placed
}
