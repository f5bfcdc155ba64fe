//! One sync cycle: pull from sources, then ship the new files to every
//! destination.
//!
//! Adapter calls for independent (subject, source) pairs run concurrently,
//! bounded by `adapter_concurrency`. Once they are all done, each destination
//! runs its own scan, pack, send and commit pipeline in a separate task.
//! A destination's watermark only moves after its send succeeded, so a
//! failure for one destination never affects another.

use crate::adapter::{SourceAdapter, SyncStats};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::retry::{AttemptState, RetryPolicy};
use crate::subject::{read_phoenix_metadata, Subject};
use lochness_transfer::archive::blob_name;
use lochness_transfer::{
    send, ArchiveBlob, ArchiveError, Archiver, ChangeSetScanner, CompressionAlgo, ScanError,
    SyncWindow, Timestamp, Transport, WatermarkStore,
};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, error, info, warn};

/// Source of "now" for window ends.
pub type Clock = Arc<dyn Fn() -> Timestamp + Send + Sync>;

/// Per-run switches from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleOptions {
    /// Report what would happen without writing, sending or committing.
    pub dry_run: bool,
    /// Run the transfer phase after the adapters.
    pub send: bool,
    /// Skip subjects marked inactive in the metadata.
    pub skip_inactive: bool,
}

impl Default for CycleOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            send: true,
            skip_inactive: false,
        }
    }
}

/// Result of one (subject, source) adapter call.
#[derive(Debug, Clone, Serialize)]
pub struct AdapterOutcome {
    /// Adapter name.
    pub source: String,
    /// Study of the subject.
    pub study: String,
    /// Subject id.
    pub subject: String,
    /// Final state after retries.
    pub state: AttemptState,
    /// Tries made.
    pub attempts: u32,
    /// Work done, on success.
    pub stats: Option<SyncStats>,
    /// Last error, on failure.
    pub error: Option<String>,
}

/// How a destination's pipeline ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DestinationStatus {
    /// Blob delivered and watermark committed.
    Sent,
    /// Transient failure; the watermark is unchanged.
    Failed,
    /// Structural failure needing operator attention.
    Fatal,
    /// Scan only.
    DryRun,
}

/// Result of one destination's pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct DestinationOutcome {
    /// Configured id.
    pub destination_id: String,
    /// How it ended.
    pub status: DestinationStatus,
    /// Window scanned this cycle.
    pub window: SyncWindow,
    /// Files in the change-set.
    pub entries: usize,
    /// Bytes delivered, zero unless sent.
    pub bytes_sent: u64,
    /// Watermark after the cycle.
    pub watermark: Timestamp,
    /// Why it did not reach `Sent`.
    pub error: Option<String>,
}

/// Everything one cycle did. Failures are recorded here, not raised.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    /// Clock reading at cycle start.
    pub started_at: Timestamp,
    /// One entry per adapter call.
    pub adapters: Vec<AdapterOutcome>,
    /// One entry per destination; empty without `send`.
    pub destinations: Vec<DestinationOutcome>,
}

/// Counts for the end-of-cycle log line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleSummary {
    /// Adapter calls made.
    pub adapter_calls: usize,
    /// Adapter calls that ended `Failed`.
    pub adapter_failures: usize,
    /// Destinations processed.
    pub destinations: usize,
    /// Destinations that reached `Sent`.
    pub sent: usize,
    /// Transient destination failures.
    pub failed: usize,
    /// Fatal destination failures.
    pub fatal: usize,
}

impl CycleReport {
    /// Counts for logging.
    pub fn summary(&self) -> CycleSummary {
        let count = |status| {
            self.destinations
                .iter()
                .filter(|d| d.status == status)
                .count()
        };
        CycleSummary {
            adapter_calls: self.adapters.len(),
            adapter_failures: self
                .adapters
                .iter()
                .filter(|a| a.state == AttemptState::Failed)
                .count(),
            destinations: self.destinations.len(),
            sent: count(DestinationStatus::Sent),
            failed: count(DestinationStatus::Failed),
            fatal: count(DestinationStatus::Fatal),
        }
    }

    /// One line per failed adapter call or destination.
    pub fn failures(&self) -> Vec<String> {
        let adapters = self
            .adapters
            .iter()
            .filter(|a| a.state == AttemptState::Failed)
            .map(|a| {
                format!(
                    "{} {}/{}: {}",
                    a.source,
                    a.study,
                    a.subject,
                    a.error.as_deref().unwrap_or("failed")
                )
            });
        let destinations = self
            .destinations
            .iter()
            .filter(|d| matches!(d.status, DestinationStatus::Failed | DestinationStatus::Fatal))
            .map(|d| {
                format!(
                    "destination {}: {}",
                    d.destination_id,
                    d.error.as_deref().unwrap_or("failed")
                )
            });
        adapters.chain(destinations).collect()
    }

    /// Any destination needs operator attention.
    pub fn has_fatal(&self) -> bool {
        self.destinations
            .iter()
            .any(|d| d.status == DestinationStatus::Fatal)
    }

    /// Outcome of one destination.
    pub fn destination(&self, id: &str) -> Option<&DestinationOutcome> {
        self.destinations.iter().find(|d| d.destination_id == id)
    }
}

#[derive(Clone)]
struct DestinationPipeline {
    id: String,
    transport: Arc<dyn Transport>,
    /// Held for the whole scan-to-commit sequence of this destination.
    lock: Arc<Mutex<()>>,
}

/// Shared, read-only inputs of the transfer phase.
#[derive(Clone)]
struct TransferContext {
    config: Arc<SyncConfig>,
    store: Arc<WatermarkStore>,
    clock: Clock,
    dry_run: bool,
}

/// Runs sync cycles over a fixed set of adapters and destinations.
pub struct SyncOrchestrator {
    config: Arc<SyncConfig>,
    store: Arc<WatermarkStore>,
    adapters: Vec<Arc<dyn SourceAdapter>>,
    destinations: Vec<DestinationPipeline>,
    options: CycleOptions,
    clock: Clock,
}

impl SyncOrchestrator {
    /// An orchestrator with no adapters and no destinations.
    pub fn new(config: Arc<SyncConfig>, store: Arc<WatermarkStore>) -> Self {
        Self {
            config,
            store,
            adapters: Vec::new(),
            destinations: Vec::new(),
            options: CycleOptions::default(),
            clock: Arc::new(Timestamp::now),
        }
    }

    /// Build every destination's transport from the config.
    pub async fn from_config(config: Arc<SyncConfig>, store: Arc<WatermarkStore>) -> Self {
        let mut orchestrator = Self::new(config.clone(), store);
        for dest in &config.destinations {
            let transport = dest.transport.build().await;
            orchestrator = orchestrator.with_destination(dest.id.clone(), transport);
        }
        orchestrator
    }

    /// Source adapters to run for every subject.
    pub fn with_adapters(mut self, adapters: Vec<Arc<dyn SourceAdapter>>) -> Self {
        self.adapters = adapters;
        self
    }

    /// Add a destination.
    pub fn with_destination(mut self, id: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        self.destinations.push(DestinationPipeline {
            id: id.into(),
            transport,
            lock: Arc::new(Mutex::new(())),
        });
        self
    }

    /// Replace the cycle options.
    pub fn with_options(mut self, options: CycleOptions) -> Self {
        self.options = options;
        self
    }

    /// Replace the clock used for window ends.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Ids of the configured destinations, in order.
    pub fn destination_ids(&self) -> Vec<&str> {
        self.destinations.iter().map(|d| d.id.as_str()).collect()
    }

    /// Run one cycle.
    ///
    /// Returns `Err` only when the watermark store is unusable; every other
    /// failure is recorded in the report.
    pub async fn run_cycle(&self) -> Result<CycleReport, SyncError> {
        self.store.reload()?;
        let started_at = (self.clock)();
        info!(
            adapters = self.adapters.len(),
            destinations = self.destinations.len(),
            dry_run = self.options.dry_run,
            send = self.options.send,
            "sync cycle started"
        );

        let adapters = self.run_adapters().await;
        let destinations = if self.options.send {
            self.transfer_all().await
        } else {
            Vec::new()
        };

        let report = CycleReport {
            started_at,
            adapters,
            destinations,
        };
        let summary = report.summary();
        if report.has_fatal() {
            error!(?summary, "sync cycle finished with fatal errors");
        } else {
            info!(?summary, "sync cycle finished");
        }
        for failure in report.failures() {
            warn!(%failure, "cycle failure");
        }
        Ok(report)
    }

    async fn run_adapters(&self) -> Vec<AdapterOutcome> {
        if self.adapters.is_empty() {
            return Vec::new();
        }
        let subjects = match read_phoenix_metadata(&self.config.phoenix_root, &self.config.studies) {
            Ok(subjects) => subjects,
            Err(e) => {
                warn!(error = %e, "could not read subject metadata; skipping sources");
                return Vec::new();
            }
        };

        let policy = RetryPolicy::from_config(&self.config);
        let semaphore = Arc::new(Semaphore::new(self.config.adapter_concurrency.max(1)));
        let dry_run = self.options.dry_run;
        let mut handles = Vec::new();

        for subject in subjects {
            if self.options.skip_inactive && !subject.active {
                debug!(study = %subject.study, subject = %subject.id, "skipping inactive subject");
                continue;
            }
            let subject = Arc::new(subject);
            for adapter in &self.adapters {
                let adapter = adapter.clone();
                let config = self.config.clone();
                let task_subject = subject.clone();
                let semaphore = semaphore.clone();
                let source = adapter.name().to_string();
                let handle = tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    run_adapter(&policy, adapter.as_ref(), &config, &task_subject, dry_run).await
                });
                handles.push((source, subject.clone(), handle));
            }
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (source, subject, handle) in handles {
            outcomes.push(match handle.await {
                Ok(outcome) => outcome,
                Err(e) => AdapterOutcome {
                    source,
                    study: subject.study.clone(),
                    subject: subject.id.clone(),
                    state: AttemptState::Failed,
                    attempts: 0,
                    stats: None,
                    error: Some(format!("adapter task failed: {e}")),
                },
            });
        }
        outcomes
    }

    async fn transfer_all(&self) -> Vec<DestinationOutcome> {
        let ctx = TransferContext {
            config: self.config.clone(),
            store: self.store.clone(),
            clock: self.clock.clone(),
            dry_run: self.options.dry_run,
        };

        let mut handles = Vec::new();
        for pipeline in &self.destinations {
            let pipeline = pipeline.clone();
            let ctx = ctx.clone();
            let id = pipeline.id.clone();
            handles.push((id, tokio::spawn(async move { pipeline.run(&ctx).await })));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (id, handle) in handles {
            outcomes.push(match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    let watermark = self.store.current_watermark(&id);
                    DestinationOutcome {
                        destination_id: id,
                        status: DestinationStatus::Failed,
                        window: SyncWindow::new(watermark, watermark),
                        entries: 0,
                        bytes_sent: 0,
                        watermark,
                        error: Some(format!("destination task failed: {e}")),
                    }
                }
            });
        }
        outcomes
    }
}

async fn run_adapter(
    policy: &RetryPolicy,
    adapter: &dyn SourceAdapter,
    config: &SyncConfig,
    subject: &Subject,
    dry_run: bool,
) -> AdapterOutcome {
    let label = format!("{}:{}/{}", adapter.name(), subject.study, subject.id);
    let attempt = policy
        .run(&label, || adapter.sync(config, subject, dry_run))
        .await;
    AdapterOutcome {
        source: adapter.name().to_string(),
        study: subject.study.clone(),
        subject: subject.id.clone(),
        state: attempt.state,
        attempts: attempt.attempts,
        stats: attempt.value,
        error: attempt.error,
    }
}

enum PackFailure {
    Scan(ScanError),
    Archive(ArchiveError),
    Task(String),
}

impl PackFailure {
    fn is_fatal(&self) -> bool {
        match self {
            Self::Scan(_) => true,
            Self::Archive(e) => e.is_structural(),
            Self::Task(_) => false,
        }
    }

    fn message(&self) -> String {
        match self {
            Self::Scan(e) => e.to_string(),
            Self::Archive(e) => e.to_string(),
            Self::Task(msg) => msg.clone(),
        }
    }
}

impl DestinationPipeline {
    async fn run(&self, ctx: &TransferContext) -> DestinationOutcome {
        let _guard = self.lock.lock().await;

        let start = ctx.store.current_watermark(&self.id);
        let end = (ctx.clock)();
        let window = SyncWindow::new(start, end);
        let mut outcome = DestinationOutcome {
            destination_id: self.id.clone(),
            status: DestinationStatus::Failed,
            window,
            entries: 0,
            bytes_sent: 0,
            watermark: start,
            error: None,
        };

        if ctx.dry_run {
            return self.dry_run(ctx, outcome).await;
        }

        let outbox = ctx.config.outbox_for(&self.id);
        sweep_outbox(&outbox, &self.id);

        let blob = match self.pack(ctx, window).await {
            Ok(blob) => blob,
            Err(failure) => {
                let msg = failure.message();
                if failure.is_fatal() {
                    error!(destination = %self.id, error = %msg, "pack failed");
                    outcome.status = DestinationStatus::Fatal;
                } else {
                    warn!(destination = %self.id, error = %msg, "pack failed; will retry next cycle");
                }
                outcome.error = Some(msg);
                return outcome;
            }
        };
        outcome.entries = blob.entry_count;

        let attempt = send(
            self.transport.as_ref(),
            &self.id,
            &blob,
            ctx.config.transport_timeout(),
        )
        .await;
        if !attempt.success {
            // Watermark stays put; the blob stays in the outbox until swept.
            outcome.error = attempt.error;
            return outcome;
        }
        outcome.bytes_sent = attempt.bytes_sent;

        match ctx.store.commit(&self.id, window.end) {
            Ok(watermark) => {
                outcome.status = DestinationStatus::Sent;
                outcome.watermark = watermark;
                if let Err(e) = blob.remove() {
                    warn!(blob = %blob.path.display(), error = %e, "failed to remove delivered blob");
                }
                info!(
                    destination = %self.id,
                    window = %window,
                    entries = blob.entry_count,
                    bytes = attempt.bytes_sent,
                    "destination synced"
                );
            }
            Err(e) => {
                error!(destination = %self.id, error = %e, "blob delivered but watermark commit failed");
                outcome.status = DestinationStatus::Fatal;
                outcome.error = Some(e.to_string());
            }
        }
        outcome
    }

    async fn pack(&self, ctx: &TransferContext, window: SyncWindow) -> Result<ArchiveBlob, PackFailure> {
        let root = ctx.config.phoenix_root.clone();
        let subtrees = ctx.config.scan_subtrees();
        let archiver = Archiver::new(ctx.config.archiver_config());
        let output = ctx
            .config
            .outbox_for(&self.id)
            .join(blob_name(&self.id, window.end, ctx.config.compression));

        tokio::task::spawn_blocking(move || {
            let scanner = subtrees
                .into_iter()
                .fold(ChangeSetScanner::new(&root), |s, sub| s.with_subtree(sub));
            let change_set = scanner.scan(window).map_err(PackFailure::Scan)?;
            archiver
                .pack(&root, &change_set, &output)
                .map_err(PackFailure::Archive)
        })
        .await
        .map_err(|e| PackFailure::Task(format!("pack task failed: {e}")))?
    }

    async fn dry_run(&self, ctx: &TransferContext, mut outcome: DestinationOutcome) -> DestinationOutcome {
        let root = ctx.config.phoenix_root.clone();
        let subtrees = ctx.config.scan_subtrees();
        let window = outcome.window;
        let scanned = tokio::task::spawn_blocking(move || {
            subtrees
                .into_iter()
                .fold(ChangeSetScanner::new(&root), |s, sub| s.with_subtree(sub))
                .scan(window)
        })
        .await;

        match scanned {
            Ok(Ok(change_set)) => {
                for entry in change_set.entries() {
                    debug!(destination = %self.id, path = %entry.relative_path.display(), "would send");
                }
                info!(
                    destination = %self.id,
                    window = %window,
                    entries = change_set.len(),
                    bytes = change_set.total_bytes(),
                    "dry run: change-set selected"
                );
                outcome.status = DestinationStatus::DryRun;
                outcome.entries = change_set.len();
            }
            Ok(Err(e)) => {
                outcome.status = DestinationStatus::Fatal;
                outcome.error = Some(e.to_string());
            }
            Err(e) => outcome.error = Some(format!("scan task failed: {e}")),
        }
        outcome
    }
}

/// Remove blobs left behind by failed sends, and old miss lists. The new
/// window starts at the same watermark, so the next blob covers everything
/// they held.
fn sweep_outbox(outbox: &Path, destination: &str) {
    let entries = match std::fs::read_dir(outbox) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        let stale = CompressionAlgo::is_blob_name(&name)
            || name.ends_with(".missed.txt")
            || (name.starts_with('.') && name.ends_with(".partial"));
        if !stale {
            continue;
        }
        match std::fs::remove_file(entry.path()) {
            Ok(()) => debug!(destination, blob = %name, "removed stale blob"),
            Err(e) => warn!(destination, blob = %name, error = %e, "failed to remove stale blob"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use lochness_transfer::{TransportError, TransportKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn secs(s: u64) -> Timestamp {
        Timestamp::from_secs(s)
    }

    fn fixed_clock(t: Timestamp) -> Clock {
        Arc::new(move || t)
    }

    struct CountingTransport {
        pushes: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Transport for CountingTransport {
        fn kind(&self) -> TransportKind {
            TransportKind::Mirror
        }

        async fn push(&self, blob: &ArchiveBlob) -> Result<u64, TransportError> {
            self.pushes.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(TransportError::Network {
                    msg: "connection reset".into(),
                })
            } else {
                Ok(blob.bytes)
            }
        }
    }

    fn setup(dir: &Path) -> (Arc<SyncConfig>, Arc<WatermarkStore>) {
        let phoenix = dir.join("PHOENIX");
        std::fs::create_dir_all(phoenix.join("GENERAL")).unwrap();
        let config = SyncConfig {
            phoenix_root: phoenix,
            lochness_sync_history_csv: dir.join("history.csv"),
            outbox_dir: dir.join("outbox"),
            state_dir: dir.join("state"),
            ..SyncConfig::default()
        };
        let store = WatermarkStore::open(&config.lochness_sync_history_csv).unwrap();
        (Arc::new(config), Arc::new(store))
    }

    #[tokio::test]
    async fn test_failed_send_keeps_blob_and_watermark() {
        let dir = TempDir::new().unwrap();
        let (config, store) = setup(dir.path());
        let transport = Arc::new(CountingTransport {
            pushes: AtomicUsize::new(0),
            fail: true,
        });
        let orchestrator = SyncOrchestrator::new(config.clone(), store.clone())
            .with_destination("a", transport.clone())
            .with_clock(fixed_clock(secs(100)));

        let report = orchestrator.run_cycle().await.unwrap();
        let outcome = report.destination("a").unwrap();
        assert_eq!(outcome.status, DestinationStatus::Failed);
        assert_eq!(store.current_watermark("a"), Timestamp::EPOCH);
        assert_eq!(std::fs::read_dir(config.outbox_for("a")).unwrap().count(), 1);
        assert_eq!(report.failures().len(), 1);
        assert!(!report.has_fatal());
    }

    #[tokio::test]
    async fn test_stale_blob_swept_before_next_pack() {
        let dir = TempDir::new().unwrap();
        let (config, store) = setup(dir.path());
        let failing = Arc::new(CountingTransport {
            pushes: AtomicUsize::new(0),
            fail: true,
        });
        SyncOrchestrator::new(config.clone(), store.clone())
            .with_destination("a", failing)
            .with_clock(fixed_clock(secs(100)))
            .run_cycle()
            .await
            .unwrap();

        let working = Arc::new(CountingTransport {
            pushes: AtomicUsize::new(0),
            fail: false,
        });
        let report = SyncOrchestrator::new(config.clone(), store.clone())
            .with_destination("a", working)
            .with_clock(fixed_clock(secs(200)))
            .run_cycle()
            .await
            .unwrap();

        assert_eq!(report.destination("a").unwrap().status, DestinationStatus::Sent);
        assert_eq!(store.current_watermark("a"), secs(200));
        assert_eq!(std::fs::read_dir(config.outbox_for("a")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_send_disabled_skips_transfer() {
        let dir = TempDir::new().unwrap();
        let (config, store) = setup(dir.path());
        let transport = Arc::new(CountingTransport {
            pushes: AtomicUsize::new(0),
            fail: false,
        });
        let report = SyncOrchestrator::new(config, store)
            .with_destination("a", transport.clone())
            .with_options(CycleOptions {
                send: false,
                ..CycleOptions::default()
            })
            .run_cycle()
            .await
            .unwrap();
        assert!(report.destinations.is_empty());
        assert_eq!(transport.pushes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_phoenix_root_is_fatal_for_destination() {
        let dir = TempDir::new().unwrap();
        let (config, store) = setup(dir.path());
        let mut config = (*config).clone();
        config.phoenix_root = dir.path().join("missing");
        let transport = Arc::new(CountingTransport {
            pushes: AtomicUsize::new(0),
            fail: false,
        });
        let report = SyncOrchestrator::new(Arc::new(config), store)
            .with_destination("a", transport.clone())
            .with_clock(fixed_clock(secs(100)))
            .run_cycle()
            .await
            .unwrap();
        assert!(report.has_fatal());
        assert_eq!(transport.pushes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_summary_counts() {
        let report = CycleReport {
            started_at: secs(1),
            adapters: vec![AdapterOutcome {
                source: "hdd".into(),
                study: "S".into(),
                subject: "1".into(),
                state: AttemptState::Failed,
                attempts: 2,
                stats: None,
                error: Some("offline".into()),
            }],
            destinations: vec![DestinationOutcome {
                destination_id: "a".into(),
                status: DestinationStatus::Sent,
                window: SyncWindow::new(secs(0), secs(1)),
                entries: 3,
                bytes_sent: 10,
                watermark: secs(1),
                error: None,
            }],
        };
        let summary = report.summary();
        assert_eq!(summary.adapter_failures, 1);
        assert_eq!(summary.sent, 1);
        assert_eq!(report.failures(), vec!["hdd S/1: offline".to_string()]);
    }
}
