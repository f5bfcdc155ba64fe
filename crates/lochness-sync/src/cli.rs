//! Command-line interface of the `lochness-sync` binary.

use crate::adapter::build_adapters;
use crate::config::SyncConfig;
use crate::orchestrator::{CycleOptions, SyncOrchestrator};
use crate::schedule::{parse_until, Schedule};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use lochness_transfer::{
    CompressionAlgo, SecureCopyReceive, Timestamp, TransportKind, WatermarkStore,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Command line of the `lochness-sync` binary.
#[derive(Parser, Debug)]
#[command(name = "lochness-sync")]
#[command(about = "Pull study data into PHOENIX and mirror new files to remote sites", long_about = None)]
pub struct Cli {
    /// Configuration file (.toml or .json).
    #[arg(short, long, env = "LOCHNESS_CONFIG", default_value = "config.toml")]
    pub config: PathBuf,

    /// Sources to pull from before sending.
    #[arg(short, long, value_delimiter = ',', num_args = 1..)]
    pub source: Vec<String>,

    /// Only these studies (overrides the config).
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    pub studies: Vec<String>,

    /// Report what would be fetched and sent without changing anything.
    #[arg(long)]
    pub dry: bool,

    /// Skip subjects whose Active column is 0.
    #[arg(long)]
    pub skip_inactive: bool,

    /// Repeat every poll_interval seconds.
    #[arg(long)]
    pub continuous: bool,

    /// Wait until this local time (YYYY-MM-DDTHH:MM:SS) before the first cycle.
    #[arg(long)]
    pub until: Option<String>,

    /// Send new files to the configured destinations after pulling.
    #[arg(long, visible_alias = "lochness-sync-send", conflicts_with = "receive")]
    pub send: bool,

    /// Apply blobs waiting in the inbox to the local PHOENIX tree.
    #[arg(long, visible_alias = "lochness-sync-receive")]
    pub receive: bool,

    /// Only use destinations with this transport.
    #[arg(long, value_enum)]
    pub transport: Option<TransportChoice>,

    /// Verbose logging.
    #[arg(long)]
    pub debug: bool,

    /// Optional subcommand; none runs the sync.
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Subcommands.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Show the watermark and pending blobs of every destination.
    Status,
}

/// Transport names accepted by `--transport`.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportChoice {
    /// scp into the receiver's inbox.
    #[value(alias = "sftp", alias = "scp")]
    SecureCopy,
    /// rsync.
    #[value(alias = "rsync")]
    Mirror,
    /// S3-compatible bucket.
    #[value(alias = "s3")]
    ObjectStore,
}

impl From<TransportChoice> for TransportKind {
    fn from(choice: TransportChoice) -> Self {
        match choice {
            TransportChoice::SecureCopy => TransportKind::SecureCopy,
            TransportChoice::Mirror => TransportKind::Mirror,
            TransportChoice::ObjectStore => TransportKind::ObjectStore,
        }
    }
}

impl Cli {
    /// Default log directive when `RUST_LOG` is unset.
    pub fn log_level(&self) -> &'static str {
        if self.debug {
            "debug"
        } else {
            "info"
        }
    }

    /// Per-cycle switches from the flags.
    pub fn cycle_options(&self) -> CycleOptions {
        CycleOptions {
            dry_run: self.dry,
            send: self.send,
            skip_inactive: self.skip_inactive,
        }
    }

    /// Apply command-line narrowing to a loaded config.
    pub fn apply_overrides(&self, config: &mut SyncConfig) {
        if !self.studies.is_empty() {
            config.studies = self.studies.clone();
        }
        if let Some(choice) = self.transport {
            let kind = TransportKind::from(choice);
            config.destinations.retain(|d| d.transport.kind() == kind);
            if config.destinations.is_empty() {
                warn!(transport = %kind, "no destination uses the selected transport");
            }
        }
    }

    /// Load the config and run the selected mode until done or interrupted.
    pub async fn run(self) -> Result<()> {
        let mut config = SyncConfig::from_file(&self.config)
            .with_context(|| format!("loading {}", self.config.display()))?;
        self.apply_overrides(&mut config);
        let config = Arc::new(config);

        if let Some(Command::Status) = self.command {
            return status(&config);
        }

        let schedule = Schedule {
            not_before: self.until.as_deref().map(parse_until).transpose()?,
            poll_interval: config.poll_interval(),
            continuous: self.continuous,
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received; finishing current cycle");
                let _ = shutdown_tx.send(true);
            }
        });

        if self.receive {
            return receive(&config, schedule, shutdown_rx).await;
        }

        let store = Arc::new(WatermarkStore::open(&config.lochness_sync_history_csv)?);
        let adapters = build_adapters(&self.source, &config)?;
        let orchestrator = SyncOrchestrator::from_config(config.clone(), store)
            .await
            .with_adapters(adapters)
            .with_options(self.cycle_options());

        let last = schedule
            .run(shutdown_rx, || orchestrator.run_cycle())
            .await?;
        if let Some(report) = last {
            if report.has_fatal() {
                anyhow::bail!("sync cycle failed: {}", report.failures().join("; "));
            }
        }
        Ok(())
    }
}

async fn receive(
    config: &SyncConfig,
    schedule: Schedule,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let receive = config
        .receive
        .clone()
        .context("--receive needs a [receive] section with an inbox")?;
    let receiver = SecureCopyReceive::new(receive);
    let root = config.phoenix_root.clone();

    let last = schedule
        .run(shutdown, || receiver.receive_all(&root))
        .await?;
    if let Some(report) = last {
        if !report.quarantined.is_empty() {
            anyhow::bail!("{} blob(s) quarantined as malformed", report.quarantined.len());
        }
    }
    Ok(())
}

fn status(config: &SyncConfig) -> Result<()> {
    let store = WatermarkStore::open(&config.lochness_sync_history_csv)?;

    println!(
        "{:<20} {:<14} {:<30} {:>8}",
        "DESTINATION", "TRANSPORT", "WATERMARK", "PENDING"
    );
    println!("{}", "-".repeat(75));
    for dest in &config.destinations {
        let watermark = store.current_watermark(&dest.id);
        let shown = if watermark == Timestamp::EPOCH {
            "never".to_string()
        } else {
            watermark.to_rfc3339()
        };
        println!(
            "{:<20} {:<14} {:<30} {:>8}",
            dest.id,
            dest.transport.kind().to_string(),
            shown,
            pending_blobs(&config.outbox_for(&dest.id))
        );
    }

    let configured: Vec<&str> = config.destinations.iter().map(|d| d.id.as_str()).collect();
    for (id, watermark) in store.all_watermarks() {
        if !configured.contains(&id.as_str()) {
            println!("{:<20} {:<14} {:<30} {:>8}", id, "(removed)", watermark.to_rfc3339(), "-");
        }
    }
    Ok(())
}

fn pending_blobs(outbox: &std::path::Path) -> usize {
    std::fs::read_dir(outbox)
        .map(|entries| {
            entries
                .flatten()
                .filter(|e| CompressionAlgo::is_blob_name(&e.file_name().to_string_lossy()))
                .count()
        })
        .unwrap_or(0)
}
