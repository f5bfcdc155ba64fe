//! Source adapters: pull one subject's data from an upstream system into the
//! PHOENIX tree.
//!
//! Adapters are registered by name in a static table; the CLI's `--source`
//! list selects which ones run.

/// Copies from a mounted drive.
pub mod hdd;

use crate::config::SyncConfig;
use crate::error::AdapterError;
use crate::subject::Subject;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

/// Work done by one `sync` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    /// Files written (or that would be written, in dry-run mode).
    pub files_fetched: usize,
    /// Files already present and unchanged.
    pub files_skipped: usize,
    /// Bytes of the fetched files.
    pub bytes_fetched: u64,
}

/// A source of study data.
///
/// `sync` must be idempotent: calling it again for an unchanged source
/// neither re-fetches nor touches files that are already in place.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Registry name, also the source prefix in metadata values.
    fn name(&self) -> &'static str;

    /// Bring `subject`'s files from this source up to date. With `dry_run`,
    /// report what would be fetched without writing anything.
    async fn sync(
        &self,
        config: &SyncConfig,
        subject: &Subject,
        dry_run: bool,
    ) -> Result<SyncStats, AdapterError>;
}

type Builder = fn(&SyncConfig) -> Result<Arc<dyn SourceAdapter>, AdapterError>;

static REGISTRY: &[(&str, Builder)] = &[("hdd", hdd::build)];

/// Names of all registered sources.
pub fn registered_sources() -> impl Iterator<Item = &'static str> {
    REGISTRY.iter().map(|(name, _)| *name)
}

/// Instantiate the adapters named in `names`, in order.
pub fn build_adapters(
    names: &[String],
    config: &SyncConfig,
) -> Result<Vec<Arc<dyn SourceAdapter>>, AdapterError> {
    names
        .iter()
        .map(|name| {
            let key = name.to_ascii_lowercase();
            REGISTRY
                .iter()
                .find(|(registered, _)| *registered == key)
                .ok_or_else(|| AdapterError::UnknownSource(name.clone()))
                .and_then(|(_, build)| build(config))
        })
        .collect()
}
