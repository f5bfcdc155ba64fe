#![warn(missing_docs)]

//! Lochness sync: pulls study data from source adapters into PHOENIX and
//! drives the per-destination transfer cycle.
//!
//! A cycle reads subjects from the study metadata tables, runs every selected
//! [`adapter::SourceAdapter`] for each of them, then lets the
//! [`orchestrator::SyncOrchestrator`] ship whatever changed since each
//! destination's watermark.

/// Source adapters and their registry.
pub mod adapter;
/// Command-line interface.
pub mod cli;
/// Configuration loading and validation.
pub mod config;
/// Error types.
pub mod error;
/// Sync cycle orchestration.
pub mod orchestrator;
/// Retry policy for adapter calls.
pub mod retry;
/// Cycle scheduling.
pub mod schedule;
/// Subject feed from study metadata.
pub mod subject;

pub use adapter::{build_adapters, SourceAdapter, SyncStats};
pub use config::{DestinationConfig, SyncConfig};
pub use error::{AdapterError, ConfigError, SyncError};
pub use orchestrator::{CycleOptions, CycleReport, DestinationStatus, SyncOrchestrator};
pub use retry::{AttemptState, RetryPolicy};
pub use schedule::Schedule;
pub use subject::{read_phoenix_metadata, Subject};
