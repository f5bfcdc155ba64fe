//! Error types for configuration, source adapters and the sync cycle.

use lochness_transfer::WatermarkError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config {}", .path.display())]
    Read {
        /// Config path.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },

    /// The config file does not parse.
    #[error("failed to parse config {}: {msg}", .path.display())]
    Parse {
        /// Config path.
        path: PathBuf,
        /// Parser message.
        msg: String,
    },

    /// Unknown config file extension.
    #[error("unsupported config file extension {ext:?} (expected toml or json)")]
    UnsupportedFormat {
        /// The extension found.
        ext: String,
    },

    /// The config parses but is not usable.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Errors returned by a source adapter's `sync`.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// No adapter is registered under this name.
    #[error("unknown source {0:?}")]
    UnknownSource(String),

    /// The upstream source cannot be reached right now.
    #[error("source {source_name} unavailable: {msg}")]
    SourceUnavailable {
        /// Adapter name.
        source_name: String,
        /// What went wrong.
        msg: String,
    },

    /// The adapter lacks the settings it needs.
    #[error("source {source_name} is not configured: {msg}")]
    NotConfigured {
        /// Adapter name.
        source_name: String,
        /// Missing setting.
        msg: String,
    },

    /// The attempt exceeded its time budget.
    #[error("adapter timed out after {secs}s")]
    Timeout {
        /// Configured budget in seconds.
        secs: u64,
    },

    /// An abandoned attempt stopped before finishing.
    #[error("source {source_name} sync interrupted")]
    Interrupted {
        /// Adapter name.
        source_name: String,
    },

    /// Local I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AdapterError {
    /// Whether another attempt within the same cycle can help.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SourceUnavailable { .. }
                | Self::Timeout { .. }
                | Self::Interrupted { .. }
                | Self::Io(_)
        )
    }
}

/// Fatal errors that abort a sync cycle.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The watermark store is unusable.
    #[error(transparent)]
    Watermark(#[from] WatermarkError),

    /// Configuration problem detected at run time.
    #[error(transparent)]
    Config(#[from] ConfigError),
}
