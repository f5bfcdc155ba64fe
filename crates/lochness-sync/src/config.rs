//! Configuration file loading and validation.

use crate::error::ConfigError;
use lochness_transfer::archive::ArchiverConfig;
use lochness_transfer::{CompressionAlgo, ReceiveConfig, TransportConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Everything a sync or receive run needs. Missing keys take defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Root of the local PHOENIX tree.
    pub phoenix_root: PathBuf,
    /// Watermark history log.
    pub lochness_sync_history_csv: PathBuf,
    /// Blobs awaiting delivery, one subdirectory per destination.
    pub outbox_dir: PathBuf,
    /// Adapter bookkeeping (ModuleFile ledgers). Kept outside the PHOENIX tree.
    pub state_dir: PathBuf,
    /// Seconds between cycles in continuous mode.
    pub poll_interval: u64,
    /// Only transfer `GENERAL/`.
    pub general_only: bool,
    /// Write a `.missed.txt` next to each blob.
    pub miss_list: bool,
    /// Blob codec.
    pub compression: CompressionAlgo,
    /// zstd level, 1 to 22.
    pub zstd_level: i32,
    /// Budget for one adapter attempt.
    pub adapter_timeout_secs: u64,
    /// Budget for one blob delivery.
    pub transport_timeout_secs: u64,
    /// Maximum (subject, source) pairs synced at once.
    pub adapter_concurrency: usize,
    /// Adapter retry policy.
    pub retry: RetryConfig,
    /// Restrict the subject feed to these studies. Empty means all.
    pub studies: Vec<String>,
    /// Where blobs are sent.
    pub destinations: Vec<DestinationConfig>,
    /// Inbox settings for `--receive`.
    pub receive: Option<ReceiveConfig>,
    /// Per-source settings.
    pub sources: SourcesConfig,
}

/// Retries of adapter calls within one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Tries per (subject, source), at least 1.
    pub max_attempts: u32,
    /// Base delay, multiplied by the attempt number.
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff_ms: 1000,
        }
    }
}

/// One remote PHOENIX.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// Key in the history log and outbox directory name.
    pub id: String,
    /// How blobs reach it.
    pub transport: TransportConfig,
}

/// Source adapter sections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    /// `[sources.hdd]`.
    pub hdd: Option<HddSourceConfig>,
}

/// Settings of the `hdd` source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HddSourceConfig {
    /// Mounted directory laid out as `<base>/<study>/<subject id>/...`.
    pub base: PathBuf,
    /// Place copied files under PROTECTED instead of GENERAL.
    #[serde(default = "default_protect")]
    pub protect: bool,
}

fn default_protect() -> bool {
    true
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            phoenix_root: PathBuf::from("PHOENIX"),
            lochness_sync_history_csv: PathBuf::from("lochness_sync_history.csv"),
            outbox_dir: PathBuf::from("lochness_outbox"),
            state_dir: PathBuf::from("lochness_state"),
            poll_interval: 3600,
            general_only: false,
            miss_list: false,
            compression: CompressionAlgo::Zstd,
            zstd_level: 3,
            adapter_timeout_secs: 3600,
            transport_timeout_secs: 7200,
            adapter_concurrency: 4,
            retry: RetryConfig::default(),
            studies: Vec::new(),
            destinations: Vec::new(),
            receive: None,
            sources: SourcesConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Load a TOML or JSON config (by extension). Relative paths are resolved
    /// against the config file's directory, then the result is validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let parse_err = |msg: String| ConfigError::Parse {
            path: path.to_path_buf(),
            msg,
        };
        let mut config: SyncConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| parse_err(e.to_string()))?,
            "json" => serde_json::from_str(&contents).map_err(|e| parse_err(e.to_string()))?,
            _ => {
                return Err(ConfigError::UnsupportedFormat {
                    ext: ext.to_string(),
                })
            }
        };

        if let Some(base) = path.parent() {
            config.resolve_relative(base);
        }
        config.validate()?;
        Ok(config)
    }

    fn resolve_relative(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        resolve(&mut self.phoenix_root);
        resolve(&mut self.lochness_sync_history_csv);
        resolve(&mut self.outbox_dir);
        resolve(&mut self.state_dir);
        if let Some(receive) = &mut self.receive {
            resolve(&mut receive.inbox);
            if let Some(q) = &mut receive.quarantine_dir {
                resolve(q);
            }
        }
        if let Some(hdd) = &mut self.sources.hdd {
            resolve(&mut hdd.base);
        }
    }

    /// Reject settings no cycle can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval == 0 {
            return Err(ConfigError::Invalid("poll_interval must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if self.adapter_concurrency == 0 {
            return Err(ConfigError::Invalid("adapter_concurrency must be at least 1".into()));
        }
        if !(1..=22).contains(&self.zstd_level) {
            return Err(ConfigError::Invalid(format!(
                "zstd_level {} outside 1..=22",
                self.zstd_level
            )));
        }
        if self.outbox_dir.starts_with(&self.phoenix_root) {
            return Err(ConfigError::Invalid(
                "outbox_dir must not be inside phoenix_root".into(),
            ));
        }

        let mut seen = HashSet::new();
        for dest in &self.destinations {
            if dest.id.is_empty() {
                return Err(ConfigError::Invalid("destination id must not be empty".into()));
            }
            if !dest
                .id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
            {
                return Err(ConfigError::Invalid(format!(
                    "destination id {:?} may only contain letters, digits, '.', '_' and '-'",
                    dest.id
                )));
            }
            if !seen.insert(dest.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate destination id {:?}",
                    dest.id
                )));
            }
        }
        Ok(())
    }

    /// Sleep between continuous cycles.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }

    /// Per-attempt adapter budget.
    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_secs(self.adapter_timeout_secs)
    }

    /// Per-delivery transport budget.
    pub fn transport_timeout(&self) -> Duration {
        Duration::from_secs(self.transport_timeout_secs)
    }

    /// Archiver settings for outgoing blobs.
    pub fn archiver_config(&self) -> ArchiverConfig {
        ArchiverConfig {
            compression: self.compression,
            zstd_level: self.zstd_level,
            miss_list: self.miss_list,
        }
    }

    /// Subtrees of the PHOENIX root that are transferred.
    pub fn scan_subtrees(&self) -> Vec<PathBuf> {
        if self.general_only {
            vec![PathBuf::from("GENERAL")]
        } else {
            Vec::new()
        }
    }

    /// Outbox directory of one destination.
    pub fn outbox_for(&self, destination_id: &str) -> PathBuf {
        self.outbox_dir.join(destination_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lochness_transfer::TransportKind;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn with_destinations(ids: &[&str]) -> SyncConfig {
        let transport: TransportConfig =
            serde_json::from_str(r#"{"kind":"mirror","target":"/tmp/mirror"}"#).unwrap();
        SyncConfig {
            destinations: ids
                .iter()
                .map(|id| DestinationConfig {
                    id: id.to_string(),
                    transport: transport.clone(),
                })
                .collect(),
            ..SyncConfig::default()
        }
    }

    #[test]
    fn test_default_values() {
        let config = SyncConfig::default();
        assert_eq!(config.phoenix_root, PathBuf::from("PHOENIX"));
        assert_eq!(config.poll_interval(), Duration::from_secs(3600));
        assert_eq!(config.compression, CompressionAlgo::Zstd);
        assert_eq!(config.retry.max_attempts, 1);
        assert!(config.destinations.is_empty());
        assert!(config.scan_subtrees().is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
phoenix_root = "/data/PHOENIX"
lochness_sync_history_csv = "history.csv"
poll_interval = 600
general_only = true
compression = "lz4"

[retry]
max_attempts = 3

[[destinations]]
id = "pronet"

[destinations.transport]
kind = "secure-copy"
host = "phoenix.example.org"
remote_dir = "/data/inbox"

[[destinations]]
id = "archive"

[destinations.transport]
kind = "object-store"
bucket = "lochness"
prefix = "PHOENIX"

[sources.hdd]
base = "hdd"
"#
        )
        .unwrap();

        let config = SyncConfig::from_file(file.path()).unwrap();
        let dir = file.path().parent().unwrap();
        assert_eq!(config.phoenix_root, PathBuf::from("/data/PHOENIX"));
        assert_eq!(config.lochness_sync_history_csv, dir.join("history.csv"));
        assert_eq!(config.poll_interval, 600);
        assert_eq!(config.compression, CompressionAlgo::Lz4);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.backoff_ms, 1000);
        assert_eq!(config.scan_subtrees(), vec![PathBuf::from("GENERAL")]);
        assert_eq!(config.destinations.len(), 2);
        assert_eq!(config.destinations[0].transport.kind(), TransportKind::SecureCopy);
        assert_eq!(config.destinations[1].transport.kind(), TransportKind::ObjectStore);
        let hdd = config.sources.hdd.unwrap();
        assert_eq!(hdd.base, dir.join("hdd"));
        assert!(hdd.protect);
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{
                "phoenix_root": "/p",
                "outbox_dir": "/out",
                "destinations": [
                    {{"id": "m1", "transport": {{"kind": "mirror", "target": "sync@h:/in"}}}}
                ],
                "receive": {{"inbox": "/inbox"}}
            }}"#
        )
        .unwrap();

        let config = SyncConfig::from_file(file.path()).unwrap();
        assert_eq!(config.destinations[0].id, "m1");
        assert_eq!(config.receive.unwrap().inbox, PathBuf::from("/inbox"));
    }

    #[test]
    fn test_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        let err = SyncConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedFormat { .. }));
    }

    #[test]
    fn test_parse_error_names_file() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, "poll_interval = \"often\"").unwrap();
        let err = SyncConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_missing_file() {
        let err = SyncConfig::from_file(Path::new("/nonexistent/lochness.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    mod validation {
        use super::*;

        #[test]
        fn test_rejects_duplicate_ids() {
            let err = with_destinations(&["a", "a"]).validate().unwrap_err();
            assert!(err.to_string().contains("duplicate"));
        }

        #[test]
        fn test_rejects_empty_and_odd_ids() {
            assert!(with_destinations(&[""]).validate().is_err());
            assert!(with_destinations(&["a/b"]).validate().is_err());
            assert!(with_destinations(&["site-1.b_c"]).validate().is_ok());
        }

        #[test]
        fn test_rejects_zero_poll_interval() {
            let config = SyncConfig {
                poll_interval: 0,
                ..SyncConfig::default()
            };
            assert!(config.validate().is_err());
        }

        #[test]
        fn test_rejects_outbox_inside_phoenix() {
            let config = SyncConfig {
                phoenix_root: PathBuf::from("/data/PHOENIX"),
                outbox_dir: PathBuf::from("/data/PHOENIX/outbox"),
                ..SyncConfig::default()
            };
            assert!(config.validate().is_err());
        }

        #[test]
        fn test_rejects_zero_attempts() {
            let mut config = SyncConfig::default();
            config.retry.max_attempts = 0;
            assert!(config.validate().is_err());
        }
    }
}
