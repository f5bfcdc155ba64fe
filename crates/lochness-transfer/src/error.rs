//! Error types for the transfer subsystem.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the watermark store.
#[derive(Debug, Error)]
pub enum WatermarkError {
    /// The persisted history log cannot be read or does not parse.
    ///
    /// This is structural: the store is the only record of what has already
    /// been sent, so callers must stop instead of guessing a watermark.
    #[error("invalid watermark store {}: line {line}: {msg}", .path.display())]
    InvalidWatermarkStore {
        /// Path of the history log.
        path: PathBuf,
        /// 1-based line of the offending row (0 when not tied to a row).
        line: u64,
        /// Description of the problem.
        msg: String,
    },

    /// Appending a record failed.
    #[error("failed to append to watermark store {}", .path.display())]
    Append {
        /// Path of the history log.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },
}

impl WatermarkError {
    /// Structural errors must halt processing and are never retried.
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::InvalidWatermarkStore { .. })
    }
}

/// Errors raised while walking the source tree.
#[derive(Debug, Error)]
pub enum ScanError {
    /// The scan root does not exist or is not a readable directory.
    #[error("scan root {} is unavailable", .path.display())]
    RootUnavailable {
        /// The configured root.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised while packing or unpacking an archive blob.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// The blob is corrupt or contains an entry that must not be extracted.
    #[error("malformed archive: entry {entry:?}: {reason}")]
    MalformedArchive {
        /// Entry path as recorded in the archive (or `<stream>`).
        entry: String,
        /// Why the entry was rejected.
        reason: String,
    },

    /// A source file changed length while it was being packed.
    #[error("{} changed while being archived", .path.display())]
    SourceChanged {
        /// Path of the file relative to the scan root.
        path: PathBuf,
    },

    /// I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

impl ArchiveError {
    pub(crate) fn malformed(entry: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedArchive {
            entry: entry.into(),
            reason: reason.into(),
        }
    }

    /// Structural errors indicate a corrupted or hostile artifact.
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::MalformedArchive { .. })
    }
}

/// Errors raised by a transport attempt.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The remote side rejected our credentials.
    #[error("authentication failed: {msg}")]
    Auth {
        /// Error message describing the rejection.
        msg: String,
    },

    /// Connection or transfer failure.
    #[error("network error: {msg}")]
    Network {
        /// Error message describing the network issue.
        msg: String,
    },

    /// The attempt exceeded its time budget.
    #[error("transfer timed out after {secs}s")]
    Timeout {
        /// Configured budget in seconds.
        secs: u64,
    },

    /// An external transfer program exited unsuccessfully.
    #[error("{program} exited with {}: {stderr}", .code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()))]
    CommandFailed {
        /// Program name.
        program: String,
        /// Exit code, `None` when killed by a signal.
        code: Option<i32>,
        /// Trimmed standard error of the program.
        stderr: String,
    },

    /// Object storage request failed.
    #[error("object store error: {msg}")]
    ObjectStore {
        /// Error message returned by the store.
        msg: String,
    },

    /// Local I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Classify free-form remote error text into auth vs. network failures.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        if lower.contains("permission denied")
            || lower.contains("authentication")
            || lower.contains("host key verification failed")
            || lower.contains("accessdenied")
            || lower.contains("credential")
            || lower.contains("signature")
            || lower.contains("forbidden")
            || lower.contains("403")
        {
            Self::Auth {
                msg: message.to_string(),
            }
        } else {
            Self::Network {
                msg: message.to_string(),
            }
        }
    }

    /// Whether a later attempt can reasonably succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Auth { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_auth_messages() {
        assert!(matches!(
            TransportError::classify("user@host: Permission denied (publickey)."),
            TransportError::Auth { .. }
        ));
        assert!(matches!(
            TransportError::classify("AccessDenied: bucket policy"),
            TransportError::Auth { .. }
        ));
    }

    #[test]
    fn test_classify_network_messages() {
        let err = TransportError::classify("ssh: connect to host x port 22: Connection refused");
        assert!(matches!(err, TransportError::Network { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_auth_not_retryable() {
        let err = TransportError::Auth { msg: "nope".into() };
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_command_failed_display() {
        let err = TransportError::CommandFailed {
            program: "scp".into(),
            code: Some(1),
            stderr: "lost connection".into(),
        };
        assert_eq!(err.to_string(), "scp exited with 1: lost connection");

        let killed = TransportError::CommandFailed {
            program: "rsync".into(),
            code: None,
            stderr: String::new(),
        };
        assert!(killed.to_string().contains("signal"));
    }

    #[test]
    fn test_structural_classification() {
        let err = ArchiveError::malformed("../x", "escapes root");
        assert!(err.is_structural());
        let io = ArchiveError::Io(std::io::Error::other("disk full"));
        assert!(!io.is_structural());

        let wm = WatermarkError::InvalidWatermarkStore {
            path: "h.csv".into(),
            line: 3,
            msg: "bad".into(),
        };
        assert!(wm.is_structural());
        assert!(wm.to_string().contains("line 3"));
    }
}
