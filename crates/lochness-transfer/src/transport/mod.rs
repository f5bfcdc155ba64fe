//! Blob delivery to remote PHOENIX hosts.
//!
//! Every variant implements [`Transport`]: it takes a finished
//! [`ArchiveBlob`] and makes it appear, whole, at the remote side. Uploads go
//! to a temporary name first and are renamed once complete, so a receiver
//! polling the inbox never sees a partial blob.

mod mirror;
mod object_store;
mod scp;

pub use mirror::{MirrorConfig, MirrorPush};
pub use object_store::{ObjectListing, ObjectStoreConfig, ObjectStoreUpload};
pub use scp::{SecureCopyConfig, SecureCopyPush};

use crate::archive::ArchiveBlob;
use crate::error::TransportError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Which delivery mechanism a destination uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// Authenticated file copy into the receiver's inbox (scp).
    SecureCopy,
    /// Delta-mirroring of the blob (rsync).
    Mirror,
    /// Upload to an S3-compatible bucket.
    ObjectStore,
}

impl TransportKind {
    /// Stable name used in config files and on the command line.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SecureCopy => "secure-copy",
            Self::Mirror => "mirror",
            Self::ObjectStore => "object-store",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "secure-copy" | "sftp" | "scp" => Ok(Self::SecureCopy),
            "mirror" | "rsync" => Ok(Self::Mirror),
            "object-store" | "s3" => Ok(Self::ObjectStore),
            other => Err(format!("unknown transport {other:?}")),
        }
    }
}

/// Delivers blobs to one destination.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// The mechanism this transport uses.
    fn kind(&self) -> TransportKind;

    /// Push `blob` to the destination. Returns the number of bytes sent.
    ///
    /// Must not leave a complete-looking artifact behind on failure.
    async fn push(&self, blob: &ArchiveBlob) -> Result<u64, TransportError>;
}

/// Per-destination transport settings, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TransportConfig {
    /// scp into the receiver's inbox.
    SecureCopy(SecureCopyConfig),
    /// rsync of the blob.
    Mirror(MirrorConfig),
    /// S3-compatible upload.
    ObjectStore(ObjectStoreConfig),
}

impl TransportConfig {
    /// The mechanism configured.
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::SecureCopy(_) => TransportKind::SecureCopy,
            Self::Mirror(_) => TransportKind::Mirror,
            Self::ObjectStore(_) => TransportKind::ObjectStore,
        }
    }

    /// Instantiate the transport.
    pub async fn build(&self) -> Arc<dyn Transport> {
        match self {
            Self::SecureCopy(c) => Arc::new(SecureCopyPush::new(c.clone())),
            Self::Mirror(c) => Arc::new(MirrorPush::new(c.clone())),
            Self::ObjectStore(c) => Arc::new(ObjectStoreUpload::connect(c.clone()).await),
        }
    }
}

/// Result of one transport attempt to one destination.
#[derive(Debug, Clone)]
pub struct TransportAttemptResult {
    /// Destination identifier.
    pub destination_id: String,
    /// Whether the blob arrived.
    pub success: bool,
    /// Bytes delivered.
    pub bytes_sent: u64,
    /// Whether a later attempt could succeed (false for auth failures).
    pub retryable: bool,
    /// Error message if failed.
    pub error: Option<String>,
    /// Microseconds spent.
    pub latency_us: u64,
}

/// Push `blob` through `transport`, bounded by `timeout`.
///
/// Failures (including the timeout) are reported in the result, never raised.
pub async fn send(
    transport: &dyn Transport,
    destination_id: &str,
    blob: &ArchiveBlob,
    timeout: Duration,
) -> TransportAttemptResult {
    let start = Instant::now();
    let outcome = match tokio::time::timeout(timeout, transport.push(blob)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout {
            secs: timeout.as_secs(),
        }),
    };
    let latency_us = start.elapsed().as_micros() as u64;

    match outcome {
        Ok(bytes_sent) => {
            debug!(
                destination = destination_id,
                transport = %transport.kind(),
                bytes = bytes_sent,
                latency_us,
                "blob delivered"
            );
            TransportAttemptResult {
                destination_id: destination_id.to_string(),
                success: true,
                bytes_sent,
                retryable: false,
                error: None,
                latency_us,
            }
        }
        Err(e) => {
            warn!(
                destination = destination_id,
                transport = %transport.kind(),
                error = %e,
                "blob delivery failed"
            );
            TransportAttemptResult {
                destination_id: destination_id.to_string(),
                success: false,
                bytes_sent: 0,
                retryable: e.is_retryable(),
                error: Some(e.to_string()),
                latency_us,
            }
        }
    }
}

/// Copy `blob` into a local directory under a temporary name, then rename.
pub(crate) async fn place_local(blob: &Path, dir: &Path, name: &str) -> Result<u64, TransportError> {
    tokio::fs::create_dir_all(dir).await?;
    let partial = dir.join(format!(".{name}.partial"));
    let copied = async {
        let bytes = tokio::fs::copy(blob, &partial).await?;
        tokio::fs::File::open(&partial).await?.sync_all().await?;
        tokio::fs::rename(&partial, dir.join(name)).await?;
        Ok::<u64, std::io::Error>(bytes)
    }
    .await;
    if copied.is_err() {
        let _ = tokio::fs::remove_file(&partial).await;
    }
    Ok(copied?)
}

/// Run an external transfer program to completion.
///
/// The child is killed if the future is dropped (for example on timeout).
pub(crate) async fn run_program(program: &str, args: &[String]) -> Result<(), TransportError> {
    debug!(program, ?args, "spawning transfer program");
    let output = tokio::process::Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| TransportError::Network {
            msg: format!("failed to run {program}: {e}"),
        })?;

    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    match TransportError::classify(&stderr) {
        auth @ TransportError::Auth { .. } => Err(auth),
        _ => Err(TransportError::CommandFailed {
            program: program.to_string(),
            code: output.status.code(),
            stderr,
        }),
    }
}

/// Single-quote `s` for a POSIX shell on the remote end.
pub(crate) fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
