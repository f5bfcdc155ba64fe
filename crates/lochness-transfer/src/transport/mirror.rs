//! Delta-mirroring with `rsync`.

use super::{place_local, run_program, Transport, TransportKind};
use crate::archive::ArchiveBlob;
use crate::error::TransportError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Mirror destination settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// rsync target: `user@host:/dir` or a local directory.
    pub target: String,
    /// `rsync` executable.
    #[serde(default = "default_rsync")]
    pub rsync_program: String,
    /// SSH port for remote targets.
    #[serde(default)]
    pub ssh_port: Option<u16>,
    /// Extra arguments passed to rsync before the paths.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_rsync() -> String {
    "rsync".to_string()
}

impl MirrorConfig {
    /// Local directory target.
    pub fn local(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            rsync_program: default_rsync(),
            ssh_port: None,
            extra_args: Vec::new(),
        }
    }

    /// rsync's rule: a colon before any slash means a remote host.
    fn is_remote(&self) -> bool {
        match (self.target.find(':'), self.target.find('/')) {
            (Some(colon), Some(slash)) => colon < slash,
            (Some(_), None) => true,
            _ => false,
        }
    }
}

/// Pushes blobs with rsync.
pub struct MirrorPush {
    config: MirrorConfig,
}

impl MirrorPush {
    /// Create a new mirror transport.
    pub fn new(config: MirrorConfig) -> Self {
        Self { config }
    }

    fn args(&self, blob: &ArchiveBlob) -> Vec<String> {
        // rsync writes to a hidden temp file and renames it into place.
        let mut args = vec!["-a".to_string(), "--partial-dir=.rsync-partial".to_string()];
        if let Some(port) = self.config.ssh_port {
            args.push("-e".to_string());
            args.push(format!("ssh -p {port} -o BatchMode=yes"));
        }
        args.extend(self.config.extra_args.iter().cloned());
        args.push(blob.path.display().to_string());
        args.push(format!("{}/", self.config.target.trim_end_matches('/')));
        args
    }
}

#[async_trait]
impl Transport for MirrorPush {
    fn kind(&self) -> TransportKind {
        TransportKind::Mirror
    }

    async fn push(&self, blob: &ArchiveBlob) -> Result<u64, TransportError> {
        if !self.config.is_remote() {
            return place_local(&blob.path, Path::new(&self.config.target), &blob.name).await;
        }
        run_program(&self.config.rsync_program, &self.args(blob)).await?;
        info!(target = %self.config.target, blob = %blob.name, bytes = blob.bytes, "blob mirrored");
        Ok(blob.bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::test_support::empty_blob;
    use tempfile::TempDir;

    #[test]
    fn test_remote_detection() {
        assert!(MirrorConfig::local("sync@host:/data/inbox").is_remote());
        assert!(MirrorConfig::local("host:inbox").is_remote());
        assert!(!MirrorConfig::local("/data/inbox").is_remote());
        assert!(!MirrorConfig::local("/data/odd:name").is_remote());
        assert!(!MirrorConfig::local("inbox").is_remote());
    }

    #[test]
    fn test_args_with_port() {
        let dir = TempDir::new().unwrap();
        let blob = empty_blob(dir.path(), "x.tar");
        let push = MirrorPush::new(MirrorConfig {
            ssh_port: Some(2222),
            extra_args: vec!["--bwlimit=5000".into()],
            ..MirrorConfig::local("sync@host:/inbox/")
        });
        let args = push.args(&blob);
        assert_eq!(args[0], "-a");
        assert!(args.contains(&"ssh -p 2222 -o BatchMode=yes".to_string()));
        assert!(args.contains(&"--bwlimit=5000".to_string()));
        assert_eq!(args.last().unwrap(), "sync@host:/inbox/");
    }

    #[tokio::test]
    async fn test_local_target_push() {
        let src = TempDir::new().unwrap();
        let blob = empty_blob(src.path(), "x.tar");
        let dst = TempDir::new().unwrap();
        let target = dst.path().join("mirror");

        let push = MirrorPush::new(MirrorConfig::local(target.display().to_string()));
        assert_eq!(push.kind(), TransportKind::Mirror);
        push.push(&blob).await.unwrap();
        assert!(target.join("x.tar").exists());
    }
}
