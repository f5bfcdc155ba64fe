//! Authenticated copy into a remote inbox with `scp`, finished by an
//! `ssh mv` so the blob appears atomically.

use super::{place_local, run_program, shell_quote, Transport, TransportKind};
use crate::archive::ArchiveBlob;
use crate::error::TransportError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

/// Secure-copy destination settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecureCopyConfig {
    /// Remote host. When absent the inbox is a local (or mounted) directory.
    #[serde(default)]
    pub host: Option<String>,
    /// Remote user.
    #[serde(default)]
    pub user: Option<String>,
    /// SSH port.
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Inbox directory on the receiving host.
    pub remote_dir: PathBuf,
    /// Private key to authenticate with.
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    /// `scp` executable.
    #[serde(default = "default_scp")]
    pub scp_program: String,
    /// `ssh` executable.
    #[serde(default = "default_ssh")]
    pub ssh_program: String,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_scp() -> String {
    "scp".to_string()
}

fn default_ssh() -> String {
    "ssh".to_string()
}

impl SecureCopyConfig {
    /// A local inbox, mostly for testing and mounted shares.
    pub fn local(remote_dir: impl Into<PathBuf>) -> Self {
        Self {
            host: None,
            user: None,
            port: default_ssh_port(),
            remote_dir: remote_dir.into(),
            identity_file: None,
            scp_program: default_scp(),
            ssh_program: default_ssh(),
        }
    }

    fn target(&self) -> Option<String> {
        let host = self.host.as_deref()?;
        Some(match &self.user {
            Some(user) => format!("{user}@{host}"),
            None => host.to_string(),
        })
    }

    fn ssh_options(&self) -> Vec<String> {
        let mut opts = vec!["-o".to_string(), "BatchMode=yes".to_string()];
        if let Some(key) = &self.identity_file {
            opts.push("-i".to_string());
            opts.push(key.display().to_string());
        }
        opts
    }
}

/// Pushes blobs with scp.
pub struct SecureCopyPush {
    config: SecureCopyConfig,
}

impl SecureCopyPush {
    /// Create a new secure-copy transport.
    pub fn new(config: SecureCopyConfig) -> Self {
        Self { config }
    }

    fn scp_args(&self, blob: &ArchiveBlob, target: &str, remote_partial: &str) -> Vec<String> {
        let mut args = vec![
            "-B".to_string(),
            "-q".to_string(),
            "-P".to_string(),
            self.config.port.to_string(),
        ];
        args.extend(self.config.ssh_options());
        args.push(blob.path.display().to_string());
        args.push(format!("{target}:{remote_partial}"));
        args
    }

    fn rename_args(&self, target: &str, remote_partial: &str, remote_final: &str) -> Vec<String> {
        let mut args = vec!["-p".to_string(), self.config.port.to_string()];
        args.extend(self.config.ssh_options());
        args.push(target.to_string());
        args.push(format!(
            "mv -f -- {} {}",
            shell_quote(remote_partial),
            shell_quote(remote_final)
        ));
        args
    }
}

#[async_trait]
impl Transport for SecureCopyPush {
    fn kind(&self) -> TransportKind {
        TransportKind::SecureCopy
    }

    async fn push(&self, blob: &ArchiveBlob) -> Result<u64, TransportError> {
        let Some(target) = self.config.target() else {
            return place_local(&blob.path, &self.config.remote_dir, &blob.name).await;
        };

        let dir = self.config.remote_dir.display().to_string();
        let remote_partial = format!("{}/.{}.partial", dir.trim_end_matches('/'), blob.name);
        let remote_final = format!("{}/{}", dir.trim_end_matches('/'), blob.name);

        run_program(
            &self.config.scp_program,
            &self.scp_args(blob, &target, &remote_partial),
        )
        .await?;
        run_program(
            &self.config.ssh_program,
            &self.rename_args(&target, &remote_partial, &remote_final),
        )
        .await?;

        info!(host = %target, path = %remote_final, bytes = blob.bytes, "blob copied");
        Ok(blob.bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::test_support::empty_blob;
    use tempfile::TempDir;

    fn remote() -> SecureCopyConfig {
        SecureCopyConfig {
            host: Some("phoenix.example.org".into()),
            user: Some("lochness".into()),
            port: 2222,
            remote_dir: PathBuf::from("/data/inbox/"),
            identity_file: Some(PathBuf::from("/home/lochness/.ssh/id_ed25519")),
            ..SecureCopyConfig::local("/unused")
        }
    }

    #[test]
    fn test_scp_command_targets_partial_name() {
        let dir = TempDir::new().unwrap();
        let blob = empty_blob(dir.path(), "b-1-abc.tar");
        let push = SecureCopyPush::new(remote());
        let args = push.scp_args(&blob, "lochness@phoenix.example.org", "/data/inbox/.b-1-abc.tar.partial");

        assert_eq!(&args[..4], &["-B", "-q", "-P", "2222"]);
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"/home/lochness/.ssh/id_ed25519".to_string()));
        assert_eq!(
            args.last().unwrap(),
            "lochness@phoenix.example.org:/data/inbox/.b-1-abc.tar.partial"
        );
    }

    #[test]
    fn test_rename_command_is_quoted() {
        let push = SecureCopyPush::new(remote());
        let args = push.rename_args("h", "/in box/.x.partial", "/in box/x");
        assert_eq!(args.last().unwrap(), "mv -f -- '/in box/.x.partial' '/in box/x'");
        assert_eq!(&args[..2], &["-p", "2222"]);
    }

    #[test]
    fn test_config_defaults() {
        let config: SecureCopyConfig =
            serde_json::from_str(r#"{"host":"h","remote_dir":"/inbox"}"#).unwrap();
        assert_eq!(config.port, 22);
        assert_eq!(config.scp_program, "scp");
        assert_eq!(config.target().unwrap(), "h");
    }

    #[tokio::test]
    async fn test_local_inbox_push() {
        let src = TempDir::new().unwrap();
        let blob = empty_blob(src.path(), "b-1-abc.tar");
        let inbox = TempDir::new().unwrap();

        let push = SecureCopyPush::new(SecureCopyConfig::local(inbox.path()));
        let sent = push.push(&blob).await.unwrap();
        assert_eq!(sent, blob.bytes);
        assert!(inbox.path().join("b-1-abc.tar").exists());
    }

    #[tokio::test]
    async fn test_missing_scp_binary_is_network_error() {
        let src = TempDir::new().unwrap();
        let blob = empty_blob(src.path(), "b-1-abc.tar");
        let push = SecureCopyPush::new(SecureCopyConfig {
            scp_program: "lochness-no-such-scp".into(),
            ..remote()
        });
        let err = push.push(&blob).await.unwrap_err();
        assert!(matches!(err, TransportError::Network { .. }));
    }
}
