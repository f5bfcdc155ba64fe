//! Upload to an S3-compatible object store.
//!
//! With `emulate_root` set, objects are written under
//! `<emulate_root>/<bucket>/<prefix>/` on the local filesystem instead, which
//! keeps the variant testable without credentials.

use super::{place_local, Transport, TransportKind};
use crate::archive::ArchiveBlob;
use crate::error::TransportError;
use async_trait::async_trait;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;
use walkdir::WalkDir;

/// Object-store destination settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    /// Bucket name.
    pub bucket: String,
    /// Key prefix (the PHOENIX root on the bucket).
    #[serde(default)]
    pub prefix: String,
    /// Region override.
    #[serde(default)]
    pub region: Option<String>,
    /// Endpoint override for S3-compatible stores.
    #[serde(default)]
    pub endpoint_url: Option<String>,
    /// Write to this local directory instead of the network.
    #[serde(default)]
    pub emulate_root: Option<PathBuf>,
}

impl ObjectStoreConfig {
    /// Object key for a blob name.
    pub fn key_for(&self, leaf: &str) -> String {
        let prefix = self.prefix.trim_matches('/');
        if prefix.is_empty() {
            leaf.to_string()
        } else {
            format!("{prefix}/{leaf}")
        }
    }

    fn emulated_dir(&self) -> Option<PathBuf> {
        self.emulate_root.as_ref().map(|root| {
            let mut dir = root.join(&self.bucket);
            let prefix = self.prefix.trim_matches('/');
            if !prefix.is_empty() {
                dir = dir.join(prefix);
            }
            dir
        })
    }
}

/// One object under the configured prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectListing {
    /// Full object key.
    pub key: String,
    /// Size in bytes.
    pub size: u64,
}

/// Uploads blobs to object storage.
pub struct ObjectStoreUpload {
    config: ObjectStoreConfig,
    client: Option<aws_sdk_s3::Client>,
}

impl ObjectStoreUpload {
    /// Load AWS configuration from the environment and build a client.
    /// No client is created in emulated mode.
    pub async fn connect(config: ObjectStoreConfig) -> Self {
        if config.emulate_root.is_some() {
            return Self {
                config,
                client: None,
            };
        }
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(aws_sdk_s3::config::Region::new(region.clone()));
        }
        if let Some(endpoint) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;
        Self {
            config,
            client: Some(aws_sdk_s3::Client::new(&sdk_config)),
        }
    }

    fn client(&self) -> Result<&aws_sdk_s3::Client, TransportError> {
        self.client.as_ref().ok_or_else(|| TransportError::ObjectStore {
            msg: "object store client not initialised".to_string(),
        })
    }

    /// Objects currently stored under the prefix, sorted by key.
    pub async fn list(&self) -> Result<Vec<ObjectListing>, TransportError> {
        if let Some(dir) = self.config.emulated_dir() {
            let mut objects = Vec::new();
            for entry in WalkDir::new(&dir).into_iter().filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(rel) = entry.path().strip_prefix(&dir) else {
                    continue;
                };
                let leaf = rel.to_string_lossy().replace('\\', "/");
                if leaf.starts_with('.') {
                    continue;
                }
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                objects.push(ObjectListing {
                    key: self.config.key_for(&leaf),
                    size,
                });
            }
            objects.sort_by(|a, b| a.key.cmp(&b.key));
            return Ok(objects);
        }

        let client = self.client()?;
        let prefix = self.config.key_for("");
        let mut objects = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = client
                .list_objects_v2()
                .bucket(&self.config.bucket)
                .prefix(&prefix)
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(|e| remote_error(&DisplayErrorContext(&e).to_string()))?;
            for object in page.contents() {
                if let Some(key) = object.key() {
                    objects.push(ObjectListing {
                        key: key.to_string(),
                        size: object.size().unwrap_or(0).max(0) as u64,
                    });
                }
            }
            match page.next_continuation_token() {
                Some(next) => token = Some(next.to_string()),
                None => break,
            }
        }
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }
}

fn remote_error(message: &str) -> TransportError {
    match TransportError::classify(message) {
        auth @ TransportError::Auth { .. } => auth,
        _ => TransportError::ObjectStore {
            msg: message.to_string(),
        },
    }
}

#[async_trait]
impl Transport for ObjectStoreUpload {
    fn kind(&self) -> TransportKind {
        TransportKind::ObjectStore
    }

    async fn push(&self, blob: &ArchiveBlob) -> Result<u64, TransportError> {
        if let Some(dir) = self.config.emulated_dir() {
            return place_local(&blob.path, &dir, &blob.name).await;
        }

        let key = self.config.key_for(&blob.name);
        let body = ByteStream::from_path(&blob.path)
            .await
            .map_err(|e| TransportError::Io(std::io::Error::other(e)))?;
        self.client()?
            .put_object()
            .bucket(&self.config.bucket)
            .key(&key)
            .metadata("sha256", &blob.sha256)
            .body(body)
            .send()
            .await
            .map_err(|e| remote_error(&DisplayErrorContext(&e).to_string()))?;

        info!(bucket = %self.config.bucket, key = %key, bytes = blob.bytes, "blob uploaded");
        Ok(blob.bytes)
    }
}
