//! Staging store: the idempotency record of the pipeline
//!
//! Every artifact passes through here twice, once as published (`raw`) and
//! once after schema reconciliation (`reconciled`). Whether a key exists is
//! the only signal used to decide if work can be skipped, so the store must
//! outlive the process and `put` must never expose a partial object.

use crate::artifact::StagingKey;
use crate::error::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tripload_common::checksum::sha256_hex;

pub mod config;
pub mod local;
pub mod s3;

pub use config::{S3Config, StagingConfig};
pub use local::LocalStagingStore;
pub use s3::S3StagingStore;

/// Result of a completed `put`
#[derive(Debug, Clone)]
pub struct PutResult {
    pub key: StagingKey,
    pub size: u64,
    pub sha256: String,
}

impl PutResult {
    pub(crate) fn for_bytes(key: &StagingKey, data: &[u8]) -> Self {
        Self {
            key: key.clone(),
            size: data.len() as u64,
            sha256: sha256_hex(data),
        }
    }
}

#[async_trait]
pub trait StagingStore: Send + Sync {
    /// Whether the object is fully stored
    async fn exists(&self, key: &StagingKey) -> Result<bool>;

    /// Store bytes under `key`, replacing any previous object atomically
    async fn put(&self, key: &StagingKey, data: Vec<u8>) -> Result<PutResult>;

    /// Copy the object into `dest_dir` and return the local path
    async fn get(&self, key: &StagingKey, dest_dir: &Path) -> Result<PathBuf>;

    /// Store the contents of a local file
    async fn put_file(&self, key: &StagingKey, path: &Path) -> Result<PutResult> {
        let data = tokio::fs::read(path).await?;
        self.put(key, data).await
    }

    /// Human-readable location of a key, for logs
    fn location(&self, key: &StagingKey) -> String;
}

/// Build the configured backend
pub async fn connect(config: &StagingConfig) -> Result<Arc<dyn StagingStore>> {
    match config {
        StagingConfig::S3(s3_config) => Ok(Arc::new(S3StagingStore::new(s3_config.clone()).await?)),
        StagingConfig::Local { root } => Ok(Arc::new(LocalStagingStore::new(root.clone())?)),
    }
}
