//! Filesystem-backed staging store for development runs and tests

use super::{PutResult, StagingStore};
use crate::artifact::StagingKey;
use crate::error::{IngestError, Result};
use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

/// Stores each key as a file below `root`
///
/// Writes go to a temporary file in the target directory and are renamed
/// into place, so a reader never sees a half-written object.
#[derive(Debug, Clone)]
pub struct LocalStagingStore {
    root: PathBuf,
}

impl LocalStagingStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &StagingKey) -> PathBuf {
        key.as_str().split('/').fold(self.root.clone(), |path, segment| path.join(segment))
    }
}

#[async_trait]
impl StagingStore for LocalStagingStore {
    async fn exists(&self, key: &StagingKey) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.path_for(key)).await?)
    }

    #[instrument(skip(self, data), fields(key = %key, bytes = data.len()))]
    async fn put(&self, key: &StagingKey, data: Vec<u8>) -> Result<PutResult> {
        let path = self.path_for(key);
        let result = PutResult::for_bytes(key, &data);

        tokio::task::spawn_blocking(move || -> Result<()> {
            let parent = path
                .parent()
                .ok_or_else(|| IngestError::storage(format!("No parent directory for {}", path.display())))?;
            std::fs::create_dir_all(parent)?;

            let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
            tmp.write_all(&data)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&path).map_err(|e| IngestError::Io(e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| IngestError::storage(format!("Staging write task failed: {}", e)))??;

        debug!("Stored {} bytes at {}", result.size, self.location(key));
        Ok(result)
    }

    #[instrument(skip(self, dest_dir), fields(key = %key))]
    async fn get(&self, key: &StagingKey, dest_dir: &Path) -> Result<PathBuf> {
        let source = self.path_for(key);
        if !tokio::fs::try_exists(&source).await? {
            return Err(IngestError::storage(format!("Staged object not found: {}", key)));
        }

        tokio::fs::create_dir_all(dest_dir).await?;
        let target = dest_dir.join(key.scratch_name());
        tokio::fs::copy(&source, &target).await?;
        Ok(target)
    }

    fn location(&self, key: &StagingKey) -> String {
        self.path_for(key).display().to_string()
    }
}
