//! S3-compatible staging store (AWS S3, MinIO, GCS interoperability endpoints)

use super::{PutResult, S3Config, StagingStore};
use crate::artifact::StagingKey;
use crate::error::{IngestError, Result};
use async_trait::async_trait;
use aws_sdk_s3::{
    config::{BehaviorVersion, Credentials, Region},
    primitives::ByteStream,
    Client,
};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

#[derive(Clone)]
pub struct S3StagingStore {
    client: Client,
    config: S3Config,
}

impl S3StagingStore {
    pub async fn new(config: S3Config) -> Result<Self> {
        debug!(
            bucket = %config.bucket,
            endpoint = ?config.endpoint,
            region = %config.region,
            "Initializing S3 staging store"
        );

        // Without static keys fall back to the default AWS credential chain
        let base_builder = if config.access_key.is_empty() {
            let shared = aws_config::defaults(BehaviorVersion::latest())
                .region(Region::new(config.region.clone()))
                .load()
                .await;
            aws_sdk_s3::config::Builder::from(&shared)
        } else {
            aws_sdk_s3::Config::builder()
                .behavior_version(BehaviorVersion::latest())
                .credentials_provider(Credentials::new(
                    &config.access_key,
                    &config.secret_key,
                    None,
                    None,
                    "tripload-staging",
                ))
                .region(Region::new(config.region.clone()))
        };
        let mut s3_config_builder = base_builder.force_path_style(config.path_style);

        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(s3_config_builder.build());

        info!("Staging store initialized for bucket: {}", config.bucket);

        Ok(Self { client, config })
    }

    fn object_key(&self, key: &StagingKey) -> String {
        self.config.object_key(key.as_str())
    }
}

#[async_trait]
impl StagingStore for S3StagingStore {
    #[instrument(skip(self), fields(key = %key))]
    async fn exists(&self, key: &StagingKey) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.config.bucket)
            .key(self.object_key(key))
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error().map(|se| se.is_not_found()).unwrap_or(false) {
                    Ok(false)
                } else {
                    Err(IngestError::storage(format!(
                        "Failed to check existence of {}: {}",
                        self.location(key),
                        e
                    )))
                }
            },
        }
    }

    #[instrument(skip(self, data), fields(key = %key, bytes = data.len()))]
    async fn put(&self, key: &StagingKey, data: Vec<u8>) -> Result<PutResult> {
        let result = PutResult::for_bytes(key, &data);

        // A single PutObject is atomic: the object is visible only once complete.
        self.client
            .put_object()
            .bucket(&self.config.bucket)
            .key(self.object_key(key))
            .content_type("application/vnd.apache.parquet")
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| IngestError::storage(format!("Failed to upload {}: {}", self.location(key), e)))?;

        info!("Uploaded {} bytes to {}", result.size, self.location(key));

        Ok(result)
    }

    #[instrument(skip(self, dest_dir), fields(key = %key))]
    async fn get(&self, key: &StagingKey, dest_dir: &Path) -> Result<PathBuf> {
        let response = self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(self.object_key(key))
            .send()
            .await
            .map_err(|e| IngestError::storage(format!("Failed to download {}: {}", self.location(key), e)))?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| IngestError::storage(format!("Failed to read body of {}: {}", self.location(key), e)))?
            .into_bytes();

        tokio::fs::create_dir_all(dest_dir).await?;
        let target = dest_dir.join(key.scratch_name());
        tokio::fs::write(&target, &data).await?;

        debug!("Downloaded {} bytes from {}", data.len(), self.location(key));

        Ok(target)
    }

    fn location(&self, key: &StagingKey) -> String {
        object_url(&self.config, key)
    }
}

fn object_url(config: &S3Config, key: &StagingKey) -> String {
    format!("s3://{}/{}", config.bucket, config.object_key(key.as_str()))
}
