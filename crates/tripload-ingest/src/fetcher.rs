//! Source fetcher: remote origin to raw staging

use crate::artifact::{ArtifactRef, StagingVariant};
use crate::config::SourceConfig;
use crate::error::{IngestError, Result};
use crate::staging::StagingStore;
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::StatusCode;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FetchOutcome {
    /// The raw entry already existed; no request was made
    AlreadyStaged,
    Fetched { bytes: u64, sha256: String },
}

/// Why a single download attempt failed
#[derive(Debug, Error)]
enum DownloadError {
    #[error("HTTP {0}")]
    Status(StatusCode),

    #[error("truncated body: expected {expected} bytes, received {received}")]
    Truncated { expected: u64, received: u64 },

    #[error("{0}")]
    Transport(#[from] reqwest::Error),

    #[error("scratch file: {0}")]
    Io(#[from] std::io::Error),
}

impl DownloadError {
    /// Client errors such as 404 will not change on retry
    fn is_retryable(&self) -> bool {
        match self {
            DownloadError::Status(status) => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            },
            DownloadError::Truncated { .. } | DownloadError::Transport(_) => true,
            DownloadError::Io(_) => false,
        }
    }
}

pub struct SourceFetcher {
    client: reqwest::Client,
    config: SourceConfig,
    store: Arc<dyn StagingStore>,
    scratch_dir: PathBuf,
    show_progress: bool,
}

impl SourceFetcher {
    pub fn new(
        config: SourceConfig,
        store: Arc<dyn StagingStore>,
        scratch_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("tripload/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            config,
            store,
            scratch_dir: scratch_dir.into(),
            show_progress: false,
        })
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// Make sure the raw staging entry of `artifact` exists
    ///
    /// Returns without touching the network when it already does. Otherwise
    /// the file is streamed to scratch, stored as the raw entry and the
    /// scratch copy removed.
    #[instrument(skip(self), fields(artifact = %artifact))]
    pub async fn fetch(&self, artifact: &ArtifactRef) -> Result<FetchOutcome> {
        let key = artifact.staging_key(StagingVariant::Raw);
        if self.store.exists(&key).await? {
            info!("Already staged: {}", self.store.location(&key));
            return Ok(FetchOutcome::AlreadyStaged);
        }

        tokio::fs::create_dir_all(&self.scratch_dir).await?;
        let url = artifact.url(&self.config.base_url);
        let scratch = self.download_with_retry(artifact, &url).await?;

        let put = self.store.put_file(&key, scratch.path()).await?;
        info!(
            bytes = put.size,
            sha256 = %put.sha256,
            "Staged {} at {}",
            url,
            self.store.location(&key)
        );

        if let Err(e) = scratch.close() {
            debug!("Could not remove scratch copy: {}", e);
        }

        Ok(FetchOutcome::Fetched {
            bytes: put.size,
            sha256: put.sha256,
        })
    }

    /// Download with exponential backoff between attempts
    async fn download_with_retry(&self, artifact: &ArtifactRef, url: &str) -> Result<NamedTempFile> {
        let mut last_error = None;

        for attempt in 1..=self.config.max_retries {
            match self.download(artifact, url).await {
                Ok(file) => return Ok(file),
                Err(e) => {
                    warn!("Download attempt {}/{} of {} failed: {}", attempt, self.config.max_retries, url, e);

                    let retry = e.is_retryable() && attempt < self.config.max_retries;
                    last_error = Some(e);
                    if !retry {
                        break;
                    }

                    let backoff = retry_backoff(self.config.retry_backoff_ms, attempt);
                    info!("Retrying in {:?}...", backoff);
                    tokio::time::sleep(backoff).await;
                },
            }
        }

        Err(IngestError::FetchFailed {
            artifact: artifact.clone(),
            reason: last_error
                .map(|e| format!("{}: {}", url, e))
                .unwrap_or_else(|| format!("{}: no download attempt made", url)),
        })
    }

    async fn download(&self, artifact: &ArtifactRef, url: &str) -> std::result::Result<NamedTempFile, DownloadError> {
        let response = self.client.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status(status));
        }

        let expected = response.content_length();
        let pb = download_progress(expected, &artifact.file_name(), self.show_progress);

        let scratch = NamedTempFile::new_in(&self.scratch_dir)?;
        let mut file = tokio::fs::File::from_std(scratch.reopen()?);
        let mut received = 0u64;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            received += chunk.len() as u64;
            pb.set_position(received);
        }
        file.flush().await?;
        file.sync_all().await?;

        if let Some(expected) = expected {
            if expected != received {
                pb.abandon();
                return Err(DownloadError::Truncated { expected, received });
            }
        }

        pb.finish_and_clear();
        debug!(bytes = received, "Downloaded {}", url);

        Ok(scratch)
    }
}

/// Wait before retry `attempt`: `unit_ms * 2^attempt`, saturating
fn retry_backoff(unit_ms: u64, attempt: u32) -> Duration {
    Duration::from_millis(unit_ms.saturating_mul(2u64.saturating_pow(attempt)))
}

fn download_progress(total: Option<u64>, name: &str, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(total.unwrap_or(0));
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})")
    {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb.set_message(format!("Downloading {}", name));
    pb
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(!DownloadError::Status(StatusCode::NOT_FOUND).is_retryable());
        assert!(!DownloadError::Status(StatusCode::FORBIDDEN).is_retryable());
        assert!(DownloadError::Status(StatusCode::BAD_GATEWAY).is_retryable());
        assert!(DownloadError::Status(StatusCode::TOO_MANY_REQUESTS).is_retryable());
        assert!(DownloadError::Truncated {
            expected: 10,
            received: 4
        }
        .is_retryable());
    }

    #[test]
    fn test_retry_backoff_doubles_and_saturates() {
        assert_eq!(retry_backoff(1000, 1), Duration::from_secs(2));
        assert_eq!(retry_backoff(1000, 3), Duration::from_secs(8));
        assert_eq!(retry_backoff(0, 5), Duration::ZERO);
        assert_eq!(retry_backoff(1000, 64), Duration::from_millis(u64::MAX));
        assert_eq!(retry_backoff(1, 200), Duration::from_millis(u64::MAX));
    }
}
