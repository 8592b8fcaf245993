//! Error types for the ingestion pipeline
//!
//! `FetchFailed`, `CastFailed` and `LoadFailed` are per-artifact failures: the
//! driver records them in the batch report and moves on. `Config` is fatal and
//! is raised before any I/O happens.

use crate::artifact::ArtifactRef;
use thiserror::Error;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Fetch failed for {artifact}: {reason}")]
    FetchFailed { artifact: ArtifactRef, reason: String },

    #[error("Cast failed for column '{column}' in {artifact}: {reason}")]
    CastFailed {
        artifact: ArtifactRef,
        column: String,
        reason: String,
    },

    #[error("Load failed for {artifact}: strict attempt: {strict}; fallback attempt: {fallback}")]
    LoadFailed {
        artifact: ArtifactRef,
        strict: String,
        fallback: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Staging error: {0}")]
    Storage(String),

    #[error("Destination error: {0}")]
    Destination(String),

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Columnar file error: {0}")]
    Polars(#[from] polars::prelude::PolarsError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Common(#[from] tripload_common::TriploadError),
}

impl IngestError {
    pub fn config(msg: impl Into<String>) -> Self {
        IngestError::Config(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        IngestError::Storage(msg.into())
    }

    pub fn destination(msg: impl Into<String>) -> Self {
        IngestError::Destination(msg.into())
    }

    /// Short label used in reports and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::FetchFailed { .. } => "fetch_failed",
            IngestError::CastFailed { .. } => "cast_failed",
            IngestError::LoadFailed { .. } => "load_failed",
            IngestError::Config(_) => "config_error",
            IngestError::Storage(_) => "staging_error",
            IngestError::Destination(_) | IngestError::Database(_) => "destination_error",
            IngestError::SchemaMismatch(_) => "schema_mismatch",
            IngestError::Io(_) => "io_error",
            IngestError::Http(_) => "http_error",
            IngestError::Polars(_) => "columnar_error",
            IngestError::Common(_) => "common_error",
        }
    }

    /// Whether this error must abort the whole run
    pub fn is_fatal(&self) -> bool {
        matches!(self, IngestError::Config(_))
    }
}
