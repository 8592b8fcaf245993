//! Tripload Ingest Library
//!
//! Idempotent, resumable loading of monthly trip-record files into a
//! destination table.
//!
//! # Components
//!
//! - [`fetcher::SourceFetcher`]: HTTP origin to raw staging
//! - [`reconcile::SchemaReconciler`]: casts drifting column types and stages
//!   the reconciled copy
//! - [`staging::StagingStore`]: S3 or local directory; key existence is the
//!   idempotency record
//! - [`loader::BulkLoader`]: strict load with inferred-schema fallback
//! - [`driver::PipelineDriver`]: sequences the above per group and builds the
//!   [`report::BatchReport`]
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tripload_ingest::{config::PipelineConfig, destination::PgDestination, driver::PipelineDriver, staging};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PipelineConfig::load(None)?;
//!     let store = staging::connect(&config.staging).await?;
//!     let destination = Arc::new(PgDestination::connect(&config.destination).await?);
//!
//!     let driver = PipelineDriver::new(config, store, destination)?;
//!     let report = driver.run(&["green".to_string()]).await?;
//!     println!("{} artifacts failed", report.failed());
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod artifact;
pub mod config;
pub mod destination;
pub mod driver;
pub mod error;
pub mod fetcher;
pub mod loader;
pub mod reconcile;
pub mod report;
pub mod schema;
pub mod staging;

pub use artifact::{ArtifactRef, StagingKey, StagingVariant};
pub use error::{IngestError, Result};
