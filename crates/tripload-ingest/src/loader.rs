//! Bulk loader: staged artifacts into one destination table
//!
//! Incremental mode drops the table, then loads artifacts one job at a time:
//! strict (explicit schema, truncate for the first, append afterwards) and,
//! when that fails, once more with an inferred schema. A failing artifact is
//! recorded and the next one is loaded anyway.
//!
//! Batch mode loads every artifact in a single truncate job; it has no
//! per-artifact fallback, so one bad file fails the whole table.

use crate::artifact::{ArtifactRef, StagingVariant};
use crate::destination::{Destination, LoadRequest, WriteDisposition};
use crate::error::{IngestError, Result};
use crate::schema::TableSchema;
use crate::staging::StagingStore;
use polars::prelude::{ParquetReader, SerReader};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    /// One job per artifact with strict-then-inferred fallback
    #[default]
    Incremental,
    /// One truncate job over every artifact
    Batch,
}

/// What to load where
#[derive(Debug, Clone)]
pub struct LoadSpec {
    pub table: String,
    pub mode: LoadMode,
    pub schema: Option<TableSchema>,
    /// Which staged copy of each artifact is loaded
    pub variant: StagingVariant,
    pub artifacts: Vec<ArtifactRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoadOutcome {
    Succeeded { rows: u64 },
    /// The strict job failed and the inferred-schema retry landed the rows
    SucceededViaFallback { rows: u64, strict_error: String },
    Failed { error: String },
}

impl LoadOutcome {
    pub fn rows(&self) -> u64 {
        match self {
            LoadOutcome::Succeeded { rows } | LoadOutcome::SucceededViaFallback { rows, .. } => *rows,
            LoadOutcome::Failed { .. } => 0,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, LoadOutcome::Failed { .. })
    }

    fn failed(err: &IngestError) -> Self {
        LoadOutcome::Failed { error: err.to_string() }
    }
}

/// Result of one `LoadSpec`
#[derive(Debug, Clone, Serialize)]
pub struct TableLoad {
    pub table: String,
    pub outcomes: Vec<(ArtifactRef, LoadOutcome)>,
    /// Row count reported by the destination once every job finished;
    /// `None` when no job created the table
    pub final_row_count: Option<u64>,
}

impl TableLoad {
    /// Rows the table should hold: the sum over non-failed artifacts
    pub fn expected_rows(&self) -> u64 {
        self.outcomes.iter().map(|(_, o)| o.rows()).sum()
    }

    pub fn outcome(&self, artifact: &ArtifactRef) -> Option<&LoadOutcome> {
        self.outcomes.iter().find(|(a, _)| a == artifact).map(|(_, o)| o)
    }
}

pub struct BulkLoader {
    destination: Arc<dyn Destination>,
    store: Arc<dyn StagingStore>,
    scratch_dir: PathBuf,
}

impl BulkLoader {
    pub fn new(
        destination: Arc<dyn Destination>,
        store: Arc<dyn StagingStore>,
        scratch_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            destination,
            store,
            scratch_dir: scratch_dir.into(),
        }
    }

    /// Load `spec` into its table
    ///
    /// Per-artifact failures land in the outcomes. An `Err` means the table
    /// itself could not be prepared or inspected.
    #[instrument(skip(self, spec), fields(table = %spec.table, mode = ?spec.mode, artifacts = spec.artifacts.len()))]
    pub async fn load(&self, spec: &LoadSpec) -> Result<TableLoad> {
        if self.destination.table_exists(&spec.table).await? {
            self.destination.drop_table(&spec.table).await?;
        }

        let outcomes = match spec.mode {
            LoadMode::Incremental => self.load_incremental(spec).await,
            LoadMode::Batch => self.load_batch(spec).await,
        };

        let final_row_count = if self.destination.table_exists(&spec.table).await? {
            Some(self.destination.get_table(&spec.table).await?.row_count)
        } else {
            None
        };

        let result = TableLoad {
            table: spec.table.clone(),
            outcomes,
            final_row_count,
        };

        let expected = result.expected_rows();
        match result.final_row_count {
            Some(actual) if actual != expected => warn!(
                expected,
                actual, "Table row count differs from the rows of loaded artifacts"
            ),
            Some(actual) => info!("Loaded {} rows into {}", actual, spec.table),
            None => warn!("No artifact was loaded into {}", spec.table),
        }

        Ok(result)
    }

    async fn load_incremental(&self, spec: &LoadSpec) -> Vec<(ArtifactRef, LoadOutcome)> {
        let mut outcomes = Vec::with_capacity(spec.artifacts.len());

        for (index, artifact) in spec.artifacts.iter().enumerate() {
            let outcome = match self.fetch_staged(artifact, spec.variant).await {
                Ok(path) => {
                    let outcome = self.load_one(spec, index, artifact, &path).await;
                    remove_scratch(&path).await;
                    outcome
                },
                Err(e) => {
                    error!(artifact = %artifact, "Staged copy unavailable: {}", e);
                    LoadOutcome::failed(&e)
                },
            };
            outcomes.push((artifact.clone(), outcome));
        }

        outcomes
    }

    async fn load_one(&self, spec: &LoadSpec, index: usize, artifact: &ArtifactRef, path: &Path) -> LoadOutcome {
        let sources = [path.to_path_buf()];
        let write = if index == 0 {
            WriteDisposition::Truncate
        } else {
            WriteDisposition::Append
        };

        let strict = self
            .destination
            .load(LoadRequest {
                table: &spec.table,
                sources: &sources,
                write,
                schema: spec.schema.as_ref(),
                allow_field_relaxation: true,
            })
            .await;

        let strict_error = match strict {
            Ok(job) => {
                if !job.relaxed_columns.is_empty() {
                    debug!(columns = ?job.relaxed_columns, "Relaxed required columns");
                }
                info!(artifact = %artifact, rows = job.rows_loaded, "Loaded");
                return LoadOutcome::Succeeded { rows: job.rows_loaded };
            },
            Err(e) => e,
        };

        warn!(artifact = %artifact, "Strict load failed, retrying with inferred schema: {}", strict_error);

        // The first artifact keeps truncate semantics so that its retry still
        // seeds the table.
        let fallback = self
            .destination
            .load(LoadRequest {
                table: &spec.table,
                sources: &sources,
                write,
                schema: None,
                allow_field_relaxation: false,
            })
            .await;

        match fallback {
            Ok(job) => {
                info!(artifact = %artifact, rows = job.rows_loaded, "Loaded with inferred schema");
                LoadOutcome::SucceededViaFallback {
                    rows: job.rows_loaded,
                    strict_error: strict_error.to_string(),
                }
            },
            Err(fallback_error) => {
                let err = IngestError::LoadFailed {
                    artifact: artifact.clone(),
                    strict: strict_error.to_string(),
                    fallback: fallback_error.to_string(),
                };
                error!(artifact = %artifact, "{}", err);
                LoadOutcome::failed(&err)
            },
        }
    }

    async fn load_batch(&self, spec: &LoadSpec) -> Vec<(ArtifactRef, LoadOutcome)> {
        let mut outcomes = Vec::with_capacity(spec.artifacts.len());
        let mut staged = Vec::new();

        for artifact in &spec.artifacts {
            let counted = match self.fetch_staged(artifact, spec.variant).await {
                Ok(path) => match parquet_row_count(&path).await {
                    Ok(rows) => Ok((path, rows)),
                    Err(e) => {
                        remove_scratch(&path).await;
                        Err(e)
                    },
                },
                Err(e) => Err(e),
            };

            match counted {
                Ok((path, rows)) => {
                    staged.push(path);
                    outcomes.push((artifact.clone(), LoadOutcome::Succeeded { rows }));
                },
                Err(e) => {
                    error!(artifact = %artifact, "Staged copy unavailable: {}", e);
                    outcomes.push((artifact.clone(), LoadOutcome::failed(&e)));
                },
            }
        }

        if staged.is_empty() {
            return outcomes;
        }

        let job = self
            .destination
            .load(LoadRequest {
                table: &spec.table,
                sources: &staged,
                write: WriteDisposition::Truncate,
                schema: spec.schema.as_ref(),
                allow_field_relaxation: true,
            })
            .await;

        match job {
            Ok(job) => info!(rows = job.rows_loaded, files = staged.len(), "Batch job loaded"),
            Err(e) => {
                error!("Batch job failed: {}", e);
                for (artifact, outcome) in outcomes.iter_mut() {
                    if !outcome.is_failed() {
                        *outcome = LoadOutcome::failed(&IngestError::LoadFailed {
                            artifact: artifact.clone(),
                            strict: e.to_string(),
                            fallback: "not attempted in batch mode".to_string(),
                        });
                    }
                }
            },
        }

        for path in &staged {
            remove_scratch(path).await;
        }

        outcomes
    }

    async fn fetch_staged(&self, artifact: &ArtifactRef, variant: StagingVariant) -> Result<PathBuf> {
        let key = artifact.staging_key(variant);
        self.store.get(&key, &self.scratch_dir).await
    }
}

async fn parquet_row_count(path: &Path) -> Result<u64> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<u64> {
        let file = std::fs::File::open(&path)?;
        Ok(ParquetReader::new(file).num_rows()? as u64)
    })
    .await
    .map_err(|e| IngestError::destination(format!("Row count task failed: {}", e)))?
}

async fn remove_scratch(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        debug!("Could not remove scratch file {}: {}", path.display(), e);
    }
}
