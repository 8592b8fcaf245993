//! Schema reconciliation of staged artifacts
//!
//! Monthly files published by the upstream provider disagree on the physical
//! type of the same logical column (`PULocationID` is `int64` in one month and
//! `double` in the next). A destination table needs one type per column, so
//! each artifact is rewritten columnwise to the group's cast rules before the
//! strict load is attempted.

use crate::artifact::{ArtifactRef, StagingVariant};
use crate::error::{IngestError, Result};
use crate::schema::ColumnType;
use crate::staging::StagingStore;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

/// Column name -> target type, scoped to one group
///
/// Rules naming columns that an artifact does not have are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CastRuleSet {
    rules: BTreeMap<String, ColumnType>,
}

impl CastRuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every listed column cast to `Float64`
    pub fn to_float(columns: &[&str]) -> Self {
        columns
            .iter()
            .map(|c| (c.to_string(), ColumnType::Float64))
            .collect()
    }

    pub fn with_rule(mut self, column: impl Into<String>, target: ColumnType) -> Self {
        self.rules.insert(column.into(), target);
        self
    }

    pub fn target(&self, column: &str) -> Option<ColumnType> {
        self.rules.get(column).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, ColumnType)> {
        self.rules.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }
}

impl FromIterator<(String, ColumnType)> for CastRuleSet {
    fn from_iter<I: IntoIterator<Item = (String, ColumnType)>>(iter: I) -> Self {
        Self {
            rules: iter.into_iter().collect(),
        }
    }
}

/// One column rewritten by the reconciler
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CastColumn {
    pub column: String,
    pub from: String,
    pub to: ColumnType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReconcileReport {
    /// Every targeted column already had its target type; the file is untouched
    Clean,
    Rewritten { columns: Vec<CastColumn> },
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        matches!(self, ReconcileReport::Clean)
    }
}

/// Outcome of producing the reconciled staging entry of one artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    /// The reconciled entry already existed; nothing was read or written
    AlreadyStaged,
    Staged(ReconcileReport),
}

#[derive(Debug, Clone)]
pub struct SchemaReconciler {
    scratch_dir: PathBuf,
}

impl SchemaReconciler {
    pub fn new(scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
        }
    }

    /// Cast mismatched columns of the parquet file at `path` and rewrite it in place
    pub fn reconcile(
        &self,
        artifact: &ArtifactRef,
        path: &Path,
        rules: &CastRuleSet,
    ) -> Result<ReconcileReport> {
        let file = std::fs::File::open(path)?;
        let mut df = ParquetReader::new(file).finish()?;

        let mut changed = Vec::new();
        for (name, target) in rules.iter() {
            let Ok(column) = df.column(name) else {
                continue;
            };

            let target_dtype = target.to_polars();
            if column.dtype() == &target_dtype {
                continue;
            }

            let from = column.dtype().to_string();
            let cast = column.strict_cast(&target_dtype).map_err(|e| IngestError::CastFailed {
                artifact: artifact.clone(),
                column: name.to_string(),
                reason: e.to_string(),
            })?;

            debug!(artifact = %artifact, column = name, from = %from, to = %target, "Casting column");
            df.with_column(cast)?;
            changed.push(CastColumn {
                column: name.to_string(),
                from,
                to: target,
            });
        }

        if changed.is_empty() {
            return Ok(ReconcileReport::Clean);
        }

        write_parquet_atomic(&mut df, path)?;
        Ok(ReconcileReport::Rewritten { columns: changed })
    }

    /// Produce the reconciled staging entry from the raw one
    ///
    /// Skips when the reconciled entry already exists. The reconciled entry is
    /// written only after the raw entry was read back and reconciliation
    /// succeeded; a clean artifact is copied through unchanged.
    #[instrument(skip(self, store, rules), fields(artifact = %artifact))]
    pub async fn stage(
        &self,
        store: &dyn StagingStore,
        artifact: &ArtifactRef,
        rules: &CastRuleSet,
    ) -> Result<StageOutcome> {
        let reconciled_key = artifact.staging_key(StagingVariant::Reconciled);
        if store.exists(&reconciled_key).await? {
            info!("Already reconciled: {}", store.location(&reconciled_key));
            return Ok(StageOutcome::AlreadyStaged);
        }

        let raw_key = artifact.staging_key(StagingVariant::Raw);
        let local_path = store.get(&raw_key, &self.scratch_dir).await?;

        let report = {
            let reconciler = self.clone();
            let artifact = artifact.clone();
            let rules = rules.clone();
            let path = local_path.clone();
            tokio::task::spawn_blocking(move || reconciler.reconcile(&artifact, &path, &rules))
                .await
                .map_err(|e| IngestError::storage(format!("Reconcile task failed: {}", e)))?
        };

        let outcome = match report {
            Ok(report) => store
                .put_file(&reconciled_key, &local_path)
                .await
                .map(|put| {
                    info!(
                        sha256 = %put.sha256,
                        clean = report.is_clean(),
                        "Staged reconciled artifact at {}",
                        store.location(&reconciled_key)
                    );
                    StageOutcome::Staged(report)
                }),
            Err(e) => Err(e),
        };

        if let Err(e) = tokio::fs::remove_file(&local_path).await {
            debug!("Could not remove scratch file {}: {}", local_path.display(), e);
        }

        outcome
    }
}

fn write_parquet_atomic(df: &mut DataFrame, path: &Path) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    ParquetWriter::new(tmp.as_file_mut()).finish(df)?;
    tmp.persist(path).map_err(|e| IngestError::Io(e.error))?;
    Ok(())
}
