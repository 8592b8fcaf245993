//! Destination store collaborator
//!
//! The bulk loader only talks to this trait. A backend exposes table
//! existence, drop, a parquet load job, table inspection and the dataset's
//! access list; what a "dataset" is depends on the backend (a PostgreSQL
//! schema for [`PgDestination`]).

use crate::error::{IngestError, Result};
use crate::schema::{ColumnSpec, TableSchema};
use async_trait::async_trait;
use polars::prelude::{DataFrame, ParquetReader, SerReader};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

pub mod postgres;

pub use postgres::{DestinationConfig, PgDestination};

/// How a load job treats existing rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteDisposition {
    /// Replace the table's rows (and schema) with the job's rows
    Truncate,
    Append,
}

impl fmt::Display for WriteDisposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteDisposition::Truncate => f.write_str("truncate"),
            WriteDisposition::Append => f.write_str("append"),
        }
    }
}

/// One load job: parquet files into a table
#[derive(Debug, Clone)]
pub struct LoadRequest<'a> {
    pub table: &'a str,
    pub sources: &'a [PathBuf],
    pub write: WriteDisposition,
    /// `None` infers the schema from the files
    pub schema: Option<&'a TableSchema>,
    pub allow_field_relaxation: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadJobResult {
    pub rows_loaded: u64,
    /// Required columns made nullable by this job
    pub relaxed_columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableInfo {
    pub name: String,
    pub row_count: u64,
    pub schema: TableSchema,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccessRole {
    Reader,
    Writer,
    Owner,
}

/// Grant of a role on the destination dataset to an identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccessEntry {
    pub role: AccessRole,
    pub entity_id: String,
}

impl AccessEntry {
    pub fn reader(entity_id: impl Into<String>) -> Self {
        Self {
            role: AccessRole::Reader,
            entity_id: entity_id.into(),
        }
    }
}

#[async_trait]
pub trait Destination: Send + Sync {
    async fn table_exists(&self, table: &str) -> Result<bool>;

    async fn drop_table(&self, table: &str) -> Result<()>;

    /// Run one load job; either every source lands or none does
    async fn load(&self, request: LoadRequest<'_>) -> Result<LoadJobResult>;

    async fn get_table(&self, table: &str) -> Result<TableInfo>;

    async fn access_entries(&self) -> Result<Vec<AccessEntry>>;

    /// Grant every entry of `entries` the dataset does not have yet
    async fn update_access_entries(&self, entries: &[AccessEntry]) -> Result<()>;
}

/// Table changes a load job has to make before inserting rows
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadPlan {
    /// Schema to (re)create the table with; `None` keeps the existing table
    pub create: Option<TableSchema>,
    pub relax: Vec<String>,
    /// Table schema once the job completes
    pub result_schema: TableSchema,
}

/// Decide how a job changes the table, or why it cannot run
///
/// `existing` is the current table schema, `files` the schema of each source
/// in order. Strict jobs require exact type matches against the explicit
/// schema; inferred jobs may only widen integers into floats when appending.
pub fn plan_load(
    existing: Option<&TableSchema>,
    files: &[TableSchema],
    write: WriteDisposition,
    explicit: Option<&TableSchema>,
    allow_relaxation: bool,
) -> Result<LoadPlan> {
    let Some(first) = files.first() else {
        return Err(IngestError::destination("Load job has no source files"));
    };

    let replace = write == WriteDisposition::Truncate || existing.is_none();

    match explicit {
        Some(schema) => {
            let mut relax = Vec::new();
            for file in files {
                for column in file.check_strict(schema, allow_relaxation)? {
                    if !relax.contains(&column) {
                        relax.push(column);
                    }
                }
            }

            let mut target = match (replace, existing) {
                (false, Some(table)) => {
                    for column in &schema.columns {
                        match table.column(&column.name) {
                            Some(current) if current.column_type == column.column_type => {},
                            Some(current) => {
                                return Err(IngestError::SchemaMismatch(format!(
                                    "column '{}' is {} in the table but {} in the load schema",
                                    column.name, current.column_type, column.column_type
                                )))
                            },
                            None => {
                                return Err(IngestError::SchemaMismatch(format!(
                                    "column '{}' does not exist in the destination table",
                                    column.name
                                )))
                            },
                        }
                    }
                    table.clone()
                },
                _ => schema.clone(),
            };

            relax.retain(|name| target.column(name).map(|c| !c.nullable).unwrap_or(false));
            for column in target.columns.iter_mut() {
                if relax.contains(&column.name) {
                    column.nullable = true;
                }
            }

            Ok(LoadPlan {
                create: replace.then(|| target.clone()),
                relax: if replace { Vec::new() } else { relax },
                result_schema: target,
            })
        },
        None => {
            let mut target = match (replace, existing) {
                (false, Some(table)) => table.clone(),
                _ => TableSchema::new(
                    first
                        .columns
                        .iter()
                        .map(|c| ColumnSpec::new(c.name.clone(), c.column_type, true))
                        .collect(),
                ),
            };

            for (index, file) in files.iter().enumerate() {
                if replace && index == 0 {
                    continue;
                }
                file.check_append(&target)?;
            }

            let relax: Vec<String> = target
                .columns
                .iter()
                .filter(|c| !c.nullable)
                .filter(|c| files.iter().any(|f| f.column(&c.name).map(|fc| fc.nullable).unwrap_or(true)))
                .map(|c| c.name.clone())
                .collect();

            if !relax.is_empty() && !allow_relaxation {
                return Err(IngestError::SchemaMismatch(format!(
                    "required columns receive nulls: {}",
                    relax.join(", ")
                )));
            }

            for column in target.columns.iter_mut() {
                if relax.contains(&column.name) {
                    column.nullable = true;
                }
            }

            Ok(LoadPlan {
                create: replace.then(|| target.clone()),
                relax,
                result_schema: target,
            })
        },
    }
}

/// Read a parquet file into memory
pub fn read_parquet(path: &Path) -> Result<DataFrame> {
    let file = std::fs::File::open(path)?;
    Ok(ParquetReader::new(file).finish()?)
}
