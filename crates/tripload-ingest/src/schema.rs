//! Column types shared by cast rules, explicit load schemas and destinations

use crate::error::{IngestError, Result};
use polars::prelude::{DataFrame, DataType, TimeUnit};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Primitive column type as the pipeline sees it
///
/// Every integer width collapses to `Int64` and every float width to
/// `Float64`; drift between those two families is what reconciliation fixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    #[serde(alias = "int", alias = "integer")]
    Int64,
    #[serde(alias = "float", alias = "double")]
    Float64,
    #[serde(alias = "bool")]
    Boolean,
    #[serde(alias = "text")]
    String,
    #[serde(alias = "datetime")]
    Timestamp,
    Date,
    /// All-null column with no physical type
    Null,
}

impl ColumnType {
    pub fn from_polars(dtype: &DataType) -> Self {
        match dtype {
            DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64 => ColumnType::Int64,
            DataType::Float32 | DataType::Float64 => ColumnType::Float64,
            DataType::Boolean => ColumnType::Boolean,
            DataType::Datetime(_, _) => ColumnType::Timestamp,
            DataType::Date => ColumnType::Date,
            DataType::Null => ColumnType::Null,
            _ => ColumnType::String,
        }
    }

    pub fn to_polars(self) -> DataType {
        match self {
            ColumnType::Int64 => DataType::Int64,
            ColumnType::Float64 => DataType::Float64,
            ColumnType::Boolean => DataType::Boolean,
            ColumnType::String => DataType::String,
            ColumnType::Timestamp => DataType::Datetime(TimeUnit::Microseconds, None),
            ColumnType::Date => DataType::Date,
            ColumnType::Null => DataType::Null,
        }
    }

    /// PostgreSQL column type used when creating destination tables
    pub fn pg_type(self) -> &'static str {
        match self {
            ColumnType::Int64 => "BIGINT",
            ColumnType::Float64 => "DOUBLE PRECISION",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::String | ColumnType::Null => "TEXT",
            ColumnType::Timestamp => "TIMESTAMP",
            ColumnType::Date => "DATE",
        }
    }

    /// Whether values of `self` can be appended to a column of type `target`
    /// without an explicit schema (integer widening and all-null columns only)
    pub fn assignable_to(self, target: ColumnType) -> bool {
        self == target
            || self == ColumnType::Null
            || (self == ColumnType::Int64 && target == ColumnType::Float64)
    }
}

impl std::str::FromStr for ColumnType {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "int" | "int64" | "integer" | "bigint" => Ok(ColumnType::Int64),
            "float" | "float64" | "double" => Ok(ColumnType::Float64),
            "bool" | "boolean" => Ok(ColumnType::Boolean),
            "string" | "text" | "utf8" => Ok(ColumnType::String),
            "timestamp" | "datetime" => Ok(ColumnType::Timestamp),
            "date" => Ok(ColumnType::Date),
            other => Err(IngestError::config(format!("Unknown column type '{}'", other))),
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::Int64 => "int64",
            ColumnType::Float64 => "float64",
            ColumnType::Boolean => "boolean",
            ColumnType::String => "string",
            ColumnType::Timestamp => "timestamp",
            ColumnType::Date => "date",
            ColumnType::Null => "null",
        };
        f.write_str(name)
    }
}

/// One column of a table schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, column_type: ColumnType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable,
        }
    }
}

/// Ordered column list of a file or table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableSchema {
    pub columns: Vec<ColumnSpec>,
}

impl TableSchema {
    pub fn new(columns: Vec<ColumnSpec>) -> Self {
        Self { columns }
    }

    /// Schema of an in-memory frame; a column is nullable when it holds nulls
    pub fn from_frame(df: &DataFrame) -> Self {
        let columns = df
            .get_columns()
            .iter()
            .map(|col| {
                ColumnSpec::new(
                    col.name().as_str(),
                    ColumnType::from_polars(col.dtype()),
                    col.null_count() > 0,
                )
            })
            .collect();
        Self { columns }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Check a file against an explicit schema for a strict load
    ///
    /// Types must match exactly. Returns the required columns that would have
    /// to become nullable; a non-empty list is an error unless relaxation is
    /// allowed.
    pub fn check_strict(&self, explicit: &TableSchema, allow_relaxation: bool) -> Result<Vec<String>> {
        let mut relaxed = Vec::new();

        for file_col in &self.columns {
            let Some(target) = explicit.column(&file_col.name) else {
                return Err(IngestError::SchemaMismatch(format!(
                    "column '{}' is not part of the explicit schema",
                    file_col.name
                )));
            };

            if file_col.column_type != target.column_type && file_col.column_type != ColumnType::Null {
                return Err(IngestError::SchemaMismatch(format!(
                    "column '{}' has type {} but the schema requires {}",
                    file_col.name, file_col.column_type, target.column_type
                )));
            }

            if file_col.nullable && !target.nullable {
                relaxed.push(file_col.name.clone());
            }
        }

        for target in &explicit.columns {
            if !target.nullable && self.column(&target.name).is_none() {
                relaxed.push(target.name.clone());
            }
        }

        if !relaxed.is_empty() && !allow_relaxation {
            return Err(IngestError::SchemaMismatch(format!(
                "required columns receive nulls: {}",
                relaxed.join(", ")
            )));
        }

        Ok(relaxed)
    }

    /// Check a file against an existing table for an append with an inferred schema
    pub fn check_append(&self, table: &TableSchema) -> Result<()> {
        for file_col in &self.columns {
            let Some(target) = table.column(&file_col.name) else {
                return Err(IngestError::SchemaMismatch(format!(
                    "column '{}' does not exist in the destination table",
                    file_col.name
                )));
            };

            if !file_col.column_type.assignable_to(target.column_type) {
                return Err(IngestError::SchemaMismatch(format!(
                    "column '{}' of type {} cannot be appended to {} column",
                    file_col.name, file_col.column_type, target.column_type
                )));
            }
        }

        Ok(())
    }
}
