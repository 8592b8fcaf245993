//! Shared helpers for integration tests
//!
//! `MemoryDestination` applies the same load planning as the PostgreSQL
//! backend, keeping only schema and row counts in memory, and records every
//! load job so tests can count strict and fallback attempts.

#![allow(dead_code)]

use async_trait::async_trait;
use polars::prelude::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tripload_ingest::config::{GroupConfig, PipelineConfig, SourceConfig, Span};
use tripload_ingest::destination::{
    plan_load, read_parquet, AccessEntry, AccessRole, Destination, LoadJobResult, LoadRequest, TableInfo,
    WriteDisposition,
};
use tripload_ingest::error::{IngestError, Result};
use tripload_ingest::schema::TableSchema;
use tripload_ingest::staging::{LocalStagingStore, StagingStore};
use tripload_ingest::{ArtifactRef, StagingVariant};

#[derive(Debug, Clone)]
pub struct LoadCall {
    pub table: String,
    pub files: Vec<String>,
    pub write: WriteDisposition,
    /// Whether an explicit schema was supplied
    pub strict: bool,
    pub allow_field_relaxation: bool,
    pub succeeded: bool,
}

#[derive(Debug, Clone)]
struct MemoryTable {
    schema: TableSchema,
    rows: u64,
}

#[derive(Default)]
pub struct MemoryDestination {
    tables: Mutex<HashMap<String, MemoryTable>>,
    access: Mutex<Vec<AccessEntry>>,
    calls: Mutex<Vec<LoadCall>>,
    access_updates: AtomicUsize,
}

impl MemoryDestination {
    pub fn new() -> Arc<Self> {
        let destination = Self::default();
        destination.access.lock().unwrap().push(AccessEntry {
            role: AccessRole::Owner,
            entity_id: "tripload".to_string(),
        });
        Arc::new(destination)
    }

    pub fn calls(&self) -> Vec<LoadCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn access_updates(&self) -> usize {
        self.access_updates.load(Ordering::SeqCst)
    }

    pub fn table_schema(&self, table: &str) -> Option<TableSchema> {
        self.tables.lock().unwrap().get(table).map(|t| t.schema.clone())
    }
}

#[async_trait]
impl Destination for MemoryDestination {
    async fn table_exists(&self, table: &str) -> Result<bool> {
        Ok(self.tables.lock().unwrap().contains_key(table))
    }

    async fn drop_table(&self, table: &str) -> Result<()> {
        self.tables.lock().unwrap().remove(table);
        Ok(())
    }

    async fn load(&self, request: LoadRequest<'_>) -> Result<LoadJobResult> {
        let mut call = LoadCall {
            table: request.table.to_string(),
            files: request
                .sources
                .iter()
                .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
                .collect(),
            write: request.write,
            strict: request.schema.is_some(),
            allow_field_relaxation: request.allow_field_relaxation,
            succeeded: false,
        };

        let result = (|| -> Result<LoadJobResult> {
            let frames = request
                .sources
                .iter()
                .map(|p| read_parquet(p))
                .collect::<Result<Vec<_>>>()?;
            let schemas: Vec<TableSchema> = frames.iter().map(TableSchema::from_frame).collect();

            let mut tables = self.tables.lock().unwrap();
            let existing = tables.get(request.table).map(|t| t.schema.clone());
            let plan = plan_load(
                existing.as_ref(),
                &schemas,
                request.write,
                request.schema,
                request.allow_field_relaxation,
            )?;

            let rows: u64 = frames.iter().map(|df| df.height() as u64).sum();
            let previous = if plan.create.is_some() {
                0
            } else {
                tables.get(request.table).map(|t| t.rows).unwrap_or(0)
            };
            tables.insert(
                request.table.to_string(),
                MemoryTable {
                    schema: plan.result_schema,
                    rows: previous + rows,
                },
            );

            Ok(LoadJobResult {
                rows_loaded: rows,
                relaxed_columns: plan.relax,
            })
        })();

        call.succeeded = result.is_ok();
        self.calls.lock().unwrap().push(call);
        result
    }

    async fn get_table(&self, table: &str) -> Result<TableInfo> {
        let tables = self.tables.lock().unwrap();
        let entry = tables
            .get(table)
            .ok_or_else(|| IngestError::destination(format!("Table not found: {}", table)))?;
        Ok(TableInfo {
            name: table.to_string(),
            row_count: entry.rows,
            schema: entry.schema.clone(),
        })
    }

    async fn access_entries(&self) -> Result<Vec<AccessEntry>> {
        Ok(self.access.lock().unwrap().clone())
    }

    async fn update_access_entries(&self, entries: &[AccessEntry]) -> Result<()> {
        self.access_updates.fetch_add(1, Ordering::SeqCst);
        let mut access = self.access.lock().unwrap();
        for entry in entries {
            if !access.contains(entry) {
                access.push(entry.clone());
            }
        }
        Ok(())
    }
}

/// Serialize a frame to parquet bytes
pub fn parquet_bytes(mut df: DataFrame) -> Vec<u8> {
    let mut buffer = Vec::new();
    ParquetWriter::new(&mut buffer).finish(&mut df).unwrap();
    buffer
}

pub fn write_parquet(dir: &Path, name: &str, df: DataFrame) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, parquet_bytes(df)).unwrap();
    path
}

/// Put a frame into the store as the given staged copy of `artifact`
pub async fn stage(store: &dyn StagingStore, artifact: &ArtifactRef, variant: StagingVariant, df: DataFrame) {
    store
        .put(&artifact.staging_key(variant), parquet_bytes(df))
        .await
        .unwrap();
}

/// Trip file whose `PULocationID` is already a float column
pub fn float_trips(rows: usize) -> DataFrame {
    let ids: Vec<Option<f64>> = (0..rows).map(|i| Some(i as f64 + 1.0)).collect();
    let fares: Vec<f64> = (0..rows).map(|i| 5.0 + i as f64).collect();
    df! {
        "PULocationID" => ids,
        "fare_amount" => fares,
    }
    .unwrap()
}

/// Trip file whose `PULocationID` drifted to a nullable integer column
pub fn int_trips(rows: usize) -> DataFrame {
    let ids: Vec<Option<i64>> = (0..rows)
        .map(|i| if i % 2 == 0 { Some(i as i64 + 1) } else { None })
        .collect();
    let fares: Vec<f64> = (0..rows).map(|i| 7.5 + i as f64).collect();
    df! {
        "PULocationID" => ids,
        "fare_amount" => fares,
    }
    .unwrap()
}

/// Trip file whose `PULocationID` holds strings; no rule or fallback saves it
pub fn string_trips(rows: usize) -> DataFrame {
    let ids: Vec<&str> = (0..rows).map(|_| "unknown").collect();
    let fares: Vec<f64> = (0..rows).map(|i| 3.0 + i as f64).collect();
    df! {
        "PULocationID" => ids,
        "fare_amount" => fares,
    }
    .unwrap()
}

pub fn local_store(dir: &Path) -> Arc<dyn StagingStore> {
    Arc::new(LocalStagingStore::new(dir.join("staging")).unwrap())
}

/// Single-group configuration pointed at a test origin
pub fn sample_config(base_url: &str, scratch: &Path, group: GroupConfig) -> PipelineConfig {
    let mut config = PipelineConfig {
        source: SourceConfig {
            base_url: base_url.to_string(),
            timeout_secs: 10,
            max_retries: 1,
            retry_backoff_ms: 0,
        },
        groups: vec![group],
        ..PipelineConfig::default()
    };
    config.pipeline.scratch_dir = scratch.join("scratch");
    config.pipeline.show_progress = false;
    config
}

pub fn sample_group(months: Span<u32>) -> GroupConfig {
    GroupConfig::new("sample", "sample_trips", Span::new(2021, 2021))
        .with_months(months)
        .with_cast_rules(tripload_ingest::reconcile::CastRuleSet::to_float(&["PULocationID"]))
}
