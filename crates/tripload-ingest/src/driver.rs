//! Pipeline driver
//!
//! Runs Fetch -> Reconcile -> Load for each requested group and collects a
//! [`BatchReport`]. Fetch and reconcile of one group's artifacts may overlap
//! (bounded by `fetch_concurrency`, results kept in artifact order); loads are
//! always serial so the truncate-then-append order holds.
//!
//! Only configuration errors abort a run, and they do so before any I/O.
//! Every other failure is recorded against its artifact.

use crate::artifact::ArtifactRef;
use crate::config::{GroupConfig, PipelineConfig};
use crate::destination::{AccessEntry, Destination};
use crate::error::Result;
use crate::fetcher::SourceFetcher;
use crate::loader::{BulkLoader, LoadOutcome, LoadSpec};
use crate::reconcile::SchemaReconciler;
use crate::report::{AccessOutcome, ArtifactError, ArtifactReport, BatchReport, GroupReport, Stage};
use crate::staging::StagingStore;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument, warn};

pub struct PipelineDriver {
    config: PipelineConfig,
    store: Arc<dyn StagingStore>,
    destination: Arc<dyn Destination>,
    fetcher: SourceFetcher,
    reconciler: SchemaReconciler,
    loader: BulkLoader,
}

impl PipelineDriver {
    /// Wire the components from an already loaded configuration
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn StagingStore>,
        destination: Arc<dyn Destination>,
    ) -> Result<Self> {
        config.validate()?;

        let scratch_dir = config.pipeline.scratch_dir.clone();
        let fetcher = SourceFetcher::new(config.source.clone(), store.clone(), scratch_dir.clone())?
            .with_progress(config.pipeline.show_progress);
        let reconciler = SchemaReconciler::new(scratch_dir.clone());
        let loader = BulkLoader::new(destination.clone(), store.clone(), scratch_dir);

        Ok(Self {
            config,
            store,
            destination,
            fetcher,
            reconciler,
            loader,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Process the named groups (all configured groups when empty)
    pub async fn run(&self, groups: &[String]) -> Result<BatchReport> {
        let selected = self.config.resolve_groups(groups)?;
        let start = Instant::now();

        let mut report = BatchReport::default();
        for group in selected {
            report.groups.push(self.run_group(group).await);
        }

        if let Some(identity) = &self.config.pipeline.reader_identity {
            report.access = Some(self.grant_reader(identity).await);
        }

        info!(
            artifacts = report.entries().count(),
            failed = report.failed(),
            "Pipeline finished in {:.1}s",
            start.elapsed().as_secs_f64()
        );

        Ok(report)
    }

    #[instrument(skip(self, group), fields(group = %group.name, table = %group.table))]
    async fn run_group(&self, group: &GroupConfig) -> GroupReport {
        let artifacts = group.artifacts();
        info!(
            "Staging {} artifacts (concurrency={})",
            artifacts.len(),
            self.config.pipeline.fetch_concurrency
        );

        let mut entries: Vec<ArtifactReport> = stream::iter(artifacts)
            .map(|artifact| self.stage_artifact(group, artifact))
            .buffered(self.config.pipeline.fetch_concurrency)
            .collect()
            .await;

        let loadable: Vec<ArtifactRef> = entries
            .iter()
            .filter(|e| !e.is_failed())
            .map(|e| e.artifact.clone())
            .collect();

        let mut report = GroupReport {
            group: group.name.clone(),
            table: group.table.clone(),
            final_row_count: None,
            artifacts: Vec::new(),
        };

        // The load still runs with nothing to load so the previous table is dropped
        if loadable.is_empty() {
            warn!("No artifact of group {} was staged; {} will be dropped", group.name, group.table);
        }

        let spec = LoadSpec {
            table: group.table.clone(),
            mode: self.config.pipeline.load_mode,
            schema: group.schema.clone(),
            variant: group.variant,
            artifacts: loadable,
        };

        match self.loader.load(&spec).await {
            Ok(table_load) => {
                report.final_row_count = table_load.final_row_count;
                for (artifact, outcome) in table_load.outcomes {
                    let Some(entry) = entries.iter_mut().find(|e| e.artifact == artifact) else {
                        continue;
                    };
                    if let LoadOutcome::Failed { error } = &outcome {
                        entry.error = Some(ArtifactError {
                            stage: Stage::Load,
                            kind: "load_failed".to_string(),
                            message: error.clone(),
                        });
                    }
                    entry.load = Some(outcome);
                }
            },
            Err(e) => {
                error!("Loading {} failed: {}", group.table, e);
                for entry in entries.iter_mut().filter(|e| spec.artifacts.contains(&e.artifact)) {
                    entry.fail(Stage::Load, &e);
                }
            },
        }

        report.artifacts = entries;
        report
    }

    async fn stage_artifact(&self, group: &GroupConfig, artifact: ArtifactRef) -> ArtifactReport {
        let mut entry = ArtifactReport::new(artifact);

        match self.fetcher.fetch(&entry.artifact).await {
            Ok(outcome) => entry.fetch = Some(outcome),
            Err(e) => {
                error!(artifact = %entry.artifact, "{}", e);
                entry.fail(Stage::Fetch, &e);
                return entry;
            },
        }

        if group.reconciles() {
            match self
                .reconciler
                .stage(self.store.as_ref(), &entry.artifact, &group.cast_rules)
                .await
            {
                Ok(outcome) => entry.reconcile = Some(outcome),
                Err(e) => {
                    error!(artifact = %entry.artifact, "{}", e);
                    entry.fail(Stage::Reconcile, &e);
                },
            }
        }

        entry
    }

    /// Give `identity` read access on the destination dataset unless it has it
    #[instrument(skip(self))]
    pub async fn grant_reader(&self, identity: &str) -> AccessOutcome {
        match self.ensure_reader(identity).await {
            Ok(true) => AccessOutcome::Granted {
                entity_id: identity.to_string(),
            },
            Ok(false) => AccessOutcome::AlreadyGranted {
                entity_id: identity.to_string(),
            },
            Err(e) => {
                error!("Granting read access to {} failed: {}", identity, e);
                AccessOutcome::Failed {
                    entity_id: identity.to_string(),
                    error: e.to_string(),
                }
            },
        }
    }

    async fn ensure_reader(&self, identity: &str) -> Result<bool> {
        let entry = AccessEntry::reader(identity);
        let mut entries = self.destination.access_entries().await?;
        if entries.contains(&entry) {
            info!("{} already has read access", identity);
            return Ok(false);
        }

        entries.push(entry);
        self.destination.update_access_entries(&entries).await?;
        info!("Granted read access to {}", identity);
        Ok(true)
    }
}
