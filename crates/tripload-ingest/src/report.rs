//! Batch report: one entry per artifact, grouped by destination table

use crate::artifact::ArtifactRef;
use crate::error::{IngestError, Result};
use crate::fetcher::FetchOutcome;
use crate::loader::LoadOutcome;
use crate::reconcile::{ReconcileReport, StageOutcome};
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Table};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Fetch,
    Reconcile,
    Load,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Fetch => f.write_str("fetch"),
            Stage::Reconcile => f.write_str("reconcile"),
            Stage::Load => f.write_str("load"),
        }
    }
}

/// First failure recorded for an artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactError {
    pub stage: Stage,
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactReport {
    pub artifact: ArtifactRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetch: Option<FetchOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconcile: Option<StageOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load: Option<LoadOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ArtifactError>,
}

impl ArtifactReport {
    pub fn new(artifact: ArtifactRef) -> Self {
        Self {
            artifact,
            fetch: None,
            reconcile: None,
            load: None,
            error: None,
        }
    }

    pub fn fail(&mut self, stage: Stage, err: &IngestError) {
        self.error = Some(ArtifactError {
            stage,
            kind: err.kind().to_string(),
            message: err.to_string(),
        });
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }

    pub fn rows(&self) -> u64 {
        self.load.as_ref().map(LoadOutcome::rows).unwrap_or(0)
    }

    /// One-word summary for tables
    pub fn status(&self) -> &'static str {
        match (&self.error, &self.load) {
            (Some(_), _) => "failed",
            (None, Some(LoadOutcome::SucceededViaFallback { .. })) => "loaded (fallback)",
            (None, Some(_)) => "loaded",
            (None, None) => "staged",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupReport {
    pub group: String,
    pub table: String,
    /// Row count reported by the destination; `None` if nothing was loaded
    pub final_row_count: Option<u64>,
    pub artifacts: Vec<ArtifactReport>,
}

impl GroupReport {
    pub fn expected_rows(&self) -> u64 {
        self.artifacts.iter().map(ArtifactReport::rows).sum()
    }

    pub fn failed(&self) -> usize {
        self.artifacts.iter().filter(|a| a.is_failed()).count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AccessOutcome {
    AlreadyGranted { entity_id: String },
    Granted { entity_id: String },
    Failed { entity_id: String, error: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub groups: Vec<GroupReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access: Option<AccessOutcome>,
}

impl BatchReport {
    /// Every artifact entry in run order
    pub fn entries(&self) -> impl Iterator<Item = &ArtifactReport> {
        self.groups.iter().flat_map(|g| g.artifacts.iter())
    }

    pub fn get(&self, artifact: &ArtifactRef) -> Option<&ArtifactReport> {
        self.entries().find(|e| &e.artifact == artifact)
    }

    pub fn group(&self, name: &str) -> Option<&GroupReport> {
        self.groups.iter().find(|g| g.group == name)
    }

    pub fn failed(&self) -> usize {
        self.entries().filter(|e| e.is_failed()).count()
    }

    pub fn has_failures(&self) -> bool {
        self.failed() > 0 || matches!(self.access, Some(AccessOutcome::Failed { .. }))
    }
}

/// How the CLI prints a report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

impl FromStr for OutputFormat {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "table" => Ok(OutputFormat::Table),
            "json" => Ok(OutputFormat::Json),
            other => Err(IngestError::config(format!("Unknown output format '{}'", other))),
        }
    }
}

pub fn render(report: &BatchReport, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(render_table(report)),
        OutputFormat::Json => serde_json::to_string_pretty(report)
            .map_err(|e| IngestError::Common(tripload_common::TriploadError::Serialization(e))),
    }
}

fn render_table(report: &BatchReport) -> String {
    let mut out = String::new();

    for group in &report.groups {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .apply_modifier(UTF8_ROUND_CORNERS)
            .set_header(vec!["Artifact", "Fetch", "Reconcile", "Status", "Rows", "Error"]);

        for entry in &group.artifacts {
            table.add_row(vec![
                entry.artifact.file_name(),
                entry.fetch.as_ref().map(fetch_label).unwrap_or("-").to_string(),
                entry.reconcile.as_ref().map(reconcile_label).unwrap_or("-").to_string(),
                entry.status().to_string(),
                entry.rows().to_string(),
                entry
                    .error
                    .as_ref()
                    .map(|e| format!("[{}] {}", e.stage, e.message))
                    .unwrap_or_default(),
            ]);
        }

        out.push_str(&format!("{} -> {}\n{}\n", group.group, group.table, table));
        out.push_str(&format!(
            "  rows: {} (expected {}), failed artifacts: {}/{}\n\n",
            group
                .final_row_count
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string()),
            group.expected_rows(),
            group.failed(),
            group.artifacts.len()
        ));
    }

    if let Some(access) = &report.access {
        let line = match access {
            AccessOutcome::AlreadyGranted { entity_id } => format!("access: {} already has read access", entity_id),
            AccessOutcome::Granted { entity_id } => format!("access: granted read access to {}", entity_id),
            AccessOutcome::Failed { entity_id, error } => {
                format!("access: granting {} failed: {}", entity_id, error)
            },
        };
        out.push_str(&line);
        out.push('\n');
    }

    out.push_str(&format!(
        "total: {} artifacts, {} failed\n",
        report.entries().count(),
        report.failed()
    ));
    out
}

fn fetch_label(outcome: &FetchOutcome) -> &'static str {
    match outcome {
        FetchOutcome::AlreadyStaged => "cached",
        FetchOutcome::Fetched { .. } => "downloaded",
    }
}

fn reconcile_label(outcome: &StageOutcome) -> &'static str {
    match outcome {
        StageOutcome::AlreadyStaged => "cached",
        StageOutcome::Staged(ReconcileReport::Clean) => "clean",
        StageOutcome::Staged(ReconcileReport::Rewritten { .. }) => "rewritten",
    }
}

/// Artifact list per group, as `tripload plan` prints it
pub fn render_plan(groups: &[(&str, &str, Vec<ArtifactRef>)]) -> String {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec!["Group", "Table", "Artifacts", "First", "Last"]);

    for (group, dest, artifacts) in groups {
        table.add_row(vec![
            group.to_string(),
            dest.to_string(),
            artifacts.len().to_string(),
            artifacts.first().map(|a| a.file_name()).unwrap_or_default(),
            artifacts.last().map(|a| a.file_name()).unwrap_or_default(),
        ]);
    }

    table.to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample_report() -> BatchReport {
        let mut ok = ArtifactReport::new(ArtifactRef::new("green", 2019, 1));
        ok.fetch = Some(FetchOutcome::AlreadyStaged);
        ok.reconcile = Some(StageOutcome::Staged(ReconcileReport::Clean));
        ok.load = Some(LoadOutcome::Succeeded { rows: 630_918 });

        let mut missing = ArtifactReport::new(ArtifactRef::new("green", 2019, 2));
        missing.fail(
            Stage::Fetch,
            &IngestError::FetchFailed {
                artifact: missing.artifact.clone(),
                reason: "HTTP 404 Not Found".to_string(),
            },
        );

        BatchReport {
            groups: vec![GroupReport {
                group: "green".to_string(),
                table: "ext_green_taxi".to_string(),
                final_row_count: Some(630_918),
                artifacts: vec![ok, missing],
            }],
            access: Some(AccessOutcome::Granted {
                entity_id: "dbt_reader".to_string(),
            }),
        }
    }

    #[test]
    fn test_totals() {
        let report = sample_report();
        assert_eq!(report.failed(), 1);
        assert!(report.has_failures());
        assert_eq!(report.group("green").unwrap().expected_rows(), 630_918);
        assert_eq!(
            report.get(&ArtifactRef::new("green", 2019, 2)).unwrap().status(),
            "failed"
        );
    }

    #[test]
    fn test_render_json() {
        let json = render(&sample_report(), OutputFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        let artifacts = &value["groups"][0]["artifacts"];
        assert_eq!(artifacts[0]["load"]["status"], "succeeded");
        assert_eq!(artifacts[1]["error"]["kind"], "fetch_failed");
        assert_eq!(value["access"]["status"], "granted");
    }

    #[test]
    fn test_render_table_mentions_every_artifact() {
        let text = render(&sample_report(), OutputFormat::Table).unwrap();
        assert!(text.contains("green_tripdata_2019-01.parquet"));
        assert!(text.contains("green_tripdata_2019-02.parquet"));
        assert!(text.contains("total: 2 artifacts, 1 failed"));
    }

    #[test]
    fn test_output_format_parse() {
        assert_eq!("JSON".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert!("yaml".parse::<OutputFormat>().is_err());
    }
}
