//! Pipeline configuration
//!
//! Built once by the entry point from defaults, an optional TOML file and
//! environment overrides, then handed to the driver. Nothing below reads the
//! environment on its own.

use crate::artifact::{ArtifactRef, StagingVariant};
use crate::destination::DestinationConfig;
use crate::error::{IngestError, Result};
use crate::loader::LoadMode;
use crate::reconcile::CastRuleSet;
use crate::schema::TableSchema;
use crate::staging::StagingConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::str::FromStr;

// ============================================================================
// Source Configuration Constants
// ============================================================================

/// Public origin of the monthly trip-record files.
pub const DEFAULT_BASE_URL: &str = "https://d37ci6vzurychx.cloudfront.net/trip-data";

/// Default transfer timeout in seconds.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 300;

/// Default number of download attempts per artifact.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default backoff unit; attempt `n` waits `unit * 2^n`.
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 1000;

/// Default number of artifacts fetched and reconciled at once.
pub const DEFAULT_FETCH_CONCURRENCY: usize = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
        }
    }
}

/// Run-wide knobs that are not tied to one collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Where downloads and reconciliation rewrites happen before staging
    pub scratch_dir: PathBuf,
    pub fetch_concurrency: usize,
    pub show_progress: bool,
    pub load_mode: LoadMode,
    /// Identity granted read access on the destination dataset after the run
    pub reader_identity: Option<String>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            scratch_dir: std::env::temp_dir().join("tripload"),
            fetch_concurrency: DEFAULT_FETCH_CONCURRENCY,
            show_progress: true,
            load_mode: LoadMode::default(),
            reader_identity: None,
        }
    }
}

/// Inclusive `start..=end` bound as written in config files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span<T> {
    pub start: T,
    pub end: T,
}

impl<T: Copy> Span<T> {
    pub fn new(start: T, end: T) -> Self {
        Self { start, end }
    }

    pub fn range(&self) -> RangeInclusive<T> {
        self.start..=self.end
    }
}

fn all_months() -> Span<u32> {
    Span::new(1, 12)
}

fn reconciled_variant() -> StagingVariant {
    StagingVariant::Reconciled
}

/// One taxi category: its artifacts, cast rules and destination table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    pub table: String,
    pub years: Span<i32>,
    #[serde(default = "all_months")]
    pub months: Span<u32>,
    /// Which staged copy is loaded; `raw` skips reconciliation
    #[serde(default = "reconciled_variant")]
    pub variant: StagingVariant,
    #[serde(default)]
    pub cast_rules: CastRuleSet,
    /// Explicit schema for strict loads; `None` lets the destination infer it
    #[serde(default)]
    pub schema: Option<TableSchema>,
}

impl GroupConfig {
    pub fn new(name: impl Into<String>, table: impl Into<String>, years: Span<i32>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            years,
            months: all_months(),
            variant: StagingVariant::Reconciled,
            cast_rules: CastRuleSet::new(),
            schema: None,
        }
    }

    pub fn with_months(mut self, months: Span<u32>) -> Self {
        self.months = months;
        self
    }

    pub fn with_cast_rules(mut self, rules: CastRuleSet) -> Self {
        self.cast_rules = rules;
        self
    }

    pub fn with_schema(mut self, schema: TableSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_variant(mut self, variant: StagingVariant) -> Self {
        self.variant = variant;
        self
    }

    /// Artifacts of this group in load order
    pub fn artifacts(&self) -> Vec<ArtifactRef> {
        ArtifactRef::enumerate(&self.name, self.years.range(), self.months.range())
    }

    pub fn reconciles(&self) -> bool {
        self.variant == StagingVariant::Reconciled
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(IngestError::config("Group name must not be empty"));
        }
        if self.name.contains('/') {
            return Err(IngestError::config(format!(
                "Group name '{}' must not contain '/'",
                self.name
            )));
        }
        if self.table.trim().is_empty() {
            return Err(IngestError::config(format!("Group '{}' has no table name", self.name)));
        }
        if self.years.start > self.years.end {
            return Err(IngestError::config(format!(
                "Group '{}' has an inverted year range {}..={}",
                self.name, self.years.start, self.years.end
            )));
        }
        if self.months.start > self.months.end {
            return Err(IngestError::config(format!(
                "Group '{}' has an inverted month range {}..={}",
                self.name, self.months.start, self.months.end
            )));
        }
        if self.months.start < 1 || self.months.end > 12 {
            return Err(IngestError::config(format!(
                "Group '{}' months must lie within 1..=12",
                self.name
            )));
        }
        if self.reconciles() && self.cast_rules.is_empty() {
            return Err(IngestError::config(format!(
                "Group '{}' loads reconciled artifacts but has no cast rules",
                self.name
            )));
        }
        Ok(())
    }
}

/// Everything one invocation needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub source: SourceConfig,
    pub staging: StagingConfig,
    pub destination: DestinationConfig,
    pub pipeline: PipelineSettings,
    pub groups: Vec<GroupConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            source: SourceConfig::default(),
            staging: StagingConfig::default(),
            destination: DestinationConfig::default(),
            pipeline: PipelineSettings::default(),
            groups: default_groups(),
        }
    }
}

/// The three trip-record categories with the casts their files need
pub fn default_groups() -> Vec<GroupConfig> {
    vec![
        GroupConfig::new("green", "ext_green_taxi", Span::new(2019, 2020)).with_cast_rules(CastRuleSet::to_float(&[
            "VendorID",
            "RatecodeID",
            "PULocationID",
            "DOLocationID",
            "passenger_count",
            "payment_type",
            "trip_type",
            "ehail_fee",
            "congestion_surcharge",
        ])),
        GroupConfig::new("yellow", "ext_yellow_taxi", Span::new(2019, 2020)).with_cast_rules(CastRuleSet::to_float(&[
            "VendorID",
            "RatecodeID",
            "PULocationID",
            "DOLocationID",
            "passenger_count",
            "payment_type",
            "airport_fee",
            "congestion_surcharge",
        ])),
        GroupConfig::new("fhv", "ext_fhv_taxi", Span::new(2019, 2019))
            .with_cast_rules(CastRuleSet::to_float(&["PUlocationID", "DOlocationID", "SR_Flag"])),
    ]
}

impl PipelineConfig {
    /// Load configuration from an optional TOML file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        let config = config.merge_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| IngestError::config(format!("Cannot read {}: {}", path.display(), e)))?;
        Self::from_toml(&content).map_err(|e| match e {
            IngestError::Config(msg) => IngestError::config(format!("{}: {}", path.display(), msg)),
            other => other,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| IngestError::config(e.to_string()))
    }

    /// Apply environment overrides
    pub fn merge_env(mut self) -> Result<Self> {
        if let Ok(url) = std::env::var("TRIPLOAD_BASE_URL") {
            self.source.base_url = url;
        }
        if let Some(timeout) = env_parse("TRIPLOAD_HTTP_TIMEOUT")? {
            self.source.timeout_secs = timeout;
        }
        if let Some(retries) = env_parse("TRIPLOAD_MAX_RETRIES")? {
            self.source.max_retries = retries;
        }
        if let Ok(dir) = std::env::var("TRIPLOAD_SCRATCH_DIR") {
            self.pipeline.scratch_dir = PathBuf::from(dir);
        }
        if let Some(concurrency) = env_parse("TRIPLOAD_FETCH_CONCURRENCY")? {
            self.pipeline.fetch_concurrency = concurrency;
        }
        if let Ok(role) = std::env::var("TRIPLOAD_READER_ROLE") {
            self.pipeline.reader_identity = Some(role).filter(|r| !r.is_empty());
        }

        self.staging = self.staging.merge_env();
        self.destination = self.destination.merge_env();
        Ok(self)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.source.base_url.trim().is_empty() {
            return Err(IngestError::config("Source base URL must not be empty"));
        }
        if self.source.timeout_secs == 0 {
            return Err(IngestError::config("HTTP timeout must be greater than 0"));
        }
        if self.source.max_retries == 0 {
            return Err(IngestError::config("Max retries must be greater than 0"));
        }
        if self.pipeline.fetch_concurrency == 0 {
            return Err(IngestError::config("Fetch concurrency must be greater than 0"));
        }
        if self.destination.dataset.trim().is_empty() {
            return Err(IngestError::config("Destination dataset must not be empty"));
        }
        if self.destination.copy_chunk_rows == 0 {
            return Err(IngestError::config("COPY chunk size must be greater than 0"));
        }

        let mut seen = HashSet::new();
        for group in &self.groups {
            group.validate()?;
            if !seen.insert(group.name.as_str()) {
                return Err(IngestError::config(format!("Duplicate group '{}'", group.name)));
            }
        }

        Ok(())
    }

    pub fn group(&self, name: &str) -> Option<&GroupConfig> {
        self.groups.iter().find(|g| g.name == name)
    }

    /// Look up the requested groups in order; an empty request selects all
    pub fn resolve_groups(&self, names: &[String]) -> Result<Vec<&GroupConfig>> {
        if names.is_empty() {
            return Ok(self.groups.iter().collect());
        }

        names
            .iter()
            .map(|name| {
                self.group(name).ok_or_else(|| {
                    IngestError::config(format!(
                        "Unknown group '{}' (configured: {})",
                        name,
                        self.groups.iter().map(|g| g.name.as_str()).collect::<Vec<_>>().join(", ")
                    ))
                })
            })
            .collect()
    }
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| IngestError::config(format!("Invalid {}='{}': {}", name, value, e))),
        Err(_) => Ok(None),
    }
}
