//! Artifact identity and staging keys
//!
//! An artifact is one monthly trip-record file of a group, e.g.
//! `green_tripdata_2019-01.parquet`. Its staging keys are derived from it,
//! never stored separately.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;

/// Identity of one source file
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactRef {
    group: String,
    year: i32,
    month: u32,
}

impl ArtifactRef {
    pub fn new(group: impl Into<String>, year: i32, month: u32) -> Self {
        Self {
            group: group.into(),
            year,
            month,
        }
    }

    /// Enumerate every artifact of a group, years outer, months inner
    pub fn enumerate(
        group: &str,
        years: RangeInclusive<i32>,
        months: RangeInclusive<u32>,
    ) -> Vec<ArtifactRef> {
        years
            .flat_map(|year| months.clone().map(move |month| ArtifactRef::new(group, year, month)))
            .collect()
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    /// Period identifier, `YYYY-MM`
    pub fn period(&self) -> String {
        format!("{:04}-{:02}", self.year, self.month)
    }

    /// Published file name, `{group}_tripdata_{YYYY}-{MM}.parquet`
    pub fn file_name(&self) -> String {
        format!("{}_tripdata_{}.parquet", self.group, self.period())
    }

    /// Remote location under the origin's base URL
    pub fn url(&self, base_url: &str) -> String {
        format!("{}/{}", base_url.trim_end_matches('/'), self.file_name())
    }

    pub fn staging_key(&self, variant: StagingVariant) -> StagingKey {
        StagingKey::new(self, variant)
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.file_name())
    }
}

/// Which copy of an artifact a staging entry holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StagingVariant {
    /// Bytes exactly as published
    Raw,
    /// Copy rewritten by the schema reconciler
    Reconciled,
}

impl StagingVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            StagingVariant::Raw => "raw",
            StagingVariant::Reconciled => "reconciled",
        }
    }
}

impl fmt::Display for StagingVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Object key `{group}/{variant}/{filename}` relative to the store's prefix
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StagingKey(String);

impl StagingKey {
    pub fn new(artifact: &ArtifactRef, variant: StagingVariant) -> Self {
        Self(format!(
            "{}/{}/{}",
            artifact.group(),
            variant.as_str(),
            artifact.file_name()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Flat file name for scratch copies; distinct per group and variant
    pub fn scratch_name(&self) -> String {
        self.0.replace('/', "__")
    }
}

impl fmt::Display for StagingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
