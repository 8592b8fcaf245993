use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// Where staged artifacts live
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StagingConfig {
    S3(S3Config),
    Local { root: PathBuf },
}

impl Default for StagingConfig {
    fn default() -> Self {
        StagingConfig::S3(S3Config::default())
    }
}

impl StagingConfig {
    /// Apply environment overrides on top of file or default settings
    ///
    /// `TRIPLOAD_STAGING_DIR` selects the local backend, otherwise S3 settings
    /// are overlaid from the `S3_*` variables.
    pub fn merge_env(self) -> Self {
        match env::var("TRIPLOAD_STAGING_DIR") {
            Ok(root) if !root.is_empty() => StagingConfig::Local {
                root: PathBuf::from(root),
            },
            _ => match self {
                StagingConfig::S3(s3) => StagingConfig::S3(s3.merge_env()),
                local => local,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Config {
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    /// Key prefix shared by every staged object, e.g. "week4"
    pub prefix: Option<String>,
    pub access_key: String,
    pub secret_key: String,
    pub path_style: bool,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: "us-east-1".to_string(),
            bucket: "tripload-staging".to_string(),
            prefix: None,
            access_key: String::new(),
            secret_key: String::new(),
            path_style: false,
        }
    }
}

impl S3Config {
    pub fn from_env() -> Self {
        Self {
            access_key: "minioadmin".to_string(),
            secret_key: "minioadmin".to_string(),
            ..Self::default()
        }
        .merge_env()
    }

    /// Overlay every `S3_*` variable that is set
    pub fn merge_env(mut self) -> Self {
        if let Ok(endpoint) = env::var("S3_ENDPOINT") {
            self.endpoint = Some(endpoint);
        }
        if let Ok(region) = env::var("S3_REGION") {
            self.region = region;
        }
        if let Ok(bucket) = env::var("S3_BUCKET") {
            self.bucket = bucket;
        }
        if let Ok(prefix) = env::var("S3_PREFIX") {
            self.prefix = Some(prefix).filter(|p| !p.is_empty());
        }
        if let Ok(key) = env::var("S3_ACCESS_KEY").or_else(|_| env::var("AWS_ACCESS_KEY_ID")) {
            self.access_key = key;
        }
        if let Ok(secret) = env::var("S3_SECRET_KEY").or_else(|_| env::var("AWS_SECRET_ACCESS_KEY")) {
            self.secret_key = secret;
        }
        if let Some(path_style) = env::var("S3_PATH_STYLE").ok().and_then(|v| v.parse().ok()) {
            self.path_style = path_style;
        }
        self
    }

    pub fn for_minio(endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            region: "us-east-1".to_string(),
            bucket: bucket.into(),
            prefix: None,
            access_key: "minioadmin".to_string(),
            secret_key: "minioadmin".to_string(),
            path_style: true,
        }
    }

    /// Full object key for a staging key
    pub fn object_key(&self, key: &str) -> String {
        match self.prefix.as_deref().map(|p| p.trim_matches('/')) {
            Some(prefix) if !prefix.is_empty() => format!("{}/{}", prefix, key),
            _ => key.to_string(),
        }
    }
}
