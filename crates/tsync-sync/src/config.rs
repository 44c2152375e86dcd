use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tsync_adapters::PagedSourceConfig;
use tsync_core::{ColumnLayout, DateParser, FieldMap};
use tsync_storage::{HttpClientConfig, RetryPolicy};

use crate::error::ConfigError;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub datasets_file: PathBuf,
    pub staging_dir: PathBuf,
    pub store_root: PathBuf,
    pub workers: usize,
    pub batch_size: usize,
    pub keep_versions: usize,
    pub max_concurrent_datasets: usize,
    pub politeness_delay: Duration,
    pub fetch_timeout: Duration,
    pub http_timeout_secs: u64,
    pub http_max_retries: usize,
    pub min_request_interval: Option<Duration>,
    pub user_agent: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::rooted_at(Path::new("."))
    }
}

impl SyncConfig {
    /// Defaults with the registry, staging area and store under `root`.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            datasets_file: root.join("datasets.yaml"),
            staging_dir: root.join("staging"),
            store_root: root.join("store"),
            workers: 16,
            batch_size: 500,
            keep_versions: 2,
            max_concurrent_datasets: 2,
            politeness_delay: Duration::from_millis(50),
            fetch_timeout: Duration::from_secs(60),
            http_timeout_secs: 20,
            http_max_retries: 0,
            min_request_interval: None,
            user_agent: "tsync-bot/0.1".to_string(),
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let root = std::env::var("TSYNC_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        let defaults = Self::rooted_at(&root);

        Self {
            datasets_file: std::env::var("TSYNC_DATASETS_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.datasets_file),
            staging_dir: std::env::var("TSYNC_STAGING_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.staging_dir),
            store_root: std::env::var("TSYNC_STORE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.store_root),
            workers: env_or("TSYNC_WORKERS", defaults.workers),
            batch_size: env_or("TSYNC_BATCH_SIZE", defaults.batch_size),
            keep_versions: env_or("TSYNC_KEEP_VERSIONS", defaults.keep_versions),
            max_concurrent_datasets: env_or(
                "TSYNC_MAX_CONCURRENT_DATASETS",
                defaults.max_concurrent_datasets,
            ),
            politeness_delay: Duration::from_millis(env_or("TSYNC_POLITENESS_DELAY_MS", 50)),
            fetch_timeout: Duration::from_secs(env_or("TSYNC_FETCH_TIMEOUT_SECS", 60)),
            http_timeout_secs: env_or("TSYNC_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            http_max_retries: env_or("TSYNC_HTTP_MAX_RETRIES", defaults.http_max_retries),
            min_request_interval: Some(Duration::from_millis(env_or(
                "TSYNC_MIN_REQUEST_INTERVAL_MS",
                0,
            )))
            .filter(|interval| !interval.is_zero()),
            user_agent: std::env::var("TSYNC_USER_AGENT").unwrap_or(defaults.user_agent),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            global_concurrency: self.workers.max(1) * self.max_concurrent_datasets.max(1),
            per_source_concurrency: self.workers.max(1),
            min_request_interval: self.min_request_interval,
            retry: RetryPolicy {
                max_retries: self.http_max_retries,
                ..RetryPolicy::default()
            },
        }
    }

    /// Process-wide knobs with the dataset's own overrides applied.
    pub fn settings_for(&self, dataset: &DatasetConfig) -> RunSettings {
        RunSettings {
            workers: dataset.workers.unwrap_or(self.workers).max(1),
            batch_size: dataset.batch_size.unwrap_or(self.batch_size).max(1),
            keep_versions: dataset.keep_versions.unwrap_or(self.keep_versions).max(1),
            politeness_delay: dataset
                .politeness_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(self.politeness_delay),
            fetch_timeout: self.fetch_timeout,
        }
    }
}

/// Effective tuning for one dataset pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSettings {
    pub workers: usize,
    pub batch_size: usize,
    pub keep_versions: usize,
    pub politeness_delay: Duration,
    pub fetch_timeout: Duration,
}

impl Default for RunSettings {
    fn default() -> Self {
        SyncConfig::default().settings_for(&DatasetConfig::new(
            "default",
            "datasets/",
            NaiveDate::MIN,
        ))
    }
}

fn default_true() -> bool {
    true
}

fn default_entity_column() -> String {
    "ticker".to_string()
}

fn default_date_column() -> String {
    "date".to_string()
}

fn default_catalog_entity_column() -> String {
    "ticker".to_string()
}

/// Where the entity list for a dataset type comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CatalogConfig {
    Static {
        entities: Vec<String>,
    },
    Artifact {
        prefix: String,
        #[serde(default = "default_catalog_entity_column")]
        entity_column: String,
    },
}

/// One dataset type as declared in `datasets.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub dataset_type: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub artifact_prefix: String,
    pub default_start: NaiveDate,
    #[serde(default = "default_entity_column")]
    pub entity_column: String,
    #[serde(default = "default_date_column")]
    pub date_column: String,
    #[serde(default)]
    pub field_map: BTreeMap<String, String>,
    #[serde(default)]
    pub epoch_utc_offset_minutes: i32,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub keep_versions: Option<usize>,
    #[serde(default)]
    pub politeness_delay_ms: Option<u64>,
    #[serde(default)]
    pub source: Option<PagedSourceConfig>,
    pub catalog: CatalogConfig,
}

impl DatasetConfig {
    pub fn new(
        dataset_type: impl Into<String>,
        artifact_prefix: impl Into<String>,
        default_start: NaiveDate,
    ) -> Self {
        Self {
            dataset_type: dataset_type.into(),
            enabled: true,
            artifact_prefix: artifact_prefix.into(),
            default_start,
            entity_column: default_entity_column(),
            date_column: default_date_column(),
            field_map: BTreeMap::new(),
            epoch_utc_offset_minutes: 0,
            workers: None,
            batch_size: None,
            keep_versions: None,
            politeness_delay_ms: None,
            source: None,
            catalog: CatalogConfig::Static {
                entities: Vec::new(),
            },
        }
    }

    pub fn layout(&self) -> ColumnLayout {
        ColumnLayout {
            entity_column: self.entity_column.clone(),
            date_column: self.date_column.clone(),
        }
    }

    pub fn field_map(&self) -> Result<FieldMap, ConfigError> {
        FieldMap::new(self.field_map.clone()).map_err(|source| ConfigError::FieldMap {
            dataset: self.dataset_type.clone(),
            source,
        })
    }

    pub fn date_parser(&self) -> Result<DateParser, ConfigError> {
        DateParser::with_offset_minutes(self.epoch_utc_offset_minutes).ok_or_else(|| {
            ConfigError::InvalidOffset {
                dataset: self.dataset_type.clone(),
                minutes: self.epoch_utc_offset_minutes,
            }
        })
    }

    /// Checks that do not depend on the rest of the registry.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let name = self.dataset_type.trim();
        if name.is_empty() || name != self.dataset_type || name.contains('/') || name == "." || name == ".." {
            return Err(ConfigError::InvalidDatasetType(self.dataset_type.clone()));
        }
        if self.artifact_prefix.trim().is_empty() {
            return Err(ConfigError::EmptyArtifactPrefix(self.dataset_type.clone()));
        }
        let layout = self.layout();
        if layout.entity_column.is_empty()
            || layout.date_column.is_empty()
            || layout.entity_column == layout.date_column
        {
            return Err(ConfigError::InvalidLayout {
                dataset: self.dataset_type.clone(),
            });
        }
        for (field, value) in [
            ("workers", self.workers),
            ("batch_size", self.batch_size),
            ("keep_versions", self.keep_versions),
        ] {
            if value == Some(0) {
                return Err(ConfigError::NonPositive {
                    dataset: self.dataset_type.clone(),
                    field,
                });
            }
        }
        if let Some(source) = &self.source {
            if source.page_size == 0 {
                return Err(ConfigError::NonPositive {
                    dataset: self.dataset_type.clone(),
                    field: "source.page_size",
                });
            }
        } else if self.enabled {
            return Err(ConfigError::MissingSource(self.dataset_type.clone()));
        }
        self.field_map()?;
        self.date_parser()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetRegistry {
    pub datasets: Vec<DatasetConfig>,
}

impl DatasetRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let registry: Self = serde_yaml::from_str(text)?;
        registry.validate()?;
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("validating {}", path.display()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = BTreeSet::new();
        for dataset in &self.datasets {
            dataset.validate()?;
            if !seen.insert(dataset.dataset_type.as_str()) {
                return Err(ConfigError::DuplicateDatasetType(dataset.dataset_type.clone()));
            }
        }
        Ok(())
    }

    pub fn enabled(&self) -> impl Iterator<Item = &DatasetConfig> {
        self.datasets.iter().filter(|d| d.enabled)
    }

    pub fn get(&self, dataset_type: &str) -> Result<&DatasetConfig, ConfigError> {
        self.datasets
            .iter()
            .find(|d| d.dataset_type == dataset_type)
            .ok_or_else(|| ConfigError::UnknownDataset(dataset_type.to_string()))
    }
}
