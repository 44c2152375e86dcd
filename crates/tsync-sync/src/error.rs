use std::path::PathBuf;

use thiserror::Error;
use tsync_adapters::AdapterError;
use tsync_core::FieldMapError;
use tsync_storage::ObjectStoreError;

/// Registry problems found at startup, before any work starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("parsing dataset registry: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("dataset type must be a non-empty name without `/`, got `{0}`")]
    InvalidDatasetType(String),
    #[error("dataset type `{0}` is declared more than once")]
    DuplicateDatasetType(String),
    #[error("dataset `{0}` has an empty artifact_prefix")]
    EmptyArtifactPrefix(String),
    #[error("dataset `{dataset}`: `{field}` must be positive")]
    NonPositive { dataset: String, field: &'static str },
    #[error("dataset `{dataset}`: invalid field_map: {source}")]
    FieldMap {
        dataset: String,
        #[source]
        source: FieldMapError,
    },
    #[error("dataset `{dataset}`: epoch_utc_offset_minutes {minutes} is out of range")]
    InvalidOffset { dataset: String, minutes: i32 },
    #[error("dataset `{dataset}`: entity_column and date_column must differ and be non-empty")]
    InvalidLayout { dataset: String },
    #[error("dataset `{0}` is enabled but has no source block")]
    MissingSource(String),
    #[error("unknown dataset type `{0}`")]
    UnknownDataset(String),
}

/// Fatal failures of one dataset pipeline run. Everything else (per-entity
/// fetch failures, bad rows, an unreadable master) is recovered and logged.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("entity catalog for `{dataset}` failed: {source}")]
    Catalog {
        dataset: String,
        #[source]
        source: AdapterError,
    },
    #[error("writing chunk under {} failed: {error:#}", .dir.display())]
    ChunkWrite { dir: PathBuf, error: anyhow::Error },
    #[error("reading staged chunks under {} failed: {error:#}", .dir.display())]
    StagingRead { dir: PathBuf, error: anyhow::Error },
    #[error("clearing staged chunks under {} failed: {error:#}", .dir.display())]
    StagingClear { dir: PathBuf, error: anyhow::Error },
    #[error("listing stored versions of `{dataset}` failed: {source}")]
    VersionListing {
        dataset: String,
        #[source]
        source: ObjectStoreError,
    },
    #[error("publishing `{key}` failed: {error:#}")]
    Publish { key: String, error: anyhow::Error },
    #[error("dataset pipeline `{dataset}` aborted: {message}")]
    Aborted { dataset: String, message: String },
}
