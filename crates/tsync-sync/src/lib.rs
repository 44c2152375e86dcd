//! Incremental, resumable sync of dated per-entity records into versioned
//! Parquet artifacts.
//!
//! A run resolves per-entity watermarks from the current master artifact,
//! fetches only the missing date windows through a bounded worker pool,
//! checkpoints each batch as a local chunk, merges master and chunks with
//! last-write-wins on `(entity, date)`, and publishes a new dated version.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info};
use tsync_adapters::{ArtifactCatalog, EntityCatalog, PagedJsonFetcher, StaticCatalog};
use tsync_storage::{FsObjectStore, HttpFetcher, ObjectStore};
use uuid::Uuid;

mod chunk_store;
mod config;
mod coordinator;
mod error;
mod merge;
mod pipeline;
mod pool;
mod publisher;
mod watermark;

pub use chunk_store::{ChunkInfo, ChunkStore};
pub use config::{CatalogConfig, DatasetConfig, DatasetRegistry, RunSettings, SyncConfig};
pub use coordinator::{BatchCoordinator, FetchReport};
pub use error::{ConfigError, PipelineError};
pub use merge::{MergeEngine, MergeOutput};
pub use pipeline::{DatasetPipeline, DatasetStatus, RunOutcome, SyncPhase, SyncRunSummary};
pub use pool::{FetchOutcome, FetchPool, FetchResult, FetchTask};
pub use publisher::{ArtifactName, PublishReport, Publisher};
pub use watermark::{watermarks_of, MasterSnapshot, WatermarkResolver};

pub const CRATE_NAME: &str = "tsync-sync";

/// Run several dataset pipelines with at most `max_concurrent` in flight.
///
/// Each dataset's result is reported on its own; one failing pipeline never
/// cancels the others. Results come back in input order.
pub async fn run_all(
    pipelines: Vec<Arc<DatasetPipeline>>,
    max_concurrent: usize,
) -> Vec<(String, Result<SyncRunSummary, PipelineError>)> {
    let permits = Arc::new(Semaphore::new(max_concurrent.max(1)));
    let names: Vec<String> = pipelines.iter().map(|p| p.dataset_type().to_string()).collect();

    let mut tasks = JoinSet::new();
    for (slot, pipeline) in pipelines.into_iter().enumerate() {
        let permits = Arc::clone(&permits);
        tasks.spawn(async move {
            let result = match permits.acquire_owned().await {
                Ok(_permit) => pipeline.run_once().await,
                Err(_) => Err(PipelineError::Aborted {
                    dataset: pipeline.dataset_type().to_string(),
                    message: "concurrency limiter closed".to_string(),
                }),
            };
            (slot, result)
        });
    }

    let mut slots: BTreeMap<usize, Result<SyncRunSummary, PipelineError>> = BTreeMap::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((slot, result)) => {
                slots.insert(slot, result);
            }
            Err(err) => error!(error = %err, "dataset task panicked"),
        }
    }

    names
        .into_iter()
        .enumerate()
        .map(|(slot, dataset)| {
            let result = slots.remove(&slot).unwrap_or_else(|| {
                Err(PipelineError::Aborted {
                    dataset: dataset.clone(),
                    message: "dataset task terminated abnormally".to_string(),
                })
            });
            (dataset, result)
        })
        .collect()
}

/// Outcome of one dataset inside a multi-dataset invocation.
#[derive(Debug, Clone, Serialize)]
pub struct DatasetRunResult {
    pub dataset_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<SyncRunSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncInvocationReport {
    pub run_id: Uuid,
    pub datasets: Vec<DatasetRunResult>,
}

impl SyncInvocationReport {
    pub fn failed(&self) -> usize {
        self.datasets.iter().filter(|d| d.error.is_some()).count()
    }
}

/// Process-level wiring: the registry, one shared HTTP client and one store.
pub struct SyncEnvironment {
    config: SyncConfig,
    registry: DatasetRegistry,
    store: Arc<dyn ObjectStore>,
    http: Arc<HttpFetcher>,
    run_id: Uuid,
}

impl SyncEnvironment {
    pub fn new(config: SyncConfig, registry: DatasetRegistry, store: Arc<dyn ObjectStore>) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config()).context("building HTTP client")?;
        Ok(Self {
            config,
            registry,
            store,
            http: Arc::new(http),
            run_id: Uuid::new_v4(),
        })
    }

    pub async fn from_env() -> Result<Self> {
        let config = SyncConfig::from_env();
        let registry = DatasetRegistry::load(&config.datasets_file).await?;
        let store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(config.store_root.clone()));
        info!(
            datasets_file = %config.datasets_file.display(),
            store_root = %config.store_root.display(),
            staging_dir = %config.staging_dir.display(),
            datasets = registry.datasets.len(),
            "loaded sync environment"
        );
        Self::new(config, registry, store)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &DatasetRegistry {
        &self.registry
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    fn catalog_for(&self, dataset: &DatasetConfig) -> Arc<dyn EntityCatalog> {
        match &dataset.catalog {
            CatalogConfig::Static { entities } => Arc::new(StaticCatalog::new(entities.iter().cloned())),
            CatalogConfig::Artifact {
                prefix,
                entity_column,
            } => Arc::new(ArtifactCatalog::new(
                Arc::clone(&self.store),
                prefix.clone(),
                entity_column.clone(),
            )),
        }
    }

    pub fn pipeline_for(&self, dataset: &DatasetConfig) -> Result<DatasetPipeline, ConfigError> {
        let source = dataset
            .source
            .clone()
            .ok_or_else(|| ConfigError::MissingSource(dataset.dataset_type.clone()))?;
        let fetcher = PagedJsonFetcher::new(dataset.dataset_type.clone(), source, Arc::clone(&self.http))
            .with_run_id(self.run_id);
        let pipeline = DatasetPipeline::new(
            dataset.clone(),
            self.config.settings_for(dataset),
            &self.config.staging_dir,
            Arc::clone(&self.store),
            self.catalog_for(dataset),
            Arc::new(fetcher),
        )?;
        Ok(pipeline.with_run_id(self.run_id))
    }

    /// Pipelines for every enabled dataset, or just the named one.
    pub fn pipelines(&self, only: Option<&str>) -> Result<Vec<DatasetPipeline>, ConfigError> {
        match only {
            Some(name) => Ok(vec![self.pipeline_for(self.registry.get(name)?)?]),
            None => self
                .registry
                .enabled()
                .map(|dataset| self.pipeline_for(dataset))
                .collect(),
        }
    }

    pub async fn sync(&self, only: Option<&str>) -> Result<SyncInvocationReport> {
        let pipelines = self
            .pipelines(only)?
            .into_iter()
            .map(Arc::new)
            .collect::<Vec<_>>();
        info!(run_id = %self.run_id, datasets = pipelines.len(), "starting sync");

        let results = run_all(pipelines, self.config.max_concurrent_datasets).await;
        let datasets = results
            .into_iter()
            .map(|(dataset_type, result)| match result {
                Ok(summary) => DatasetRunResult {
                    dataset_type,
                    summary: Some(summary),
                    error: None,
                },
                Err(err) => {
                    error!(dataset = %dataset_type, error = %err, "dataset sync failed");
                    DatasetRunResult {
                        dataset_type,
                        summary: None,
                        error: Some(err.to_string()),
                    }
                }
            })
            .collect();
        Ok(SyncInvocationReport {
            run_id: self.run_id,
            datasets,
        })
    }

    pub async fn status(&self, only: Option<&str>) -> Result<Vec<DatasetStatus>> {
        let mut statuses = Vec::new();
        for pipeline in self.pipelines(only)? {
            statuses.push(pipeline.status().await?);
        }
        Ok(statuses)
    }

    pub async fn clear_staging(&self, dataset_type: &str) -> Result<()> {
        let pipeline = self.pipeline_for(self.registry.get(dataset_type)?)?;
        pipeline.clear_staging().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tsync_storage::MemoryObjectStore;

    const REGISTRY: &str = r#"
datasets:
  - dataset_type: proprietary
    artifact_prefix: vn/
    default_start: 2024-01-01
    field_map: { Ngay: date, Symbol: ticker }
    source: { url: "http://127.0.0.1:9/proprietary" }
    catalog: { kind: static, entities: [AAA, BBB] }
  - dataset_type: insider
    enabled: false
    artifact_prefix: vn/
    default_start: 2024-01-01
    catalog: { kind: artifact, prefix: vn/prices_ }
"#;

    fn environment(staging: &std::path::Path) -> SyncEnvironment {
        let registry = DatasetRegistry::from_yaml_str(REGISTRY).expect("registry");
        let config = SyncConfig {
            staging_dir: staging.to_path_buf(),
            ..SyncConfig::default()
        };
        SyncEnvironment::new(config, registry, Arc::new(MemoryObjectStore::new())).expect("env")
    }

    #[test]
    fn only_enabled_datasets_with_a_source_get_pipelines() {
        let staging = tempdir().expect("tempdir");
        let env = environment(staging.path());
        let pipelines = env.pipelines(None).expect("pipelines");
        assert_eq!(pipelines.len(), 1);
        assert_eq!(pipelines[0].dataset_type(), "proprietary");
        assert!(pipelines[0].chunk_store().dir().ends_with("proprietary"));

        assert!(matches!(
            env.pipelines(Some("insider")),
            Err(ConfigError::MissingSource(name)) if name == "insider"
        ));
        assert!(matches!(env.pipelines(Some("nope")), Err(ConfigError::UnknownDataset(_))));
    }

    #[tokio::test]
    async fn status_of_a_fresh_environment_is_empty() {
        let staging = tempdir().expect("tempdir");
        let env = environment(staging.path());
        let statuses = env.status(None).await.expect("status");
        assert_eq!(statuses.len(), 1);
        assert!(statuses[0].chunks.is_empty());
        assert!(statuses[0].current().is_none());

        env.clear_staging("proprietary").await.expect("clear");
    }
}
