use std::fmt;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use tsync_adapters::{EntityCatalog, SourceFetcher};
use tsync_core::{ColumnLayout, DateParser, FieldMap};
use tsync_storage::{ObjectStore, TableCodec};
use uuid::Uuid;

use crate::chunk_store::{ChunkInfo, ChunkStore};
use crate::config::{DatasetConfig, RunSettings};
use crate::coordinator::{BatchCoordinator, FetchReport};
use crate::error::{ConfigError, PipelineError};
use crate::merge::MergeEngine;
use crate::pool::FetchPool;
use crate::publisher::{ArtifactName, PublishReport, Publisher};
use crate::watermark::WatermarkResolver;

/// Lifecycle of one dataset run. `Fetching` is re-entrant across restarts;
/// a failure in `Merging` or `Publishing` leaves chunks and the old master
/// in place, which is equivalent to being back in `Fetching`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncPhase {
    Empty,
    Fetching,
    Merging,
    Publishing,
    Done,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncPhase::Empty => "EMPTY",
            SyncPhase::Fetching => "FETCHING",
            SyncPhase::Merging => "MERGING",
            SyncPhase::Publishing => "PUBLISHING",
            SyncPhase::Done => "DONE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Published(PublishReport),
    NoChange,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub dataset_type: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub today: NaiveDate,
    pub master_key: Option<String>,
    pub fetch: FetchReport,
    pub merged_rows: usize,
    pub dropped_rows: usize,
    pub superseded_rows: usize,
    pub outcome: RunOutcome,
}

impl SyncRunSummary {
    pub fn published(&self) -> Option<&PublishReport> {
        match &self.outcome {
            RunOutcome::Published(report) => Some(report),
            RunOutcome::NoChange => None,
        }
    }
}

/// Read-only view of a dataset's staging area and stored versions.
#[derive(Debug, Clone, Serialize)]
pub struct DatasetStatus {
    pub dataset_type: String,
    pub chunks: Vec<ChunkInfo>,
    /// Stored versions, oldest first; the last one is current.
    pub versions: Vec<(NaiveDate, String)>,
}

impl DatasetStatus {
    pub fn current(&self) -> Option<&(NaiveDate, String)> {
        self.versions.last()
    }
}

/// One dataset type's full sync: resolve, fetch in batches, merge, publish.
///
/// Only one pipeline per dataset type may run at a time; the chunk store and
/// the master artifact assume a single writer.
pub struct DatasetPipeline {
    dataset: DatasetConfig,
    settings: RunSettings,
    store: Arc<dyn ObjectStore>,
    catalog: Arc<dyn EntityCatalog>,
    layout: ColumnLayout,
    field_map: FieldMap,
    parser: DateParser,
    codec: TableCodec,
    naming: ArtifactName,
    chunks: ChunkStore,
    pool: FetchPool,
    run_id: Option<Uuid>,
}

impl DatasetPipeline {
    pub fn new(
        dataset: DatasetConfig,
        settings: RunSettings,
        staging_root: &Path,
        store: Arc<dyn ObjectStore>,
        catalog: Arc<dyn EntityCatalog>,
        fetcher: Arc<dyn SourceFetcher>,
    ) -> Result<Self, ConfigError> {
        let layout = dataset.layout();
        let field_map = dataset.field_map()?;
        let parser = dataset.date_parser()?;
        let codec = TableCodec::new(layout.clone());
        let naming = ArtifactName::new(&dataset.artifact_prefix, &dataset.dataset_type);
        let chunks = ChunkStore::new(staging_root, &dataset.dataset_type, codec.clone());
        let pool = FetchPool::new(
            fetcher,
            settings.workers,
            settings.politeness_delay,
            settings.fetch_timeout,
        );
        Ok(Self {
            dataset,
            settings,
            store,
            catalog,
            layout,
            field_map,
            parser,
            codec,
            naming,
            chunks,
            pool,
            run_id: None,
        })
    }

    /// Pin the run id, e.g. to share one id across every dataset of an invocation.
    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn dataset_type(&self) -> &str {
        &self.dataset.dataset_type
    }

    pub fn chunk_store(&self) -> &ChunkStore {
        &self.chunks
    }

    pub fn artifact_name(&self) -> &ArtifactName {
        &self.naming
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary, PipelineError> {
        self.run_once_at(self.parser.today()).await
    }

    pub async fn run_once_at(&self, today: NaiveDate) -> Result<SyncRunSummary, PipelineError> {
        let run_id = self.run_id.unwrap_or_else(Uuid::new_v4);
        let span = info_span!("dataset_sync", dataset = %self.dataset.dataset_type, %run_id, %today);
        self.run_inner(run_id, today).instrument(span).await
    }

    fn enter(&self, phase: SyncPhase) {
        info!(dataset = %self.dataset.dataset_type, %phase, "phase");
    }

    async fn run_inner(&self, run_id: Uuid, today: NaiveDate) -> Result<SyncRunSummary, PipelineError> {
        let started_at = Utc::now();
        self.enter(SyncPhase::Empty);

        let entities = self
            .catalog
            .entities()
            .await
            .map_err(|source| PipelineError::Catalog {
                dataset: self.dataset.dataset_type.clone(),
                source,
            })?;

        let snapshot = WatermarkResolver {
            store: self.store.as_ref(),
            naming: &self.naming,
            codec: &self.codec,
            field_map: &self.field_map,
            parser: &self.parser,
        }
        .resolve()
        .await;

        self.enter(SyncPhase::Fetching);
        let fetch = BatchCoordinator {
            dataset: &self.dataset.dataset_type,
            chunks: &self.chunks,
            pool: &self.pool,
            layout: &self.layout,
            field_map: &self.field_map,
            batch_size: self.settings.batch_size,
            default_start: self.dataset.default_start,
        }
        .run(&entities, &snapshot.watermarks, today)
        .await?;
        if !fetch.failed.is_empty() {
            warn!(
                dataset = %self.dataset.dataset_type,
                failed = fetch.failed.len(),
                entities = ?fetch.failed,
                "some entities failed and will be retried next run"
            );
        }

        let staged = self
            .chunks
            .read_all()
            .await
            .map_err(|error| PipelineError::StagingRead {
                dir: self.chunks.dir().to_path_buf(),
                error,
            })?;

        let summary = |merged_rows, dropped_rows, superseded_rows, outcome| SyncRunSummary {
            run_id,
            dataset_type: self.dataset.dataset_type.clone(),
            started_at,
            finished_at: Utc::now(),
            today,
            master_key: snapshot.key.clone(),
            fetch: fetch.clone(),
            merged_rows,
            dropped_rows,
            superseded_rows,
            outcome,
        };

        if staged.is_empty() {
            info!(dataset = %self.dataset.dataset_type, "nothing new staged; no publish");
            self.enter(SyncPhase::Done);
            return Ok(summary(0, 0, 0, RunOutcome::NoChange));
        }

        self.enter(SyncPhase::Merging);
        let merged = MergeEngine {
            layout: &self.layout,
            field_map: &self.field_map,
            parser: &self.parser,
        }
        .merge(snapshot.records.clone(), staged);

        if merged.rows.is_empty() {
            warn!(dataset = %self.dataset.dataset_type, dropped = merged.dropped, "staged rows produced an empty dataset; discarding chunks");
            if let Err(err) = self.chunks.clear().await {
                warn!(error = %format!("{err:#}"), "clearing chunk store failed");
            }
            self.enter(SyncPhase::Done);
            return Ok(summary(0, merged.dropped, merged.superseded, RunOutcome::NoChange));
        }

        self.enter(SyncPhase::Publishing);
        let report = Publisher {
            store: self.store.as_ref(),
            naming: &self.naming,
            codec: &self.codec,
            chunks: &self.chunks,
            keep_versions: self.settings.keep_versions,
        }
        .publish(&merged)
        .await?;

        self.enter(SyncPhase::Done);
        Ok(summary(
            merged.rows.len(),
            merged.dropped,
            merged.superseded,
            RunOutcome::Published(report),
        ))
    }

    pub async fn status(&self) -> Result<DatasetStatus, PipelineError> {
        let chunks = self
            .chunks
            .list()
            .await
            .map_err(|error| PipelineError::StagingRead {
                dir: self.chunks.dir().to_path_buf(),
                error,
            })?;
        let versions = self
            .naming
            .list_versions(self.store.as_ref())
            .await
            .map_err(|source| PipelineError::VersionListing {
                dataset: self.dataset.dataset_type.clone(),
                source,
            })?;
        Ok(DatasetStatus {
            dataset_type: self.dataset.dataset_type.clone(),
            chunks,
            versions,
        })
    }

    /// Drop every staged chunk for this dataset type.
    pub async fn clear_staging(&self) -> Result<(), PipelineError> {
        self.chunks
            .clear()
            .await
            .map_err(|error| PipelineError::StagingClear {
                dir: self.chunks.dir().to_path_buf(),
                error,
            })?;
        info!(dataset = %self.dataset.dataset_type, dir = %self.chunks.dir().display(), "cleared staging");
        Ok(())
    }
}
