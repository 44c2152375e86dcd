use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{info, warn};
use tsync_core::{ColumnLayout, FetchWindow, FieldMap, Record};

use crate::chunk_store::{ChunkInfo, ChunkStore};
use crate::error::PipelineError;
use crate::pool::{FetchOutcome, FetchPool, FetchTask};

/// Counters for the fetch phase of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FetchReport {
    pub entities_total: usize,
    pub batches: usize,
    pub skipped_up_to_date: usize,
    pub skipped_staged: usize,
    pub fetched_with_rows: usize,
    pub fetched_empty: usize,
    pub failed: Vec<String>,
    pub chunks_written: Vec<u32>,
    pub rows_staged: usize,
}

/// Drives the fetch pool batch by batch and checkpoints each batch as a chunk.
pub struct BatchCoordinator<'a> {
    pub dataset: &'a str,
    pub chunks: &'a ChunkStore,
    pub pool: &'a FetchPool,
    pub layout: &'a ColumnLayout,
    pub field_map: &'a FieldMap,
    pub batch_size: usize,
    pub default_start: NaiveDate,
}

impl BatchCoordinator<'_> {
    /// Batches are cut from the full entity list in its given order, so a
    /// restarted run sees the same boundaries. Entities already present in a
    /// chunk are dropped from their batch before anything is fetched.
    pub async fn run(
        &self,
        entities: &[String],
        watermarks: &BTreeMap<String, NaiveDate>,
        today: NaiveDate,
    ) -> Result<FetchReport, PipelineError> {
        let staged = self
            .chunks
            .covered_entities()
            .await
            .map_err(|error| PipelineError::StagingRead {
                dir: self.chunks.dir().to_path_buf(),
                error,
            })?;
        if !staged.is_empty() {
            info!(dataset = self.dataset, staged = staged.len(), "resuming from staged chunks");
        }

        let mut report = FetchReport {
            entities_total: entities.len(),
            ..FetchReport::default()
        };
        let batch_size = self.batch_size.max(1);

        for (batch_no, batch) in entities.chunks(batch_size).enumerate() {
            report.batches += 1;
            let tasks = self.plan_batch(batch, &staged, watermarks, today, &mut report);
            if tasks.is_empty() {
                continue;
            }

            let planned = tasks.len();
            let results = self.pool.run(tasks).await;
            let mut records: Vec<Record> = Vec::new();
            for result in results {
                match result.outcome {
                    FetchOutcome::Rows(rows) => {
                        report.fetched_with_rows += 1;
                        records.extend(
                            rows.into_iter()
                                .map(|r| self.field_map.normalize(r, self.layout)),
                        );
                    }
                    FetchOutcome::Empty => report.fetched_empty += 1,
                    FetchOutcome::Failed(_) => report.failed.push(result.entity),
                }
            }

            if records.is_empty() {
                info!(dataset = self.dataset, batch = batch_no + 1, planned, "batch returned no rows; no chunk written");
                continue;
            }

            records.sort_by(|a, b| a.entity.cmp(&b.entity));
            let info = self.write_chunk(&records).await?;
            report.rows_staged += info.rows;
            report.chunks_written.push(info.index);
            info!(
                dataset = self.dataset,
                batch = batch_no + 1,
                planned,
                chunk = info.index,
                entities = info.entities.len(),
                rows = info.rows,
                "batch checkpointed"
            );
        }

        report.failed.sort();
        Ok(report)
    }

    fn plan_batch(
        &self,
        batch: &[String],
        staged: &BTreeSet<String>,
        watermarks: &BTreeMap<String, NaiveDate>,
        today: NaiveDate,
        report: &mut FetchReport,
    ) -> Vec<FetchTask> {
        let mut tasks = Vec::with_capacity(batch.len());
        for entity in batch {
            if staged.contains(entity) {
                report.skipped_staged += 1;
                continue;
            }
            let watermark = watermarks.get(entity).copied();
            match FetchWindow::plan(watermark, self.default_start, today) {
                Some(window) => tasks.push(FetchTask {
                    entity: entity.clone(),
                    window,
                }),
                None => report.skipped_up_to_date += 1,
            }
        }
        tasks
    }

    async fn write_chunk(&self, records: &[Record]) -> Result<ChunkInfo, PipelineError> {
        self.chunks.write_chunk(records).await.map_err(|error| {
            warn!(dataset = self.dataset, dir = %self.chunks.dir().display(), error = %format!("{error:#}"), "chunk write failed; aborting run");
            PipelineError::ChunkWrite {
                dir: self.chunks.dir().to_path_buf(),
                error,
            }
        })
    }
}
