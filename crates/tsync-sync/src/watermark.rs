use std::collections::BTreeMap;

use chrono::NaiveDate;
use tracing::{info, warn};
use tsync_core::{ColumnLayout, DateParser, FieldMap, Record};
use tsync_storage::{ObjectStore, TableCodec};

use crate::publisher::ArtifactName;

/// The current master artifact as seen at the start of a run.
#[derive(Debug, Clone, Default)]
pub struct MasterSnapshot {
    pub key: Option<String>,
    pub version: Option<NaiveDate>,
    /// Field-normalized master records, in artifact order.
    pub records: Vec<Record>,
    pub watermarks: BTreeMap<String, NaiveDate>,
}

impl MasterSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn watermark(&self, entity: &str) -> Option<NaiveDate> {
        self.watermarks.get(entity).copied()
    }
}

/// Loads the current master and derives per-entity watermarks from it.
///
/// Never fails: a missing, empty, undecodable or structurally broken master
/// yields an empty snapshot so the run starts fresh.
pub struct WatermarkResolver<'a> {
    pub store: &'a dyn ObjectStore,
    pub naming: &'a ArtifactName,
    pub codec: &'a TableCodec,
    pub field_map: &'a FieldMap,
    pub parser: &'a DateParser,
}

impl WatermarkResolver<'_> {
    pub async fn resolve(&self) -> MasterSnapshot {
        let versions = match self.naming.list_versions(self.store).await {
            Ok(versions) => versions,
            Err(err) => {
                warn!(prefix = %self.naming.list_prefix(), error = %err, "listing master artifacts failed; starting fresh");
                return MasterSnapshot::empty();
            }
        };
        let Some((version, key)) = versions.into_iter().next_back() else {
            info!(prefix = %self.naming.list_prefix(), "no master artifact yet");
            return MasterSnapshot::empty();
        };

        let bytes = match self.store.get(&key).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(%key, error = %err, "master artifact unreadable; starting fresh");
                return MasterSnapshot::empty();
            }
        };
        if bytes.is_empty() {
            warn!(%key, "master artifact is empty; starting fresh");
            return MasterSnapshot::empty();
        }

        let records = match self.codec.decode_records(bytes) {
            Ok(records) => records,
            Err(err) => {
                warn!(%key, error = %err, "master artifact undecodable; starting fresh");
                return MasterSnapshot::empty();
            }
        };

        let layout = self.codec.layout();
        let records: Vec<Record> = records
            .into_iter()
            .map(|r| self.field_map.normalize(r, layout))
            .collect();
        if !records.is_empty()
            && !records
                .iter()
                .any(|r| r.fields.contains_key(&layout.date_column))
        {
            warn!(%key, date_column = %layout.date_column, "master artifact has no date column; starting fresh");
            return MasterSnapshot::empty();
        }

        let watermarks = watermarks_of(&records, layout, self.parser);
        info!(
            %key,
            %version,
            rows = records.len(),
            entities = watermarks.len(),
            "resolved watermarks from master"
        );
        MasterSnapshot {
            key: Some(key),
            version: Some(version),
            records,
            watermarks,
        }
    }
}

/// Latest parseable date per entity.
pub fn watermarks_of(
    records: &[Record],
    layout: &ColumnLayout,
    parser: &DateParser,
) -> BTreeMap<String, NaiveDate> {
    let mut watermarks: BTreeMap<String, NaiveDate> = BTreeMap::new();
    for record in records {
        let Some(date) = record
            .fields
            .get(&layout.date_column)
            .and_then(|v| parser.parse(v).date())
        else {
            continue;
        };
        watermarks
            .entry(record.entity.clone())
            .and_modify(|w| *w = (*w).max(date))
            .or_insert(date);
    }
    watermarks
}
