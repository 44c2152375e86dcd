use chrono::NaiveDate;
use serde::Serialize;
use tracing::{info, warn};
use tsync_core::parse_artifact_version;
use tsync_storage::{sha256_hex, ObjectStore, ObjectStoreError, TableCodec};

use crate::chunk_store::ChunkStore;
use crate::error::PipelineError;
use crate::merge::MergeOutput;

const ARTIFACT_EXT: &str = ".parquet";

/// Naming scheme `<prefix><dataset_type>_<YYYYMMDD>.parquet`.
///
/// The fixed-width version makes lexical order match chronological order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactName {
    prefix: String,
    dataset_type: String,
}

impl ArtifactName {
    pub fn new(prefix: impl Into<String>, dataset_type: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            dataset_type: dataset_type.into(),
        }
    }

    pub fn list_prefix(&self) -> String {
        format!("{}{}_", self.prefix, self.dataset_type)
    }

    pub fn key(&self, version: NaiveDate) -> String {
        format!("{}{}{ARTIFACT_EXT}", self.list_prefix(), version.format("%Y%m%d"))
    }

    /// Version of `key` if it is one of this dataset's artifacts. Keys of
    /// other dataset types sharing the prefix (`prices_adj_...`) do not match.
    pub fn parse(&self, key: &str) -> Option<NaiveDate> {
        let list_prefix = self.list_prefix();
        let suffix = key.strip_prefix(&list_prefix)?.strip_suffix(ARTIFACT_EXT)?;
        if !suffix.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        parse_artifact_version(key)
    }

    /// All versions present in the store, oldest first.
    pub async fn list_versions(
        &self,
        store: &dyn ObjectStore,
    ) -> Result<Vec<(NaiveDate, String)>, ObjectStoreError> {
        let mut versions: Vec<(NaiveDate, String)> = store
            .list(&self.list_prefix())
            .await?
            .into_iter()
            .filter_map(|key| self.parse(&key).map(|version| (version, key)))
            .collect();
        versions.sort();
        Ok(versions)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    pub key: String,
    pub version: NaiveDate,
    pub sha256: String,
    pub bytes: usize,
    pub pruned: Vec<String>,
    pub prune_failures: Vec<String>,
}

/// Uploads a merged dataset, retires whatever would otherwise stay current,
/// prunes versions beyond the keep-count, then clears the chunk store.
pub struct Publisher<'a> {
    pub store: &'a dyn ObjectStore,
    pub naming: &'a ArtifactName,
    pub codec: &'a TableCodec,
    pub chunks: &'a ChunkStore,
    /// Versions kept after a publish, counting the new one.
    pub keep_versions: usize,
}

impl Publisher<'_> {
    /// `merged` must be non-empty; its maximum date names the new version.
    pub async fn publish(&self, merged: &MergeOutput) -> Result<PublishReport, PipelineError> {
        let Some(version) = merged.max_date else {
            return Err(PipelineError::Publish {
                key: self.naming.list_prefix(),
                error: anyhow::anyhow!("merged dataset is empty"),
            });
        };
        let key = self.naming.key(version);

        let bytes = self
            .codec
            .encode_rows(&merged.rows)
            .map_err(|err| PipelineError::Publish {
                key: key.clone(),
                error: anyhow::Error::new(err).context("encoding merged rows"),
            })?;
        let sha256 = sha256_hex(&bytes);
        let size = bytes.len();

        self.store
            .put(&key, bytes)
            .await
            .map_err(|err| PipelineError::Publish {
                key: key.clone(),
                error: anyhow::Error::new(err).context("uploading artifact"),
            })?;
        info!(%key, %version, bytes = size, rows = merged.rows.len(), %sha256, "published artifact");

        let (pruned, prune_failures) = self.prune(&key, version).await;

        if let Err(err) = self.chunks.clear().await {
            warn!(dir = %self.chunks.dir().display(), error = %format!("{err:#}"), "clearing chunk store after publish failed");
        }

        Ok(PublishReport {
            key,
            version,
            sha256,
            bytes: size,
            pruned,
            prune_failures,
        })
    }

    /// Retire every version dated after the new one, since it would stay
    /// current and shadow this publish, then delete older versions beyond the
    /// keep-count, oldest first. Failures only warn: the new version is
    /// already durable.
    async fn prune(&self, new_key: &str, new_version: NaiveDate) -> (Vec<String>, Vec<String>) {
        let versions = match self.naming.list_versions(self.store).await {
            Ok(versions) => versions,
            Err(err) => {
                warn!(prefix = %self.naming.list_prefix(), error = %err, "listing versions for retention failed");
                return (Vec::new(), Vec::new());
            }
        };

        let (newer, older): (Vec<_>, Vec<_>) = versions
            .into_iter()
            .filter(|(_, key)| key != new_key)
            .partition(|(version, _)| *version > new_version);
        let keep_older = self.keep_versions.saturating_sub(1);
        let excess = older.len().saturating_sub(keep_older);

        let doomed = newer
            .into_iter()
            .map(|(version, key)| (key, Some(version)))
            .chain(older.into_iter().take(excess).map(|(_, key)| (key, None)));

        let mut pruned = Vec::new();
        let mut failures = Vec::new();
        for (key, shadowing) in doomed {
            match self.store.delete(&key).await {
                Ok(()) => {
                    match shadowing {
                        Some(version) => info!(%key, %version, "retired artifact dated after the new version"),
                        None => info!(%key, "pruned old artifact"),
                    }
                    pruned.push(key);
                }
                Err(err) => {
                    warn!(%key, error = %err, "pruning old artifact failed");
                    failures.push(key);
                }
            }
        }
        (pruned, failures)
    }
}
