use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;
use tsync_core::{parse_artifact_version, ColumnLayout};
use tsync_storage::{ObjectStore, TableCodec};

use crate::{AdapterError, EntityCatalog};

/// A fixed entity list from the registry. Keys are trimmed, de-duplicated and
/// sorted so batch boundaries stay stable across restarts.
#[derive(Debug, Clone)]
pub struct StaticCatalog {
    entities: Vec<String>,
}

impl StaticCatalog {
    pub fn new<I, S>(entities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entities: BTreeSet<String> = entities
            .into_iter()
            .map(|e| e.into().trim().to_string())
            .filter(|e| !e.is_empty())
            .collect();
        Self {
            entities: entities.into_iter().collect(),
        }
    }
}

#[async_trait]
impl EntityCatalog for StaticCatalog {
    async fn entities(&self) -> Result<Vec<String>, AdapterError> {
        Ok(self.entities.clone())
    }
}

/// Entity list read from the newest dated reference artifact under a prefix,
/// e.g. the latest daily price file.
pub struct ArtifactCatalog {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    codec: TableCodec,
}

impl ArtifactCatalog {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>, entity_column: impl Into<String>) -> Self {
        let layout = ColumnLayout {
            entity_column: entity_column.into(),
            ..ColumnLayout::default()
        };
        Self {
            store,
            prefix: prefix.into(),
            codec: TableCodec::new(layout),
        }
    }

    async fn newest_key(&self) -> Result<String, AdapterError> {
        let keys = self.store.list(&self.prefix).await?;
        keys.into_iter()
            .filter(|key| key.ends_with(".parquet"))
            .filter_map(|key| parse_artifact_version(&key).map(|version| (version, key)))
            .max()
            .map(|(_, key)| key)
            .ok_or_else(|| {
                AdapterError::Message(format!("no dated reference artifact under `{}`", self.prefix))
            })
    }
}

#[async_trait]
impl EntityCatalog for ArtifactCatalog {
    async fn entities(&self) -> Result<Vec<String>, AdapterError> {
        let key = self.newest_key().await?;
        let bytes = self.store.get(&key).await?;
        let entities: Vec<String> = self
            .codec
            .read_entities(bytes)?
            .into_iter()
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        info!(reference = %key, entities = entities.len(), "loaded entity catalog");
        Ok(entities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tsync_core::{FieldValue, Record};
    use tsync_storage::MemoryObjectStore;

    #[tokio::test]
    async fn static_catalog_is_sorted_and_unique() {
        let catalog = StaticCatalog::new(["BBB", "AAA", " BBB ", ""]);
        assert_eq!(catalog.entities().await.expect("entities"), vec!["AAA", "BBB"]);
    }

    #[tokio::test]
    async fn artifact_catalog_reads_newest_reference() {
        let store = Arc::new(MemoryObjectStore::new());
        let codec = TableCodec::new(ColumnLayout::default());
        let old = codec
            .encode_records(&[Record::new("OLD").with_field("close", FieldValue::Int(1))])
            .expect("encode");
        let new = codec
            .encode_records(&[
                Record::new("VNM").with_field("close", FieldValue::Int(1)),
                Record::new("AAA").with_field("close", FieldValue::Int(2)),
                Record::new("VNM").with_field("close", FieldValue::Int(3)),
            ])
            .expect("encode");
        store.put("ref/prices_20240110.parquet", old).await.expect("put");
        store.put("ref/prices_150124.parquet", new).await.expect("put");
        store.put("ref/notes.txt", b"x".to_vec()).await.expect("put");

        let catalog = ArtifactCatalog::new(store, "ref/", "ticker");
        assert_eq!(catalog.entities().await.expect("entities"), vec!["AAA", "VNM"]);
    }

    #[tokio::test]
    async fn artifact_catalog_without_reference_is_an_error() {
        let store = Arc::new(MemoryObjectStore::new());
        let catalog = ArtifactCatalog::new(store, "ref/", "ticker");
        assert!(matches!(catalog.entities().await, Err(AdapterError::Message(_))));
    }
}
