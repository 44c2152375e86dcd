//! Source fetcher and entity catalog contracts, plus the paginated JSON
//! fetcher and catalog implementations the dataset registry can select.

use async_trait::async_trait;
use thiserror::Error;
use tsync_core::{FetchWindow, Record};
use tsync_storage::{CodecError, FetchError, ObjectStoreError};

mod catalog;
mod paged;

pub use catalog::{ArtifactCatalog, StaticCatalog};
pub use paged::{PagedJsonFetcher, PagedSourceConfig};

pub const CRATE_NAME: &str = "tsync-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Http(#[from] FetchError),
    #[error("malformed response for `{entity}`: {message}")]
    Malformed { entity: String, message: String },
    #[error(transparent)]
    Store(#[from] ObjectStoreError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Incremental retrieval of one entity's rows for one window.
///
/// Implementations may paginate internally; the engine treats each call as a
/// single work item. Every returned record must carry `entity` as its key.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, entity: &str, window: &FetchWindow) -> Result<Vec<Record>, AdapterError>;
}

/// Supplies the full list of entity keys to sync for a dataset type.
#[async_trait]
pub trait EntityCatalog: Send + Sync {
    async fn entities(&self) -> Result<Vec<String>, AdapterError>;
}
