use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("invalid object key `{0}`")]
    InvalidKey(String),
    #[error("io error on `{key}`: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("object store backend error: {0}")]
    Backend(String),
}

/// The four S3-style operations the resolver and publisher rely on.
///
/// `list` returns keys in lexical order. `delete` of a missing key succeeds.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError>;
    async fn get(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError>;
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), ObjectStoreError>;
    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError>;
}

/// Object store backed by a local directory; keys map to relative paths.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, ObjectStoreError> {
        if key.is_empty() || key.ends_with('/') {
            return Err(ObjectStoreError::InvalidKey(key.to_string()));
        }
        let relative = Path::new(key);
        let clean = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !clean {
            return Err(ObjectStoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }

    fn io_err(key: &str, source: std::io::Error) -> ObjectStoreError {
        if source.kind() == std::io::ErrorKind::NotFound {
            ObjectStoreError::NotFound(key.to_string())
        } else {
            ObjectStoreError::Io {
                key: key.to_string(),
                source,
            }
        }
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        let mut keys = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(Self::io_err(&dir.display().to_string(), err)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|err| Self::io_err(&dir.display().to_string(), err))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|err| Self::io_err(&path.display().to_string(), err))?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                if entry.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError> {
        let path = self.path_for(key)?;
        fs::read(&path).await.map_err(|err| Self::io_err(key, err))
    }

    /// Write through a temp file in the target directory and rename it into place.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), ObjectStoreError> {
        let path = self.path_for(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| ObjectStoreError::InvalidKey(key.to_string()))?
            .to_path_buf();
        fs::create_dir_all(&parent)
            .await
            .map_err(|err| Self::io_err(key, err))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let write = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await?;
            file.write_all(&bytes).await?;
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp_path, &path).await
        };

        match write.await {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(ObjectStoreError::Io {
                    key: key.to_string(),
                    source: err,
                })
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Self::io_err(key, err)),
        }
    }
}

/// In-process object store, used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        let objects = self.objects.lock().await;
        Ok(objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError> {
        let objects = self.objects.lock().await;
        objects
            .get(key)
            .cloned()
            .ok_or_else(|| ObjectStoreError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), ObjectStoreError> {
        if key.is_empty() || key.ends_with('/') {
            return Err(ObjectStoreError::InvalidKey(key.to_string()));
        }
        self.objects.lock().await.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        self.objects.lock().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn fs_store_round_trips_and_lists_by_prefix() {
        let dir = tempdir().expect("tempdir");
        let store = FsObjectStore::new(dir.path());

        store
            .put("prices/prices_20240115.parquet", b"one".to_vec())
            .await
            .expect("put");
        store
            .put("prices/prices_20240110.parquet", b"two".to_vec())
            .await
            .expect("put");
        store.put("other/x.parquet", b"three".to_vec()).await.expect("put");

        let keys = store.list("prices/").await.expect("list");
        assert_eq!(
            keys,
            vec![
                "prices/prices_20240110.parquet".to_string(),
                "prices/prices_20240115.parquet".to_string(),
            ]
        );
        assert_eq!(
            store.get("prices/prices_20240115.parquet").await.expect("get"),
            b"one"
        );
    }

    #[tokio::test]
    async fn fs_store_overwrites_atomically_and_leaves_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let store = FsObjectStore::new(dir.path());
        store.put("a/b.bin", b"first".to_vec()).await.expect("put");
        store.put("a/b.bin", b"second".to_vec()).await.expect("put");

        assert_eq!(store.get("a/b.bin").await.expect("get"), b"second");
        let names: Vec<_> = std::fs::read_dir(dir.path().join("a"))
            .expect("read_dir")
            .map(|e| e.expect("entry").file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }

    #[tokio::test]
    async fn fs_store_missing_and_invalid_keys() {
        let dir = tempdir().expect("tempdir");
        let store = FsObjectStore::new(dir.path().join("not-yet-created"));

        assert!(store.list("").await.expect("list").is_empty());
        assert!(matches!(
            store.get("nope.parquet").await,
            Err(ObjectStoreError::NotFound(_))
        ));
        store.delete("nope.parquet").await.expect("delete missing is ok");
        assert!(matches!(
            store.put("../escape", Vec::new()).await,
            Err(ObjectStoreError::InvalidKey(_))
        ));
        assert!(matches!(
            store.put("folder/", Vec::new()).await,
            Err(ObjectStoreError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn memory_store_behaves_like_a_bucket() {
        let store = MemoryObjectStore::new();
        store.put("p/b", vec![2]).await.expect("put");
        store.put("p/a", vec![1]).await.expect("put");
        store.put("q/c", vec![3]).await.expect("put");
        assert_eq!(store.list("p/").await.expect("list"), vec!["p/a", "p/b"]);
        store.delete("p/a").await.expect("delete");
        assert!(matches!(store.get("p/a").await, Err(ObjectStoreError::NotFound(_))));
    }
}
