use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tsync_core::Record;
use tsync_storage::TableCodec;
use uuid::Uuid;

const CHUNK_PREFIX: &str = "chunk_";
const CHUNK_EXT: &str = ".parquet";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkInfo {
    pub index: u32,
    pub path: PathBuf,
    pub entities: BTreeSet<String>,
    pub rows: usize,
}

/// Local staging directory `<staging_root>/<dataset_type>/` holding one
/// Parquet file per completed batch, named `chunk_NNNNNN.parquet`.
///
/// Chunks are append-only: a new chunk always takes the next free index and
/// an existing file is never rewritten. Only `clear` removes them.
#[derive(Debug, Clone)]
pub struct ChunkStore {
    dir: PathBuf,
    codec: TableCodec,
}

impl ChunkStore {
    pub fn new(staging_root: &Path, dataset_type: &str, codec: TableCodec) -> Self {
        Self {
            dir: staging_root.join(dataset_type),
            codec,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn chunk_path(&self, index: u32) -> PathBuf {
        self.dir.join(format!("{CHUNK_PREFIX}{index:06}{CHUNK_EXT}"))
    }

    fn parse_index(name: &str) -> Option<u32> {
        let digits = name.strip_prefix(CHUNK_PREFIX)?.strip_suffix(CHUNK_EXT)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }

    /// Chunk files on disk in index order. Directories and temp files are ignored.
    pub async fn chunk_paths(&self) -> Result<Vec<(u32, PathBuf)>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", self.dir.display()))
            }
        };

        let mut chunks = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("reading {}", self.dir.display()))?
        {
            let file_type = entry
                .file_type()
                .await
                .with_context(|| format!("inspecting {}", entry.path().display()))?;
            if !file_type.is_file() {
                continue;
            }
            if let Some(index) = Self::parse_index(&entry.file_name().to_string_lossy()) {
                chunks.push((index, entry.path()));
            }
        }
        chunks.sort();
        Ok(chunks)
    }

    async fn read_chunk(&self, path: &Path) -> Result<Vec<Record>> {
        let bytes = fs::read(path)
            .await
            .with_context(|| format!("reading chunk {}", path.display()))?;
        self.codec
            .decode_records(bytes)
            .with_context(|| format!("decoding chunk {}", path.display()))
    }

    /// Every chunk's records, in index order.
    pub async fn read_all(&self) -> Result<Vec<(u32, Vec<Record>)>> {
        let mut chunks = Vec::new();
        for (index, path) in self.chunk_paths().await? {
            chunks.push((index, self.read_chunk(&path).await?));
        }
        Ok(chunks)
    }

    pub async fn list(&self) -> Result<Vec<ChunkInfo>> {
        let mut infos = Vec::new();
        for (index, path) in self.chunk_paths().await? {
            let records = self.read_chunk(&path).await?;
            infos.push(ChunkInfo {
                index,
                entities: records.iter().map(|r| r.entity.clone()).collect(),
                rows: records.len(),
                path,
            });
        }
        Ok(infos)
    }

    /// Entities already staged by earlier batches, from a scan of the chunk files.
    pub async fn covered_entities(&self) -> Result<BTreeSet<String>> {
        let mut covered = BTreeSet::new();
        for (_, path) in self.chunk_paths().await? {
            let bytes = fs::read(&path)
                .await
                .with_context(|| format!("reading chunk {}", path.display()))?;
            covered.extend(
                self.codec
                    .read_entities(bytes)
                    .with_context(|| format!("decoding chunk {}", path.display()))?,
            );
        }
        Ok(covered)
    }

    /// Persist one batch as the next chunk, via temp file and rename.
    pub async fn write_chunk(&self, records: &[Record]) -> Result<ChunkInfo> {
        if records.is_empty() {
            bail!("refusing to write an empty chunk");
        }
        let index = self
            .chunk_paths()
            .await?
            .last()
            .map_or(1, |(index, _)| index + 1);
        let path = self.chunk_path(index);

        let bytes = self
            .codec
            .encode_records(records)
            .with_context(|| format!("encoding chunk {}", path.display()))?;

        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating {}", self.dir.display()))?;
        if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            bail!("chunk path {} is already taken", path.display());
        }

        let temp_path = self.dir.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
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
        if let Err(err) = write.await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| format!("writing chunk {}", path.display()));
        }

        Ok(ChunkInfo {
            index,
            entities: records.iter().map(|r| r.entity.clone()).collect(),
            rows: records.len(),
            path,
        })
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.chunk_paths().await?.is_empty())
    }

    /// Remove the whole staging directory for this dataset type.
    pub async fn clear(&self) -> Result<()> {
        match fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("removing {}", self.dir.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tsync_core::{ColumnLayout, FieldValue};

    fn store(root: &Path) -> ChunkStore {
        ChunkStore::new(root, "prices", TableCodec::new(ColumnLayout::default()))
    }

    fn records(entities: &[&str]) -> Vec<Record> {
        entities
            .iter()
            .map(|e| Record::new(*e).with_field("ngay", FieldValue::Text("15/01/2024".into())))
            .collect()
    }

    #[tokio::test]
    async fn chunks_append_with_increasing_indexes() {
        let dir = tempdir().expect("tempdir");
        let chunks = store(dir.path());
        assert!(chunks.is_empty().await.expect("empty"));

        let first = chunks.write_chunk(&records(&["AAA", "BBB"])).await.expect("first");
        let second = chunks.write_chunk(&records(&["CCC"])).await.expect("second");
        assert_eq!(first.index, 1);
        assert_eq!(second.index, 2);
        assert!(second.path.ends_with("prices/chunk_000002.parquet"));

        let covered = chunks.covered_entities().await.expect("covered");
        assert_eq!(covered.into_iter().collect::<Vec<_>>(), vec!["AAA", "BBB", "CCC"]);

        let all = chunks.read_all().await.expect("read");
        assert_eq!(all.iter().map(|(i, r)| (*i, r.len())).collect::<Vec<_>>(), vec![(1, 2), (2, 1)]);
    }

    #[tokio::test]
    async fn scan_ignores_directories_temp_files_and_strangers() {
        let dir = tempdir().expect("tempdir");
        let chunks = store(dir.path());
        chunks.write_chunk(&records(&["AAA"])).await.expect("write");
        std::fs::write(chunks.dir().join(".abc.10.tmp"), b"partial").expect("temp");
        std::fs::write(chunks.dir().join("notes.txt"), b"hi").expect("stranger");
        std::fs::create_dir(chunks.dir().join("chunk_000009.parquet")).expect("dir");

        let infos = chunks.list().await.expect("list");
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].rows, 1);
    }

    #[tokio::test]
    async fn occupied_chunk_path_fails_the_write() {
        let dir = tempdir().expect("tempdir");
        let chunks = store(dir.path());
        chunks.write_chunk(&records(&["AAA"])).await.expect("write");
        std::fs::create_dir_all(chunks.dir().join("chunk_000002.parquet/blocker")).expect("dir");

        assert!(chunks.write_chunk(&records(&["BBB"])).await.is_err());
        assert_eq!(chunks.chunk_paths().await.expect("paths").len(), 1);
        let leftovers: Vec<_> = std::fs::read_dir(chunks.dir())
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn clear_removes_everything_and_tolerates_absence() {
        let dir = tempdir().expect("tempdir");
        let chunks = store(dir.path());
        chunks.clear().await.expect("clear missing");
        chunks.write_chunk(&records(&["AAA"])).await.expect("write");
        chunks.clear().await.expect("clear");
        assert!(!chunks.dir().exists());
        assert!(chunks.covered_entities().await.expect("covered").is_empty());
    }
}
