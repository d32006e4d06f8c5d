//! On-disk [`VectorStore`]: one checksummed segment file per
//! `(resource, generation)` under `segments/<resource_id>/<generation>.seg`.
//!
//! Sealing writes to a temporary file and renames it into place, so a
//! reader sees either the whole segment or none of it. Decoded segments are
//! cached in memory; segment files are immutable once sealed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use resource_index_core::store::segment::{decode, encode};
use resource_index_core::store::{
    rank_entries, ScoredChunk, SegmentBuilder, SegmentEntry, StoreError, VectorStore,
};

type SegmentKey = (String, i64);

pub struct FileVectorStore {
    root: PathBuf,
    cache: RwLock<HashMap<SegmentKey, Arc<Vec<SegmentEntry>>>>,
}

impl FileVectorStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resource_dir(&self, resource_id: &str) -> PathBuf {
        self.root.join(resource_id)
    }

    fn segment_path(&self, resource_id: &str, generation: i64) -> PathBuf {
        self.resource_dir(resource_id)
            .join(format!("{}.seg", generation))
    }

    async fn load(
        &self,
        resource_id: &str,
        generation: i64,
    ) -> Result<Arc<Vec<SegmentEntry>>, StoreError> {
        let key = (resource_id.to_string(), generation);
        if let Some(entries) = self
            .cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
        {
            return Ok(entries.clone());
        }

        let path = self.segment_path(resource_id, generation);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::SegmentMissing {
                    resource_id: resource_id.to_string(),
                    generation,
                })
            }
            Err(e) => return Err(StoreError::Io(e)),
        };
        let (_dims, entries) = decode(&bytes).map_err(|reason| StoreError::SegmentCorrupt {
            resource_id: resource_id.to_string(),
            generation,
            reason,
        })?;

        let entries = Arc::new(entries);
        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, entries.clone());
        Ok(entries)
    }

    fn evict(&self, resource_id: &str, generation: Option<i64>) {
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        cache.retain(|(rid, gen), _| {
            rid != resource_id || generation.is_some_and(|g| g != *gen)
        });
    }
}

#[async_trait]
impl VectorStore for FileVectorStore {
    async fn seal(&self, segment: SegmentBuilder) -> Result<(), StoreError> {
        let dir = self.resource_dir(&segment.resource_id);
        tokio::fs::create_dir_all(&dir).await?;

        let final_path = self.segment_path(&segment.resource_id, segment.generation);
        let tmp_path = dir.join(format!("{}.seg.tmp", segment.generation));
        let (resource_id, generation, dims) =
            (segment.resource_id.clone(), segment.generation, segment.dims);
        let entries = segment.into_entries();

        tokio::fs::write(&tmp_path, encode(dims, &entries)).await?;
        tokio::fs::rename(&tmp_path, &final_path).await?;

        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert((resource_id, generation), Arc::new(entries));
        Ok(())
    }

    async fn query(
        &self,
        resource_id: &str,
        generation: i64,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>, StoreError> {
        let entries = self.load(resource_id, generation).await?;
        Ok(rank_entries(&entries, vector, top_k))
    }

    async fn segment_len(&self, resource_id: &str, generation: i64) -> Result<usize, StoreError> {
        Ok(self.load(resource_id, generation).await?.len())
    }

    async fn delete_segment(&self, resource_id: &str, generation: i64) -> Result<(), StoreError> {
        self.evict(resource_id, Some(generation));
        match tokio::fs::remove_file(self.segment_path(resource_id, generation)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn delete_resource(&self, resource_id: &str) -> Result<(), StoreError> {
        self.evict(resource_id, None);
        match tokio::fs::remove_dir_all(self.resource_dir(resource_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder(store: &FileVectorStore, gen: i64) -> SegmentBuilder {
        let mut seg = store.create_segment("r1", gen, 2);
        seg.upsert("a", &[1.0, 0.0], "src/a.rs").unwrap();
        seg.upsert("b", &[0.0, 1.0], "src/b.rs").unwrap();
        seg
    }

    #[tokio::test]
    async fn test_seal_and_reload_from_disk() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = FileVectorStore::new(tmp.path());
        store.seal(builder(&store, 1)).await.unwrap();
        assert!(tmp.path().join("r1/1.seg").exists());
        assert!(!tmp.path().join("r1/1.seg.tmp").exists());

        // A fresh store has an empty cache and must read the file.
        let reopened = FileVectorStore::new(tmp.path());
        let hits = reopened.query("r1", 1, &[1.0, 0.1], 1).await.unwrap();
        assert_eq!(hits[0].chunk_id, "a");
        assert_eq!(reopened.segment_len("r1", 1).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_missing_and_corrupt_segments() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = FileVectorStore::new(tmp.path());
        let err = store.query("r1", 7, &[1.0, 0.0], 1).await.unwrap_err();
        assert!(matches!(err, StoreError::SegmentMissing { .. }));

        store.seal(builder(&store, 1)).await.unwrap();
        let path = tmp.path().join("r1/1.seg");
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        let reopened = FileVectorStore::new(tmp.path());
        let err = reopened.query("r1", 1, &[1.0, 0.0], 1).await.unwrap_err();
        assert!(err.is_corruption());
        assert!(matches!(err, StoreError::SegmentCorrupt { .. }));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = FileVectorStore::new(tmp.path());
        store.seal(builder(&store, 1)).await.unwrap();
        store.seal(builder(&store, 2)).await.unwrap();

        store.delete_segment("r1", 1).await.unwrap();
        store.delete_segment("r1", 1).await.unwrap();
        assert!(store.segment_len("r1", 1).await.is_err());
        assert_eq!(store.segment_len("r1", 2).await.unwrap(), 2);

        store.delete_resource("r1").await.unwrap();
        store.delete_resource("r1").await.unwrap();
        assert!(!tmp.path().join("r1").exists());
    }
}
