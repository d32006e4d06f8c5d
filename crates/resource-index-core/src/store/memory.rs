//! In-memory [`VectorStore`] for ephemeral indexes and tests.
//!
//! Segments live in a `HashMap` behind `std::sync::RwLock`; sealed segments
//! are shared as `Arc` so queries never copy vectors.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use super::{rank_entries, ScoredChunk, SegmentBuilder, SegmentEntry, StoreError, VectorStore};

type SegmentKey = (String, i64);

/// In-memory vector store.
#[derive(Default)]
pub struct InMemoryVectorStore {
    segments: RwLock<HashMap<SegmentKey, Arc<Vec<SegmentEntry>>>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(
        &self,
        resource_id: &str,
        generation: i64,
    ) -> Result<Arc<Vec<SegmentEntry>>, StoreError> {
        let segments = self.segments.read().unwrap_or_else(|e| e.into_inner());
        segments
            .get(&(resource_id.to_string(), generation))
            .cloned()
            .ok_or_else(|| StoreError::SegmentMissing {
                resource_id: resource_id.to_string(),
                generation,
            })
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn seal(&self, segment: SegmentBuilder) -> Result<(), StoreError> {
        let key = (segment.resource_id.clone(), segment.generation);
        let entries = Arc::new(segment.into_entries());
        let mut segments = self.segments.write().unwrap_or_else(|e| e.into_inner());
        segments.insert(key, entries);
        Ok(())
    }

    async fn query(
        &self,
        resource_id: &str,
        generation: i64,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>, StoreError> {
        let entries = self.get(resource_id, generation)?;
        Ok(rank_entries(&entries, vector, top_k))
    }

    async fn segment_len(&self, resource_id: &str, generation: i64) -> Result<usize, StoreError> {
        Ok(self.get(resource_id, generation)?.len())
    }

    async fn delete_segment(&self, resource_id: &str, generation: i64) -> Result<(), StoreError> {
        let mut segments = self.segments.write().unwrap_or_else(|e| e.into_inner());
        segments.remove(&(resource_id.to_string(), generation));
        Ok(())
    }

    async fn delete_resource(&self, resource_id: &str) -> Result<(), StoreError> {
        let mut segments = self.segments.write().unwrap_or_else(|e| e.into_inner());
        segments.retain(|(rid, _), _| rid != resource_id);
        Ok(())
    }
}
