//! Vector segment abstraction.
//!
//! A segment holds the vectors of one resource generation. It is built in
//! memory through a [`SegmentBuilder`], handed to a [`VectorStore`] with
//! [`VectorStore::seal`], and never mutated afterwards. Queries name the
//! `(resource_id, generation)` pair they read, so a reader keeps searching
//! the generation it started with even while a newer one is sealed.
//!
//! | Implementation | Backing | Used for |
//! |----------------|---------|----------|
//! | [`memory::InMemoryVectorStore`] | `RwLock<HashMap>` | ephemeral package indexes, tests |
//! | `FileVectorStore` (app crate) | one file per segment | persistent resources |
//!
//! [`segment`] holds the binary encoding shared by file-backed stores.

pub mod memory;
pub mod segment;

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::embedding::cosine_similarity;

/// Typed failures of a vector store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("segment {resource_id}/{generation} is missing")]
    SegmentMissing { resource_id: String, generation: i64 },

    #[error("segment {resource_id}/{generation} is corrupt: {reason}")]
    SegmentCorrupt {
        resource_id: String,
        generation: i64,
        reason: String,
    },

    #[error("vector has {actual} dimensions, segment expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Missing and corrupt segments mean the catalog points at an index
    /// that cannot be read, which triggers a rebuild.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StoreError::SegmentMissing { .. } | StoreError::SegmentCorrupt { .. }
        )
    }
}

/// One vector with the metadata stored next to it.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentEntry {
    pub chunk_id: String,
    pub source_path: String,
    pub vector: Vec<f32>,
}

/// A chunk id with its similarity to the query vector.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk_id: String,
    pub score: f32,
}

/// Mutable, unsealed segment for one `(resource_id, generation)`.
///
/// Entries are keyed by chunk id, so upserting the same id twice keeps the
/// last vector.
#[derive(Debug, Clone)]
pub struct SegmentBuilder {
    pub resource_id: String,
    pub generation: i64,
    pub dims: usize,
    entries: BTreeMap<String, SegmentEntry>,
}

impl SegmentBuilder {
    pub fn new(resource_id: &str, generation: i64, dims: usize) -> Self {
        Self {
            resource_id: resource_id.to_string(),
            generation,
            dims,
            entries: BTreeMap::new(),
        }
    }

    pub fn upsert(
        &mut self,
        chunk_id: &str,
        vector: &[f32],
        source_path: &str,
    ) -> Result<(), StoreError> {
        if vector.len() != self.dims {
            return Err(StoreError::DimensionMismatch {
                expected: self.dims,
                actual: vector.len(),
            });
        }
        self.entries.insert(
            chunk_id.to_string(),
            SegmentEntry {
                chunk_id: chunk_id.to_string(),
                source_path: source_path.to_string(),
                vector: vector.to_vec(),
            },
        );
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries ordered by chunk id.
    pub fn into_entries(self) -> Vec<SegmentEntry> {
        self.entries.into_values().collect()
    }
}

/// Storage for sealed vector segments.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Start a new segment. Nothing is visible to queries until
    /// [`seal`](VectorStore::seal) returns.
    fn create_segment(&self, resource_id: &str, generation: i64, dims: usize) -> SegmentBuilder {
        SegmentBuilder::new(resource_id, generation, dims)
    }

    /// Persist a finished segment atomically.
    async fn seal(&self, segment: SegmentBuilder) -> Result<(), StoreError>;

    /// Brute-force cosine search over one sealed segment, best first.
    async fn query(
        &self,
        resource_id: &str,
        generation: i64,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>, StoreError>;

    /// Number of entries in a sealed segment.
    async fn segment_len(&self, resource_id: &str, generation: i64) -> Result<usize, StoreError>;

    /// Remove one segment. Removing a segment that does not exist is not an error.
    async fn delete_segment(&self, resource_id: &str, generation: i64) -> Result<(), StoreError>;

    /// Remove every segment of a resource.
    async fn delete_resource(&self, resource_id: &str) -> Result<(), StoreError>;
}

/// Score every entry against `query` and keep the best `top_k`.
///
/// Ties are broken by chunk id so results are fully deterministic.
pub fn rank_entries(entries: &[SegmentEntry], query: &[f32], top_k: usize) -> Vec<ScoredChunk> {
    let mut scored: Vec<ScoredChunk> = entries
        .iter()
        .map(|e| ScoredChunk {
            chunk_id: e.chunk_id.clone(),
            score: cosine_similarity(query, &e.vector),
        })
        .collect();
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    scored.truncate(top_k);
    scored
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_rejects_wrong_dims() {
        let mut b = SegmentBuilder::new("r", 1, 3);
        assert!(b.upsert("c1", &[1.0, 0.0, 0.0], "a.rs").is_ok());
        let err = b.upsert("c2", &[1.0], "a.rs").unwrap_err();
        assert!(matches!(
            err,
            StoreError::DimensionMismatch {
                expected: 3,
                actual: 1
            }
        ));
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn test_builder_upsert_replaces() {
        let mut b = SegmentBuilder::new("r", 1, 2);
        b.upsert("c1", &[1.0, 0.0], "a").unwrap();
        b.upsert("c1", &[0.0, 1.0], "a").unwrap();
        let entries = b.into_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].vector, vec![0.0, 1.0]);
    }

    #[test]
    fn test_rank_entries_ties_by_id() {
        let entries = vec![
            SegmentEntry {
                chunk_id: "b".into(),
                source_path: "x".into(),
                vector: vec![1.0, 0.0],
            },
            SegmentEntry {
                chunk_id: "a".into(),
                source_path: "x".into(),
                vector: vec![2.0, 0.0],
            },
            SegmentEntry {
                chunk_id: "c".into(),
                source_path: "x".into(),
                vector: vec![0.0, 1.0],
            },
        ];
        let ranked = rank_entries(&entries, &[1.0, 0.0], 2);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].chunk_id, "a");
        assert_eq!(ranked[1].chunk_id, "b");
    }
}
