//! Content-addressed store for chunk text and embeddings, plus the
//! per-generation file snapshots that drive incremental diffing.
//!
//! Chunk text is keyed by its SHA-256; embeddings by `(hash, model)`. Equal
//! content is therefore stored once and embedded once per model, no matter
//! how many resources or generations reference it.

use sqlx::{Row, SqlitePool};
use std::collections::{BTreeMap, HashMap};

use resource_index_core::diff::{diff_files, FileDiff};
use resource_index_core::embedding::{blob_to_vec, vec_to_blob};

use crate::error::Result;

/// A stored chunk text with its embedding for the requested model, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredChunk {
    pub content_hash: String,
    pub text: String,
    pub embedding: Option<Vec<f32>>,
}

/// Rows removed by [`ContentStore::collect_garbage`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct GcReport {
    pub chunk_texts_removed: u64,
    pub embeddings_removed: u64,
    /// Segment directories of resources the catalog no longer knows.
    pub segment_dirs_removed: u64,
}

#[derive(Clone)]
pub struct ContentStore {
    pool: SqlitePool,
}

impl ContentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Store chunk text under its hash. Returns `false` if it was already present.
    pub async fn put_chunk(&self, content_hash: &str, text: &str) -> Result<bool> {
        let result =
            sqlx::query("INSERT OR IGNORE INTO chunk_texts (content_hash, text) VALUES (?, ?)")
                .bind(content_hash)
                .bind(text)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Store many chunk texts in one transaction. Returns how many were new.
    pub async fn put_chunks(&self, chunks: &[(String, String)]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for (hash, text) in chunks {
            let result =
                sqlx::query("INSERT OR IGNORE INTO chunk_texts (content_hash, text) VALUES (?, ?)")
                    .bind(hash)
                    .bind(text)
                    .execute(&mut *tx)
                    .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    pub async fn get_by_hash(
        &self,
        content_hash: &str,
        model: &str,
    ) -> Result<Option<StoredChunk>> {
        let row = sqlx::query(
            "SELECT t.text, e.vector FROM chunk_texts t \
             LEFT JOIN embeddings e ON e.content_hash = t.content_hash AND e.model = ? \
             WHERE t.content_hash = ?",
        )
        .bind(model)
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| {
            let blob: Option<Vec<u8>> = r.get("vector");
            StoredChunk {
                content_hash: content_hash.to_string(),
                text: r.get("text"),
                embedding: blob.map(|b| blob_to_vec(&b)),
            }
        }))
    }

    pub async fn put_embedding(
        &self,
        content_hash: &str,
        model: &str,
        vector: &[f32],
    ) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO embeddings (content_hash, model, dims, vector) VALUES (?, ?, ?, ?)",
        )
        .bind(content_hash)
        .bind(model)
        .bind(vector.len() as i64)
        .bind(vec_to_blob(vector))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Store a batch of embeddings in one transaction.
    pub async fn put_embeddings(&self, model: &str, items: &[(String, Vec<f32>)]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (hash, vector) in items {
            sqlx::query(
                "INSERT OR REPLACE INTO embeddings (content_hash, model, dims, vector) VALUES (?, ?, ?, ?)",
            )
            .bind(hash)
            .bind(model)
            .bind(vector.len() as i64)
            .bind(vec_to_blob(vector))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Cached embeddings for `hashes` under `model`. Vectors whose length
    /// differs from `dims` are treated as missing.
    pub async fn cached_embeddings(
        &self,
        hashes: &[String],
        model: &str,
        dims: usize,
    ) -> Result<HashMap<String, Vec<f32>>> {
        let mut conn = self.pool.acquire().await?;
        let mut found = HashMap::new();
        for hash in hashes {
            let row = sqlx::query(
                "SELECT vector FROM embeddings WHERE content_hash = ? AND model = ? AND dims = ?",
            )
            .bind(hash)
            .bind(model)
            .bind(dims as i64)
            .fetch_optional(&mut *conn)
            .await?;
            if let Some(row) = row {
                let blob: Vec<u8> = row.get("vector");
                found.insert(hash.clone(), blob_to_vec(&blob));
            }
        }
        Ok(found)
    }

    /// `path → content hash` of every file committed in a generation.
    pub async fn snapshot(
        &self,
        resource_id: &str,
        generation: i64,
    ) -> Result<BTreeMap<String, String>> {
        let rows = sqlx::query(
            "SELECT path, content_hash FROM file_snapshots WHERE resource_id = ? AND generation = ?",
        )
        .bind(resource_id)
        .bind(generation)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| (r.get::<String, _>("path"), r.get::<String, _>("content_hash")))
            .collect())
    }

    /// Diff fresh file hashes against a committed generation. `None` diffs
    /// against nothing, so every file is reported as added.
    pub async fn diff(
        &self,
        resource_id: &str,
        generation: Option<i64>,
        current: &BTreeMap<String, String>,
    ) -> Result<FileDiff> {
        let previous = match generation {
            Some(gen) => self.snapshot(resource_id, gen).await?,
            None => BTreeMap::new(),
        };
        Ok(diff_files(&previous, current))
    }

    /// Delete chunk texts and embeddings no committed generation references.
    /// Must only run while no job is writing.
    pub async fn collect_garbage(&self) -> Result<GcReport> {
        let mut tx = self.pool.begin().await?;
        let texts = sqlx::query(
            "DELETE FROM chunk_texts WHERE content_hash NOT IN \
             (SELECT DISTINCT content_hash FROM generation_chunks)",
        )
        .execute(&mut *tx)
        .await?;
        let embeddings = sqlx::query(
            "DELETE FROM embeddings WHERE content_hash NOT IN \
             (SELECT DISTINCT content_hash FROM generation_chunks)",
        )
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(GcReport {
            chunk_texts_removed: texts.rows_affected(),
            embeddings_removed: embeddings.rows_affected(),
            segment_dirs_removed: 0,
        })
    }
}
