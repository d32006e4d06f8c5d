//! Ingestion pipeline: one indexing job for one resource.
//!
//! ```text
//! fetch ─▶ hash + diff ─▶ chunk changed files ─▶ embed cache misses ─▶ commit
//!                │                                                      │
//!                └──── unchanged files: chunks carried over ────────────┘
//! ```
//!
//! A job either commits a complete new generation or changes nothing.
//! The vector segment is sealed first; the catalog rows, the file
//! snapshots, and the generation pointer swap then land in a single SQLite
//! transaction. If that transaction fails the segment is deleted again.
//!
//! Cancellation is checked between files and between embedding batches.

use anyhow::Context;
use sqlx::{Row, SqlitePool};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use resource_index_core::chunk::{chunk_id, content_hash, decode_text};
use resource_index_core::embedding::Embedder;
use resource_index_core::models::{ChunkKind, IndexJob, JobPhase, Resource, SourceSnapshot, Span};
use resource_index_core::store::VectorStore;

use crate::cas::ContentStore;
use crate::config::{Config, EmbeddingConfig};
use crate::db::now_millis;
use crate::error::{EngineError, Result};
use crate::providers::embed_with_retry;
use crate::registry::Registry;
use crate::sources::SourceKinds;

/// Shared view of a running job. The scheduler holds the same record and
/// answers status queries from it while the pipeline writes progress.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: String,
    pub resource_id: String,
    pub force_full: bool,
    pub cancel: CancellationToken,
    record: Arc<Mutex<IndexJob>>,
}

impl JobContext {
    pub fn new(record: Arc<Mutex<IndexJob>>, cancel: CancellationToken) -> Self {
        let (job_id, resource_id, force_full) = {
            let job = record.lock().unwrap_or_else(|e| e.into_inner());
            (job.job_id.clone(), job.resource_id.clone(), job.force_full)
        };
        Self {
            job_id,
            resource_id,
            force_full,
            cancel,
            record,
        }
    }

    pub fn snapshot(&self) -> IndexJob {
        self.record.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut IndexJob)) {
        let mut job = self.record.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut job);
    }

    pub fn set_phase(&self, phase: JobPhase) {
        tracing::debug!(job_id = %self.job_id, phase = phase.as_str(), "job phase");
        self.update(|job| job.progress.phase = phase);
    }

    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(job_id = %self.job_id, resource_id = %self.resource_id, "{}", message);
        self.update(|job| job.progress.warnings.push(message));
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// A chunk row of the generation being built.
#[derive(Debug, Clone)]
struct ChunkRow {
    chunk_id: String,
    source_path: String,
    span: Span,
    content_hash: String,
    kind: ChunkKind,
    ordinal: i64,
}

#[derive(Clone)]
pub struct Pipeline {
    pool: SqlitePool,
    registry: Registry,
    cas: ContentStore,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    sources: SourceKinds,
    embedding: EmbeddingConfig,
    max_file_bytes: usize,
    fetch_timeout: Duration,
}

impl Pipeline {
    pub fn new(
        pool: SqlitePool,
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        sources: SourceKinds,
        config: &Config,
    ) -> Self {
        Self {
            registry: Registry::new(pool.clone()),
            cas: ContentStore::new(pool.clone()),
            pool,
            vectors,
            embedder,
            sources,
            embedding: config.embedding.clone(),
            max_file_bytes: config.repository.max_file_bytes,
            fetch_timeout: Duration::from_secs(config.jobs.fetch_timeout_secs.max(1)),
        }
    }

    /// Run one job to completion and return the committed generation.
    pub async fn run(&self, ctx: &JobContext) -> Result<i64> {
        let resource = self.registry.get(&ctx.resource_id).await?;

        // ═══ Fetch ═══
        ctx.set_phase(JobPhase::Fetching);
        let snapshot = self.fetch(&resource, ctx).await?;
        for warning in &snapshot.warnings {
            ctx.warn(warning.clone());
        }
        ctx.check_cancelled()?;

        // ═══ Diff ═══
        ctx.set_phase(JobPhase::Diffing);
        let files: BTreeMap<&str, &[u8]> = snapshot
            .files
            .iter()
            .map(|f| (f.path.as_str(), f.bytes.as_slice()))
            .collect();
        let hashes: BTreeMap<String, String> = files
            .iter()
            .map(|(path, bytes)| (path.to_string(), content_hash(bytes)))
            .collect();

        let base = if ctx.force_full {
            None
        } else {
            resource.current_generation
        };
        let diff = self.cas.diff(&resource.id, base, &hashes).await?;
        tracing::info!(
            resource_id = %resource.id,
            unchanged = diff.unchanged.len(),
            modified = diff.modified.len(),
            added = diff.added.len(),
            removed = diff.removed.len(),
            "diffed against {}",
            base.map(|g| format!("generation {g}")).unwrap_or_else(|| "nothing".to_string())
        );
        ctx.update(|job| {
            job.progress.files_seen = hashes.len() as u64;
            job.progress.files_changed = (diff.modified.len() + diff.added.len()) as u64;
            job.progress.files_unchanged = diff.unchanged.len() as u64;
            job.progress.files_removed = diff.removed.len() as u64;
            job.diff = Some(diff.clone());
        });

        let mut rows = match base {
            Some(generation) if !diff.unchanged.is_empty() => {
                let keep: HashSet<&str> = diff.unchanged.iter().map(String::as_str).collect();
                self.carried_rows(&resource.id, generation, &keep).await?
            }
            _ => Vec::new(),
        };
        let carried = rows.len() as u64;

        // ═══ Chunk ═══
        ctx.set_phase(JobPhase::Chunking);
        let source = self.sources.get(resource.kind)?;
        let mut new_texts: HashMap<String, String> = HashMap::new();
        let mut written = 0u64;

        for path in diff.changed() {
            ctx.check_cancelled()?;
            let Some(bytes) = files.get(path.as_str()) else {
                continue;
            };
            let text = match decode_text(bytes, self.max_file_bytes) {
                Ok(text) => text,
                Err(e) => {
                    ctx.warn(format!("{path}: skipped, {e}"));
                    continue;
                }
            };
            let drafts = match source.chunker().chunk(path, text) {
                Ok(drafts) => drafts,
                Err(e) => {
                    ctx.warn(format!("{path}: skipped, {e}"));
                    continue;
                }
            };
            for (ordinal, draft) in drafts.into_iter().enumerate() {
                rows.push(ChunkRow {
                    chunk_id: chunk_id(&resource.id, path, ordinal, &draft.content_hash),
                    source_path: path.clone(),
                    span: draft.span,
                    content_hash: draft.content_hash.clone(),
                    kind: draft.kind,
                    ordinal: ordinal as i64,
                });
                new_texts.insert(draft.content_hash, draft.text);
                written += 1;
            }
        }

        if rows.is_empty() {
            return Err(EngineError::EmptySource);
        }
        rows.sort_by(|a, b| {
            a.source_path
                .cmp(&b.source_path)
                .then_with(|| a.ordinal.cmp(&b.ordinal))
        });
        ctx.update(|job| {
            job.progress.chunks_written = written;
            job.progress.chunks_reused = carried;
        });

        // Only files that contributed chunks get a snapshot row. A skipped
        // file then shows up as added on the next run and is retried.
        let indexed_paths: HashSet<&str> = rows.iter().map(|r| r.source_path.as_str()).collect();
        let indexed: BTreeMap<String, String> = hashes
            .iter()
            .filter(|(path, _)| indexed_paths.contains(path.as_str()))
            .map(|(path, hash)| (path.clone(), hash.clone()))
            .collect();

        let stored: Vec<(String, String)> = new_texts
            .iter()
            .map(|(hash, text)| (hash.clone(), text.clone()))
            .collect();
        self.cas.put_chunks(&stored).await?;

        // ═══ Embed ═══
        ctx.set_phase(JobPhase::Embedding);
        let vectors = self.embed_rows(ctx, &rows, &new_texts).await?;

        // ═══ Commit ═══
        ctx.check_cancelled()?;
        ctx.set_phase(JobPhase::Committing);
        let generation = self.next_generation(&resource.id).await?;

        let mut segment = self
            .vectors
            .create_segment(&resource.id, generation, self.embedder.dims());
        for row in &rows {
            let vector = vectors
                .get(&row.content_hash)
                .with_context(|| format!("no embedding for chunk {}", row.chunk_id))?;
            segment.upsert(&row.chunk_id, vector, &row.source_path)?;
        }
        self.vectors.seal(segment).await?;

        if let Err(e) = self
            .commit(&resource, generation, &rows, &indexed, snapshot.revision.as_deref())
            .await
        {
            if let Err(cleanup) = self.vectors.delete_segment(&resource.id, generation).await {
                tracing::warn!(
                    resource_id = %resource.id,
                    generation,
                    error = %cleanup,
                    "failed to remove orphaned segment"
                );
            }
            return Err(e);
        }

        tracing::info!(
            resource_id = %resource.id,
            generation,
            chunks = rows.len(),
            files = indexed.len(),
            reused = carried,
            "generation committed"
        );
        self.prune(&resource.id, generation).await;
        ctx.set_phase(JobPhase::Done);
        Ok(generation)
    }

    async fn fetch(&self, resource: &Resource, ctx: &JobContext) -> Result<SourceSnapshot> {
        let source = self.sources.get(resource.kind)?;
        match tokio::time::timeout(self.fetch_timeout, source.fetch(resource, &ctx.cancel)).await {
            Err(_) => Err(EngineError::TimedOut(self.fetch_timeout.as_secs())),
            Ok(Err(e)) => {
                ctx.check_cancelled()?;
                Err(match e.downcast::<EngineError>() {
                    Ok(engine_error) => engine_error,
                    Err(e) => EngineError::SourceFetch(format!("{e:#}")),
                })
            }
            Ok(Ok(snapshot)) => Ok(snapshot),
        }
    }

    async fn carried_rows(
        &self,
        resource_id: &str,
        generation: i64,
        keep: &HashSet<&str>,
    ) -> Result<Vec<ChunkRow>> {
        let rows = sqlx::query(
            "SELECT chunk_id, source_path, start_line, end_line, content_hash, chunk_kind, ordinal \
             FROM generation_chunks WHERE resource_id = ? AND generation = ?",
        )
        .bind(resource_id)
        .bind(generation)
        .fetch_all(&self.pool)
        .await?;

        let mut carried = Vec::new();
        for row in rows {
            let source_path: String = row.get("source_path");
            if !keep.contains(source_path.as_str()) {
                continue;
            }
            let kind: String = row.get("chunk_kind");
            carried.push(ChunkRow {
                chunk_id: row.get("chunk_id"),
                source_path,
                span: Span::new(row.get::<u32, _>("start_line"), row.get::<u32, _>("end_line")),
                content_hash: row.get("content_hash"),
                kind: kind.parse().map_err(anyhow::Error::new)?,
                ordinal: row.get("ordinal"),
            });
        }
        Ok(carried)
    }

    /// Vectors for every distinct chunk hash in `rows`. Cached embeddings
    /// for the active model are reused; only misses reach the backend.
    async fn embed_rows(
        &self,
        ctx: &JobContext,
        rows: &[ChunkRow],
        new_texts: &HashMap<String, String>,
    ) -> Result<HashMap<String, Vec<f32>>> {
        let mut hashes: Vec<String> = rows.iter().map(|r| r.content_hash.clone()).collect();
        hashes.sort();
        hashes.dedup();

        let model = self.embedder.model_name().to_string();
        let mut vectors = self
            .cas
            .cached_embeddings(&hashes, &model, self.embedder.dims())
            .await?;
        let misses: Vec<String> = hashes
            .into_iter()
            .filter(|h| !vectors.contains_key(h))
            .collect();
        tracing::debug!(
            job_id = %ctx.job_id,
            cached = vectors.len(),
            misses = misses.len(),
            "embedding cache lookup"
        );

        for batch in misses.chunks(self.embedding.batch_size.max(1)) {
            ctx.check_cancelled()?;
            let mut texts = Vec::with_capacity(batch.len());
            for hash in batch {
                let text = match new_texts.get(hash) {
                    Some(text) => text.clone(),
                    None => self
                        .cas
                        .get_by_hash(hash, &model)
                        .await?
                        .map(|stored| stored.text)
                        .with_context(|| format!("chunk text {hash} missing from content store"))?,
                };
                texts.push(text);
            }

            let embedded = embed_with_retry(
                self.embedder.as_ref(),
                &texts,
                &self.embedding,
                &ctx.cancel,
            )
            .await?;
            let items: Vec<(String, Vec<f32>)> = batch.iter().cloned().zip(embedded).collect();
            self.cas.put_embeddings(&model, &items).await?;
            ctx.update(|job| job.progress.embeddings_computed += items.len() as u64);
            vectors.extend(items);
        }

        Ok(vectors)
    }

    async fn next_generation(&self, resource_id: &str) -> Result<i64> {
        let max: Option<i64> =
            sqlx::query_scalar("SELECT MAX(generation) FROM generations WHERE resource_id = ?")
                .bind(resource_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(max.unwrap_or(0) + 1)
    }

    async fn commit(
        &self,
        resource: &Resource,
        generation: i64,
        rows: &[ChunkRow],
        files: &BTreeMap<String, String>,
        revision: Option<&str>,
    ) -> Result<()> {
        let now = now_millis();
        let mut tx = self.pool.begin().await?;

        for row in rows {
            sqlx::query(
                "INSERT INTO generation_chunks (resource_id, generation, chunk_id, source_path, \
                 start_line, end_line, content_hash, chunk_kind, ordinal) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&resource.id)
            .bind(generation)
            .bind(&row.chunk_id)
            .bind(&row.source_path)
            .bind(row.span.start_line)
            .bind(row.span.end_line)
            .bind(&row.content_hash)
            .bind(row.kind.as_str())
            .bind(row.ordinal)
            .execute(&mut *tx)
            .await?;
        }

        for (path, hash) in files {
            sqlx::query(
                "INSERT INTO file_snapshots (resource_id, generation, path, content_hash, last_indexed_at) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&resource.id)
            .bind(generation)
            .bind(path)
            .bind(hash)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "INSERT INTO generations (resource_id, generation, revision, chunk_count, file_count, committed_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&resource.id)
        .bind(generation)
        .bind(revision)
        .bind(rows.len() as i64)
        .bind(files.len() as i64)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        Registry::mark_ready(&mut *tx, &resource.id, generation).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Drop generations older than the one before `current`. The previous
    /// generation stays for readers that loaded its pointer before the swap.
    async fn prune(&self, resource_id: &str, current: i64) {
        if let Err(e) = self.try_prune(resource_id, current).await {
            tracing::warn!(resource_id, error = %e, "failed to prune old generations");
        }
    }

    async fn try_prune(&self, resource_id: &str, current: i64) -> Result<()> {
        let stale: Vec<i64> = sqlx::query_scalar(
            "SELECT generation FROM generations WHERE resource_id = ? AND generation < ?",
        )
        .bind(resource_id)
        .bind(current - 1)
        .fetch_all(&self.pool)
        .await?;
        if stale.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for table in ["generation_chunks", "file_snapshots", "generations"] {
            sqlx::query(&format!(
                "DELETE FROM {table} WHERE resource_id = ? AND generation < ?"
            ))
            .bind(resource_id)
            .bind(current - 1)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        for generation in stale {
            self.vectors.delete_segment(resource_id, generation).await?;
        }
        Ok(())
    }
}
