//! Hybrid query engine.
//!
//! A query reads each resource's generation pointer once and searches that
//! generation only, so a commit landing mid-query is never half-visible.
//!
//! Per resource:
//! 1. Load the generation's chunk rows and texts from the catalog.
//! 2. Lexical pass over every chunk (query terms, or a regex pattern).
//! 3. Semantic pass: `candidate_k` nearest neighbours from the segment.
//!
//! Candidates from all resources are merged and ordered by
//! [`rank`](resource_index_core::search::rank).
//!
//! A generation the catalog points at but whose segment is missing or
//! unreadable, or whose chunk rows are gone, counts as corrupt: a forced
//! full re-index is submitted and the caller gets
//! [`EngineError::IndexCorrupted`] with the job id.

use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use resource_index_core::embedding::Embedder;
use resource_index_core::models::{Resource, ResourceKind, SearchHit, Span};
use resource_index_core::search::{rank, Candidate, LexicalMatcher};
use resource_index_core::store::VectorStore;

use crate::config::{Config, EmbeddingConfig};
use crate::error::{EngineError, Result};
use crate::providers::embed_with_retry;
use crate::registry::Registry;
use crate::scheduler::Scheduler;

/// Parameters of one search call.
#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub query: String,
    /// Resources to search. Empty means every searchable resource of the
    /// allowed kinds.
    pub resource_ids: Vec<String>,
    pub top_k: Option<usize>,
    /// Regex used for lexical matching instead of the query terms.
    pub pattern: Option<String>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn resources(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.resource_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }
}

#[derive(Clone)]
pub struct QueryEngine {
    pool: SqlitePool,
    registry: Registry,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    scheduler: Scheduler,
    embedding: EmbeddingConfig,
    lexical_boost: f32,
    candidate_k: usize,
    final_limit: usize,
}

impl QueryEngine {
    pub fn new(
        pool: SqlitePool,
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        scheduler: Scheduler,
        config: &Config,
    ) -> Self {
        Self {
            registry: Registry::new(pool.clone()),
            pool,
            vectors,
            embedder,
            scheduler,
            embedding: config.embedding.clone(),
            lexical_boost: config.retrieval.lexical_boost,
            candidate_k: config.retrieval.candidate_k,
            final_limit: config.retrieval.final_limit,
        }
    }

    /// Search resources whose kind is in `kinds`.
    pub async fn search(
        &self,
        kinds: &[ResourceKind],
        request: &SearchRequest,
    ) -> Result<Vec<SearchHit>> {
        let query = request.query.trim();
        if query.is_empty() && request.pattern.is_none() {
            return Err(EngineError::invalid("query cannot be empty"));
        }
        let top_k = request.top_k.unwrap_or(self.final_limit);
        if top_k == 0 {
            return Err(EngineError::invalid("top_k must be at least 1"));
        }

        let matcher = match &request.pattern {
            Some(p) => LexicalMatcher::pattern(p)
                .map_err(|e| EngineError::invalid(format!("invalid pattern: {e}")))?,
            None => LexicalMatcher::terms(query),
        };
        let targets = self.targets(kinds, &request.resource_ids).await?;
        if targets.is_empty() {
            return Ok(Vec::new());
        }

        let query_vector = if query.is_empty() {
            None
        } else {
            let texts = vec![query.to_string()];
            let cancel = CancellationToken::new();
            embed_with_retry(self.embedder.as_ref(), &texts, &self.embedding, &cancel)
                .await?
                .into_iter()
                .next()
        };

        let mut candidates = Vec::new();
        for (resource, generation) in &targets {
            match self
                .search_generation(resource, *generation, &matcher, query_vector.as_deref())
                .await
            {
                Ok(found) => candidates.extend(found),
                Err(EngineError::Store(e)) if e.is_corruption() => {
                    return Err(self.rebuild(resource, &e.to_string()).await)
                }
                Err(e) => return Err(e),
            }
        }

        let hits = rank(candidates, self.lexical_boost, top_k);
        tracing::debug!(resources = targets.len(), hits = hits.len(), "search complete");
        Ok(hits)
    }

    /// Resolve the requested ids to `(resource, generation)` pairs.
    async fn targets(
        &self,
        kinds: &[ResourceKind],
        ids: &[String],
    ) -> Result<Vec<(Resource, i64)>> {
        if ids.is_empty() {
            let mut targets = Vec::new();
            for summary in self.registry.list(None).await? {
                if !kinds.contains(&summary.kind) {
                    continue;
                }
                if let Some(generation) = summary.current_generation {
                    targets.push((self.registry.get(&summary.id).await?, generation));
                }
            }
            return Ok(targets);
        }

        let mut targets = Vec::with_capacity(ids.len());
        for id in ids {
            let resource = self.registry.get(id).await?;
            if !kinds.contains(&resource.kind) {
                return Err(EngineError::invalid(format!(
                    "resource {id} is a {} resource and cannot be searched here",
                    resource.kind
                )));
            }
            let generation = resource
                .current_generation
                .ok_or_else(|| EngineError::NotReady(id.clone()))?;
            if targets.iter().all(|(r, _): &(Resource, i64)| r.id != resource.id) {
                targets.push((resource, generation));
            }
        }
        Ok(targets)
    }

    async fn search_generation(
        &self,
        resource: &Resource,
        generation: i64,
        matcher: &LexicalMatcher,
        query_vector: Option<&[f32]>,
    ) -> Result<Vec<Candidate>> {
        let rows = sqlx::query(
            "SELECT gc.chunk_id, gc.source_path, gc.start_line, gc.end_line, ct.text \
             FROM generation_chunks gc JOIN chunk_texts ct ON ct.content_hash = gc.content_hash \
             WHERE gc.resource_id = ? AND gc.generation = ?",
        )
        .bind(&resource.id)
        .bind(generation)
        .fetch_all(&self.pool)
        .await?;
        if rows.is_empty() {
            return Err(self.rebuild(resource, "generation has no chunk rows").await);
        }

        let semantic: HashMap<String, f32> = match query_vector {
            Some(vector) => self
                .vectors
                .query(&resource.id, generation, vector, self.candidate_k)
                .await?
                .into_iter()
                .filter(|s| s.score > 0.0)
                .map(|s| (s.chunk_id, s.score))
                .collect(),
            None => HashMap::new(),
        };

        Ok(rows
            .into_iter()
            .map(|row| {
                let chunk_id: String = row.get("chunk_id");
                let text: String = row.get("text");
                Candidate {
                    resource_id: resource.id.clone(),
                    semantic: semantic.get(&chunk_id).copied(),
                    lexical: matcher.is_match(&text),
                    chunk_id,
                    source_path: row.get("source_path"),
                    span: Span::new(row.get::<u32, _>("start_line"), row.get::<u32, _>("end_line")),
                    text,
                }
            })
            .collect())
    }

    /// Submit a forced full re-index and build the error returned instead
    /// of results.
    async fn rebuild(&self, resource: &Resource, reason: &str) -> EngineError {
        tracing::error!(resource_id = %resource.id, reason, "index unreadable, submitting rebuild");
        match self.scheduler.submit(&resource.id, true).await {
            Ok(job_id) => EngineError::IndexCorrupted {
                resource_id: resource.id.clone(),
                job_id,
            },
            Err(e) => e,
        }
    }
}
