//! Read-only views of a committed generation: its file list, one file's
//! stored text, and the import graph of a code resource.
//!
//! File text is rebuilt from the generation's chunks, so it reflects what
//! was indexed rather than the live source. Like search, every call reads
//! the generation pointer once; a chunk whose text is missing from the
//! content store counts as corruption and submits a forced rebuild.

use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;

use resource_index_core::chunk::reassemble;
use resource_index_core::graph::ImportGraph;
use resource_index_core::models::{Resource, ResourceKind, Span};

use crate::error::{EngineError, Result};
use crate::registry::Registry;
use crate::scheduler::Scheduler;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceFileEntry {
    pub path: String,
    pub chunks: i64,
    /// Last line any chunk of the file covers.
    pub lines: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceContent {
    pub resource_id: String,
    pub generation: i64,
    pub path: String,
    pub text: String,
    pub line_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CodebaseGraph {
    pub resource_id: String,
    pub generation: i64,
    pub edges: usize,
    #[serde(flatten)]
    pub graph: ImportGraph,
}

struct StoredRow {
    source_path: String,
    span: Span,
    text: Option<String>,
}

#[derive(Clone)]
pub struct Inspector {
    pool: SqlitePool,
    registry: Registry,
    scheduler: Scheduler,
}

impl Inspector {
    pub fn new(pool: SqlitePool, registry: Registry, scheduler: Scheduler) -> Self {
        Self {
            pool,
            registry,
            scheduler,
        }
    }

    pub async fn files(&self, resource_id: &str) -> Result<Vec<SourceFileEntry>> {
        let (resource, generation) = self.served(resource_id).await?;
        let rows = sqlx::query(
            "SELECT source_path, COUNT(*) AS chunks, MAX(end_line) AS lines \
             FROM generation_chunks WHERE resource_id = ? AND generation = ? \
             GROUP BY source_path ORDER BY source_path",
        )
        .bind(&resource.id)
        .bind(generation)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| SourceFileEntry {
                path: row.get("source_path"),
                chunks: row.get("chunks"),
                lines: row.get("lines"),
            })
            .collect())
    }

    pub async fn read(&self, resource_id: &str, path: &str) -> Result<SourceContent> {
        let (resource, generation) = self.served(resource_id).await?;
        let rows = self
            .stored_rows(&resource, generation, Some(path.trim()))
            .await?;
        if rows.is_empty() {
            return Err(EngineError::not_found("file", path));
        }

        let text = self.rebuild_file(&resource, &rows).await?;
        Ok(SourceContent {
            resource_id: resource.id,
            generation,
            path: path.trim().to_string(),
            line_count: text.lines().count(),
            text,
        })
    }

    /// Import graph over every file of the generation. Documentation has
    /// no imports, so only code resources are accepted.
    pub async fn graph(&self, resource_id: &str) -> Result<CodebaseGraph> {
        let (resource, generation) = self.served(resource_id).await?;
        if resource.kind == ResourceKind::Documentation {
            return Err(EngineError::invalid(format!(
                "resource {resource_id} is documentation; import graphs need a repository or package"
            )));
        }

        let rows = self.stored_rows(&resource, generation, None).await?;
        let mut by_file: BTreeMap<String, Vec<StoredRow>> = BTreeMap::new();
        for row in rows {
            by_file.entry(row.source_path.clone()).or_default().push(row);
        }
        let mut files = BTreeMap::new();
        for (path, rows) in by_file {
            let text = self.rebuild_file(&resource, &rows).await?;
            files.insert(path, text);
        }

        let graph = ImportGraph::build(&files);
        tracing::debug!(
            resource_id = %resource.id,
            generation,
            files = graph.files.len(),
            edges = graph.edge_count(),
            "import graph built"
        );
        Ok(CodebaseGraph {
            resource_id: resource.id,
            generation,
            edges: graph.edge_count(),
            graph,
        })
    }

    async fn served(&self, resource_id: &str) -> Result<(Resource, i64)> {
        let resource = self.registry.get(resource_id).await?;
        let generation = resource
            .current_generation
            .ok_or_else(|| EngineError::NotReady(resource_id.to_string()))?;
        Ok((resource, generation))
    }

    async fn stored_rows(
        &self,
        resource: &Resource,
        generation: i64,
        path: Option<&str>,
    ) -> Result<Vec<StoredRow>> {
        let rows = sqlx::query(
            "SELECT gc.source_path, gc.start_line, gc.end_line, ct.text \
             FROM generation_chunks gc \
             LEFT JOIN chunk_texts ct ON ct.content_hash = gc.content_hash \
             WHERE gc.resource_id = ? AND gc.generation = ? AND (? IS NULL OR gc.source_path = ?) \
             ORDER BY gc.source_path, gc.ordinal",
        )
        .bind(&resource.id)
        .bind(generation)
        .bind(path)
        .bind(path)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| StoredRow {
                source_path: row.get("source_path"),
                span: Span::new(row.get::<u32, _>("start_line"), row.get::<u32, _>("end_line")),
                text: row.get("text"),
            })
            .collect())
    }

    async fn rebuild_file(&self, resource: &Resource, rows: &[StoredRow]) -> Result<String> {
        let mut chunks = Vec::with_capacity(rows.len());
        for row in rows {
            match &row.text {
                Some(text) => chunks.push((row.span, text.as_str())),
                None => return Err(self.corrupted(resource, &row.source_path).await),
            }
        }
        Ok(reassemble(chunks))
    }

    async fn corrupted(&self, resource: &Resource, path: &str) -> EngineError {
        tracing::error!(
            resource_id = %resource.id,
            path,
            "chunk text missing, submitting rebuild"
        );
        match self.scheduler.submit(&resource.id, true).await {
            Ok(job_id) => EngineError::IndexCorrupted {
                resource_id: resource.id.clone(),
                job_id,
            },
            Err(e) => e,
        }
    }
}
