//! The engine: the single entry point over the registry, scheduler,
//! pipeline, query engine, and package tools.
//!
//! ```text
//!            ┌───────────────────────── Engine ──────────────────────────┐
//! index_* ──▶│ SourceKind::validate ─▶ Registry ─▶ Scheduler ─▶ Pipeline │
//! search_* ─▶│ QueryEngine ─▶ catalog + VectorStore                      │
//! source_* ─▶│ Inspector ─▶ generation chunks ─▶ file text, imports      │
//! package_* ▶│ PackageResolver ─▶ grep / read_file / PackageSearcher     │
//!            └───────────────────────────────────────────────────────────┘
//! ```
//!
//! Index requests return as soon as the job is queued; progress is
//! observed through [`Engine::job_status`] or [`Engine::wait_for_job`].
//!
//! ```rust,no_run
//! # async fn demo() -> resource_index::error::Result<()> {
//! use resource_index::config::Config;
//! use resource_index::engine::Engine;
//! use resource_index::query::SearchRequest;
//!
//! let engine = Engine::open(Config::with_workdir("/tmp/rix")).await?;
//! let receipt = engine.index_repository("https://github.com/tokio-rs/tokio", None).await?;
//! engine.wait_for_job(&receipt.job_id, std::time::Duration::from_secs(600)).await?;
//! let hits = engine.search_codebase(&SearchRequest::new("spawn blocking task")).await?;
//! # Ok(()) }
//! ```

use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use resource_index_core::embedding::Embedder;
use resource_index_core::models::{
    CrawlOptions, IndexJob, PackageRegistry, Resource, ResourceKind, ResourceSummary, SearchHit,
    SourceOptions,
};
use resource_index_core::store::VectorStore;

use crate::cas::{ContentStore, GcReport};
use crate::config::Config;
use crate::db::{self, from_millis};
use crate::error::{EngineError, Result};
use crate::inspect::{CodebaseGraph, Inspector, SourceContent, SourceFileEntry};
use crate::jobs::JobStore;
use crate::migrate::run_migrations;
use crate::packages::tools::{self, FileSlice, GrepOutput, GrepOutputMode, PackageSearcher};
use crate::packages::PackageResolver;
use crate::pipeline::Pipeline;
use crate::providers::create_embedder;
use crate::query::{QueryEngine, SearchRequest};
use crate::registry::{documentation_name, repository_name, Registry};
use crate::scheduler::Scheduler;
use crate::segments::FileVectorStore;
use crate::sources::{FileFilter, SourceKind, SourceKinds};

/// Returned by every index request.
#[derive(Debug, Clone, Serialize)]
pub struct IndexReceipt {
    pub resource_id: String,
    pub display_name: String,
    pub job_id: String,
    /// Whether the request registered a new resource.
    pub created: bool,
}

/// Summary row of a committed generation.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationInfo {
    pub generation: i64,
    pub revision: Option<String>,
    pub chunk_count: i64,
    pub file_count: i64,
    pub committed_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceStatus {
    pub resource: Resource,
    pub generation: Option<GenerationInfo>,
    /// The most recent job, with live progress if it is still running.
    pub latest_job: Option<IndexJob>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub version: String,
    pub workdir: PathBuf,
    pub resources: i64,
    pub active_jobs: usize,
    pub embedding_provider: String,
    pub embedding_model: String,
    pub embedding_dims: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PurgeReport {
    pub resources_removed: u64,
}

/// Construction options beyond the config file: swap the embedding
/// backend or a source kind, mainly for tests and embedding hosts.
pub struct EngineBuilder {
    config: Config,
    embedder: Option<Arc<dyn Embedder>>,
    sources: Vec<Arc<dyn SourceKind>>,
}

impl EngineBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            embedder: None,
            sources: Vec::new(),
        }
    }

    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Replace the standard implementation of the source's kind.
    pub fn source(mut self, source: Arc<dyn SourceKind>) -> Self {
        self.sources.push(source);
        self
    }

    /// Create the working directory, migrate the catalog, and recover jobs
    /// a previous process left unfinished.
    pub async fn open(self) -> Result<Engine> {
        let config = self.config;
        config
            .validate()
            .map_err(|e| EngineError::invalid(format!("{e:#}")))?;

        for dir in [
            config.workdir().to_path_buf(),
            config.segments_dir(),
            config.sources_dir(),
            config.packages_dir(),
        ] {
            tokio::fs::create_dir_all(&dir).await?;
        }

        let pool = db::connect(&config.db_path()).await?;
        run_migrations(&pool).await?;

        let embedder = match self.embedder {
            Some(embedder) => embedder,
            None => create_embedder(&config.embedding)?,
        };
        let resolver = Arc::new(PackageResolver::new(&config)?);
        let mut sources = SourceKinds::standard(&config, resolver.clone())?;
        for source in self.sources {
            sources = sources.with(source);
        }

        let vectors: Arc<dyn VectorStore> = Arc::new(FileVectorStore::new(config.segments_dir()));
        let registry = Registry::new(pool.clone());
        let jobs = JobStore::new(pool.clone());
        let pipeline = Pipeline::new(
            pool.clone(),
            vectors.clone(),
            embedder.clone(),
            sources.clone(),
            &config,
        );
        let scheduler = Scheduler::new(registry.clone(), jobs.clone(), pipeline, &config);
        let query = QueryEngine::new(
            pool.clone(),
            vectors.clone(),
            embedder.clone(),
            scheduler.clone(),
            &config,
        );
        let inspector = Inspector::new(pool.clone(), registry.clone(), scheduler.clone());
        let searcher = PackageSearcher::new(&config, embedder.clone())?;
        let grep_filter = FileFilter::new(&config.packages.include_globs, &[])?;

        let restored = scheduler.recover().await?;
        tracing::info!(
            workdir = %config.workdir().display(),
            model = embedder.model_name(),
            restored,
            "engine opened"
        );

        Ok(Engine {
            inner: Arc::new(EngineInner {
                cas: ContentStore::new(pool.clone()),
                config,
                pool,
                registry,
                jobs,
                vectors,
                embedder,
                sources,
                resolver,
                scheduler,
                query,
                inspector,
                searcher,
                grep_filter,
            }),
        })
    }
}

struct EngineInner {
    config: Config,
    pool: SqlitePool,
    registry: Registry,
    jobs: JobStore,
    cas: ContentStore,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    sources: SourceKinds,
    resolver: Arc<PackageResolver>,
    scheduler: Scheduler,
    query: QueryEngine,
    inspector: Inspector,
    searcher: PackageSearcher,
    grep_filter: FileFilter,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub async fn open(config: Config) -> Result<Self> {
        EngineBuilder::new(config).open().await
    }

    pub fn builder(config: Config) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    // ═══════════════════════════════════════════════════════════════════
    // Indexing
    // ═══════════════════════════════════════════════════════════════════

    /// Index a git repository URL or a local directory at `git_ref`
    /// (default `repository.default_ref`; ignored for local directories).
    pub async fn index_repository(&self, url: &str, git_ref: Option<&str>) -> Result<IndexReceipt> {
        let options = SourceOptions::Repository {
            git_ref: git_ref.map(str::to_string),
        };
        self.register_and_submit(url, options, repository_name).await
    }

    pub async fn index_documentation(
        &self,
        url: &str,
        crawl: CrawlOptions,
    ) -> Result<IndexReceipt> {
        self.register_and_submit(url, SourceOptions::Documentation(crawl), documentation_name)
            .await
    }

    /// Resolve a package and index it as a persistent resource.
    pub async fn index_package(
        &self,
        registry: PackageRegistry,
        name: &str,
        version: Option<&str>,
    ) -> Result<IndexReceipt> {
        let options = SourceOptions::Package {
            registry,
            name: name.trim().to_string(),
            version: version.map(str::to_string),
        };
        let display = name.trim().to_string();
        self.register_and_submit("", options, move |_| display.clone())
            .await
    }

    async fn register_and_submit(
        &self,
        locator: &str,
        options: SourceOptions,
        default_name: impl Fn(&str) -> String,
    ) -> Result<IndexReceipt> {
        let inner = &self.inner;
        let source = inner.sources.get(options.kind())?;
        let canonical = source.validate(locator, &options)?;
        let (resource, created) = inner
            .registry
            .create_or_get(&canonical, &default_name(&canonical), options)
            .await?;
        let job_id = inner.scheduler.submit(&resource.id, false).await?;
        Ok(IndexReceipt {
            resource_id: resource.id,
            display_name: resource.display_name,
            job_id,
            created,
        })
    }

    /// Re-run indexing for a known resource. `force_full` ignores the
    /// previous generation and re-chunks every file.
    pub async fn reindex(&self, resource_id: &str, force_full: bool) -> Result<String> {
        self.inner.scheduler.submit(resource_id, force_full).await
    }

    // ═══════════════════════════════════════════════════════════════════
    // Queries
    // ═══════════════════════════════════════════════════════════════════

    /// Search repository and package resources.
    pub async fn search_codebase(&self, request: &SearchRequest) -> Result<Vec<SearchHit>> {
        self.inner
            .query
            .search(&[ResourceKind::Repository, ResourceKind::Package], request)
            .await
    }

    pub async fn search_documentation(&self, request: &SearchRequest) -> Result<Vec<SearchHit>> {
        self.inner
            .query
            .search(&[ResourceKind::Documentation], request)
            .await
    }

    // ═══════════════════════════════════════════════════════════════════
    // Stored sources
    // ═══════════════════════════════════════════════════════════════════

    /// Files of the resource's current generation with their chunk counts.
    pub async fn list_source_files(&self, resource_id: &str) -> Result<Vec<SourceFileEntry>> {
        self.inner.inspector.files(resource_id).await
    }

    /// Text of one indexed file, rebuilt from its stored chunks.
    pub async fn read_source_content(
        &self,
        resource_id: &str,
        path: &str,
    ) -> Result<SourceContent> {
        self.inner.inspector.read(resource_id, path).await
    }

    /// Import graph of a repository or package resource.
    pub async fn visualize_codebase(&self, resource_id: &str) -> Result<CodebaseGraph> {
        self.inner.inspector.graph(resource_id).await
    }

    // ═══════════════════════════════════════════════════════════════════
    // Catalog
    // ═══════════════════════════════════════════════════════════════════

    pub async fn check_resource_status(
        &self,
        kind: ResourceKind,
        name: &str,
    ) -> Result<ResourceStatus> {
        let resource = self.inner.registry.find_by_name(kind, name).await?;
        self.status_of(resource).await
    }

    pub async fn resource_status(&self, resource_id: &str) -> Result<ResourceStatus> {
        let resource = self.inner.registry.get(resource_id).await?;
        self.status_of(resource).await
    }

    async fn status_of(&self, resource: Resource) -> Result<ResourceStatus> {
        let generation = match resource.current_generation {
            Some(generation) => self.generation_info(&resource.id, generation).await?,
            None => None,
        };
        let latest_job = match self.inner.jobs.for_resource(&resource.id, 1).await?.pop() {
            Some(job) => Some(self.inner.scheduler.status(&job.job_id).await.unwrap_or(job)),
            None => None,
        };
        Ok(ResourceStatus {
            resource,
            generation,
            latest_job,
        })
    }

    async fn generation_info(
        &self,
        resource_id: &str,
        generation: i64,
    ) -> Result<Option<GenerationInfo>> {
        let row = sqlx::query(
            "SELECT generation, revision, chunk_count, file_count, committed_at FROM generations \
             WHERE resource_id = ? AND generation = ?",
        )
        .bind(resource_id)
        .bind(generation)
        .fetch_optional(&self.inner.pool)
        .await?;
        Ok(row.map(|row| GenerationInfo {
            generation: row.get("generation"),
            revision: row.get("revision"),
            chunk_count: row.get("chunk_count"),
            file_count: row.get("file_count"),
            committed_at: from_millis(row.get("committed_at")),
        }))
    }

    pub async fn list_resources(&self, kind: Option<ResourceKind>) -> Result<Vec<ResourceSummary>> {
        self.inner.registry.list(kind).await
    }

    pub async fn rename_resource(&self, resource_id: &str, new_name: &str) -> Result<Resource> {
        self.inner.registry.rename(resource_id, new_name).await
    }

    /// Cancel any running job, then remove the resource's catalog rows,
    /// vector segments, and working copy.
    pub async fn delete_resource(&self, resource_id: &str) -> Result<()> {
        let inner = &self.inner;
        inner.registry.get(resource_id).await?;
        inner.scheduler.cancel_resource_and_wait(resource_id).await;
        inner.registry.delete_cascade(resource_id).await?;
        inner.vectors.delete_resource(resource_id).await?;

        let working_copy = inner.config.sources_dir().join(resource_id);
        match tokio::fs::remove_dir_all(&working_copy).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════
    // Jobs
    // ═══════════════════════════════════════════════════════════════════

    pub async fn job_status(&self, job_id: &str) -> Result<IndexJob> {
        self.inner.scheduler.status(job_id).await
    }

    pub async fn cancel_job(&self, job_id: &str) -> Result<()> {
        self.inner.scheduler.cancel(job_id).await
    }

    /// Block until the job finishes. `TimedOut` if it is still running
    /// after `timeout`; the job itself keeps going.
    pub async fn wait_for_job(&self, job_id: &str, timeout: Duration) -> Result<IndexJob> {
        self.inner.scheduler.wait(job_id, timeout).await
    }

    // ═══════════════════════════════════════════════════════════════════
    // Package tools
    // ═══════════════════════════════════════════════════════════════════

    pub async fn package_search_grep(
        &self,
        registry: PackageRegistry,
        name: &str,
        version: Option<&str>,
        pattern: &str,
        mode: GrepOutputMode,
    ) -> Result<GrepOutput> {
        let root = self.inner.resolver.resolve(registry, name, version).await?;
        tools::grep(
            &root,
            pattern,
            mode,
            &self.inner.grep_filter,
            self.inner.config.repository.max_file_bytes,
        )
        .await
    }

    pub async fn package_search_hybrid(
        &self,
        registry: PackageRegistry,
        name: &str,
        version: Option<&str>,
        queries: &[String],
        pattern: Option<&str>,
        top_k: Option<usize>,
    ) -> Result<Vec<SearchHit>> {
        let root = self.inner.resolver.resolve(registry, name, version).await?;
        let label = crate::registry::package_locator(registry.as_str(), name, version);
        let top_k = top_k.unwrap_or(self.inner.config.retrieval.final_limit);
        self.inner
            .searcher
            .hybrid(&root, &label, queries, pattern, top_k)
            .await
    }

    pub async fn package_search_read_file(
        &self,
        registry: PackageRegistry,
        name: &str,
        version: Option<&str>,
        file: &str,
        start_line: usize,
        end_line: Option<usize>,
    ) -> Result<FileSlice> {
        let root = self.inner.resolver.resolve(registry, name, version).await?;
        tools::read_file(&root, file, start_line, end_line).await
    }

    // ═══════════════════════════════════════════════════════════════════
    // Maintenance
    // ═══════════════════════════════════════════════════════════════════

    pub async fn server_status(&self) -> Result<ServerStatus> {
        let inner = &self.inner;
        Ok(ServerStatus {
            version: env!("CARGO_PKG_VERSION").to_string(),
            workdir: inner.config.workdir().to_path_buf(),
            resources: inner.registry.count_live().await?,
            active_jobs: inner.scheduler.active_count().await,
            embedding_provider: inner.config.embedding.provider.clone(),
            embedding_model: inner.embedder.model_name().to_string(),
            embedding_dims: inner.embedder.dims(),
        })
    }

    /// Remove content-store entries and segment directories nothing
    /// references. Refused while any job is active; new jobs are refused
    /// until it returns.
    pub async fn collect_garbage(&self) -> Result<GcReport> {
        let inner = &self.inner;
        let _maintenance = inner.scheduler.begin_maintenance().await?;

        let mut report = inner.cas.collect_garbage().await?;
        let live: Vec<String> =
            sqlx::query_scalar("SELECT id FROM resources WHERE state != 'deleted'")
                .fetch_all(&inner.pool)
                .await?;

        let mut entries = match tokio::fs::read_dir(inner.config.segments_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.file_type().await?.is_dir() && !live.contains(&name) {
                inner.vectors.delete_resource(&name).await?;
                report.segment_dirs_removed += 1;
            }
        }

        tracing::info!(
            chunk_texts = report.chunk_texts_removed,
            embeddings = report.embeddings_removed,
            segment_dirs = report.segment_dirs_removed,
            "garbage collected"
        );
        Ok(report)
    }

    /// Delete every resource, job, and cached artifact. The engine stays
    /// usable afterwards with an empty catalog.
    pub async fn purge(&self) -> Result<PurgeReport> {
        let inner = &self.inner;
        let _maintenance = inner.scheduler.begin_maintenance().await?;

        let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM resources")
            .fetch_all(&inner.pool)
            .await?;
        let live = inner.registry.count_live().await?;
        for id in &ids {
            inner.vectors.delete_resource(id).await?;
        }

        let mut tx = inner.pool.begin().await?;
        for table in [
            "generation_chunks",
            "file_snapshots",
            "generations",
            "jobs",
            "embeddings",
            "chunk_texts",
            "resources",
        ] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        for dir in [
            inner.config.segments_dir(),
            inner.config.sources_dir(),
            inner.config.packages_dir(),
        ] {
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            tokio::fs::create_dir_all(&dir).await?;
        }

        tracing::info!(resources = live, "working directory purged");
        Ok(PurgeReport {
            resources_removed: live as u64,
        })
    }

    /// Cancel running jobs and give them `grace` to record their outcome.
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.scheduler.shutdown(grace).await;
        self.inner.pool.close().await;
    }
}
