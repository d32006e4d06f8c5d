//! Core data models shared by the catalog, the ingestion pipeline, and the
//! query engine.
//!
//! Enum values are persisted as lowercase strings; every enum here has a
//! matching `as_str` / [`FromStr`] pair so SQLite rows and CLI arguments
//! round-trip through the same spelling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::diff::FileDiff;

/// Error returned when a string does not name a known enum variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {what}: '{value}'")]
pub struct ParseEnumError {
    pub what: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(what: &'static str, value: &str) -> Self {
        Self {
            what,
            value: value.to_string(),
        }
    }
}

/// The kind of content a resource was indexed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Repository,
    Documentation,
    Package,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 3] = [
        ResourceKind::Repository,
        ResourceKind::Documentation,
        ResourceKind::Package,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Repository => "repository",
            ResourceKind::Documentation => "documentation",
            ResourceKind::Package => "package",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "repository" | "repo" | "codebase" => Ok(ResourceKind::Repository),
            "documentation" | "docs" => Ok(ResourceKind::Documentation),
            "package" | "pkg" => Ok(ResourceKind::Package),
            _ => Err(ParseEnumError::new("resource kind", s)),
        }
    }
}

/// Lifecycle state of a resource.
///
/// ```text
/// UNINITIALIZED → QUEUED → INDEXING → READY | FAILED
/// READY  → INDEXING     (re-index)
/// FAILED → QUEUED       (retry)
/// *      → DELETED      (terminal)
/// ```
///
/// A READY resource stays READY while its next job waits for a worker, so
/// queries keep being served from the committed generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceState {
    Uninitialized,
    Queued,
    Indexing,
    Ready,
    Failed,
    Deleted,
}

impl ResourceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceState::Uninitialized => "uninitialized",
            ResourceState::Queued => "queued",
            ResourceState::Indexing => "indexing",
            ResourceState::Ready => "ready",
            ResourceState::Failed => "failed",
            ResourceState::Deleted => "deleted",
        }
    }

    pub fn is_live(&self) -> bool {
        *self != ResourceState::Deleted
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// `QUEUED → READY` covers a pending job that is cancelled or
    /// interrupted on a resource which still has a committed generation.
    pub fn can_transition_to(&self, next: ResourceState) -> bool {
        use ResourceState::*;
        match (self, next) {
            (Deleted, _) => false,
            (_, Deleted) => true,
            (Uninitialized, Queued) => true,
            (Queued, Indexing) | (Queued, Ready) | (Queued, Failed) => true,
            (Indexing, Ready) | (Indexing, Failed) => true,
            (Ready, Indexing) => true,
            (Failed, Queued) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceState {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uninitialized" => Ok(ResourceState::Uninitialized),
            "queued" => Ok(ResourceState::Queued),
            "indexing" => Ok(ResourceState::Indexing),
            "ready" => Ok(ResourceState::Ready),
            "failed" => Ok(ResourceState::Failed),
            "deleted" => Ok(ResourceState::Deleted),
            _ => Err(ParseEnumError::new("resource state", s)),
        }
    }
}

/// State of an indexing job. Cancellation and timeouts end in `Failed`
/// with the reason recorded in [`IndexJob::error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "running" => Ok(JobState::Running),
            "succeeded" => Ok(JobState::Succeeded),
            "failed" => Ok(JobState::Failed),
            _ => Err(ParseEnumError::new("job state", s)),
        }
    }
}

/// Pipeline step a job is currently in. Reported through job progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPhase {
    #[default]
    Queued,
    Fetching,
    Diffing,
    Chunking,
    Embedding,
    Committing,
    Done,
}

impl JobPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobPhase::Queued => "queued",
            JobPhase::Fetching => "fetching",
            JobPhase::Diffing => "diffing",
            JobPhase::Chunking => "chunking",
            JobPhase::Embedding => "embedding",
            JobPhase::Committing => "committing",
            JobPhase::Done => "done",
        }
    }
}

/// What a chunk was cut from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    Code,
    Prose,
    Symbol,
}

impl ChunkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkKind::Code => "code",
            ChunkKind::Prose => "prose",
            ChunkKind::Symbol => "symbol",
        }
    }
}

impl FromStr for ChunkKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "code" => Ok(ChunkKind::Code),
            "prose" => Ok(ChunkKind::Prose),
            "symbol" => Ok(ChunkKind::Symbol),
            _ => Err(ParseEnumError::new("chunk kind", s)),
        }
    }
}

/// 1-based, inclusive line range within a source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start_line: u32,
    pub end_line: u32,
}

impl Span {
    pub fn new(start_line: u32, end_line: u32) -> Self {
        Self {
            start_line,
            end_line,
        }
    }

    pub fn line_count(&self) -> u32 {
        self.end_line.saturating_sub(self.start_line) + 1
    }
}

/// Where a package is resolved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageRegistry {
    Local,
    Pypi,
    Npm,
}

impl PackageRegistry {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageRegistry::Local => "local",
            PackageRegistry::Pypi => "pypi",
            PackageRegistry::Npm => "npm",
        }
    }
}

impl fmt::Display for PackageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PackageRegistry {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(PackageRegistry::Local),
            "pypi" | "py_pi" | "python" => Ok(PackageRegistry::Pypi),
            "npm" => Ok(PackageRegistry::Npm),
            _ => Err(ParseEnumError::new("package registry", s)),
        }
    }
}

/// Crawl settings for a documentation resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlOptions {
    /// Glob patterns a page URL must match to be indexed. Empty means all.
    pub url_patterns: Vec<String>,
    /// Glob patterns excluding page URLs from both indexing and link following.
    pub exclude_patterns: Vec<String>,
    pub max_depth: Option<usize>,
    pub max_pages: Option<usize>,
    /// Restrict extracted text to `<main>` / `<article>` when present.
    pub only_main_content: bool,
}

/// Kind-specific fetch options persisted with a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceOptions {
    Repository {
        git_ref: Option<String>,
    },
    Documentation(CrawlOptions),
    Package {
        registry: PackageRegistry,
        name: String,
        version: Option<String>,
    },
}

impl SourceOptions {
    pub fn kind(&self) -> ResourceKind {
        match self {
            SourceOptions::Repository { .. } => ResourceKind::Repository,
            SourceOptions::Documentation(_) => ResourceKind::Documentation,
            SourceOptions::Package { .. } => ResourceKind::Package,
        }
    }
}

/// A catalog entry: one indexed repository, documentation site, or package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    pub kind: ResourceKind,
    pub source_locator: String,
    pub display_name: String,
    pub state: ResourceState,
    pub options: SourceOptions,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub current_generation: Option<i64>,
}

/// Listing view of a [`Resource`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSummary {
    pub id: String,
    pub kind: ResourceKind,
    pub display_name: String,
    pub source_locator: String,
    pub state: ResourceState,
    pub current_generation: Option<i64>,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl From<&Resource> for ResourceSummary {
    fn from(r: &Resource) -> Self {
        Self {
            id: r.id.clone(),
            kind: r.kind,
            display_name: r.display_name.clone(),
            source_locator: r.source_locator.clone(),
            state: r.state,
            current_generation: r.current_generation,
            updated_at: r.updated_at,
            last_error: r.last_error.clone(),
        }
    }
}

/// Counters reported while a job runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobProgress {
    pub phase: JobPhase,
    pub files_seen: u64,
    pub files_changed: u64,
    pub files_unchanged: u64,
    pub files_removed: u64,
    pub chunks_written: u64,
    pub chunks_reused: u64,
    pub embeddings_computed: u64,
    pub warnings: Vec<String>,
}

/// An asynchronous indexing run for one resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexJob {
    pub job_id: String,
    pub resource_id: String,
    pub state: JobState,
    pub force_full: bool,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub progress: JobProgress,
    /// File-level diff against the previous generation, set once diffing ran.
    pub diff: Option<FileDiff>,
    pub error: Option<String>,
}

/// One file produced by a source fetch. `path` is relative to the source
/// root and uses `/` separators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: String,
    pub bytes: Vec<u8>,
}

/// Everything a fetch produced for one resource.
#[derive(Debug, Clone, Default)]
pub struct SourceSnapshot {
    pub files: Vec<SourceFile>,
    /// Source revision, e.g. the git commit SHA, when the source has one.
    pub revision: Option<String>,
    /// Non-fatal problems encountered while fetching (skipped files, pages).
    pub warnings: Vec<String>,
}

/// An indexed chunk of a committed generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub resource_id: String,
    pub generation: i64,
    pub source_path: String,
    pub span: Span,
    pub content_hash: String,
    pub text: String,
    pub kind: ChunkKind,
}

/// Which retrieval path produced a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    Lexical,
    Semantic,
    Both,
}

/// A ranked query result with provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub resource_id: String,
    pub chunk_id: String,
    pub source_path: String,
    pub span: Span,
    pub text: String,
    pub score: f32,
    pub match_kind: MatchKind,
}
