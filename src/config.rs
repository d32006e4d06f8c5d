//! TOML configuration.
//!
//! Every section and field has a default, so an empty file (or no file at
//! all) yields a working local setup: state under `./.rix`, the offline
//! `hash` embedder, two workers.
//!
//! ```toml
//! [storage]
//! dir = "./.rix"
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [jobs]
//! workers = 4
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalConfig,
    pub embedding: EmbeddingConfig,
    pub jobs: JobsConfig,
    pub repository: RepositoryConfig,
    pub documentation: DocumentationConfig,
    pub packages: PackagesConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    /// Working directory holding the catalog, segments, clones, and package cache.
    pub dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./.rix"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ChunkingConfig {
    pub max_tokens: usize,
    /// Line budget for code and symbol chunks.
    pub code_max_lines: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            code_max_lines: default_code_max_lines(),
        }
    }
}

fn default_max_tokens() -> usize {
    400
}
fn default_code_max_lines() -> usize {
    60
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Added to a chunk's score when it also matches lexically.
    pub lexical_boost: f32,
    /// Semantic neighbours fetched per resource before merging.
    pub candidate_k: usize,
    /// Default number of results when a query does not ask for a count.
    pub final_limit: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            lexical_boost: 0.25,
            candidate_k: 50,
            final_limit: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// `hash`, `openai`, `ollama`, or `local`.
    pub provider: String,
    pub model: Option<String>,
    pub dims: Option<usize>,
    pub batch_size: usize,
    pub max_retries: u32,
    pub timeout_secs: u64,
    /// Base URL for `ollama` or an OpenAI-compatible endpoint.
    pub url: Option<String>,
    /// First retry delay; doubles per attempt up to 2^5 times this value.
    pub backoff_base_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
            url: None,
            backoff_base_ms: 1000,
        }
    }
}

fn default_provider() -> String {
    "hash".to_string()
}

pub const DEFAULT_HASH_DIMS: usize = 256;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct JobsConfig {
    /// Size of the worker pool shared by all resources.
    pub workers: usize,
    pub job_timeout_secs: u64,
    pub fetch_timeout_secs: u64,
    /// Finished jobs kept per resource; older rows are deleted.
    pub history_per_resource: usize,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            job_timeout_secs: 3600,
            fetch_timeout_secs: 600,
            history_per_resource: 20,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RepositoryConfig {
    pub include_globs: Vec<String>,
    pub exclude_globs: Vec<String>,
    pub max_file_bytes: usize,
    /// Ref cloned when an index request does not name one.
    pub default_ref: String,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            max_file_bytes: 1_000_000,
            default_ref: "main".to_string(),
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DocumentationConfig {
    pub max_depth: usize,
    pub max_pages: usize,
    pub request_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for DocumentationConfig {
    fn default() -> Self {
        Self {
            max_depth: 3,
            max_pages: 200,
            request_timeout_secs: 30,
            user_agent: format!("rix/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PackagesConfig {
    /// Extra directories searched for locally installed packages.
    pub local_roots: Vec<PathBuf>,
    /// Ask `python3` for its site-packages directories.
    pub discover_site_packages: bool,
    /// File cap for the ephemeral index built by package hybrid search.
    pub max_files: usize,
    pub include_globs: Vec<String>,
    pub pypi_url: String,
    pub npm_url: String,
}

impl Default for PackagesConfig {
    fn default() -> Self {
        Self {
            local_roots: Vec::new(),
            discover_site_packages: true,
            max_files: 50,
            include_globs: vec![
                "**/*.py".to_string(),
                "**/*.pyi".to_string(),
                "**/*.js".to_string(),
                "**/*.mjs".to_string(),
                "**/*.cjs".to_string(),
                "**/*.ts".to_string(),
                "**/*.md".to_string(),
                "**/*.rst".to_string(),
                "**/*.txt".to_string(),
            ],
            pypi_url: "https://pypi.org".to_string(),
            npm_url: "https://registry.npmjs.org".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Defaults with the working directory set to `dir`.
    pub fn with_workdir(dir: impl Into<PathBuf>) -> Self {
        let mut config = Config::default();
        config.storage.dir = dir.into();
        config
    }

    pub fn workdir(&self) -> &Path {
        &self.storage.dir
    }

    pub fn db_path(&self) -> PathBuf {
        self.storage.dir.join("index.sqlite")
    }

    pub fn segments_dir(&self) -> PathBuf {
        self.storage.dir.join("segments")
    }

    pub fn sources_dir(&self) -> PathBuf {
        self.storage.dir.join("sources")
    }

    pub fn packages_dir(&self) -> PathBuf {
        self.storage.dir.join("packages")
    }

    /// Check value ranges and provider requirements.
    pub fn validate(&self) -> Result<()> {
        if self.chunking.max_tokens == 0 {
            bail!("chunking.max_tokens must be > 0");
        }
        if self.chunking.code_max_lines == 0 {
            bail!("chunking.code_max_lines must be > 0");
        }
        if self.retrieval.final_limit == 0 {
            bail!("retrieval.final_limit must be >= 1");
        }
        if self.retrieval.candidate_k == 0 {
            bail!("retrieval.candidate_k must be >= 1");
        }
        if !self.retrieval.lexical_boost.is_finite() || self.retrieval.lexical_boost < 0.0 {
            bail!("retrieval.lexical_boost must be a non-negative number");
        }
        if self.jobs.workers == 0 {
            bail!("jobs.workers must be >= 1");
        }
        if self.jobs.history_per_resource == 0 {
            bail!("jobs.history_per_resource must be >= 1");
        }
        if self.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be >= 1");
        }
        if self.repository.max_file_bytes == 0 {
            bail!("repository.max_file_bytes must be > 0");
        }

        match self.embedding.provider.as_str() {
            "hash" | "local" => {}
            "openai" | "ollama" => {
                if self.embedding.model.is_none() {
                    bail!(
                        "embedding.model must be specified when provider is '{}'",
                        self.embedding.provider
                    );
                }
                if self.embedding.dims.is_none() || self.embedding.dims == Some(0) {
                    bail!(
                        "embedding.dims must be > 0 when provider is '{}'",
                        self.embedding.provider
                    );
                }
            }
            other => bail!(
                "Unknown embedding provider: '{}'. Must be hash, openai, ollama, or local.",
                other
            ),
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}
