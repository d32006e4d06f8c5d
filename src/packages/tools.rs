//! Search tools over a resolved package directory.
//!
//! These work on any local path and never touch the catalog: `grep` and
//! `read_file` read files directly, and [`PackageSearcher::hybrid`] builds
//! a throwaway in-memory index for the duration of one call.

use regex::{Regex, RegexBuilder};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use resource_index_core::chunk::{chunk_id, decode_text, ByExtensionChunker, Chunker};
use resource_index_core::embedding::Embedder;
use resource_index_core::models::{SearchHit, Span};
use resource_index_core::search::{rank, Candidate, LexicalMatcher};
use resource_index_core::store::memory::InMemoryVectorStore;
use resource_index_core::store::VectorStore;

use crate::config::{Config, EmbeddingConfig};
use crate::error::{EngineError, Result};
use crate::providers::embed_with_retry;
use crate::sources::{walk_tree, FileFilter};

/// Cap on matching lines returned in `content` mode.
pub const MAX_GREP_LINES: usize = 500;

/// What `grep` reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GrepOutputMode {
    #[default]
    Content,
    FilesWithMatches,
    Count,
}

impl FromStr for GrepOutputMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "content" => Ok(GrepOutputMode::Content),
            "files_with_matches" | "files" => Ok(GrepOutputMode::FilesWithMatches),
            "count" => Ok(GrepOutputMode::Count),
            other => Err(EngineError::invalid(format!(
                "unknown output mode '{other}' (expected content, files_with_matches, or count)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GrepLine {
    pub path: String,
    pub line_number: usize,
    pub line: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileCount {
    pub path: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum GrepOutput {
    Content { matches: Vec<GrepLine>, truncated: bool },
    FilesWithMatches { files: Vec<String> },
    Count { counts: Vec<FileCount>, total: usize },
}

/// Run `pattern` over every text file under `root` that passes `filter`.
/// Binary and oversized files are skipped silently.
pub async fn grep(
    root: &Path,
    pattern: &str,
    mode: GrepOutputMode,
    filter: &FileFilter,
    max_file_bytes: usize,
) -> Result<GrepOutput> {
    let re = compile(pattern)?;
    let snapshot = walk(root, filter, max_file_bytes).await?;

    let mut matches = Vec::new();
    let mut truncated = false;
    let mut files = Vec::new();
    let mut counts = Vec::new();

    for file in &snapshot.files {
        let Ok(text) = decode_text(&file.bytes, max_file_bytes) else {
            continue;
        };
        let mut count = 0;
        for (i, line) in text.lines().enumerate() {
            if !re.is_match(line) {
                continue;
            }
            count += 1;
            if mode == GrepOutputMode::Content {
                if matches.len() >= MAX_GREP_LINES {
                    truncated = true;
                    break;
                }
                matches.push(GrepLine {
                    path: file.path.clone(),
                    line_number: i + 1,
                    line: line.to_string(),
                });
            }
        }
        if count > 0 {
            files.push(file.path.clone());
            counts.push(FileCount {
                path: file.path.clone(),
                count,
            });
        }
        if truncated {
            break;
        }
    }

    Ok(match mode {
        GrepOutputMode::Content => GrepOutput::Content { matches, truncated },
        GrepOutputMode::FilesWithMatches => GrepOutput::FilesWithMatches { files },
        GrepOutputMode::Count => {
            let total = counts.iter().map(|c| c.count).sum();
            GrepOutput::Count { counts, total }
        }
    })
}

fn compile(pattern: &str) -> Result<Regex> {
    if pattern.is_empty() {
        return Err(EngineError::invalid("pattern cannot be empty"));
    }
    RegexBuilder::new(pattern)
        .size_limit(1 << 20)
        .build()
        .map_err(|e| EngineError::invalid(format!("invalid pattern: {e}")))
}

async fn walk(
    root: &Path,
    filter: &FileFilter,
    max_file_bytes: usize,
) -> Result<resource_index_core::models::SourceSnapshot> {
    let root = root.to_path_buf();
    let filter = filter.clone();
    let snapshot = tokio::task::spawn_blocking(move || walk_tree(&root, &filter, max_file_bytes))
        .await
        .map_err(|e| EngineError::Internal(anyhow::anyhow!("directory walk panicked: {e}")))??;
    Ok(snapshot)
}

/// A line range of one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileSlice {
    pub path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub total_lines: usize,
    pub text: String,
}

/// Read lines `start_line..=end_line` (1-based) of `file` under `root`.
///
/// `end_line` past the end of the file is clamped; `None` reads to the end.
/// Absolute paths and paths leaving `root` are rejected.
pub async fn read_file(
    root: &Path,
    file: &str,
    start_line: usize,
    end_line: Option<usize>,
) -> Result<FileSlice> {
    if start_line < 1 || end_line.is_some_and(|end| end < start_line) {
        return Err(EngineError::invalid("invalid line range"));
    }

    let path = confine(root, file)?;
    let bytes = tokio::fs::read(&path).await?;
    let text = decode_text(&bytes, usize::MAX)
        .map_err(|e| EngineError::invalid(format!("{file}: {e}")))?;

    let lines: Vec<&str> = text.lines().collect();
    let total = lines.len();
    if start_line > total.max(1) {
        return Err(EngineError::invalid("invalid line range"));
    }
    let end = end_line.unwrap_or(total).min(total);
    let text = if total == 0 {
        String::new()
    } else {
        lines[start_line - 1..end].join("\n")
    };

    Ok(FileSlice {
        path: file.to_string(),
        start_line,
        end_line: end,
        total_lines: total,
        text,
    })
}

/// Resolve `file` inside `root`, refusing anything that lands outside it.
fn confine(root: &Path, file: &str) -> Result<PathBuf> {
    let relative = Path::new(file);
    if file.is_empty()
        || relative.is_absolute()
        || relative
            .components()
            .any(|c| matches!(c, Component::Prefix(_) | Component::RootDir))
    {
        return Err(EngineError::invalid(
            "file must be a path relative to the package root",
        ));
    }

    let root = root
        .canonicalize()
        .map_err(|_| EngineError::not_found("package path", root.display().to_string()))?;

    // A single-module package resolves to the module file itself.
    if root.is_file() {
        let name = root.file_name().map(|n| n.to_string_lossy().to_string());
        return if name.as_deref() == Some(file) {
            Ok(root)
        } else {
            Err(EngineError::not_found("file", file))
        };
    }

    let joined = root.join(relative);
    let canonical = joined
        .canonicalize()
        .map_err(|_| EngineError::not_found("file", file))?;
    if !canonical.starts_with(&root) {
        return Err(EngineError::invalid("path escapes the package root"));
    }
    if !canonical.is_file() {
        return Err(EngineError::not_found("file", file));
    }
    Ok(canonical)
}

// ═══════════════════════════════════════════════════════════════════════
// Ephemeral hybrid search
// ═══════════════════════════════════════════════════════════════════════

struct EphemeralChunk {
    chunk_id: String,
    path: String,
    span: Span,
    text: String,
}

/// Chunks, embeds, and searches a package directory in memory.
pub struct PackageSearcher {
    embedder: Arc<dyn Embedder>,
    chunker: ByExtensionChunker,
    filter: FileFilter,
    max_files: usize,
    max_file_bytes: usize,
    lexical_boost: f32,
    candidate_k: usize,
    embedding: EmbeddingConfig,
}

impl PackageSearcher {
    pub fn new(config: &Config, embedder: Arc<dyn Embedder>) -> anyhow::Result<Self> {
        Ok(Self {
            embedder,
            chunker: ByExtensionChunker::new(
                config.chunking.max_tokens,
                config.chunking.code_max_lines,
            ),
            filter: FileFilter::new(&config.packages.include_globs, &[])?,
            max_files: config.packages.max_files,
            max_file_bytes: config.repository.max_file_bytes,
            lexical_boost: config.retrieval.lexical_boost,
            candidate_k: config.retrieval.candidate_k,
            embedding: config.embedding.clone(),
        })
    }

    /// Rank chunks of the package at `root` against every query.
    ///
    /// `label` names the package in the returned hits' `resource_id`. With
    /// `pattern`, lexical matching uses the regex instead of query terms.
    pub async fn hybrid(
        &self,
        root: &Path,
        label: &str,
        queries: &[String],
        pattern: Option<&str>,
        top_k: usize,
    ) -> Result<Vec<SearchHit>> {
        let queries: Vec<&str> = queries
            .iter()
            .map(|q| q.trim())
            .filter(|q| !q.is_empty())
            .collect();
        if queries.is_empty() && pattern.is_none() {
            return Err(EngineError::invalid("provide at least one query or a pattern"));
        }
        let pattern = pattern
            .map(|p| {
                LexicalMatcher::pattern(p)
                    .map_err(|e| EngineError::invalid(format!("invalid pattern: {e}")))
            })
            .transpose()?;

        let chunks = self.chunk_package(root).await?;
        if chunks.is_empty() {
            return Ok(Vec::new());
        }
        tracing::debug!(package = label, chunks = chunks.len(), "ephemeral index built");

        let mut semantic: HashMap<String, f32> = HashMap::new();
        let mut lexical: Vec<bool> = vec![false; chunks.len()];

        if !queries.is_empty() {
            let store = self.embed_chunks(label, &chunks).await?;
            let cancel = CancellationToken::new();
            let query_texts: Vec<String> = queries.iter().map(|q| q.to_string()).collect();
            let query_vectors = embed_with_retry(
                self.embedder.as_ref(),
                &query_texts,
                &self.embedding,
                &cancel,
            )
            .await?;

            for (query, vector) in queries.iter().zip(&query_vectors) {
                for scored in store.query(label, 0, vector, self.candidate_k).await? {
                    if scored.score <= 0.0 {
                        continue;
                    }
                    let best = semantic.entry(scored.chunk_id).or_insert(scored.score);
                    if scored.score > *best {
                        *best = scored.score;
                    }
                }
                if pattern.is_none() {
                    let matcher = LexicalMatcher::terms(query);
                    for (i, chunk) in chunks.iter().enumerate() {
                        lexical[i] |= matcher.is_match(&chunk.text);
                    }
                }
            }
        }
        if let Some(matcher) = &pattern {
            for (i, chunk) in chunks.iter().enumerate() {
                lexical[i] = matcher.is_match(&chunk.text);
            }
        }

        let candidates = chunks
            .into_iter()
            .zip(lexical)
            .map(|(chunk, lexical)| Candidate {
                resource_id: label.to_string(),
                semantic: semantic.get(&chunk.chunk_id).copied(),
                chunk_id: chunk.chunk_id,
                source_path: chunk.path,
                span: chunk.span,
                text: chunk.text,
                lexical,
            })
            .collect();
        Ok(rank(candidates, self.lexical_boost, top_k))
    }

    async fn chunk_package(&self, root: &Path) -> Result<Vec<EphemeralChunk>> {
        let mut snapshot = walk(root, &self.filter, self.max_file_bytes).await?;
        if snapshot.files.len() > self.max_files {
            tracing::debug!(
                files = snapshot.files.len(),
                max_files = self.max_files,
                "package has more files than the ephemeral index takes"
            );
            snapshot.files.truncate(self.max_files);
        }

        let mut chunks = Vec::new();
        for file in &snapshot.files {
            let Ok(text) = decode_text(&file.bytes, self.max_file_bytes) else {
                continue;
            };
            let Ok(drafts) = self.chunker.chunk(&file.path, text) else {
                continue;
            };
            for (ordinal, draft) in drafts.into_iter().enumerate() {
                chunks.push(EphemeralChunk {
                    chunk_id: chunk_id("package", &file.path, ordinal, &draft.content_hash),
                    path: file.path.clone(),
                    span: draft.span,
                    text: draft.text,
                });
            }
        }
        Ok(chunks)
    }

    async fn embed_chunks(
        &self,
        label: &str,
        chunks: &[EphemeralChunk],
    ) -> Result<InMemoryVectorStore> {
        let store = InMemoryVectorStore::new();
        let mut segment = store.create_segment(label, 0, self.embedder.dims());
        let cancel = CancellationToken::new();

        for batch in chunks.chunks(self.embedding.batch_size.max(1)) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors =
                embed_with_retry(self.embedder.as_ref(), &texts, &self.embedding, &cancel).await?;
            for (chunk, vector) in batch.iter().zip(&vectors) {
                segment.upsert(&chunk.chunk_id, vector, &chunk.path)?;
            }
        }
        store.seal(segment).await?;
        Ok(store)
    }
}
