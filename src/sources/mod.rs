//! Per-kind source capabilities.
//!
//! Each [`ResourceKind`] maps to one [`SourceKind`] implementation that
//! knows how to validate a locator, fetch a [`SourceSnapshot`], and which
//! [`Chunker`] suits its content. The ingestion pipeline only talks to this
//! trait.
//!
//! | Kind | Implementation | Fetch |
//! |------|----------------|-------|
//! | repository | [`repository::RepositorySource`] | local directory walk or shallow `git` clone |
//! | documentation | [`documentation::DocumentationSource`] | same-origin HTTP crawl |
//! | package | [`package::PackageSource`] | [`PackageResolver`](crate::packages::PackageResolver) then directory walk |

pub mod documentation;
pub mod package;
pub mod repository;

use anyhow::{bail, Result};
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use resource_index_core::chunk::Chunker;
use resource_index_core::models::{
    Resource, ResourceKind, SourceFile, SourceOptions, SourceSnapshot,
};

use crate::config::Config;
use crate::error::EngineError;
use crate::packages::PackageResolver;

/// Paths never indexed, whatever the include globs say.
pub const DEFAULT_EXCLUDES: [&str; 3] = ["**/.git/**", "**/target/**", "**/node_modules/**"];

#[async_trait]
pub trait SourceKind: Send + Sync {
    fn kind(&self) -> ResourceKind;

    /// Check a locator and its options before a resource is registered.
    /// Returns the canonical locator the catalog keys the resource by.
    fn validate(&self, locator: &str, options: &SourceOptions) -> Result<String, EngineError>;

    /// Produce the full current content of a resource. Implementations
    /// should give up promptly once `cancel` fires.
    async fn fetch(
        &self,
        resource: &Resource,
        cancel: &CancellationToken,
    ) -> Result<SourceSnapshot>;

    fn chunker(&self) -> &dyn Chunker;
}

/// The capability table consulted by the pipeline and the engine.
#[derive(Clone)]
pub struct SourceKinds {
    kinds: HashMap<ResourceKind, Arc<dyn SourceKind>>,
}

impl SourceKinds {
    pub fn standard(config: &Config, resolver: Arc<PackageResolver>) -> Result<Self> {
        let kinds = Self {
            kinds: HashMap::new(),
        };
        Ok(kinds
            .with(Arc::new(repository::RepositorySource::new(config)?))
            .with(Arc::new(documentation::DocumentationSource::new(config)?))
            .with(Arc::new(package::PackageSource::new(config, resolver)?)))
    }

    /// Register `source` for its kind, replacing any previous one.
    pub fn with(mut self, source: Arc<dyn SourceKind>) -> Self {
        self.kinds.insert(source.kind(), source);
        self
    }

    pub fn get(&self, kind: ResourceKind) -> Result<&Arc<dyn SourceKind>, EngineError> {
        self.kinds
            .get(&kind)
            .ok_or_else(|| EngineError::invalid(format!("no source registered for kind {kind}")))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Directory walking
// ═══════════════════════════════════════════════════════════════════════

/// Include/exclude glob filter over root-relative paths.
#[derive(Debug, Clone)]
pub struct FileFilter {
    include: GlobSet,
    exclude: GlobSet,
}

impl FileFilter {
    /// [`DEFAULT_EXCLUDES`] are always added to `exclude`.
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self> {
        let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
        excludes.extend(exclude.iter().cloned());
        Ok(Self {
            include: build_globset(include)?,
            exclude: build_globset(&excludes)?,
        })
    }

    pub fn is_match(&self, relative_path: &str) -> bool {
        !self.exclude.is_match(relative_path) && self.include.is_match(relative_path)
    }
}

pub fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// Read every file under `root` that passes `filter`, sorted by path.
///
/// Unreadable entries and files over `max_file_bytes` are skipped with a
/// warning instead of failing the walk. Blocking; run it on
/// `spawn_blocking` from async code.
pub fn walk_tree(
    root: &Path,
    filter: &FileFilter,
    max_file_bytes: usize,
) -> Result<SourceSnapshot> {
    if !root.exists() {
        bail!("source root does not exist: {}", root.display());
    }

    let mut snapshot = SourceSnapshot::default();

    if root.is_file() {
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        snapshot.files.push(SourceFile {
            path: name,
            bytes: std::fs::read(root)?,
        });
        return Ok(snapshot);
    }

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                snapshot.warnings.push(format!("skipped unreadable entry: {e}"));
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().replace('\\', "/");
        if !filter.is_match(&rel_str) {
            continue;
        }

        let len = entry.metadata().map(|m| m.len()).unwrap_or(0);
        if len > max_file_bytes as u64 {
            snapshot
                .warnings
                .push(format!("{rel_str}: file is {len} bytes, limit is {max_file_bytes}"));
            continue;
        }

        match std::fs::read(path) {
            Ok(bytes) => snapshot.files.push(SourceFile {
                path: rel_str,
                bytes,
            }),
            Err(e) => snapshot.warnings.push(format!("{rel_str}: {e}")),
        }
    }

    snapshot.files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_walk_applies_filters() {
        let tmp = tempfile::TempDir::new().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::create_dir_all(root.join("target/debug")).unwrap();
        std::fs::write(root.join("src/lib.rs"), "pub fn a() {}").unwrap();
        std::fs::write(root.join("README.md"), "# Readme").unwrap();
        std::fs::write(root.join("target/debug/out.rs"), "junk").unwrap();
        std::fs::write(root.join("big.txt"), "x".repeat(100)).unwrap();

        let filter = FileFilter::new(&["**/*".to_string()], &["*.md".to_string()]).unwrap();
        let snap = walk_tree(root, &filter, 50).unwrap();

        let paths: Vec<&str> = snap.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["src/lib.rs"]);
        assert_eq!(snap.warnings.len(), 1);
        assert!(snap.warnings[0].starts_with("big.txt"));
    }

    #[test]
    fn test_walk_missing_root() {
        let filter = FileFilter::new(&["**/*".to_string()], &[]).unwrap();
        assert!(walk_tree(Path::new("/definitely/not/here"), &filter, 10).is_err());
    }
}
