//! Repository sources: a local directory, or a remote git URL fetched as a
//! shallow clone into `sources/<resource_id>/`.
//!
//! Remote workflow:
//! 1. First fetch: `git clone --depth 1 --branch <ref> --single-branch`.
//! 2. Later fetches: `git fetch --depth 1 origin <ref>` then
//!    `git reset --hard FETCH_HEAD`.
//! 3. Walk the working copy with the configured globs.
//! 4. Record `git rev-parse HEAD` as the snapshot revision.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio_util::sync::CancellationToken;

use resource_index_core::chunk::{ByExtensionChunker, Chunker};
use resource_index_core::models::{Resource, ResourceKind, SourceOptions, SourceSnapshot};

use super::{walk_tree, FileFilter, SourceKind};
use crate::config::Config;
use crate::error::EngineError;
use crate::registry::normalize_locator;

const REMOTE_PREFIXES: [&str; 5] = ["https://", "http://", "ssh://", "git://", "git@"];

pub struct RepositorySource {
    sources_dir: PathBuf,
    filter: FileFilter,
    max_file_bytes: usize,
    default_ref: String,
    chunker: ByExtensionChunker,
}

impl RepositorySource {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            sources_dir: config.sources_dir(),
            filter: FileFilter::new(
                &config.repository.include_globs,
                &config.repository.exclude_globs,
            )?,
            max_file_bytes: config.repository.max_file_bytes,
            default_ref: config.repository.default_ref.clone(),
            chunker: ByExtensionChunker::new(
                config.chunking.max_tokens,
                config.chunking.code_max_lines,
            ),
        })
    }

    async fn walk(&self, root: PathBuf) -> Result<SourceSnapshot> {
        let filter = self.filter.clone();
        let max = self.max_file_bytes;
        tokio::task::spawn_blocking(move || walk_tree(&root, &filter, max))
            .await
            .context("directory walk panicked")?
    }

    async fn fetch_remote(
        &self,
        resource: &Resource,
        git_ref: &str,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let dest = self.sources_dir.join(&resource.id);

        if dest.join(".git").exists() {
            tracing::debug!(resource_id = %resource.id, git_ref, "updating working copy");
            run_git(&["fetch", "--depth", "1", "origin", git_ref], Some(&dest), cancel).await?;
            run_git(&["reset", "--hard", "FETCH_HEAD"], Some(&dest), cancel).await?;
            return Ok(dest);
        }

        tokio::fs::create_dir_all(&self.sources_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.sources_dir.display()))?;
        if dest.exists() {
            // Leftover from an interrupted clone.
            tokio::fs::remove_dir_all(&dest).await.ok();
        }

        tracing::info!(
            resource_id = %resource.id,
            url = %resource.source_locator,
            git_ref,
            "cloning"
        );
        let dest_str = dest.to_string_lossy().to_string();
        let cloned = run_git(
            &[
                "clone",
                "--depth",
                "1",
                "--branch",
                git_ref,
                "--single-branch",
                &resource.source_locator,
                &dest_str,
            ],
            None,
            cancel,
        )
        .await;
        if let Err(e) = cloned {
            tokio::fs::remove_dir_all(&dest).await.ok();
            return Err(e);
        }
        Ok(dest)
    }
}

#[async_trait]
impl SourceKind for RepositorySource {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Repository
    }

    fn validate(&self, locator: &str, options: &SourceOptions) -> Result<String, EngineError> {
        if !matches!(options, SourceOptions::Repository { .. }) {
            return Err(EngineError::invalid("repository resources need repository options"));
        }
        let locator = normalize_locator(locator);
        if locator.is_empty() {
            return Err(EngineError::invalid("repository URL cannot be empty"));
        }
        if let SourceOptions::Repository {
            git_ref: Some(git_ref),
        } = options
        {
            if git_ref.trim().is_empty() || git_ref.starts_with('-') {
                return Err(EngineError::invalid(format!("invalid git ref '{git_ref}'")));
            }
        }

        match local_path(&locator) {
            Some(path) => {
                let canonical = path.canonicalize().map_err(|_| {
                    EngineError::invalid(format!(
                        "repository path does not exist: {}",
                        path.display()
                    ))
                })?;
                Ok(canonical.to_string_lossy().to_string())
            }
            None => Ok(locator),
        }
    }

    async fn fetch(
        &self,
        resource: &Resource,
        cancel: &CancellationToken,
    ) -> Result<SourceSnapshot> {
        let git_ref = match &resource.options {
            SourceOptions::Repository {
                git_ref: Some(git_ref),
            } => git_ref.clone(),
            _ => self.default_ref.clone(),
        };

        let root = match local_path(&resource.source_locator) {
            Some(path) => path,
            None => self.fetch_remote(resource, &git_ref, cancel).await?,
        };

        let mut snapshot = self.walk(root.clone()).await?;
        if root.is_dir() {
            snapshot.revision = run_git(&["rev-parse", "HEAD"], Some(&root), cancel)
                .await
                .ok()
                .filter(|sha| !sha.is_empty());
        }
        Ok(snapshot)
    }

    fn chunker(&self) -> &dyn Chunker {
        &self.chunker
    }
}

/// The filesystem path of a local locator, or `None` for remote URLs.
pub fn local_path(locator: &str) -> Option<PathBuf> {
    if let Some(path) = locator.strip_prefix("file://") {
        return Some(PathBuf::from(path));
    }
    if REMOTE_PREFIXES.iter().any(|p| locator.starts_with(p)) {
        return None;
    }
    Some(PathBuf::from(locator))
}

/// Run git and return its trimmed stdout. The child is killed if `cancel`
/// fires first.
async fn run_git(args: &[&str], cwd: Option<&Path>, cancel: &CancellationToken) -> Result<String> {
    let mut cmd = tokio::process::Command::new("git");
    cmd.args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let output = tokio::select! {
        output = cmd.output() => output.context("Failed to execute git. Is git installed?")?,
        _ = cancel.cancelled() => bail!("cancelled"),
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("git {} failed: {}", args.first().unwrap_or(&""), stderr.trim());
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_path_detection() {
        assert_eq!(local_path("file:///srv/repo"), Some(PathBuf::from("/srv/repo")));
        assert_eq!(local_path("./repo"), Some(PathBuf::from("./repo")));
        assert_eq!(local_path("https://github.com/o/r.git"), None);
        assert_eq!(local_path("git@github.com:o/r.git"), None);
    }

    #[test]
    fn test_validate() {
        let tmp = tempfile::TempDir::new().unwrap();
        let source = RepositorySource::new(&Config::with_workdir(tmp.path())).unwrap();
        let opts = SourceOptions::Repository { git_ref: None };

        let canonical = source
            .validate(&tmp.path().to_string_lossy(), &opts)
            .unwrap();
        assert_eq!(PathBuf::from(canonical), tmp.path().canonicalize().unwrap());
        assert_eq!(
            source.validate("https://github.com/o/r/", &opts).unwrap(),
            "https://github.com/o/r"
        );
        assert!(source.validate("/no/such/dir", &opts).is_err());
        assert!(source
            .validate(
                "https://github.com/o/r",
                &SourceOptions::Repository {
                    git_ref: Some("--upload-pack=x".into())
                }
            )
            .is_err());
        assert!(source
            .validate("https://x", &SourceOptions::Documentation(Default::default()))
            .is_err());
    }

    #[tokio::test]
    async fn test_fetch_local_directory() {
        let tmp = tempfile::TempDir::new().unwrap();
        let repo = tmp.path().join("repo");
        std::fs::create_dir_all(repo.join("src")).unwrap();
        std::fs::write(repo.join("src/main.rs"), "fn main() {}\n").unwrap();

        let source = RepositorySource::new(&Config::with_workdir(tmp.path().join("work"))).unwrap();
        let resource = Resource {
            id: "r1".into(),
            kind: ResourceKind::Repository,
            source_locator: repo.to_string_lossy().to_string(),
            display_name: "repo".into(),
            state: resource_index_core::models::ResourceState::Queued,
            options: SourceOptions::Repository { git_ref: None },
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            last_error: None,
            current_generation: None,
        };

        let snap = source
            .fetch(&resource, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(snap.files.len(), 1);
        assert_eq!(snap.files[0].path, "src/main.rs");
    }
}
