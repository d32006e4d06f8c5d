//! Package sources: resolve through the [`PackageResolver`], then walk the
//! package directory with the `[packages]` include globs.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use resource_index_core::chunk::{ByExtensionChunker, Chunker};
use resource_index_core::models::{Resource, ResourceKind, SourceOptions, SourceSnapshot};

use super::{walk_tree, FileFilter, SourceKind};
use crate::config::Config;
use crate::error::EngineError;
use crate::packages::PackageResolver;
use crate::registry::package_locator;

pub struct PackageSource {
    resolver: Arc<PackageResolver>,
    filter: FileFilter,
    max_file_bytes: usize,
    chunker: ByExtensionChunker,
}

impl PackageSource {
    pub fn new(config: &Config, resolver: Arc<PackageResolver>) -> Result<Self> {
        Ok(Self {
            resolver,
            filter: FileFilter::new(&config.packages.include_globs, &[])?,
            max_file_bytes: config.repository.max_file_bytes,
            chunker: ByExtensionChunker::new(
                config.chunking.max_tokens,
                config.chunking.code_max_lines,
            ),
        })
    }
}

#[async_trait]
impl SourceKind for PackageSource {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Package
    }

    /// The locator of a package is derived from its options, so `locator`
    /// is ignored.
    fn validate(&self, _locator: &str, options: &SourceOptions) -> Result<String, EngineError> {
        let SourceOptions::Package {
            registry,
            name,
            version,
        } = options
        else {
            return Err(EngineError::invalid("package resources need package options"));
        };
        let name = name.trim();
        if name.is_empty() {
            return Err(EngineError::invalid("package name cannot be empty"));
        }
        Ok(package_locator(registry.as_str(), name, version.as_deref()))
    }

    async fn fetch(
        &self,
        resource: &Resource,
        cancel: &CancellationToken,
    ) -> Result<SourceSnapshot> {
        let SourceOptions::Package {
            registry,
            name,
            version,
        } = &resource.options
        else {
            anyhow::bail!("resource {} has no package options", resource.id);
        };

        let root = tokio::select! {
            resolved = self.resolver.resolve(*registry, name, version.as_deref()) => resolved?,
            _ = cancel.cancelled() => anyhow::bail!("cancelled"),
        };
        tracing::debug!(resource_id = %resource.id, path = %root.display(), "package resolved");

        let filter = self.filter.clone();
        let max = self.max_file_bytes;
        tokio::task::spawn_blocking(move || walk_tree(&root, &filter, max))
            .await
            .context("directory walk panicked")?
    }

    fn chunker(&self) -> &dyn Chunker {
        &self.chunker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use resource_index_core::models::{PackageRegistry, ResourceState};

    fn source(config: &Config) -> PackageSource {
        let resolver = Arc::new(PackageResolver::new(config).unwrap());
        PackageSource::new(config, resolver).unwrap()
    }

    #[test]
    fn test_validate_builds_locator() {
        let tmp = tempfile::TempDir::new().unwrap();
        let source = source(&Config::with_workdir(tmp.path()));
        let opts = SourceOptions::Package {
            registry: PackageRegistry::Npm,
            name: "left-pad".into(),
            version: Some("1.3.0".into()),
        };
        assert_eq!(source.validate("", &opts).unwrap(), "npm:left-pad@1.3.0");
        assert!(source
            .validate("", &SourceOptions::Repository { git_ref: None })
            .is_err());
    }

    #[tokio::test]
    async fn test_fetch_local_package() {
        let tmp = tempfile::TempDir::new().unwrap();
        let site = tmp.path().join("site");
        std::fs::create_dir_all(site.join("tiny_pkg")).unwrap();
        std::fs::write(site.join("tiny_pkg/__init__.py"), "def hello():\n    return 1\n").unwrap();
        std::fs::write(site.join("tiny_pkg/data.bin"), [0u8, 1, 2]).unwrap();

        let mut config = Config::with_workdir(tmp.path().join("work"));
        config.packages.local_roots = vec![site];
        config.packages.discover_site_packages = false;
        let source = source(&config);

        let options = SourceOptions::Package {
            registry: PackageRegistry::Local,
            name: "tiny-pkg".into(),
            version: None,
        };
        let resource = Resource {
            id: "p1".into(),
            kind: ResourceKind::Package,
            source_locator: "local:tiny-pkg".into(),
            display_name: "tiny-pkg".into(),
            state: ResourceState::Indexing,
            options,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            last_error: None,
            current_generation: None,
        };
        let snap = source.fetch(&resource, &CancellationToken::new()).await.unwrap();
        let paths: Vec<&str> = snap.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["__init__.py"]);
    }
}
