//! Package resolution: turn `(registry, name, version?)` into a directory
//! of package source on local disk.
//!
//! | Registry | Lookup |
//! |----------|--------|
//! | `local` | configured roots, Python site-packages, `./node_modules` |
//! | `pypi` | JSON API; a pure-Python wheel is unzipped, otherwise the sdist is untarred |
//! | `npm` | registry metadata; the tarball is untarred and its `package/` dir used |
//!
//! Downloads are cached under `packages/<registry>/<name>/<version>/` and
//! marked with a `.complete` file once extracted, so a cache hit never
//! touches the network again.

pub mod tools;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::OnceCell;

use resource_index_core::models::PackageRegistry;

use crate::config::Config;
use crate::error::EngineError;

const COMPLETE_MARKER: &str = ".complete";

pub struct PackageResolver {
    packages_dir: PathBuf,
    local_roots: Vec<PathBuf>,
    discover_site_packages: bool,
    site_packages: OnceCell<Vec<PathBuf>>,
    client: reqwest::Client,
    pypi_url: String,
    npm_url: String,
}

impl PackageResolver {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.documentation.user_agent.clone())
            .timeout(Duration::from_secs(config.jobs.fetch_timeout_secs.max(1)))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            packages_dir: config.packages_dir(),
            local_roots: config.packages.local_roots.clone(),
            discover_site_packages: config.packages.discover_site_packages,
            site_packages: OnceCell::new(),
            client,
            pypi_url: config.packages.pypi_url.trim_end_matches('/').to_string(),
            npm_url: config.packages.npm_url.trim_end_matches('/').to_string(),
        })
    }

    /// Local path of the package source. `NotFound` when no root or
    /// registry knows the package.
    pub async fn resolve(
        &self,
        registry: PackageRegistry,
        name: &str,
        version: Option<&str>,
    ) -> Result<PathBuf, EngineError> {
        validate_package_name(name)?;
        if let Some(v) = version {
            validate_version(v)?;
        }

        let resolved = match registry {
            PackageRegistry::Local => return self.resolve_local(name).await,
            PackageRegistry::Pypi => self.resolve_pypi(name, version).await,
            PackageRegistry::Npm => self.resolve_npm(name, version).await,
        };
        match resolved {
            Ok(Some(path)) => Ok(path),
            Ok(None) => Err(EngineError::not_found("package", format!("{registry}:{name}"))),
            Err(e) => Err(EngineError::SourceFetch(format!("{registry}:{name}: {e:#}"))),
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // Local
    // ═══════════════════════════════════════════════════════════════════

    async fn local_search_roots(&self) -> Vec<PathBuf> {
        let mut roots = self.local_roots.clone();
        if self.discover_site_packages {
            let discovered = self
                .site_packages
                .get_or_init(discover_site_packages)
                .await;
            roots.extend(discovered.iter().cloned());
        }
        roots.push(PathBuf::from("node_modules"));
        roots
    }

    async fn resolve_local(&self, name: &str) -> Result<PathBuf, EngineError> {
        for root in self.local_search_roots().await {
            for variant in name_variants(name) {
                let dir = root.join(&variant);
                if dir.is_dir() {
                    return Ok(dir);
                }
                let module = root.join(format!("{variant}.py"));
                if module.is_file() {
                    return Ok(module);
                }
            }
        }
        Err(EngineError::not_found("package", format!("local:{name}")))
    }

    // ═══════════════════════════════════════════════════════════════════
    // Remote registries
    // ═══════════════════════════════════════════════════════════════════

    fn cache_dir(&self, registry: PackageRegistry, name: &str, version: &str) -> PathBuf {
        self.packages_dir
            .join(registry.as_str())
            .join(name.replace('/', "__"))
            .join(version)
    }

    async fn get_json(&self, url: &str) -> Result<Option<Value>> {
        let response = self.client.get(url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            bail!("GET {} returned HTTP {}", url, response.status().as_u16());
        }
        Ok(Some(response.json().await?))
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            bail!("GET {} returned HTTP {}", url, response.status().as_u16());
        }
        Ok(response.bytes().await?.to_vec())
    }

    async fn resolve_pypi(&self, name: &str, version: Option<&str>) -> Result<Option<PathBuf>> {
        let url = match version {
            Some(v) => format!("{}/pypi/{}/{}/json", self.pypi_url, name, v),
            None => format!("{}/pypi/{}/json", self.pypi_url, name),
        };
        let Some(meta) = self.get_json(&url).await? else {
            return Ok(None);
        };
        let version = meta["info"]["version"]
            .as_str()
            .context("PyPI metadata has no version")?
            .to_string();
        validate_version(&version).map_err(|e| anyhow::anyhow!("{e}"))?;

        let dir = self.cache_dir(PackageRegistry::Pypi, name, &version);
        if is_complete(&dir) {
            return Ok(Some(dir));
        }

        let files = meta["urls"].as_array().cloned().unwrap_or_default();
        let wheel = files.iter().find(|f| {
            f["packagetype"] == "bdist_wheel"
                && f["filename"]
                    .as_str()
                    .is_some_and(|n| n.ends_with("-none-any.whl"))
        });
        let sdist = files.iter().find(|f| f["packagetype"] == "sdist");

        prepare_dir(&dir).await?;
        if let Some(url) = wheel.and_then(|f| f["url"].as_str()) {
            tracing::info!(package = name, %version, "downloading wheel");
            let bytes = self.download(url).await?;
            let target = dir.clone();
            tokio::task::spawn_blocking(move || unzip(&bytes, &target))
                .await
                .context("wheel extraction panicked")??;
        } else if let Some(url) = sdist.and_then(|f| f["url"].as_str()) {
            tracing::info!(package = name, %version, "downloading sdist");
            let bytes = self.download(url).await?;
            untar(&bytes, &dir).await?;
        } else {
            bail!("no pure-Python wheel or sdist published for {name} {version}");
        }

        mark_complete(&dir).await?;
        Ok(Some(dir))
    }

    async fn resolve_npm(&self, name: &str, version: Option<&str>) -> Result<Option<PathBuf>> {
        let Some(meta) = self
            .get_json(&format!("{}/{}", self.npm_url, name.replace('/', "%2F")))
            .await?
        else {
            return Ok(None);
        };

        let version = match version {
            Some(v) => v.to_string(),
            None => meta["dist-tags"]["latest"]
                .as_str()
                .context("npm metadata has no latest dist-tag")?
                .to_string(),
        };
        validate_version(&version).map_err(|e| anyhow::anyhow!("{e}"))?;
        let Some(tarball) = meta["versions"][version.as_str()]["dist"]["tarball"].as_str() else {
            return Ok(None);
        };

        let dir = self.cache_dir(PackageRegistry::Npm, name, &version);
        if !is_complete(&dir) {
            prepare_dir(&dir).await?;
            tracing::info!(package = name, %version, "downloading tarball");
            let bytes = self.download(tarball).await?;
            untar(&bytes, &dir).await?;
            mark_complete(&dir).await?;
        }

        let package_dir = dir.join("package");
        Ok(Some(if package_dir.is_dir() { package_dir } else { dir }))
    }
}

/// Spellings a package directory may have on disk: as given, with `-`
/// and `_` swapped, and lowercased.
pub fn name_variants(name: &str) -> Vec<String> {
    let mut variants = Vec::new();
    for candidate in [
        name.to_string(),
        name.replace('-', "_"),
        name.replace('_', "-"),
        name.to_lowercase(),
        name.to_lowercase().replace('-', "_"),
    ] {
        if !variants.contains(&candidate) {
            variants.push(candidate);
        }
    }
    variants
}

fn validate_package_name(name: &str) -> Result<(), EngineError> {
    let valid = !name.is_empty()
        && name.len() <= 214
        && !name.contains("..")
        && !name.starts_with('/')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@' | '/'));
    if valid {
        Ok(())
    } else {
        Err(EngineError::invalid(format!("invalid package name '{name}'")))
    }
}

fn validate_version(version: &str) -> Result<(), EngineError> {
    let valid = !version.is_empty()
        && !version.contains("..")
        && version
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '+' | '!'));
    if valid {
        Ok(())
    } else {
        Err(EngineError::invalid(format!("invalid package version '{version}'")))
    }
}

fn is_complete(dir: &Path) -> bool {
    dir.join(COMPLETE_MARKER).is_file()
}

async fn prepare_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        // Partial extraction from an earlier attempt.
        tokio::fs::remove_dir_all(dir).await.ok();
    }
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create {}", dir.display()))
}

async fn mark_complete(dir: &Path) -> Result<()> {
    tokio::fs::write(dir.join(COMPLETE_MARKER), b"")
        .await
        .with_context(|| format!("Failed to mark {} complete", dir.display()))
}

/// Extract a zip archive, skipping entries whose names escape `dest`.
fn unzip(bytes: &[u8], dest: &Path) -> Result<()> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))?;
    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        let Some(relative) = file.enclosed_name() else {
            continue;
        };
        let out = dest.join(relative);
        if file.is_dir() {
            std::fs::create_dir_all(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut contents = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut contents)?;
        std::fs::write(&out, contents)?;
    }
    Ok(())
}

/// Extract a `.tar.gz` with the system `tar`.
async fn untar(bytes: &[u8], dest: &Path) -> Result<()> {
    let archive = dest.with_extension("tar.gz");
    tokio::fs::write(&archive, bytes).await?;
    let output = tokio::process::Command::new("tar")
        .arg("-xzf")
        .arg(&archive)
        .arg("-C")
        .arg(dest)
        .kill_on_drop(true)
        .output()
        .await
        .context("Failed to execute tar")?;
    tokio::fs::remove_file(&archive).await.ok();
    if !output.status.success() {
        bail!(
            "tar failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Site-packages directories reported by `python3`. Empty when Python is
/// not installed.
async fn discover_site_packages() -> Vec<PathBuf> {
    let output = tokio::process::Command::new("python3")
        .args([
            "-c",
            "import site\nfor p in site.getsitepackages() + [site.getusersitepackages()]: print(p)",
        ])
        .kill_on_drop(true)
        .output()
        .await;
    match output {
        Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(PathBuf::from)
            .filter(|p| p.is_dir())
            .collect(),
        _ => {
            tracing::debug!("python3 site-packages discovery unavailable");
            Vec::new()
        }
    }
}
