//! Durable resource catalog and its lifecycle state machine.
//!
//! Every state change goes through one of the `mark_*` methods, which
//! check [`ResourceState::can_transition_to`] and then update the row
//! conditionally on the state they read, so two writers cannot both win.
//!
//! ```text
//! UNINITIALIZED → QUEUED → INDEXING → READY | FAILED
//!                            ↑           │
//!                            └───────────┘  re-index
//! FAILED → QUEUED (retry)        any live state → DELETED (tombstone)
//! ```
//!
//! Display names are unique per kind among live resources. A new resource
//! whose derived name is taken gets `-2`, `-3`, … appended.

use anyhow::Context;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use resource_index_core::models::{
    Resource, ResourceKind, ResourceState, ResourceSummary, SourceOptions,
};

use crate::db::{from_millis, now_millis};
use crate::error::{EngineError, Result};

const MAX_NAME_LEN: usize = 200;
const MAX_NAME_SUFFIX: usize = 1000;
const MAX_CREATE_ATTEMPTS: usize = 8;

#[derive(Clone)]
pub struct Registry {
    pool: SqlitePool,
}

impl Registry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ═══════════════════════════════════════════════════════════════════
    // Lookup
    // ═══════════════════════════════════════════════════════════════════

    /// Fetch a live resource. Unknown and tombstoned ids are both `NotFound`.
    pub async fn get(&self, id: &str) -> Result<Resource> {
        let row = sqlx::query("SELECT * FROM resources WHERE id = ? AND state != 'deleted'")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => row_to_resource(&row),
            None => Err(EngineError::not_found("resource", id)),
        }
    }

    pub async fn find_by_name(&self, kind: ResourceKind, display_name: &str) -> Result<Resource> {
        let row = sqlx::query(
            "SELECT * FROM resources WHERE kind = ? AND display_name = ? AND state != 'deleted'",
        )
        .bind(kind.as_str())
        .bind(display_name)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => row_to_resource(&row),
            None => Err(EngineError::not_found("resource", format!("{kind} '{display_name}'"))),
        }
    }

    pub async fn find_by_locator(
        &self,
        kind: ResourceKind,
        source_locator: &str,
    ) -> Result<Option<Resource>> {
        let row = sqlx::query(
            "SELECT * FROM resources WHERE kind = ? AND source_locator = ? AND state != 'deleted'",
        )
        .bind(kind.as_str())
        .bind(source_locator)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_resource).transpose()
    }

    /// Live resources, optionally filtered by kind, ordered by kind then name.
    pub async fn list(&self, kind: Option<ResourceKind>) -> Result<Vec<ResourceSummary>> {
        let rows = match kind {
            Some(kind) => {
                sqlx::query(
                    "SELECT * FROM resources WHERE state != 'deleted' AND kind = ? \
                     ORDER BY kind, display_name",
                )
                .bind(kind.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM resources WHERE state != 'deleted' ORDER BY kind, display_name",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter()
            .map(|row| row_to_resource(row).map(|r| ResourceSummary::from(&r)))
            .collect()
    }

    pub async fn count_live(&self) -> Result<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM resources WHERE state != 'deleted'")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // ═══════════════════════════════════════════════════════════════════
    // Creation, rename, delete
    // ═══════════════════════════════════════════════════════════════════

    /// Return the live resource for `source_locator`, creating it if needed.
    ///
    /// The second tuple element is `true` when a new row was inserted.
    /// Concurrent callers converge on one id: a losing insert hits the
    /// partial unique index and re-reads the winner. When an existing
    /// resource is found with different fetch options, the new options
    /// replace the stored ones.
    pub async fn create_or_get(
        &self,
        source_locator: &str,
        default_name: &str,
        options: SourceOptions,
    ) -> Result<(Resource, bool)> {
        let kind = options.kind();
        let base_name = sanitize_name(default_name);

        for _ in 0..MAX_CREATE_ATTEMPTS {
            if let Some(existing) = self.find_by_locator(kind, source_locator).await? {
                if existing.options != options {
                    return Ok((self.update_options(existing, options).await?, false));
                }
                return Ok((existing, false));
            }

            let name = self.free_name(kind, &base_name).await?;
            let id = uuid::Uuid::new_v4().to_string();
            let now = now_millis();
            let options_json =
                serde_json::to_string(&options).context("Failed to serialize source options")?;

            let inserted = sqlx::query(
                "INSERT INTO resources (id, kind, source_locator, display_name, state, options_json, \
                 created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&id)
            .bind(kind.as_str())
            .bind(source_locator)
            .bind(&name)
            .bind(ResourceState::Uninitialized.as_str())
            .bind(&options_json)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await;

            match inserted {
                Ok(_) => {
                    tracing::info!(
                        resource_id = %id,
                        %kind,
                        name = %name,
                        locator = %source_locator,
                        "resource created"
                    );
                    return Ok((self.get(&id).await?, true));
                }
                Err(e) if is_unique_violation(&e) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(EngineError::Busy(format!(
            "could not register {kind} '{source_locator}' under contention"
        )))
    }

    async fn update_options(&self, resource: Resource, options: SourceOptions) -> Result<Resource> {
        let options_json =
            serde_json::to_string(&options).context("Failed to serialize source options")?;
        sqlx::query("UPDATE resources SET options_json = ?, updated_at = ? WHERE id = ?")
            .bind(options_json)
            .bind(now_millis())
            .bind(&resource.id)
            .execute(&self.pool)
            .await?;
        self.get(&resource.id).await
    }

    async fn name_taken(&self, kind: ResourceKind, name: &str) -> Result<bool> {
        let taken: Option<String> = sqlx::query_scalar(
            "SELECT id FROM resources WHERE kind = ? AND display_name = ? AND state != 'deleted'",
        )
        .bind(kind.as_str())
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(taken.is_some())
    }

    async fn free_name(&self, kind: ResourceKind, base: &str) -> Result<String> {
        if !self.name_taken(kind, base).await? {
            return Ok(base.to_string());
        }
        for n in 2..=MAX_NAME_SUFFIX {
            let candidate = format!("{base}-{n}");
            if !self.name_taken(kind, &candidate).await? {
                return Ok(candidate);
            }
        }
        Err(EngineError::Conflict {
            kind,
            name: base.to_string(),
        })
    }

    pub async fn rename(&self, id: &str, new_name: &str) -> Result<Resource> {
        let new_name = new_name.trim();
        validate_name(new_name)?;
        let resource = self.get(id).await?;
        if resource.display_name == new_name {
            return Ok(resource);
        }

        let result = sqlx::query(
            "UPDATE resources SET display_name = ?, updated_at = ? WHERE id = ? AND state != 'deleted'",
        )
        .bind(new_name)
        .bind(now_millis())
        .bind(id)
        .execute(&self.pool)
        .await;

        match result {
            Ok(r) if r.rows_affected() == 0 => Err(EngineError::not_found("resource", id)),
            Ok(_) => {
                tracing::info!(
                    resource_id = %id,
                    from = %resource.display_name,
                    to = %new_name,
                    "resource renamed"
                );
                self.get(id).await
            }
            Err(e) if is_unique_violation(&e) => Err(EngineError::Conflict {
                kind: resource.kind,
                name: new_name.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove every catalog row of a resource and tombstone it, in one
    /// transaction. Segment files and working copies are the caller's job.
    pub async fn delete_cascade(&self, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let tombstoned = sqlx::query(
            "UPDATE resources SET state = 'deleted', current_generation = NULL, updated_at = ? \
             WHERE id = ? AND state != 'deleted'",
        )
        .bind(now_millis())
        .bind(id)
        .execute(&mut *tx)
        .await?;
        if tombstoned.rows_affected() == 0 {
            return Err(EngineError::not_found("resource", id));
        }

        for table in ["generation_chunks", "file_snapshots", "generations", "jobs"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE resource_id = ?"))
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        tracing::info!(resource_id = %id, "resource deleted");
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════
    // State transitions
    // ═══════════════════════════════════════════════════════════════════

    async fn transition(
        &self,
        id: &str,
        to: ResourceState,
        last_error: Option<&str>,
    ) -> Result<ResourceState> {
        let current = self.get(id).await?;
        if !current.state.can_transition_to(to) {
            return Err(EngineError::IllegalTransition {
                id: id.to_string(),
                from: current.state,
                to,
            });
        }

        let result = sqlx::query(
            "UPDATE resources SET state = ?, last_error = ?, updated_at = ? WHERE id = ? AND state = ?",
        )
        .bind(to.as_str())
        .bind(last_error)
        .bind(now_millis())
        .bind(id)
        .bind(current.state.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Lost a race; report against whatever the row holds now.
            let now = self.get(id).await?;
            return Err(EngineError::IllegalTransition {
                id: id.to_string(),
                from: now.state,
                to,
            });
        }
        tracing::debug!(resource_id = %id, from = %current.state, to = %to, "resource state");
        Ok(to)
    }

    /// A job was submitted. A READY resource stays READY so it keeps
    /// serving queries; a QUEUED one is left alone.
    pub async fn mark_queued(&self, id: &str) -> Result<ResourceState> {
        let current = self.get(id).await?;
        match current.state {
            ResourceState::Ready | ResourceState::Queued => Ok(current.state),
            _ => self.transition(id, ResourceState::Queued, None).await,
        }
    }

    pub async fn mark_indexing(&self, id: &str) -> Result<ResourceState> {
        self.transition(id, ResourceState::Indexing, None).await
    }

    pub async fn mark_failed(&self, id: &str, error: &str) -> Result<ResourceState> {
        self.transition(id, ResourceState::Failed, Some(error)).await
    }

    /// A job was cancelled, timed out, or interrupted before committing.
    /// The resource goes back to READY when it has a committed generation,
    /// FAILED otherwise. `error` is kept as `last_error` either way.
    pub async fn mark_cancelled(&self, id: &str, error: &str) -> Result<ResourceState> {
        let current = self.get(id).await?;
        let to = if current.current_generation.is_some() {
            ResourceState::Ready
        } else {
            ResourceState::Failed
        };
        if current.state == to {
            return Ok(to);
        }
        self.transition(id, to, Some(error)).await
    }

    /// Swap the generation pointer and mark READY. Runs on the commit
    /// transaction's connection so both land together.
    pub async fn mark_ready(conn: &mut SqliteConnection, id: &str, generation: i64) -> Result<()> {
        let result = sqlx::query(
            "UPDATE resources SET state = 'ready', current_generation = ?, last_error = NULL, \
             updated_at = ? WHERE id = ? AND state IN ('queued', 'indexing')",
        )
        .bind(generation)
        .bind(now_millis())
        .bind(id)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            let state: Option<String> =
                sqlx::query_scalar("SELECT state FROM resources WHERE id = ?")
                    .bind(id)
                    .fetch_optional(&mut *conn)
                    .await?;
            let from = match state.as_deref().map(str::parse::<ResourceState>) {
                Some(Ok(ResourceState::Deleted)) | None => {
                    return Err(EngineError::not_found("resource", id))
                }
                Some(Ok(state)) => state,
                Some(Err(e)) => return Err(anyhow::Error::new(e).into()),
            };
            return Err(EngineError::IllegalTransition {
                id: id.to_string(),
                from,
                to: ResourceState::Ready,
            });
        }
        Ok(())
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}

fn row_to_resource(row: &SqliteRow) -> Result<Resource> {
    let kind: String = row.get("kind");
    let state: String = row.get("state");
    let options_json: String = row.get("options_json");

    Ok(Resource {
        id: row.get("id"),
        kind: kind.parse().map_err(anyhow::Error::new)?,
        source_locator: row.get("source_locator"),
        display_name: row.get("display_name"),
        state: state.parse().map_err(anyhow::Error::new)?,
        options: serde_json::from_str(&options_json).context("Corrupt resource options")?,
        created_at: from_millis(row.get("created_at")),
        updated_at: from_millis(row.get("updated_at")),
        last_error: row.get("last_error"),
        current_generation: row.get("current_generation"),
    })
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(EngineError::invalid("name cannot be empty"));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(EngineError::invalid(format!(
            "name is longer than {MAX_NAME_LEN} characters"
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(EngineError::invalid("name contains control characters"));
    }
    Ok(())
}

fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .filter(|c| !c.is_control())
        .take(MAX_NAME_LEN - 8)
        .collect();
    if cleaned.is_empty() {
        "resource".to_string()
    } else {
        cleaned
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Locators and default names
// ═══════════════════════════════════════════════════════════════════════

/// Canonical form of a URL-ish locator: trimmed, without trailing `/`.
pub fn normalize_locator(locator: &str) -> String {
    let trimmed = locator.trim();
    let stripped = trimmed.trim_end_matches('/');
    if stripped.is_empty() {
        trimmed.to_string()
    } else {
        stripped.to_string()
    }
}

/// Last path segment of a repository URL or path, without `.git`.
pub fn repository_name(locator: &str) -> String {
    let last = last_segment(locator);
    last.strip_suffix(".git").unwrap_or(last).to_string()
}

/// Last path segment of a documentation URL, or its host for a bare origin.
pub fn documentation_name(locator: &str) -> String {
    match url::Url::parse(locator) {
        Ok(url) => {
            let seg = url
                .path_segments()
                .and_then(|segs| segs.filter(|s| !s.is_empty()).last())
                .map(str::to_string);
            seg.or_else(|| url.host_str().map(str::to_string))
                .unwrap_or_else(|| last_segment(locator).to_string())
        }
        Err(_) => last_segment(locator).to_string(),
    }
}

/// Catalog locator of a package: `registry:name` or `registry:name@version`.
pub fn package_locator(registry: &str, name: &str, version: Option<&str>) -> String {
    match version {
        Some(v) => format!("{registry}:{name}@{v}"),
        None => format!("{registry}:{name}"),
    }
}

fn last_segment(locator: &str) -> &str {
    let trimmed = locator.trim().trim_end_matches('/');
    trimmed
        .rsplit(['/', '\\', ':'])
        .find(|s| !s.is_empty())
        .unwrap_or(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn registry() -> (tempfile::TempDir, Registry) {
        let tmp = tempfile::TempDir::new().unwrap();
        let pool = crate::db::connect(&tmp.path().join("index.sqlite"))
            .await
            .unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        (tmp, Registry::new(pool))
    }

    fn repo_opts() -> SourceOptions {
        SourceOptions::Repository { git_ref: None }
    }

    #[test]
    fn test_default_names() {
        assert_eq!(repository_name("https://github.com/tokio-rs/tokio.git"), "tokio");
        assert_eq!(repository_name("https://github.com/tokio-rs/tokio/"), "tokio");
        assert_eq!(repository_name("git@github.com:org/thing.git"), "thing");
        assert_eq!(repository_name("/home/me/src/project"), "project");
        assert_eq!(documentation_name("https://docs.rs/serde/latest"), "latest");
        assert_eq!(documentation_name("https://docs.example.com/"), "docs.example.com");
        assert_eq!(package_locator("pypi", "requests", Some("2.31.0")), "pypi:requests@2.31.0");
        assert_eq!(normalize_locator(" https://x.dev/docs/ "), "https://x.dev/docs");
    }

    #[tokio::test]
    async fn test_create_or_get_is_idempotent() {
        let (_tmp, reg) = registry().await;
        let (a, created_a) = reg
            .create_or_get("https://github.com/o/tokio", "tokio", repo_opts())
            .await
            .unwrap();
        let (b, created_b) = reg
            .create_or_get("https://github.com/o/tokio", "tokio", repo_opts())
            .await
            .unwrap();
        assert!(created_a);
        assert!(!created_b);
        assert_eq!(a.id, b.id);
        assert_eq!(a.state, ResourceState::Uninitialized);
    }

    #[tokio::test]
    async fn test_concurrent_create_converges() {
        let (_tmp, reg) = registry().await;
        let mut handles = Vec::new();
        for _ in 0..8 {
            let reg = reg.clone();
            handles.push(tokio::spawn(async move {
                reg.create_or_get("/src/app", "app", repo_opts())
                    .await
                    .unwrap()
                    .0
                    .id
            }));
        }
        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(reg.count_live().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_name_collision_gets_suffix() {
        let (_tmp, reg) = registry().await;
        let (a, _) = reg.create_or_get("https://a.dev/x/core", "core", repo_opts()).await.unwrap();
        let (b, _) = reg.create_or_get("https://b.dev/y/core", "core", repo_opts()).await.unwrap();
        let (c, _) = reg.create_or_get("https://c.dev/z/core", "core", repo_opts()).await.unwrap();
        assert_eq!(a.display_name, "core");
        assert_eq!(b.display_name, "core-2");
        assert_eq!(c.display_name, "core-3");

        // Same name under another kind is fine.
        let (d, _) = reg
            .create_or_get(
                "https://docs.dev/core",
                "core",
                SourceOptions::Documentation(Default::default()),
            )
            .await
            .unwrap();
        assert_eq!(d.display_name, "core");
    }

    #[tokio::test]
    async fn test_rename_rules() {
        let (_tmp, reg) = registry().await;
        let (a, _) = reg.create_or_get("/a", "a", repo_opts()).await.unwrap();
        let (b, _) = reg.create_or_get("/b", "b", repo_opts()).await.unwrap();

        let renamed = reg.rename(&a.id, "  alpha ").await.unwrap();
        assert_eq!(renamed.display_name, "alpha");
        assert_eq!(reg.find_by_name(ResourceKind::Repository, "alpha").await.unwrap().id, a.id);

        assert!(matches!(
            reg.rename(&b.id, "alpha").await,
            Err(EngineError::Conflict { .. })
        ));
        assert!(matches!(
            reg.rename(&b.id, "   ").await,
            Err(EngineError::InvalidArgument(_))
        ));
        assert!(matches!(
            reg.rename("missing", "x").await,
            Err(EngineError::NotFound { .. })
        ));
        // Renaming to its own name is a no-op.
        assert_eq!(reg.rename(&b.id, "b").await.unwrap().display_name, "b");
    }

    #[tokio::test]
    async fn test_state_machine() {
        let (_tmp, reg) = registry().await;
        let (r, _) = reg.create_or_get("/a", "a", repo_opts()).await.unwrap();

        assert!(matches!(
            reg.mark_indexing(&r.id).await,
            Err(EngineError::IllegalTransition { .. })
        ));
        assert_eq!(reg.mark_queued(&r.id).await.unwrap(), ResourceState::Queued);
        assert_eq!(reg.mark_indexing(&r.id).await.unwrap(), ResourceState::Indexing);

        // No generation yet, so a cancel lands in FAILED.
        assert_eq!(
            reg.mark_cancelled(&r.id, "cancelled").await.unwrap(),
            ResourceState::Failed
        );
        let failed = reg.get(&r.id).await.unwrap();
        assert_eq!(failed.last_error.as_deref(), Some("cancelled"));

        reg.mark_queued(&r.id).await.unwrap();
        reg.mark_indexing(&r.id).await.unwrap();
        let mut conn = reg.pool.acquire().await.unwrap();
        Registry::mark_ready(&mut conn, &r.id, 1).await.unwrap();
        drop(conn);

        let ready = reg.get(&r.id).await.unwrap();
        assert_eq!(ready.state, ResourceState::Ready);
        assert_eq!(ready.current_generation, Some(1));
        assert_eq!(ready.last_error, None);

        // READY stays READY while queued, then a cancelled re-index goes back to READY.
        assert_eq!(reg.mark_queued(&r.id).await.unwrap(), ResourceState::Ready);
        reg.mark_indexing(&r.id).await.unwrap();
        assert_eq!(
            reg.mark_cancelled(&r.id, "cancelled").await.unwrap(),
            ResourceState::Ready
        );
    }

    #[tokio::test]
    async fn test_delete_tombstones() {
        let (_tmp, reg) = registry().await;
        let (r, _) = reg.create_or_get("/a", "a", repo_opts()).await.unwrap();
        reg.delete_cascade(&r.id).await.unwrap();

        assert!(matches!(reg.get(&r.id).await, Err(EngineError::NotFound { .. })));
        assert!(matches!(
            reg.delete_cascade(&r.id).await,
            Err(EngineError::NotFound { .. })
        ));
        assert!(reg.list(None).await.unwrap().is_empty());

        // The locator and name are free again, under a fresh id.
        let (again, created) = reg.create_or_get("/a", "a", repo_opts()).await.unwrap();
        assert!(created);
        assert_ne!(again.id, r.id);
        assert_eq!(again.display_name, "a");
    }
}
