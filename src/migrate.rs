use anyhow::Result;
use sqlx::SqlitePool;

/// Create every catalog table and index. Idempotent.
///
/// Timestamps are stored as Unix milliseconds.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Resource catalog. Tombstoned rows keep their id forever; the partial
    // unique indexes only constrain live resources.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS resources (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            source_locator TEXT NOT NULL,
            display_name TEXT NOT NULL,
            state TEXT NOT NULL,
            options_json TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            last_error TEXT,
            current_generation INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_resources_locator \
         ON resources(kind, source_locator) WHERE state != 'deleted'",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_resources_name \
         ON resources(kind, display_name) WHERE state != 'deleted'",
    )
    .execute(pool)
    .await?;

    // Job history
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            job_id TEXT PRIMARY KEY,
            resource_id TEXT NOT NULL,
            state TEXT NOT NULL,
            force_full INTEGER NOT NULL DEFAULT 0,
            submitted_at INTEGER NOT NULL,
            started_at INTEGER,
            finished_at INTEGER,
            progress_json TEXT NOT NULL DEFAULT '{}',
            diff_json TEXT,
            error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_resource ON jobs(resource_id)")
        .execute(pool)
        .await?;

    // Committed generations
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS generations (
            resource_id TEXT NOT NULL,
            generation INTEGER NOT NULL,
            revision TEXT,
            chunk_count INTEGER NOT NULL,
            file_count INTEGER NOT NULL,
            committed_at INTEGER NOT NULL,
            PRIMARY KEY (resource_id, generation)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS generation_chunks (
            resource_id TEXT NOT NULL,
            generation INTEGER NOT NULL,
            chunk_id TEXT NOT NULL,
            source_path TEXT NOT NULL,
            start_line INTEGER NOT NULL,
            end_line INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            chunk_kind TEXT NOT NULL,
            ordinal INTEGER NOT NULL,
            PRIMARY KEY (resource_id, generation, chunk_id)
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_generation_chunks_hash ON generation_chunks(content_hash)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS file_snapshots (
            resource_id TEXT NOT NULL,
            generation INTEGER NOT NULL,
            path TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            last_indexed_at INTEGER NOT NULL,
            PRIMARY KEY (resource_id, generation, path)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Content-addressed store
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunk_texts (
            content_hash TEXT PRIMARY KEY,
            text TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embeddings (
            content_hash TEXT NOT NULL,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            vector BLOB NOT NULL,
            PRIMARY KEY (content_hash, model)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
