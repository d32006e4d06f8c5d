//! Persisted job history.
//!
//! The scheduler keeps live jobs in memory and mirrors every state change
//! here, so `job_status` keeps answering after the process restarts.

use anyhow::Context;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use resource_index_core::models::{IndexJob, JobState};

use crate::db::{from_millis, now_millis};
use crate::error::{EngineError, Result};

/// Error text recorded on jobs found unfinished at startup.
pub const INTERRUPTED: &str = "interrupted";

#[derive(Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, job: &IndexJob) -> Result<()> {
        sqlx::query(
            "INSERT INTO jobs (job_id, resource_id, state, force_full, submitted_at, progress_json) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&job.job_id)
        .bind(&job.resource_id)
        .bind(job.state.as_str())
        .bind(job.force_full)
        .bind(job.submitted_at.timestamp_millis())
        .bind(serde_json::to_string(&job.progress).context("Failed to serialize progress")?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Overwrite the mutable columns of a job row.
    pub async fn update(&self, job: &IndexJob) -> Result<()> {
        let diff_json = job
            .diff
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize diff")?;
        sqlx::query(
            "UPDATE jobs SET state = ?, started_at = ?, finished_at = ?, progress_json = ?, \
             diff_json = ?, error = ? WHERE job_id = ?",
        )
        .bind(job.state.as_str())
        .bind(job.started_at.map(|t| t.timestamp_millis()))
        .bind(job.finished_at.map(|t| t.timestamp_millis()))
        .bind(serde_json::to_string(&job.progress).context("Failed to serialize progress")?)
        .bind(diff_json)
        .bind(&job.error)
        .bind(&job.job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, job_id: &str) -> Result<IndexJob> {
        let row = sqlx::query("SELECT * FROM jobs WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => row_to_job(&row),
            None => Err(EngineError::not_found("job", job_id)),
        }
    }

    /// Most recent jobs of a resource, newest first.
    pub async fn for_resource(&self, resource_id: &str, limit: i64) -> Result<Vec<IndexJob>> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE resource_id = ? ORDER BY submitted_at DESC, job_id LIMIT ?",
        )
        .bind(resource_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_job).collect()
    }

    /// Delete finished jobs of a resource beyond the `keep` most recent.
    /// Pending and running rows are never removed.
    pub async fn prune(&self, resource_id: &str, keep: usize) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM jobs WHERE resource_id = ? AND state NOT IN ('pending', 'running') \
             AND job_id NOT IN (SELECT job_id FROM jobs WHERE resource_id = ? \
             ORDER BY submitted_at DESC, job_id DESC LIMIT ?)",
        )
        .bind(resource_id)
        .bind(resource_id)
        .bind(i64::try_from(keep).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Fail every job a previous process left pending or running. Returns
    /// the resource ids they belonged to.
    pub async fn recover_interrupted(&self) -> Result<Vec<String>> {
        let mut tx = self.pool.begin().await?;
        let resource_ids: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT resource_id FROM jobs WHERE state IN ('pending', 'running')",
        )
        .fetch_all(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE jobs SET state = 'failed', error = ?, finished_at = ? \
             WHERE state IN ('pending', 'running')",
        )
        .bind(INTERRUPTED)
        .bind(now_millis())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(resource_ids)
    }
}

fn row_to_job(row: &SqliteRow) -> Result<IndexJob> {
    let state: String = row.get("state");
    let progress_json: String = row.get("progress_json");
    let diff_json: Option<String> = row.get("diff_json");
    let started_at: Option<i64> = row.get("started_at");
    let finished_at: Option<i64> = row.get("finished_at");

    Ok(IndexJob {
        job_id: row.get("job_id"),
        resource_id: row.get("resource_id"),
        state: state.parse::<JobState>().map_err(anyhow::Error::new)?,
        force_full: row.get("force_full"),
        submitted_at: from_millis(row.get("submitted_at")),
        started_at: started_at.map(from_millis),
        finished_at: finished_at.map(from_millis),
        progress: serde_json::from_str(&progress_json).context("Corrupt job progress")?,
        diff: diff_json
            .map(|d| serde_json::from_str(&d))
            .transpose()
            .context("Corrupt job diff")?,
        error: row.get("error"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use resource_index_core::diff::FileDiff;
    use resource_index_core::models::JobProgress;

    fn job(id: &str, state: JobState) -> IndexJob {
        IndexJob {
            job_id: id.to_string(),
            resource_id: "r1".to_string(),
            state,
            force_full: false,
            submitted_at: chrono::Utc::now(),
            started_at: None,
            finished_at: None,
            progress: JobProgress::default(),
            diff: None,
            error: None,
        }
    }

    async fn store() -> (tempfile::TempDir, JobStore) {
        let tmp = tempfile::TempDir::new().unwrap();
        let pool = crate::db::connect(&tmp.path().join("index.sqlite"))
            .await
            .unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        (tmp, JobStore::new(pool))
    }

    #[tokio::test]
    async fn test_insert_update_get() {
        let (_tmp, jobs) = store().await;
        let mut j = job("j1", JobState::Pending);
        jobs.insert(&j).await.unwrap();

        j.state = JobState::Succeeded;
        j.progress.files_seen = 3;
        j.diff = Some(FileDiff {
            added: vec!["a.rs".into()],
            ..Default::default()
        });
        j.finished_at = Some(chrono::Utc::now());
        jobs.update(&j).await.unwrap();

        let got = jobs.get("j1").await.unwrap();
        assert_eq!(got.state, JobState::Succeeded);
        assert_eq!(got.progress.files_seen, 3);
        assert_eq!(got.diff.unwrap().added, vec!["a.rs"]);
        assert!(got.finished_at.is_some());
        assert!(matches!(jobs.get("nope").await, Err(EngineError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_recover_interrupted() {
        let (_tmp, jobs) = store().await;
        jobs.insert(&job("j1", JobState::Running)).await.unwrap();
        jobs.insert(&job("j2", JobState::Succeeded)).await.unwrap();

        let resources = jobs.recover_interrupted().await.unwrap();
        assert_eq!(resources, vec!["r1"]);
        let j1 = jobs.get("j1").await.unwrap();
        assert_eq!(j1.state, JobState::Failed);
        assert_eq!(j1.error.as_deref(), Some(INTERRUPTED));
        assert_eq!(jobs.get("j2").await.unwrap().state, JobState::Succeeded);
        assert!(jobs.recover_interrupted().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_prune_keeps_recent_and_live_jobs() {
        let (_tmp, jobs) = store().await;
        let start = chrono::Utc::now() - chrono::Duration::hours(1);

        let mut running = job("j0", JobState::Running);
        running.submitted_at = start;
        jobs.insert(&running).await.unwrap();
        for i in 1..=5 {
            let mut j = job(&format!("j{i}"), JobState::Succeeded);
            j.submitted_at = start + chrono::Duration::minutes(i);
            jobs.insert(&j).await.unwrap();
        }
        let mut other = job("x1", JobState::Failed);
        other.resource_id = "r2".to_string();
        other.submitted_at = start;
        jobs.insert(&other).await.unwrap();

        assert_eq!(jobs.prune("r1", 2).await.unwrap(), 3);
        let left: Vec<String> = jobs
            .for_resource("r1", 10)
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.job_id)
            .collect();
        assert_eq!(left, vec!["j5", "j4", "j0"]);
        assert!(matches!(jobs.get("j1").await, Err(EngineError::NotFound { .. })));
        assert!(jobs.get("x1").await.is_ok());
        assert_eq!(jobs.prune("r1", 2).await.unwrap(), 0);
    }
}
