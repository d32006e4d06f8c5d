//! Job scheduler: at most one job per resource, a bounded worker pool
//! across resources.
//!
//! `submit` registers the job in an in-memory map keyed by resource id and
//! spawns a task that first waits for a pool permit. The map entry lives
//! until the task has written the final job row, so a second `submit` for
//! the same resource returns the running job's id instead of starting
//! another one.
//!
//! Cancellation, the per-job timeout, and engine shutdown all go through
//! the job's [`CancellationToken`]. The pipeline observes it between files
//! and embedding batches.
//!
//! Maintenance (garbage collection, purge) runs under a [`MaintenanceGuard`].
//! The guard is only granted while the map is empty, and `submit` refuses
//! new jobs while it is held; both checks happen under the map lock.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use resource_index_core::models::{IndexJob, JobProgress, JobState, ResourceState};

use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::jobs::{JobStore, INTERRUPTED};
use crate::pipeline::{JobContext, Pipeline};
use crate::registry::Registry;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

struct ActiveJob {
    job_id: String,
    record: Arc<Mutex<IndexJob>>,
    cancel: CancellationToken,
}

impl ActiveJob {
    fn snapshot(&self) -> IndexJob {
        self.record.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Exclusive maintenance window. No job is active or can be submitted
/// until it is dropped.
pub struct MaintenanceGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for MaintenanceGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

struct Inner {
    registry: Registry,
    jobs: JobStore,
    pipeline: Pipeline,
    permits: Arc<Semaphore>,
    /// Keyed by resource id.
    active: tokio::sync::Mutex<HashMap<String, ActiveJob>>,
    job_timeout: Duration,
    job_history: usize,
    shutdown: CancellationToken,
    maintenance: Arc<AtomicBool>,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(registry: Registry, jobs: JobStore, pipeline: Pipeline, config: &Config) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                jobs,
                pipeline,
                permits: Arc::new(Semaphore::new(config.jobs.workers.max(1))),
                active: tokio::sync::Mutex::new(HashMap::new()),
                job_timeout: Duration::from_secs(config.jobs.job_timeout_secs.max(1)),
                job_history: config.jobs.history_per_resource.max(1),
                shutdown: CancellationToken::new(),
                maintenance: Arc::new(AtomicBool::new(false)),
            }),
        }
    }

    /// Queue an indexing job. Returns the id of the job already pending or
    /// running for the resource, if there is one.
    pub async fn submit(&self, resource_id: &str, force_full: bool) -> Result<String> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(EngineError::Busy("engine is shutting down".to_string()));
        }

        let mut active = inner.active.lock().await;
        if let Some(job) = active.get(resource_id) {
            if !job.snapshot().state.is_terminal() {
                tracing::debug!(resource_id, job_id = %job.job_id, "job already in flight");
                return Ok(job.job_id.clone());
            }
        }
        if inner.maintenance.load(Ordering::SeqCst) {
            return Err(EngineError::Busy("maintenance in progress".to_string()));
        }

        inner.registry.get(resource_id).await?;
        inner.registry.mark_queued(resource_id).await?;

        let job = IndexJob {
            job_id: uuid::Uuid::new_v4().to_string(),
            resource_id: resource_id.to_string(),
            state: JobState::Pending,
            force_full,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            progress: JobProgress::default(),
            diff: None,
            error: None,
        };
        inner.jobs.insert(&job).await?;
        let job_id = job.job_id.clone();

        let record = Arc::new(Mutex::new(job));
        let cancel = inner.shutdown.child_token();
        active.insert(
            resource_id.to_string(),
            ActiveJob {
                job_id: job_id.clone(),
                record: record.clone(),
                cancel: cancel.clone(),
            },
        );
        drop(active);

        tracing::info!(resource_id, job_id = %job_id, force_full, "job submitted");
        let ctx = JobContext::new(record, cancel);
        tokio::spawn(self.inner.clone().run_job(ctx));
        Ok(job_id)
    }

    /// Live state of a job, falling back to persisted history.
    pub async fn status(&self, job_id: &str) -> Result<IndexJob> {
        {
            let active = self.inner.active.lock().await;
            if let Some(job) = active.values().find(|j| j.job_id == job_id) {
                return Ok(job.snapshot());
            }
        }
        self.inner.jobs.get(job_id).await
    }

    pub async fn cancel(&self, job_id: &str) -> Result<()> {
        {
            let active = self.inner.active.lock().await;
            if let Some(job) = active.values().find(|j| j.job_id == job_id) {
                if job.snapshot().state.is_terminal() {
                    return Err(EngineError::AlreadyFinished(job_id.to_string()));
                }
                tracing::info!(job_id, "cancelling job");
                job.cancel.cancel();
                return Ok(());
            }
        }
        // Not in memory: unknown, or finished earlier.
        self.inner.jobs.get(job_id).await?;
        Err(EngineError::AlreadyFinished(job_id.to_string()))
    }

    /// Poll until the job reaches a terminal state or `timeout` elapses.
    pub async fn wait(&self, job_id: &str, timeout: Duration) -> Result<IndexJob> {
        let deadline = Instant::now() + timeout;
        loop {
            let job = self.status(job_id).await?;
            if job.state.is_terminal() {
                return Ok(job);
            }
            if Instant::now() >= deadline {
                return Err(EngineError::TimedOut(timeout.as_secs()));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Cancel whatever job runs for `resource_id` and wait until its task
    /// has fully released the resource.
    pub async fn cancel_resource_and_wait(&self, resource_id: &str) {
        {
            let active = self.inner.active.lock().await;
            match active.get(resource_id) {
                Some(job) => job.cancel.cancel(),
                None => return,
            }
        }
        while self.inner.active.lock().await.contains_key(resource_id) {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Enter a maintenance window. Fails with `Busy` while any job is
    /// pending or running, or another window is open.
    pub async fn begin_maintenance(&self) -> Result<MaintenanceGuard> {
        let active = self.inner.active.lock().await;
        if !active.is_empty() {
            return Err(EngineError::Busy(format!(
                "{} indexing job(s) running",
                active.len()
            )));
        }
        if self.inner.maintenance.swap(true, Ordering::SeqCst) {
            return Err(EngineError::Busy("maintenance in progress".to_string()));
        }
        Ok(MaintenanceGuard {
            flag: self.inner.maintenance.clone(),
        })
    }

    pub async fn active_count(&self) -> usize {
        self.inner.active.lock().await.len()
    }

    /// Cancel every job and wait up to `grace` for workers to wind down.
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.shutdown.cancel();
        let deadline = Instant::now() + grace;
        while self.active_count().await > 0 && Instant::now() < deadline {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Startup recovery: fail jobs a previous process left unfinished and
    /// put their resources back into a servable state. Returns how many
    /// resources were restored.
    pub async fn recover(&self) -> Result<usize> {
        let inner = &self.inner;
        let mut stranded: HashSet<String> =
            inner.jobs.recover_interrupted().await?.into_iter().collect();
        for summary in inner.registry.list(None).await? {
            if matches!(summary.state, ResourceState::Queued | ResourceState::Indexing) {
                stranded.insert(summary.id);
            }
        }

        let mut restored = 0;
        for id in &stranded {
            match inner.registry.mark_cancelled(id, INTERRUPTED).await {
                Ok(state) => {
                    tracing::info!(
                        resource_id = %id,
                        state = %state,
                        "recovered interrupted resource"
                    );
                    restored += 1;
                }
                Err(EngineError::NotFound { .. }) => {}
                Err(e) => tracing::warn!(resource_id = %id, error = %e, "recovery failed"),
            }
        }
        Ok(restored)
    }
}

impl Inner {
    async fn run_job(self: Arc<Self>, ctx: JobContext) {
        let timed_out = Arc::new(AtomicBool::new(false));
        let permit = tokio::select! {
            permit = self.permits.clone().acquire_owned() => permit.ok(),
            _ = ctx.cancel.cancelled() => None,
        };

        let outcome = match permit {
            Some(permit) => {
                let outcome = self.execute(&ctx, &timed_out).await;
                drop(permit);
                outcome
            }
            None => Err(EngineError::Cancelled),
        };
        self.finish(&ctx, outcome, &timed_out).await;
    }

    async fn execute(&self, ctx: &JobContext, timed_out: &Arc<AtomicBool>) -> Result<i64> {
        ctx.check_cancelled()?;
        self.registry.mark_indexing(&ctx.resource_id).await?;
        ctx.update(|job| {
            job.state = JobState::Running;
            job.started_at = Some(Utc::now());
        });
        self.jobs.update(&ctx.snapshot()).await?;
        tracing::info!(job_id = %ctx.job_id, resource_id = %ctx.resource_id, "job started");

        let timer = {
            let cancel = ctx.cancel.clone();
            let flag = timed_out.clone();
            let limit = self.job_timeout;
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(limit) => {
                        flag.store(true, Ordering::SeqCst);
                        cancel.cancel();
                    }
                    _ = cancel.cancelled() => {}
                }
            })
        };
        let result = self.pipeline.run(ctx).await;
        timer.abort();
        result
    }

    async fn finish(&self, ctx: &JobContext, outcome: Result<i64>, timed_out: &AtomicBool) {
        let mut job = ctx.snapshot();
        job.finished_at = Some(Utc::now());

        match outcome {
            Ok(generation) => {
                tracing::info!(
                    job_id = %ctx.job_id,
                    resource_id = %ctx.resource_id,
                    generation,
                    "job succeeded"
                );
                job.state = JobState::Succeeded;
            }
            Err(err) => {
                let err = match err {
                    EngineError::Cancelled if timed_out.load(Ordering::SeqCst) => {
                        EngineError::TimedOut(self.job_timeout.as_secs())
                    }
                    other => other,
                };
                let text = err.to_string();
                tracing::warn!(
                    job_id = %ctx.job_id,
                    resource_id = %ctx.resource_id,
                    error = %text,
                    "job failed"
                );

                let restored = match err {
                    EngineError::Cancelled | EngineError::TimedOut(_) => {
                        self.registry.mark_cancelled(&ctx.resource_id, &text).await
                    }
                    _ => self.registry.mark_failed(&ctx.resource_id, &text).await,
                };
                match restored {
                    Ok(_) | Err(EngineError::NotFound { .. }) => {}
                    Err(e) => tracing::warn!(
                        resource_id = %ctx.resource_id,
                        error = %e,
                        "could not update resource state"
                    ),
                }

                job.state = JobState::Failed;
                job.error = Some(text);
            }
        }

        if let Err(e) = self.jobs.update(&job).await {
            tracing::warn!(job_id = %ctx.job_id, error = %e, "could not persist job result");
        }
        match self.jobs.prune(&ctx.resource_id, self.job_history).await {
            Ok(0) => {}
            Ok(removed) => {
                tracing::debug!(resource_id = %ctx.resource_id, removed, "pruned job history")
            }
            Err(e) => tracing::warn!(
                resource_id = %ctx.resource_id,
                error = %e,
                "could not prune job history"
            ),
        }
        // Publish the final record and release the resource in one critical
        // section, so a waiter that sees a terminal state also sees the slot free.
        let mut active = self.active.lock().await;
        ctx.update(|record| *record = job);
        if active
            .get(&ctx.resource_id)
            .is_some_and(|j| j.job_id == ctx.job_id)
        {
            active.remove(&ctx.resource_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packages::PackageResolver;
    use crate::segments::FileVectorStore;
    use crate::sources::SourceKinds;
    use resource_index_core::embedding::HashingEmbedder;
    use resource_index_core::models::SourceOptions;

    async fn scheduler(tmp: &tempfile::TempDir) -> (Scheduler, String) {
        let mut config = Config::with_workdir(tmp.path().join("work"));
        config.packages.discover_site_packages = false;
        config.jobs.workers = 1;
        config.jobs.history_per_resource = 2;
        let pool = crate::db::connect(&config.db_path()).await.unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();

        let resolver = Arc::new(PackageResolver::new(&config).unwrap());
        let sources = SourceKinds::standard(&config, resolver).unwrap();
        let pipeline = Pipeline::new(
            pool.clone(),
            Arc::new(FileVectorStore::new(config.segments_dir())),
            Arc::new(HashingEmbedder::new(64)),
            sources,
            &config,
        );
        let registry = Registry::new(pool.clone());

        let repo = tmp.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        std::fs::write(repo.join("lib.rs"), "pub fn answer() -> u32 {\n    42\n}\n").unwrap();
        let (resource, _) = registry
            .create_or_get(
                &repo.to_string_lossy(),
                "repo",
                SourceOptions::Repository { git_ref: None },
            )
            .await
            .unwrap();

        let scheduler = Scheduler::new(registry, JobStore::new(pool), pipeline, &config);
        (scheduler, resource.id)
    }

    #[tokio::test]
    async fn test_submit_refused_during_maintenance() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (scheduler, rid) = scheduler(&tmp).await;

        let guard = scheduler.begin_maintenance().await.unwrap();
        assert!(matches!(
            scheduler.submit(&rid, false).await.unwrap_err(),
            EngineError::Busy(_)
        ));
        assert_eq!(scheduler.active_count().await, 0);
        assert!(matches!(
            scheduler.begin_maintenance().await.err(),
            Some(EngineError::Busy(_))
        ));
        drop(guard);

        let job_id = scheduler.submit(&rid, false).await.unwrap();
        let job = scheduler.wait(&job_id, Duration::from_secs(30)).await.unwrap();
        assert_eq!(job.state, JobState::Succeeded, "job error: {:?}", job.error);
        scheduler.begin_maintenance().await.unwrap();
    }

    #[tokio::test]
    async fn test_maintenance_refused_while_job_pending() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (scheduler, rid) = scheduler(&tmp).await;

        // Hold the only worker permit so the job stays pending.
        let permit = scheduler.inner.permits.clone().acquire_owned().await.unwrap();
        let job_id = scheduler.submit(&rid, false).await.unwrap();
        assert!(matches!(
            scheduler.begin_maintenance().await.err(),
            Some(EngineError::Busy(_))
        ));

        drop(permit);
        scheduler.wait(&job_id, Duration::from_secs(30)).await.unwrap();
        assert!(scheduler.begin_maintenance().await.is_ok());
    }

    #[tokio::test]
    async fn test_job_history_is_bounded() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (scheduler, rid) = scheduler(&tmp).await;

        let mut ids = Vec::new();
        for _ in 0..4 {
            let job_id = scheduler.submit(&rid, false).await.unwrap();
            scheduler.wait(&job_id, Duration::from_secs(30)).await.unwrap();
            ids.push(job_id);
        }

        let kept = scheduler.inner.jobs.for_resource(&rid, 10).await.unwrap();
        assert_eq!(kept.len(), 2);
        assert!(matches!(
            scheduler.status(&ids[0]).await,
            Err(EngineError::NotFound { .. })
        ));
        assert_eq!(
            scheduler.status(&ids[3]).await.unwrap().state,
            JobState::Succeeded
        );
    }
}
