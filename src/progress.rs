//! Job progress reporting for the CLI.
//!
//! `rix index … --wait` follows the job it submitted and prints a line
//! whenever its phase or counters change. Progress goes to **stderr** so
//! stdout stays parseable for scripts.

use std::io::Write;
use std::time::{Duration, Instant};

use resource_index_core::models::{IndexJob, JobProgress};

use crate::engine::Engine;
use crate::error::{EngineError, Result};

const FOLLOW_INTERVAL: Duration = Duration::from_millis(250);

/// Receives job snapshots while a job is followed.
pub trait JobProgressReporter: Send + Sync {
    fn report(&self, job: &IndexJob);
}

/// Human-friendly progress on stderr:
/// `job 3f2a9c1e  embedding  1,204 files (37 changed)  5,120 chunks  812 embedded`.
pub struct StderrProgress;

impl JobProgressReporter for StderrProgress {
    fn report(&self, job: &IndexJob) {
        let p = &job.progress;
        let mut line = format!(
            "job {}  {}  {}",
            short_id(&job.job_id),
            if job.state.is_terminal() {
                job.state.as_str()
            } else {
                p.phase.as_str()
            },
            format_counts(p),
        );
        if let Some(error) = &job.error {
            line.push_str(&format!("  error: {error}"));
        }
        line.push('\n');
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl JobProgressReporter for JsonProgress {
    fn report(&self, job: &IndexJob) {
        let obj = serde_json::json!({
            "event": "progress",
            "job_id": job.job_id,
            "resource_id": job.resource_id,
            "state": job.state,
            "progress": job.progress,
            "error": job.error,
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl JobProgressReporter for NoProgress {
    fn report(&self, _job: &IndexJob) {}
}

/// Poll `job_id` until it finishes, reporting every change.
pub async fn follow(
    engine: &Engine,
    job_id: &str,
    reporter: &dyn JobProgressReporter,
    timeout: Duration,
) -> Result<IndexJob> {
    let deadline = Instant::now() + timeout;
    let mut last: Option<(String, JobProgress)> = None;
    loop {
        let job = engine.job_status(job_id).await?;
        let seen = (job.state.as_str().to_string(), job.progress.clone());
        if last.as_ref() != Some(&seen) {
            reporter.report(&job);
            last = Some(seen);
        }
        if job.state.is_terminal() {
            return Ok(job);
        }
        if Instant::now() >= deadline {
            return Err(EngineError::TimedOut(timeout.as_secs()));
        }
        tokio::time::sleep(FOLLOW_INTERVAL).await;
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn format_counts(p: &JobProgress) -> String {
    let mut parts = Vec::new();
    if p.files_seen > 0 {
        parts.push(format!(
            "{} files ({} changed)",
            format_number(p.files_seen),
            format_number(p.files_changed)
        ));
    }
    if p.chunks_written + p.chunks_reused > 0 {
        parts.push(format!(
            "{} chunks",
            format_number(p.chunks_written + p.chunks_reused)
        ));
    }
    if p.embeddings_computed > 0 {
        parts.push(format!("{} embedded", format_number(p.embeddings_computed)));
    }
    if !p.warnings.is_empty() {
        parts.push(format!("{} warnings", p.warnings.len()));
    }
    parts.join("  ")
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn JobProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn counts_skip_empty_parts() {
        let mut p = JobProgress::default();
        assert_eq!(format_counts(&p), "");
        p.files_seen = 1204;
        p.files_changed = 37;
        p.chunks_written = 20;
        p.chunks_reused = 5100;
        assert_eq!(format_counts(&p), "1,204 files (37 changed)  5,120 chunks");
    }

    #[test]
    fn short_ids() {
        assert_eq!(short_id("3f2a9c1e-aaaa"), "3f2a9c1e");
        assert_eq!(short_id("abc"), "abc");
    }
}
