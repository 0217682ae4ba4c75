//! Per-job progress records for polling front ends.
use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use pipeconfig::TelemetrySection;
use scheduler::JobId;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Waiting,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub job: JobId,
    pub status: JobStatus,
    pub percent: u8,
    pub step: String,
    pub requester: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    /// Artifact path on success or error message on failure.
    pub summary: Option<String>,
    #[serde(skip)]
    started: Instant,
    #[serde(skip)]
    finished: Option<Instant>,
}

/// Terminal records outlive their job by `retention`; anything older is
/// pruned whenever a new job starts being tracked.
pub struct ProgressTracker {
    jobs: RwLock<HashMap<JobId, JobProgress>>,
    retention: Duration,
}

impl ProgressTracker {
    pub fn new(telemetry: &TelemetrySection) -> Self {
        Self::with_retention(telemetry.progress_retention)
    }

    pub fn with_retention(retention: Duration) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            retention,
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    pub fn start_tracking(&self, job: JobId, requester: Option<String>) {
        let record = JobProgress {
            job,
            status: JobStatus::Waiting,
            percent: 0,
            step: "queued".to_string(),
            requester,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: None,
            summary: None,
            started: Instant::now(),
            finished: None,
        };
        let mut jobs = self.jobs.write();
        prune(&mut jobs, self.retention);
        jobs.insert(job, record);
    }

    fn update(&self, job: JobId, apply: impl FnOnce(&mut JobProgress)) {
        if let Some(record) = self.jobs.write().get_mut(&job) {
            if !record.status.is_terminal() {
                apply(record);
            }
        }
    }

    pub fn mark_processing(&self, job: JobId, attempt: u32) {
        self.update(job, |record| {
            record.status = JobStatus::Processing;
            record.step = format!("attempt {attempt}");
        });
    }

    /// Back to waiting after a failed attempt; progress restarts from zero.
    pub fn mark_waiting(&self, job: JobId, step: impl Into<String>) {
        self.update(job, |record| {
            record.status = JobStatus::Waiting;
            record.percent = 0;
            record.step = step.into();
        });
    }

    pub fn update_progress(&self, job: JobId, percent: u8, step: impl Into<String>) {
        self.update(job, |record| {
            record.percent = percent.min(100);
            record.step = step.into();
        });
    }

    pub fn complete(&self, job: JobId, summary: impl Into<String>) {
        self.finish(job, JobStatus::Completed, summary.into());
    }

    pub fn fail(&self, job: JobId, error: impl Into<String>) {
        self.finish(job, JobStatus::Failed, error.into());
    }

    fn finish(&self, job: JobId, status: JobStatus, summary: String) {
        self.update(job, |record| {
            let now = Instant::now();
            record.status = status;
            if status == JobStatus::Completed {
                record.percent = 100;
            }
            record.step = match status {
                JobStatus::Completed => "done".to_string(),
                _ => "failed".to_string(),
            };
            record.finished_at = Some(Utc::now());
            record.duration_ms = Some(now.duration_since(record.started).as_millis() as u64);
            record.summary = Some(summary);
            record.finished = Some(now);
        });
    }

    pub fn get_progress(&self, job: JobId) -> Option<JobProgress> {
        self.jobs.read().get(&job).cloned()
    }

    /// Jobs that have not reached a terminal state, oldest first.
    pub fn active(&self) -> Vec<JobProgress> {
        let mut active: Vec<_> = self
            .jobs
            .read()
            .values()
            .filter(|record| !record.status.is_terminal())
            .cloned()
            .collect();
        active.sort_by_key(|record| record.job);
        active
    }

    /// Drops terminal records that finished at least `max_age` ago.
    pub fn clean_old_jobs(&self, max_age: Duration) -> usize {
        prune(&mut self.jobs.write(), max_age)
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }
}

fn prune(jobs: &mut HashMap<JobId, JobProgress>, max_age: Duration) -> usize {
    let before = jobs.len();
    jobs.retain(|_, record| match record.finished {
        Some(finished) => finished.elapsed() < max_age,
        None => true,
    });
    before - jobs.len()
}
