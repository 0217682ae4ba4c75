//! Shader compile pipeline: a bounded session pool, a content-addressed result
//! cache and a compile orchestrator, driven through the priority queue from
//! `scheduler`.
//!
//! ```text
//!   submit ──▶ CompileQueue ──▶ Compiler ──▶ ResultCache (hit) ──▶ output
//!                  │                │
//!                  │                └─▶ SessionPool ─▶ frames ─▶ gif ─▶ ResultCache::store
//!                  └─▶ PipelineObserver ─▶ ProgressTracker / PipelineMetrics
//! ```
//!
//! Everything is owned by one [`ShaderPipeline`] value built at startup and
//! passed to whatever front end drives it.

mod cache;
mod error;
mod metrics;
mod orchestrator;
mod pool;
mod progress;
mod validate;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pipeconfig::PipelineConfig;
use renderer::RenderEngine;
use scheduler::{
    CompileQueue, JobEvent, JobHandle, JobId, JobObserver, JobOptions, JobRunner, Priority,
    QueueStats,
};
use serde::Serialize;
use tracing::{debug, info};

pub use cache::{
    ArtifactFormat, ArtifactMetadata, CacheStats, CachedArtifact, Fingerprint, ResultCache,
};
pub use error::{CacheError, CompileError, PipelineError, PoolError};
pub use metrics::{
    AggregateSnapshot, CompilationGauge, ErrorContext, ErrorRecord, MetricsSnapshot,
    PipelineMetrics, TimingSnapshot,
};
pub use orchestrator::{CompileJob, CompileOptions, CompileOutput, Compiler};
pub use pool::{PoolStats, PooledSession, SessionPool};
pub use progress::{JobProgress, JobStatus, ProgressTracker};
pub use validate::{validate, ValidationReport, MAX_SOURCE_BYTES};

/// Outcome future for one submitted job.
pub type CompileHandle = JobHandle<CompileOutput, CompileError>;

/// Adapts the compiler to the queue's runner interface.
pub struct JobExecutor<E: RenderEngine> {
    compiler: Arc<Compiler<E>>,
}

impl<E: RenderEngine> JobRunner<CompileJob> for JobExecutor<E> {
    type Output = CompileOutput;
    type Error = CompileError;

    async fn run(
        &self,
        id: JobId,
        job: &CompileJob,
        attempt: u32,
    ) -> Result<CompileOutput, CompileError> {
        self.compiler.compile(id, job, attempt).await
    }
}

/// Mirrors queue transitions into progress records.
struct PipelineObserver {
    progress: Arc<ProgressTracker>,
}

impl JobObserver<CompileJob> for PipelineObserver {
    fn on_event(&self, job: &CompileJob, event: &JobEvent) {
        match event {
            JobEvent::Queued { id, .. } => self
                .progress
                .start_tracking(*id, job.options.requester.clone()),
            JobEvent::Started { id, attempt, .. } => self.progress.mark_processing(*id, *attempt),
            JobEvent::RetryScheduled { id, delay, .. } => self
                .progress
                .mark_waiting(*id, format!("retrying in {}ms", delay.as_millis())),
            JobEvent::Failed { id, error, .. } => self.progress.fail(*id, error.clone()),
            // The compiler records the artifact path itself.
            JobEvent::Completed { .. } => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStats {
    pub queue: QueueStats,
    pub avg_wait_ms: u64,
    pub pool: PoolStats,
    pub cache: CacheStats,
    pub metrics: MetricsSnapshot,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub cache_entries: usize,
    pub progress_records: usize,
}

pub struct ShaderPipeline<E: RenderEngine> {
    config: PipelineConfig,
    compiler: Arc<Compiler<E>>,
    queue: CompileQueue<CompileJob, JobExecutor<E>>,
    metrics: Arc<PipelineMetrics>,
    progress: Arc<ProgressTracker>,
    defaults: JobOptions,
}

impl<E: RenderEngine> ShaderPipeline<E> {
    /// Builds every component from `config`. Opens (and creates) the cache
    /// root; no rendering session is spawned until the first cache miss.
    pub fn new(engine: E, config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        let cache = Arc::new(ResultCache::open(
            config.cache.root.clone(),
            config.cache.max_age,
        )?);
        let pool = SessionPool::new(engine, config.pool.max_instances);
        let metrics = Arc::new(PipelineMetrics::new(&config.telemetry));
        let progress = Arc::new(ProgressTracker::new(&config.telemetry));
        let compiler = Arc::new(Compiler::new(
            pool,
            cache,
            Arc::clone(&metrics),
            Arc::clone(&progress),
            config.render.clone(),
            config.cache.key_scope,
            config.work_dir(),
        ));
        let observer = Arc::new(PipelineObserver {
            progress: Arc::clone(&progress),
        });
        let queue = CompileQueue::with_observer(
            JobExecutor {
                compiler: Arc::clone(&compiler),
            },
            config.queue.max_concurrent,
            observer,
        );
        info!(
            sessions = config.pool.max_instances,
            concurrency = config.queue.max_concurrent,
            cache = %config.cache.root.display(),
            "shader pipeline ready"
        );
        Ok(Self {
            defaults: JobOptions::from_section(&config.queue),
            config,
            compiler,
            queue,
            metrics,
            progress,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Validates and enqueues a shader. Validation errors are returned here,
    /// before the job is queued; the handle resolves once the job reaches a
    /// terminal state.
    pub fn submit(
        &self,
        source: impl Into<String>,
        options: CompileOptions,
        priority: Priority,
    ) -> Result<CompileHandle, PipelineError> {
        self.submit_with(
            CompileJob::new(source, options),
            self.defaults.with_priority(priority),
        )
    }

    /// Like [`submit`](Self::submit) with explicit retry settings.
    pub fn submit_with(
        &self,
        job: CompileJob,
        options: JobOptions,
    ) -> Result<CompileHandle, PipelineError> {
        let mut errors = validate(&job.source).errors;
        if let Some(size) = job.options.resolution {
            errors.extend(self.check_resolution(size));
        }
        if !errors.is_empty() {
            debug!(errors = ?errors, "rejected shader before queueing");
            return Err(PipelineError::Validation(errors));
        }
        Ok(self.queue.submit(job, options)?)
    }

    fn check_resolution(&self, (width, height): (u32, u32)) -> Option<String> {
        let max = self.config.pool.max_viewport;
        if width == 0 || height == 0 {
            Some(format!("resolution {width}x{height} must be non-zero"))
        } else if width > max || height > max {
            Some(format!("resolution {width}x{height} exceeds the {max}px session limit"))
        } else {
            None
        }
    }

    pub fn validate(&self, source: &str) -> ValidationReport {
        validate(source)
    }

    pub fn fingerprint(&self, source: &str, options: &CompileOptions) -> Fingerprint {
        options.fingerprint(source, self.config.cache.key_scope)
    }

    pub fn progress(&self, job: JobId) -> Option<JobProgress> {
        self.progress.get_progress(job)
    }

    pub fn active_jobs(&self) -> Vec<JobProgress> {
        self.progress.active()
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    pub fn pool(&self) -> &SessionPool<E> {
        self.compiler.pool()
    }

    pub fn cache(&self) -> &ResultCache {
        self.compiler.cache()
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            queue: self.queue.stats(),
            avg_wait_ms: self.queue.status().avg_wait.as_millis() as u64,
            pool: self.pool().stats(),
            cache: self.cache().stats(),
            metrics: self.metrics.stats(),
        }
    }

    /// Deletes expired cache entries and progress records past retention.
    pub async fn sweep(&self) -> Result<SweepReport, PipelineError> {
        let cache = Arc::clone(self.compiler.cache());
        let cache_entries = tokio::task::spawn_blocking(move || cache.sweep_expired())
            .await
            .map_err(|err| {
                CacheError::io(
                    self.config.cache.root.clone(),
                    std::io::Error::other(err.to_string()),
                )
            })??;
        let progress_records = self
            .progress
            .clean_old_jobs(self.config.telemetry.progress_retention);
        Ok(SweepReport {
            cache_entries,
            progress_records,
        })
    }

    pub fn invalidate(&self, fingerprint: &Fingerprint) -> Result<bool, PipelineError> {
        Ok(self.cache().invalidate(fingerprint)?)
    }

    pub fn work_dir(&self) -> PathBuf {
        self.config.work_dir()
    }

    /// Stops intake, waits for accepted jobs (including ones sleeping through
    /// a backoff), then closes every session.
    pub async fn shutdown(&self) {
        self.queue.close();
        self.queue.wait_idle().await;
        self.pool().drain_and_close_all().await;
        info!("shader pipeline shut down");
    }

    /// [`shutdown`](Self::shutdown) with an upper bound on the wait for
    /// in-flight jobs. Sessions are closed either way.
    pub async fn shutdown_within(&self, limit: Duration) -> bool {
        self.queue.close();
        let drained = tokio::time::timeout(limit, self.queue.wait_idle())
            .await
            .is_ok();
        self.pool().drain_and_close_all().await;
        drained
    }
}
