mod support;

use std::time::Duration;

use pipeline::{
    ArtifactFormat, CompileError, CompileJob, CompileOptions, JobStatus, PipelineError,
    ShaderPipeline,
};
use pipeconfig::RenderProfile;
use renderer::RenderError;
use scheduler::{Backoff, JobOptions, Priority, QueueError};
use support::{eventually, test_config, Script, ScriptedEngine, RED};
use tempfile::TempDir;

fn pipeline(dir: &TempDir, script: Script) -> ShaderPipeline<ScriptedEngine> {
    ShaderPipeline::new(ScriptedEngine::new(script), test_config(dir.path())).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn identical_source_is_served_from_cache() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline(&dir, Script::Healthy);
    let log = pipeline.pool().engine().log();

    let first = pipeline
        .submit(RED, CompileOptions::default(), Priority::Normal)
        .unwrap()
        .await
        .unwrap();
    assert!(!first.from_cache);
    assert!(first.cached);
    assert_eq!(first.metadata.frame_count, 3);
    assert_eq!(first.metadata.format, ArtifactFormat::Gif);
    assert!(first.artifact.starts_with(dir.path().join("cache")));
    assert!(first.artifact.exists());
    assert_eq!(log.loads(), 1);

    let second = pipeline
        .submit(RED, CompileOptions::default(), Priority::Normal)
        .unwrap()
        .await
        .unwrap();
    assert!(second.from_cache);
    assert_eq!(second.artifact, first.artifact);
    assert_eq!(second.metadata, first.metadata);
    assert_eq!(log.loads(), 1, "cache hit must not touch the engine");

    let stats = pipeline.stats();
    assert_eq!(stats.metrics.cache_hits, 1);
    assert_eq!(stats.metrics.cache_misses, 1);
    assert_eq!(stats.metrics.successes, 1);
    assert_eq!(stats.pool.active, 0);
    assert_eq!(stats.pool.idle, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn work_directory_is_cleaned_after_caching() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline(&dir, Script::Healthy);

    pipeline
        .submit(RED, CompileOptions::default(), Priority::Normal)
        .unwrap()
        .await
        .unwrap();
    let leftovers = std::fs::read_dir(pipeline.work_dir())
        .map(|listing| listing.count())
        .unwrap_or(0);
    assert_eq!(leftovers, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn still_renders_are_stored_as_frame_directories() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.render.animated = false;
    let pipeline = ShaderPipeline::new(ScriptedEngine::healthy(), config).unwrap();

    let output = pipeline
        .submit(RED, CompileOptions::default(), Priority::High)
        .unwrap()
        .await
        .unwrap();
    assert_eq!(output.metadata.format, ArtifactFormat::Frames);
    assert!(output.artifact.join("frame_0000.png").exists());
    assert!(output.artifact.join("frame_0002.png").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_engine_is_attempted_exactly_as_configured() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline(&dir, Script::FailLink);
    let log = pipeline.pool().engine().log();
    let options = JobOptions {
        priority: Priority::Normal,
        attempts: 2,
        backoff: Backoff::Fixed(Duration::from_millis(10)),
    };

    let handle = pipeline
        .submit_with(CompileJob::new(RED, CompileOptions::default()), options)
        .unwrap();
    let id = handle.id();
    let err = handle.await.unwrap_err();

    let failure = err.failure().unwrap();
    assert_eq!(failure.attempts, 2);
    assert!(matches!(
        failure.error,
        CompileError::Render(RenderError::Link(_))
    ));
    assert_eq!(log.loads(), 2);
    // A link error leaves the session healthy; it is reused for the retry.
    assert_eq!(log.spawns(), 1);

    let progress = pipeline.progress(id).unwrap();
    assert_eq!(progress.status, JobStatus::Failed);
    let stats = pipeline.stats();
    assert_eq!(stats.pool.active, 0);
    assert_eq!(stats.metrics.failures, 2);
    assert_eq!(stats.metrics.recent_errors.len(), 2);
    assert_eq!(stats.queue.retried, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lost_sessions_are_replaced_between_attempts() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline(&dir, Script::DieMidRender);
    let log = pipeline.pool().engine().log();

    let err = pipeline
        .submit(RED, CompileOptions::default(), Priority::Normal)
        .unwrap()
        .await
        .unwrap_err();
    let failure = err.failure().unwrap();
    assert_eq!(failure.attempts, 3);
    assert!(matches!(
        failure.error,
        CompileError::Render(RenderError::SessionLost)
    ));
    assert_eq!(log.spawns(), 3);
    let stats = pipeline.pool().stats();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.idle, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn spawn_failures_surface_after_retries() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline(&dir, Script::FailSpawn);

    let err = pipeline
        .submit(RED, CompileOptions::default(), Priority::Low)
        .unwrap()
        .await
        .unwrap_err();
    let failure = err.failure().unwrap();
    assert_eq!(failure.attempts, 3);
    assert!(matches!(failure.error, CompileError::SessionSpawn(_)));
    assert_eq!(pipeline.pool().stats().active, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unresponsive_sessions_time_out_and_are_retired() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.render.frame_timeout = Duration::from_millis(50);
    config.queue.attempts = 1;
    let engine = ScriptedEngine::new(Script::Stall(Duration::from_millis(300)));
    let log = engine.log();
    let pipeline = ShaderPipeline::new(engine, config).unwrap();

    let err = pipeline
        .submit(RED, CompileOptions::default(), Priority::Normal)
        .unwrap()
        .await
        .unwrap_err();
    assert!(matches!(
        err.failure().unwrap().error,
        CompileError::Render(RenderError::Timeout(_))
    ));
    assert_eq!(pipeline.pool().stats().active, 0);
    assert!(eventually(|| log.closes() == 1).await);
}

#[tokio::test]
async fn invalid_shaders_are_rejected_before_queueing() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline(&dir, Script::Healthy);

    let err = pipeline
        .submit("void main() {}", CompileOptions::default(), Priority::High)
        .unwrap_err();
    assert!(matches!(err, PipelineError::Validation(_)));
    assert_eq!(pipeline.stats().queue.submitted, 0);
    assert_eq!(pipeline.pool().engine().log().spawns(), 0);
}

#[tokio::test]
async fn out_of_range_sizes_are_rejected_before_queueing() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline(&dir, Script::Healthy);
    let max = pipeline.config().pool.max_viewport;

    for (width, height) in [(0, 64), (64, 0), (max + 1, 64)] {
        let err = pipeline
            .submit(
                RED,
                CompileOptions::default().with_resolution(width, height),
                Priority::Normal,
            )
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)), "{width}x{height}");
    }
    assert_eq!(pipeline.stats().queue.submitted, 0);
    assert_eq!(pipeline.pool().engine().log().spawns(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn constrained_profile_caps_requested_size() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.render.profile = RenderProfile::Constrained;
    let pipeline = ShaderPipeline::new(ScriptedEngine::healthy(), config).unwrap();

    let output = pipeline
        .submit(
            RED,
            CompileOptions::default().with_resolution(512, 300),
            Priority::Normal,
        )
        .unwrap()
        .await
        .unwrap();
    assert_eq!((output.metadata.width, output.metadata.height), (256, 256));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn source_only_keys_ignore_requester_and_size() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline(&dir, Script::Healthy);
    let log = pipeline.pool().engine().log();

    pipeline
        .submit(RED, CompileOptions::default().requested_by("alice"), Priority::Normal)
        .unwrap()
        .await
        .unwrap();
    let second = pipeline
        .submit(
            RED,
            CompileOptions::default().requested_by("bob").with_resolution(4, 4),
            Priority::Normal,
        )
        .unwrap()
        .await
        .unwrap();
    assert!(second.from_cache);
    assert_eq!(log.loads(), 1);
    assert_eq!(
        pipeline.fingerprint(RED, &CompileOptions::default()).as_str(),
        second.fingerprint.as_str()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn option_scoped_keys_render_each_variant() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.cache.key_scope = pipeconfig::KeyScope::SourceAndOptions;
    let pipeline = ShaderPipeline::new(ScriptedEngine::healthy(), config).unwrap();
    let log = pipeline.pool().engine().log();

    for size in [8, 4] {
        let output = pipeline
            .submit(
                RED,
                CompileOptions::default().with_resolution(size, size),
                Priority::Normal,
            )
            .unwrap()
            .await
            .unwrap();
        assert!(!output.from_cache);
        assert_eq!(output.metadata.width, size);
    }
    assert_eq!(log.loads(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalidated_entries_render_again() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline(&dir, Script::Healthy);
    let log = pipeline.pool().engine().log();

    let first = pipeline
        .submit(RED, CompileOptions::default(), Priority::Normal)
        .unwrap()
        .await
        .unwrap();
    assert!(pipeline.invalidate(&first.fingerprint).unwrap());
    let again = pipeline
        .submit(RED, CompileOptions::default(), Priority::Normal)
        .unwrap()
        .await
        .unwrap();
    assert!(!again.from_cache);
    assert_eq!(log.loads(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn completed_jobs_report_full_progress() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline(&dir, Script::Healthy);

    let handle = pipeline
        .submit(RED, CompileOptions::default().requested_by("carol"), Priority::Normal)
        .unwrap();
    let id = handle.id();
    let output = handle.await.unwrap();

    let progress = pipeline.progress(id).unwrap();
    assert_eq!(progress.status, JobStatus::Completed);
    assert_eq!(progress.percent, 100);
    assert_eq!(progress.requester.as_deref(), Some("carol"));
    assert_eq!(
        progress.summary.as_deref(),
        Some(output.artifact.display().to_string().as_str())
    );
    assert!(pipeline.active_jobs().is_empty());
    assert_eq!(pipeline.stats().metrics.by_requester["carol"].successes, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_finishes_work_then_closes_sessions() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline(&dir, Script::Healthy);
    let log = pipeline.pool().engine().log();

    let handle = pipeline
        .submit(RED, CompileOptions::default(), Priority::Normal)
        .unwrap();
    pipeline.shutdown().await;

    assert!(handle.await.is_ok());
    assert!(matches!(
        pipeline.submit(RED, CompileOptions::default(), Priority::Normal),
        Err(PipelineError::Queue(QueueError::Closed))
    ));
    assert_eq!(log.closes(), log.spawns() as usize);
    assert_eq!(pipeline.pool().stats().idle, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sweep_reports_removed_records() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.telemetry.progress_retention = Duration::ZERO;
    let pipeline = ShaderPipeline::new(ScriptedEngine::healthy(), config).unwrap();

    pipeline
        .submit(RED, CompileOptions::default(), Priority::Normal)
        .unwrap()
        .await
        .unwrap();
    let report = pipeline.sweep().await.unwrap();
    assert_eq!(report.cache_entries, 0);
    assert_eq!(report.progress_records, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn finished_progress_lapses_without_a_sweep() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.telemetry.progress_retention = Duration::from_millis(20);
    let pipeline = ShaderPipeline::new(ScriptedEngine::healthy(), config).unwrap();

    let first = pipeline
        .submit(RED, CompileOptions::default(), Priority::Normal)
        .unwrap();
    let first_id = first.id();
    first.await.unwrap();
    assert!(pipeline.progress(first_id).is_some());

    tokio::time::sleep(Duration::from_millis(40)).await;
    let second = pipeline
        .submit(RED, CompileOptions::default(), Priority::Normal)
        .unwrap();
    assert!(pipeline.progress(first_id).is_none());
    assert!(pipeline.progress(second.id()).is_some());
    second.await.unwrap();
}

#[test]
fn rejects_queue_larger_than_pool() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.queue.max_concurrent = 3;
    assert!(matches!(
        ShaderPipeline::new(ScriptedEngine::healthy(), config),
        Err(PipelineError::Config(_))
    ));
}
