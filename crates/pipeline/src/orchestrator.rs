//! One compile attempt: cache check, session checkout, frame loop, artifact
//! assembly and cache store.
//!
//! Every blocking engine call runs on Tokio's blocking pool under a time
//! limit. A session that times out or reports a poisoning error is discarded
//! instead of parked; the lease still returns its slot to the pool on every
//! path because release happens in its `Drop`.
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use image::codecs::gif::{GifEncoder, Repeat};
use image::{Delay, Frame, ImageFormat};
use pipeconfig::{KeyScope, RenderSection, ResolvedRender};
use renderer::{
    ChannelBindings, FrameSample, ProgramRequest, RenderEngine, RenderError, RenderSession,
};
use scheduler::JobId;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::{ArtifactFormat, ArtifactMetadata, Fingerprint, ResultCache};
use crate::error::CompileError;
use crate::metrics::{ErrorContext, PipelineMetrics};
use crate::pool::{PooledSession, SessionPool};
use crate::progress::ProgressTracker;
use crate::validate::validate;

const DEFAULT_KIND: &str = "custom";

/// Caller-supplied knobs for one compile.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileOptions {
    pub requester: Option<String>,
    /// Free-form category used to bucket metrics (`preset`, `custom`, ...).
    pub kind: String,
    /// Overrides the configured render size.
    pub resolution: Option<(u32, u32)>,
    pub channels: ChannelBindings,
    /// `iMouse` for the whole render.
    pub pointer: [f32; 4],
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            requester: None,
            kind: DEFAULT_KIND.to_string(),
            resolution: None,
            channels: ChannelBindings::default(),
            pointer: [0.0; 4],
        }
    }
}

impl CompileOptions {
    pub fn requested_by(mut self, requester: impl Into<String>) -> Self {
        self.requester = Some(requester.into());
        self
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = Some((width, height));
        self
    }

    /// Cache key for `source` compiled with these options. Requester and
    /// kind never take part; they do not change the rendered output.
    pub fn fingerprint(&self, source: &str, scope: KeyScope) -> Fingerprint {
        let folds_options = scope == KeyScope::SourceAndOptions
            && (self.resolution.is_some() || !self.channels.is_empty() || self.pointer != [0.0; 4]);
        if !folds_options {
            return Fingerprint::of_source(source);
        }
        let mut material = source.as_bytes().to_vec();
        material.push(0);
        if let Some((width, height)) = self.resolution {
            material.extend_from_slice(format!("resolution={width}x{height};").as_bytes());
        }
        for (channel, path) in self.channels.iter() {
            material.extend_from_slice(format!("channel{channel}={};", path.display()).as_bytes());
        }
        if self.pointer != [0.0; 4] {
            material.extend_from_slice(format!("pointer={:?};", self.pointer).as_bytes());
        }
        Fingerprint::of_bytes(&material)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompileJob {
    pub source: String,
    pub options: CompileOptions,
}

impl CompileJob {
    pub fn new(source: impl Into<String>, options: CompileOptions) -> Self {
        Self {
            source: source.into(),
            options,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileOutput {
    pub fingerprint: Fingerprint,
    /// Artifact location: inside the cache root, or inside the work directory
    /// when the cache store failed.
    pub artifact: PathBuf,
    pub metadata: ArtifactMetadata,
    pub from_cache: bool,
    pub cached: bool,
    pub warnings: Vec<String>,
}

pub struct Compiler<E: RenderEngine> {
    pool: SessionPool<E>,
    cache: Arc<ResultCache>,
    metrics: Arc<PipelineMetrics>,
    progress: Arc<ProgressTracker>,
    render: RenderSection,
    key_scope: KeyScope,
    work_dir: PathBuf,
    sequence: AtomicU64,
}

impl<E: RenderEngine> Compiler<E> {
    pub fn new(
        pool: SessionPool<E>,
        cache: Arc<ResultCache>,
        metrics: Arc<PipelineMetrics>,
        progress: Arc<ProgressTracker>,
        render: RenderSection,
        key_scope: KeyScope,
        work_dir: PathBuf,
    ) -> Self {
        Self {
            pool,
            cache,
            metrics,
            progress,
            render,
            key_scope,
            work_dir,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn pool(&self) -> &SessionPool<E> {
        &self.pool
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn key_scope(&self) -> KeyScope {
        self.key_scope
    }

    /// Runs one attempt. Failures are returned as values; nothing panics
    /// past this boundary.
    pub async fn compile(
        &self,
        id: JobId,
        job: &CompileJob,
        attempt: u32,
    ) -> Result<CompileOutput, CompileError> {
        let report = validate(&job.source);
        if !report.is_valid() {
            let err = CompileError::Validation(report.errors);
            self.record_failure(id, job, &err);
            return Err(err);
        }

        let fingerprint = job.options.fingerprint(&job.source, self.key_scope);
        if let Some(hit) = self.lookup(&fingerprint).await {
            self.metrics.record_cache(true);
            info!(job = id, fingerprint = %fingerprint.short(), "served from cache");
            self.progress.complete(id, hit.artifact.display().to_string());
            return Ok(CompileOutput {
                warnings: report.warnings,
                ..hit
            });
        }
        self.metrics.record_cache(false);

        let _gauge = self.metrics.compilation();
        let started = Instant::now();
        let result = self.render(id, job, &fingerprint, started).await;
        let elapsed = started.elapsed();
        self.metrics.record_compilation(
            elapsed,
            result.is_ok(),
            &job.options.kind,
            job.options.requester.as_deref(),
        );

        match result {
            Ok(mut output) => {
                output.warnings = report.warnings;
                info!(
                    job = id,
                    attempt,
                    fingerprint = %fingerprint.short(),
                    frames = output.metadata.frame_count,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "compile finished"
                );
                self.progress
                    .complete(id, output.artifact.display().to_string());
                Ok(output)
            }
            Err(err) => {
                self.record_failure(id, job, &err);
                Err(err)
            }
        }
    }

    fn record_failure(&self, id: JobId, job: &CompileJob, err: &CompileError) {
        self.metrics.record_error(
            err.to_string(),
            ErrorContext {
                job: Some(id),
                requester: job.options.requester.clone(),
                stage: err.stage().to_string(),
            },
        );
    }

    /// Cache IO problems degrade to a miss.
    async fn lookup(&self, fingerprint: &Fingerprint) -> Option<CompileOutput> {
        let cache = Arc::clone(&self.cache);
        let key = fingerprint.clone();
        let found = match tokio::task::spawn_blocking(move || cache.lookup(&key)).await {
            Ok(Ok(found)) => found,
            Ok(Err(err)) => {
                warn!(
                    fingerprint = %fingerprint.short(),
                    error = %err,
                    "cache lookup failed; rendering"
                );
                None
            }
            Err(err) => {
                warn!(
                    fingerprint = %fingerprint.short(),
                    error = %err,
                    "cache lookup task failed; rendering"
                );
                None
            }
        }?;
        Some(CompileOutput {
            fingerprint: found.fingerprint,
            artifact: found.path,
            metadata: found.metadata,
            from_cache: true,
            cached: true,
            warnings: Vec::new(),
        })
    }

    async fn render(
        &self,
        id: JobId,
        job: &CompileJob,
        fingerprint: &Fingerprint,
        started: Instant,
    ) -> Result<CompileOutput, CompileError> {
        let plan = self.render.resolved();
        let (width, height) = job
            .options
            .resolution
            .map(|size| self.render.fit_resolution(size))
            .unwrap_or((plan.width, plan.height));

        self.progress.update_progress(id, 2, "waiting for session");
        let mut lease = self.pool.acquire().await?;

        let request = ProgramRequest {
            source: job.source.clone(),
            resolution: (width, height),
            channels: job.options.channels.clone(),
            pointer: job.options.pointer,
        };
        self.progress.update_progress(id, 5, "linking");
        self.blocking(&mut lease, self.render.link_timeout, move |session| {
            session.load_program(&request)
        })
        .await
        .map_err(CompileError::Render)?;

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let workspace = Workspace::create(&self.work_dir, id, sequence)?;
        self.drive_frames(id, &mut lease, &plan, &workspace).await?;
        // The session is not needed for encoding or storing.
        drop(lease);

        self.progress.update_progress(id, 92, "assembling");
        let animated = self.render.animated;
        let frames_dir = workspace.frames_dir();
        let gif_path = workspace.root.join("render.gif");
        let frame_count = plan.frame_count;
        let fps = plan.fps;
        let (artifact, format) = tokio::task::spawn_blocking(move || {
            assemble(animated, &frames_dir, &gif_path, frame_count, fps)
        })
        .await
        .map_err(|err| CompileError::Internal(format!("artifact task failed: {err}")))?;

        let metadata = ArtifactMetadata {
            frame_count,
            fps,
            duration_ms: plan.nominal_duration().as_millis() as u64,
            width,
            height,
            compile_time_ms: started.elapsed().as_millis() as u64,
            format,
        };

        self.progress.update_progress(id, 96, "caching");
        let cache = Arc::clone(&self.cache);
        let key = fingerprint.clone();
        let stored_meta = metadata.clone();
        let source = artifact.clone();
        let stored =
            tokio::task::spawn_blocking(move || cache.store(&key, &source, stored_meta)).await;
        let failure = match stored {
            Ok(Ok(entry)) => {
                return Ok(CompileOutput {
                    fingerprint: fingerprint.clone(),
                    artifact: entry.path,
                    metadata,
                    from_cache: false,
                    cached: true,
                    warnings: Vec::new(),
                })
            }
            Ok(Err(err)) => err.to_string(),
            Err(err) => err.to_string(),
        };
        warn!(job = id, error = %failure, "cache store failed; keeping work artifact");
        workspace.keep();
        Ok(CompileOutput {
            fingerprint: fingerprint.clone(),
            artifact,
            metadata,
            from_cache: false,
            cached: false,
            warnings: Vec::new(),
        })
    }

    /// Renders and captures each frame on the wall clock, writing
    /// `frame_NNNN.png` files into the workspace.
    async fn drive_frames(
        &self,
        id: JobId,
        lease: &mut PooledSession<E>,
        plan: &ResolvedRender,
        workspace: &Workspace,
    ) -> Result<(), CompileError> {
        let interval = plan.frame_interval();
        let frame_rate = plan.fps as f32;
        let start = Instant::now();
        let mut previous = 0.0f32;
        for index in 0..plan.frame_count {
            tokio::time::sleep_until(start + interval * index).await;
            let seconds = start.elapsed().as_secs_f32();
            let sample = FrameSample {
                seconds,
                delta: seconds - previous,
                frame_index: index,
                frame_rate,
            };
            previous = seconds;

            let path = workspace.frame_path(index);
            self.blocking(lease, self.render.frame_timeout, move |session| {
                session.render_frame(sample)?;
                let image = session.capture_frame()?;
                image.save_with_format(&path, ImageFormat::Png).map_err(|err| {
                    RenderError::Capture(format!("failed to write {}: {err}", path.display()))
                })
            })
            .await
            .map_err(CompileError::Render)?;

            let done = u64::from(index + 1);
            let percent = 10 + (80 * done / u64::from(plan.frame_count)) as u8;
            self.progress.update_progress(
                id,
                percent,
                format!("frame {}/{}", index + 1, plan.frame_count),
            );
        }
        debug!(job = id, frames = plan.frame_count, "captured all frames");
        Ok(())
    }

    /// Runs `op` against the leased session on the blocking pool.
    async fn blocking<T, F>(
        &self,
        lease: &mut PooledSession<E>,
        limit: Duration,
        op: F,
    ) -> Result<T, RenderError>
    where
        T: Send + 'static,
        F: FnOnce(&mut E::Session) -> Result<T, RenderError> + Send + 'static,
    {
        let mut session = lease.take().ok_or(RenderError::SessionLost)?;
        let mut task = tokio::task::spawn_blocking(move || {
            let result = op(&mut session);
            (session, result)
        });
        match tokio::time::timeout(limit, &mut task).await {
            Ok(Ok((session, result))) => {
                if let Err(err) = &result {
                    if err.poisons_session() {
                        lease.discard();
                    }
                }
                lease.restore(session);
                result
            }
            Ok(Err(err)) => {
                warn!(error = %err, "rendering session task panicked");
                lease.discard();
                Err(RenderError::SessionLost)
            }
            Err(_) => {
                warn!(limit = ?limit, "rendering session unresponsive; retiring it");
                lease.discard();
                let pool = self.pool.clone();
                tokio::spawn(async move {
                    if let Ok((session, _)) = task.await {
                        pool.retire(session);
                    }
                });
                Err(RenderError::Timeout(limit))
            }
        }
    }
}

/// Per-attempt scratch directory, removed on drop unless kept.
struct Workspace {
    root: PathBuf,
    keep: AtomicBool,
}

impl Workspace {
    fn create(work_dir: &Path, job: JobId, sequence: u64) -> Result<Self, CompileError> {
        let root = work_dir.join(format!("job-{job}-{sequence}"));
        let frames = root.join("frames");
        fs::create_dir_all(&frames).map_err(|err| {
            CompileError::Internal(format!("failed to create {}: {err}", frames.display()))
        })?;
        Ok(Self {
            root,
            keep: AtomicBool::new(false),
        })
    }

    fn frames_dir(&self) -> PathBuf {
        self.root.join("frames")
    }

    fn frame_path(&self, index: u32) -> PathBuf {
        self.frames_dir().join(format!("frame_{index:04}.png"))
    }

    fn keep(&self) {
        self.keep.store(true, Ordering::Relaxed);
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.keep.load(Ordering::Relaxed) {
            return;
        }
        if let Err(err) = fs::remove_dir_all(&self.root) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    path = %self.root.display(),
                    error = %err,
                    "failed to clean render workspace"
                );
            }
        }
    }
}

/// Produces the final artifact. GIF encoding failures fall back to the frame
/// directory so a finished render is never thrown away.
fn assemble(
    animated: bool,
    frames_dir: &Path,
    gif_path: &Path,
    frame_count: u32,
    fps: u32,
) -> (PathBuf, ArtifactFormat) {
    if !animated {
        return (frames_dir.to_path_buf(), ArtifactFormat::Frames);
    }
    match encode_gif(frames_dir, gif_path, frame_count, fps) {
        Ok(()) => (gif_path.to_path_buf(), ArtifactFormat::Gif),
        Err(err) => {
            warn!(error = %err, "gif encoding failed; storing frames");
            let _ = fs::remove_file(gif_path);
            (frames_dir.to_path_buf(), ArtifactFormat::Frames)
        }
    }
}

fn encode_gif(
    frames_dir: &Path,
    gif_path: &Path,
    frame_count: u32,
    fps: u32,
) -> Result<(), image::ImageError> {
    let file = File::create(gif_path)?;
    let mut encoder = GifEncoder::new_with_speed(BufWriter::new(file), 10);
    encoder.set_repeat(Repeat::Infinite)?;
    let delay = Delay::from_numer_denom_ms(1000, fps.max(1));
    for index in 0..frame_count {
        let path = frames_dir.join(format!("frame_{index:04}.png"));
        let image = image::open(&path)?.into_rgba8();
        encoder.encode_frame(Frame::from_parts(image, 0, 0, delay))?;
    }
    Ok(())
}
