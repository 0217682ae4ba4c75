#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pipeconfig::{BackoffKind, PipelineConfig};
use renderer::{FrameSample, ProgramRequest, RenderEngine, RenderError, RenderSession, RgbaImage};

pub const RED: &str = "void mainImage(out vec4 fragColor, in vec2 fragCoord) { fragColor = vec4(1,0,0,1); }";

/// What every session spawned by a [`ScriptedEngine`] does.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Script {
    #[default]
    Healthy,
    FailSpawn,
    /// The first spawn blocks for the given time and then fails; later ones succeed.
    FailFirstSpawn(Duration),
    FailLink,
    /// Loses the device on the second frame.
    DieMidRender,
    /// Blocks inside `render_frame` for the given time.
    Stall(Duration),
}

#[derive(Debug, Default)]
pub struct EngineLog {
    pub spawn_attempts: AtomicU32,
    pub spawns: AtomicU32,
    pub loads: AtomicUsize,
    pub frames: AtomicUsize,
    pub closes: AtomicUsize,
}

impl EngineLog {
    pub fn spawns(&self) -> u32 {
        self.spawns.load(Ordering::SeqCst)
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

pub struct ScriptedEngine {
    log: Arc<EngineLog>,
    script: Script,
}

impl ScriptedEngine {
    pub fn new(script: Script) -> Self {
        Self {
            log: Arc::new(EngineLog::default()),
            script,
        }
    }

    pub fn healthy() -> Self {
        Self::new(Script::Healthy)
    }

    pub fn log(&self) -> Arc<EngineLog> {
        Arc::clone(&self.log)
    }
}

impl RenderEngine for ScriptedEngine {
    type Session = ScriptedSession;

    fn spawn(&self) -> Result<ScriptedSession, RenderError> {
        let attempt = self.log.spawn_attempts.fetch_add(1, Ordering::SeqCst);
        match self.script {
            Script::FailSpawn => {
                return Err(RenderError::Spawn("no adapter available".into()));
            }
            Script::FailFirstSpawn(stall) if attempt == 0 => {
                std::thread::sleep(stall);
                return Err(RenderError::Spawn("adapter reset during spawn".into()));
            }
            _ => {}
        }
        let id = self.log.spawns.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedSession {
            id,
            log: Arc::clone(&self.log),
            script: self.script,
            alive: Arc::new(AtomicBool::new(true)),
            size: (0, 0),
            frames: 0,
        })
    }
}

pub struct ScriptedSession {
    pub id: u32,
    log: Arc<EngineLog>,
    script: Script,
    pub alive: Arc<AtomicBool>,
    size: (u32, u32),
    frames: u32,
}

impl RenderSession for ScriptedSession {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn load_program(&mut self, request: &ProgramRequest) -> Result<(), RenderError> {
        self.log.loads.fetch_add(1, Ordering::SeqCst);
        if self.script == Script::FailLink {
            return Err(RenderError::Link("0:1: 'fragColor' : undeclared identifier".into()));
        }
        self.size = request.resolution;
        self.frames = 0;
        Ok(())
    }

    fn render_frame(&mut self, sample: FrameSample) -> Result<(), RenderError> {
        self.log.frames.fetch_add(1, Ordering::SeqCst);
        match self.script {
            Script::DieMidRender if sample.frame_index >= 1 => {
                self.alive.store(false, Ordering::SeqCst);
                Err(RenderError::SessionLost)
            }
            Script::Stall(duration) => {
                std::thread::sleep(duration);
                Ok(())
            }
            _ => {
                self.frames += 1;
                Ok(())
            }
        }
    }

    fn capture_frame(&mut self) -> Result<RgbaImage, RenderError> {
        let shade = (self.frames * 40).min(255) as u8;
        Ok(RgbaImage::from_pixel(
            self.size.0,
            self.size.1,
            image::Rgba([255, shade, 0, 255]),
        ))
    }

    fn close(&mut self) -> Result<(), RenderError> {
        if self.alive.swap(false, Ordering::SeqCst) {
            self.log.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Small, fast renders: 8x8 pixels, 3 frames at 10 fps, 10 ms fixed backoff.
pub fn test_config(root: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.cache.root = root.join("cache");
    config.render.width = 8;
    config.render.height = 8;
    config.render.fps = 10;
    config.render.duration = Duration::from_millis(300);
    config.render.frame_timeout = Duration::from_secs(5);
    config.render.link_timeout = Duration::from_secs(5);
    config.queue.backoff = BackoffKind::Fixed;
    config.queue.backoff_delay = Duration::from_millis(10);
    config
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
