//! Headless rendering sessions for ShaderToy-style fragment shaders.
//!
//! The crate exposes the four primitives the compile pipeline needs from a
//! rendering engine and one concrete engine built on `wgpu`:
//!
//! ```text
//!   RenderEngine::spawn ──▶ RenderSession ──▶ load_program(ProgramRequest)
//!                                │
//!                                ├─▶ render_frame(FrameSample) ─▶ uniforms ─▶ draw
//!                                ├─▶ capture_frame() ─▶ RgbaImage
//!                                └─▶ close()
//! ```
//!
//! Shader snippets are wrapped by [`program::ProgramBuilder`] so they can be
//! compiled as Vulkan GLSL against a fixed uniform contract (`iTime`,
//! `iResolution`, `iMouse`, `iChannel0-3`, ...). Any engine implementing
//! [`RenderEngine`] can stand in for [`gpu::GpuEngine`]; the pipeline never
//! touches `wgpu` directly.

mod error;
pub mod gpu;
pub mod program;
mod types;

pub use error::RenderError;
pub use gpu::GpuEngine;
pub use types::{
    ChannelBindings, FrameSample, LaunchFlags, ProgramRequest, CHANNEL_COUNT,
};

pub use image::RgbaImage;

/// Factory for rendering sessions.
///
/// `spawn` is the most expensive call in the pipeline (device creation and a
/// probe link) and blocks the calling thread; async callers should run it on
/// a blocking pool.
pub trait RenderEngine: Send + Sync + 'static {
    type Session: RenderSession;

    fn spawn(&self) -> Result<Self::Session, RenderError>;
}

/// One exclusively owned rendering context with the program template loaded.
pub trait RenderSession: Send + 'static {
    /// False once the underlying context has been lost or closed.
    fn is_alive(&self) -> bool;

    /// Injects a user fragment shader and links it against the fixed vertex stage.
    fn load_program(&mut self, request: &ProgramRequest) -> Result<(), RenderError>;

    /// Advances the loaded program by one frame using the supplied time sample.
    fn render_frame(&mut self, sample: FrameSample) -> Result<(), RenderError>;

    /// Reads back the most recently rendered frame.
    fn capture_frame(&mut self) -> Result<RgbaImage, RenderError>;

    /// Releases the context. Must be safe to call on an already-dead session.
    fn close(&mut self) -> Result<(), RenderError>;
}
