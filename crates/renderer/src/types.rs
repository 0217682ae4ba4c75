use std::path::{Path, PathBuf};

use crate::RenderError;

/// ShaderToy exposes four optional input channels (`iChannel0-3`).
pub const CHANNEL_COUNT: usize = 4;

/// Texture inputs bound to `iChannel0-3` for a single program.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ChannelBindings {
    textures: [Option<PathBuf>; CHANNEL_COUNT],
}

impl ChannelBindings {
    /// Creates an empty bindings table with all channels unassigned.
    pub fn new() -> Self {
        Self::default()
    }

    /// Associates a texture path with the given channel.
    pub fn set_texture(&mut self, channel: usize, path: PathBuf) -> Result<(), RenderError> {
        let slot = self.textures.get_mut(channel).ok_or_else(|| {
            RenderError::Link(format!(
                "channel {channel} exceeds supported ShaderToy channel count ({CHANNEL_COUNT})"
            ))
        })?;
        *slot = Some(path);
        Ok(())
    }

    pub fn texture(&self, channel: usize) -> Option<&Path> {
        self.textures.get(channel)?.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.textures.iter().all(Option::is_none)
    }

    /// Iterates over bound channels as `(index, path)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Path)> {
        self.textures
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_deref().map(|path| (index, path)))
    }
}

/// Everything a session needs to link one user program.
#[derive(Clone, Debug, PartialEq)]
pub struct ProgramRequest {
    /// Raw ShaderToy-style fragment source defining `mainImage`.
    pub source: String,
    /// Render target size in pixels.
    pub resolution: (u32, u32),
    /// Optional texture inputs.
    pub channels: ChannelBindings,
    /// `iMouse` value held constant for the whole render (xy = position, zw = click).
    pub pointer: [f32; 4],
}

impl ProgramRequest {
    pub fn new(source: impl Into<String>, resolution: (u32, u32)) -> Self {
        Self {
            source: source.into(),
            resolution,
            channels: ChannelBindings::default(),
            pointer: [0.0; 4],
        }
    }
}

/// Time state fed into the uniform block for one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameSample {
    /// Wall-clock seconds since the first frame of the render.
    pub seconds: f32,
    /// Seconds since the previous frame.
    pub delta: f32,
    /// Zero-based frame counter (`iFrame`).
    pub frame_index: u32,
    /// Nominal frames per second (`iFrameRate`).
    pub frame_rate: f32,
}

impl FrameSample {
    pub fn first(frame_rate: f32) -> Self {
        Self {
            seconds: 0.0,
            delta: 0.0,
            frame_index: 0,
            frame_rate,
        }
    }
}

/// Hardening options applied when a session is launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchFlags {
    /// Prefer the fallback (software) adapter for reproducible output on headless hosts.
    pub software_rasterizer: bool,
    /// Largest render-target edge a session accepts.
    pub max_viewport: u32,
    /// Enable backend validation/debug layers. Off for production sessions.
    pub debug_layers: bool,
}

impl Default for LaunchFlags {
    fn default() -> Self {
        Self {
            software_rasterizer: true,
            max_viewport: 2048,
            debug_layers: false,
        }
    }
}
