use std::time::Duration;

use thiserror::Error;

/// Failures surfaced by a rendering engine or one of its sessions.
///
/// Messages are captured as strings so errors can be cloned into retry
/// bookkeeping and metrics without holding on to backend handles.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error("failed to launch rendering session: {0}")]
    Spawn(String),

    #[error("requested viewport {width}x{height} exceeds session limit {max}")]
    Viewport { width: u32, height: u32, max: u32 },

    #[error("shader failed to link: {0}")]
    Link(String),

    #[error("no shader program is loaded in this session")]
    NoProgram,

    #[error("frame {frame} failed to render: {message}")]
    Frame { frame: u32, message: String },

    #[error("frame capture failed: {0}")]
    Capture(String),

    #[error("rendering session is no longer alive")]
    SessionLost,

    #[error("rendering session did not respond within {0:?}")]
    Timeout(Duration),

    #[error("failed to tear down rendering session: {0}")]
    Teardown(String),
}

impl RenderError {
    /// Whether the session that produced this error can still be reused.
    pub fn poisons_session(&self) -> bool {
        matches!(
            self,
            RenderError::SessionLost | RenderError::Timeout(_) | RenderError::Teardown(_)
        )
    }
}
