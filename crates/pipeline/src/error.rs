use std::path::PathBuf;

use pipeconfig::ConfigError;
use renderer::RenderError;
use scheduler::{QueueError, Retryable};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error(transparent)]
    Spawn(#[from] RenderError),
    #[error("session pool is shut down")]
    Closed,
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cache sidecar {path} is malformed: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("'{0}' is not a sha256 fingerprint")]
    InvalidFingerprint(String),
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CacheError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Why a single compile attempt failed.
#[derive(Debug, Clone, Error)]
pub enum CompileError {
    #[error("shader failed validation: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error(transparent)]
    SessionSpawn(RenderError),
    #[error(transparent)]
    Render(RenderError),
    #[error("session pool is shut down")]
    Pool,
    #[error("internal compile failure: {0}")]
    Internal(String),
}

impl CompileError {
    /// Short label used when bucketing errors in metrics.
    pub fn stage(&self) -> &'static str {
        match self {
            CompileError::Validation(_) => "validation",
            CompileError::SessionSpawn(_) => "spawn",
            CompileError::Render(_) => "render",
            CompileError::Pool => "pool",
            CompileError::Internal(_) => "internal",
        }
    }
}

impl From<PoolError> for CompileError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Spawn(err) => CompileError::SessionSpawn(err),
            PoolError::Closed => CompileError::Pool,
        }
    }
}

impl Retryable for CompileError {
    fn is_retryable(&self) -> bool {
        !matches!(
            self,
            CompileError::Validation(_)
                | CompileError::Pool
                | CompileError::Render(RenderError::Viewport { .. })
        )
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("shader failed validation: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_and_shutdown_are_final() {
        assert!(!CompileError::Validation(vec!["empty".into()]).is_retryable());
        assert!(!CompileError::Pool.is_retryable());
        assert!(CompileError::SessionSpawn(RenderError::Spawn("no adapter".into())).is_retryable());
        assert!(CompileError::Render(RenderError::Link("syntax".into())).is_retryable());
        let oversized = RenderError::Viewport {
            width: 8192,
            height: 8192,
            max: 4096,
        };
        assert!(!CompileError::Render(oversized).is_retryable());
    }

    #[test]
    fn pool_errors_map_onto_compile_stages() {
        let spawn: CompileError = PoolError::Spawn(RenderError::Spawn("boom".into())).into();
        assert_eq!(spawn.stage(), "spawn");
        let closed: CompileError = PoolError::Closed.into();
        assert_eq!(closed.stage(), "pool");
    }
}
