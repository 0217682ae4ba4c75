//! Configuration model for the shader compile pipeline.
//!
//! Everything is optional: an empty file yields [`PipelineConfig::default`],
//! which matches the pool/queue sizing the pipeline was tuned for (two
//! rendering sessions, two concurrent jobs). Durations accept either a plain
//! number of seconds or a humantime string such as `"24h"` or `"750ms"`.
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub render: RenderSection,
    #[serde(default)]
    pub telemetry: TelemetrySection,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolSection {
    /// Upper bound on live rendering sessions. Each one is a full GPU device.
    pub max_instances: usize,
    /// Force the fallback (software) adapter so output does not depend on host GPUs.
    pub software_rasterizer: bool,
    /// Largest edge, in pixels, a session will ever allocate a render target for.
    pub max_viewport: u32,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            max_instances: 2,
            software_rasterizer: true,
            max_viewport: 2048,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueSection {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_backoff_kind")]
    pub backoff: BackoffKind,
    #[serde(
        default = "default_backoff_delay",
        deserialize_with = "deserialize_duration"
    )]
    pub backoff_delay: Duration,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            attempts: default_attempts(),
            backoff: default_backoff_kind(),
            backoff_delay: default_backoff_delay(),
        }
    }
}

/// Which parts of a compile request feed the cache fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub enum KeyScope {
    /// Literal shader source bytes only.
    #[default]
    #[serde(rename = "source")]
    Source,
    /// Source plus non-default resolution and texture inputs.
    #[serde(rename = "source+options")]
    SourceAndOptions,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheSection {
    #[serde(default = "default_cache_root")]
    pub root: PathBuf,
    #[serde(default = "default_max_age", deserialize_with = "deserialize_duration")]
    pub max_age: Duration,
    #[serde(default)]
    pub key_scope: KeyScope,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            root: default_cache_root(),
            max_age: default_max_age(),
            key_scope: KeyScope::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderProfile {
    #[default]
    Standard,
    /// Shorter, smaller, slower animations for low-memory hosts.
    Constrained,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RenderSection {
    #[serde(default = "default_edge")]
    pub width: u32,
    #[serde(default = "default_edge")]
    pub height: u32,
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default = "default_clip", deserialize_with = "deserialize_duration")]
    pub duration: Duration,
    #[serde(default)]
    pub profile: RenderProfile,
    #[serde(default = "default_true")]
    pub animated: bool,
    #[serde(
        default = "default_frame_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub frame_timeout: Duration,
    #[serde(
        default = "default_link_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub link_timeout: Duration,
    /// Scratch space for in-flight renders; defaults to `<cache.root>/work`.
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
}

impl Default for RenderSection {
    fn default() -> Self {
        Self {
            width: default_edge(),
            height: default_edge(),
            fps: default_fps(),
            duration: default_clip(),
            profile: RenderProfile::default(),
            animated: true,
            frame_timeout: default_frame_timeout(),
            link_timeout: default_link_timeout(),
            work_dir: None,
        }
    }
}

/// Frame plan after applying the deployment profile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedRender {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub frame_count: u32,
}

impl ResolvedRender {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.fps.max(1)))
    }

    pub fn nominal_duration(&self) -> Duration {
        Duration::from_secs_f64(f64::from(self.frame_count) / f64::from(self.fps.max(1)))
    }
}

const CONSTRAINED_FPS: u32 = 15;
const CONSTRAINED_CLIP: Duration = Duration::from_secs(2);
const CONSTRAINED_EDGE: u32 = 256;

impl RenderSection {
    /// Applies the profile's size cap to a per-job resolution override.
    pub fn fit_resolution(&self, (width, height): (u32, u32)) -> (u32, u32) {
        match self.profile {
            RenderProfile::Standard => (width, height),
            RenderProfile::Constrained => (width.min(CONSTRAINED_EDGE), height.min(CONSTRAINED_EDGE)),
        }
    }

    pub fn resolved(&self) -> ResolvedRender {
        let (width, height, fps, clip) = match self.profile {
            RenderProfile::Standard => (self.width, self.height, self.fps, self.duration),
            RenderProfile::Constrained => (
                self.width.min(CONSTRAINED_EDGE),
                self.height.min(CONSTRAINED_EDGE),
                self.fps.min(CONSTRAINED_FPS),
                self.duration.min(CONSTRAINED_CLIP),
            ),
        };
        let frame_count = (clip.as_secs_f64() * f64::from(fps)).round().max(1.0) as u32;
        ResolvedRender {
            width,
            height,
            fps,
            frame_count,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelemetrySection {
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_error_limit")]
    pub error_limit: usize,
    #[serde(
        default = "default_progress_retention",
        deserialize_with = "deserialize_duration"
    )]
    pub progress_retention: Duration,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
            error_limit: default_error_limit(),
            progress_retention: default_progress_retention(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            pool: PoolSection::default(),
            queue: QueueSection::default(),
            cache: CacheSection::default(),
            render: RenderSection::default(),
            telemetry: TelemetrySection::default(),
        }
    }
}

fn default_version() -> u32 {
    1
}

fn default_max_concurrent() -> usize {
    2
}

fn default_attempts() -> u32 {
    3
}

fn default_backoff_kind() -> BackoffKind {
    BackoffKind::Exponential
}

fn default_backoff_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_cache_root() -> PathBuf {
    PathBuf::from("cache/renders")
}

fn default_max_age() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_edge() -> u32 {
    512
}

fn default_fps() -> u32 {
    30
}

fn default_clip() -> Duration {
    Duration::from_secs(3)
}

fn default_true() -> bool {
    true
}

fn default_frame_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_link_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_history_limit() -> usize {
    100
}

fn default_error_limit() -> usize {
    50
}

fn default_progress_retention() -> Duration {
    Duration::from_secs(60 * 60)
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    deserialize_duration_opt(deserializer)?
        .ok_or_else(|| de::Error::custom("duration must not be empty"))
}

fn deserialize_duration_opt<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    struct Visitor;
    impl<'de> de::Visitor<'de> for Visitor {
        type Value = Option<Duration>;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a duration as number of seconds or human-readable string")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            humantime::parse_duration(v)
                .map(Some)
                .map_err(|err| E::custom(format!("invalid duration '{v}': {err}")))
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Some(Duration::from_secs(v)))
        }

        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v < 0 {
                return Err(E::custom("duration must be non-negative"));
            }
            Ok(Some(Duration::from_secs(v as u64)))
        }

        fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.is_nan() || v.is_sign_negative() {
                return Err(E::custom("duration must be non-negative"));
            }
            Ok(Some(Duration::from_secs_f64(v)))
        }

        fn visit_none<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(None)
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(None)
        }
    }

    deserializer.deserialize_any(Visitor)
}

impl PipelineConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let raw: PipelineConfig = toml::from_str(input)?;
        raw.validate()?;
        Ok(raw)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn work_dir(&self) -> PathBuf {
        self.render
            .work_dir
            .clone()
            .unwrap_or_else(|| self.cache.root.join("work"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != 1 {
            return Err(ConfigError::Invalid(format!(
                "unsupported config version {}; expected 1",
                self.version
            )));
        }

        if self.pool.max_instances == 0 {
            return Err(ConfigError::Invalid(
                "pool.max_instances must be at least 1".into(),
            ));
        }

        if self.pool.max_viewport == 0 {
            return Err(ConfigError::Invalid(
                "pool.max_viewport must be greater than zero".into(),
            ));
        }

        if self.queue.max_concurrent == 0 {
            return Err(ConfigError::Invalid(
                "queue.max_concurrent must be at least 1".into(),
            ));
        }

        if self.queue.max_concurrent > self.pool.max_instances {
            return Err(ConfigError::Invalid(format!(
                "queue.max_concurrent ({}) exceeds pool.max_instances ({}); the queue would oversubscribe the session pool",
                self.queue.max_concurrent, self.pool.max_instances
            )));
        }

        if self.queue.attempts == 0 {
            return Err(ConfigError::Invalid(
                "queue.attempts must be at least 1".into(),
            ));
        }

        if self.render.width == 0 || self.render.height == 0 {
            return Err(ConfigError::Invalid(
                "render.width and render.height must be greater than zero".into(),
            ));
        }

        if self.render.width > self.pool.max_viewport || self.render.height > self.pool.max_viewport
        {
            return Err(ConfigError::Invalid(format!(
                "render size {}x{} exceeds pool.max_viewport ({})",
                self.render.width, self.render.height, self.pool.max_viewport
            )));
        }

        if self.render.fps == 0 {
            return Err(ConfigError::Invalid(
                "render.fps must be greater than zero".into(),
            ));
        }

        if self.render.duration.is_zero() {
            return Err(ConfigError::Invalid(
                "render.duration must be greater than zero".into(),
            ));
        }

        if self.render.frame_timeout.is_zero() || self.render.link_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "render timeouts must be greater than zero".into(),
            ));
        }

        if self.cache.root.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("cache.root must not be empty".into()));
        }

        Ok(())
    }
}
