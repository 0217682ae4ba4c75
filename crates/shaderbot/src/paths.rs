//! Resolves where shaderbot keeps its configuration and rendered artifacts.
//!
//! Both roots follow the platform conventions from `directories-next` and can
//! be redirected through `SHADERBOT_CONFIG_DIR` / `SHADERBOT_CACHE_DIR`, which
//! is how the integration tests and containerised runs isolate their state.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use directories_next::ProjectDirs;

pub const ENV_CONFIG_DIR: &str = "SHADERBOT_CONFIG_DIR";
pub const ENV_CACHE_DIR: &str = "SHADERBOT_CACHE_DIR";

const QUALIFIER: &str = "org";
const ORGANISATION: &str = "shaderbot";
const APPLICATION: &str = "shaderbot";

#[derive(Debug, Clone)]
pub struct AppPaths {
    config_dir: PathBuf,
    cache_dir: PathBuf,
}

impl AppPaths {
    pub fn discover() -> Result<Self> {
        let config_override = env_override(ENV_CONFIG_DIR);
        let cache_override = env_override(ENV_CACHE_DIR);

        // Only consult the platform when something is left to resolve.
        let project_dirs = if config_override.is_none() || cache_override.is_none() {
            Some(
                ProjectDirs::from(QUALIFIER, ORGANISATION, APPLICATION)
                    .ok_or_else(|| anyhow!("failed to determine user directories"))?,
            )
        } else {
            None
        };

        let config_dir = match config_override {
            Some(dir) => dir,
            None => default_dir(project_dirs.as_ref().map(ProjectDirs::config_dir))?,
        };
        let cache_dir = match cache_override {
            Some(dir) => dir,
            None => default_dir(project_dirs.as_ref().map(ProjectDirs::cache_dir))?,
        };
        ensure_dir(&cache_dir, "cache")?;

        Ok(Self {
            config_dir,
            cache_dir,
        })
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("pipeline.toml")
    }

    /// Anchor for relative `cache.root` values.
    pub fn resolve_cache_root(&self, root: &Path) -> PathBuf {
        if root.is_absolute() {
            root.to_path_buf()
        } else {
            self.cache_dir.join(root)
        }
    }
}

fn default_dir(candidate: Option<&Path>) -> Result<PathBuf> {
    candidate
        .map(Path::to_path_buf)
        .ok_or_else(|| anyhow!("failed to determine user directories"))
}

fn ensure_dir(path: &Path, label: &str) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path).with_context(|| {
            format!(
                "failed to create shaderbot {label} directory at {}",
                path.display()
            )
        })?;
    }
    Ok(())
}

fn env_override(name: &str) -> Option<PathBuf> {
    match env::var_os(name) {
        Some(value) if !value.is_empty() => Some(PathBuf::from(value)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;
    use std::sync::{Mutex, OnceLock};
    use tempfile::TempDir;

    fn env_lock() -> &'static Mutex<()> {
        static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    struct EnvGuard {
        key: &'static str,
        previous: Option<OsString>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &Path) -> Self {
            let previous = env::var_os(key);
            env::set_var(key, value);
            Self { key, previous }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match self.previous.take() {
                Some(value) => env::set_var(self.key, value),
                None => env::remove_var(self.key),
            }
        }
    }

    #[test]
    fn env_overrides_take_precedence() {
        let _lock = env_lock().lock().unwrap();
        let root = TempDir::new().unwrap();
        let config_dir = root.path().join("config");
        let cache_dir = root.path().join("cache");
        let _config = EnvGuard::set(ENV_CONFIG_DIR, &config_dir);
        let _cache = EnvGuard::set(ENV_CACHE_DIR, &cache_dir);

        let paths = AppPaths::discover().unwrap();

        assert_eq!(paths.config_dir(), config_dir.as_path());
        assert_eq!(paths.cache_dir(), cache_dir.as_path());
        assert_eq!(paths.config_file(), config_dir.join("pipeline.toml"));
        assert!(cache_dir.is_dir());
    }

    #[test]
    fn relative_cache_roots_hang_off_the_cache_dir() {
        let _lock = env_lock().lock().unwrap();
        let root = TempDir::new().unwrap();
        let _config = EnvGuard::set(ENV_CONFIG_DIR, &root.path().join("config"));
        let _cache = EnvGuard::set(ENV_CACHE_DIR, &root.path().join("cache"));

        let paths = AppPaths::discover().unwrap();

        assert_eq!(
            paths.resolve_cache_root(Path::new("cache/renders")),
            root.path().join("cache").join("cache/renders")
        );
        let absolute = root.path().join("elsewhere");
        assert_eq!(paths.resolve_cache_root(&absolute), absolute);
    }
}
