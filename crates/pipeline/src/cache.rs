//! Content-addressed store for rendered artifacts.
//!
//! Layout under the cache root, one pair per fingerprint:
//!
//! ```text
//! <sha256>.json     sidecar: metadata fields + cachedAt + hash
//! <sha256>.gif      animated artifact, or
//! <sha256>.frames/  directory of frame_NNNN.png
//! ```
//!
//! The sidecar is the commit marker: it is written last, through a temporary
//! file and a rename, so a half-written entry is never mistaken for a hit. The
//! in-memory index only mirrors what is on disk; dropping it costs a re-read.
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use tracing::{debug, warn};

use crate::error::CacheError;

const SIDECAR_EXTENSION: &str = "json";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of_source(source: &str) -> Self {
        Self::of_bytes(source.as_bytes())
    }

    pub fn of_bytes(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        let mut out = String::with_capacity(digest.len() * 2);
        for byte in digest {
            out.push_str(&format!("{byte:02x}"));
        }
        Self(out)
    }

    /// Parses a fingerprint typed by a user or read back from a file name.
    pub fn from_hex(value: &str) -> Result<Self, CacheError> {
        let value = value.trim();
        if value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit()) {
            Ok(Self(value.to_ascii_lowercase()))
        } else {
            Err(CacheError::InvalidFingerprint(value.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First twelve hex digits, for log lines and file names.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactFormat {
    Gif,
    Frames,
}

impl ArtifactFormat {
    fn extension(self) -> &'static str {
        match self {
            ArtifactFormat::Gif => "gif",
            ArtifactFormat::Frames => "frames",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactMetadata {
    pub frame_count: u32,
    pub fps: u32,
    pub duration_ms: u64,
    pub width: u32,
    pub height: u32,
    pub compile_time_ms: u64,
    pub format: ArtifactFormat,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Sidecar {
    #[serde(flatten)]
    metadata: ArtifactMetadata,
    cached_at: DateTime<Utc>,
    hash: String,
}

/// A stored artifact and the metadata it was stored with.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedArtifact {
    pub fingerprint: Fingerprint,
    pub path: PathBuf,
    pub metadata: ArtifactMetadata,
    pub cached_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub evictions: u64,
    pub memory_entries: usize,
}

#[derive(Default)]
struct Counters {
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    evictions: AtomicU64,
}

pub struct ResultCache {
    root: PathBuf,
    max_age: Duration,
    index: RwLock<HashMap<Fingerprint, CachedArtifact>>,
    counters: Counters,
    scratch: AtomicU64,
}

impl ResultCache {
    pub fn open(root: impl Into<PathBuf>, max_age: Duration) -> Result<Self, CacheError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|err| CacheError::io(&root, err))?;
        debug!(root = %root.display(), max_age = ?max_age, "opened result cache");
        Ok(Self {
            root,
            max_age,
            index: RwLock::new(HashMap::new()),
            counters: Counters::default(),
            scratch: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    fn sidecar_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.root
            .join(format!("{}.{SIDECAR_EXTENSION}", fingerprint.as_str()))
    }

    fn artifact_path(&self, fingerprint: &Fingerprint, format: ArtifactFormat) -> PathBuf {
        self.root
            .join(format!("{}.{}", fingerprint.as_str(), format.extension()))
    }

    fn is_fresh(&self, cached_at: DateTime<Utc>) -> bool {
        let age = (Utc::now() - cached_at).to_std().unwrap_or(Duration::ZERO);
        age < self.max_age
    }

    fn miss(&self) -> Result<Option<CachedArtifact>, CacheError> {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        Ok(None)
    }

    /// Returns the stored artifact for `fingerprint` if it is complete and
    /// younger than the configured max age. Stale or partial entries found
    /// along the way are deleted.
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<CachedArtifact>, CacheError> {
        let remembered = self.index.read().get(fingerprint).cloned();
        if let Some(entry) = remembered {
            if self.is_fresh(entry.cached_at)
                && entry.path.exists()
                && self.sidecar_path(fingerprint).exists()
            {
                self.counters.memory_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(entry));
            }
            self.index.write().remove(fingerprint);
        }

        let sidecar_path = self.sidecar_path(fingerprint);
        let raw = match fs::read(&sidecar_path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                self.purge(fingerprint)?;
                return self.miss();
            }
            Err(err) => return Err(CacheError::io(&sidecar_path, err)),
        };

        let sidecar: Sidecar = match serde_json::from_slice(&raw) {
            Ok(sidecar) => sidecar,
            Err(err) => {
                warn!(
                    fingerprint = %fingerprint.short(),
                    error = %err,
                    "discarding unreadable cache sidecar"
                );
                self.purge(fingerprint)?;
                return self.miss();
            }
        };

        let path = self.artifact_path(fingerprint, sidecar.metadata.format);
        if sidecar.hash != fingerprint.as_str() || !path.exists() {
            debug!(fingerprint = %fingerprint.short(), "discarding partial cache entry");
            self.purge(fingerprint)?;
            return self.miss();
        }
        if !self.is_fresh(sidecar.cached_at) {
            debug!(
                fingerprint = %fingerprint.short(),
                cached_at = %sidecar.cached_at,
                "evicting expired cache entry"
            );
            self.purge(fingerprint)?;
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            return self.miss();
        }

        let entry = CachedArtifact {
            fingerprint: fingerprint.clone(),
            path,
            metadata: sidecar.metadata,
            cached_at: sidecar.cached_at,
        };
        self.index
            .write()
            .insert(fingerprint.clone(), entry.clone());
        self.counters.disk_hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some(entry))
    }

    /// Moves a freshly rendered artifact (file or frame directory) under the
    /// cache root and commits its sidecar. Racing stores for the same
    /// fingerprint are allowed; the last one wins.
    pub fn store(
        &self,
        fingerprint: &Fingerprint,
        artifact: &Path,
        metadata: ArtifactMetadata,
    ) -> Result<CachedArtifact, CacheError> {
        for format in [ArtifactFormat::Gif, ArtifactFormat::Frames] {
            remove_path(&self.artifact_path(fingerprint, format))?;
        }
        let destination = self.artifact_path(fingerprint, metadata.format);
        move_path(artifact, &destination)?;

        let cached_at = Utc::now();
        let sidecar = Sidecar {
            metadata: metadata.clone(),
            cached_at,
            hash: fingerprint.as_str().to_string(),
        };
        let encoded = serde_json::to_vec_pretty(&sidecar).map_err(|source| CacheError::Json {
            path: self.sidecar_path(fingerprint),
            source,
        })?;
        let scratch = self.root.join(format!(
            "{}.{}.{}.tmp",
            fingerprint.as_str(),
            std::process::id(),
            self.scratch.fetch_add(1, Ordering::Relaxed)
        ));
        fs::write(&scratch, encoded).map_err(|err| CacheError::io(&scratch, err))?;
        let sidecar_path = self.sidecar_path(fingerprint);
        fs::rename(&scratch, &sidecar_path).map_err(|err| CacheError::io(&sidecar_path, err))?;

        let entry = CachedArtifact {
            fingerprint: fingerprint.clone(),
            path: destination,
            metadata,
            cached_at,
        };
        self.index
            .write()
            .insert(fingerprint.clone(), entry.clone());
        self.counters.stores.fetch_add(1, Ordering::Relaxed);
        debug!(
            fingerprint = %fingerprint.short(),
            path = %entry.path.display(),
            "stored render artifact"
        );
        Ok(entry)
    }

    /// Deletes an entry from both tiers. Returns whether anything was removed.
    pub fn invalidate(&self, fingerprint: &Fingerprint) -> Result<bool, CacheError> {
        let remembered = self.index.write().remove(fingerprint).is_some();
        let removed = self.purge(fingerprint)?;
        Ok(remembered || removed)
    }

    /// Walks the cache root and deletes every entry at or past max age, along
    /// with unreadable sidecars. Returns the number of entries removed.
    pub fn sweep_expired(&self) -> Result<usize, CacheError> {
        let listing = fs::read_dir(&self.root).map_err(|err| CacheError::io(&self.root, err))?;
        let mut removed = 0;
        for dirent in listing {
            let dirent = dirent.map_err(|err| CacheError::io(&self.root, err))?;
            let path = dirent.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(SIDECAR_EXTENSION) {
                continue;
            }
            let Some(fingerprint) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| Fingerprint::from_hex(stem).ok())
            else {
                continue;
            };

            let expired = match fs::read(&path) {
                Ok(raw) => match serde_json::from_slice::<Sidecar>(&raw) {
                    Ok(sidecar) => !self.is_fresh(sidecar.cached_at),
                    Err(_) => true,
                },
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(CacheError::io(&path, err)),
            };
            if expired {
                self.index.write().remove(&fingerprint);
                self.purge(&fingerprint)?;
                removed += 1;
            }
        }
        if removed > 0 {
            self.counters
                .evictions
                .fetch_add(removed as u64, Ordering::Relaxed);
            debug!(removed, "swept expired cache entries");
        }
        Ok(removed)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            memory_hits: self.counters.memory_hits.load(Ordering::Relaxed),
            disk_hits: self.counters.disk_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            stores: self.counters.stores.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            memory_entries: self.index.read().len(),
        }
    }

    fn purge(&self, fingerprint: &Fingerprint) -> Result<bool, CacheError> {
        let mut removed = remove_path(&self.sidecar_path(fingerprint))?;
        for format in [ArtifactFormat::Gif, ArtifactFormat::Frames] {
            removed |= remove_path(&self.artifact_path(fingerprint, format))?;
        }
        Ok(removed)
    }
}

fn remove_path(path: &Path) -> Result<bool, CacheError> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(CacheError::io(path, err)),
    };
    match result {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(CacheError::io(path, err)),
    }
}

/// Renames when possible and falls back to copy-then-delete across devices.
fn move_path(from: &Path, to: &Path) -> Result<(), CacheError> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    copy_recursive(from, to)?;
    remove_path(from)?;
    Ok(())
}

fn copy_recursive(from: &Path, to: &Path) -> Result<(), CacheError> {
    let meta = fs::metadata(from).map_err(|err| CacheError::io(from, err))?;
    if !meta.is_dir() {
        fs::copy(from, to).map_err(|err| CacheError::io(to, err))?;
        return Ok(());
    }
    fs::create_dir_all(to).map_err(|err| CacheError::io(to, err))?;
    for dirent in fs::read_dir(from).map_err(|err| CacheError::io(from, err))? {
        let dirent = dirent.map_err(|err| CacheError::io(from, err))?;
        copy_recursive(&dirent.path(), &to.join(dirent.file_name()))?;
    }
    Ok(())
}
