//! The disk video cache.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use chrono::Utc;
use dashmap::DashMap;
use px_core::config::CacheConfig;
use px_core::{Error, Result};
use serde::Serialize;
use tokio::sync::RwLock;
use walkdir::WalkDir;

use crate::metadata::CachedVideoMetadata;
use crate::naming::entry_name;

const VIDEOS_DIR: &str = "videos";
const METADATA_DIR: &str = "metadata";
const METADATA_EXT: &str = "json";
const TMP_SUFFIX: &str = ".tmp";

/// Eviction trims the cache to this fraction of the budget.
const EVICTION_TARGET_RATIO: f64 = 0.8;

const CACHEDIR_TAG: &str = "Signature: 8a477f597d28d172789f06886806bc55\n\
# This file marks the parallax stereo cache; backup tools should skip it.\n";

/// Entry count and size of the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    /// Bytes used by media files and sidecars.
    pub total_bytes: u64,
    pub max_bytes: u64,
}

/// Outcome of one eviction pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EvictionReport {
    /// Entry names removed, oldest first.
    pub removed: Vec<String>,
    pub freed_bytes: u64,
    pub total_bytes: u64,
}

struct Inner {
    root: PathBuf,
    videos_dir: PathBuf,
    metadata_dir: PathBuf,
    extension: String,
    max_bytes: u64,
    auto_evict: bool,
    /// Writers (put/remove/evict/reconcile/clear) take this exclusively.
    gate: RwLock<()>,
    /// Entry name -> number of live pins.
    pins: DashMap<String, usize>,
}

/// Size-bounded, LRU-evicting store of transcoded videos.
///
/// Cloning is cheap and every clone shares the same directory lock, so one
/// instance can be handed to any number of playback sessions.
#[derive(Clone)]
pub struct DiskVideoCache {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DiskVideoCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskVideoCache")
            .field("root", &self.inner.root)
            .field("max_bytes", &self.inner.max_bytes)
            .finish_non_exhaustive()
    }
}

/// One on-disk entry seen during a directory scan.
struct ScannedEntry {
    name: String,
    video: PathBuf,
    sidecar: PathBuf,
    bytes: u64,
    modified: SystemTime,
}

fn io_err(context: &str, path: &Path, e: std::io::Error) -> Error {
    Error::cache(format!("{context} {}: {e}", path.display()))
}

/// Set a file's modification time, used as its last-access time.
pub(crate) fn touch(path: &Path, when: SystemTime) -> std::io::Result<()> {
    std::fs::File::options().write(true).open(path)?.set_modified(when)
}

fn is_tmp(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(TMP_SUFFIX))
}

async fn remove_if_exists(path: &Path) -> Result<u64> {
    let bytes = match tokio::fs::metadata(path).await {
        Ok(m) => m.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(io_err("stat", path, e)),
    };
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(io_err("remove", path, e)),
    }
}

impl DiskVideoCache {
    /// Open (creating if needed) a cache rooted at `config.dir`, storing
    /// media files with the given extension. Orphans left by a crash are
    /// cleaned up before this returns.
    pub async fn open(config: &CacheConfig, extension: &str) -> Result<Self> {
        let root = config.dir.clone();
        let videos_dir = root.join(VIDEOS_DIR);
        let metadata_dir = root.join(METADATA_DIR);
        for dir in [&videos_dir, &metadata_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| io_err("create", dir, e))?;
        }

        let tag = root.join("CACHEDIR.TAG");
        if !tokio::fs::try_exists(&tag).await.unwrap_or(false) {
            tokio::fs::write(&tag, CACHEDIR_TAG)
                .await
                .map_err(|e| io_err("write", &tag, e))?;
        }

        let cache = Self {
            inner: Arc::new(Inner {
                root,
                videos_dir,
                metadata_dir,
                extension: extension.trim_start_matches('.').to_string(),
                max_bytes: config.max_bytes,
                auto_evict: config.auto_evict,
                gate: RwLock::new(()),
                pins: DashMap::new(),
            }),
        };

        let repaired = cache.reconcile().await?;
        if repaired > 0 {
            tracing::info!(repaired, root = %cache.inner.root.display(), "Removed orphaned cache files");
        }
        Ok(cache)
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Media file location for a key, whether or not it exists.
    pub fn video_path(&self, video_id: &str, settings_key: &str) -> PathBuf {
        self.video_path_for(&entry_name(video_id, settings_key))
    }

    fn video_path_for(&self, name: &str) -> PathBuf {
        self.inner.videos_dir.join(format!("{name}.{}", self.inner.extension))
    }

    fn sidecar_path_for(&self, name: &str) -> PathBuf {
        self.inner.metadata_dir.join(format!("{name}.{METADATA_EXT}"))
    }

    async fn entry_exists(&self, name: &str) -> bool {
        let video = tokio::fs::try_exists(self.video_path_for(name)).await.unwrap_or(false);
        video && tokio::fs::try_exists(self.sidecar_path_for(name)).await.unwrap_or(false)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Whether a complete entry (file and sidecar) exists.
    pub async fn has(&self, video_id: &str, settings_key: &str) -> bool {
        let _read = self.inner.gate.read().await;
        self.entry_exists(&entry_name(video_id, settings_key)).await
    }

    /// Location of a cached file, refreshing its last-access time.
    pub async fn get(&self, video_id: &str, settings_key: &str) -> Option<PathBuf> {
        let _read = self.inner.gate.read().await;
        let name = entry_name(video_id, settings_key);
        if !self.entry_exists(&name).await {
            return None;
        }

        let path = self.video_path_for(&name);
        if let Err(e) = touch(&path, SystemTime::now()) {
            tracing::warn!("Failed to refresh access time of {}: {e}", path.display());
        }
        tracing::debug!(video_id, key = settings_key, "Cache hit");
        Some(path)
    }

    /// Stored metadata for an entry.
    pub async fn metadata(&self, video_id: &str, settings_key: &str) -> Option<CachedVideoMetadata> {
        let _read = self.inner.gate.read().await;
        let name = entry_name(video_id, settings_key);
        if !self.entry_exists(&name).await {
            return None;
        }
        CachedVideoMetadata::read(&self.sidecar_path_for(&name)).await.ok()
    }

    /// Metadata of every complete entry.
    pub async fn list(&self) -> Result<Vec<CachedVideoMetadata>> {
        let _read = self.inner.gate.read().await;
        let mut out = Vec::new();
        for entry in self.scan()? {
            if let Ok(meta) = CachedVideoMetadata::read(&entry.sidecar).await {
                out.push(meta);
            }
        }
        Ok(out)
    }

    /// Entry count and bytes used.
    pub async fn stats(&self) -> Result<CacheStats> {
        let _read = self.inner.gate.read().await;
        Ok(CacheStats {
            entries: self.scan()?.len(),
            total_bytes: self.total_bytes(),
            max_bytes: self.inner.max_bytes,
        })
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Move `source_file` into the cache under `(video_id, settings_key)`,
    /// replacing any existing entry, and write its sidecar.
    ///
    /// `metadata.video_id`, `settings_key`, `file_size_bytes` and `cached_at`
    /// are filled in by the cache. When auto-eviction is enabled, an
    /// eviction pass is scheduled in the background afterwards.
    pub async fn put(
        &self,
        source_file: &Path,
        video_id: &str,
        settings_key: &str,
        mut metadata: CachedVideoMetadata,
    ) -> Result<PathBuf> {
        let name = entry_name(video_id, settings_key);
        let video = self.video_path_for(&name);
        let sidecar = self.sidecar_path_for(&name);

        {
            let _write = self.inner.gate.write().await;

            remove_if_exists(&sidecar).await?;
            remove_if_exists(&video).await?;

            if tokio::fs::rename(source_file, &video).await.is_err() {
                let tmp = video.with_file_name(format!("{name}.{}{TMP_SUFFIX}", self.inner.extension));
                tokio::fs::copy(source_file, &tmp)
                    .await
                    .map_err(|e| io_err("copy", source_file, e))?;
                tokio::fs::rename(&tmp, &video)
                    .await
                    .map_err(|e| io_err("rename", &tmp, e))?;
                let _ = tokio::fs::remove_file(source_file).await;
            }

            let size = tokio::fs::metadata(&video)
                .await
                .map_err(|e| io_err("stat", &video, e))?
                .len();

            metadata.video_id = video_id.to_string();
            metadata.settings_key = settings_key.to_string();
            metadata.file_size_bytes = size;
            metadata.cached_at = Utc::now();

            if let Err(e) = metadata.write_atomic(&sidecar).await {
                // Keep file and sidecar in lockstep.
                let _ = tokio::fs::remove_file(&video).await;
                return Err(e);
            }
            if let Err(e) = touch(&video, SystemTime::now()) {
                tracing::warn!("Failed to set access time of {}: {e}", video.display());
            }

            tracing::info!(video_id, key = settings_key, bytes = size, "Cached transcoded video");
        }

        if self.inner.auto_evict {
            let cache = self.clone();
            tokio::spawn(async move {
                if let Err(e) = cache.evict_if_over_budget().await {
                    tracing::warn!("Background cache eviction failed: {e}");
                }
            });
        }

        Ok(video)
    }

    /// Delete an entry. Returns whether anything was removed.
    pub async fn remove(&self, video_id: &str, settings_key: &str) -> Result<bool> {
        let _write = self.inner.gate.write().await;
        let name = entry_name(video_id, settings_key);
        let freed = self.remove_entry(&name).await?;
        if freed > 0 {
            tracing::info!(video_id, key = settings_key, "Removed cache entry");
        }
        Ok(freed > 0)
    }

    async fn remove_entry(&self, name: &str) -> Result<u64> {
        let sidecar = remove_if_exists(&self.sidecar_path_for(name)).await?;
        let video = remove_if_exists(&self.video_path_for(name)).await?;
        Ok(sidecar + video)
    }

    /// Remove least-recently-used entries until the cache is at or below
    /// 80% of its budget. Pinned entries are skipped.
    pub async fn evict_if_over_budget(&self) -> Result<EvictionReport> {
        let _write = self.inner.gate.write().await;

        let mut total = self.total_bytes();
        let budget = self.inner.max_bytes;
        if total <= budget {
            return Ok(EvictionReport {
                total_bytes: total,
                ..Default::default()
            });
        }

        let target = (budget as f64 * EVICTION_TARGET_RATIO) as u64;
        let mut entries = self.scan()?;
        entries.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.name.cmp(&b.name)));

        let mut report = EvictionReport::default();
        for entry in entries {
            if total <= target {
                break;
            }
            if self.is_pinned_name(&entry.name) {
                tracing::debug!(entry = %entry.name, "Skipping pinned entry during eviction");
                continue;
            }
            let freed = self.remove_entry(&entry.name).await?;
            total = total.saturating_sub(freed);
            report.freed_bytes += freed;
            report.removed.push(entry.name);
        }

        report.total_bytes = total;
        if total > target {
            tracing::warn!(total, target, "Cache still above eviction target; remaining entries are pinned");
        }
        tracing::info!(
            removed = report.removed.len(),
            freed = report.freed_bytes,
            total,
            budget,
            "Cache eviction complete"
        );
        Ok(report)
    }

    /// Remove orphaned media files, orphaned or unreadable sidecars, and
    /// leftover temporary files. Returns the number of files deleted.
    pub async fn reconcile(&self) -> Result<usize> {
        let _write = self.inner.gate.write().await;
        let mut removed = 0;

        for dir in [&self.inner.videos_dir, &self.inner.metadata_dir] {
            for path in list_files(dir)? {
                if is_tmp(&path) {
                    tracing::debug!(path = %path.display(), "Removing stale temp file");
                    removed += usize::from(remove_if_exists(&path).await? > 0);
                }
            }
        }

        for video in list_files(&self.inner.videos_dir)? {
            let Some(name) = self.name_of_video(&video) else {
                continue;
            };
            let sidecar = self.sidecar_path_for(&name);
            let valid = CachedVideoMetadata::read(&sidecar).await.is_ok();
            if !valid {
                tracing::warn!(entry = %name, "Removing cache entry without a readable sidecar");
                removed += usize::from(remove_if_exists(&video).await? > 0);
                removed += usize::from(remove_if_exists(&sidecar).await? > 0);
            }
        }

        for sidecar in list_files(&self.inner.metadata_dir)? {
            let Some(name) = sidecar
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(&format!(".{METADATA_EXT}")))
                .map(str::to_string)
            else {
                continue;
            };
            if !self.video_path_for(&name).exists() {
                tracing::warn!(entry = %name, "Removing sidecar without a media file");
                removed += usize::from(remove_if_exists(&sidecar).await? > 0);
            }
        }

        Ok(removed)
    }

    /// Delete every entry. Returns how many were removed.
    pub async fn clear(&self) -> Result<usize> {
        let _write = self.inner.gate.write().await;
        let entries = self.scan()?;
        let mut removed = 0;
        for entry in entries {
            if self.is_pinned_name(&entry.name) {
                continue;
            }
            self.remove_entry(&entry.name).await?;
            removed += 1;
        }
        tracing::info!(removed, "Cleared cache");
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Pins
    // -----------------------------------------------------------------------

    /// Protect an entry from eviction for as long as the guard lives.
    pub fn pin(&self, video_id: &str, settings_key: &str) -> CachePin {
        let name = entry_name(video_id, settings_key);
        *self.inner.pins.entry(name.clone()).or_insert(0) += 1;
        CachePin {
            inner: Arc::clone(&self.inner),
            name,
        }
    }

    pub fn is_pinned(&self, video_id: &str, settings_key: &str) -> bool {
        self.is_pinned_name(&entry_name(video_id, settings_key))
    }

    fn is_pinned_name(&self, name: &str) -> bool {
        self.inner.pins.get(name).is_some_and(|n| *n > 0)
    }

    // -----------------------------------------------------------------------
    // Scanning
    // -----------------------------------------------------------------------

    fn name_of_video(&self, path: &Path) -> Option<String> {
        let file_name = path.file_name()?.to_str()?;
        file_name
            .strip_suffix(&format!(".{}", self.inner.extension))
            .map(str::to_string)
    }

    /// Complete entries currently on disk.
    fn scan(&self) -> Result<Vec<ScannedEntry>> {
        let mut entries = Vec::new();
        for video in list_files(&self.inner.videos_dir)? {
            let Some(name) = self.name_of_video(&video) else {
                continue;
            };
            let sidecar = self.sidecar_path_for(&name);
            let Ok(sidecar_meta) = std::fs::metadata(&sidecar) else {
                continue;
            };
            let video_meta = std::fs::metadata(&video).map_err(|e| io_err("stat", &video, e))?;
            entries.push(ScannedEntry {
                name,
                bytes: video_meta.len() + sidecar_meta.len(),
                modified: video_meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                video,
                sidecar,
            });
        }
        Ok(entries)
    }

    /// Bytes used by everything under `videos/` and `metadata/`.
    fn total_bytes(&self) -> u64 {
        [&self.inner.videos_dir, &self.inner.metadata_dir]
            .into_iter()
            .flat_map(|dir| WalkDir::new(dir).into_iter().filter_map(|e| e.ok()))
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.metadata().ok())
            .map(|m| m.len())
            .sum()
    }
}

fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| Error::cache(format!("scan {}: {e}", dir.display())))?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

/// Keeps one cache entry out of eviction until dropped.
#[must_use = "the entry is only protected while the pin is alive"]
pub struct CachePin {
    inner: Arc<Inner>,
    name: String,
}

impl std::fmt::Debug for CachePin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachePin").field("name", &self.name).finish()
    }
}

impl Drop for CachePin {
    fn drop(&mut self) {
        self.inner.pins.remove_if_mut(&self.name, |_, count| {
            *count = count.saturating_sub(1);
            *count == 0
        });
    }
}
