//! Sidecar metadata for cached videos.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use px_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Everything recorded about one cached transcode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedVideoMetadata {
    pub video_id: String,
    pub original_url: String,
    pub settings_key: String,
    pub source_width: u32,
    pub source_height: u32,
    /// Playback duration in seconds.
    pub duration_secs: f64,
    /// Size of the cached media file; set by the cache on insert.
    pub file_size_bytes: u64,
    /// Set by the cache on insert.
    pub cached_at: DateTime<Utc>,
}

impl CachedVideoMetadata {
    pub fn new(
        video_id: impl Into<String>,
        original_url: impl Into<String>,
        settings_key: impl Into<String>,
        source_width: u32,
        source_height: u32,
        duration: Duration,
    ) -> Self {
        Self {
            video_id: video_id.into(),
            original_url: original_url.into(),
            settings_key: settings_key.into(),
            source_width,
            source_height,
            duration_secs: duration.as_secs_f64(),
            file_size_bytes: 0,
            cached_at: Utc::now(),
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.duration_secs.max(0.0))
    }

    pub(crate) async fn read(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| Error::cache(format!("read {}: {e}", path.display())))?;
        serde_json::from_slice(&bytes).map_err(|e| Error::cache(format!("parse {}: {e}", path.display())))
    }

    /// Write to `path` through a sibling `.tmp` file and a rename, so readers
    /// never observe a half-written sidecar.
    pub(crate) async fn write_atomic(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| Error::cache(format!("serialize metadata: {e}")))?;
        let tmp = path.with_extension("json.tmp");

        tokio::fs::write(&tmp, &json)
            .await
            .map_err(|e| Error::cache(format!("write {}: {e}", tmp.display())))?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Error::cache(format!("rename {}: {e}", tmp.display())));
        }
        Ok(())
    }
}
