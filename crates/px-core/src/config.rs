//! Application configuration types.
//!
//! The top-level [`Config`] struct is deserialized from JSON and carries the
//! cache, transcode, download, chunked-streaming, and tool sections. Every
//! section defaults sensibly so a completely empty `{}` file is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::Error;

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache: CacheConfig,
    pub transcode: TranscodeConfig,
    pub download: DownloadConfig,
    pub chunked: ChunkedConfig,
    pub tools: ToolsConfig,
}

impl Config {
    /// Deserialize a `Config` from a JSON string and reject values the
    /// pipeline cannot run with (see [`Config::check`]).
    pub fn from_json(json_str: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json_str)
            .map_err(|e| Error::Validation(format!("config parse error: {e}")))?;
        config.check()?;
        Ok(config)
    }

    /// Fail on settings that would break a session outright.
    pub fn check(&self) -> Result<()> {
        let rate = self.transcode.default_frame_rate;
        if !(rate.is_finite() && rate > 0.0) {
            return Err(Error::Validation(format!(
                "transcode.default_frame_rate must be a positive number, got {rate}"
            )));
        }
        Ok(())
    }

    /// Load configuration from a file path, falling back to defaults if the
    /// path is `None`, the file does not exist, or it fails to parse.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_json(&contents).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse config file {}: {e}", path.display());
                Self::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config file at {}; using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {e}", path.display());
                Self::default()
            }
        }
    }

    /// Return a list of validation warnings (non-fatal issues).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.cache.max_bytes == 0 {
            warnings.push("cache.max_bytes is 0; every entry will be evicted immediately".into());
        }

        if self.transcode.progress_interval_frames == 0 {
            warnings.push("transcode.progress_interval_frames is 0; progress is reported once at the end".into());
        }

        let ext = &self.transcode.container_extension;
        if ext.is_empty() || ext.contains(['.', '/', '\\']) {
            warnings.push(format!("transcode.container_extension '{ext}' is not a bare extension"));
        }

        if self.chunked.chunk_duration_secs <= 0.0 {
            warnings.push("chunked.chunk_duration_secs must be positive".into());
        }
        if self.chunked.min_buffer_ahead == 0 {
            warnings.push("chunked.min_buffer_ahead is 0; treated as 1".into());
        }
        if self.chunked.max_buffer_ahead < self.chunked.min_buffer_ahead {
            warnings.push(format!(
                "chunked.max_buffer_ahead ({}) is below min_buffer_ahead ({}); playback can never become ready",
                self.chunked.max_buffer_ahead, self.chunked.min_buffer_ahead
            ));
        }
        if self.chunked.max_concurrent == 0 {
            warnings.push("chunked.max_concurrent is 0; treated as 1".into());
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// Disk cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Root directory holding the `videos/` and `metadata/` subdirectories.
    pub dir: PathBuf,
    /// Size budget in bytes; eviction trims to 80% of this.
    pub max_bytes: u64,
    /// Run an eviction check in the background after every insert.
    pub auto_evict: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data/stereo-cache"),
            max_bytes: 2 * 1024 * 1024 * 1024,
            auto_evict: true,
        }
    }
}

/// Stereo transcode settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeConfig {
    /// Frame rate used when the source does not report a positive one.
    pub default_frame_rate: f64,
    /// Report progress every N frames.
    pub progress_interval_frames: u64,
    /// ffmpeg encoder used for each eye layer.
    pub video_encoder: String,
    /// Constant rate factor passed to the encoder.
    pub crf: u32,
    /// Encoder preset.
    pub preset: String,
    /// Extension of the multi-view container written to the cache.
    pub container_extension: String,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            default_frame_rate: 30.0,
            progress_interval_frames: 10,
            video_encoder: "libx264".into(),
            crf: 18,
            preset: "medium".into(),
            container_extension: "mkv".into(),
        }
    }
}

/// How the coordinator fetches a source before transcoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStrategy {
    /// One streaming GET of the whole source.
    #[default]
    Full,
    /// Concurrent byte-range chunks assembled in order.
    Chunked,
}

/// Source download settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub strategy: DownloadStrategy,
    /// Connect timeout in seconds for every request.
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl DownloadConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            strategy: DownloadStrategy::Full,
            timeout_secs: 15,
            user_agent: concat!("parallax/", env!("CARGO_PKG_VERSION")).into(),
        }
    }
}

/// Byte-range chunking and buffer window settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkedConfig {
    /// Playback time covered by one chunk.
    pub chunk_duration_secs: f64,
    /// Chunks (including the current one) required before playback is ready.
    pub min_buffer_ahead: usize,
    /// Maximum chunks buffered ahead of the cursor.
    pub max_buffer_ahead: usize,
    /// Maximum concurrent range requests.
    pub max_concurrent: usize,
    /// Wrap the cursor back to chunk 0 after the last chunk.
    pub looping: bool,
    /// Byte rate assumed when the catalog supplies no duration.
    pub assumed_bytes_per_second: u64,
}

impl ChunkedConfig {
    pub fn chunk_duration(&self) -> Duration {
        Duration::from_secs_f64(self.chunk_duration_secs.max(0.001))
    }
}

impl Default for ChunkedConfig {
    fn default() -> Self {
        Self {
            chunk_duration_secs: 10.0,
            min_buffer_ahead: 2,
            max_buffer_ahead: 4,
            max_concurrent: 3,
            looping: false,
            // ~8 Mbit/s, a typical 1080p stereo bitrate.
            assumed_bytes_per_second: 1_000_000,
        }
    }
}

/// Paths to external CLI tools.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub ffmpeg_path: Option<PathBuf>,
    pub ffprobe_path: Option<PathBuf>,
}
