//! Codec backend seam.
//!
//! The [`Transcoder`](crate::Transcoder) never touches a container format
//! directly. It asks a [`CodecBackend`] to probe the source, open a
//! sequential [`FrameReader`], and open a two-layer [`MultiViewWriter`].
//! Whatever the backend, the output contract is the same: two view streams,
//! tagged by eye, sharing presentation timestamps.

mod ffmpeg;
mod synthetic;

pub use ffmpeg::FfmpegBackend;
pub use synthetic::{SyntheticAppend, SyntheticBackend, SyntheticOutput, SyntheticPattern};

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use image::RgbaImage;
use px_core::{ConversionSettings, Result};
use tokio_util::sync::CancellationToken;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Source description
// ---------------------------------------------------------------------------

/// What a backend learned about a source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceInfo {
    /// Container/demuxer name as reported by the backend.
    pub container: String,
    /// Whether the file has at least one video track.
    pub has_video: bool,
    pub width: u32,
    pub height: u32,
    /// Nominal frame rate; `None` or non-positive when unknown.
    pub frame_rate: Option<f64>,
    pub duration: Option<Duration>,
    /// Exact frame count when the container records one.
    pub frame_count: Option<u64>,
}

impl SourceInfo {
    /// Best estimate of the number of frames at `fps`, at least 1.
    pub fn estimated_frames(&self, fps: f64) -> u64 {
        let from_duration = self
            .duration
            .map(|d| (d.as_secs_f64() * fps).round() as u64);
        self.frame_count.or(from_duration).unwrap_or(0).max(1)
    }
}

// ---------------------------------------------------------------------------
// Writer configuration
// ---------------------------------------------------------------------------

/// Container-level stereo hints, in whole container units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StereoMetadata {
    /// Horizontal field of view in degrees.
    pub horizontal_fov: i32,
    /// Horizontal disparity adjustment.
    pub disparity_adjustment: i32,
}

impl From<&ConversionSettings> for StereoMetadata {
    fn from(settings: &ConversionSettings) -> Self {
        Self {
            horizontal_fov: settings.horizontal_fov_degrees().round() as i32,
            disparity_adjustment: settings.horizontal_disparity_adjustment().round() as i32,
        }
    }
}

/// Everything a backend needs to open a multi-view writer.
#[derive(Debug, Clone)]
pub struct MultiViewSpec {
    pub output: PathBuf,
    pub eye_width: u32,
    pub eye_height: u32,
    pub frame_rate: f64,
    pub metadata: StereoMetadata,
}

/// One of the two view layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EyeLayer {
    /// Layer 0, the base view.
    Left,
    /// Layer 1, the enhancement view.
    Right,
}

impl EyeLayer {
    pub fn index(self) -> usize {
        match self {
            EyeLayer::Left => 0,
            EyeLayer::Right => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EyeLayer::Left => "left",
            EyeLayer::Right => "right",
        }
    }
}

/// Terminal state of a writer after [`MultiViewWriter::finish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriterStatus {
    Completed,
    Failed(String),
    /// The session was cancelled while the output was being finalized.
    Cancelled,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Sequential decoder for a combined-eye source.
#[async_trait]
pub trait FrameReader: Send {
    /// Next decoded frame, or `None` at the end of the stream.
    async fn next_frame(&mut self) -> Result<Option<RgbaImage>>;
}

/// Writer for a two-layer stereo output.
#[async_trait]
pub trait MultiViewWriter: Send {
    /// Whether the writer can accept another frame pair.
    fn is_ready_for_more(&self) -> bool;

    /// Append one eye frame at `pts`.
    async fn append(&mut self, layer: EyeLayer, frame: RgbaImage, pts: Duration) -> Result<()>;

    /// Flush and close the output, giving up early when `cancel` fires.
    async fn finish(self: Box<Self>, cancel: &CancellationToken) -> WriterStatus;

    /// Stop immediately and release resources. The caller deletes the output.
    async fn abort(self: Box<Self>);
}

/// A codec stack able to read combined sources and write multi-view output.
#[async_trait]
pub trait CodecBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fails with [`px_core::Error::HardwareUnavailable`] when this runtime
    /// cannot produce multi-view output.
    async fn check_available(&self) -> Result<()>;

    /// Inspect a local file. Fails with [`px_core::Error::UnsupportedFormat`]
    /// when the container cannot be demuxed and with
    /// [`px_core::Error::Cancelled`] when `cancel` fires first.
    async fn probe(&self, path: &Path, cancel: &CancellationToken) -> Result<SourceInfo>;

    async fn open_reader(&self, path: &Path, cancel: &CancellationToken) -> Result<Box<dyn FrameReader>>;

    async fn open_writer(&self, spec: &MultiViewSpec) -> Result<Box<dyn MultiViewWriter>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use px_core::StereoFormat;

    #[test]
    fn stereo_metadata_rounds_to_whole_units() {
        let settings = ConversionSettings::new(StereoFormat::SideBySide, false, 89.6, -12.4).unwrap();
        let meta = StereoMetadata::from(&settings);
        assert_eq!(meta.horizontal_fov, 90);
        assert_eq!(meta.disparity_adjustment, -12);
    }

    #[test]
    fn estimated_frames_prefers_exact_count() {
        let mut info = SourceInfo {
            container: "matroska".into(),
            has_video: true,
            width: 3840,
            height: 1080,
            frame_rate: Some(30.0),
            duration: Some(Duration::from_secs(10)),
            frame_count: Some(299),
        };
        assert_eq!(info.estimated_frames(30.0), 299);
        info.frame_count = None;
        assert_eq!(info.estimated_frames(30.0), 300);
        info.duration = None;
        assert_eq!(info.estimated_frames(30.0), 1);
    }

    #[test]
    fn layer_indices() {
        assert_eq!(EyeLayer::Left.index(), 0);
        assert_eq!(EyeLayer::Right.index(), 1);
    }
}
