//! Deterministic in-memory codec backend.
//!
//! Sources are small JSON [`SyntheticPattern`] files describing a combined
//! frame whose left (or top) region is one colour and whose right (or
//! bottom) region is another. The writer records every appended layer into a
//! JSON [`SyntheticOutput`] file instead of encoding video, which lets the
//! whole pipeline run without ffmpeg.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use image::{Rgba, RgbaImage};
use px_core::{Error, Result, StereoFormat};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{
    CodecBackend, EyeLayer, FrameReader, MultiViewSpec, MultiViewWriter, SourceInfo, StereoMetadata,
    WriterStatus,
};
use crate::split::source_regions;

const CONTAINER_NAME: &str = "synthetic";

// ---------------------------------------------------------------------------
// Pattern
// ---------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_format() -> StereoFormat {
    StereoFormat::SideBySide
}

/// Descriptor of a synthetic two-tone stereo source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticPattern {
    pub width: u32,
    pub height: u32,
    /// Nominal frame rate; zero means "unknown".
    pub fps: f64,
    pub frames: u64,
    #[serde(default = "default_format")]
    pub format: StereoFormat,
    /// Colour of the geometric left (side-by-side) or top (over-under) region.
    pub left: [u8; 4],
    /// Colour of the other region.
    pub right: [u8; 4],
    #[serde(default = "default_true")]
    pub has_video: bool,
}

impl SyntheticPattern {
    pub const RED: [u8; 4] = [255, 0, 0, 255];
    pub const BLUE: [u8; 4] = [0, 0, 255, 255];

    /// Side-by-side red/blue pattern.
    pub fn new(width: u32, height: u32, fps: f64, frames: u64) -> Self {
        Self {
            width,
            height,
            fps,
            frames,
            format: StereoFormat::SideBySide,
            left: Self::RED,
            right: Self::BLUE,
            has_video: true,
        }
    }

    #[must_use]
    pub fn with_format(mut self, format: StereoFormat) -> Self {
        self.format = format;
        self
    }

    /// A pattern whose file probes as audio-only.
    #[must_use]
    pub fn without_video(mut self) -> Self {
        self.has_video = false;
        self
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Internal(format!("pattern serialization: {e}")))
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    /// Render one combined frame.
    pub fn render(&self) -> Result<RgbaImage> {
        let mut frame = RgbaImage::from_pixel(self.width, self.height, Rgba(self.right));
        let (left, _) = source_regions(self.format, self.width, self.height);
        let row: Vec<u8> = self.left.repeat(left.width as usize);
        let stride = self.width as usize * 4;
        let buf: &mut [u8] = &mut frame;
        for y in left.y..left.y + left.height {
            let start = y as usize * stride + left.x as usize * 4;
            buf.get_mut(start..start + row.len())
                .ok_or_else(|| Error::PixelBufferCreationFailed(format!("pattern row {y}")))?
                .copy_from_slice(&row);
        }
        Ok(frame)
    }

    fn source_info(&self) -> SourceInfo {
        let duration = (self.fps > 0.0).then(|| Duration::from_secs_f64(self.frames as f64 / self.fps));
        SourceInfo {
            container: CONTAINER_NAME.into(),
            has_video: self.has_video,
            width: self.width,
            height: self.height,
            frame_rate: Some(self.fps),
            duration,
            frame_count: Some(self.frames),
        }
    }
}

async fn read_pattern(path: &Path) -> Result<SyntheticPattern> {
    let bytes = tokio::fs::read(path).await?;
    serde_json::from_slice(&bytes).map_err(|e| {
        Error::UnsupportedFormat(format!("{} is not a synthetic pattern: {e}", path.display()))
    })
}

// ---------------------------------------------------------------------------
// Output record
// ---------------------------------------------------------------------------

/// One appended layer frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticAppend {
    pub layer: EyeLayer,
    pub pts_secs: f64,
    pub width: u32,
    pub height: u32,
    /// Colour at the centre of the appended frame.
    pub color: [u8; 4],
}

/// What a synthetic writer produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticOutput {
    pub eye_width: u32,
    pub eye_height: u32,
    pub frame_rate: f64,
    pub metadata: StereoMetadata,
    pub appends: Vec<SyntheticAppend>,
}

impl SyntheticOutput {
    pub fn read(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::Validation(format!("{} is not synthetic output: {e}", path.display())))
    }

    /// Appends for one layer, in write order.
    pub fn layer(&self, layer: EyeLayer) -> impl Iterator<Item = &SyntheticAppend> {
        self.appends.iter().filter(move |a| a.layer == layer)
    }
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

/// Backend over [`SyntheticPattern`] files.
#[derive(Debug, Clone)]
pub struct SyntheticBackend {
    available: bool,
    frame_delay: Option<Duration>,
    finish_failure: Option<String>,
}

impl Default for SyntheticBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticBackend {
    pub fn new() -> Self {
        Self {
            available: true,
            frame_delay: None,
            finish_failure: None,
        }
    }

    /// A backend that reports the multi-view encoder as missing.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            frame_delay: None,
            finish_failure: None,
        }
    }

    /// Sleep this long before decoding each frame.
    #[must_use]
    pub fn with_frame_delay(mut self, delay: Duration) -> Self {
        self.frame_delay = Some(delay);
        self
    }

    /// Writers still write their output but report `reason` from `finish`,
    /// like a muxer that fails on the trailer.
    #[must_use]
    pub fn with_failing_finish(mut self, reason: impl Into<String>) -> Self {
        self.finish_failure = Some(reason.into());
        self
    }
}

#[async_trait]
impl CodecBackend for SyntheticBackend {
    fn name(&self) -> &'static str {
        CONTAINER_NAME
    }

    async fn check_available(&self) -> Result<()> {
        if self.available {
            Ok(())
        } else {
            Err(Error::HardwareUnavailable(
                "synthetic multi-view encoder disabled".into(),
            ))
        }
    }

    async fn probe(&self, path: &Path, cancel: &CancellationToken) -> Result<SourceInfo> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(read_pattern(path).await?.source_info())
    }

    async fn open_reader(&self, path: &Path, cancel: &CancellationToken) -> Result<Box<dyn FrameReader>> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let pattern = read_pattern(path)
            .await
            .map_err(|e| Error::ReaderInitFailed(e.to_string()))?;
        if !pattern.has_video {
            return Err(Error::NoVideoTrack);
        }
        let frame = pattern.render()?;
        Ok(Box::new(SyntheticReader {
            frame,
            remaining: pattern.frames,
            delay: self.frame_delay,
        }))
    }

    async fn open_writer(&self, spec: &MultiViewSpec) -> Result<Box<dyn MultiViewWriter>> {
        // Create the file up front like a real muxer would.
        tokio::fs::write(&spec.output, b"")
            .await
            .map_err(|e| Error::WriterInitFailed(format!("{}: {e}", spec.output.display())))?;
        Ok(Box::new(SyntheticWriter {
            output: spec.output.clone(),
            record: SyntheticOutput {
                eye_width: spec.eye_width,
                eye_height: spec.eye_height,
                frame_rate: spec.frame_rate,
                metadata: spec.metadata,
                appends: Vec::new(),
            },
            last_pts: [None, None],
            finish_failure: self.finish_failure.clone(),
        }))
    }
}

struct SyntheticReader {
    frame: RgbaImage,
    remaining: u64,
    delay: Option<Duration>,
}

#[async_trait]
impl FrameReader for SyntheticReader {
    async fn next_frame(&mut self) -> Result<Option<RgbaImage>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.remaining -= 1;
        Ok(Some(self.frame.clone()))
    }
}

struct SyntheticWriter {
    output: PathBuf,
    record: SyntheticOutput,
    last_pts: [Option<Duration>; 2],
    finish_failure: Option<String>,
}

#[async_trait]
impl MultiViewWriter for SyntheticWriter {
    fn is_ready_for_more(&self) -> bool {
        true
    }

    async fn append(&mut self, layer: EyeLayer, frame: RgbaImage, pts: Duration) -> Result<()> {
        if frame.dimensions() != (self.record.eye_width, self.record.eye_height) {
            return Err(Error::EncodingFailed(format!(
                "{} layer frame is {}x{}, expected {}x{}",
                layer.name(),
                frame.width(),
                frame.height(),
                self.record.eye_width,
                self.record.eye_height
            )));
        }
        let slot = &mut self.last_pts[layer.index()];
        if slot.is_some_and(|last| pts <= last) {
            return Err(Error::EncodingFailed(format!(
                "{} layer timestamp {pts:?} is not increasing",
                layer.name()
            )));
        }
        *slot = Some(pts);

        let center = frame.get_pixel(frame.width() / 2, frame.height() / 2).0;
        self.record.appends.push(SyntheticAppend {
            layer,
            pts_secs: pts.as_secs_f64(),
            width: frame.width(),
            height: frame.height(),
            color: center,
        });
        Ok(())
    }

    async fn finish(self: Box<Self>, cancel: &CancellationToken) -> WriterStatus {
        if cancel.is_cancelled() {
            return WriterStatus::Cancelled;
        }
        let json = match serde_json::to_vec(&self.record) {
            Ok(json) => json,
            Err(e) => return WriterStatus::Failed(e.to_string()),
        };
        if let Err(e) = tokio::fs::write(&self.output, json).await {
            return WriterStatus::Failed(format!("{}: {e}", self.output.display()));
        }
        match self.finish_failure {
            Some(reason) => WriterStatus::Failed(reason),
            None => WriterStatus::Completed,
        }
    }

    async fn abort(self: Box<Self>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn render_paints_left_region() {
        let frame = SyntheticPattern::new(8, 2, 30.0, 1).render().unwrap();
        assert_eq!(frame.get_pixel(0, 0).0, SyntheticPattern::RED);
        assert_eq!(frame.get_pixel(3, 1).0, SyntheticPattern::RED);
        assert_eq!(frame.get_pixel(4, 0).0, SyntheticPattern::BLUE);
    }

    #[test]
    fn render_over_under_paints_top() {
        let frame = SyntheticPattern::new(2, 8, 30.0, 1)
            .with_format(StereoFormat::OverUnder)
            .render()
            .unwrap();
        assert_eq!(frame.get_pixel(1, 3).0, SyntheticPattern::RED);
        assert_eq!(frame.get_pixel(1, 4).0, SyntheticPattern::BLUE);
    }

    #[tokio::test]
    async fn probe_reports_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src.json");
        SyntheticPattern::new(64, 16, 30.0, 300).write_to(&path).unwrap();

        let info = SyntheticBackend::new()
            .probe(&path, &CancellationToken::new())
            .await
            .unwrap();
        assert!(info.has_video);
        assert_eq!((info.width, info.height), (64, 16));
        assert_eq!(info.duration, Some(Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn probe_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("movie.avi");
        std::fs::write(&path, b"RIFF....AVI ").unwrap();
        assert_matches!(
            SyntheticBackend::new().probe(&path, &CancellationToken::new()).await,
            Err(Error::UnsupportedFormat(_))
        );
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_reading() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src.json");
        SyntheticPattern::new(4, 2, 30.0, 3).write_to(&path).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let backend = SyntheticBackend::new();
        assert_matches!(backend.probe(&path, &cancel).await, Err(Error::Cancelled));
        assert_matches!(backend.open_reader(&path, &cancel).await.err(), Some(Error::Cancelled));
    }

    #[tokio::test]
    async fn reader_yields_exact_frame_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src.json");
        SyntheticPattern::new(4, 2, 30.0, 3).write_to(&path).unwrap();

        let mut reader = SyntheticBackend::new()
            .open_reader(&path, &CancellationToken::new())
            .await
            .unwrap();
        let mut n = 0;
        while reader.next_frame().await.unwrap().is_some() {
            n += 1;
        }
        assert_eq!(n, 3);
    }

    #[tokio::test]
    async fn writer_rejects_non_increasing_pts() {
        let dir = tempfile::tempdir().unwrap();
        let spec = MultiViewSpec {
            output: dir.path().join("out.json"),
            eye_width: 2,
            eye_height: 2,
            frame_rate: 30.0,
            metadata: StereoMetadata {
                horizontal_fov: 90,
                disparity_adjustment: 0,
            },
        };
        let mut writer = SyntheticBackend::new().open_writer(&spec).await.unwrap();
        assert!(spec.output.exists());

        let frame = RgbaImage::new(2, 2);
        writer
            .append(EyeLayer::Left, frame.clone(), Duration::ZERO)
            .await
            .unwrap();
        assert_matches!(
            writer.append(EyeLayer::Left, frame, Duration::ZERO).await,
            Err(Error::EncodingFailed(_))
        );
    }

    #[tokio::test]
    async fn failing_finish_still_writes_output() {
        let dir = tempfile::tempdir().unwrap();
        let spec = MultiViewSpec {
            output: dir.path().join("out.json"),
            eye_width: 2,
            eye_height: 2,
            frame_rate: 30.0,
            metadata: StereoMetadata {
                horizontal_fov: 90,
                disparity_adjustment: 0,
            },
        };
        let writer = SyntheticBackend::new()
            .with_failing_finish("trailer write failed")
            .open_writer(&spec)
            .await
            .unwrap();

        let status = writer.finish(&CancellationToken::new()).await;
        assert_eq!(status, WriterStatus::Failed("trailer write failed".into()));
        assert!(SyntheticOutput::read(&spec.output).is_ok());
    }

    #[tokio::test]
    async fn unavailable_backend() {
        assert_matches!(
            SyntheticBackend::unavailable().check_available().await,
            Err(Error::HardwareUnavailable(_))
        );
    }
}
