//! Stereo transcoding: combined source in, two-layer multi-view file out.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use px_core::config::TranscodeConfig;
use px_core::{ConversionSettings, Error, Result};
use tokio_util::sync::CancellationToken;

use crate::backend::{CodecBackend, EyeLayer, FrameReader, MultiViewSpec, MultiViewWriter, StereoMetadata, WriterStatus};
use crate::detect::per_eye_dimensions;
use crate::split::split_frame;

/// Drives a source through the frame splitter into a multi-view writer.
#[derive(Clone)]
pub struct Transcoder {
    backend: Arc<dyn CodecBackend>,
    config: TranscodeConfig,
}

impl std::fmt::Debug for Transcoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transcoder")
            .field("backend", &self.backend.name())
            .field("config", &self.config)
            .finish()
    }
}

/// Non-decreasing progress reporting for one convert call.
struct Progress<F> {
    callback: F,
    total_frames: u64,
    last: f64,
}

impl<F: Fn(f64)> Progress<F> {
    fn report(&mut self, value: f64) {
        let value = value.clamp(0.0, 1.0).max(self.last);
        self.last = value;
        (self.callback)(value);
    }

    fn frames_written(&mut self, frames: u64) {
        self.report(frames as f64 / self.total_frames as f64);
    }
}

impl Transcoder {
    pub fn new(backend: Arc<dyn CodecBackend>, config: TranscodeConfig) -> Self {
        Self { backend, config }
    }

    pub fn backend(&self) -> &Arc<dyn CodecBackend> {
        &self.backend
    }

    /// Convert `source` into a two-layer stereo file at `output`.
    ///
    /// Layer 0 carries the left eye and layer 1 the right eye; with
    /// `eyes_reversed` the geometric regions are swapped before tagging.
    /// Progress is reported every `progress_interval_frames` frames and
    /// once more with `1.0` on success.
    ///
    /// `cancel` is checked between frames. On cancellation or any failure
    /// the partial output is deleted before this returns, and cancellation
    /// surfaces as [`Error::Cancelled`].
    pub async fn convert<F>(
        &self,
        source: &Path,
        settings: &ConversionSettings,
        output: &Path,
        on_progress: F,
        cancel: &CancellationToken,
    ) -> Result<PathBuf>
    where
        F: Fn(f64) + Send + Sync,
    {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        self.backend.check_available().await?;

        let info = self.backend.probe(source, cancel).await?;
        if !info.has_video {
            return Err(Error::NoVideoTrack);
        }

        let frame_rate = info
            .frame_rate
            .filter(|r| r.is_finite() && *r > 0.0)
            .unwrap_or(self.config.default_frame_rate);
        if !(frame_rate.is_finite() && frame_rate > 0.0) {
            return Err(Error::ReaderInitFailed(format!(
                "source has no usable frame rate and the configured default is {}",
                self.config.default_frame_rate
            )));
        }
        let (eye_width, eye_height) = per_eye_dimensions(settings.format(), info.width, info.height);
        let total_frames = info.estimated_frames(frame_rate);

        let spec = MultiViewSpec {
            output: output.to_path_buf(),
            eye_width,
            eye_height,
            frame_rate,
            metadata: StereoMetadata::from(settings),
        };

        let mut reader = self.backend.open_reader(source, cancel).await?;
        let mut writer = self.backend.open_writer(&spec).await?;

        tracing::info!(
            backend = self.backend.name(),
            source = %source.display(),
            output = %output.display(),
            format = %settings.format(),
            eyes_reversed = settings.eyes_reversed(),
            eye_width,
            eye_height,
            frame_rate,
            total_frames,
            "Starting stereo transcode"
        );

        let mut progress = Progress {
            callback: on_progress,
            total_frames,
            last: 0.0,
        };

        let pumped = self
            .pump(&mut *reader, &mut writer, settings, &spec, &mut progress, cancel)
            .await;

        let frames = match pumped {
            Ok(frames) => frames,
            Err(e) => {
                writer.abort().await;
                remove_partial(output).await;
                if e.is_cancelled() {
                    tracing::info!(output = %output.display(), "Transcode cancelled; partial output removed");
                } else {
                    tracing::warn!(output = %output.display(), "Transcode failed: {e}");
                }
                return Err(e);
            }
        };

        if frames == 0 {
            writer.abort().await;
            remove_partial(output).await;
            return Err(Error::EncodingFailed("source produced no frames".into()));
        }

        match writer.finish(cancel).await {
            WriterStatus::Completed => {}
            WriterStatus::Failed(reason) => {
                remove_partial(output).await;
                tracing::warn!(output = %output.display(), "Finalizing output failed: {reason}");
                return Err(Error::EncodingFailed(reason));
            }
            WriterStatus::Cancelled => {
                remove_partial(output).await;
                tracing::info!(output = %output.display(), "Transcode cancelled while finalizing");
                return Err(Error::Cancelled);
            }
        }

        progress.report(1.0);
        tracing::info!(frames, output = %output.display(), "Stereo transcode complete");
        Ok(output.to_path_buf())
    }

    /// Read, split, and append frames until the source or writer is done.
    async fn pump<F: Fn(f64)>(
        &self,
        reader: &mut dyn FrameReader,
        writer: &mut Box<dyn MultiViewWriter>,
        settings: &ConversionSettings,
        spec: &MultiViewSpec,
        progress: &mut Progress<F>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let interval = self.config.progress_interval_frames;
        let format = settings.format();
        let (eye_width, eye_height) = (spec.eye_width, spec.eye_height);
        let mut frames: u64 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if !writer.is_ready_for_more() {
                tracing::warn!(frames, "Writer stopped accepting frames");
                break;
            }

            let Some(frame) = reader.next_frame().await? else {
                break;
            };

            let (left, right) =
                tokio::task::spawn_blocking(move || split_frame(&frame, format, eye_width, eye_height))
                    .await
                    .map_err(|e| Error::FrameSplitFailed(format!("split task failed: {e}")))??;

            let (left_layer, right_layer) = if settings.eyes_reversed() {
                (right, left)
            } else {
                (left, right)
            };

            let pts = Duration::from_secs_f64(frames as f64 / spec.frame_rate);
            writer.append(EyeLayer::Left, left_layer, pts).await?;
            writer.append(EyeLayer::Right, right_layer, pts).await?;
            frames += 1;

            if interval > 0 && frames % interval == 0 {
                progress.frames_written(frames);
                tracing::debug!(frames, total = progress.total_frames, "Transcode progress");
            }
        }

        Ok(frames)
    }
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to remove partial output {}: {e}", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{SyntheticBackend, SyntheticOutput, SyntheticPattern};
    use assert_matches::assert_matches;
    use px_core::StereoFormat;
    use std::sync::Mutex;

    fn settings(reversed: bool) -> ConversionSettings {
        ConversionSettings::new(StereoFormat::SideBySide, reversed, 90.0, 200.0).unwrap()
    }

    fn transcoder(backend: SyntheticBackend) -> Transcoder {
        Transcoder::new(Arc::new(backend), TranscodeConfig::default())
    }

    fn write_pattern(dir: &Path, pattern: &SyntheticPattern) -> PathBuf {
        let path = dir.join("source.json");
        pattern.write_to(&path).unwrap();
        path
    }

    #[tokio::test]
    async fn converts_every_frame_into_tagged_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_pattern(dir.path(), &SyntheticPattern::new(64, 16, 30.0, 25));
        let output = dir.path().join("out.mkv");
        let seen = Mutex::new(Vec::new());

        let result = transcoder(SyntheticBackend::new())
            .convert(&source, &settings(false), &output, |p| seen.lock().unwrap().push(p), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result, output);

        let out = SyntheticOutput::read(&output).unwrap();
        assert_eq!((out.eye_width, out.eye_height), (32, 16));
        assert_eq!(out.metadata.horizontal_fov, 90);
        assert_eq!(out.metadata.disparity_adjustment, 200);
        assert_eq!(out.appends.len(), 50);

        let left: Vec<_> = out.layer(EyeLayer::Left).collect();
        let right: Vec<_> = out.layer(EyeLayer::Right).collect();
        assert_eq!(left.len(), 25);
        for (l, r) in left.iter().zip(&right) {
            assert_eq!(l.pts_secs, r.pts_secs);
            assert_eq!(l.color, SyntheticPattern::RED);
            assert_eq!(r.color, SyntheticPattern::BLUE);
        }
        assert!((left[1].pts_secs - 1.0 / 30.0).abs() < 1e-9);

        assert_eq!(*seen.lock().unwrap(), vec![0.4, 0.8, 1.0]);
    }

    #[tokio::test]
    async fn eyes_reversed_swaps_layers() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_pattern(dir.path(), &SyntheticPattern::new(16, 8, 30.0, 3));
        let output = dir.path().join("out.mkv");

        transcoder(SyntheticBackend::new())
            .convert(&source, &settings(true), &output, |_| {}, &CancellationToken::new())
            .await
            .unwrap();

        let out = SyntheticOutput::read(&output).unwrap();
        assert!(out.layer(EyeLayer::Left).all(|a| a.color == SyntheticPattern::BLUE));
        assert!(out.layer(EyeLayer::Right).all(|a| a.color == SyntheticPattern::RED));
    }

    #[tokio::test]
    async fn zero_frame_rate_uses_default() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_pattern(dir.path(), &SyntheticPattern::new(16, 8, 0.0, 2));
        let output = dir.path().join("out.mkv");

        transcoder(SyntheticBackend::new())
            .convert(&source, &settings(false), &output, |_| {}, &CancellationToken::new())
            .await
            .unwrap();

        let out = SyntheticOutput::read(&output).unwrap();
        assert_eq!(out.frame_rate, 30.0);
    }

    #[tokio::test]
    async fn unusable_frame_rate_is_a_reader_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_pattern(dir.path(), &SyntheticPattern::new(16, 8, 0.0, 2));
        let output = dir.path().join("out.mkv");

        for default_frame_rate in [0.0, -24.0, f64::NAN, f64::INFINITY] {
            let config = TranscodeConfig {
                default_frame_rate,
                ..TranscodeConfig::default()
            };
            let result = Transcoder::new(Arc::new(SyntheticBackend::new()), config)
                .convert(&source, &settings(false), &output, |_| {}, &CancellationToken::new())
                .await;
            assert_matches!(result, Err(Error::ReaderInitFailed(_)), "default {default_frame_rate}");
            assert!(!output.exists());
        }
    }

    #[tokio::test]
    async fn empty_source_is_an_encoding_failure() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_pattern(dir.path(), &SyntheticPattern::new(16, 8, 30.0, 0));
        let output = dir.path().join("out.mkv");

        let result = transcoder(SyntheticBackend::new())
            .convert(&source, &settings(false), &output, |_| {}, &CancellationToken::new())
            .await;
        assert_matches!(result, Err(Error::EncodingFailed(ref reason)) if reason.contains("no frames"));
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn failed_finish_removes_output() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_pattern(dir.path(), &SyntheticPattern::new(16, 8, 30.0, 3));
        let output = dir.path().join("out.mkv");
        let seen = Mutex::new(Vec::new());

        let backend = SyntheticBackend::new().with_failing_finish("mux trailer rejected");
        let result = transcoder(backend)
            .convert(&source, &settings(false), &output, |p| seen.lock().unwrap().push(p), &CancellationToken::new())
            .await;
        assert_matches!(result, Err(Error::EncodingFailed(ref reason)) if reason == "mux trailer rejected");
        assert!(!output.exists());
        assert!(!seen.lock().unwrap().contains(&1.0));
    }

    #[tokio::test]
    async fn over_under_halves_height() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = SyntheticPattern::new(16, 32, 24.0, 1).with_format(StereoFormat::OverUnder);
        let source = write_pattern(dir.path(), &pattern);
        let output = dir.path().join("out.mkv");
        let ou = ConversionSettings::new(StereoFormat::OverUnder, false, 90.0, 0.0).unwrap();

        transcoder(SyntheticBackend::new())
            .convert(&source, &ou, &output, |_| {}, &CancellationToken::new())
            .await
            .unwrap();

        let out = SyntheticOutput::read(&output).unwrap();
        assert_eq!((out.eye_width, out.eye_height), (16, 16));
        assert_eq!(out.appends[0].color, SyntheticPattern::RED);
    }

    #[tokio::test]
    async fn missing_video_track() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_pattern(dir.path(), &SyntheticPattern::new(16, 8, 30.0, 3).without_video());
        let output = dir.path().join("out.mkv");

        let result = transcoder(SyntheticBackend::new())
            .convert(&source, &settings(false), &output, |_| {}, &CancellationToken::new())
            .await;
        assert_matches!(result, Err(Error::NoVideoTrack));
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn undemuxable_source() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("clip.avi");
        std::fs::write(&source, b"RIFF").unwrap();

        let result = transcoder(SyntheticBackend::new())
            .convert(&source, &settings(false), &dir.path().join("o.mkv"), |_| {}, &CancellationToken::new())
            .await;
        assert_matches!(result, Err(Error::UnsupportedFormat(_)));
    }

    #[tokio::test]
    async fn unavailable_encoder() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_pattern(dir.path(), &SyntheticPattern::new(16, 8, 30.0, 3));

        let result = transcoder(SyntheticBackend::unavailable())
            .convert(&source, &settings(false), &dir.path().join("o.mkv"), |_| {}, &CancellationToken::new())
            .await;
        assert_matches!(result, Err(Error::HardwareUnavailable(_)));
    }

    #[tokio::test]
    async fn cancellation_removes_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_pattern(dir.path(), &SyntheticPattern::new(16, 8, 30.0, 10_000));
        let output = dir.path().join("out.mkv");
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let backend = SyntheticBackend::new().with_frame_delay(Duration::from_millis(2));
        let result = transcoder(backend)
            .convert(&source, &settings(false), &output, |_| {}, &cancel)
            .await;
        assert_matches!(result, Err(Error::Cancelled));
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn already_cancelled_does_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_pattern(dir.path(), &SyntheticPattern::new(16, 8, 30.0, 3));
        let output = dir.path().join("out.mkv");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = transcoder(SyntheticBackend::new())
            .convert(&source, &settings(false), &output, |_| {}, &cancel)
            .await;
        assert_matches!(result, Err(Error::Cancelled));
        assert!(!output.exists());
    }
}
