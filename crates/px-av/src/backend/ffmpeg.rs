//! ffmpeg CLI codec backend.
//!
//! - probing: `ffprobe -print_format json -show_format -show_streams`
//! - decoding: `ffmpeg -i <src> -f rawvideo -pix_fmt rgba pipe:1`
//! - encoding: one ffmpeg process per eye reading raw RGBA from stdin, then a
//!   stream-copy mux of both into a Matroska file with two video streams
//!   tagged `eye=left|right` / `view_id=0|1` and the stereo hints stored as
//!   container tags.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use image::RgbaImage;
use px_core::config::TranscodeConfig;
use px_core::{Error, Result};
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{CodecBackend, EyeLayer, FrameReader, MultiViewSpec, MultiViewWriter, SourceInfo, WriterStatus};
use crate::command::{Pipe, ToolCommand};
use crate::tools::ToolRegistry;
use crate::workspace::Workspace;

/// Muxing is a stream copy; an hour covers any realistic source.
const MUX_TIMEOUT: Duration = Duration::from_secs(3600);

/// Backend that shells out to ffmpeg and ffprobe.
#[derive(Debug, Clone)]
pub struct FfmpegBackend {
    tools: ToolRegistry,
    config: TranscodeConfig,
}

impl FfmpegBackend {
    pub fn new(tools: ToolRegistry, config: TranscodeConfig) -> Self {
        Self { tools, config }
    }
}

#[async_trait]
impl CodecBackend for FfmpegBackend {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    async fn check_available(&self) -> Result<()> {
        for tool in ["ffmpeg", "ffprobe"] {
            if !self.tools.has(tool) {
                return Err(Error::HardwareUnavailable(format!("{tool} is not installed")));
            }
        }
        let encoder = &self.config.video_encoder;
        if !self.tools.has_encoder(encoder).await? {
            return Err(Error::HardwareUnavailable(format!(
                "ffmpeg was built without the {encoder} encoder"
            )));
        }
        Ok(())
    }

    async fn probe(&self, path: &Path, cancel: &CancellationToken) -> Result<SourceInfo> {
        let ffprobe = self.tools.require("ffprobe")?;
        let output = ToolCommand::new(ffprobe.to_path_buf())
            .args(["-v", "error", "-print_format", "json", "-show_format", "-show_streams"])
            .arg(path.to_string_lossy())
            .execute_cancellable(cancel)
            .await
            .map_err(|e| match e {
                Error::Tool { message, .. } => Error::UnsupportedFormat(message),
                other => other,
            })?;

        let parsed: FfprobeOutput = serde_json::from_str(&output.stdout)
            .map_err(|e| Error::UnsupportedFormat(format!("ffprobe JSON parse error: {e}")))?;
        Ok(source_info_from_ffprobe(parsed))
    }

    async fn open_reader(&self, path: &Path, cancel: &CancellationToken) -> Result<Box<dyn FrameReader>> {
        let info = self.probe(path, cancel).await.map_err(|e| match e {
            Error::Cancelled => Error::Cancelled,
            other => Error::ReaderInitFailed(other.to_string()),
        })?;
        if !info.has_video {
            return Err(Error::NoVideoTrack);
        }
        if info.width == 0 || info.height == 0 {
            return Err(Error::ReaderInitFailed(format!(
                "video track reports {}x{}",
                info.width, info.height
            )));
        }

        let ffmpeg = self.tools.require("ffmpeg")?;
        let mut child = ToolCommand::new(ffmpeg.to_path_buf())
            .args(["-nostdin", "-v", "error", "-i"])
            .arg(path.to_string_lossy())
            .args(["-map", "0:v:0", "-an", "-sn", "-f", "rawvideo", "-pix_fmt", "rgba", "pipe:1"])
            .spawn(Pipe::Stdout)
            .map_err(|e| Error::ReaderInitFailed(e.to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::ReaderInitFailed("ffmpeg stdout was not piped".into()))?;
        let stderr = drain_stderr(&mut child);

        Ok(Box::new(FfmpegReader {
            child,
            stdout,
            stderr: Some(stderr),
            width: info.width,
            height: info.height,
        }))
    }

    async fn open_writer(&self, spec: &MultiViewSpec) -> Result<Box<dyn MultiViewWriter>> {
        let ffmpeg = self
            .tools
            .require("ffmpeg")
            .map_err(|e| Error::WriterInitFailed(e.to_string()))?
            .to_path_buf();
        let scratch_parent = spec.output.parent().unwrap_or_else(|| Path::new("."));
        let workspace = Workspace::new_in(scratch_parent, "layers")
            .map_err(|e| Error::WriterInitFailed(e.to_string()))?;

        let left = EyeEncoder::spawn(&ffmpeg, &self.config, spec, workspace.temp_file("left.mkv"))?;
        let right = EyeEncoder::spawn(&ffmpeg, &self.config, spec, workspace.temp_file("right.mkv"))?;

        Ok(Box::new(FfmpegWriter {
            ffmpeg,
            spec: spec.clone(),
            encoders: [left, right],
            failure: None,
            _workspace: workspace,
        }))
    }
}

/// Collect a child's stderr in the background so it never fills its pipe.
fn drain_stderr(child: &mut Child) -> JoinHandle<String> {
    let stderr = child.stderr.take();
    tokio::spawn(async move {
        let mut text = String::new();
        if let Some(mut stderr) = stderr {
            let _ = stderr.read_to_string(&mut text).await;
        }
        text
    })
}

async fn stderr_text(handle: Option<JoinHandle<String>>) -> String {
    match handle {
        Some(h) => h.await.unwrap_or_default().trim().to_string(),
        None => String::new(),
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

struct FfmpegReader {
    child: Child,
    stdout: ChildStdout,
    stderr: Option<JoinHandle<String>>,
    width: u32,
    height: u32,
}

/// Fill `buf` from `src`, returning how many bytes were read before EOF.
async fn read_full<R: AsyncRead + Unpin>(src: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = src.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[async_trait]
impl FrameReader for FfmpegReader {
    async fn next_frame(&mut self) -> Result<Option<RgbaImage>> {
        let frame_len = self.width as usize * self.height as usize * 4;
        let mut buf = vec![0u8; frame_len];
        let filled = read_full(&mut self.stdout, &mut buf).await?;

        if filled == 0 {
            let status = self.child.wait().await?;
            if !status.success() {
                let stderr = stderr_text(self.stderr.take()).await;
                return Err(Error::tool("ffmpeg", format!("decoder exited with {status}: {stderr}")));
            }
            return Ok(None);
        }
        if filled < frame_len {
            return Err(Error::tool(
                "ffmpeg",
                format!("truncated frame: {filled} of {frame_len} bytes"),
            ));
        }

        RgbaImage::from_raw(self.width, self.height, buf)
            .map(Some)
            .ok_or_else(|| Error::PixelBufferCreationFailed(format!("{}x{} frame", self.width, self.height)))
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

struct EyeEncoder {
    child: Child,
    stdin: Option<ChildStdin>,
    stderr: Option<JoinHandle<String>>,
    path: PathBuf,
}

impl EyeEncoder {
    fn spawn(ffmpeg: &Path, config: &TranscodeConfig, spec: &MultiViewSpec, path: PathBuf) -> Result<Self> {
        let mut cmd = ToolCommand::new(ffmpeg.to_path_buf());
        cmd.args(["-y", "-v", "error", "-f", "rawvideo", "-pix_fmt", "rgba"]);
        cmd.args(["-s", &format!("{}x{}", spec.eye_width, spec.eye_height)]);
        cmd.args(["-framerate", &format!("{}", spec.frame_rate)]);
        cmd.args(["-i", "pipe:0", "-an"]);
        cmd.args(["-c:v", &config.video_encoder]);
        cmd.args(["-crf", &config.crf.to_string(), "-preset", &config.preset]);
        // yuv420p needs even dimensions.
        cmd.args(["-vf", "pad=ceil(iw/2)*2:ceil(ih/2)*2", "-pix_fmt", "yuv420p"]);
        cmd.args(["-f", "matroska"]);
        cmd.arg(path.to_string_lossy());

        let mut child = cmd
            .spawn(Pipe::Stdin)
            .map_err(|e| Error::WriterInitFailed(e.to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::WriterInitFailed("ffmpeg stdin was not piped".into()))?;
        let stderr = drain_stderr(&mut child);

        Ok(Self {
            child,
            stdin: Some(stdin),
            stderr: Some(stderr),
            path,
        })
    }

    async fn close(&mut self) -> std::result::Result<(), String> {
        drop(self.stdin.take());
        let status = self.child.wait().await.map_err(|e| e.to_string())?;
        if status.success() {
            Ok(())
        } else {
            Err(format!("encoder exited with {status}: {}", stderr_text(self.stderr.take()).await))
        }
    }
}

struct FfmpegWriter {
    ffmpeg: PathBuf,
    spec: MultiViewSpec,
    encoders: [EyeEncoder; 2],
    failure: Option<String>,
    // Holds the per-eye intermediates until the writer is dropped.
    _workspace: Workspace,
}

impl FfmpegWriter {
    fn mux_command(&self) -> ToolCommand {
        let meta = self.spec.metadata;
        let mut cmd = ToolCommand::new(self.ffmpeg.clone());
        cmd.timeout(MUX_TIMEOUT);
        cmd.args(["-y", "-v", "error"]);
        for encoder in &self.encoders {
            cmd.arg("-i").arg(encoder.path.to_string_lossy());
        }
        cmd.args(["-map", "0:v:0", "-map", "1:v:0", "-c", "copy"]);
        cmd.args(["-metadata", &format!("horizontal_field_of_view={}", meta.horizontal_fov)]);
        cmd.args([
            "-metadata",
            &format!("horizontal_disparity_adjustment={}", meta.disparity_adjustment),
        ]);
        for layer in [EyeLayer::Left, EyeLayer::Right] {
            let stream = format!("-metadata:s:v:{}", layer.index());
            cmd.args([stream.as_str(), &format!("eye={}", layer.name())]);
            cmd.args([stream.as_str(), &format!("view_id={}", layer.index())]);
        }
        cmd.args(["-disposition:v:0", "default", "-disposition:v:1", "0"]);
        cmd.args(["-f", "matroska"]);
        cmd.arg(self.spec.output.to_string_lossy());
        cmd
    }
}

#[async_trait]
impl MultiViewWriter for FfmpegWriter {
    fn is_ready_for_more(&self) -> bool {
        self.failure.is_none() && self.encoders.iter().all(|e| e.stdin.is_some())
    }

    async fn append(&mut self, layer: EyeLayer, frame: RgbaImage, _pts: Duration) -> Result<()> {
        if frame.dimensions() != (self.spec.eye_width, self.spec.eye_height) {
            return Err(Error::EncodingFailed(format!(
                "{} layer frame is {}x{}, expected {}x{}",
                layer.name(),
                frame.width(),
                frame.height(),
                self.spec.eye_width,
                self.spec.eye_height
            )));
        }

        let encoder = &mut self.encoders[layer.index()];
        let Some(stdin) = encoder.stdin.as_mut() else {
            return Err(Error::EncodingFailed(format!("{} encoder is closed", layer.name())));
        };
        // Frames are fed at a constant rate, so pts is implied by order.
        if let Err(e) = stdin.write_all(frame.as_raw()).await {
            let message = format!("failed to write {} frame to ffmpeg: {e}", layer.name());
            self.failure = Some(message.clone());
            return Err(Error::EncodingFailed(message));
        }
        Ok(())
    }

    async fn finish(mut self: Box<Self>, cancel: &CancellationToken) -> WriterStatus {
        if let Some(message) = self.failure.take() {
            return WriterStatus::Failed(message);
        }
        for layer in [EyeLayer::Left, EyeLayer::Right] {
            // Dropping the encoder on cancel kills it (kill_on_drop).
            let closed = tokio::select! {
                _ = cancel.cancelled() => None,
                r = self.encoders[layer.index()].close() => Some(r),
            };
            match closed {
                None => return WriterStatus::Cancelled,
                Some(Err(message)) => return WriterStatus::Failed(format!("{} layer: {message}", layer.name())),
                Some(Ok(())) => {}
            }
        }

        match self.mux_command().execute_cancellable(cancel).await {
            Ok(_) => WriterStatus::Completed,
            Err(Error::Cancelled) => WriterStatus::Cancelled,
            Err(e) => WriterStatus::Failed(format!("mux failed: {e}")),
        }
    }

    async fn abort(mut self: Box<Self>) {
        for encoder in &mut self.encoders {
            drop(encoder.stdin.take());
            let _ = encoder.child.start_kill();
            let _ = encoder.child.wait().await;
        }
    }
}

// ---------------------------------------------------------------------------
// ffprobe JSON
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: Option<FfprobeFormat>,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    format_name: Option<String>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
    nb_frames: Option<String>,
    duration: Option<String>,
}

fn source_info_from_ffprobe(output: FfprobeOutput) -> SourceInfo {
    let container = output
        .format
        .as_ref()
        .and_then(|f| f.format_name.clone())
        .unwrap_or_default();
    let format_duration = output.format.as_ref().and_then(|f| f.duration.as_deref()).and_then(parse_secs);

    let video = output
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"));

    match video {
        Some(v) => SourceInfo {
            container,
            has_video: true,
            width: v.width.unwrap_or(0),
            height: v.height.unwrap_or(0),
            frame_rate: v
                .avg_frame_rate
                .as_deref()
                .and_then(parse_frame_rate)
                .or_else(|| v.r_frame_rate.as_deref().and_then(parse_frame_rate)),
            duration: v.duration.as_deref().and_then(parse_secs).or(format_duration),
            frame_count: v.nb_frames.as_deref().and_then(|n| n.parse().ok()),
        },
        None => SourceInfo {
            container,
            has_video: false,
            width: 0,
            height: 0,
            frame_rate: None,
            duration: format_duration,
            frame_count: None,
        },
    }
}

fn parse_secs(s: &str) -> Option<Duration> {
    s.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
        .map(Duration::from_secs_f64)
}

/// Parse ffprobe's `num/den` rate notation. `0/0` yields `None`.
fn parse_frame_rate(rate_str: &str) -> Option<f64> {
    let rate = match rate_str.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.parse().ok()?;
            let den: f64 = den.parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => rate_str.parse().ok()?,
    };
    (rate.is_finite() && rate > 0.0).then_some(rate)
}
