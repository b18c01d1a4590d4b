//! # px-av
//!
//! Stereo frame handling and multi-view transcoding for parallax.
//!
//! This crate provides:
//!
//! - **Format detection** ([`detect`]) -- classify a stereo layout from
//!   catalog tags and compute per-eye dimensions.
//! - **Frame splitting** ([`split`]) -- extract and resample the two eye
//!   regions of a combined frame.
//! - **Transcoding** ([`Transcoder`]) -- drive a whole source through the
//!   splitter into a two-layer multi-view output, with progress and
//!   cooperative cancellation.
//! - **Codec backends** ([`backend`]) -- the [`CodecBackend`] seam plus an
//!   ffmpeg CLI implementation and a deterministic synthetic one.
//! - **Tool discovery** ([`ToolRegistry`]) and **command execution**
//!   ([`ToolCommand`]) for the external ffmpeg/ffprobe binaries.
//! - **Workspace management** ([`Workspace`]) -- per-session scratch
//!   directories that clean up after themselves.

pub mod backend;
pub mod command;
pub mod detect;
pub mod split;
pub mod tools;
pub mod transcode;
pub mod workspace;

// ---- Re-exports for convenience ----

pub use backend::{
    CodecBackend, EyeLayer, FfmpegBackend, FrameReader, MultiViewSpec, MultiViewWriter,
    SourceInfo, StereoMetadata, SyntheticAppend, SyntheticBackend, SyntheticOutput, SyntheticPattern,
    WriterStatus,
};
pub use command::{Pipe, ToolCommand, ToolOutput};
pub use detect::{detect, per_eye_dimensions, Detection};
pub use split::split_frame;
pub use tools::{ToolConfig, ToolInfo, ToolRegistry};
pub use transcode::Transcoder;
pub use workspace::Workspace;
