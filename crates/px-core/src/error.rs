//! Unified error type for the parallax pipeline.
//!
//! Every stage (download, validation, transcode, cache) funnels its failures
//! into [`Error`]. The playback coordinator is the only component that turns
//! these into user-facing state; it uses [`Error::kind`] to tell transient
//! network trouble apart from terminal format/resource failures and from
//! cancellation, which is never reported.

/// Unified error type covering all failure modes in parallax.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The source opened but contains no video track.
    #[error("source has no video track")]
    NoVideoTrack,

    /// A pixel buffer could not be allocated or wrapped.
    #[error("failed to create pixel buffer: {0}")]
    PixelBufferCreationFailed(String),

    /// Splitting a combined frame into eye regions failed.
    #[error("frame split failed: {0}")]
    FrameSplitFailed(String),

    /// The sequential frame reader could not be set up.
    #[error("reader initialization failed: {0}")]
    ReaderInitFailed(String),

    /// The multi-view writer could not be set up.
    #[error("writer initialization failed: {0}")]
    WriterInitFailed(String),

    /// The writer did not reach a successful terminal state.
    #[error("encoding failed: {0}")]
    EncodingFailed(String),

    /// The container cannot be demuxed by the codec backend.
    #[error("unsupported container: {0}")]
    UnsupportedFormat(String),

    /// The runtime lacks the encoder needed for multi-view output.
    #[error("multi-view encoder unavailable: {0}")]
    HardwareUnavailable(String),

    /// A downloaded source failed validation before transcoding.
    #[error("unsupported source format: {reason} (likely cause: {likely_cause})")]
    UnsupportedSourceFormat {
        /// What the validator observed.
        reason: String,
        /// Best guess at why, suitable for showing to a user.
        likely_cause: String,
    },

    /// The server does not advertise byte-range support.
    #[error("server does not support byte ranges for {url}")]
    RangeNotSupported {
        /// The URL that was probed.
        url: String,
    },

    /// A network request failed.
    #[error("network error: {0}")]
    Network(String),

    /// The operation was cancelled by `stop()` or a superseding request.
    #[error("operation cancelled")]
    Cancelled,

    /// A cache operation failed.
    #[error("cache error: {0}")]
    Cache(String),

    /// An I/O operation failed.
    #[error("IO error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// An external tool (ffmpeg, ffprobe) returned an error.
    #[error("Tool error [{tool}]: {message}")]
    Tool {
        /// Name of the tool that failed.
        tool: String,
        /// Human-readable error description.
        message: String,
    },

    /// Input data failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse failure classes used to decide how a failure is surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network trouble; surfaced with a retry affordance, never auto-retried.
    Transient,
    /// Unsupported container, codec, or missing video track.
    Format,
    /// Encoder or hardware not available in this runtime.
    Resource,
    /// User- or system-initiated cancellation; never reported.
    Cancellation,
    /// Cache I/O; best-effort, degrades to playing without caching.
    CacheIo,
    /// Everything else.
    Internal,
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Network(_) | Error::RangeNotSupported { .. } => ErrorKind::Transient,
            Error::NoVideoTrack
            | Error::UnsupportedFormat(_)
            | Error::UnsupportedSourceFormat { .. }
            | Error::ReaderInitFailed(_) => ErrorKind::Format,
            Error::HardwareUnavailable(_) | Error::Tool { .. } => ErrorKind::Resource,
            Error::Cancelled => ErrorKind::Cancellation,
            Error::Cache(_) => ErrorKind::CacheIo,
            Error::PixelBufferCreationFailed(_)
            | Error::FrameSplitFailed(_)
            | Error::WriterInitFailed(_)
            | Error::EncodingFailed(_)
            | Error::Io { .. }
            | Error::Validation(_)
            | Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether this error is a cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Whether plain (non-stereo) playback is a sensible next step.
    pub fn suggests_fallback(&self) -> bool {
        matches!(self.kind(), ErrorKind::Format | ErrorKind::Resource)
    }

    /// Convenience constructor for [`Error::Tool`].
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Convenience constructor for [`Error::UnsupportedSourceFormat`].
    pub fn unsupported_source(reason: impl Into<String>, likely_cause: impl Into<String>) -> Self {
        Error::UnsupportedSourceFormat {
            reason: reason.into(),
            likely_cause: likely_cause.into(),
        }
    }

    /// Convenience constructor for [`Error::Cache`].
    pub fn cache(message: impl Into<String>) -> Self {
        Error::Cache(message.into())
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
