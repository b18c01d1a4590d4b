//! Pre-transcode checks on a downloaded source.

use std::path::Path;

use px_av::{CodecBackend, SourceInfo};
use px_core::{Error, Result};
use tokio_util::sync::CancellationToken;

/// Containers commonly listed by catalogs that the local codec stack cannot
/// demux, with the cause shown to the user.
const KNOWN_UNSUPPORTED: &[(&str, &str)] = &[
    ("avi", "AVI containers are not supported for stereo conversion"),
    ("wmv", "Windows Media files are not supported for stereo conversion"),
    ("flv", "Flash video files are not supported for stereo conversion"),
    ("rm", "RealMedia files are not supported for stereo conversion"),
    ("rmvb", "RealMedia files are not supported for stereo conversion"),
    ("m3u8", "HLS playlists must be downloaded as a single file first"),
];

/// Check that `path` can be demuxed and has a video track.
///
/// Anything else fails with [`Error::UnsupportedSourceFormat`] naming the
/// likely cause, derived from `url` where possible. Cancellation passes
/// through as [`Error::Cancelled`].
pub async fn validate_source(
    backend: &dyn CodecBackend,
    path: &Path,
    url: &str,
    cancel: &CancellationToken,
) -> Result<SourceInfo> {
    let info = match backend.probe(path, cancel).await {
        Ok(info) => info,
        Err(e) if e.is_cancelled() => return Err(e),
        Err(e) => return Err(Error::unsupported_source(e.to_string(), likely_cause(url))),
    };

    if !info.has_video {
        return Err(Error::unsupported_source(
            "source has no video track",
            "the file carries only audio or data streams",
        ));
    }
    if info.width == 0 || info.height == 0 {
        return Err(Error::unsupported_source(
            format!("source reports {}x{} frames", info.width, info.height),
            "the video stream is missing its dimensions",
        ));
    }

    tracing::debug!(
        container = %info.container,
        width = info.width,
        height = info.height,
        "Source validated"
    );
    Ok(info)
}

fn extension_of(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next()?;
    let file = path.rsplit('/').next()?;
    let (_, ext) = file.rsplit_once('.')?;
    (!ext.is_empty()).then(|| ext.to_ascii_lowercase())
}

fn likely_cause(url: &str) -> String {
    let ext = extension_of(url);
    if let Some(ext) = &ext {
        if let Some((_, cause)) = KNOWN_UNSUPPORTED.iter().find(|(e, _)| *e == ext.as_str()) {
            return (*cause).to_string();
        }
    }
    match ext {
        Some(ext) => format!("the .{ext} container or its codec cannot be opened by the local codec stack"),
        None => "the file is not a recognised video container or is corrupt".to_string(),
    }
}
