//! Per-session scratch directories.
//!
//! A [`Workspace`] owns a temporary directory holding one session's
//! downloaded source and transcode output. Everything inside is deleted when
//! the workspace is dropped, so the caller must move what it wants to keep
//! (the cache does this on `put`) before letting it go.

use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Scratch directory for one download + transcode session.
///
/// # Example
///
/// ```no_run
/// use px_av::Workspace;
///
/// let workspace = Workspace::new_in(std::path::Path::new("/tmp/parallax/.work"), "session").unwrap();
/// let source = workspace.temp_file("source");
/// // ... download into `source`, transcode into workspace.temp_file("stereo.mkv") ...
/// ```
#[derive(Debug)]
pub struct Workspace {
    temp_dir: TempDir,
}

impl Workspace {
    /// Create a workspace under `parent`, creating `parent` if needed.
    pub fn new_in(parent: &Path, prefix: &str) -> px_core::Result<Self> {
        std::fs::create_dir_all(parent)?;
        let temp_dir = tempfile::Builder::new()
            .prefix(&format!("parallax-{prefix}-"))
            .tempdir_in(parent)
            .map_err(|e| px_core::Error::tool("workspace", format!("failed to create temp dir: {e}")))?;
        Ok(Self { temp_dir })
    }

    /// Path to the temporary directory.
    pub fn dir(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Path for a named file inside the workspace.
    pub fn temp_file(&self, name: &str) -> PathBuf {
        self.temp_dir.path().join(name)
    }
}
