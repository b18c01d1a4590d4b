//! The player seam and a clock-driven headless implementation.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use px_core::Result;

/// Something that renders a converted stereo file.
pub trait Player: Send + Sync + std::fmt::Debug {
    fn media_path(&self) -> &Path;
    fn duration(&self) -> Duration;
    fn play(&self);
    fn pause(&self);
    /// Jump to `position`, clamped to the media duration.
    fn seek(&self, position: Duration);
    fn position(&self) -> Duration;
    fn is_paused(&self) -> bool;
    /// Release rendering resources. Further calls are no-ops.
    fn close(&self);
}

/// Creates players for files the coordinator has made ready.
pub trait PlayerFactory: Send + Sync {
    fn open(&self, path: &Path, duration: Duration) -> Result<Arc<dyn Player>>;
}

#[derive(Debug)]
struct Clock {
    /// Position at the last play/pause/seek.
    anchor: Duration,
    /// Set while playing.
    resumed_at: Option<Instant>,
    closed: bool,
}

/// A player with no output that tracks position against the wall clock.
#[derive(Debug)]
pub struct HeadlessPlayer {
    path: PathBuf,
    duration: Duration,
    clock: Mutex<Clock>,
}

impl HeadlessPlayer {
    pub fn new(path: impl Into<PathBuf>, duration: Duration) -> Self {
        Self {
            path: path.into(),
            duration,
            clock: Mutex::new(Clock {
                anchor: Duration::ZERO,
                resumed_at: None,
                closed: false,
            }),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.clock.lock().closed
    }

    fn position_of(&self, clock: &Clock) -> Duration {
        let elapsed = clock.resumed_at.map(|t| t.elapsed()).unwrap_or_default();
        (clock.anchor + elapsed).min(self.duration)
    }
}

impl Player for HeadlessPlayer {
    fn media_path(&self) -> &Path {
        &self.path
    }

    fn duration(&self) -> Duration {
        self.duration
    }

    fn play(&self) {
        let mut clock = self.clock.lock();
        if !clock.closed && clock.resumed_at.is_none() {
            clock.resumed_at = Some(Instant::now());
        }
    }

    fn pause(&self) {
        let mut clock = self.clock.lock();
        if clock.resumed_at.is_some() {
            clock.anchor = self.position_of(&clock);
            clock.resumed_at = None;
        }
    }

    fn seek(&self, position: Duration) {
        let mut clock = self.clock.lock();
        if clock.closed {
            return;
        }
        clock.anchor = position.min(self.duration);
        if clock.resumed_at.is_some() {
            clock.resumed_at = Some(Instant::now());
        }
    }

    fn position(&self) -> Duration {
        let clock = self.clock.lock();
        self.position_of(&clock)
    }

    fn is_paused(&self) -> bool {
        self.clock.lock().resumed_at.is_none()
    }

    fn close(&self) {
        let mut clock = self.clock.lock();
        if !clock.closed {
            clock.anchor = self.position_of(&clock);
            clock.resumed_at = None;
            clock.closed = true;
            tracing::debug!(path = %self.path.display(), "Player closed");
        }
    }
}

/// Opens a [`HeadlessPlayer`] for every file.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeadlessPlayerFactory;

impl PlayerFactory for HeadlessPlayerFactory {
    fn open(&self, path: &Path, duration: Duration) -> Result<Arc<dyn Player>> {
        Ok(Arc::new(HeadlessPlayer::new(path, duration)))
    }
}
