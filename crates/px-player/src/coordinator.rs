//! The playback state machine.
//!
//! ```text
//! idle -> downloading -> converting -> playing <-> paused
//!   ^          |              |            |
//!   |          +---- error <--+------------+
//!   +------------------ stop() ------------+
//! ```
//!
//! Each `play()` spawns one session task that owns the whole
//! download/validate/convert/cache pipeline and can be cancelled as a unit.
//! Only this module turns pipeline failures into [`PlayerState::Error`];
//! cancellation is never reported. A panic inside the pipeline is reported
//! as an internal error rather than leaving the state stuck mid-pipeline.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use px_av::{Transcoder, Workspace};
use px_cache::{CachePin, CachedVideoMetadata, DiskVideoCache};
use px_core::config::{Config, DownloadStrategy};
use px_core::{ConversionSettings, Error, ErrorKind, PlayerState, Result, SessionId, SourceDescriptor};
use px_stream::{ChunkDownloader, SourceDownloader};
use tokio::sync::{broadcast, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::events::{EventBus, EventPayload, PlaybackEvent};
use crate::player::{Player, PlayerFactory};
use crate::validate::validate_source;

/// Directory under the cache root holding per-session scratch space.
const WORK_DIR: &str = "work";

/// One play request.
#[derive(Debug, Clone)]
pub struct PlaybackRequest {
    pub source: SourceDescriptor,
    pub settings: ConversionSettings,
}

/// The last failure of a session, kept so the UI can offer retry or
/// fallback.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackFailure {
    pub session: SessionId,
    pub message: String,
    pub kind: ErrorKind,
    pub suggests_fallback: bool,
}

struct Session {
    id: SessionId,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// What is on screen right now.
struct Active {
    session: SessionId,
    player: Arc<dyn Player>,
    /// Held while the player reads a cached file.
    _pin: Option<CachePin>,
    /// Owns a transcode that could not be cached; dropping it deletes the
    /// file.
    _scratch: Option<Workspace>,
}

struct Inner {
    cache: DiskVideoCache,
    transcoder: Transcoder,
    downloader: SourceDownloader,
    chunker: ChunkDownloader,
    strategy: DownloadStrategy,
    extension: String,
    players: Arc<dyn PlayerFactory>,
    state: watch::Sender<PlayerState>,
    events: EventBus,
    active: parking_lot::Mutex<Option<Active>>,
    last_request: parking_lot::Mutex<Option<PlaybackRequest>>,
    last_failure: parking_lot::Mutex<Option<PlaybackFailure>>,
}

/// Coordinates cache lookup, download, validation, transcoding, and
/// playback for one viewer.
pub struct PlaybackCoordinator {
    inner: Arc<Inner>,
    session: tokio::sync::Mutex<Option<Session>>,
}

impl std::fmt::Debug for PlaybackCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackCoordinator")
            .field("state", &*self.inner.state.borrow())
            .field("strategy", &self.inner.strategy)
            .finish()
    }
}

impl PlaybackCoordinator {
    pub fn new(
        cache: DiskVideoCache,
        transcoder: Transcoder,
        players: Arc<dyn PlayerFactory>,
        config: &Config,
    ) -> Result<Self> {
        config.check()?;
        let (state, _) = watch::channel(PlayerState::Idle);
        Ok(Self {
            inner: Arc::new(Inner {
                cache,
                transcoder,
                downloader: SourceDownloader::new(&config.download)?,
                chunker: ChunkDownloader::new(&config.download, config.chunked.clone())?,
                strategy: config.download.strategy,
                extension: config.transcode.container_extension.clone(),
                players,
                state,
                events: EventBus::default(),
                active: parking_lot::Mutex::new(None),
                last_request: parking_lot::Mutex::new(None),
                last_failure: parking_lot::Mutex::new(None),
            }),
            session: tokio::sync::Mutex::new(None),
        })
    }

    // -----------------------------------------------------------------------
    // Observation
    // -----------------------------------------------------------------------

    pub fn state(&self) -> PlayerState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PlayerState> {
        self.inner.state.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.inner.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn player(&self) -> Option<Arc<dyn Player>> {
        self.inner.active.lock().as_ref().map(|a| a.player.clone())
    }

    pub fn last_failure(&self) -> Option<PlaybackFailure> {
        self.inner.last_failure.lock().clone()
    }

    pub fn last_request(&self) -> Option<PlaybackRequest> {
        self.inner.last_request.lock().clone()
    }

    pub fn cache(&self) -> &DiskVideoCache {
        &self.inner.cache
    }

    /// Wait until the state satisfies `f`, returning that state.
    pub async fn wait_for<F>(&self, mut f: F) -> PlayerState
    where
        F: FnMut(&PlayerState) -> bool,
    {
        let mut rx = self.subscribe_state();
        let result = match rx.wait_for(|s| f(s)).await {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        };
        result
    }

    // -----------------------------------------------------------------------
    // Session control
    // -----------------------------------------------------------------------

    /// Start playing `source` with `settings`, stopping any current session
    /// first. Returns the new session's id.
    pub async fn play(&self, source: SourceDescriptor, settings: ConversionSettings) -> SessionId {
        let mut slot = self.session.lock().await;
        self.stop_locked(&mut slot).await;

        let id = SessionId::new();
        let request = PlaybackRequest { source, settings };
        *self.inner.last_request.lock() = Some(request.clone());
        *self.inner.last_failure.lock() = None;
        self.inner.state.send_replace(PlayerState::downloading(0.0));

        tracing::info!(
            session = %id,
            video_id = %request.source.id,
            key = %request.settings.settings_key(),
            "Playback requested"
        );

        let cancel = CancellationToken::new();
        let inner = self.inner.clone();
        let token = cancel.clone();
        let video_id = request.source.id.clone();
        let task = tokio::spawn(async move {
            let pipeline = tokio::spawn(inner.clone().run_session(id, request, token));
            if let Err(e) = pipeline.await {
                if e.is_panic() {
                    let err = Error::Internal(format!("playback session panicked: {}", panic_message(e)));
                    inner.record_failure(id, &video_id, &err);
                }
            }
        });

        *slot = Some(Session { id, cancel, task });
        id
    }

    /// Cancel the running pipeline, close the player, drop any uncached
    /// output, forget the last failure, and return to idle. Safe to call in
    /// any state, any number of times.
    pub async fn stop(&self) {
        let mut slot = self.session.lock().await;
        self.stop_locked(&mut slot).await;
    }

    async fn stop_locked(&self, slot: &mut Option<Session>) {
        if let Some(session) = slot.take() {
            session.cancel.cancel();
            // The pipeline may still touch its files; wait for it to let go.
            if let Err(e) = session.task.await {
                if e.is_panic() {
                    tracing::error!(session = %session.id, "Playback session panicked");
                }
            }
            tracing::debug!(session = %session.id, "Session stopped");
        }
        *self.inner.last_failure.lock() = None;

        let active = self.inner.active.lock().take();
        if let Some(active) = active {
            active.player.close();
            tracing::debug!(session = %active.session, "Player torn down");
        }

        self.inner.state.send_if_modified(|state| {
            if *state == PlayerState::Idle {
                false
            } else {
                *state = PlayerState::Idle;
                true
            }
        });
    }

    pub fn pause(&self) {
        self.transition_player(PlayerState::Playing, PlayerState::Paused, |p| p.pause());
    }

    pub fn resume(&self) {
        self.transition_player(PlayerState::Paused, PlayerState::Playing, |p| p.play());
    }

    fn transition_player(&self, from: PlayerState, to: PlayerState, act: impl FnOnce(&dyn Player)) {
        let active = self.inner.active.lock();
        let Some(active) = active.as_ref() else { return };
        let changed = self.inner.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
        if changed {
            act(active.player.as_ref());
        }
    }

    /// Seek to `position`. Ignored unless playing or paused.
    pub fn seek(&self, position: Duration) -> bool {
        if !self.inner.state.borrow().has_player() {
            return false;
        }
        match self.inner.active.lock().as_ref() {
            Some(active) => {
                active.player.seek(position);
                true
            }
            None => false,
        }
    }

    /// Seek to `fraction` of the duration, clamped to `[0, 1]`.
    pub fn seek_fraction(&self, fraction: f64) -> bool {
        let Some(player) = self.player() else { return false };
        let fraction = if fraction.is_nan() { 0.0 } else { fraction.clamp(0.0, 1.0) };
        self.seek(player.duration().mul_f64(fraction))
    }

    /// Stop and ask the caller to play the last source in plain mode.
    ///
    /// Returns `false` when nothing has been requested yet.
    pub async fn request_fallback(&self, reason: impl Into<String>) -> bool {
        let session = self.session.lock().await.as_ref().map(|s| s.id);
        self.stop().await;

        let Some(request) = self.last_request() else {
            return false;
        };
        let reason = reason.into();
        tracing::info!(video_id = %request.source.id, reason = %reason, "Fallback requested");
        self.inner.events.broadcast(
            session.unwrap_or_default(),
            EventPayload::FallbackRequested {
                reason,
                source: request.source,
            },
        );
        true
    }

    /// Replay the last request after a failure.
    pub async fn retry(&self) -> Option<SessionId> {
        if !self.inner.state.borrow().is_error() {
            return None;
        }
        let request = self.last_request()?;
        Some(self.play(request.source, request.settings).await)
    }
}

impl Drop for PlaybackCoordinator {
    fn drop(&mut self) {
        if let Ok(slot) = self.session.try_lock() {
            if let Some(session) = slot.as_ref() {
                session.cancel.cancel();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Session pipeline
// ---------------------------------------------------------------------------

/// Output of a successful pipeline run, before it goes on screen.
struct Ready {
    path: PathBuf,
    duration: Duration,
    pin: Option<CachePin>,
    scratch: Option<Workspace>,
}

impl Inner {
    async fn run_session(self: Arc<Self>, id: SessionId, request: PlaybackRequest, cancel: CancellationToken) {
        let result = match self.prepare(id, &request, &cancel).await {
            Ok(ready) => self.start_playback(id, ready, &cancel),
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => {
                tracing::debug!(session = %id, "Session cancelled");
            }
            Err(e) => self.record_failure(id, &request.source.id, &e),
        }
    }

    fn record_failure(&self, id: SessionId, video_id: &str, e: &Error) {
        let failure = PlaybackFailure {
            session: id,
            message: e.to_string(),
            kind: e.kind(),
            suggests_fallback: e.suggests_fallback(),
        };
        tracing::error!(
            session = %id,
            video_id = %video_id,
            kind = ?failure.kind,
            "Playback failed: {e}"
        );
        self.state.send_replace(PlayerState::error(failure.message.clone()));
        *self.last_failure.lock() = Some(failure);
    }

    async fn prepare(&self, id: SessionId, request: &PlaybackRequest, cancel: &CancellationToken) -> Result<Ready> {
        let source = &request.source;
        let key = request.settings.settings_key();

        if let Some(ready) = self.cached(source, &key).await {
            tracing::info!(session = %id, video_id = %source.id, key = %key, "Cache hit");
            return Ok(ready);
        }
        tracing::info!(session = %id, video_id = %source.id, key = %key, "Cache miss");

        let workspace = Workspace::new_in(&self.cache.root().join(WORK_DIR), &id.short())?;
        let local = workspace.temp_file("source");

        self.state.send_replace(PlayerState::downloading(0.0));
        let report = |p: f64| {
            self.state.send_replace(PlayerState::downloading(p));
        };
        match self.strategy {
            DownloadStrategy::Full => self.downloader.download(source, &local, report, cancel).await?,
            DownloadStrategy::Chunked => self.chunker.download_to_file(source, &local, report, cancel).await?,
        };
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let info = validate_source(self.transcoder.backend().as_ref(), &local, &source.stream_url, cancel).await?;

        self.state.send_replace(PlayerState::converting(0.0));
        let output = workspace.temp_file(&format!("stereo.{}", self.extension));
        self.transcoder
            .convert(
                &local,
                &request.settings,
                &output,
                |p| {
                    self.state.send_replace(PlayerState::converting(p));
                },
                cancel,
            )
            .await?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let duration = info.duration.or(source.duration).unwrap_or_default();
        let metadata = CachedVideoMetadata::new(
            &source.id,
            &source.stream_url,
            &key,
            source.source_width,
            source.source_height,
            duration,
        );

        // Pinned before insertion so the eviction pass triggered by `put`
        // cannot remove the entry before playback starts.
        let pin = self.cache.pin(&source.id, &key);
        match self.cache.put(&output, &source.id, &key, metadata).await {
            Ok(path) => Ok(Ready {
                pin: Some(pin),
                path,
                duration,
                scratch: None,
            }),
            Err(e) => {
                tracing::warn!(session = %id, video_id = %source.id, "Playing without caching: {e}");
                Ok(Ready {
                    path: output,
                    duration,
                    pin: None,
                    scratch: Some(workspace),
                })
            }
        }
    }

    /// A cache hit, pinned so eviction leaves it alone while it plays.
    ///
    /// Entries can vanish between lookup and pin; those count as a miss.
    async fn cached(&self, source: &SourceDescriptor, key: &str) -> Option<Ready> {
        let path = self.cache.get(&source.id, key).await?;
        let pin = self.cache.pin(&source.id, key);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            tracing::debug!(video_id = %source.id, key, "Cached file disappeared; converting again");
            return None;
        }

        let duration = self
            .cache
            .metadata(&source.id, key)
            .await
            .map(|m| m.duration())
            .or(source.duration)
            .unwrap_or_default();
        Some(Ready {
            path,
            duration,
            pin: Some(pin),
            scratch: None,
        })
    }

    fn start_playback(&self, id: SessionId, ready: Ready, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let player = self.players.open(&ready.path, ready.duration)?;
        player.play();

        *self.active.lock() = Some(Active {
            session: id,
            player: player.clone(),
            _pin: ready.pin,
            _scratch: ready.scratch,
        });
        self.state.send_replace(PlayerState::Playing);

        tracing::info!(session = %id, path = %ready.path.display(), "Playback ready");
        self.events.broadcast(
            id,
            EventPayload::PlaybackReady {
                player,
                path: ready.path,
            },
        );
        Ok(())
    }
}

fn panic_message(e: JoinError) -> String {
    let payload = e.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
