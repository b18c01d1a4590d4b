//! Playback notifications for the surrounding UI.
//!
//! [`EventBus`] wraps a `tokio::sync::broadcast` channel with a bounded
//! ring buffer of recent events so that late subscribers can catch up.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use px_core::{SessionId, SourceDescriptor};
use tokio::sync::broadcast;

use crate::player::Player;

/// Maximum number of events retained in the ring buffer.
const MAX_RECENT_EVENTS: usize = 32;

/// What happened.
#[derive(Debug, Clone)]
pub enum EventPayload {
    /// The user asked to abandon stereo playback of `source`; the caller
    /// should restart it in plain mode.
    FallbackRequested {
        reason: String,
        source: SourceDescriptor,
    },
    /// A player is ready for `path`.
    PlaybackReady { player: Arc<dyn Player>, path: PathBuf },
}

/// A timestamped event tied to the session that produced it.
#[derive(Debug, Clone)]
pub struct PlaybackEvent {
    pub session: SessionId,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl PlaybackEvent {
    pub fn new(session: SessionId, payload: EventPayload) -> Self {
        Self {
            session,
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Broadcast channel with a bounded ring buffer of recent events.
pub struct EventBus {
    tx: broadcast::Sender<PlaybackEvent>,
    recent: RwLock<VecDeque<PlaybackEvent>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

impl EventBus {
    /// `capacity` sizes the broadcast channel, not the ring buffer.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            recent: RwLock::new(VecDeque::with_capacity(MAX_RECENT_EVENTS)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.tx.subscribe()
    }

    /// Send to all current subscribers and remember the event.
    pub fn broadcast(&self, session: SessionId, payload: EventPayload) {
        let event = PlaybackEvent::new(session, payload);

        {
            let mut recent = self.recent.write();
            if recent.len() >= MAX_RECENT_EVENTS {
                recent.pop_front();
            }
            recent.push_back(event.clone());
        }

        // No receivers is fine; events are fire-and-forget.
        let _ = self.tx.send(event);
    }

    /// Most recent events, oldest first.
    pub fn recent(&self) -> Vec<PlaybackEvent> {
        self.recent.read().iter().cloned().collect()
    }
}
