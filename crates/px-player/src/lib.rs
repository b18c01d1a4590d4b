//! # px-player
//!
//! The playback coordinator: one state machine per viewer that takes a
//! source and conversion settings through cache lookup, download,
//! validation, stereo transcoding, cache insertion, and playback.
//!
//! State is published on a `watch` channel ([`PlaybackCoordinator::subscribe_state`]);
//! fallback and ready notifications go out on an [`EventBus`].

mod coordinator;
pub mod events;
mod player;
mod validate;

pub use coordinator::{PlaybackCoordinator, PlaybackFailure, PlaybackRequest};
pub use events::{EventBus, EventPayload, PlaybackEvent};
pub use player::{HeadlessPlayer, HeadlessPlayerFactory, Player, PlayerFactory};
pub use validate::validate_source;
