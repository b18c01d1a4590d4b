//! px-core: shared errors, configuration, and stereo domain types.
//!
//! This crate is the foundational dependency for all other px-* crates. It
//! carries the unified [`Error`] type every pipeline stage funnels into, the
//! application [`config::Config`], and the value types that flow between the
//! format detector, transcoder, cache, and playback coordinator.

pub mod config;
pub mod error;
pub mod ids;
pub mod state;
pub mod stereo;

// Re-export the most commonly used items at the crate root.
pub use error::{Error, ErrorKind, Result};
pub use ids::SessionId;
pub use state::PlayerState;
pub use stereo::*;
