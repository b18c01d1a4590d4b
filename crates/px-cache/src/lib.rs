//! # px-cache
//!
//! Disk-resident cache of transcoded stereo videos.
//!
//! Entries are keyed by `(video_id, settings_key)` and stored as a media
//! file under `videos/` plus a JSON sidecar under `metadata/`. A sidecar
//! exists if and only if its media file does. The cache is bounded by a byte
//! budget and evicts least-recently-used entries down to 80% of it.

mod cache;
mod metadata;
mod naming;

pub use cache::{CachePin, CacheStats, DiskVideoCache, EvictionReport};
pub use metadata::CachedVideoMetadata;
pub use naming::entry_name;
