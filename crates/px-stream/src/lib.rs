//! # px-stream
//!
//! Getting stereo sources onto local disk.
//!
//! - [`SourceDownloader`] streams a whole source with byte progress, an
//!   optional bearer credential, and cancellation. `file://` URLs are copied.
//! - [`ChunkDownloader`] probes a server for byte-range support, plans
//!   fixed-duration chunks, and fetches them concurrently.
//! - [`ChunkBufferManager`] tracks which chunks are buffered around a
//!   playback cursor, what to fetch next, and what can be dropped.

mod buffer;
mod chunks;
mod download;
mod http;

pub use buffer::ChunkBufferManager;
pub use chunks::{ChunkDownloader, DownloadedChunk, StreamInfo};
pub use download::SourceDownloader;
pub use http::build_client;
