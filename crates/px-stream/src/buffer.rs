//! Sliding window of buffered chunks around a playback cursor.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use px_core::config::ChunkedConfig;

/// Chunks kept behind the cursor by [`ChunkBufferManager::cleanup_old_chunks`].
const RETAIN_BEHIND: usize = 2;

/// Tracks which chunk files are on disk relative to a cursor.
///
/// With `looping` enabled every index computation wraps modulo the chunk
/// count, so the window ahead of the last chunk continues at chunk 0.
#[derive(Debug)]
pub struct ChunkBufferManager {
    total_chunks: usize,
    cursor: usize,
    min_buffer_ahead: usize,
    max_buffer_ahead: usize,
    looping: bool,
    buffered: BTreeMap<usize, PathBuf>,
}

impl ChunkBufferManager {
    pub fn new(total_chunks: usize, min_buffer_ahead: usize, max_buffer_ahead: usize, looping: bool) -> Self {
        let min_buffer_ahead = min_buffer_ahead.max(1);
        Self {
            total_chunks,
            cursor: 0,
            min_buffer_ahead,
            max_buffer_ahead: max_buffer_ahead.max(min_buffer_ahead),
            looping,
            buffered: BTreeMap::new(),
        }
    }

    pub fn from_config(total_chunks: usize, config: &ChunkedConfig) -> Self {
        Self::new(
            total_chunks,
            config.min_buffer_ahead,
            config.max_buffer_ahead,
            config.looping,
        )
    }

    pub fn total_chunks(&self) -> usize {
        self.total_chunks
    }

    pub fn current_index(&self) -> usize {
        self.cursor
    }

    pub fn buffered_count(&self) -> usize {
        self.buffered.len()
    }

    pub fn is_buffered(&self, index: usize) -> bool {
        self.buffered.contains_key(&index)
    }

    /// Record a chunk file. Out-of-range indices are ignored.
    pub fn insert(&mut self, index: usize, path: PathBuf) -> bool {
        if index >= self.total_chunks {
            return false;
        }
        self.buffered.insert(index, path);
        true
    }

    /// File backing the chunk under the cursor.
    pub fn current_chunk(&self) -> Option<&Path> {
        self.buffered.get(&self.cursor).map(PathBuf::as_path)
    }

    /// Index `offset` chunks ahead of the cursor, or `None` past the end
    /// when not looping.
    fn ahead(&self, offset: usize) -> Option<usize> {
        if self.total_chunks == 0 {
            return None;
        }
        let index = self.cursor + offset;
        if index < self.total_chunks {
            Some(index)
        } else if self.looping {
            Some(index % self.total_chunks)
        } else {
            None
        }
    }

    /// Missing indices in the next `max_buffer_ahead` chunks, nearest first.
    pub fn chunks_needed(&self) -> Vec<usize> {
        let mut needed = Vec::new();
        for offset in 0..self.max_buffer_ahead {
            let Some(index) = self.ahead(offset) else { break };
            if !self.is_buffered(index) && !needed.contains(&index) {
                needed.push(index);
            }
        }
        needed
    }

    /// Index the cursor would move to next.
    pub fn peek_next_chunk(&self) -> Option<usize> {
        self.ahead(1)
    }

    /// Move the cursor forward one chunk. Returns `None` at the end of a
    /// non-looping stream, leaving the cursor in place.
    pub fn advance_to_next_chunk(&mut self) -> Option<usize> {
        let next = self.peek_next_chunk()?;
        self.cursor = next;
        Some(next)
    }

    /// Move the cursor to `index`, clamped to the last chunk.
    pub fn seek_to_chunk(&mut self, index: usize) {
        self.cursor = index.min(self.total_chunks.saturating_sub(1));
    }

    /// Whether the current chunk and the `min_buffer_ahead - 1` after it are
    /// buffered. Near the end of a non-looping stream only the chunks that
    /// remain are required.
    pub fn is_ready_to_play(&self) -> bool {
        if self.total_chunks == 0 {
            return false;
        }
        (0..self.min_buffer_ahead)
            .map_while(|offset| self.ahead(offset))
            .all(|index| self.is_buffered(index))
    }

    fn retained_window(&self) -> BTreeSet<usize> {
        let mut window = BTreeSet::new();
        if self.total_chunks == 0 {
            return window;
        }
        let total = self.total_chunks as isize;
        let cursor = self.cursor as isize;
        for index in (cursor - RETAIN_BEHIND as isize)..(cursor + self.max_buffer_ahead as isize) {
            if self.looping {
                window.insert(index.rem_euclid(total) as usize);
            } else if (0..total).contains(&index) {
                window.insert(index as usize);
            }
        }
        window
    }

    /// Delete buffered chunk files outside `[cursor - 2, cursor + max_buffer_ahead)`.
    ///
    /// Returns the indices that were dropped.
    pub fn cleanup_old_chunks(&mut self) -> Vec<usize> {
        let window = self.retained_window();
        let stale: Vec<usize> = self
            .buffered
            .keys()
            .copied()
            .filter(|i| !window.contains(i))
            .collect();

        for index in &stale {
            if let Some(path) = self.buffered.remove(index) {
                match std::fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        tracing::warn!(chunk = index, path = %path.display(), error = %e, "Failed to delete chunk");
                    }
                }
            }
        }
        if !stale.is_empty() {
            tracing::trace!(dropped = ?stale, cursor = self.cursor, "Cleaned up chunks");
        }
        stale
    }
}
