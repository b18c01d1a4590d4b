//! Byte-range chunk planning and fetching.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use px_core::config::{ChunkedConfig, DownloadConfig};
use px_core::{ChunkDescriptor, Error, Result, SourceDescriptor};
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Client, Method, StatusCode};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::buffer::ChunkBufferManager;
use crate::http::{bad_status, build_client, network, request};

/// Consecutive rounds without a single successful chunk before giving up.
const MAX_EMPTY_ROUNDS: usize = 3;

/// What a range probe learned about a remote source.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub total_bytes: u64,
    pub estimated_duration: Duration,
    pub estimated_bytes_per_second: u64,
}

/// A chunk that has been written to local disk.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadedChunk {
    pub descriptor: ChunkDescriptor,
    pub path: PathBuf,
}

/// Fetches a remote source as fixed-duration byte-range chunks.
#[derive(Debug, Clone)]
pub struct ChunkDownloader {
    client: Client,
    config: ChunkedConfig,
}

impl ChunkDownloader {
    pub fn new(download: &DownloadConfig, config: ChunkedConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(download)?,
            config,
        })
    }

    pub fn with_client(client: Client, config: ChunkedConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &ChunkedConfig {
        &self.config
    }

    /// Ask the server for size and range support without fetching the body.
    ///
    /// Fails with [`Error::RangeNotSupported`] when the server does not
    /// advertise `Accept-Ranges: bytes`.
    pub async fn probe(&self, source: &SourceDescriptor) -> Result<StreamInfo> {
        let url = source.stream_url.as_str();
        let response = request(&self.client, Method::HEAD, source)
            .send()
            .await
            .map_err(|e| network(url, e))?;
        if !response.status().is_success() {
            return Err(bad_status(url, response.status()));
        }

        let accepts_bytes = response
            .headers()
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.split(',').any(|unit| unit.trim().eq_ignore_ascii_case("bytes")));
        if !accepts_bytes {
            return Err(Error::RangeNotSupported { url: url.to_string() });
        }

        let advertised = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|&n| n > 0);
        let total_bytes = match advertised {
            Some(n) => n,
            None => self.probe_total_via_range(source).await?,
        };

        let info = self.stream_info(source, total_bytes);
        tracing::debug!(
            video_id = %source.id,
            total_bytes,
            bytes_per_second = info.estimated_bytes_per_second,
            "Probed ranged source"
        );
        Ok(info)
    }

    /// Some servers omit the length on HEAD; a one-byte range reveals it.
    async fn probe_total_via_range(&self, source: &SourceDescriptor) -> Result<u64> {
        let url = source.stream_url.as_str();
        let response = request(&self.client, Method::GET, source)
            .header(RANGE, "bytes=0-0")
            .send()
            .await
            .map_err(|e| network(url, e))?;
        if response.status() != StatusCode::PARTIAL_CONTENT {
            return Err(Error::RangeNotSupported { url: url.to_string() });
        }
        response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total)
            .ok_or_else(|| Error::Network(format!("{url} did not report a content length")))
    }

    fn stream_info(&self, source: &SourceDescriptor, total_bytes: u64) -> StreamInfo {
        match source.duration.filter(|d| !d.is_zero()) {
            Some(duration) => StreamInfo {
                total_bytes,
                estimated_duration: duration,
                estimated_bytes_per_second: ((total_bytes as f64 / duration.as_secs_f64()).round() as u64).max(1),
            },
            None => {
                let bps = self.config.assumed_bytes_per_second.max(1);
                StreamInfo {
                    total_bytes,
                    estimated_duration: Duration::from_secs_f64(total_bytes as f64 / bps as f64),
                    estimated_bytes_per_second: bps,
                }
            }
        }
    }

    /// Bytes covered by one full chunk.
    pub fn bytes_per_chunk(&self, info: &StreamInfo) -> u64 {
        ((self.config.chunk_duration_secs * info.estimated_bytes_per_second as f64) as u64).max(1)
    }

    pub fn chunk_count(&self, info: &StreamInfo) -> usize {
        info.total_bytes.div_ceil(self.bytes_per_chunk(info)) as usize
    }

    /// Byte range `[index * bpc, min((index + 1) * bpc, total))` as a chunk,
    /// or `None` past the end of the source.
    pub fn byte_range_for_chunk(&self, index: usize, info: &StreamInfo) -> Option<ChunkDescriptor> {
        let per_chunk = self.bytes_per_chunk(info);
        let start = (index as u64).checked_mul(per_chunk)?;
        if start >= info.total_bytes {
            return None;
        }
        let end = start.saturating_add(per_chunk).min(info.total_bytes);
        Some(ChunkDescriptor {
            index,
            byte_range: start..end,
            estimated_duration: Duration::from_secs_f64(
                (end - start) as f64 / info.estimated_bytes_per_second.max(1) as f64,
            ),
            is_last: end == info.total_bytes,
        })
    }

    /// Fetch one chunk into `dir`.
    pub async fn download_chunk(
        &self,
        source: &SourceDescriptor,
        chunk: &ChunkDescriptor,
        dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<DownloadedChunk> {
        let url = source.stream_url.as_str();
        let path = dir.join(format!("chunk_{:05}.bin", chunk.index));

        let send = request(&self.client, Method::GET, source)
            .header(RANGE, chunk.range_header())
            .send();
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            r = send => r.map_err(|e| network(url, e))?,
        };

        match response.status() {
            StatusCode::PARTIAL_CONTENT => {}
            StatusCode::OK => return Err(Error::RangeNotSupported { url: url.to_string() }),
            status => return Err(bad_status(url, status)),
        }

        let body = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            b = response.bytes() => b.map_err(|e| network(url, e))?,
        };
        if body.len() as u64 != chunk.len() {
            return Err(Error::Network(format!(
                "chunk {} from {url}: expected {} bytes, got {}",
                chunk.index,
                chunk.len(),
                body.len()
            )));
        }

        let mut file = tokio::fs::File::create(&path).await?;
        file.write_all(&body).await?;
        file.flush().await?;

        Ok(DownloadedChunk {
            descriptor: chunk.clone(),
            path,
        })
    }

    /// Fetch `chunks` with up to `max_concurrent` requests in flight.
    ///
    /// Failed chunks are logged and left out; the rest come back sorted by
    /// index.
    pub async fn download_chunks(
        &self,
        source: &SourceDescriptor,
        chunks: Vec<ChunkDescriptor>,
        dir: &Path,
        cancel: &CancellationToken,
    ) -> Vec<DownloadedChunk> {
        let mut fetched: Vec<DownloadedChunk> = stream::iter(chunks)
            .map(|chunk| async move {
                let result = self.download_chunk(source, &chunk, dir, cancel).await;
                (chunk.index, result)
            })
            .buffer_unordered(self.config.max_concurrent.max(1))
            .filter_map(|(index, result)| async move {
                match result {
                    Ok(chunk) => Some(chunk),
                    Err(e) => {
                        if !e.is_cancelled() {
                            tracing::warn!(chunk = index, error = %e, "Chunk download failed");
                        }
                        None
                    }
                }
            })
            .collect()
            .await;
        fetched.sort_by_key(|c| c.descriptor.index);
        fetched
    }

    /// Assemble the whole source at `dest` by walking a chunk buffer window
    /// from the first chunk to the last.
    ///
    /// Chunk files live in a `<dest>.chunks` scratch directory that is
    /// removed before returning.
    pub async fn download_to_file<F>(
        &self,
        source: &SourceDescriptor,
        dest: &Path,
        on_progress: F,
        cancel: &CancellationToken,
    ) -> Result<u64>
    where
        F: Fn(f64) + Send + Sync,
    {
        let scratch = scratch_dir(dest);
        tokio::fs::create_dir_all(&scratch).await?;

        let result = self.assemble(source, dest, &scratch, &on_progress, cancel).await;
        let _ = tokio::fs::remove_dir_all(&scratch).await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(dest).await;
        }
        result
    }

    async fn assemble<F>(
        &self,
        source: &SourceDescriptor,
        dest: &Path,
        scratch: &Path,
        on_progress: &F,
        cancel: &CancellationToken,
    ) -> Result<u64>
    where
        F: Fn(f64) + Send + Sync,
    {
        let info = self.probe(source).await?;
        let total_chunks = self.chunk_count(&info);
        if total_chunks == 0 {
            return Err(Error::Network(format!("{} reported an empty body", source.stream_url)));
        }
        // Assembly always walks forward once, so looping is off here.
        let mut buffer = ChunkBufferManager::new(
            total_chunks,
            self.config.min_buffer_ahead,
            self.config.max_buffer_ahead,
            false,
        );
        tracing::info!(
            video_id = %source.id,
            total_bytes = info.total_bytes,
            chunks = total_chunks,
            "Downloading source in chunks"
        );

        let mut out = tokio::fs::File::create(dest).await?;
        let mut written: u64 = 0;
        let mut empty_rounds = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let wanted: Vec<ChunkDescriptor> = buffer
                .chunks_needed()
                .into_iter()
                .filter_map(|i| self.byte_range_for_chunk(i, &info))
                .collect();
            if !wanted.is_empty() {
                let fetched = self.download_chunks(source, wanted, scratch, cancel).await;
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                if fetched.is_empty() {
                    empty_rounds += 1;
                    if empty_rounds >= MAX_EMPTY_ROUNDS {
                        return Err(Error::Network(format!(
                            "no progress fetching chunk {} of {}",
                            buffer.current_index(),
                            source.stream_url
                        )));
                    }
                    continue;
                }
                empty_rounds = 0;
                for chunk in fetched {
                    buffer.insert(chunk.descriptor.index, chunk.path);
                }
            }

            while let Some(path) = buffer.current_chunk().map(Path::to_path_buf) {
                let bytes = tokio::fs::read(&path).await?;
                out.write_all(&bytes).await?;
                written += bytes.len() as u64;
                on_progress((written as f64 / info.total_bytes as f64).min(1.0));

                if buffer.advance_to_next_chunk().is_none() {
                    out.flush().await?;
                    return Ok(written);
                }
                buffer.cleanup_old_chunks();
            }
        }
    }
}

fn scratch_dir(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".chunks");
    dest.with_file_name(name)
}

/// Total length from a `Content-Range: bytes 0-0/12345` header.
fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.trim().rsplit_once('/')?;
    total.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn downloader(chunk_secs: f64) -> ChunkDownloader {
        let config = ChunkedConfig {
            chunk_duration_secs: chunk_secs,
            ..ChunkedConfig::default()
        };
        ChunkDownloader::with_client(Client::new(), config)
    }

    fn info(total_bytes: u64, bps: u64) -> StreamInfo {
        StreamInfo {
            total_bytes,
            estimated_duration: Duration::from_secs(total_bytes / bps),
            estimated_bytes_per_second: bps,
        }
    }

    #[test]
    fn chunk_ranges_cover_source() {
        let d = downloader(2.0);
        let info = info(10_500, 1000);

        assert_eq!(d.bytes_per_chunk(&info), 2000);
        assert_eq!(d.chunk_count(&info), 6);

        let first = d.byte_range_for_chunk(0, &info).unwrap();
        assert_eq!(first.byte_range, 0..2000);
        assert_eq!(first.estimated_duration, Duration::from_secs(2));
        assert!(!first.is_last);

        let last = d.byte_range_for_chunk(5, &info).unwrap();
        assert_eq!(last.byte_range, 10_000..10_500);
        assert!(last.is_last);
        assert_eq!(last.range_header(), "bytes=10000-10499");

        assert!(d.byte_range_for_chunk(6, &info).is_none());
    }

    #[test]
    fn exact_multiple_marks_last_chunk() {
        let d = downloader(1.0);
        let info = info(3000, 1000);
        assert_eq!(d.chunk_count(&info), 3);
        assert!(d.byte_range_for_chunk(2, &info).unwrap().is_last);
    }

    #[test]
    fn duration_drives_bitrate_estimate() {
        let d = downloader(10.0);
        let source = SourceDescriptor::new("a", "https://cdn.example.com/a.mp4", 3840, 1080)
            .with_duration(Duration::from_secs(20));
        let info = d.stream_info(&source, 40_000);
        assert_eq!(info.estimated_bytes_per_second, 2000);
        assert_eq!(info.estimated_duration, Duration::from_secs(20));

        let untimed = SourceDescriptor::new("b", "https://cdn.example.com/b.mp4", 3840, 1080);
        let info = d.stream_info(&untimed, 4_000_000);
        assert_eq!(info.estimated_bytes_per_second, 1_000_000);
        assert_eq!(info.estimated_duration, Duration::from_secs(4));
    }

    #[test]
    fn content_range_total() {
        assert_eq!(parse_content_range_total("bytes 0-0/12345"), Some(12345));
        assert_eq!(parse_content_range_total("bytes 0-0/*"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }

    #[test]
    fn scratch_dir_sits_beside_dest() {
        assert_eq!(
            scratch_dir(Path::new("/tmp/work/source.bin")),
            PathBuf::from("/tmp/work/source.bin.chunks")
        );
    }
}
