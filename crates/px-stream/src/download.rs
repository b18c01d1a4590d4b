//! Full-source download.

use std::path::{Path, PathBuf};

use futures::StreamExt;
use px_core::config::DownloadConfig;
use px_core::{Error, Result, SourceDescriptor};
use reqwest::{Client, Method, Url};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::http::{bad_status, build_client, network, request};

/// Minimum progress delta between two reports.
const PROGRESS_STEP: f64 = 0.01;

/// Streams a whole source to local disk.
#[derive(Debug, Clone)]
pub struct SourceDownloader {
    client: Client,
}

impl SourceDownloader {
    pub fn new(config: &DownloadConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config)?,
        })
    }

    /// Reuse an existing client.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Download `source` into `dest`, reporting byte progress in `[0, 1]`.
    ///
    /// Returns the number of bytes written. On failure or cancellation the
    /// partial `dest` is removed before returning.
    pub async fn download<F>(
        &self,
        source: &SourceDescriptor,
        dest: &Path,
        on_progress: F,
        cancel: &CancellationToken,
    ) -> Result<u64>
    where
        F: Fn(f64) + Send + Sync,
    {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let result = match local_path(&source.stream_url) {
            Some(path) => copy_local(&path, dest, cancel).await,
            None => self.fetch(source, dest, &on_progress, cancel).await,
        };

        match result {
            Ok(bytes) => {
                on_progress(1.0);
                tracing::debug!(video_id = %source.id, bytes, dest = %dest.display(), "Source downloaded");
                Ok(bytes)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(dest).await;
                Err(e)
            }
        }
    }

    async fn fetch<F>(
        &self,
        source: &SourceDescriptor,
        dest: &Path,
        on_progress: &F,
        cancel: &CancellationToken,
    ) -> Result<u64>
    where
        F: Fn(f64) + Send + Sync,
    {
        let url = source.stream_url.as_str();
        let send = request(&self.client, Method::GET, source).send();
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            r = send => r.map_err(|e| network(url, e))?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(bad_status(url, status));
        }

        let total = response.content_length().filter(|&n| n > 0);
        tracing::info!(video_id = %source.id, url, total_bytes = ?total, "Downloading source");

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        let mut last_reported = 0.0;

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                next = stream.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(|e| network(url, e))?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;

            if let Some(total) = total {
                let fraction = (written as f64 / total as f64).min(1.0);
                if fraction - last_reported >= PROGRESS_STEP {
                    last_reported = fraction;
                    on_progress(fraction);
                }
            }
        }
        file.flush().await?;

        if let Some(total) = total {
            if written < total {
                return Err(Error::Network(format!(
                    "connection closed after {written} of {total} bytes from {url}"
                )));
            }
        }
        Ok(written)
    }
}

/// Filesystem path for `file://` URLs.
fn local_path(url: &str) -> Option<PathBuf> {
    let parsed = Url::parse(url).ok()?;
    if parsed.scheme() != "file" {
        return None;
    }
    parsed.to_file_path().ok()
}

async fn copy_local(src: &Path, dest: &Path, cancel: &CancellationToken) -> Result<u64> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        r = tokio::fs::copy(src, dest) => r.map_err(|e| {
            Error::Network(format!("failed to read {}: {e}", src.display()))
        }),
    }
}
