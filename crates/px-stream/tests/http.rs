use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use px_core::config::{ChunkedConfig, DownloadConfig};
use px_core::{Error, SourceDescriptor};
use px_stream::{ChunkDownloader, SourceDownloader};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

fn body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Serves `Range: bytes=a-b` requests from an in-memory body.
struct Ranged {
    body: Vec<u8>,
    fail_start: Option<usize>,
}

impl Respond for Ranged {
    fn respond(&self, req: &Request) -> ResponseTemplate {
        let Some(range) = req.headers.get("range").and_then(|v| v.to_str().ok()) else {
            return ResponseTemplate::new(200).set_body_bytes(self.body.clone());
        };
        let (start, end) = range
            .trim_start_matches("bytes=")
            .split_once('-')
            .expect("range header");
        let start: usize = start.parse().unwrap();
        let end: usize = end.parse::<usize>().unwrap().min(self.body.len() - 1);
        if Some(start) == self.fail_start {
            return ResponseTemplate::new(500);
        }
        ResponseTemplate::new(206)
            .insert_header("content-range", format!("bytes {start}-{end}/{}", self.body.len()))
            .set_body_bytes(self.body[start..=end].to_vec())
    }
}

async fn ranged_server(body: Vec<u8>, fail_start: Option<usize>) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/v.mp4"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("accept-ranges", "bytes")
                .set_body_bytes(body.clone()),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v.mp4"))
        .respond_with(Ranged { body, fail_start })
        .mount(&server)
        .await;
    server
}

fn chunked(chunk_secs: f64) -> ChunkedConfig {
    ChunkedConfig {
        chunk_duration_secs: chunk_secs,
        assumed_bytes_per_second: 1000,
        max_concurrent: 3,
        ..ChunkedConfig::default()
    }
}

#[tokio::test]
async fn full_download_reports_progress_and_sends_credential() {
    let server = MockServer::start().await;
    let payload = body(64 * 1024);
    Mock::given(method("GET"))
        .and(path("/v.mp4"))
        .and(header("authorization", "Bearer secret-token"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(payload.clone()))
        .expect(1)
        .mount(&server)
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let dest = tmp.path().join("source.bin");
    let source = SourceDescriptor::new("abc", format!("{}/v.mp4", server.uri()), 3840, 1080)
        .with_credential("secret-token");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let downloader = SourceDownloader::new(&DownloadConfig::default()).unwrap();
    let bytes = downloader
        .download(&source, &dest, move |p| sink.lock().unwrap().push(p), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(bytes, payload.len() as u64);
    assert_eq!(std::fs::read(&dest).unwrap(), payload);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.last().copied(), Some(1.0));
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "progress went backwards: {seen:?}");
}

#[tokio::test]
async fn http_error_is_network_and_leaves_no_file() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let dest = tmp.path().join("source.bin");
    let source = SourceDescriptor::new("abc", format!("{}/missing.mp4", server.uri()), 3840, 1080);
    let err = SourceDownloader::new(&DownloadConfig::default())
        .unwrap()
        .download(&source, &dest, |_| {}, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_matches!(err, Error::Network(_));
    assert!(!dest.exists());
}

#[tokio::test]
async fn cancelled_download_is_not_a_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(body(1024))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let dest = tmp.path().join("source.bin");
    let source = SourceDescriptor::new("abc", format!("{}/slow.mp4", server.uri()), 3840, 1080);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = SourceDownloader::new(&DownloadConfig::default())
        .unwrap()
        .download(&source, &dest, |_| {}, &cancel)
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert!(!dest.exists());
}

#[tokio::test]
async fn file_urls_are_copied() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("local.mp4");
    std::fs::write(&src, body(500)).unwrap();
    let dest = tmp.path().join("copy.bin");

    let source = SourceDescriptor::new("local", format!("file://{}", src.display()), 1920, 540);
    let bytes = SourceDownloader::new(&DownloadConfig::default())
        .unwrap()
        .download(&source, &dest, |_| {}, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(bytes, 500);
    assert_eq!(std::fs::read(&dest).unwrap(), body(500));
}

#[tokio::test]
async fn probe_requires_byte_ranges() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body(100)))
        .mount(&server)
        .await;

    let source = SourceDescriptor::new("abc", format!("{}/v.mp4", server.uri()), 3840, 1080);
    let downloader = ChunkDownloader::new(&DownloadConfig::default(), chunked(1.0)).unwrap();
    let err = downloader.probe(&source).await.unwrap_err();
    assert_matches!(err, Error::RangeNotSupported { .. });
}

#[tokio::test]
async fn probe_reports_size_and_rate() {
    let server = ranged_server(body(10_000), None).await;
    let source = SourceDescriptor::new("abc", format!("{}/v.mp4", server.uri()), 3840, 1080)
        .with_duration(Duration::from_secs(5));

    let downloader = ChunkDownloader::new(&DownloadConfig::default(), chunked(1.0)).unwrap();
    let info = downloader.probe(&source).await.unwrap();
    assert_eq!(info.total_bytes, 10_000);
    assert_eq!(info.estimated_bytes_per_second, 2000);
    assert_eq!(info.estimated_duration, Duration::from_secs(5));
    assert_eq!(downloader.chunk_count(&info), 5);
}

#[tokio::test]
async fn batch_drops_failed_chunks_and_sorts() {
    let payload = body(10_000);
    // Chunk 2 starts at byte 2000 and always fails.
    let server = ranged_server(payload.clone(), Some(2000)).await;
    let source = SourceDescriptor::new("abc", format!("{}/v.mp4", server.uri()), 3840, 1080);

    let downloader = ChunkDownloader::new(&DownloadConfig::default(), chunked(1.0)).unwrap();
    let info = downloader.probe(&source).await.unwrap();
    let plan: Vec<_> = (0..5)
        .rev()
        .filter_map(|i| downloader.byte_range_for_chunk(i, &info))
        .collect();

    let tmp = tempfile::tempdir().unwrap();
    let fetched = downloader
        .download_chunks(&source, plan, tmp.path(), &CancellationToken::new())
        .await;

    let indices: Vec<usize> = fetched.iter().map(|c| c.descriptor.index).collect();
    assert_eq!(indices, vec![0, 1, 3, 4]);
    let third = &fetched[2];
    assert_eq!(std::fs::read(&third.path).unwrap(), payload[3000..4000].to_vec());
}

#[tokio::test]
async fn chunked_download_assembles_whole_source() {
    let payload = body(10_500);
    let server = ranged_server(payload.clone(), None).await;
    let source = SourceDescriptor::new("abc", format!("{}/v.mp4", server.uri()), 3840, 1080);

    let tmp = tempfile::tempdir().unwrap();
    let dest = tmp.path().join("source.bin");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();

    let downloader = ChunkDownloader::new(&DownloadConfig::default(), chunked(1.0)).unwrap();
    let bytes = downloader
        .download_to_file(&source, &dest, move |p| sink.lock().unwrap().push(p), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(bytes, 10_500);
    assert_eq!(std::fs::read(&dest).unwrap(), payload);
    assert!(!tmp.path().join("source.bin.chunks").exists());

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 11);
    assert_eq!(seen.last().copied(), Some(1.0));
    assert!(seen.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test]
async fn chunked_download_gives_up_on_dead_chunk() {
    let server = ranged_server(body(5000), Some(1000)).await;
    let source = SourceDescriptor::new("abc", format!("{}/v.mp4", server.uri()), 3840, 1080);

    let tmp = tempfile::tempdir().unwrap();
    let dest = tmp.path().join("source.bin");
    let err = ChunkDownloader::new(&DownloadConfig::default(), chunked(1.0))
        .unwrap()
        .download_to_file(&source, &dest, |_| {}, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_matches!(err, Error::Network(_));
    assert!(!dest.exists());
    assert!(!tmp.path().join("source.bin.chunks").exists());
}

#[tokio::test]
async fn chunked_download_rejects_empty_source() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/v.mp4"))
        .respond_with(ResponseTemplate::new(200).insert_header("accept-ranges", "bytes"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v.mp4"))
        .respond_with(ResponseTemplate::new(206).insert_header("content-range", "bytes */0"))
        .mount(&server)
        .await;
    let source = SourceDescriptor::new("abc", format!("{}/v.mp4", server.uri()), 3840, 1080);

    let tmp = tempfile::tempdir().unwrap();
    let dest = tmp.path().join("source.bin");
    let downloader = ChunkDownloader::new(&DownloadConfig::default(), chunked(1.0)).unwrap();
    let result = tokio::time::timeout(
        Duration::from_secs(10),
        downloader.download_to_file(&source, &dest, |_| {}, &CancellationToken::new()),
    )
    .await
    .expect("empty source must not stall the download");

    assert_matches!(result, Err(Error::Network(ref m)) if m.contains("empty"));
    assert!(!dest.exists());
    assert!(!tmp.path().join("source.bin.chunks").exists());
}
