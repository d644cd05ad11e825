// Copyright (c) 2025 Snowfetch Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Integration tests for the chunk retrieval pipeline.
//!
//! These tests verify end-to-end behavior of the downloader:
//! - Bounded prefetch: never more than `prefetch_width` downloads in flight
//! - Strict ordering: chunks delivered in descriptor order, then `None`
//! - At-most-once: each chunk body fetched exactly once
//! - Failure isolation: one failed chunk does not poison the rest
//! - Cancellation: no new downloads start after cancel; no deadlock
//!
//! A second group exercises [`RestRequester`] against a real TCP listener
//! for timeout, status-code, gzip, and cancellation behavior on the wire.

use async_trait::async_trait;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use snowfetch::error::Error;
use snowfetch::{
    ChunkDescriptor, ChunkDownloader, ChunkFetcher, ChunkPayload, ChunkRequest, DownloadState,
    Result, RestConfig, RestRequester, RetrieverConfig,
};
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Test Helpers
// =============================================================================

/// Descriptors for `count` three-column chunks of two rows each.
fn make_descriptors(count: usize) -> Vec<ChunkDescriptor> {
    (0..count)
        .map(|i| ChunkDescriptor {
            url: format!("https://storage.example.com/result/{}", i),
            row_count: 2,
            uncompressed_size: 128,
        })
        .collect()
}

fn chunk_index_of(request: &ChunkRequest) -> usize {
    request
        .url()
        .path_segments()
        .and_then(|mut s| s.next_back())
        .and_then(|s| s.parse().ok())
        .unwrap()
}

fn chunk_body(index: usize) -> String {
    format!(
        r#"["c{i}","a",null],["c{i}","b","{i}"]"#,
        i = index
    )
}

/// Fetcher that tracks concurrency and per-chunk fetch counts, and can hold
/// all downloads behind a gate so tests control when anything completes.
#[derive(Debug)]
struct GatedFetcher {
    gate: Semaphore,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    fetch_counts: Vec<AtomicUsize>,
    fail_chunk: Option<usize>,
}

impl GatedFetcher {
    fn new(chunk_count: usize) -> Self {
        Self {
            gate: Semaphore::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            fetch_counts: (0..chunk_count).map(|_| AtomicUsize::new(0)).collect(),
            fail_chunk: None,
        }
    }

    fn failing_on(chunk_count: usize, fail_chunk: usize) -> Self {
        Self {
            fail_chunk: Some(fail_chunk),
            ..Self::new(chunk_count)
        }
    }

    /// Let `n` pending fetches through the gate.
    fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn fetch_count(&self, chunk_index: usize) -> usize {
        self.fetch_counts[chunk_index].load(Ordering::SeqCst)
    }

    fn total_fetches(&self) -> usize {
        self.fetch_counts
            .iter()
            .map(|c| c.load(Ordering::SeqCst))
            .sum()
    }
}

#[async_trait]
impl ChunkFetcher for GatedFetcher {
    async fn fetch_chunk(
        &self,
        request: &ChunkRequest,
        cancel: &CancellationToken,
    ) -> Result<ChunkPayload> {
        let index = chunk_index_of(request);
        self.fetch_counts[index].fetch_add(1, Ordering::SeqCst);

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let permit = tokio::select! {
            _ = cancel.cancelled() => {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::Cancelled);
            }
            permit = self.gate.acquire() => permit.unwrap(),
        };
        permit.forget();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail_chunk == Some(index) {
            return Err(Error::Protocol {
                status: reqwest::StatusCode::FORBIDDEN,
            });
        }
        Ok(ChunkPayload::new(Bytes::from(chunk_body(index)), false))
    }
}

fn downloader(
    fetcher: Arc<GatedFetcher>,
    chunk_count: usize,
    prefetch_width: usize,
    cancel: CancellationToken,
) -> ChunkDownloader {
    ChunkDownloader::new(
        3,
        make_descriptors(chunk_count),
        "integration-qrmk",
        None,
        cancel,
        fetcher,
        RetrieverConfig {
            prefetch_width,
            ..Default::default()
        },
    )
}

// =============================================================================
// Downloader pipeline tests
// =============================================================================

#[tokio::test]
async fn prefetch_stays_within_width_and_delivery_is_ordered() {
    let fetcher = Arc::new(GatedFetcher::new(12));
    let mut dl = downloader(Arc::clone(&fetcher), 12, 5, CancellationToken::new());
    assert_eq!(dl.chunk_count(), 12);

    // With the gate shut, the pool should saturate at exactly the prefetch
    // width before the consumer asks for anything.
    timeout(Duration::from_secs(5), async {
        while fetcher.in_flight.load(Ordering::SeqCst) < 5 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("workers should saturate the prefetch window");
    assert_eq!(fetcher.max_in_flight(), 5);

    // Open the gate fully and drain.
    fetcher.release(64);
    for expected in 0..12 {
        let chunk = timeout(Duration::from_secs(5), dl.next_chunk())
            .await
            .expect("no deadlock")
            .unwrap()
            .expect("chunk should be present");
        assert_eq!(chunk.chunk_index(), expected);
        assert_eq!(chunk.download_state(), DownloadState::Success);
        assert_eq!(chunk.row_count(), 2);
        assert_eq!(chunk.cell(0, 0), Some(format!("c{}", expected).as_str()));
        assert_eq!(chunk.cell(0, 2), None);
        assert_eq!(chunk.cell(1, 2), Some(expected.to_string().as_str()));
    }

    // Past the end: None, repeatedly.
    assert!(dl.next_chunk().await.unwrap().is_none());
    assert!(dl.next_chunk().await.unwrap().is_none());
}

#[tokio::test]
async fn each_chunk_downloads_at_most_once() {
    let fetcher = Arc::new(GatedFetcher::new(9));
    let mut dl = downloader(Arc::clone(&fetcher), 9, 4, CancellationToken::new());
    fetcher.release(64);

    // Consume eagerly so the consumer's on-demand path races the workers.
    let mut delivered = 0;
    while timeout(Duration::from_secs(5), dl.next_chunk())
        .await
        .expect("no deadlock")
        .unwrap()
        .is_some()
    {
        delivered += 1;
    }
    assert_eq!(delivered, 9);

    for handle in dl.worker_handles() {
        handle.await.unwrap();
    }
    for index in 0..9 {
        assert_eq!(fetcher.fetch_count(index), 1, "chunk {} refetched", index);
    }
}

#[tokio::test]
async fn failed_chunk_surfaces_in_order_and_later_chunks_survive() {
    let fetcher = Arc::new(GatedFetcher::failing_on(6, 2));
    let mut dl = downloader(Arc::clone(&fetcher), 6, 3, CancellationToken::new());
    fetcher.release(64);

    for expected in 0..2 {
        let chunk = dl.next_chunk().await.unwrap().unwrap();
        assert_eq!(chunk.chunk_index(), expected);
    }

    let err = dl.next_chunk().await.unwrap_err();
    assert_eq!(err.status(), Some(reqwest::StatusCode::FORBIDDEN));

    // The failure is confined to position 2.
    for expected in 3..6 {
        let chunk = timeout(Duration::from_secs(5), dl.next_chunk())
            .await
            .expect("no deadlock")
            .unwrap()
            .unwrap();
        assert_eq!(chunk.chunk_index(), expected);
    }
    assert!(dl.next_chunk().await.unwrap().is_none());
}

#[tokio::test]
async fn cancellation_stops_new_downloads_without_deadlock() {
    let fetcher = Arc::new(GatedFetcher::new(10));
    let cancel = CancellationToken::new();
    let mut dl = downloader(Arc::clone(&fetcher), 10, 3, cancel.clone());

    // Let the first wave through, then cancel with the gate shut again.
    fetcher.release(3);
    let first = timeout(Duration::from_secs(5), dl.next_chunk())
        .await
        .expect("no deadlock")
        .unwrap()
        .unwrap();
    assert_eq!(first.chunk_index(), 0);

    cancel.cancel();
    for handle in dl.worker_handles() {
        timeout(Duration::from_secs(5), handle)
            .await
            .expect("workers should stop after cancel")
            .unwrap();
    }

    // Every remaining position resolves (possibly as Cancelled), and the
    // consumer keeps making progress rather than hanging.
    let mut outcomes = 1;
    let mut cancelled = 0;
    loop {
        match timeout(Duration::from_secs(5), dl.next_chunk())
            .await
            .expect("no deadlock after cancel")
        {
            Ok(Some(_)) => outcomes += 1,
            Err(e) => {
                assert!(e.is_cancelled(), "expected Cancelled, got {}", e);
                outcomes += 1;
                cancelled += 1;
            }
            Ok(None) => break,
        }
        if outcomes > 10 {
            panic!("delivered more outcomes than chunks");
        }
    }
    assert_eq!(outcomes, 10);
    assert!(cancelled > 0, "cancellation should abort pending chunks");
}

#[tokio::test]
async fn consumer_sees_cancelled_error_for_unfetched_chunks() {
    let fetcher = Arc::new(GatedFetcher::new(4));
    let cancel = CancellationToken::new();
    let mut dl = downloader(Arc::clone(&fetcher), 4, 2, cancel.clone());

    cancel.cancel();
    for handle in dl.worker_handles() {
        handle.await.unwrap();
    }

    let err = dl.next_chunk().await.unwrap_err();
    assert!(err.is_cancelled(), "expected Cancelled, got {}", err);
}

#[tokio::test]
async fn empty_result_set_yields_none() {
    let fetcher = Arc::new(GatedFetcher::new(0));
    let mut dl = downloader(fetcher, 0, 5, CancellationToken::new());
    assert_eq!(dl.chunk_count(), 0);
    assert!(dl.next_chunk().await.unwrap().is_none());
}

// =============================================================================
// RestRequester wire tests
// =============================================================================

/// Serve one canned HTTP/1.1 response on an ephemeral port and return the
/// URL to hit. Reads the request head before responding.
async fn one_shot_server(response: Vec<u8>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf).await;
            let _ = stream.write_all(&response).await;
            let _ = stream.shutdown().await;
        }
    });
    format!("http://{}/result/0", addr)
}

fn http_response(status_line: &str, headers: &[(&str, &str)], body: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(status_line.as_bytes());
    out.extend_from_slice(b"\r\n");
    for (name, value) in headers {
        out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }
    out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
    out.extend_from_slice(body);
    out
}

fn wire_request(url: &str, rest_timeout: Duration) -> ChunkRequest {
    ChunkRequest::new(
        url,
        reqwest::header::HeaderMap::new(),
        rest_timeout,
        Duration::from_secs(16),
    )
    .unwrap()
}

#[tokio::test]
async fn plain_body_round_trips_over_http() {
    let body = br#"["a",null,"3"],["b","x","4"]"#;
    let url = one_shot_server(http_response("HTTP/1.1 200 OK", &[], body)).await;

    let requester = RestRequester::new(RestConfig::default()).unwrap();
    let payload = requester
        .get_raw(&wire_request(&url, Duration::from_secs(10)), &CancellationToken::new())
        .await
        .unwrap();
    assert!(!payload.is_gzip());
    assert_eq!(payload.len(), body.len());
}

#[tokio::test]
async fn gzip_body_decompresses_through_the_payload_reader() {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(br#"["a",null,"3"],["b","x","4"]"#)
        .unwrap();
    let compressed = encoder.finish().unwrap();
    let url = one_shot_server(http_response(
        "HTTP/1.1 200 OK",
        &[("Content-Encoding", "gzip")],
        &compressed,
    ))
    .await;

    let requester = RestRequester::new(RestConfig::default()).unwrap();
    let payload = requester
        .fetch_chunk(&wire_request(&url, Duration::from_secs(10)), &CancellationToken::new())
        .await
        .unwrap();
    assert!(payload.is_gzip());

    let mut decompressed = String::new();
    std::io::Read::read_to_string(&mut payload.reader(), &mut decompressed).unwrap();
    assert_eq!(decompressed, r#"["a",null,"3"],["b","x","4"]"#);
}

#[tokio::test]
async fn non_success_status_maps_to_protocol_error() {
    let url = one_shot_server(http_response("HTTP/1.1 403 Forbidden", &[], b"denied")).await;

    let requester = RestRequester::new(RestConfig::default()).unwrap();
    let err = requester
        .get_raw(&wire_request(&url, Duration::from_secs(10)), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(reqwest::StatusCode::FORBIDDEN));
}

#[tokio::test]
async fn stalled_server_maps_to_timeout_error() {
    // Accept the connection but never respond.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(stream);
        }
    });
    let url = format!("http://{}/result/0", addr);

    let requester = RestRequester::new(RestConfig::default()).unwrap();
    let err = requester
        .get_raw(
            &wire_request(&url, Duration::from_millis(200)),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(err.is_timeout(), "expected Timeout, got {}", err);
}

#[tokio::test]
async fn pre_cancelled_token_aborts_the_request() {
    let url = one_shot_server(http_response("HTTP/1.1 200 OK", &[], b"unused")).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let requester = RestRequester::new(RestConfig::default()).unwrap();
    let err = requester
        .get_raw(&wire_request(&url, Duration::from_secs(10)), &cancel)
        .await
        .unwrap_err();
    assert!(err.is_cancelled(), "expected Cancelled, got {}", err);
}

// =============================================================================
// End-to-end: downloader over a live requester
// =============================================================================

#[tokio::test]
async fn downloader_drives_the_real_requester_end_to_end() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let n = stream.read(&mut buf).await.unwrap_or(0);
                let head = String::from_utf8_lossy(&buf[..n]);
                let index: usize = head
                    .split_whitespace()
                    .nth(1)
                    .and_then(|path| path.rsplit('/').next())
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0);
                let body = chunk_body(index);
                let _ = stream
                    .write_all(&http_response("HTTP/1.1 200 OK", &[], body.as_bytes()))
                    .await;
                let _ = stream.shutdown().await;
            });
        }
    });

    let descriptors: Vec<ChunkDescriptor> = (0..4)
        .map(|i| ChunkDescriptor {
            url: format!("http://{}/result/{}", addr, i),
            row_count: 2,
            uncompressed_size: 128,
        })
        .collect();

    let requester = Arc::new(RestRequester::new(RestConfig::default()).unwrap());
    let mut headers = HashMap::new();
    headers.insert("x-custom-auth".to_string(), "token-123".to_string());

    let mut dl = ChunkDownloader::new(
        3,
        descriptors,
        "e2e-qrmk",
        Some(headers),
        CancellationToken::new(),
        requester,
        RetrieverConfig {
            prefetch_width: 2,
            ..Default::default()
        },
    );

    for expected in 0..4 {
        let chunk = timeout(Duration::from_secs(10), dl.next_chunk())
            .await
            .expect("no deadlock")
            .unwrap()
            .unwrap();
        assert_eq!(chunk.chunk_index(), expected);
        assert_eq!(chunk.row(0), &[
            Some(format!("c{}", expected)),
            Some("a".to_string()),
            None,
        ]);
    }
    assert!(dl.next_chunk().await.unwrap().is_none());
}
