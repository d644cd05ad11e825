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

//! Request execution against chunk storage endpoints.
//!
//! [`RestRequester`] issues a single cancellable, timeout-bounded HTTP
//! request. Two timers bound every call:
//!
//! - the REST timeout, a local timer covering the whole request (headers
//!   through body), and
//! - the per-attempt HTTP timeout set on the request itself.
//!
//! Whichever of the external cancellation signal and the REST timer fires
//! first aborts the call. A failure while a local timer has fired is
//! reported as [`Error::Timeout`] rather than the raw transport error, so
//! callers can tell a slow server from a broken network.
//!
//! Pre-signed chunk URLs carry their own authorization. When the statement
//! supplies no per-chunk headers, the default server-side-encryption headers
//! derived from the statement's qrmk token are attached instead; the two are
//! mutually exclusive.

use crate::error::{Error, Result};
use crate::types::RetrieverConfig;
use async_trait::async_trait;
use bytes::Bytes;
use flate2::read::GzDecoder;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_ENCODING};
use reqwest::{Client, Response, Url};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::io::Read;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const SSE_C_ALGORITHM: &str = "x-amz-server-side-encryption-customer-algorithm";
const SSE_C_KEY: &str = "x-amz-server-side-encryption-customer-key";
const SSE_C_AES: &str = "AES256";

/// Configuration for the underlying HTTP client.
#[derive(Debug, Clone)]
pub struct RestConfig {
    /// Connection timeout duration.
    pub connect_timeout: Duration,
    /// Maximum number of idle connections per host.
    pub max_connections_per_host: usize,
    /// User agent string.
    pub user_agent: String,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            max_connections_per_host: 100,
            user_agent: format!("snowfetch/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// One fully-specified chunk request: target, headers, and both timers.
#[derive(Debug, Clone)]
pub struct ChunkRequest {
    url: Url,
    headers: HeaderMap,
    rest_timeout: Duration,
    http_timeout: Duration,
}

impl ChunkRequest {
    /// Build a request for one result chunk.
    ///
    /// Caller-supplied `chunk_headers` are attached verbatim and replace the
    /// default encryption headers entirely; otherwise the SSE-C defaults
    /// derived from `qrmk` are used.
    pub fn for_chunk(
        url: &str,
        qrmk: &str,
        chunk_headers: Option<&HashMap<String, String>>,
        config: &RetrieverConfig,
    ) -> Result<Self> {
        let url = Url::parse(url).map_err(|e| Error::Request(format!("bad chunk URL: {}", e)))?;

        let mut headers = HeaderMap::new();
        match chunk_headers {
            Some(supplied) => {
                for (name, value) in supplied {
                    headers.insert(parse_header_name(name)?, parse_header_value(value)?);
                }
            }
            None => {
                headers.insert(
                    HeaderName::from_static(SSE_C_ALGORITHM),
                    HeaderValue::from_static(SSE_C_AES),
                );
                headers.insert(HeaderName::from_static(SSE_C_KEY), parse_header_value(qrmk)?);
            }
        }

        Ok(Self {
            url,
            headers,
            rest_timeout: config.rest_timeout,
            http_timeout: config.http_timeout,
        })
    }

    /// Build a request with explicit headers and timers, for callers outside
    /// the chunk pipeline.
    pub fn new(
        url: &str,
        headers: HeaderMap,
        rest_timeout: Duration,
        http_timeout: Duration,
    ) -> Result<Self> {
        let url = Url::parse(url).map_err(|e| Error::Request(format!("bad URL: {}", e)))?;
        Ok(Self {
            url,
            headers,
            rest_timeout,
            http_timeout,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

fn parse_header_name(name: &str) -> Result<HeaderName> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| Error::Request(format!("bad header name {:?}: {}", name, e)))
}

fn parse_header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| Error::Request(format!("bad header value {:?}: {}", value, e)))
}

/// A fully-read chunk body, plus whether the server declared gzip encoding.
#[derive(Debug, Clone)]
pub struct ChunkPayload {
    bytes: Bytes,
    gzip: bool,
}

impl ChunkPayload {
    pub fn new(bytes: Bytes, gzip: bool) -> Self {
        Self { bytes, gzip }
    }

    pub fn is_gzip(&self) -> bool {
        self.gzip
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Reader over the decoded body: a streaming gzip decoder when the
    /// response declared `Content-Encoding: gzip`, the raw bytes otherwise.
    pub fn reader(&self) -> Box<dyn Read + '_> {
        if self.gzip {
            Box::new(GzDecoder::new(self.bytes.as_ref()))
        } else {
            Box::new(self.bytes.as_ref())
        }
    }
}

/// Source of chunk payloads. The orchestrator's seam to the HTTP layer;
/// [`RestRequester`] is the production implementation.
#[async_trait]
pub trait ChunkFetcher: Send + Sync + std::fmt::Debug {
    async fn fetch_chunk(
        &self,
        request: &ChunkRequest,
        cancel: &CancellationToken,
    ) -> Result<ChunkPayload>;
}

/// HTTP executor for chunk storage requests.
///
/// Wraps a pooled `reqwest` client. Automatic content decoding is left off
/// so `Content-Encoding` is observed and decompression stays explicit.
#[derive(Debug)]
pub struct RestRequester {
    client: Client,
}

impl RestRequester {
    pub fn new(config: RestConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.max_connections_per_host)
            .user_agent(&config.user_agent)
            .build()?;

        Ok(Self { client })
    }

    /// Execute the request, returning the live response with its body
    /// unread.
    ///
    /// The external cancellation signal is merged with a local REST-timeout
    /// timer; whichever fires first aborts the call. A non-success status is
    /// reported as [`Error::Protocol`].
    pub async fn execute(
        &self,
        request: &ChunkRequest,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        debug!("GET {}", request.url);

        let send = self
            .client
            .get(request.url.clone())
            .headers(request.headers.clone())
            .timeout(request.http_timeout)
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(request.rest_timeout) => {
                return Err(self.timeout_error(request, request.rest_timeout));
            }
            result = send => result.map_err(|e| self.map_transport_error(request, e))?,
        };

        let status = response.status();
        if !status.is_success() {
            warn!("GET {} failed with HTTP {}", request.url, status);
            return Err(Error::Protocol { status });
        }

        Ok(response)
    }

    /// Execute and read the full body. The REST timer keeps running while
    /// the body streams in, so a stalled body is still reported as a
    /// timeout. This is the call the chunk downloader uses.
    pub async fn get_raw(
        &self,
        request: &ChunkRequest,
        cancel: &CancellationToken,
    ) -> Result<ChunkPayload> {
        let started = Instant::now();
        let response = self.execute(request, cancel).await?;

        let gzip = response
            .headers()
            .get(CONTENT_ENCODING)
            .map(|v| v.as_bytes().eq_ignore_ascii_case(b"gzip"))
            .unwrap_or(false);

        let remaining = request.rest_timeout.saturating_sub(started.elapsed());
        let bytes = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(remaining) => {
                return Err(self.timeout_error(request, request.rest_timeout));
            }
            body = response.bytes() => body.map_err(|e| self.map_transport_error(request, e))?,
        };

        debug!(
            "GET {} returned {} bytes in {:?} (gzip={})",
            request.url,
            bytes.len(),
            started.elapsed(),
            gzip
        );

        Ok(ChunkPayload::new(bytes, gzip))
    }

    /// Execute, read the full body, and decode it as JSON.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        request: &ChunkRequest,
        cancel: &CancellationToken,
    ) -> Result<T> {
        let payload = self.get_raw(request, cancel).await?;
        serde_json::from_reader(payload.reader())
            .map_err(|e| Error::Parse(format!("response decode failed: {}", e)))
    }

    fn timeout_error(&self, request: &ChunkRequest, timeout: Duration) -> Error {
        Error::Timeout {
            url: request.url.to_string(),
            timeout,
        }
    }

    /// Per-attempt timeouts surface from reqwest as transport errors; map
    /// them to the distinguished timeout kind.
    fn map_transport_error(&self, request: &ChunkRequest, error: reqwest::Error) -> Error {
        if error.is_timeout() {
            self.timeout_error(request, request.http_timeout)
        } else {
            Error::Transport(error)
        }
    }
}

#[async_trait]
impl ChunkFetcher for RestRequester {
    async fn fetch_chunk(
        &self,
        request: &ChunkRequest,
        cancel: &CancellationToken,
    ) -> Result<ChunkPayload> {
        self.get_raw(request, cancel).await
    }
}
