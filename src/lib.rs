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

//! Result-chunk retrieval pipeline for cloud-hosted SQL result sets.
//!
//! Large query results arrive as a list of chunk descriptors pointing at
//! cloud storage. This crate downloads those chunks concurrently within a
//! bounded prefetch window, decompresses and parses each one as it streams
//! in, and delivers parsed [`ResultChunk`]s to the consumer in strict
//! descriptor order regardless of download completion order.
//!
//! The entry point is [`ChunkDownloader`]; [`RestRequester`] is the
//! production [`ChunkFetcher`] behind it.
//!
//! ```no_run
//! use snowfetch::{
//!     ChunkDescriptor, ChunkDownloader, RestConfig, RestRequester, RetrieverConfig,
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(descriptors: Vec<ChunkDescriptor>, qrmk: String) -> snowfetch::Result<()> {
//! let requester = Arc::new(RestRequester::new(RestConfig::default())?);
//! let mut downloader = ChunkDownloader::new(
//!     3,
//!     descriptors,
//!     qrmk,
//!     None,
//!     CancellationToken::new(),
//!     requester,
//!     RetrieverConfig::default(),
//! );
//! while let Some(chunk) = downloader.next_chunk().await? {
//!     for row in 0..chunk.row_count() {
//!         let _first = chunk.cell(row, 0);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod logging;
pub mod rest;
pub mod retriever;
pub mod types;

pub use error::{Error, Result};
pub use logging::{init_logging, LogConfig};
pub use rest::{ChunkFetcher, ChunkPayload, ChunkRequest, RestConfig, RestRequester};
pub use retriever::ChunkDownloader;
pub use types::{
    ChunkDescriptor, DownloadState, ResultChunk, RetrieverConfig, DEFAULT_HTTP_TIMEOUT,
    DEFAULT_PREFETCH_WIDTH, DEFAULT_REST_TIMEOUT,
};
