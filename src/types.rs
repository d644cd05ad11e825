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

//! Core data types for the chunk retrieval pipeline.
//!
//! A query whose result spills to cloud storage comes back with an ordered
//! list of [`ChunkDescriptor`]s. The downloader turns each descriptor into a
//! [`ResultChunk`] whose row storage is populated by the streaming parser.

use serde::Deserialize;
use std::time::Duration;

/// Default number of prefetch workers downloading ahead of the consumer.
pub const DEFAULT_PREFETCH_WIDTH: usize = 5;

/// Overall budget for one chunk request, headers through body.
pub const DEFAULT_REST_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Per-attempt network timeout for one chunk request.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(16);

/// Location and expected size of one result chunk, as reported by the
/// query-execution response.
///
/// Descriptors are immutable; their position in the response list is the
/// chunk's ordinal position in the result set.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkDescriptor {
    /// Pre-signed cloud storage URL for this chunk.
    pub url: String,
    /// Number of rows the chunk holds.
    #[serde(rename = "rowCount")]
    pub row_count: usize,
    /// Uncompressed payload size in bytes.
    #[serde(rename = "uncompressedSize", default)]
    pub uncompressed_size: usize,
}

/// Download progress of a [`ResultChunk`].
///
/// The state only moves forward. There is deliberately no failed state: a
/// failed download is reported through the chunk's download unit, and the
/// chunk itself is never handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DownloadState {
    NotStarted,
    InProgress,
    Success,
}

/// One parsed slice of a query result.
///
/// Exclusively owned by whichever party is resolving its download unit, and
/// read-only once handed to the consumer. Cell values are the wire format's
/// text form; `None` is SQL NULL.
#[derive(Debug)]
pub struct ResultChunk {
    chunk_index: usize,
    column_count: usize,
    rows: Vec<Vec<Option<String>>>,
    download_state: DownloadState,
}

impl ResultChunk {
    pub(crate) fn new(chunk_index: usize, column_count: usize, expected_row_count: usize) -> Self {
        Self {
            chunk_index,
            column_count,
            rows: Vec::with_capacity(expected_row_count),
            download_state: DownloadState::NotStarted,
        }
    }

    /// Ordinal position of this chunk in the result set.
    pub fn chunk_index(&self) -> usize {
        self.chunk_index
    }

    /// Number of columns in every row of this chunk.
    pub fn column_count(&self) -> usize {
        self.column_count
    }

    /// Number of rows parsed into this chunk.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Value at (`row`, `col`), or `None` for SQL NULL.
    ///
    /// # Panics
    ///
    /// Panics if `row` or `col` is out of bounds, like indexing a slice.
    pub fn cell(&self, row: usize, col: usize) -> Option<&str> {
        self.rows[row][col].as_deref()
    }

    /// Borrow one parsed row.
    pub fn row(&self, row: usize) -> &[Option<String>] {
        &self.rows[row]
    }

    pub fn download_state(&self) -> DownloadState {
        self.download_state
    }

    /// Advance the download state. The state machine only moves forward;
    /// a regression is a logic error in the resolver.
    pub(crate) fn set_state(&mut self, next: DownloadState) {
        debug_assert!(next >= self.download_state);
        self.download_state = next;
    }

    pub(crate) fn push_row(&mut self, row: Vec<Option<String>>) {
        self.rows.push(row);
    }
}

/// Tuning knobs for the chunk downloader.
#[derive(Debug, Clone)]
pub struct RetrieverConfig {
    /// Maximum number of chunks downloading ahead of consumer demand.
    /// Capped by the chunk count at construction.
    pub prefetch_width: usize,
    /// Overall request budget per chunk (headers through body).
    pub rest_timeout: Duration,
    /// Per-attempt network timeout.
    pub http_timeout: Duration,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            prefetch_width: DEFAULT_PREFETCH_WIDTH,
            rest_timeout: DEFAULT_REST_TIMEOUT,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }
}
