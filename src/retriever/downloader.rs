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

//! Download orchestration for result chunks.
//!
//! [`ChunkDownloader`] turns an ordered descriptor list into a
//! strictly-ordered stream of parsed [`ResultChunk`]s. At construction it
//! builds one [`DeferredDownloadUnit`] per chunk and feeds them all, in
//! order, to a bounded pool of prefetch workers that resolve units ahead of
//! consumer demand. The consumer walks the same units in order through
//! [`ChunkDownloader::next_chunk`], resolving on demand any unit no worker
//! has reached yet.
//!
//! ## Ordering
//!
//! Workers finish in whatever order the network allows; delivery order never
//! depends on it. The consumer's cursor walks the original descriptor order,
//! and the at-most-once unit makes the worker/consumer race harmless:
//! whoever claims a unit resolves it, everyone else awaits the same outcome.
//!
//! ## Failure isolation
//!
//! A failed resolution is stored as the unit's outcome and logged; it never
//! unwinds the worker task. The consumer sees the error when its cursor
//! reaches the failed position, and later chunks remain deliverable.

use crate::error::Result;
use crate::rest::{ChunkFetcher, ChunkRequest};
use crate::retriever::parser::parse_chunk_into;
use crate::retriever::unit::{DeferredDownloadUnit, DownloadContext};
use crate::types::{ChunkDescriptor, DownloadState, ResultChunk, RetrieverConfig};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Orchestrates bounded prefetch of result chunks and their strictly-ordered
/// delivery.
///
/// Must be constructed inside a Tokio runtime; the prefetch workers are
/// spawned during construction.
#[derive(Debug)]
pub struct ChunkDownloader {
    units: Vec<Arc<DeferredDownloadUnit>>,
    next_index: usize,
    fetcher: Arc<dyn ChunkFetcher>,
    config: RetrieverConfig,
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl ChunkDownloader {
    /// Build the downloader and start prefetching.
    ///
    /// One chunk and one download unit are created per descriptor, in
    /// descriptor order. `min(config.prefetch_width, descriptor count)`
    /// worker tasks begin resolving units immediately.
    pub fn new(
        column_count: usize,
        descriptors: Vec<ChunkDescriptor>,
        qrmk: impl Into<Arc<str>>,
        chunk_headers: Option<HashMap<String, String>>,
        cancel: CancellationToken,
        fetcher: Arc<dyn ChunkFetcher>,
        config: RetrieverConfig,
    ) -> Self {
        let qrmk: Arc<str> = qrmk.into();
        let chunk_headers = chunk_headers.map(Arc::new);

        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let mut units = Vec::with_capacity(descriptors.len());

        for (chunk_index, descriptor) in descriptors.into_iter().enumerate() {
            let context = DownloadContext {
                chunk: ResultChunk::new(chunk_index, column_count, descriptor.row_count),
                url: descriptor.url,
                qrmk: Arc::clone(&qrmk),
                chunk_headers: chunk_headers.clone(),
                cancel: cancel.clone(),
            };
            let unit = Arc::new(DeferredDownloadUnit::new(chunk_index, context));

            // Receiver outlives the loop, so this send cannot fail.
            let _ = work_tx.send(Arc::clone(&unit));
            units.push(unit);
        }

        // Dropping the sender closes the work channel once drained, which
        // is what stops the workers.
        drop(work_tx);

        let worker_count = config.prefetch_width.min(units.len());
        debug!(
            "Starting chunk downloader: {} chunks, {} prefetch workers",
            units.len(),
            worker_count
        );

        let workers = spawn_prefetch_workers(
            work_rx,
            worker_count,
            Arc::clone(&fetcher),
            config.clone(),
            cancel.clone(),
        );

        Self {
            units,
            next_index: 0,
            fetcher,
            config,
            cancel,
            workers,
        }
    }

    /// Number of chunks in the result set.
    pub fn chunk_count(&self) -> usize {
        self.units.len()
    }

    /// Deliver the next chunk in descriptor order, or `None` once the
    /// sequence is drained.
    ///
    /// If no worker has reached the head unit yet, the consumer claims and
    /// resolves it here, so progress never depends on the pool keeping up.
    /// A failed resolution surfaces as the error for this position; calling
    /// again moves on to the next chunk.
    pub async fn next_chunk(&mut self) -> Result<Option<ResultChunk>> {
        let Some(unit) = self.units.get(self.next_index).cloned() else {
            return Ok(None);
        };
        self.next_index += 1;

        resolve_unit(&unit, &self.fetcher, &self.config).await;
        let chunk = unit.wait().await?;
        trace!(
            "Delivered chunk {} ({} rows)",
            chunk.chunk_index(),
            chunk.row_count()
        );
        Ok(Some(chunk))
    }

    /// Fire the shared cancellation signal: workers stop pulling new work
    /// and in-flight requests abort. Already-resolved chunks remain
    /// deliverable.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Handles of the prefetch worker tasks, for shutdown sequencing.
    pub fn worker_handles(&mut self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut self.workers)
    }
}

/// Resolve a unit if nobody has claimed it yet, storing the outcome.
/// A no-op when the unit is already claimed or resolved.
async fn resolve_unit(
    unit: &Arc<DeferredDownloadUnit>,
    fetcher: &Arc<dyn ChunkFetcher>,
    config: &RetrieverConfig,
) {
    let Some(context) = unit.try_claim() else {
        return;
    };

    let outcome = download_chunk(context, fetcher, config).await;
    if let Err(ref e) = outcome {
        warn!("Chunk {} download failed: {}", unit.chunk_index(), e);
    }
    unit.complete(outcome);
}

/// Download and parse one chunk. Runs with exclusive ownership of the
/// chunk; the claim gate guarantees a single caller.
async fn download_chunk(
    mut context: DownloadContext,
    fetcher: &Arc<dyn ChunkFetcher>,
    config: &RetrieverConfig,
) -> Result<ResultChunk> {
    context.chunk.set_state(DownloadState::InProgress);

    let request = ChunkRequest::for_chunk(
        &context.url,
        &context.qrmk,
        context.chunk_headers.as_deref(),
        config,
    )?;

    let payload = fetcher.fetch_chunk(&request, &context.cancel).await?;
    parse_chunk_into(payload.reader(), &mut context.chunk)?;

    context.chunk.set_state(DownloadState::Success);
    Ok(context.chunk)
}

/// Launch the fixed pool of long-lived prefetch workers. Each loops over
/// the shared work channel until it drains or cancellation is observed.
fn spawn_prefetch_workers(
    work_rx: mpsc::UnboundedReceiver<Arc<DeferredDownloadUnit>>,
    worker_count: usize,
    fetcher: Arc<dyn ChunkFetcher>,
    config: RetrieverConfig,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));
    let mut handles = Vec::with_capacity(worker_count);

    for worker_id in 0..worker_count {
        let rx = Arc::clone(&work_rx);
        let fetcher = Arc::clone(&fetcher);
        let config = config.clone();
        let token = cancel.clone();

        handles.push(tokio::spawn(async move {
            worker_task(worker_id, rx, fetcher, config, token).await;
        }));
    }

    handles
}

/// One prefetch worker: pull the next unit, resolve it if unclaimed,
/// repeat. Resolution failures are captured in the unit outcome and never
/// unwind the task.
async fn worker_task(
    worker_id: usize,
    work_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Arc<DeferredDownloadUnit>>>>,
    fetcher: Arc<dyn ChunkFetcher>,
    config: RetrieverConfig,
    cancel: CancellationToken,
) {
    debug!("Prefetch worker {} started", worker_id);

    loop {
        if cancel.is_cancelled() {
            debug!("Prefetch worker {} cancelled", worker_id);
            break;
        }

        let unit = {
            let mut rx = work_rx.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Prefetch worker {} cancelled while waiting", worker_id);
                    return;
                }
                unit = rx.recv() => unit,
            }
        };

        let Some(unit) = unit else {
            debug!("Prefetch worker {} exiting: work queue drained", worker_id);
            break;
        };

        trace!(
            "Prefetch worker {} resolving chunk {}",
            worker_id,
            unit.chunk_index()
        );
        resolve_unit(&unit, &fetcher, &config).await;
    }
}
