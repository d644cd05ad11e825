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

//! The at-most-once download unit.
//!
//! Each result chunk gets exactly one [`DeferredDownloadUnit`]. A prefetch
//! worker and the consumer may both try to resolve it; the claim gate hands
//! the [`DownloadContext`] to exactly one of them, and the other awaits the
//! stored outcome. The download-and-parse operation therefore runs exactly
//! once per chunk no matter who races for it.

use crate::error::{Error, Result};
use crate::types::ResultChunk;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Everything one chunk download needs, bundled at orchestrator
/// construction and consumed by whichever party claims the unit.
#[derive(Debug)]
pub(crate) struct DownloadContext {
    /// Target chunk; exclusively owned by the resolver while it runs.
    pub chunk: ResultChunk,
    /// Pre-signed storage URL from the chunk's descriptor.
    pub url: String,
    /// Shared per-statement decryption token.
    pub qrmk: Arc<str>,
    /// Per-chunk headers; when present they replace the default
    /// encryption headers entirely.
    pub chunk_headers: Option<Arc<HashMap<String, String>>>,
    /// Shared cancellation signal.
    pub cancel: CancellationToken,
}

/// At-most-once resolution handle for one chunk.
///
/// `try_claim` is the single-resolution gate: it hands out the context
/// exactly once. The claimant runs the download and calls `complete`;
/// everyone else observes the same outcome through `wait`.
#[derive(Debug)]
pub(crate) struct DeferredDownloadUnit {
    chunk_index: usize,
    context: Mutex<Option<DownloadContext>>,
    outcome: Mutex<Option<Result<ResultChunk>>>,
    done_tx: watch::Sender<bool>,
}

impl DeferredDownloadUnit {
    pub fn new(chunk_index: usize, context: DownloadContext) -> Self {
        let (done_tx, _) = watch::channel(false);
        Self {
            chunk_index,
            context: Mutex::new(Some(context)),
            outcome: Mutex::new(None),
            done_tx,
        }
    }

    pub fn chunk_index(&self) -> usize {
        self.chunk_index
    }

    /// Claim the unit for resolution. Returns the context exactly once;
    /// later callers get `None` and should `wait` instead.
    pub fn try_claim(&self) -> Option<DownloadContext> {
        self.context.lock().unwrap().take()
    }

    /// Record the outcome and wake every waiter. Called exactly once, by
    /// the party that claimed the context.
    pub fn complete(&self, outcome: Result<ResultChunk>) {
        *self.outcome.lock().unwrap() = Some(outcome);
        let _ = self.done_tx.send(true);
    }

    /// Await resolution and take the outcome.
    ///
    /// Only the consumer takes the outcome; workers never read it. The
    /// chunk (or the error) for a given unit is observed exactly once.
    pub async fn wait(&self) -> Result<ResultChunk> {
        let mut done_rx = self.done_tx.subscribe();
        done_rx
            .wait_for(|done| *done)
            .await
            .map_err(|_| Error::Cancelled)?;

        self.outcome
            .lock()
            .unwrap()
            .take()
            .expect("resolved unit has an outcome")
    }

    #[cfg(test)]
    pub fn is_resolved(&self) -> bool {
        *self.done_tx.subscribe().borrow()
    }
}
