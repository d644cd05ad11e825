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

//! Error types for the chunk retrieval pipeline.
//!
//! The four distinguished failure kinds callers dispatch on:
//!
//! - [`Error::Timeout`] — the per-request budget elapsed before the transport
//!   call completed (the server is slow, not broken)
//! - [`Error::Protocol`] — the storage endpoint answered with a non-success
//!   HTTP status
//! - [`Error::Parse`] — the chunk body was malformed or a row's column count
//!   did not match the result set
//! - [`Error::Cancelled`] — the shared cancellation signal fired
//!
//! Transport and I/O failures outside those kinds are carried with their
//! sources. None of these are retried inside this crate; a failure is the
//! final outcome of the affected chunk's download unit.

use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The REST timeout or the per-attempt HTTP timeout fired before the
    /// transport call completed.
    #[error("request to {url} exceeded its {timeout:?} timeout")]
    Timeout { url: String, timeout: Duration },

    /// The remote endpoint answered with a non-success status.
    #[error("chunk request failed with HTTP {status}")]
    Protocol { status: StatusCode },

    /// Malformed chunk body or column-count mismatch.
    #[error("chunk parse failed: {0}")]
    Parse(String),

    /// The shared cancellation signal fired.
    #[error("operation cancelled")]
    Cancelled,

    /// A chunk request could not be built (bad URL or header).
    #[error("invalid chunk request: {0}")]
    Request(String),

    /// Transport-level failure that is neither a timeout nor a bad status.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for [`Error::Timeout`].
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// True for [`Error::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// HTTP status for [`Error::Protocol`], if that is what this is.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Protocol { status } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_display_names_url_and_budget() {
        let err = Error::Timeout {
            url: "https://storage.example.com/chunk0".into(),
            timeout: Duration::from_secs(16),
        };
        let msg = err.to_string();
        assert!(msg.contains("chunk0"));
        assert!(msg.contains("16s"));
        assert!(err.is_timeout());
    }

    #[test]
    fn protocol_exposes_status() {
        let err = Error::Protocol {
            status: StatusCode::FORBIDDEN,
        };
        assert_eq!(err.status(), Some(StatusCode::FORBIDDEN));
        assert!(err.to_string().contains("403"));
    }

    #[test]
    fn cancelled_is_distinguished() {
        assert!(Error::Cancelled.is_cancelled());
        assert!(!Error::Cancelled.is_timeout());
    }
}
