//! Error types for index queries and content retrieval.

use std::io;
use thiserror::Error;

/// Errors that can occur while querying capture indexes or fetching content.
///
/// A deleted replay capture is not an error: content fetches report it as
/// `Ok(None)` so batch jobs can keep going.
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// I/O error during file operations.
    #[error(transparent)]
    IoError(#[from] io::Error),

    /// HTTP transport error.
    #[error(transparent)]
    ReqwestError(#[from] reqwest::Error),

    /// JSON serialization/deserialization error.
    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),

    /// Caller-supplied or recorded value failed validation.
    ///
    /// Never retried.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Upstream data does not follow the expected protocol or container format.
    #[error("Upstream protocol error: {0}")]
    Protocol(String),

    /// Upstream answered with a non-success status.
    #[error("HTTP {status} from {url}")]
    Http {
        /// Requested URL.
        url: String,
        /// Response status code.
        status: u16,
    },
}

impl ArchiveError {
    /// Whether a retry could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ArchiveError::Http { status, .. } => *status >= 500,
            ArchiveError::ReqwestError(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}
