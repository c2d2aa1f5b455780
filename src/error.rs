//! Error types for the mrepo-cache library.

use thiserror::Error;

/// A single asset that could not be written into a new store.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FileError {
    /// Manifest path of the asset.
    pub path: String,
    /// Human-readable reason.
    pub error: String,
}

/// Errors that can occur during cache operations.
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error during store operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON in a manifest or store descriptor.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid or inconsistent configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The origin could not be reached at all.
    #[error("Origin unreachable: {0}")]
    Unreachable(String),

    /// The origin answered with a non-success status.
    #[error("Unexpected status {status} for {url}")]
    Status {
        /// Requested URL.
        url: String,
        /// Status code returned.
        status: u16,
    },

    /// One or more files failed while populating a store; the store was discarded.
    #[error("Population of {store} failed for {} file(s)", errors.len())]
    Population {
        /// Name of the discarded store.
        store: String,
        /// Per-file failures.
        errors: Vec<FileError>,
    },

    /// A URL could not be parsed or resolved.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

/// A specialized `Result` type for mrepo-cache operations.
pub type Result<T> = std::result::Result<T, Error>;
