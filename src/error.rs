//! Error taxonomy for the playback core.
//!
//! Fetch and parse failures are recovered by the manifest watcher, prepare
//! failures by the orchestrator's skip-with-backoff. None of them stop the
//! process.

use thiserror::Error;

/// Retrieving the manifest from the remote source failed.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("manifest request failed: {0}")]
    Request(#[source] reqwest::Error),

    #[error("manifest server returned {status}")]
    Status { status: reqwest::StatusCode },

    #[error("failed to read manifest body: {0}")]
    Body(#[source] reqwest::Error),

    #[error("invalid manifest url {url:?}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
}

/// The manifest bytes do not describe a usable playlist.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed manifest: {0}")]
    Json(#[from] serde_json::Error),

    #[error("manifest contains no items")]
    Empty,

    #[error("item {position} has an empty id")]
    EmptyId { position: usize },

    #[error("duplicate item id {id:?}")]
    DuplicateId { id: String },

    #[error("item {id:?} has a non-positive display time")]
    InvalidDisplayTime { id: String },
}

/// A single item could not be made ready on its surface.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PrepareError {
    #[error("item {id:?} has no remote url and no local copy")]
    NoSource { id: String },

    #[error("item {id:?} has an invalid url {uri:?}")]
    InvalidUri { id: String, uri: String },

    #[error("renderer failed: {0}")]
    Renderer(String),

    #[error("item {id:?} was not ready after {seconds}s")]
    TimedOut { id: String, seconds: u64 },
}
