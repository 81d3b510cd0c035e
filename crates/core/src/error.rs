//! Unified error types for rescache.
//!
//! Fetch failures are not reported through this type; they reach consumers
//! as [`crate::llcache::CacheEvent::Error`] through the handle callback.

use std::collections::TryReserveError;

use tokio_rusqlite::rusqlite;

/// Unified error type for the cache, its backing stores and transports.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A URL could not be parsed or joined.
    #[error("INVALID_URL: {0}")]
    InvalidUrl(String),

    /// No transport is able to fetch the URL.
    #[error("NO_FETCH_HANDLER: {0}")]
    NoFetchHandler(String),

    /// Allocation of a source buffer failed.
    #[error("NOMEM: {0}")]
    OutOfMemory(String),

    /// The backing store has no entry for the URL.
    #[error("NOT_FOUND: {0}")]
    NotFound(String),

    /// Stored metadata could not be parsed.
    #[error("INVALID_METADATA: line {line}: {reason}")]
    InvalidMetadata { line: usize, reason: String },

    /// Stored metadata belongs to a different URL (backing store key collision).
    #[error("METADATA_COLLISION: got {found} instead of {expected}")]
    MetadataUrlMismatch { expected: String, found: String },

    /// The handle does not refer to a live user.
    #[error("INVALID_HANDLE: {0}")]
    InvalidHandle(u64),

    /// The transport refused to start a fetch.
    #[error("FETCH_START: {0}")]
    FetchStart(String),

    /// A consumer callback reported a failure.
    #[error("CALLBACK: {0}")]
    Callback(String),

    /// The backing store is unavailable or failed.
    #[error("BACKING_STORE: {0}")]
    BackingStore(String),

    /// Database operation failed.
    #[error("CACHE_ERROR: {0}")]
    Database(rusqlite::Error),

    /// Migration failed to apply.
    #[error("CACHE_ERROR: migration failed: {0}")]
    MigrationFailed(String),
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(err)
    }
}

impl From<TryReserveError> for Error {
    fn from(err: TryReserveError) -> Self {
        Error::OutOfMemory(err.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::InvalidUrl(err.to_string())
    }
}
