//! Unified error type for the storage layer
//!
//! Wraps shard-store, codec, and lifecycle errors while preserving enough
//! structure for the boundary adapters to pick a status code.

use thiserror::Error;

use super::types::CodecError;

/// Unified error type for datastore operations
#[derive(Error, Debug)]
pub enum DataError {
    /// Embedded key/value store failure
    #[error("Shard store error: {0}")]
    Store(#[from] fjall::Error),

    /// Span codec failure while reading a primary record
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// A single span was rejected at ingest (zero id)
    #[error("Bad span: {0}")]
    BadSpan(String),

    /// A query could not be parsed or planned
    #[error("Bad query: {0}")]
    BadQuery(String),

    /// Shard set failed validation at load time
    #[error("{0}")]
    LoadMismatch(String),

    /// Two configured shards resolve to the same directory
    #[error("Shard directory {path} is already held by process.")]
    LockConflict { path: String },

    /// Query deadline exceeded
    #[error("Query deadline exceeded after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    /// The datastore is shutting down and no longer accepts work
    #[error("Datastore is shut down")]
    ShutDown,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DataError {
    pub fn load_mismatch(msg: impl Into<String>) -> Self {
        Self::LoadMismatch(msg.into())
    }

    pub fn bad_query(msg: impl Into<String>) -> Self {
        Self::BadQuery(msg.into())
    }

    /// Whether this error is the caller's fault (maps to a 400).
    pub fn is_bad_request(&self) -> bool {
        matches!(self, Self::BadSpan(_) | Self::BadQuery(_))
    }
}
