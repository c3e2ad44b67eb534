//! Storage error taxonomy shared by every layer of the engine.

use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the storage and memory layers.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors surfaced by the coordinator and the memory layers.
///
/// Degraded analytical/similarity backends are recovered internally (fallback
/// plus retry queue) and only show up in the observability counters; they are
/// deliberately absent from this enum.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The record store is unreachable or corrupt. Aborts the operation and
    /// is never retried automatically.
    #[error("record store failure: {0}")]
    Fatal(String),

    /// An optimistic write lost the race for its key past the retry budget.
    /// The caller may re-issue the operation.
    #[error("write for key '{key}' lost optimistic race after {attempts} attempt(s)")]
    Contention { key: String, attempts: u32 },

    /// The requested record or snapshot does not exist. A valid outcome for
    /// reads; layers translate it where absence has domain meaning.
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation deadline elapsed before completion. Any partially
    /// acquired connection has already been released.
    #[error("operation deadline of {0:?} exceeded")]
    Timeout(Duration),

    /// Malformed payload or a kind mismatch, rejected before any backend
    /// call was made.
    #[error("validation failed: {0}")]
    Validation(String),
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Fatal(e.to_string())
    }
}

impl From<r2d2::Error> for StorageError {
    fn from(e: r2d2::Error) -> Self {
        StorageError::Fatal(format!("connection pool error: {}", e))
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Fatal(format!("io error: {}", e))
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Validation(format!("payload serialization: {}", e))
    }
}

impl From<bincode::Error> for StorageError {
    fn from(e: bincode::Error) -> Self {
        StorageError::Fatal(format!("binary encoding: {}", e))
    }
}

impl StorageError {
    /// True when the caller may usefully re-issue the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Contention { .. } | StorageError::Timeout(_))
    }
}
