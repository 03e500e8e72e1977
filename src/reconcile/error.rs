//! Handler error taxonomy
//!
//! Splits failures by how the entry point should requeue: lock contention
//! retries fast, corrupted documents retry slow, transient backend errors
//! back off, invalid configs wait for a config change.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Another invocation holds the per-cluster lock
    #[error("lock for '{0}' is held by another invocation")]
    LockUnavailable(String),

    /// A stored document could not be decoded
    #[error("corrupted document: {0}")]
    LoadCorrupted(String),

    /// Timeouts, throttling, 5xx from a backend
    #[error(transparent)]
    BackendTransient(#[from] anyhow::Error),
}
