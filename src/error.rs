//! Error types surfaced by the resource manager.

use thiserror::Error;

/// Errors surfaced by the resource manager and per-tablet handles.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// Fatal configuration problem detected at startup or registration time.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// The tablet handle was used after it was closed.
    #[error("tablet resources already closed")]
    AlreadyClosed,
    /// Close was attempted while scan files were still reserved.
    #[error("tried to close while open files reserved")]
    OpenFilesReserved,
    /// A writer waited out the RPC timeout while commits were held.
    #[error("commits are held (waited {held_ms} ms)")]
    HoldTimeout {
        /// How long the writer waited before giving up.
        held_ms: u64,
    },
    /// A task was submitted to a pool that has been shut down.
    #[error("task pool {0} is shut down")]
    PoolClosed(String),
}
