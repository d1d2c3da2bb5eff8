//! Error types for the frame synchronization core

use thiserror::Error;

/// Errors returned at the public call boundary
///
/// Nothing inside a running wait loop produces one of these: loop-side failures
/// (renderer errors, stale wakes) are logged and absorbed there.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Payload does not match the session's fixed frame length
    #[error("Frame length mismatch: expected {expected} bytes, got {actual}")]
    FrameLengthMismatch { expected: usize, actual: usize },

    /// Scale factor must be a finite integer >= 1
    #[error("Scale factor must be a positive integer, got {0}")]
    InvalidScaleFactor(f64),

    /// View dimensions must be non-zero
    #[error("Invalid view size: {width}x{height}")]
    InvalidViewSize { width: u32, height: u32 },

    /// Configuration rejected by validation
    #[error("Invalid sync config: {0}")]
    InvalidConfig(String),

    /// The hub (or consumer) has already been torn down
    #[error("Synchronization hub has been shut down")]
    ShutDown,

    /// An execution context (thread) could not be created
    #[error("Failed to spawn execution context: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Result type for synchronization operations
pub type SyncResult<T> = Result<T, SyncError>;
