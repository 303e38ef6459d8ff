#![forbid(unsafe_code)]
//! Error types for the page swapper workspace.
//!
//! Defines `SwapError` and a `Result<T>` alias used throughout. The
//! closed-channel variant is the pivot of the swapper's recovery protocol:
//! it is the only error class that is retried (by reopening the affected
//! channel stripe); everything else propagates to the caller.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Unified error type for all swapper operations.
#[derive(Debug, Error)]
pub enum SwapError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The channel backing a stripe is closed.
    ///
    /// Raised both for channels closed underneath in-flight I/O (thread
    /// interruption) and for operations attempted after the swapper was
    /// explicitly closed. When a reopen attempt itself failed, that failure
    /// rides along as the source.
    #[error("channel for '{}' is closed", path.display())]
    ClosedChannel {
        path: PathBuf,
        #[source]
        source: Option<Box<SwapError>>,
    },

    /// The closed-channel reopen/retry budget was exhausted.
    #[error("I/O on '{}' failed due to interruption after {attempts} reopen attempts", path.display())]
    Interrupted {
        path: PathBuf,
        attempts: u32,
        #[source]
        cause: Box<SwapError>,
    },

    /// The exclusive region lock could not be taken at construction.
    ///
    /// `cause` is `None` when the lock was simply held elsewhere, and the
    /// platform error otherwise.
    #[error("failed to acquire exclusive file lock on '{}'", path.display())]
    FileLock {
        path: PathBuf,
        #[source]
        cause: Option<io::Error>,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    /// Aggregated close failure: the first failure is the source, the rest
    /// are retained in `suppressed`.
    #[error("failed to close {failed} of {total} channel stripes for '{}'", path.display())]
    CloseChannels {
        path: PathBuf,
        failed: usize,
        total: usize,
        #[source]
        cause: Box<SwapError>,
        suppressed: Vec<SwapError>,
    },
}

impl SwapError {
    /// Whether this is a closed-channel class failure, eligible for the
    /// swapper's reopen/retry protocol.
    #[must_use]
    pub fn is_closed_channel(&self) -> bool {
        matches!(self, Self::ClosedChannel { .. })
    }
}

/// Result alias using `SwapError`.
pub type Result<T> = std::result::Result<T, SwapError>;
