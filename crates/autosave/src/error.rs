//! Error types for the autosave crate.
//!
//! None of these ever reach the user as an error dialog: a failed attempt is
//! recovered by queueing the write, and surfaces only as "unsynced changes".

use std::time::Duration;
use store::StoreError;
use thiserror::Error;

/// Errors reported by a [`RemoteStore`](crate::RemoteStore) implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The backend refused the write.
    #[error("Write rejected: {0}")]
    Rejected(String),

    /// The backend could not be reached.
    #[error("Remote store unavailable: {0}")]
    Unavailable(String),

    /// Security rules denied access to the path.
    #[error("Permission denied for {0}")]
    PermissionDenied(String),

    /// The document does not exist.
    #[error("Document not found: {0}")]
    NotFound(String),
}

/// Why a remote write attempt did not complete.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The client is offline; no network call was made.
    #[error("Offline - write kept locally")]
    Offline,

    /// The attempt exceeded the configured bound.
    #[error("Remote write timed out after {0:?}")]
    Timeout(Duration),

    /// The remote store returned an error.
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// The local storage medium failed.
    #[error("Local storage error: {0}")]
    Store(#[from] StoreError),

    /// Nobody is signed in.
    #[error("Not signed in")]
    NotSignedIn,

    /// The queued item does not address a document.
    #[error("Invalid queue item: {0}")]
    InvalidItem(String),
}

impl SyncError {
    /// Failures that are expected to clear up on their own
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Offline
                | SyncError::Timeout(_)
                | SyncError::Remote(RemoteError::Unavailable(_))
        )
    }
}

/// Result type alias for autosave operations.
pub type SyncResult<T> = Result<T, SyncError>;
