use thiserror::Error;

use extsync_core::{ErrorKind, SyncError};

/// Error surface for signing, distribution and the peer command handler.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("signing error: {0}")]
    Signing(String),

    #[error("invalid download URL: {0}")]
    InvalidUrl(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClusterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClusterError::Sync(err) => err.kind(),
            ClusterError::Signing(_) => ErrorKind::IoFailure,
            ClusterError::InvalidUrl(_) => ErrorKind::SecurityViolation,
            ClusterError::Transport(_) | ClusterError::Json(_) => ErrorKind::RemoteFailure,
        }
    }
}
