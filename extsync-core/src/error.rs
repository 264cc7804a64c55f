//! Error types for extsync-core.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Coarse failure classification shared by every extsync operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Missing extension, file or path.
    NotFound,
    /// A path escapes the extension root.
    SecurityViolation,
    /// Pack, unpack, copy, rename or download failure.
    IoFailure,
    /// Digest computation failed for a specific file.
    ChecksumFailure,
    /// A peer reported failure or answered with garbage.
    RemoteFailure,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::SecurityViolation => "security violation",
            ErrorKind::IoFailure => "I/O failure",
            ErrorKind::ChecksumFailure => "checksum failure",
            ErrorKind::RemoteFailure => "remote failure",
        };
        f.write_str(label)
    }
}

/// All errors that can arise from sync operations.
///
/// `Display` output is the operator-facing reason.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A path, file or extension does not exist (or failed permission checks).
    #[error("not found: {what}")]
    NotFound { what: String },

    /// A requested path resolves outside the directory it must stay in.
    #[error("path {path} escapes {root}")]
    SecurityViolation { path: PathBuf, root: PathBuf },

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An I/O-class failure without a single underlying `io::Error`
    /// (codec reported failure, lying transport, timeout).
    #[error("{0}")]
    IoFailure(String),

    /// Digest computation failed for one file; no partial map is returned.
    #[error("failed to compute checksum of {path}: {source}")]
    Checksum {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A peer answered with a failure.
    #[error("{peer}: {message}")]
    Remote { peer: String, message: String },

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::NotFound { .. } => ErrorKind::NotFound,
            SyncError::SecurityViolation { .. } => ErrorKind::SecurityViolation,
            SyncError::Io { .. } | SyncError::IoFailure(_) | SyncError::Json(_) => {
                ErrorKind::IoFailure
            }
            SyncError::Checksum { .. } => ErrorKind::ChecksumFailure,
            SyncError::Remote { .. } => ErrorKind::RemoteFailure,
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        SyncError::NotFound { what: what.into() }
    }
}

/// Convenience constructor for [`SyncError::Io`].
pub fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}

/// Errors from loading or saving [`crate::SyncConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML serialization error (save path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// YAML parse error on load, with the offending file.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// A loaded value is out of range.
    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
