//! Error types shared by the tree model, replicator and protocol layers.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while snapshotting, copying or synchronizing a tree.
///
/// Every variant describes the failure of a single unit of work (one file,
/// one directory, one connection). Callers record it and carry on with
/// sibling units.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Path does not exist, cannot be inspected or cannot be listed.
    #[error("cannot access {path}: {source}")]
    Access {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Destination kind conflicts with the source kind.
    #[error("type mismatch at {path}: source is a {source_kind}, destination is not")]
    TypeMismatch {
        path: PathBuf,
        source_kind: &'static str,
    },

    /// Read, write or create failure on an otherwise valid path.
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Peer closed the connection or errored mid-message.
    #[error("peer disconnected: {0}")]
    ProtocolDisconnect(String),

    /// Malformed message on the wire.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Aggregate failure of a subtree.
    #[error("{failed} unit(s) failed under {path}")]
    TransferFailure { path: PathBuf, failed: u64 },

    /// Path does not fit in the fixed-width wire field.
    #[error("path too long for wire format ({len} bytes, max {max}): {path}")]
    PathTooLong { path: String, len: usize, max: usize },

    /// Path would escape the destination root.
    #[error("path rejected: {0}")]
    PathRejected(String),

    /// Another transfer already writes to this destination path.
    #[error("destination busy: {0}")]
    Busy(PathBuf),

    #[error("block size must be between 1 and {max}, got {got}")]
    InvalidBlockSize { got: usize, max: usize },
}

impl SyncError {
    pub fn access(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Access {
            path: path.into(),
            source,
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn mismatch(path: impl Into<PathBuf>, source_kind: &'static str) -> Self {
        Self::TypeMismatch {
            path: path.into(),
            source_kind,
        }
    }

    pub fn is_type_mismatch(&self) -> bool {
        matches!(self, Self::TypeMismatch { .. })
    }
}

/// Result type for library operations.
pub type Result<T> = std::result::Result<T, SyncError>;
