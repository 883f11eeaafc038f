//! Error types for stencil-sync.

use std::path::PathBuf;

use thiserror::Error;

use stencil_core::TemplateName;

/// All errors that can arise from validating, scanning or writing a cache.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The source path is malformed or unreachable. Raised before any session
    /// exists.
    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    /// Catalog enumeration failed after the session started.
    #[error("source unreachable at {location}: {reason}")]
    SourceUnreachable { location: String, reason: String },

    /// A template failed to materialize; staging was discarded and the live
    /// cache is untouched.
    #[error("failed to materialize '{entry}' after {completed}/{total} entries (rolled back): {source}")]
    PartialWrite {
        entry: TemplateName,
        completed: usize,
        total: usize,
        #[source]
        source: Box<SyncError>,
    },

    /// The cancellation token fired; any staged work was discarded.
    #[error("sync cancelled")]
    Cancelled,

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization error (manifest).
    #[error("manifest JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }

    pub(crate) fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        SyncError::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}
