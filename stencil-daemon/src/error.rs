use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use stencil_sync::SyncError;

/// Machine-distinguishable category of an [`InvocationError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvocationErrorKind {
    InvalidPath,
    Busy,
    Cancelled,
    Internal,
}

/// Why a `sync` invocation was not accepted.
///
/// These never describe the outcome of a session that started; that outcome
/// is the terminal progress event.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InvocationError {
    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("a sync is already running for {source_key}")]
    Busy { source_key: String },

    /// The caller withdrew while queued behind another session.
    #[error("sync cancelled before it started")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl InvocationError {
    pub fn kind(&self) -> InvocationErrorKind {
        match self {
            InvocationError::InvalidPath { .. } => InvocationErrorKind::InvalidPath,
            InvocationError::Busy { .. } => InvocationErrorKind::Busy,
            InvocationError::Cancelled => InvocationErrorKind::Cancelled,
            InvocationError::Internal(_) => InvocationErrorKind::Internal,
        }
    }
}

impl From<SyncError> for InvocationError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::InvalidPath { path, reason } => InvocationError::InvalidPath { path, reason },
            SyncError::Cancelled => InvocationError::Cancelled,
            other => InvocationError::Internal(other.to_string()),
        }
    }
}

/// Error surface for the daemon runtime and its client protocol.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config error: {0}")]
    Config(#[from] stencil_core::ConfigError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("daemon protocol error: {0}")]
    Protocol(String),

    /// The daemon refused a request; carries the server-side kind.
    #[error("{message}")]
    Rejected {
        kind: InvocationErrorKind,
        message: String,
    },

    #[error("daemon is not running (socket missing: {socket})")]
    DaemonNotRunning { socket: PathBuf },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}
