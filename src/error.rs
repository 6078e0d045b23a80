//! Crate-wide error type for the public library boundary.
//!
//! Pipelines and components below this boundary mostly propagate
//! `anyhow::Error`; individual file-level failures are absorbed into
//! pipeline counters rather than surfaced here. `DlpError` is reserved for
//! the handful of conditions an embedder needs to branch on.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DlpError {
    #[error("access denied: {path}")]
    AccessDenied { path: PathBuf },

    #[error("io error on {path}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("storage backend unavailable: {0}")]
    StoreUnavailable(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl DlpError {
    pub fn from_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::PermissionDenied => DlpError::AccessDenied { path },
            _ => DlpError::IoError { path, source },
        }
    }
}

pub type Result<T> = std::result::Result<T, DlpError>;
