//! Error types for warden-core operations.

use std::path::PathBuf;

/// All errors that can occur in warden-core operations.
#[derive(Debug, thiserror::Error)]
pub enum WardenError {
    #[error("home directory not found")]
    HomeDirNotFound,

    #[error("configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("storage error: {context}: {source}")]
    Store {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("broker error: {0}")]
    Broker(String),

    #[error("unknown worker: {0}")]
    UnknownWorker(String),

    #[error("failed to launch worker {worker} after {attempts} attempts")]
    LaunchFailed { worker: String, attempts: u32 },
}

impl WardenError {
    pub fn store(context: impl Into<String>, source: rusqlite::Error) -> Self {
        WardenError::Store {
            context: context.into(),
            source,
        }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        WardenError::Io {
            context: context.into(),
            source,
        }
    }
}

/// Convenience type alias for Results using WardenError.
pub type Result<T> = std::result::Result<T, WardenError>;
