//! Error types for user-record storage.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during storage operations.
///
/// Storage failures are non-fatal to the session engine: a failed read falls
/// back to defaults and a failed write is retried at the next natural write
/// opportunity.
#[derive(Debug, Error)]
pub enum StorageError {
    /// I/O error during file operations.
    #[error("I/O error at {path}: {source}")]
    FileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Error deserializing file contents.
    #[error("deserialization error at {path}: {message}")]
    FileDeserialization { path: PathBuf, message: String },

    /// Error serializing data.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// Create a file I/O error with path context.
    pub fn file_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileIo {
            path: path.into(),
            source,
        }
    }

    /// Create a file deserialization error with path context.
    pub fn file_deserialization(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::FileDeserialization {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }
}

/// Convenience type alias for storage results.
pub type StorageResult<T> = Result<T, StorageError>;
