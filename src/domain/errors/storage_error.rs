//! Disk storage error types.

use thiserror::Error;

/// Disk cache failures. Always absorbed: reads become misses, writes become
/// reported no-ops.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum StorageError {
    #[error("disk cache io error: {message}")]
    Io { message: String },

    #[error("disk cache index error: {message}")]
    Index { message: String },

    #[error("disk cache is corrupt: {message}")]
    Corrupt { message: String },

    #[error("disk cache worker is gone")]
    WorkerGone,
}

impl StorageError {
    /// Creates an I/O error.
    #[must_use]
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Creates an index error.
    #[must_use]
    pub fn index(message: impl Into<String>) -> Self {
        Self::Index {
            message: message.into(),
        }
    }

    /// Creates a corruption error.
    #[must_use]
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        Self::index(err.to_string())
    }
}
