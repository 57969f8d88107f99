//! Errors returned by the image loader.

use thiserror::Error;

use super::{DecodeError, TransportError};

/// Why an image could not be delivered.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum LoadError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("load was cancelled")]
    Cancelled,

    #[error("image not cached and network access disabled")]
    NotCached,

    #[error("invalid resource: {reason}")]
    InvalidResource { reason: String },
}

impl LoadError {
    /// Creates an invalid resource error.
    #[must_use]
    pub fn invalid_resource(reason: impl Into<String>) -> Self {
        Self::InvalidResource {
            reason: reason.into(),
        }
    }

    /// Returns whether error is network related.
    #[must_use]
    pub const fn is_network_error(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}
