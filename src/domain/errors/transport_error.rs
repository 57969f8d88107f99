//! Transport error types.

use thiserror::Error;

/// Failures of the underlying byte transport.
///
/// Surfaced identically to every subscriber of the failed download.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum TransportError {
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("unsupported url scheme: {scheme}")]
    UnsupportedScheme { scheme: String },

    #[error("unexpected HTTP status {status}")]
    Status { status: u16 },

    #[error("response body was empty")]
    EmptyBody,

    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {message}")]
    Connection { message: String },

    #[error("local read failed: {message}")]
    Io { message: String },
}

impl TransportError {
    /// Creates an invalid url error.
    #[must_use]
    pub fn invalid_url(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Creates a status error.
    #[must_use]
    pub const fn status(status: u16) -> Self {
        Self::Status { status }
    }

    /// Creates a connection error.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a local I/O error.
    #[must_use]
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Returns true for a 304 response, which carries no body to decode.
    #[must_use]
    pub const fn is_not_modified(&self) -> bool {
        matches!(self, Self::Status { status: 304 })
    }

    /// Returns whether retrying the same request may succeed.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::Timeout | Self::Connection { .. } => true,
            Self::Status { status } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}
