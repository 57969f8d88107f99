//! Decode error types.

use thiserror::Error;

/// Failures turning bytes into pixels.
///
/// Only the final decode of a download reports these; progressive previews
/// swallow them.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum DecodeError {
    #[error("image format could not be detected")]
    UnknownFormat,

    #[error("no decoder accepts {format} data")]
    Unsupported { format: String },

    #[error("malformed image data: {message}")]
    Malformed { message: String },

    #[error("frame {index} out of range for {count} frames")]
    FrameOutOfRange { index: usize, count: usize },

    #[error("transform {transform} failed: {message}")]
    Transform { transform: String, message: String },
}

impl DecodeError {
    /// Creates a malformed data error.
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }

    /// Creates an unsupported format error.
    #[must_use]
    pub fn unsupported(format: impl Into<String>) -> Self {
        Self::Unsupported {
            format: format.into(),
        }
    }

    /// Creates a transform failure.
    #[must_use]
    pub fn transform(transform: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transform {
            transform: transform.into(),
            message: message.into(),
        }
    }
}

impl From<image::ImageError> for DecodeError {
    fn from(err: image::ImageError) -> Self {
        match err {
            image::ImageError::Unsupported(e) => Self::unsupported(e.to_string()),
            other => Self::malformed(other.to_string()),
        }
    }
}
