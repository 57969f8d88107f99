//! Port definition for byte transports.

use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::BoxStream;

use crate::domain::errors::TransportError;

/// Stream of body chunks in arrival order.
pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// A request handed to a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// Absolute URL (`http`, `https` or `file`).
    pub url: String,
    /// Extra request headers.
    pub headers: Vec<(String, String)>,
    /// Per-request timeout overriding the transport default.
    pub timeout: Option<Duration>,
}

impl FetchRequest {
    /// Creates a plain request for the given URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
            timeout: None,
        }
    }

    /// Adds a request header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the request timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Returns the URL scheme, lowercased.
    #[must_use]
    pub fn scheme(&self) -> Option<String> {
        self.url
            .split_once("://")
            .map(|(scheme, _)| scheme.to_ascii_lowercase())
    }
}

/// An opened transport: declared size plus the body stream.
pub struct TransportResponse {
    /// Size announced by the origin, if any.
    pub expected_size: Option<u64>,
    /// Body chunks.
    pub body: ByteStream,
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResponse")
            .field("expected_size", &self.expected_size)
            .finish_non_exhaustive()
    }
}

/// Port for fetching raw bytes from an origin.
/// Implementations must be thread-safe.
#[async_trait::async_trait]
pub trait TransportPort: Send + Sync {
    /// Opens the request. Status failures must be reported here, before any
    /// body chunk is yielded.
    async fn open(&self, request: &FetchRequest) -> Result<TransportResponse, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_extraction() {
        assert_eq!(
            FetchRequest::new("HTTPS://example.com/a.png").scheme(),
            Some("https".to_string())
        );
        assert_eq!(FetchRequest::new("/no/scheme").scheme(), None);
    }
}
