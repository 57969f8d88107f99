//! HTTP(S) transport over reqwest with a streamed body.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use tracing::{debug, trace};

use crate::domain::errors::TransportError;
use crate::domain::ports::{FetchRequest, TransportPort, TransportResponse};

/// Default user agent sent with every request.
pub const USER_AGENT: &str = concat!("oximage/", env!("CARGO_PKG_VERSION"));

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Streams response bodies chunk by chunk.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Creates a transport with the given default timeout and user agent.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be built.
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self, TransportError> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::connection(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Creates a transport with default settings.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be built.
    pub fn with_defaults() -> Result<Self, TransportError> {
        Self::new(DEFAULT_TIMEOUT, USER_AGENT)
    }
}

fn map_reqwest_error(err: &reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_builder() {
        let url = err.url().map(ToString::to_string).unwrap_or_default();
        TransportError::invalid_url(url, err.to_string())
    } else {
        TransportError::connection(err.to_string())
    }
}

#[async_trait]
impl TransportPort for HttpTransport {
    async fn open(&self, request: &FetchRequest) -> Result<TransportResponse, TransportError> {
        let mut builder = self.client.get(&request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        trace!(url = %request.url, "Sending request");
        let response = builder.send().await.map_err(|e| map_reqwest_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            debug!(url = %request.url, status = status.as_u16(), "Request rejected");
            return Err(TransportError::status(status.as_u16()));
        }

        let expected_size = response.content_length();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| map_reqwest_error(&e)))
            .boxed();

        Ok(TransportResponse {
            expected_size,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves one canned HTTP response and returns the base URL.
    async fn serve_once(response: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            socket.write_all(response).await.unwrap();
            socket.shutdown().await.unwrap();
        });
        format!("http://{addr}/image.png")
    }

    #[tokio::test]
    async fn test_streams_success_body() {
        let url = serve_once(
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello",
        )
        .await;
        let transport = HttpTransport::with_defaults().unwrap();

        let response = transport.open(&FetchRequest::new(url)).await.unwrap();
        assert_eq!(response.expected_size, Some(5));

        let chunks: Vec<_> = response.body.collect().await;
        let body: Vec<u8> = chunks
            .into_iter()
            .flat_map(|c| c.unwrap().to_vec())
            .collect();
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn test_non_success_status_is_error() {
        let url = serve_once(
            b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        let transport = HttpTransport::with_defaults().unwrap();

        let err = transport.open(&FetchRequest::new(url)).await.unwrap_err();
        assert_eq!(err, TransportError::status(404));
    }

    #[tokio::test]
    async fn test_not_modified_is_error() {
        let url = serve_once(b"HTTP/1.1 304 Not Modified\r\nConnection: close\r\n\r\n").await;
        let transport = HttpTransport::with_defaults().unwrap();

        let err = transport.open(&FetchRequest::new(url)).await.unwrap_err();
        assert!(err.is_not_modified());
    }
}
