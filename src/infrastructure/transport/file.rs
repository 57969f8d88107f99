//! Local file transport reading `file://` URLs in chunks.

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::BytesMut;
use futures_util::{StreamExt, stream};
use tokio::io::AsyncReadExt;
use tracing::trace;

use crate::domain::errors::TransportError;
use crate::domain::ports::{FetchRequest, TransportPort, TransportResponse};

/// Default read size per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Streams local files so they flow through the same progress path as
/// downloads.
#[derive(Debug, Clone, Copy)]
pub struct FileTransport {
    chunk_size: usize,
}

impl FileTransport {
    /// Creates a transport reading `chunk_size` bytes at a time.
    #[must_use]
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }
}

impl Default for FileTransport {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

fn file_path(url: &str) -> Result<PathBuf, TransportError> {
    url.strip_prefix("file://")
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
        .ok_or_else(|| TransportError::invalid_url(url, "expected a file:// url"))
}

#[async_trait]
impl TransportPort for FileTransport {
    async fn open(&self, request: &FetchRequest) -> Result<TransportResponse, TransportError> {
        let path = file_path(&request.url)?;
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| TransportError::io(format!("{}: {e}", path.display())))?;
        let expected_size = file.metadata().await.ok().map(|m| m.len());

        trace!(path = %path.display(), size = ?expected_size, "Opened local file");

        let chunk_size = self.chunk_size;
        let body = stream::unfold(Some(file), move |state| async move {
            let mut file = state?;
            let mut buf = BytesMut::with_capacity(chunk_size);
            match file.read_buf(&mut buf).await {
                Ok(0) => None,
                Ok(_) => Some((Ok(buf.freeze()), Some(file))),
                Err(e) => Some((Err(TransportError::io(e.to_string())), None)),
            }
        })
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
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_reads_file_in_chunks() {
        let mut file = NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, &[42u8; 10]).unwrap();
        let url = format!("file://{}", file.path().display());

        let response = FileTransport::new(4)
            .open(&FetchRequest::new(url))
            .await
            .unwrap();
        assert_eq!(response.expected_size, Some(10));

        let chunks: Vec<_> = response.body.map(|c| c.unwrap().len()).collect().await;
        assert_eq!(chunks.iter().sum::<usize>(), 10);
        assert!(chunks.iter().all(|&len| len <= 4));
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let err = FileTransport::default()
            .open(&FetchRequest::new("file:///definitely/not/here.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Io { .. }));
    }

    #[test]
    fn test_rejects_non_file_url() {
        assert!(file_path("https://example.com/a.png").is_err());
        assert!(file_path("file://").is_err());
    }
}
