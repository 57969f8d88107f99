//! Byte transports: HTTP(S), local files, and a scheme router over both.

mod file;
mod http;

use std::sync::Arc;

use async_trait::async_trait;

pub use file::{DEFAULT_CHUNK_SIZE, FileTransport};
pub use http::{DEFAULT_TIMEOUT, HttpTransport, USER_AGENT};

use crate::domain::errors::TransportError;
use crate::domain::ports::{FetchRequest, TransportPort, TransportResponse};

/// Routes `file` URLs to one transport and `http`/`https` to another.
#[derive(Clone)]
pub struct SchemeTransport {
    http: Arc<dyn TransportPort>,
    file: Arc<dyn TransportPort>,
}

impl SchemeTransport {
    /// Creates a router over the given transports.
    #[must_use]
    pub fn new(http: Arc<dyn TransportPort>, file: Arc<dyn TransportPort>) -> Self {
        Self { http, file }
    }

    /// Creates a router over the default HTTP and file transports.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be built.
    pub fn with_defaults() -> Result<Self, TransportError> {
        Ok(Self::new(
            Arc::new(HttpTransport::with_defaults()?),
            Arc::new(FileTransport::default()),
        ))
    }
}

impl std::fmt::Debug for SchemeTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemeTransport").finish_non_exhaustive()
    }
}

#[async_trait]
impl TransportPort for SchemeTransport {
    async fn open(&self, request: &FetchRequest) -> Result<TransportResponse, TransportError> {
        match request.scheme().as_deref() {
            Some("http" | "https") => self.http.open(request).await,
            Some("file") => self.file.open(request).await,
            Some(other) => Err(TransportError::UnsupportedScheme {
                scheme: other.to_string(),
            }),
            None => Err(TransportError::invalid_url(&request.url, "missing scheme")),
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use futures_util::{StreamExt, stream};

    use crate::domain::errors::TransportError;
    use crate::domain::ports::{FetchRequest, TransportPort, TransportResponse};

    /// Transport replaying fixed chunks, or one fixed failure.
    pub(crate) struct ScriptedTransport {
        chunks: Vec<Bytes>,
        delay: Duration,
        failure: Option<TransportError>,
        opens: AtomicUsize,
    }

    impl ScriptedTransport {
        /// Streams `chunks` with `delay` before each.
        pub(crate) fn new(chunks: Vec<&'static [u8]>, delay: Duration) -> Self {
            Self {
                chunks: chunks.into_iter().map(Bytes::from_static).collect(),
                delay,
                failure: None,
                opens: AtomicUsize::new(0),
            }
        }

        /// Streams `data` split into `chunk`-sized pieces.
        pub(crate) fn from_bytes(data: &[u8], chunk: usize, delay: Duration) -> Self {
            Self {
                chunks: data.chunks(chunk).map(Bytes::copy_from_slice).collect(),
                delay,
                failure: None,
                opens: AtomicUsize::new(0),
            }
        }

        /// Fails every open with `error`.
        pub(crate) fn failing(error: TransportError) -> Self {
            Self {
                chunks: Vec::new(),
                delay: Duration::ZERO,
                failure: Some(error),
                opens: AtomicUsize::new(0),
            }
        }

        /// Number of opens so far.
        pub(crate) fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TransportPort for ScriptedTransport {
        async fn open(&self, _request: &FetchRequest) -> Result<TransportResponse, TransportError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if let Some(error) = &self.failure {
                return Err(error.clone());
            }
            let delay = self.delay;
            let expected = self.chunks.iter().map(|c| c.len() as u64).sum();
            let body = stream::iter(self.chunks.clone())
                .then(move |chunk| async move {
                    tokio::time::sleep(delay).await;
                    Ok(chunk)
                })
                .boxed();
            Ok(TransportResponse {
                expected_size: Some(expected),
                body,
            })
        }
    }
}
