//! Download coordination.
//!
//! At most one transport operation runs per resource key. Later subscribers
//! attach to the in-flight operation and share its progress and result.
//!
//! ```text
//! subscribe(k) A ─┐
//!                 │                           transport
//! subscribe(k) B ─┼──► DownloadCoordinator ─► task (one per key)
//!                 │            │                   │
//! subscribe(k) C ─┘            ▼                   ▼
//!                     progress / completion  ◄── chunks
//!                     fan-out to A, B, C
//! ```
//!
//! Lock order is registry, then subscribers. Callbacks always run after every
//! lock is released.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use crate::domain::entities::{CacheKey, DecodedImage};
use crate::domain::errors::TransportError;
use crate::domain::ports::{FetchRequest, TransportPort};
use crate::infrastructure::image::DecoderRegistry;
use crate::infrastructure::pool::WorkerPool;

/// Progress callback. Invoked once per chunk, in arrival order.
pub type ProgressFn = Arc<dyn Fn(&DownloadProgress) + Send + Sync>;

/// Completion callback. Invoked at most once.
pub type CompletionFn = Box<dyn FnOnce(Result<Bytes, TransportError>) + Send>;

/// One progress notification.
#[derive(Debug, Clone)]
pub struct DownloadProgress {
    /// Bytes received so far.
    pub received: u64,
    /// Size announced by the origin.
    pub expected: Option<u64>,
    /// Preview decoded from the bytes received so far.
    pub preview: Option<DecodedImage>,
}

/// Handle for cancelling one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CancelToken {
    key: CacheKey,
    operation_id: u64,
    subscriber_id: u64,
}

impl CancelToken {
    /// Resource key of the subscription.
    #[must_use]
    pub const fn key(&self) -> &CacheKey {
        &self.key
    }
}

/// Statistics for monitoring coalescing effectiveness.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CoalescerStats {
    /// Total subscriptions received
    pub total_requests: u64,
    /// Subscriptions that attached to an in-flight operation
    pub coalesced_requests: u64,
    /// Subscriptions that started a transport operation
    pub new_requests: u64,
}

impl CoalescerStats {
    /// Returns the coalescing ratio (0.0 to 1.0)
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn coalescing_ratio(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.coalesced_requests as f64 / self.total_requests as f64
        }
    }
}

#[derive(Default)]
struct StatCounters {
    total_requests: AtomicU64,
    coalesced_requests: AtomicU64,
    new_requests: AtomicU64,
}

struct Subscriber {
    id: u64,
    cancelled: Arc<AtomicBool>,
    progress: Option<ProgressFn>,
    completion: Option<CompletionFn>,
}

#[derive(Default)]
struct OperationState {
    expected: Option<u64>,
    abort: Option<AbortHandle>,
    cancelled: bool,
    pending_preview: Option<DecodedImage>,
}

struct DownloadOperation {
    id: u64,
    key: CacheKey,
    request: FetchRequest,
    progressive: AtomicBool,
    preview_in_flight: AtomicBool,
    subscribers: Mutex<Vec<Subscriber>>,
    state: Mutex<OperationState>,
    buffer: Mutex<BytesMut>,
}

impl DownloadOperation {
    fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    fn abort(&self) {
        let handle = {
            let mut state = self.state.lock();
            state.cancelled = true;
            state.abort.take()
        };
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

struct Inner {
    transport: Arc<dyn TransportPort>,
    decoders: Arc<DecoderRegistry>,
    pool: WorkerPool,
    operations: Mutex<HashMap<CacheKey, Arc<DownloadOperation>>>,
    next_id: AtomicU64,
    stats: StatCounters,
}

/// Deduplicates concurrent fetches per resource key.
#[derive(Clone)]
pub struct DownloadCoordinator {
    inner: Arc<Inner>,
}

impl DownloadCoordinator {
    /// Creates a coordinator over a transport. Previews decode on `pool`.
    #[must_use]
    pub fn new(
        transport: Arc<dyn TransportPort>,
        decoders: Arc<DecoderRegistry>,
        pool: WorkerPool,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                decoders,
                pool,
                operations: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                stats: StatCounters::default(),
            }),
        }
    }

    /// Subscribes to the download for `key`, starting it if none is in
    /// flight. With `progressive` set, progress events carry previews when a
    /// decoder can produce one from partial data.
    ///
    /// # Panics
    /// Panics if called outside a tokio runtime.
    pub fn subscribe(
        &self,
        key: CacheKey,
        request: FetchRequest,
        progressive: bool,
        progress: Option<ProgressFn>,
        completion: CompletionFn,
    ) -> CancelToken {
        let inner = &self.inner;
        let subscriber_id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let subscriber = Subscriber {
            id: subscriber_id,
            cancelled: Arc::new(AtomicBool::new(false)),
            progress,
            completion: Some(completion),
        };

        let mut operations = inner.operations.lock();
        inner.stats.total_requests.fetch_add(1, Ordering::Relaxed);

        if let Some(operation) = operations.get(&key) {
            operation.subscribers.lock().push(subscriber);
            if progressive {
                operation.progressive.store(true, Ordering::Relaxed);
            }
            inner.stats.coalesced_requests.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, operation = operation.id, "Attached to in-flight download");
            return CancelToken {
                key,
                operation_id: operation.id,
                subscriber_id,
            };
        }

        let operation = Arc::new(DownloadOperation {
            id: inner.next_id.fetch_add(1, Ordering::Relaxed),
            key: key.clone(),
            request,
            progressive: AtomicBool::new(progressive),
            preview_in_flight: AtomicBool::new(false),
            subscribers: Mutex::new(vec![subscriber]),
            state: Mutex::new(OperationState::default()),
            buffer: Mutex::new(BytesMut::new()),
        });
        operations.insert(key.clone(), operation.clone());
        let in_flight = operations.len();
        drop(operations);

        inner.stats.new_requests.fetch_add(1, Ordering::Relaxed);
        debug!(
            key = %key,
            operation = operation.id,
            in_flight_count = in_flight,
            "Starting download"
        );

        let task = tokio::spawn(inner.clone().drive(operation.clone()));
        {
            let mut state = operation.state.lock();
            if state.cancelled {
                task.abort();
            } else {
                state.abort = Some(task.abort_handle());
            }
        }

        CancelToken {
            key,
            operation_id: operation.id,
            subscriber_id,
        }
    }

    /// Cancels one subscription. The subscriber receives no further
    /// callbacks. Cancelling the last subscriber aborts the transport.
    /// Returns false if the subscription had already finished.
    pub fn cancel(&self, token: &CancelToken) -> bool {
        let mut operations = self.inner.operations.lock();
        let Some(operation) = operations
            .get(&token.key)
            .filter(|op| op.id == token.operation_id)
            .cloned()
        else {
            return false;
        };

        let now_empty = {
            let mut subscribers = operation.subscribers.lock();
            let Some(pos) = subscribers.iter().position(|s| s.id == token.subscriber_id) else {
                return false;
            };
            let subscriber = subscribers.remove(pos);
            subscriber.cancelled.store(true, Ordering::Release);
            subscribers.is_empty()
        };

        if now_empty {
            operations.remove(&token.key);
        }
        drop(operations);

        if now_empty {
            operation.abort();
            debug!(key = %token.key, operation = operation.id, "Cancelled download, no subscribers left");
        } else {
            trace!(key = %token.key, subscriber = token.subscriber_id, "Cancelled subscription");
        }
        true
    }

    /// Aborts every in-flight download without notifying subscribers.
    pub fn cancel_all(&self) {
        let drained: Vec<Arc<DownloadOperation>> =
            self.inner.operations.lock().drain().map(|(_, op)| op).collect();

        for operation in &drained {
            for subscriber in operation.subscribers.lock().drain(..) {
                subscriber.cancelled.store(true, Ordering::Release);
            }
            operation.abort();
        }

        if !drained.is_empty() {
            debug!(count = drained.len(), "Cancelled all downloads");
        }
    }

    /// Number of transport operations in flight.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.inner.operations.lock().len()
    }

    /// Returns true if a download for `key` is in flight.
    #[must_use]
    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.inner.operations.lock().contains_key(key)
    }

    /// Snapshot of coalescing counters.
    #[must_use]
    pub fn stats(&self) -> CoalescerStats {
        let stats = &self.inner.stats;
        CoalescerStats {
            total_requests: stats.total_requests.load(Ordering::Relaxed),
            coalesced_requests: stats.coalesced_requests.load(Ordering::Relaxed),
            new_requests: stats.new_requests.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for DownloadCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadCoordinator")
            .field("in_flight", &self.in_flight_count())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Inner {
    async fn drive(self: Arc<Self>, operation: Arc<DownloadOperation>) {
        let result = self.stream(&operation).await;
        self.finish(&operation, result);
    }

    async fn stream(&self, operation: &Arc<DownloadOperation>) -> Result<Bytes, TransportError> {
        let response = self.transport.open(&operation.request).await?;
        let expected = response.expected_size;
        operation.state.lock().expected = expected;

        let mut body = response.body;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            if chunk.is_empty() {
                continue;
            }
            if operation.is_cancelled() {
                return Err(TransportError::connection("cancelled"));
            }

            let received = {
                let mut buffer = operation.buffer.lock();
                buffer.extend_from_slice(&chunk);
                buffer.len() as u64
            };

            self.request_preview(operation);
            Self::notify_progress(operation, received, expected);
        }

        let data = operation.buffer.lock().split().freeze();
        if data.is_empty() {
            return Err(TransportError::EmptyBody);
        }
        Ok(data)
    }

    /// Starts a preview decode unless one is already running. The result is
    /// attached to the next progress event.
    fn request_preview(&self, operation: &Arc<DownloadOperation>) {
        if !operation.progressive.load(Ordering::Relaxed)
            || operation.preview_in_flight.swap(true, Ordering::AcqRel)
        {
            return;
        }

        let data = operation.buffer.lock().clone().freeze();
        let Some(decoder) = self.decoders.incremental_decoder_for(&data) else {
            operation.preview_in_flight.store(false, Ordering::Release);
            return;
        };

        let target = operation.clone();
        let dispatched = self.pool.spawn(move || {
            match decoder.incremental_decode(&data, false) {
                Ok(Some(preview)) => target.state.lock().pending_preview = Some(preview),
                Ok(None) => {}
                Err(e) => trace!(key = %target.key, error = %e, "Preview decode failed"),
            }
            target.preview_in_flight.store(false, Ordering::Release);
        });
        if !dispatched {
            operation.preview_in_flight.store(false, Ordering::Release);
        }
    }

    fn notify_progress(operation: &DownloadOperation, received: u64, expected: Option<u64>) {
        let preview = operation.state.lock().pending_preview.take();
        let listeners: Vec<(Arc<AtomicBool>, ProgressFn)> = operation
            .subscribers
            .lock()
            .iter()
            .filter_map(|s| s.progress.clone().map(|p| (s.cancelled.clone(), p)))
            .collect();

        let event = DownloadProgress {
            received,
            expected,
            preview,
        };
        for (cancelled, progress) in listeners {
            if !cancelled.load(Ordering::Acquire) {
                progress(&event);
            }
        }
    }

    fn finish(&self, operation: &Arc<DownloadOperation>, result: Result<Bytes, TransportError>) {
        let subscribers = {
            let mut operations = self.operations.lock();
            if operations
                .get(&operation.key)
                .is_some_and(|current| Arc::ptr_eq(current, operation))
            {
                operations.remove(&operation.key);
            }
            std::mem::take(&mut *operation.subscribers.lock())
        };
        if operation.is_cancelled() {
            trace!(key = %operation.key, "Cancelled download stopped");
            return;
        }
        operation.state.lock().abort = None;

        match &result {
            Ok(data) => debug!(
                key = %operation.key,
                size = data.len(),
                subscribers = subscribers.len(),
                "Download complete"
            ),
            Err(e) => warn!(
                key = %operation.key,
                error = %e,
                subscribers = subscribers.len(),
                "Download failed"
            ),
        }

        for mut subscriber in subscribers {
            if subscriber.cancelled.load(Ordering::Acquire) {
                continue;
            }
            if let Some(completion) = subscriber.completion.take() {
                completion(result.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::image::decoder::fixtures::{corrupt_gif_bytes, gif_bytes};
    use crate::infrastructure::transport::fixtures::ScriptedTransport;
    use std::time::Duration;
    use tokio::sync::oneshot;

    struct Watcher {
        token: CancelToken,
        progress: Arc<Mutex<Vec<DownloadProgress>>>,
        done: oneshot::Receiver<Result<Bytes, TransportError>>,
    }

    fn coordinator(transport: Arc<ScriptedTransport>) -> DownloadCoordinator {
        DownloadCoordinator::new(
            transport,
            Arc::new(DecoderRegistry::with_defaults()),
            WorkerPool::new(2).unwrap(),
        )
    }

    fn subscribe(coordinator: &DownloadCoordinator, url: &str, progressive: bool) -> Watcher {
        let progress = Arc::new(Mutex::new(Vec::new()));
        let sink = progress.clone();
        let (tx, done) = oneshot::channel();
        let token = coordinator.subscribe(
            CacheKey::for_source(url),
            FetchRequest::new(url),
            progressive,
            Some(Arc::new(move |event: &DownloadProgress| sink.lock().push(event.clone()))),
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        Watcher {
            token,
            progress,
            done,
        }
    }

    #[tokio::test]
    async fn test_subscribers_ten_ms_apart_share_one_request() {
        let transport = Arc::new(ScriptedTransport::new(
            vec![b"ab", b"cd", b"ef"],
            Duration::from_millis(20),
        ));
        let coordinator = coordinator(transport.clone());

        let first = subscribe(&coordinator, "https://example.com/u", false);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = subscribe(&coordinator, "https://example.com/u", false);

        let a = first.done.await.unwrap().unwrap();
        let b = second.done.await.unwrap().unwrap();

        assert_eq!(transport.opens(), 1);
        assert_eq!(a, Bytes::from_static(b"abcdef"));
        assert_eq!(a, b);
        assert_eq!(coordinator.stats().coalesced_requests, 1);
        assert_eq!(coordinator.stats().new_requests, 1);
        assert_eq!(coordinator.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_progress_arrives_in_order() {
        let transport = Arc::new(ScriptedTransport::new(
            vec![b"aa", b"bbb", b"c"],
            Duration::from_millis(1),
        ));
        let coordinator = coordinator(transport);

        let watcher = subscribe(&coordinator, "https://example.com/p", false);
        watcher.done.await.unwrap().unwrap();

        let received: Vec<u64> = watcher.progress.lock().iter().map(|p| p.received).collect();
        assert_eq!(received, vec![2, 5, 6]);
        assert!(watcher.progress.lock().iter().all(|p| p.expected == Some(6)));
    }

    #[tokio::test]
    async fn test_cancel_isolates_subscriber() {
        let transport = Arc::new(ScriptedTransport::new(
            vec![b"12", b"34", b"56"],
            Duration::from_millis(15),
        ));
        let coordinator = coordinator(transport.clone());

        let cancelled = subscribe(&coordinator, "https://example.com/c", false);
        let kept = subscribe(&coordinator, "https://example.com/c", false);

        assert!(coordinator.cancel(&cancelled.token));
        assert!(!coordinator.cancel(&cancelled.token));

        assert_eq!(kept.done.await.unwrap().unwrap(), Bytes::from_static(b"123456"));
        assert!(cancelled.done.await.is_err());
        assert!(cancelled.progress.lock().is_empty());
        assert_eq!(transport.opens(), 1);
    }

    #[tokio::test]
    async fn test_cancel_last_subscriber_aborts() {
        let transport = Arc::new(ScriptedTransport::new(
            vec![b"12", b"34", b"56"],
            Duration::from_millis(30),
        ));
        let coordinator = coordinator(transport.clone());

        let watcher = subscribe(&coordinator, "https://example.com/x", false);
        assert!(coordinator.is_in_flight(watcher.token.key()));
        assert!(coordinator.cancel(&watcher.token));

        assert_eq!(coordinator.in_flight_count(), 0);
        assert!(watcher.done.await.is_err());

        let fresh = subscribe(&coordinator, "https://example.com/x", false);
        assert_eq!(fresh.done.await.unwrap().unwrap(), Bytes::from_static(b"123456"));
    }

    #[tokio::test]
    async fn test_failure_reaches_every_subscriber() {
        let transport = Arc::new(ScriptedTransport::failing(TransportError::status(500)));
        let coordinator = coordinator(transport);

        let a = subscribe(&coordinator, "https://example.com/f", false);
        let b = subscribe(&coordinator, "https://example.com/f", false);

        assert_eq!(a.done.await.unwrap().unwrap_err(), TransportError::status(500));
        assert_eq!(b.done.await.unwrap().unwrap_err(), TransportError::status(500));
    }

    #[tokio::test]
    async fn test_empty_body_is_failure() {
        let transport = Arc::new(ScriptedTransport::new(Vec::new(), Duration::ZERO));
        let coordinator = coordinator(transport);

        let watcher = subscribe(&coordinator, "https://example.com/e", false);
        assert_eq!(watcher.done.await.unwrap().unwrap_err(), TransportError::EmptyBody);
    }

    #[tokio::test]
    async fn test_late_subscriber_starts_fresh_request() {
        let transport = Arc::new(ScriptedTransport::new(vec![b"data"], Duration::ZERO));
        let coordinator = coordinator(transport.clone());

        subscribe(&coordinator, "https://example.com/l", false)
            .done
            .await
            .unwrap()
            .unwrap();
        subscribe(&coordinator, "https://example.com/l", false)
            .done
            .await
            .unwrap()
            .unwrap();

        assert_eq!(transport.opens(), 2);
    }

    #[tokio::test]
    async fn test_cancel_all_silences_everyone() {
        let transport = Arc::new(ScriptedTransport::new(vec![b"1", b"2"], Duration::from_millis(30)));
        let coordinator = coordinator(transport);

        let a = subscribe(&coordinator, "https://example.com/1", false);
        let b = subscribe(&coordinator, "https://example.com/2", false);
        coordinator.cancel_all();

        assert_eq!(coordinator.in_flight_count(), 0);
        assert!(a.done.await.is_err());
        assert!(b.done.await.is_err());
    }

    #[tokio::test]
    async fn test_progressive_download_delivers_preview() {
        let gif = gif_bytes(6, 24, 24, 40);
        let transport = Arc::new(ScriptedTransport::from_bytes(&gif, 64, Duration::from_millis(5)));
        let coordinator = coordinator(transport);

        let watcher = subscribe(&coordinator, "https://example.com/anim.gif", true);
        let data = watcher.done.await.unwrap().unwrap();

        assert_eq!(data.len(), gif.len());
        let progress = watcher.progress.lock();
        let preview = progress.iter().find_map(|p| p.preview.clone());
        let preview = preview.expect("a preview before completion");
        assert_eq!((preview.width(), preview.height()), (24, 24));
    }

    #[tokio::test]
    async fn test_failed_preview_does_not_fail_download() {
        let corrupt = corrupt_gif_bytes(512);
        let transport = Arc::new(ScriptedTransport::from_bytes(&corrupt, 64, Duration::from_millis(5)));
        let coordinator = coordinator(transport);

        let watcher = subscribe(&coordinator, "https://example.com/broken.gif", true);
        let data = watcher.done.await.unwrap().unwrap();

        assert_eq!(data, Bytes::from(corrupt));
        let progress = watcher.progress.lock();
        assert_eq!(progress.len(), 8);
        assert!(progress.iter().all(|p| p.preview.is_none()));
    }
}
