//! Disk-based blob cache for persistence across sessions.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::disk_store::DiskStore;
use crate::domain::entities::CacheKey;
use crate::domain::errors::StorageError;
use crate::infrastructure::pool::SerialQueue;

/// Maximum disk cache size in bytes (200 MB default).
pub const DEFAULT_MAX_CACHE_SIZE: u64 = 200 * 1024 * 1024;

/// Values smaller than this are stored inside the index row.
pub const DEFAULT_INLINE_THRESHOLD: usize = 20 * 1024;

/// Callback receiving write and trim failures.
pub type ErrorHook = Arc<dyn Fn(&StorageError) + Send + Sync>;

/// Independent optional bounds, applied age first, then size, then count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskCacheLimits {
    /// Maximum summed size in bytes.
    pub max_size: Option<u64>,
    /// Maximum time since last access.
    pub max_age: Option<Duration>,
    /// Maximum number of records.
    pub max_count: Option<u64>,
}

impl Default for DiskCacheLimits {
    fn default() -> Self {
        Self {
            max_size: Some(DEFAULT_MAX_CACHE_SIZE),
            max_age: None,
            max_count: None,
        }
    }
}

/// Persistent LRU blob cache.
///
/// Every operation runs on the cache's own serial queue; the store itself
/// sits behind a short-lived lock. Failures never reach callers: reads turn
/// into misses and writes are logged and passed to the error hook.
pub struct DiskCache {
    path: PathBuf,
    store: Arc<Mutex<Option<DiskStore>>>,
    queue: SerialQueue,
    limits: DiskCacheLimits,
    error_hook: Option<ErrorHook>,
}

impl DiskCache {
    /// Opens the cache at `path`. If the store cannot be opened the cache
    /// runs without a disk tier: every lookup misses and every write is
    /// dropped.
    pub async fn open(
        path: PathBuf,
        inline_threshold: usize,
        limits: DiskCacheLimits,
        queue: SerialQueue,
        error_hook: Option<ErrorHook>,
    ) -> Self {
        let open_path = path.clone();
        let opened = queue
            .run(move || DiskStore::open(&open_path, inline_threshold))
            .await
            .unwrap_or(Err(StorageError::WorkerGone));

        let store = match opened {
            Ok(store) => {
                debug!(path = %path.display(), "Disk cache ready");
                Some(store)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Disk cache unavailable");
                if let Some(hook) = &error_hook {
                    hook(&e);
                }
                None
            }
        };

        Self {
            path,
            store: Arc::new(Mutex::new(store)),
            queue,
            limits,
            error_hook,
        }
    }

    /// Opens a cache in the default location (~/.cache/oximage/images/).
    pub async fn default_location(queue: SerialQueue) -> Self {
        Self::open(
            default_cache_path(),
            DEFAULT_INLINE_THRESHOLD,
            DiskCacheLimits::default(),
            queue,
            None,
        )
        .await
    }

    /// Cache root directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Configured bounds.
    #[must_use]
    pub const fn limits(&self) -> DiskCacheLimits {
        self.limits
    }

    /// Returns false if the store could not be opened.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.store.lock().is_some()
    }

    async fn with_store<T, F>(&self, op: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut DiskStore) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        self.queue
            .run(move || {
                let mut guard = store.lock();
                match guard.as_mut() {
                    Some(store) => op(store),
                    None => Err(StorageError::corrupt("disk cache unavailable")),
                }
            })
            .await
            .unwrap_or(Err(StorageError::WorkerGone))
    }

    fn report(&self, operation: &'static str, err: &StorageError) {
        warn!(operation = operation, error = %err, "Disk cache operation failed");
        if let Some(hook) = &self.error_hook {
            hook(err);
        }
    }

    /// Reads a blob and marks it most recently used.
    pub async fn get(&self, key: &CacheKey) -> Option<Bytes> {
        let lookup = key.clone();
        match self.with_store(move |store| store.get(&lookup)).await {
            Ok(Some(data)) => {
                trace!(key = %key, size = data.len(), "Disk cache hit");
                Some(Bytes::from(data))
            }
            Ok(None) => {
                trace!(key = %key, "Disk cache miss");
                None
            }
            Err(e) => {
                debug!(key = %key, error = %e, "Disk cache read failed, treating as miss");
                None
            }
        }
    }

    /// Stores a blob, then trims if over the size bound.
    pub async fn set(&self, key: CacheKey, data: Bytes) {
        let size = data.len();
        let max_size = self.limits.max_size;
        let log_key = key.clone();
        let result = self
            .with_store(move |store| {
                store.set(&key, &data)?;
                if let Some(max_size) = max_size
                    && store.total_size()? > max_size
                {
                    let removed = store.trim_to_size(max_size)?;
                    debug!(removed = removed, max_size = max_size, "Disk cache over limit, trimmed");
                }
                Ok(())
            })
            .await;

        match result {
            Ok(()) => debug!(key = %log_key, size = size, "Stored blob in disk cache"),
            Err(e) => self.report("set", &e),
        }
    }

    /// Returns true if a record exists for the key.
    pub async fn contains(&self, key: &CacheKey) -> bool {
        let lookup = key.clone();
        self.with_store(move |store| store.contains(&lookup))
            .await
            .unwrap_or(false)
    }

    /// Removes a blob.
    pub async fn remove(&self, key: &CacheKey) {
        let target = key.clone();
        match self.with_store(move |store| store.remove(&target)).await {
            Ok(true) => debug!(key = %key, "Evicted from disk cache"),
            Ok(false) => {}
            Err(e) => self.report("remove", &e),
        }
    }

    /// Removes every blob.
    pub async fn remove_all(&self) {
        match self.with_store(DiskStore::remove_all).await {
            Ok(()) => debug!(path = %self.path.display(), "Cleared disk cache"),
            Err(e) => self.report("remove_all", &e),
        }
    }

    /// Removes records older than `max_age`, then least recently used
    /// records until the total is at most `max_size`.
    pub async fn trim(&self, max_age: Option<Duration>, max_size: Option<u64>) {
        let result = self
            .with_store(move |store| {
                let mut removed = 0;
                if let Some(age) = max_age {
                    removed += store.trim_to_age(age)?;
                }
                if let Some(size) = max_size {
                    removed += store.trim_to_size(size)?;
                }
                Ok(removed)
            })
            .await;

        match result {
            Ok(removed) if removed > 0 => debug!(removed = removed, "Disk cache trim complete"),
            Ok(_) => {}
            Err(e) => self.report("trim", &e),
        }
    }

    /// Removes least recently used records until at most `max_count` remain.
    pub async fn trim_to_count(&self, max_count: u64) {
        match self
            .with_store(move |store| store.trim_to_count(max_count))
            .await
        {
            Ok(removed) if removed > 0 => debug!(removed = removed, "Disk cache count trim complete"),
            Ok(_) => {}
            Err(e) => self.report("trim_to_count", &e),
        }
    }

    /// Applies the configured bounds: age, then size, then count.
    pub async fn trim_to_limits(&self) {
        self.trim(self.limits.max_age, self.limits.max_size).await;
        if let Some(max_count) = self.limits.max_count {
            self.trim_to_count(max_count).await;
        }
    }

    /// Summed size of all records in bytes.
    pub async fn total_size(&self) -> u64 {
        self.with_store(|store| store.total_size())
            .await
            .unwrap_or(0)
    }

    /// Number of records.
    pub async fn total_count(&self) -> u64 {
        self.with_store(|store| store.total_count())
            .await
            .unwrap_or(0)
    }

    /// Returns true if the cache holds no records.
    pub async fn is_empty(&self) -> bool {
        self.total_count().await == 0
    }
}

impl std::fmt::Debug for DiskCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskCache")
            .field("path", &self.path)
            .field("limits", &self.limits)
            .field("queue", &self.queue.name())
            .finish_non_exhaustive()
    }
}

/// Returns the default cache directory path.
#[must_use]
pub fn default_cache_path() -> PathBuf {
    directories::ProjectDirs::from("com", "linuxmobile", "oximage").map_or_else(
        || {
            std::env::temp_dir()
                .join("oximage")
                .join("cache")
                .join("images")
        },
        |dirs| dirs.cache_dir().join("images"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    async fn create_test_cache(limits: DiskCacheLimits) -> (DiskCache, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let queue = SerialQueue::start("test-disk").unwrap();
        let cache = DiskCache::open(temp_dir.path().join("images"), 16, limits, queue, None).await;
        (cache, temp_dir)
    }

    fn unbounded() -> DiskCacheLimits {
        DiskCacheLimits {
            max_size: None,
            max_age: None,
            max_count: None,
        }
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let (cache, _temp) = create_test_cache(unbounded()).await;
        let key = CacheKey::for_source("https://example.com/a.png");

        cache.set(key.clone(), Bytes::from_static(b"test image data")).await;

        assert!(cache.is_available());
        assert_eq!(cache.get(&key).await.unwrap(), Bytes::from_static(b"test image data"));
        assert!(cache.contains(&key).await);
    }

    #[tokio::test]
    async fn test_cache_miss() {
        let (cache, _temp) = create_test_cache(unbounded()).await;
        assert!(cache.get(&CacheKey::for_source("nonexistent")).await.is_none());
    }

    #[tokio::test]
    async fn test_remove_and_remove_all() {
        let (cache, _temp) = create_test_cache(unbounded()).await;
        let a = CacheKey::for_source("a");
        let b = CacheKey::for_source("b");
        cache.set(a.clone(), Bytes::from_static(b"data1")).await;
        cache.set(b.clone(), Bytes::from_static(b"a much longer payload")).await;

        cache.remove(&a).await;
        assert!(!cache.contains(&a).await);
        assert_eq!(cache.total_count().await, 1);

        cache.remove_all().await;
        assert!(cache.is_empty().await);
        assert_eq!(cache.total_size().await, 0);
    }

    #[tokio::test]
    async fn test_trim_to_size_removes_least_recent() {
        let (cache, _temp) = create_test_cache(unbounded()).await;
        let keys: Vec<CacheKey> = ["k1", "k2", "k3"].into_iter().map(CacheKey::for_source).collect();
        for key in &keys {
            cache.set(key.clone(), Bytes::from(vec![1u8; 40])).await;
        }

        cache.trim(None, Some(100)).await;

        assert!(!cache.contains(&keys[0]).await);
        assert!(cache.contains(&keys[1]).await);
        assert!(cache.contains(&keys[2]).await);
        assert_eq!(cache.total_size().await, 80);
    }

    #[tokio::test]
    async fn test_set_trims_over_max_size() {
        let limits = DiskCacheLimits {
            max_size: Some(10),
            ..unbounded()
        };
        let (cache, _temp) = create_test_cache(limits).await;
        let first = CacheKey::for_source("first");
        let second = CacheKey::for_source("second");

        cache.set(first.clone(), Bytes::from_static(b"123456")).await;
        cache.set(second.clone(), Bytes::from_static(b"123456")).await;

        assert_eq!(cache.total_count().await, 1);
        assert!(cache.contains(&second).await);
        assert_eq!(cache.total_size().await, 6);
    }

    #[tokio::test]
    async fn test_trim_to_limits_applies_count() {
        let limits = DiskCacheLimits {
            max_count: Some(1),
            ..unbounded()
        };
        let (cache, _temp) = create_test_cache(limits).await;
        cache.set(CacheKey::for_source("a"), Bytes::from_static(b"1")).await;
        cache.set(CacheKey::for_source("b"), Bytes::from_static(b"2")).await;

        cache.trim_to_limits().await;

        assert_eq!(cache.total_count().await, 1);
        assert!(cache.contains(&CacheKey::for_source("b")).await);
    }

    #[tokio::test]
    async fn test_survives_restart() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("images");
        let key = CacheKey::new("https://example.com/a.png", Some("resize-64"));
        let payload = Bytes::from(vec![9u8; 4096]);

        {
            let queue = SerialQueue::start("test-disk-1").unwrap();
            let cache = DiskCache::open(path.clone(), 16, unbounded(), queue, None).await;
            cache.set(key.clone(), payload.clone()).await;
        }

        let queue = SerialQueue::start("test-disk-2").unwrap();
        let cache = DiskCache::open(path, 16, unbounded(), queue, None).await;
        assert_eq!(cache.get(&key).await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_unavailable_store_reports_and_misses() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file in the way").unwrap();

        let reported = Arc::new(AtomicUsize::new(0));
        let counter = reported.clone();
        let hook: ErrorHook = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let queue = SerialQueue::start("test-disk-broken").unwrap();
        let cache = DiskCache::open(blocker.join("images"), 16, unbounded(), queue, Some(hook)).await;

        assert!(!cache.is_available());
        let key = CacheKey::for_source("a");
        cache.set(key.clone(), Bytes::from_static(b"dropped")).await;
        assert!(cache.get(&key).await.is_none());
        assert!(reported.load(Ordering::SeqCst) >= 2);
    }
}
