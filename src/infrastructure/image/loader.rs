//! Async image loading orchestrator.
//!
//! Implements a three-tier cache: Memory -> Disk -> Network. Decoded (and
//! transformed) images live in memory under the transform-aware key; disk
//! keeps the origin bytes under the transform-free source key, so every
//! transform of one source shares a single download and disk record.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::decoder::DecoderRegistry;
use crate::domain::entities::{CacheKey, DecodedImage, ImageResource, ImageSource, LoadedImage};
use crate::domain::errors::{DecodeError, LoadError};
use crate::domain::ports::{FetchRequest, ImageCachePort, ImageTransformerPort};
use crate::infrastructure::download::{CancelToken, DownloadCoordinator, ProgressFn};
use crate::infrastructure::pool::WorkerPool;

/// Completion callback for `ImageLoader::load`.
pub type LoadCompletionFn = Box<dyn FnOnce(Result<LoadedImage, LoadError>) + Send>;

/// Per-request behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct LoadOptions {
    /// Ignore cached copies and fetch from the origin again.
    pub refresh_cached: bool,
    /// Serve from memory only; a miss fails with `LoadError::NotCached`.
    pub memory_only: bool,
    /// Neither read nor write the disk tier.
    pub skip_disk: bool,
    /// Deliver previews decoded from partial downloads.
    pub progressive: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            refresh_cached: false,
            memory_only: false,
            skip_disk: false,
            progressive: true,
        }
    }
}

/// Handle to a load started with `ImageLoader::load`.
pub struct LoadTask {
    key: CacheKey,
    cancelled: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl LoadTask {
    /// Key the image will be cached under.
    #[must_use]
    pub const fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Cancels the load. Its completion callback will not run. Other loads
    /// sharing the same download are unaffected.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.handle.abort();
        trace!(key = %self.key, "Cancelled image load");
    }

    /// Returns true once the load has finished or been cancelled.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl std::fmt::Debug for LoadTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadTask")
            .field("key", &self.key)
            .field("cancelled", &self.cancelled.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

/// Cancels a download subscription if the awaiting future is dropped.
struct Subscription {
    coordinator: DownloadCoordinator,
    token: Option<CancelToken>,
}

impl Subscription {
    fn disarm(&mut self) {
        self.token = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.coordinator.cancel(&token);
        }
    }
}

struct Inner {
    cache: Arc<dyn ImageCachePort>,
    coordinator: DownloadCoordinator,
    decoders: Arc<DecoderRegistry>,
    pool: WorkerPool,
}

/// Orchestrates image loading from memory, disk, and network.
#[derive(Clone)]
pub struct ImageLoader {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ImageLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageLoader")
            .field("in_flight", &self.inner.coordinator.in_flight_count())
            .finish_non_exhaustive()
    }
}

impl ImageLoader {
    /// Creates a loader over the given cache, coordinator and decoders.
    #[must_use]
    pub fn new(
        cache: Arc<dyn ImageCachePort>,
        coordinator: DownloadCoordinator,
        decoders: Arc<DecoderRegistry>,
        pool: WorkerPool,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                cache,
                coordinator,
                decoders,
                pool,
            }),
        }
    }

    /// The download coordinator.
    #[must_use]
    pub fn coordinator(&self) -> &DownloadCoordinator {
        &self.inner.coordinator
    }

    /// Probes the memory tier for `resource` under `transformer`.
    #[must_use]
    pub fn cached_image(
        &self,
        resource: &ImageResource,
        transformer: Option<&dyn ImageTransformerPort>,
    ) -> Option<DecodedImage> {
        let key = resource.cache_key(transformer.map(ImageTransformerPort::identifier));
        self.inner.cache.lookup_memory(&key)
    }

    /// Starts loading in the background. `on_completion` receives the result
    /// unless the returned task is cancelled first.
    ///
    /// # Panics
    /// Panics if called outside a tokio runtime.
    pub fn load(
        &self,
        resource: ImageResource,
        options: LoadOptions,
        transformer: Option<Arc<dyn ImageTransformerPort>>,
        on_progress: Option<ProgressFn>,
        on_completion: LoadCompletionFn,
    ) -> LoadTask {
        let key = resource.cache_key(transformer.as_deref().map(ImageTransformerPort::identifier));
        let cancelled = Arc::new(AtomicBool::new(false));
        let loader = self.clone();
        let flag = cancelled.clone();

        let handle = tokio::spawn(async move {
            let result = loader
                .fetch(&resource, options, transformer, on_progress)
                .await;
            if !flag.load(Ordering::Acquire) {
                on_completion(result);
            }
        });

        LoadTask {
            key,
            cancelled,
            handle,
        }
    }

    /// Starts background loads that only warm the caches.
    pub fn prefetch(&self, resources: Vec<ImageResource>) -> Vec<LoadTask> {
        let options = LoadOptions {
            progressive: false,
            ..LoadOptions::default()
        };
        resources
            .into_iter()
            .map(|resource| {
                let id = resource.source_id();
                self.load(
                    resource,
                    options,
                    None,
                    None,
                    Box::new(move |result| {
                        if let Err(e) = result {
                            debug!(resource = %id, error = %e, "Prefetch failed");
                        }
                    }),
                )
            })
            .collect()
    }

    /// Loads an image, checking caches first.
    ///
    /// # Errors
    /// Returns `LoadError` if the image cannot be fetched or decoded, or
    /// `NotCached` for a memory-only miss.
    pub async fn fetch(
        &self,
        resource: &ImageResource,
        options: LoadOptions,
        transformer: Option<Arc<dyn ImageTransformerPort>>,
        on_progress: Option<ProgressFn>,
    ) -> Result<LoadedImage, LoadError> {
        validate(resource)?;
        let cache = &self.inner.cache;
        let key = resource.cache_key(transformer.as_deref().map(ImageTransformerPort::identifier));
        let source_key = resource.source_key();

        if !options.refresh_cached {
            if let Some(image) = cache.lookup_memory(&key) {
                trace!(key = %key, source = "memory", "Image loaded");
                return Ok(LoadedImage {
                    key,
                    image,
                    data: None,
                    source: ImageSource::MemoryCache,
                });
            }
        }

        if options.memory_only {
            return Err(LoadError::NotCached);
        }

        if !options.skip_disk && !options.refresh_cached {
            if let Some(data) = cache.lookup_disk(&source_key).await {
                match self.decode(data.clone(), transformer.clone()).await {
                    Ok(image) => {
                        cache.store_memory(key.clone(), image.clone());
                        debug!(key = %key, source = "disk", "Image loaded");
                        return Ok(LoadedImage {
                            key,
                            image,
                            data: Some(data),
                            source: ImageSource::DiskCache,
                        });
                    }
                    Err(e) => {
                        warn!(key = %source_key, error = %e, "Dropping undecodable disk entry");
                        cache.remove(&source_key).await;
                    }
                }
            }
        }

        debug!(resource = %resource, "Downloading image");
        let data = self
            .download(resource, source_key.clone(), options.progressive, on_progress)
            .await?;

        if !options.skip_disk {
            let cache = cache.clone();
            let data = data.clone();
            tokio::spawn(async move {
                cache.store_disk(source_key, data).await;
            });
        }

        let image = self.decode(data.clone(), transformer).await?;
        cache.store_memory(key.clone(), image.clone());
        debug!(key = %key, source = "network", "Image loaded");

        Ok(LoadedImage {
            key,
            image,
            data: Some(data),
            source: ImageSource::Network,
        })
    }

    /// Removes every cached copy of `resource` under `transformer`, plus the
    /// shared source bytes.
    pub async fn evict(
        &self,
        resource: &ImageResource,
        transformer: Option<&dyn ImageTransformerPort>,
    ) {
        let key = resource.cache_key(transformer.map(ImageTransformerPort::identifier));
        self.inner.cache.remove(&key).await;
        let source_key = resource.source_key();
        if source_key != key {
            self.inner.cache.remove(&source_key).await;
        }
    }

    /// Clears all caches.
    pub async fn clear_all(&self) {
        self.inner.cache.clear().await;
        debug!("Cleared all image caches");
    }

    async fn download(
        &self,
        resource: &ImageResource,
        source_key: CacheKey,
        progressive: bool,
        on_progress: Option<ProgressFn>,
    ) -> Result<Bytes, LoadError> {
        let (tx, rx) = oneshot::channel();
        let coordinator = self.inner.coordinator.clone();
        let token = coordinator.subscribe(
            source_key,
            FetchRequest::new(resource.source_id()),
            progressive,
            on_progress,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        let mut subscription = Subscription {
            coordinator,
            token: Some(token),
        };

        let result = rx.await.map_err(|_| LoadError::Cancelled)?;
        subscription.disarm();
        Ok(result?)
    }

    async fn decode(
        &self,
        data: Bytes,
        transformer: Option<Arc<dyn ImageTransformerPort>>,
    ) -> Result<DecodedImage, LoadError> {
        let decoders = self.inner.decoders.clone();
        let decoded = self
            .inner
            .pool
            .run(move || {
                let image = decoders.decode(&data)?;
                match transformer {
                    Some(transformer) => transformer.transform(&image),
                    None => Ok(image),
                }
            })
            .await
            .ok_or_else(|| DecodeError::malformed("decoder worker failed"))?;
        Ok(decoded?)
    }
}

fn validate(resource: &ImageResource) -> Result<(), LoadError> {
    match resource {
        ImageResource::Local(path) if path.as_os_str().is_empty() => {
            Err(LoadError::invalid_resource("empty path"))
        }
        ImageResource::Remote(url) if url.split_once("://").is_none_or(|(_, rest)| rest.is_empty()) => {
            Err(LoadError::invalid_resource(format!("missing host in {url}")))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::domain::errors::TransportError;
    use crate::infrastructure::image::decoder::fixtures::png_bytes;
    use crate::infrastructure::image::image_cache::ImageCache;
    use crate::infrastructure::image::memory_cache::{ImageMemoryCache, MemoryCacheLimits};
    use crate::infrastructure::transport::fixtures::ScriptedTransport;

    const URL: &str = "https://example.com/a.png";

    struct Thumbnail;

    impl ImageTransformerPort for Thumbnail {
        fn identifier(&self) -> &str {
            "thumb-1x1"
        }

        fn transform(&self, image: &DecodedImage) -> Result<DecodedImage, DecodeError> {
            Ok(image.with_poster(image.poster().thumbnail_exact(1, 1)))
        }
    }

    fn loader(transport: Arc<ScriptedTransport>) -> (ImageLoader, Arc<ImageCache>) {
        let pool = WorkerPool::new(2).unwrap();
        let decoders = Arc::new(DecoderRegistry::with_defaults());
        let cache = Arc::new(ImageCache::new(
            Arc::new(ImageMemoryCache::new(MemoryCacheLimits::default())),
            None,
        ));
        let coordinator = DownloadCoordinator::new(transport, decoders.clone(), pool.clone());
        (
            ImageLoader::new(cache.clone(), coordinator, decoders, pool),
            cache,
        )
    }

    fn png_transport(delay: Duration) -> Arc<ScriptedTransport> {
        Arc::new(ScriptedTransport::from_bytes(&png_bytes(4, 3), 1024, delay))
    }

    #[tokio::test]
    async fn test_network_then_memory() {
        let transport = png_transport(Duration::ZERO);
        let (loader, _) = loader(transport.clone());
        let resource = ImageResource::parse(URL);

        let first = loader
            .fetch(&resource, LoadOptions::default(), None, None)
            .await
            .unwrap();
        assert_eq!(first.source, ImageSource::Network);
        assert_eq!((first.image.width(), first.image.height()), (4, 3));
        assert!(first.data.is_some());

        let second = loader
            .fetch(&resource, LoadOptions::default(), None, None)
            .await
            .unwrap();
        assert_eq!(second.source, ImageSource::MemoryCache);
        assert!(second.data.is_none());
        assert_eq!(transport.opens(), 1);
    }

    #[tokio::test]
    async fn test_transformed_image_has_own_key() {
        let transport = png_transport(Duration::ZERO);
        let (loader, _) = loader(transport);
        let resource = ImageResource::parse(URL);
        let thumb: Arc<dyn ImageTransformerPort> = Arc::new(Thumbnail);

        let plain = loader
            .fetch(&resource, LoadOptions::default(), None, None)
            .await
            .unwrap();
        let small = loader
            .fetch(&resource, LoadOptions::default(), Some(thumb.clone()), None)
            .await
            .unwrap();

        assert_ne!(plain.key, small.key);
        assert_eq!(small.image.width(), 1);
        assert_eq!(
            loader.cached_image(&resource, Some(thumb.as_ref())).map(|i| i.width()),
            Some(1)
        );
        assert_eq!(loader.cached_image(&resource, None).map(|i| i.width()), Some(4));
    }

    #[tokio::test]
    async fn test_memory_only_miss() {
        let (loader, _) = loader(png_transport(Duration::ZERO));
        let options = LoadOptions {
            memory_only: true,
            ..LoadOptions::default()
        };

        let err = loader
            .fetch(&ImageResource::parse(URL), options, None, None)
            .await
            .unwrap_err();
        assert_eq!(err, LoadError::NotCached);
    }

    #[tokio::test]
    async fn test_refresh_bypasses_memory() {
        let transport = png_transport(Duration::ZERO);
        let (loader, _) = loader(transport.clone());
        let resource = ImageResource::parse(URL);
        let refresh = LoadOptions {
            refresh_cached: true,
            ..LoadOptions::default()
        };

        loader.fetch(&resource, LoadOptions::default(), None, None).await.unwrap();
        let again = loader.fetch(&resource, refresh, None, None).await.unwrap();

        assert_eq!(again.source, ImageSource::Network);
        assert_eq!(transport.opens(), 2);
    }

    #[tokio::test]
    async fn test_transport_failure_is_surfaced() {
        let transport = Arc::new(ScriptedTransport::failing(TransportError::status(404)));
        let (loader, cache) = loader(transport);

        let err = loader
            .fetch(&ImageResource::parse(URL), LoadOptions::default(), None, None)
            .await
            .unwrap_err();

        assert_eq!(err, LoadError::Transport(TransportError::status(404)));
        assert!(cache.memory().is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_body_is_decode_error() {
        let transport = Arc::new(ScriptedTransport::new(vec![b"not an image"], Duration::ZERO));
        let (loader, _) = loader(transport);

        let err = loader
            .fetch(&ImageResource::parse(URL), LoadOptions::default(), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::Decode(_)));
    }

    #[tokio::test]
    async fn test_invalid_resource() {
        let (loader, _) = loader(png_transport(Duration::ZERO));

        let err = loader
            .fetch(&ImageResource::parse("https://"), LoadOptions::default(), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::InvalidResource { .. }));
    }

    #[tokio::test]
    async fn test_load_delivers_completion() {
        let (loader, _) = loader(png_transport(Duration::ZERO));
        let (tx, rx) = oneshot::channel();

        let task = loader.load(
            ImageResource::parse(URL),
            LoadOptions::default(),
            None,
            None,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );

        let loaded = rx.await.unwrap().unwrap();
        assert_eq!(loaded.key, *task.key());
        assert_eq!(loaded.source, ImageSource::Network);
    }

    #[tokio::test]
    async fn test_cancelled_load_never_completes() {
        let transport = png_transport(Duration::from_millis(50));
        let (loader, _) = loader(transport);
        let (tx, rx) = oneshot::channel::<Result<LoadedImage, LoadError>>();

        let task = loader.load(
            ImageResource::parse(URL),
            LoadOptions::default(),
            None,
            None,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        task.cancel();

        assert!(rx.await.is_err());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(loader.coordinator().in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_prefetch_warms_memory() {
        let (loader, _) = loader(png_transport(Duration::ZERO));
        let resource = ImageResource::parse(URL);

        for task in loader.prefetch(vec![resource.clone()]) {
            while !task.is_finished() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }

        assert!(loader.cached_image(&resource, None).is_some());
    }
}
