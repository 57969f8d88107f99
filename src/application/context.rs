//! Engine context: every shared cache, pool and coordinator, built once and
//! passed to whoever needs them.

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::lifecycle::LifecycleSignal;
use crate::domain::entities::{CacheKey, DecodedImage};
use crate::domain::errors::TransportError;
use crate::domain::ports::{AnimatedFrameSource, MemoryProbePort, TransportPort};
use crate::infrastructure::animation::{
    AnimatedImage, AnimationRegistry, ConsumerLease, PlaybackBuffer,
};
use crate::infrastructure::config::{ConfigError, ConfigStore, EngineConfig};
use crate::infrastructure::download::DownloadCoordinator;
use crate::infrastructure::image::{
    DecoderRegistry, DiskCache, ErrorHook, ImageCache, ImageLoader, ImageMemoryCache,
    default_cache_path,
};
use crate::infrastructure::pool::{SerialQueue, WorkerPool};
use crate::infrastructure::system::SystemMemoryProbe;
use crate::infrastructure::transport::{FileTransport, HttpTransport, SchemeTransport};

const SIGNAL_CAPACITY: usize = 16;

/// Context construction failures.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum ContextError {
    #[error("failed to start worker threads: {0}")]
    Pool(#[from] std::io::Error),
    #[error("failed to build transport: {0}")]
    Transport(#[from] TransportError),
    #[error("failed to load config: {0}")]
    Config(#[from] ConfigError),
}

/// An animated image being played by one consumer. Dropping it detaches the
/// consumer; the last one out clears the shared frame cache.
#[derive(Debug)]
pub struct Playback {
    /// Look-ahead buffer driven by the consumer's clock.
    pub buffer: PlaybackBuffer,
    /// Registration of this consumer.
    pub lease: ConsumerLease,
}

/// Shared engine state.
pub struct ImageContext {
    pub(super) config: EngineConfig,
    pub(super) pool: WorkerPool,
    pub(super) probe: Arc<dyn MemoryProbePort>,
    pub(super) memory: Arc<ImageMemoryCache>,
    pub(super) disk: Option<Arc<DiskCache>>,
    pub(super) cache: Arc<ImageCache>,
    pub(super) decoders: Arc<DecoderRegistry>,
    pub(super) coordinator: DownloadCoordinator,
    pub(super) loader: ImageLoader,
    pub(super) animations: Arc<AnimationRegistry>,
    pub(super) signals: broadcast::Sender<LifecycleSignal>,
}

impl ImageContext {
    /// Builds a context with the HTTP/file transport and the system memory
    /// probe.
    ///
    /// # Errors
    /// Returns `ContextError` if worker threads or the HTTP client cannot be
    /// created.
    pub async fn new(config: EngineConfig) -> Result<Self, ContextError> {
        let http = HttpTransport::new(config.network.timeout(), &config.network.user_agent)?;
        let transport = Arc::new(SchemeTransport::new(
            Arc::new(http),
            Arc::new(FileTransport::default()),
        ));
        let probe = Arc::new(SystemMemoryProbe::new());
        Self::with_parts(config, transport, probe, None).await
    }

    /// Builds a context from a config file, the platform one when `path` is
    /// `None`. A missing file is created with defaults.
    ///
    /// # Errors
    /// Returns `ContextError` if the config cannot be loaded or the context
    /// cannot be built.
    pub async fn from_config_file(path: Option<&Path>) -> Result<Self, ContextError> {
        let store = match path {
            Some(path) => ConfigStore::at(path),
            None => ConfigStore::platform()?,
        };
        let config = store.load_or_init()?;
        info!(path = %store.path().display(), "Loaded engine config");
        Self::new(config).await
    }

    /// Builds a context over explicit collaborators.
    ///
    /// # Errors
    /// Returns `ContextError` if worker threads cannot be started.
    pub async fn with_parts(
        config: EngineConfig,
        transport: Arc<dyn TransportPort>,
        probe: Arc<dyn MemoryProbePort>,
        error_hook: Option<ErrorHook>,
    ) -> Result<Self, ContextError> {
        let workers = config
            .pool
            .workers
            .unwrap_or_else(WorkerPool::default_worker_count);
        let pool = WorkerPool::new(workers)?;

        let memory = Arc::new(ImageMemoryCache::new(config.memory.limits()));
        let disk = if config.disk.enabled {
            let path = config.disk.path.clone().unwrap_or_else(default_cache_path);
            let queue = SerialQueue::start("oximage-disk")?;
            let cache = DiskCache::open(
                path,
                config.disk.inline_threshold_bytes,
                config.disk.limits(),
                queue,
                error_hook,
            )
            .await;
            Some(Arc::new(cache))
        } else {
            debug!("Disk cache disabled");
            None
        };

        let cache = Arc::new(ImageCache::new(memory.clone(), disk.clone()));
        let decoders = Arc::new(DecoderRegistry::with_defaults());
        let coordinator = DownloadCoordinator::new(transport, decoders.clone(), pool.clone());
        let loader = ImageLoader::new(
            cache.clone(),
            coordinator.clone(),
            decoders.clone(),
            pool.clone(),
        );
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);

        info!(
            workers = pool.len(),
            disk = disk.is_some(),
            memory_max_cost = config.memory.max_cost_bytes,
            "Image context ready"
        );

        Ok(Self {
            config,
            pool,
            probe,
            memory,
            disk,
            cache,
            decoders,
            coordinator,
            loader,
            animations: AnimationRegistry::new(),
            signals,
        })
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Loader for fetching images through every tier.
    #[must_use]
    pub const fn loader(&self) -> &ImageLoader {
        &self.loader
    }

    /// Both cache tiers.
    #[must_use]
    pub const fn cache(&self) -> &Arc<ImageCache> {
        &self.cache
    }

    /// Memory tier.
    #[must_use]
    pub const fn memory_cache(&self) -> &Arc<ImageMemoryCache> {
        &self.memory
    }

    /// Disk tier, when enabled.
    #[must_use]
    pub const fn disk_cache(&self) -> Option<&Arc<DiskCache>> {
        self.disk.as_ref()
    }

    /// Download coordinator.
    #[must_use]
    pub const fn coordinator(&self) -> &DownloadCoordinator {
        &self.coordinator
    }

    /// Decoder registry. Register custom decoders here.
    #[must_use]
    pub const fn decoders(&self) -> &Arc<DecoderRegistry> {
        &self.decoders
    }

    /// Worker pool.
    #[must_use]
    pub const fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Device memory probe.
    #[must_use]
    pub const fn probe(&self) -> &Arc<dyn MemoryProbePort> {
        &self.probe
    }

    /// Consumer registration table for animated images.
    #[must_use]
    pub const fn animations(&self) -> &Arc<AnimationRegistry> {
        &self.animations
    }

    /// Attaches a consumer to the shared frame cache for `key`, creating it
    /// from `source` if no consumer holds one.
    pub fn animated(
        &self,
        key: &CacheKey,
        source: Arc<dyn AnimatedFrameSource>,
    ) -> (ConsumerLease, Arc<AnimatedImage>) {
        let probe = self.probe.clone();
        let pool = self.pool.clone();
        self.animations
            .attach(key, move || AnimatedImage::new(source, probe, pool))
    }

    /// Starts playback of an animated image. Returns `None` for still images.
    #[must_use]
    pub fn playback(&self, key: &CacheKey, image: &DecodedImage) -> Option<Playback> {
        if !image.is_animated() {
            return None;
        }
        let source = image.frames()?.clone();
        let (lease, animated) = self.animated(key, source);
        let mut buffer = PlaybackBuffer::new(
            animated,
            self.probe.clone(),
            self.pool.clone(),
            self.config.animation.max_buffer_bytes,
        );
        buffer.set_frame_preload(self.config.animation.preload);
        Some(Playback { buffer, lease })
    }
}

impl std::fmt::Debug for ImageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageContext")
            .field("pool", &self.pool)
            .field("disk", &self.disk.is_some())
            .field("animations", &self.animations.len())
            .finish_non_exhaustive()
    }
}
