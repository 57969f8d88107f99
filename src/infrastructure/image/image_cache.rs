//! Two-tier cache facade: decoded images in memory, encoded bytes on disk.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::trace;

use super::disk_cache::DiskCache;
use super::memory_cache::ImageMemoryCache;
use crate::domain::entities::{CacheKey, DecodedImage};
use crate::domain::ports::ImageCachePort;

/// Memory tier plus an optional disk tier.
pub struct ImageCache {
    memory: Arc<ImageMemoryCache>,
    disk: Option<Arc<DiskCache>>,
}

impl ImageCache {
    /// Creates a cache over the given tiers.
    #[must_use]
    pub const fn new(memory: Arc<ImageMemoryCache>, disk: Option<Arc<DiskCache>>) -> Self {
        Self { memory, disk }
    }

    /// Memory tier.
    #[must_use]
    pub const fn memory(&self) -> &Arc<ImageMemoryCache> {
        &self.memory
    }

    /// Disk tier, if configured.
    #[must_use]
    pub const fn disk(&self) -> Option<&Arc<DiskCache>> {
        self.disk.as_ref()
    }
}

impl std::fmt::Debug for ImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageCache")
            .field("memory_count", &self.memory.total_count())
            .field("disk", &self.disk.as_ref().map(|d| d.path().to_path_buf()))
            .finish()
    }
}

#[async_trait]
impl ImageCachePort for ImageCache {
    fn lookup_memory(&self, key: &CacheKey) -> Option<DecodedImage> {
        let hit = self.memory.get(key);
        trace!(key = %key, hit = hit.is_some(), "Memory lookup");
        hit
    }

    async fn lookup_disk(&self, key: &CacheKey) -> Option<Bytes> {
        let disk = self.disk.as_ref()?;
        let hit = disk.get(key).await;
        trace!(key = %key, hit = hit.is_some(), "Disk lookup");
        hit
    }

    fn store_memory(&self, key: CacheKey, image: DecodedImage) {
        let cost = image.cost();
        self.memory.set(key, image, cost);
    }

    async fn store_disk(&self, key: CacheKey, data: Bytes) {
        if let Some(disk) = &self.disk {
            disk.set(key, data).await;
        }
    }

    async fn remove(&self, key: &CacheKey) {
        self.memory.remove(key);
        if let Some(disk) = &self.disk {
            disk.remove(key).await;
        }
    }

    async fn clear(&self) {
        self.memory.remove_all();
        if let Some(disk) = &self.disk {
            disk.remove_all().await;
        }
    }
}
