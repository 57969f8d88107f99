//! Port definition for image caching.

use bytes::Bytes;

use crate::domain::entities::{CacheKey, DecodedImage};

/// Port for the two-tier image cache probed before any download.
/// Implementations must be thread-safe.
#[async_trait::async_trait]
pub trait ImageCachePort: Send + Sync {
    /// Probes the memory tier. Synchronous and bumps recency on hit.
    fn lookup_memory(&self, key: &CacheKey) -> Option<DecodedImage>;

    /// Probes the disk tier for raw encoded bytes. Failures are misses.
    async fn lookup_disk(&self, key: &CacheKey) -> Option<Bytes>;

    /// Stores a decoded image in the memory tier.
    fn store_memory(&self, key: CacheKey, image: DecodedImage);

    /// Stores raw bytes in the disk tier. Failures are reported, not raised.
    async fn store_disk(&self, key: CacheKey, data: Bytes);

    /// Removes a key from both tiers.
    async fn remove(&self, key: &CacheKey);

    /// Clears both tiers.
    async fn clear(&self);
}
