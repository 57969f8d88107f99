//! Table of which consumers are playing which animated image.
//!
//! Consumers never own the frame cache through this table; it only counts
//! them. When the last consumer of an image detaches, that image's decoded
//! frames are dropped.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::AnimatedImage;
use crate::domain::entities::CacheKey;

/// Identity of one playback consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerId(u64);

struct Entry {
    image: Weak<AnimatedImage>,
    consumers: HashSet<ConsumerId>,
}

/// Registration table: image key → consumer ids.
#[derive(Default)]
pub struct AnimationRegistry {
    entries: Mutex<HashMap<CacheKey, Entry>>,
    next_id: AtomicU64,
}

impl AnimationRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a consumer for `key`. Reuses the live image for that key or
    /// builds one with `make`, which runs under the registry lock.
    pub fn attach<F>(self: &Arc<Self>, key: &CacheKey, make: F) -> (ConsumerLease, Arc<AnimatedImage>)
    where
        F: FnOnce() -> Arc<AnimatedImage>,
    {
        let id = ConsumerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut entries = self.entries.lock();

        let live = entries.get(key).and_then(|entry| entry.image.upgrade());
        let image = match live {
            Some(image) => image,
            None => {
                let image = make();
                entries.insert(
                    key.clone(),
                    Entry {
                        image: Arc::downgrade(&image),
                        consumers: HashSet::new(),
                    },
                );
                image
            }
        };

        let consumers = entries.get_mut(key).map_or(0, |entry| {
            entry.consumers.insert(id);
            entry.consumers.len()
        });
        trace!(key = %key, consumer = id.0, consumers = consumers, "Attached animation consumer");

        let lease = ConsumerLease {
            registry: Arc::downgrade(self),
            key: key.clone(),
            id,
        };
        (lease, image)
    }

    /// Removes a consumer. Returns true if it was the last one, in which case
    /// the image's frame cache is cleared.
    pub fn detach(&self, key: &CacheKey, id: ConsumerId) -> bool {
        let released = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(key) else {
                return false;
            };
            if !entry.consumers.remove(&id) || !entry.consumers.is_empty() {
                return false;
            }
            entries.remove(key).and_then(|entry| entry.image.upgrade())
        };

        if let Some(image) = released {
            image.clear();
        }
        debug!(key = %key, "Last animation consumer detached");
        true
    }

    /// Live image registered for `key`.
    #[must_use]
    pub fn get(&self, key: &CacheKey) -> Option<Arc<AnimatedImage>> {
        self.entries.lock().get(key).and_then(|entry| entry.image.upgrade())
    }

    /// Number of consumers attached to `key`.
    #[must_use]
    pub fn consumer_count(&self, key: &CacheKey) -> usize {
        self.entries
            .lock()
            .get(key)
            .map_or(0, |entry| entry.consumers.len())
    }

    /// Every image that still has consumers.
    #[must_use]
    pub fn live_images(&self) -> Vec<Arc<AnimatedImage>> {
        self.entries
            .lock()
            .values()
            .filter_map(|entry| entry.image.upgrade())
            .collect()
    }

    /// Number of registered images.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl std::fmt::Debug for AnimationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnimationRegistry")
            .field("images", &self.len())
            .finish_non_exhaustive()
    }
}

/// Detaches its consumer when dropped.
pub struct ConsumerLease {
    registry: Weak<AnimationRegistry>,
    key: CacheKey,
    id: ConsumerId,
}

impl ConsumerLease {
    /// Consumer identity.
    #[must_use]
    pub const fn id(&self) -> ConsumerId {
        self.id
    }

    /// Image key the consumer is attached to.
    #[must_use]
    pub const fn key(&self) -> &CacheKey {
        &self.key
    }
}

impl Drop for ConsumerLease {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.detach(&self.key, self.id);
        }
    }
}

impl std::fmt::Debug for ConsumerLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerLease")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::domain::ports::MemoryProbePort;
    use crate::infrastructure::animation::test_support::SolidFrames;
    use crate::infrastructure::pool::WorkerPool;
    use crate::infrastructure::system::FixedMemoryProbe;

    fn make_image() -> Arc<AnimatedImage> {
        let probe: Arc<dyn MemoryProbePort> = Arc::new(FixedMemoryProbe::new(1 << 30, 1 << 30));
        AnimatedImage::new(
            Arc::new(SolidFrames::new(3, 2, 2)),
            probe,
            WorkerPool::new(1).unwrap(),
        )
    }

    fn fill(image: &Arc<AnimatedImage>) {
        image.preload(0);
        for _ in 0..500 {
            if !image.is_preload_pending() {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(image.cached_frame_count(), 3);
    }

    #[test]
    fn test_consumers_share_one_image() {
        let registry = AnimationRegistry::new();
        let key = CacheKey::new("https://example.com/a.gif", None);

        let (first, a) = registry.attach(&key, make_image);
        let (second, b) = registry.attach(&key, || panic!("image should be reused"));

        assert!(Arc::ptr_eq(&a, &b));
        assert_ne!(first.id(), second.id());
        assert_eq!(registry.consumer_count(&key), 2);
    }

    #[test]
    fn test_last_consumer_clears_frames() {
        let registry = AnimationRegistry::new();
        let key = CacheKey::new("https://example.com/a.gif", None);

        let (first, image) = registry.attach(&key, make_image);
        let (second, _) = registry.attach(&key, make_image);
        fill(&image);

        drop(first);
        assert_eq!(image.cached_frame_count(), 3);

        drop(second);
        assert_eq!(image.cached_frame_count(), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_detach_unknown_consumer_is_ignored() {
        let registry = AnimationRegistry::new();
        let key = CacheKey::new("https://example.com/a.gif", None);
        let (_lease, _) = registry.attach(&key, make_image);

        assert!(!registry.detach(&key, ConsumerId(999)));
        assert_eq!(registry.consumer_count(&key), 1);
    }

    #[test]
    fn test_dead_image_is_rebuilt() {
        let registry = AnimationRegistry::new();
        let key = CacheKey::new("https://example.com/a.gif", None);

        let (lease, image) = registry.attach(&key, make_image);
        drop(image);
        let (_again, rebuilt) = registry.attach(&key, make_image);

        assert_eq!(rebuilt.frame_count(), 3);
        assert_eq!(registry.live_images().len(), 1);
        drop(lease);
    }
}
