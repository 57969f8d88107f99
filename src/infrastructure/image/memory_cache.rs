//! In-memory LRU cache bounded by count and byte cost.

use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::domain::entities::{CacheKey, DecodedImage};
use crate::domain::errors::CapacityViolation;

/// Default cost limit: 256 MiB of decoded pixels.
pub const DEFAULT_MAX_COST: usize = 256 * 1024 * 1024;

/// Default count limit.
pub const DEFAULT_MAX_COUNT: usize = 1000;

/// Cache of decoded images keyed by resource + transform.
pub type ImageMemoryCache = MemoryCache<CacheKey, DecodedImage>;

/// Bounds enforced after every insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryCacheLimits {
    /// Maximum summed cost in bytes.
    pub max_cost: usize,
    /// Maximum number of entries.
    pub max_count: usize,
    /// Entries not touched for this long are dropped by `trim_to_age`.
    pub max_age: Option<Duration>,
}

impl Default for MemoryCacheLimits {
    fn default() -> Self {
        Self {
            max_cost: DEFAULT_MAX_COST,
            max_count: DEFAULT_MAX_COUNT,
            max_age: None,
        }
    }
}

struct Entry<V> {
    value: V,
    cost: usize,
    last_access: Instant,
}

struct Inner<K: Hash + Eq, V> {
    map: LruCache<K, Entry<V>>,
    total_cost: usize,
    limits: MemoryCacheLimits,
}

impl<K: Hash + Eq, V> Inner<K, V> {
    /// Pops from the tail while either bound is exceeded. Evicted values are
    /// returned so they can be dropped after the lock is released.
    fn evict_until(&mut self, max_cost: usize, max_count: usize) -> Vec<V> {
        let mut evicted = Vec::new();
        while self.total_cost > max_cost || self.map.len() > max_count {
            let Some((_, entry)) = self.map.pop_lru() else {
                break;
            };
            self.total_cost -= entry.cost;
            evicted.push(entry.value);
        }
        evicted
    }
}

/// Thread-safe LRU cache with cost-based eviction.
///
/// A single exclusive lock guards the map; `get` takes it too because a hit
/// reorders the recency list. The head of the list is the most recently used
/// entry, eviction always proceeds from the tail.
pub struct MemoryCache<K: Hash + Eq, V> {
    inner: Mutex<Inner<K, V>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K, V> MemoryCache<K, V>
where
    K: Hash + Eq + Clone + std::fmt::Debug,
    V: Clone,
{
    /// Creates a cache with the given limits.
    #[must_use]
    pub fn new(limits: MemoryCacheLimits) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: LruCache::unbounded(),
                total_cost: 0,
                limits,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Inserts or replaces a value at the head, then evicts from the tail
    /// until both limits hold.
    pub fn set(&self, key: K, value: V, cost: usize) {
        let evicted = {
            let mut inner = self.inner.lock();
            let entry = Entry {
                value,
                cost,
                last_access: Instant::now(),
            };
            if let Some(old) = inner.map.put(key.clone(), entry) {
                inner.total_cost -= old.cost;
            }
            inner.total_cost += cost;

            let limits = inner.limits;
            let evicted = inner.evict_until(limits.max_cost, limits.max_count);
            trace!(key = ?key, cost = cost, total_cost = inner.total_cost, "Stored in memory cache");
            evicted
        };

        if !evicted.is_empty() {
            debug!(count = evicted.len(), "Evicted entries from memory cache");
        }
        drop(evicted);
    }

    /// Returns the value and moves it to the head. A miss has no side effect
    /// besides statistics.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.map.get_mut(key) {
            entry.last_access = Instant::now();
            self.hits.fetch_add(1, Ordering::Relaxed);
            trace!(key = ?key, "Memory cache hit");
            Some(entry.value.clone())
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            trace!(key = ?key, "Memory cache miss");
            None
        }
    }

    /// Returns the value without promoting it.
    pub fn peek(&self, key: &K) -> Option<V> {
        let inner = self.inner.lock();
        inner.map.peek(key).map(|entry| entry.value.clone())
    }

    /// Returns true if the key is cached. Does not promote.
    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().map.contains(key)
    }

    /// Removes a key, returning its value.
    pub fn remove(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        let entry = inner.map.pop(key)?;
        inner.total_cost -= entry.cost;
        debug!(key = ?key, "Removed from memory cache");
        Some(entry.value)
    }

    /// Drops every entry.
    pub fn remove_all(&self) {
        let drained = {
            let mut inner = self.inner.lock();
            inner.total_cost = 0;
            std::mem::replace(&mut inner.map, LruCache::unbounded())
        };
        debug!(count = drained.len(), "Cleared memory cache");
        drop(drained);
    }

    /// Evicts from the tail until cost and count are within the given bounds.
    pub fn trim(&self, to_cost: usize, to_count: usize) {
        let evicted = self.inner.lock().evict_until(to_cost, to_count);
        if !evicted.is_empty() {
            debug!(
                count = evicted.len(),
                to_cost = to_cost,
                to_count = to_count,
                "Trimmed memory cache"
            );
        }
    }

    /// Evicts from the tail until the cost bound holds.
    pub fn trim_to_cost(&self, to_cost: usize) {
        self.trim(to_cost, usize::MAX);
    }

    /// Evicts from the tail until the count bound holds.
    pub fn trim_to_count(&self, to_count: usize) {
        self.trim(usize::MAX, to_count);
    }

    /// Evicts tail entries that have not been accessed within `max_age`.
    pub fn trim_to_age(&self, max_age: Duration) {
        let now = Instant::now();
        let mut evicted = Vec::new();
        {
            let mut inner = self.inner.lock();
            while let Some((_, entry)) = inner.map.peek_lru() {
                if now.duration_since(entry.last_access) <= max_age {
                    break;
                }
                if let Some((_, entry)) = inner.map.pop_lru() {
                    inner.total_cost -= entry.cost;
                    evicted.push(entry.value);
                }
            }
        }
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "Aged out memory cache entries");
        }
    }

    /// Applies every configured limit, including the age limit.
    pub fn trim_to_limits(&self) {
        let limits = self.limits();
        self.trim(limits.max_cost, limits.max_count);
        if let Some(max_age) = limits.max_age {
            self.trim_to_age(max_age);
        }
    }

    /// Responds to memory pressure by keeping only `retain_ratio` of the
    /// current cost and count.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn on_memory_warning(&self, retain_ratio: f64) {
        let ratio = retain_ratio.clamp(0.0, 1.0);
        let (cost, count) = {
            let inner = self.inner.lock();
            (inner.total_cost, inner.map.len())
        };
        let to_cost = (cost as f64 * ratio) as usize;
        let to_count = (count as f64 * ratio) as usize;
        debug!(to_cost = to_cost, to_count = to_count, "Memory warning, trimming memory cache");
        self.trim(to_cost, to_count);
    }

    /// Summed cost of live entries.
    pub fn total_cost(&self) -> usize {
        self.inner.lock().total_cost
    }

    /// Number of live entries.
    pub fn total_count(&self) -> usize {
        self.inner.lock().map.len()
    }

    /// Returns true if the cache holds nothing.
    pub fn is_empty(&self) -> bool {
        self.total_count() == 0
    }

    /// Current limits.
    pub fn limits(&self) -> MemoryCacheLimits {
        self.inner.lock().limits
    }

    /// Replaces the limits and trims to them.
    pub fn set_limits(&self, limits: MemoryCacheLimits) {
        self.inner.lock().limits = limits;
        self.trim(limits.max_cost, limits.max_count);
    }

    /// Keys ordered from most to least recently used.
    pub fn keys_by_recency(&self) -> Vec<K> {
        self.inner.lock().map.iter().map(|(k, _)| k.clone()).collect()
    }

    /// Verifies the bookkeeping invariants.
    ///
    /// # Errors
    /// Returns the first violated invariant.
    pub fn check_invariants(&self) -> Result<(), CapacityViolation> {
        let inner = self.inner.lock();
        let actual: usize = inner.map.iter().map(|(_, e)| e.cost).sum();
        if actual != inner.total_cost {
            return Err(CapacityViolation::CostMismatch {
                tracked: inner.total_cost,
                actual,
            });
        }
        if inner.total_cost > inner.limits.max_cost {
            return Err(CapacityViolation::OverCost {
                total: inner.total_cost,
                limit: inner.limits.max_cost,
            });
        }
        if inner.map.len() > inner.limits.max_count {
            return Err(CapacityViolation::OverCount {
                total: inner.map.len(),
                limit: inner.limits.max_count,
            });
        }
        Ok(())
    }

    /// Returns cache statistics.
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            (hits as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        let inner = self.inner.lock();
        CacheStats {
            hits,
            misses,
            hit_rate,
            size: inner.map.len(),
            cost: inner.total_cost,
        }
    }
}

impl<K, V> Default for MemoryCache<K, V>
where
    K: Hash + Eq + Clone + std::fmt::Debug,
    V: Clone,
{
    fn default() -> Self {
        Self::new(MemoryCacheLimits::default())
    }
}

impl<K: Hash + Eq, V> std::fmt::Debug for MemoryCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MemoryCache")
            .field("count", &inner.map.len())
            .field("total_cost", &inner.total_cost)
            .field("limits", &inner.limits)
            .finish()
    }
}

/// Statistics about cache performance.
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Hit rate as a percentage.
    pub hit_rate: f64,
    /// Current number of cached entries.
    pub size: usize,
    /// Current summed cost in bytes.
    pub cost: usize,
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Cache: {} entries ({} bytes), {:.1}% hit rate ({} hits, {} misses)",
            self.size, self.cost, self.hit_rate, self.hits, self.misses
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn cache(max_cost: usize, max_count: usize) -> MemoryCache<&'static str, u32> {
        MemoryCache::new(MemoryCacheLimits {
            max_cost,
            max_count,
            max_age: None,
        })
    }

    #[test]
    fn test_count_limit_evicts_least_recent() {
        let cache = cache(usize::MAX, 2);

        cache.set("a", 1, 0);
        cache.set("b", 2, 0);
        cache.set("c", 3, 0);

        assert!(cache.get(&"a").is_none());
        assert_eq!(cache.get(&"b"), Some(2));
        assert_eq!(cache.get(&"c"), Some(3));
        assert_eq!(cache.total_count(), 2);
    }

    #[test]
    fn test_get_moves_entry_to_head() {
        let cache = cache(usize::MAX, 10);
        cache.set("a", 1, 1);
        cache.set("b", 2, 1);
        cache.set("c", 3, 1);

        assert_eq!(cache.keys_by_recency(), vec!["c", "b", "a"]);
        cache.get(&"a");
        assert_eq!(cache.keys_by_recency(), vec!["a", "c", "b"]);
    }

    #[test]
    fn test_miss_has_no_side_effect() {
        let cache = cache(usize::MAX, 10);
        cache.set("a", 1, 1);
        cache.set("b", 2, 1);

        assert!(cache.get(&"zzz").is_none());
        assert_eq!(cache.keys_by_recency(), vec!["b", "a"]);
    }

    #[test]
    fn test_replace_updates_cost_and_recency() {
        let cache = cache(usize::MAX, 10);
        cache.set("a", 1, 10);
        cache.set("b", 2, 20);
        cache.set("a", 3, 5);

        assert_eq!(cache.total_cost(), 25);
        assert_eq!(cache.total_count(), 2);
        assert_eq!(cache.keys_by_recency(), vec!["a", "b"]);
        assert_eq!(cache.peek(&"a"), Some(3));
        cache.check_invariants().unwrap();
    }

    #[test]
    fn test_cost_limit_evicts_from_tail_only() {
        let cache = cache(100, usize::MAX);
        cache.set("a", 1, 40);
        cache.set("b", 2, 40);
        cache.get(&"a");
        cache.set("c", 3, 40);

        // "b" was the tail after the touch on "a".
        assert!(!cache.contains(&"b"));
        assert!(cache.contains(&"a"));
        assert!(cache.contains(&"c"));
        assert!(cache.total_cost() <= 100);
        cache.check_invariants().unwrap();
    }

    #[test]
    fn test_oversized_entry_is_not_retained() {
        let cache = cache(10, usize::MAX);
        cache.set("small", 1, 5);
        cache.set("huge", 2, 50);

        assert_eq!(cache.total_cost(), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lru_invariant_over_operation_sequence() {
        let cache = cache(60, 4);
        let keys = ["a", "b", "c", "d", "e", "f"];

        for step in 0..200usize {
            let key = keys[(step * 7 + step / 3) % keys.len()];
            if step % 3 == 0 {
                cache.get(&key);
                if cache.contains(&key) {
                    assert_eq!(cache.keys_by_recency()[0], key);
                }
            } else {
                cache.set(key, u32::try_from(step).unwrap(), step % 25);
                assert_eq!(cache.keys_by_recency()[0], key);
            }
            cache.check_invariants().unwrap();
        }
    }

    #[test]
    fn test_trim_to_cost_and_count() {
        let cache = cache(usize::MAX, usize::MAX);
        for (i, key) in ["a", "b", "c", "d"].into_iter().enumerate() {
            cache.set(key, u32::try_from(i).unwrap(), 10);
        }

        cache.trim_to_cost(25);
        assert_eq!(cache.keys_by_recency(), vec!["d", "c"]);

        cache.trim_to_count(1);
        assert_eq!(cache.keys_by_recency(), vec!["d"]);
    }

    #[test]
    fn test_trim_to_age_drops_stale_tail() {
        let cache = cache(usize::MAX, usize::MAX);
        cache.set("old", 1, 1);
        std::thread::sleep(Duration::from_millis(30));
        cache.set("new", 2, 1);

        cache.trim_to_age(Duration::from_millis(15));

        assert!(!cache.contains(&"old"));
        assert!(cache.contains(&"new"));
    }

    #[test]
    fn test_memory_warning_keeps_fraction() {
        let cache = cache(usize::MAX, usize::MAX);
        for (i, key) in ["a", "b", "c", "d"].into_iter().enumerate() {
            cache.set(key, u32::try_from(i).unwrap(), 10);
        }

        cache.on_memory_warning(0.5);

        assert_eq!(cache.total_count(), 2);
        assert_eq!(cache.total_cost(), 20);
        assert_eq!(cache.keys_by_recency(), vec!["d", "c"]);
    }

    #[test]
    fn test_remove_and_remove_all() {
        let cache = cache(usize::MAX, usize::MAX);
        cache.set("a", 1, 3);
        cache.set("b", 2, 4);

        assert_eq!(cache.remove(&"a"), Some(1));
        assert_eq!(cache.total_cost(), 4);
        assert!(cache.remove(&"a").is_none());

        cache.remove_all();
        assert!(cache.is_empty());
        assert_eq!(cache.total_cost(), 0);
    }

    #[test]
    fn test_cache_stats() {
        let cache = cache(usize::MAX, usize::MAX);
        cache.set("a", 1, 8);

        let _ = cache.get(&"a");
        let _ = cache.get(&"missing");

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 1);
        assert_eq!(stats.cost, 8);
    }

    #[test]
    fn test_concurrent_access_keeps_totals_consistent() {
        let cache = Arc::new(MemoryCache::<u32, u32>::new(MemoryCacheLimits {
            max_cost: 500,
            max_count: 64,
            max_age: None,
        }));

        let handles: Vec<_> = (0..8u32)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..500u32 {
                        let key = (t * 31 + i) % 97;
                        if i % 2 == 0 {
                            cache.set(key, i, (i % 13) as usize);
                        } else {
                            cache.get(&key);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        cache.check_invariants().unwrap();
    }

    #[test]
    fn test_image_cache_alias() {
        let cache = ImageMemoryCache::default();
        let image = DecodedImage::still(
            image::ImageFormat::Png,
            image::DynamicImage::new_rgba8(4, 4),
        );
        let key = CacheKey::for_source("https://example.com/a.png");

        cache.set(key.clone(), image.clone(), image.cost());

        assert_eq!(cache.total_cost(), 64);
        assert_eq!(cache.get(&key).map(|i| i.width()), Some(4));
    }
}
