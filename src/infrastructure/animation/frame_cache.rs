//! Decoded-frame cache shared by every consumer of one animated image.
//!
//! Frames live in an arena of slots indexed by frame number. A slot is valid
//! only while its edit key matches the cache generation, so `clear` can
//! invalidate everything at once even with a preload in flight. Background
//! preloads capture the sentinel when scheduled and re-check it before every
//! mutation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use image::RgbaImage;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::device_memory_budget;
use crate::domain::entities::{FrameInfo, LoopCount};
use crate::domain::ports::{AnimatedFrameSource, MemoryProbePort};
use crate::infrastructure::pool::WorkerPool;

#[derive(Default)]
struct FrameSlot {
    image: Option<Arc<RgbaImage>>,
    edit_key: u64,
}

struct CacheState {
    slots: Vec<FrameSlot>,
    generation: u64,
    cached_bytes: usize,
    max_cache_size: usize,
}

impl CacheState {
    fn valid(&self, index: usize) -> Option<&Arc<RgbaImage>> {
        let slot = self.slots.get(index)?;
        slot.image.as_ref().filter(|_| slot.edit_key == self.generation)
    }

    fn evict(&mut self, index: usize, cost: usize) -> bool {
        if self.valid(index).is_none() {
            return false;
        }
        self.slots[index].image = None;
        self.cached_bytes = self.cached_bytes.saturating_sub(cost);
        true
    }
}

/// Frame cache for one animated image. Capacity follows device memory.
pub struct AnimatedImage {
    source: Arc<dyn AnimatedFrameSource>,
    probe: Arc<dyn MemoryProbePort>,
    pool: WorkerPool,
    state: Mutex<CacheState>,
    sentinel: AtomicU64,
    playhead: AtomicUsize,
    preload_pending: AtomicBool,
}

impl AnimatedImage {
    /// Creates an empty cache and sizes it from the probe.
    #[must_use]
    pub fn new(
        source: Arc<dyn AnimatedFrameSource>,
        probe: Arc<dyn MemoryProbePort>,
        pool: WorkerPool,
    ) -> Arc<Self> {
        let frame_count = source.frame_count();
        let max_cache_size = usize::try_from(device_memory_budget(probe.as_ref())).unwrap_or(usize::MAX);
        let mut slots = Vec::with_capacity(frame_count);
        slots.resize_with(frame_count, FrameSlot::default);

        debug!(
            frames = frame_count,
            bytes_per_frame = source.bytes_per_frame(),
            max_cache_size = max_cache_size,
            "Created animated frame cache"
        );

        Arc::new(Self {
            source,
            probe,
            pool,
            state: Mutex::new(CacheState {
                slots,
                generation: 0,
                cached_bytes: 0,
                max_cache_size,
            }),
            sentinel: AtomicU64::new(0),
            playhead: AtomicUsize::new(0),
            preload_pending: AtomicBool::new(false),
        })
    }

    /// Frame source backing the cache.
    #[must_use]
    pub fn source(&self) -> &Arc<dyn AnimatedFrameSource> {
        &self.source
    }

    /// Number of frames.
    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.source.frame_count()
    }

    /// Container loop count.
    #[must_use]
    pub fn loop_count(&self) -> LoopCount {
        self.source.loop_count()
    }

    /// Metadata for a frame.
    #[must_use]
    pub fn frame_info(&self, index: usize) -> Option<FrameInfo> {
        self.source.frame_info(index)
    }

    /// Display duration of a frame; zero for out-of-range indices.
    #[must_use]
    pub fn frame_duration(&self, index: usize) -> Duration {
        self.frame_info(index).map_or(Duration::ZERO, |info| info.duration)
    }

    /// Decoded size of one frame in bytes.
    #[must_use]
    pub fn bytes_per_frame(&self) -> usize {
        self.source.bytes_per_frame()
    }

    fn frame_cost(&self, index: usize) -> usize {
        self.frame_info(index).map_or(0, |info| info.cost())
    }

    /// Returns a cached frame. On a miss with `decode_if_missing`, decodes
    /// it on the calling thread without inserting it.
    #[must_use]
    pub fn frame(&self, index: usize, decode_if_missing: bool) -> Option<Arc<RgbaImage>> {
        if let Some(frame) = self.state.lock().valid(index) {
            return Some(frame.clone());
        }
        if !decode_if_missing {
            return None;
        }
        match self.source.decode_frame(index) {
            Ok(frame) => Some(Arc::new(frame)),
            Err(e) => {
                warn!(index = index, error = %e, "Frame decode failed");
                None
            }
        }
    }

    /// Schedules background work that trims or fills the cache around
    /// `from`. No-op while a preload is pending, or when every frame is cached
    /// within the cap.
    pub fn preload(self: &Arc<Self>, from: usize) {
        if self.preload_pending.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.is_settled() {
            self.preload_pending.store(false, Ordering::Release);
            return;
        }

        self.playhead.store(from, Ordering::Release);
        let sentinel = self.sentinel.load(Ordering::Acquire);
        let this = Arc::clone(self);
        let scheduled = self.pool.spawn(move || {
            this.run_preload(from, sentinel);
            this.preload_pending.store(false, Ordering::Release);
        });
        if !scheduled {
            self.preload_pending.store(false, Ordering::Release);
        }
    }

    fn is_settled(&self) -> bool {
        let state = self.state.lock();
        state.cached_bytes <= state.max_cache_size
            && (0..state.slots.len()).all(|i| state.valid(i).is_some())
    }

    fn is_current(&self, sentinel: u64) -> bool {
        self.sentinel.load(Ordering::Acquire) == sentinel
    }

    fn run_preload(&self, from: usize, sentinel: u64) {
        let count = self.frame_count();
        if count == 0 {
            return;
        }
        let from = from % count;

        let over_budget = {
            let state = self.state.lock();
            state.cached_bytes > state.max_cache_size
        };

        if over_budget {
            self.evict_backward(from, sentinel);
        }
        self.decode_forward(from, sentinel);
    }

    /// Evicts frames behind `from`, most distant future first, until the
    /// cache fits.
    fn evict_backward(&self, from: usize, sentinel: u64) {
        let count = self.frame_count();
        let mut evicted = 0;
        for step in 1..count {
            let index = (from + count - step) % count;
            let cost = self.frame_cost(index);
            let mut state = self.state.lock();
            if !self.is_current(sentinel) || state.cached_bytes <= state.max_cache_size {
                break;
            }
            if state.evict(index, cost) {
                evicted += 1;
            }
        }
        trace!(from = from, evicted = evicted, "Preload evicted frames");
    }

    /// Decodes the frames that fit under the cap forward from `from`. Room
    /// for them is made by evicting frames outside that window, starting
    /// just behind `from`.
    fn decode_forward(&self, from: usize, sentinel: u64) {
        let count = self.frame_count();
        let plan: Vec<usize> = {
            let mut state = self.state.lock();
            if !self.is_current(sentinel) {
                return;
            }

            let mut window = vec![false; count];
            let mut budget = state.max_cache_size;
            for step in 0..count {
                let index = (from + step) % count;
                let cost = self.frame_cost(index);
                if cost > budget {
                    break;
                }
                budget -= cost;
                window[index] = true;
            }

            let plan: Vec<usize> = (0..count)
                .map(|step| (from + step) % count)
                .filter(|&index| window[index] && state.valid(index).is_none())
                .collect();
            let needed: usize = plan.iter().map(|&index| self.frame_cost(index)).sum();

            let mut evicted = 0;
            for step in 1..count {
                if state.cached_bytes + needed <= state.max_cache_size {
                    break;
                }
                let index = (from + count - step) % count;
                if !window[index] && state.evict(index, self.frame_cost(index)) {
                    evicted += 1;
                }
            }
            if evicted > 0 {
                trace!(from = from, evicted = evicted, "Preload slid frame window");
            }
            plan
        };

        let mut inserted = 0;
        for run in contiguous_runs(&plan) {
            if !self.is_current(sentinel) {
                return;
            }
            let frames = match self.source.decode_frames(run.0, run.1) {
                Ok(frames) => frames,
                Err(e) => {
                    warn!(start = run.0, count = run.1, error = %e, "Preload decode failed");
                    continue;
                }
            };

            for (offset, frame) in frames.into_iter().enumerate() {
                let index = run.0 + offset;
                let cost = self.frame_cost(index);
                let mut state = self.state.lock();
                if !self.is_current(sentinel) {
                    return;
                }
                if state.valid(index).is_some() {
                    continue;
                }
                if state.cached_bytes + cost > state.max_cache_size {
                    return;
                }
                let generation = state.generation;
                state.slots[index] = FrameSlot {
                    image: Some(Arc::new(frame)),
                    edit_key: generation,
                };
                state.cached_bytes += cost;
                inserted += 1;
            }
        }
        trace!(from = from, inserted = inserted, "Preload decoded frames");
    }

    /// Invalidates any in-flight preload.
    pub fn cancel_preload(&self) {
        self.sentinel.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops every decoded frame. Source bytes are kept.
    pub fn clear(&self) {
        self.cancel_preload();
        let dropped: Vec<Arc<RgbaImage>> = {
            let mut state = self.state.lock();
            state.generation += 1;
            state.cached_bytes = 0;
            state.slots.iter_mut().filter_map(|s| s.image.take()).collect()
        };
        trace!(frames = dropped.len(), "Cleared frame cache");
    }

    /// Recomputes the cap from current device memory. A smaller cap evicts
    /// the frames needed last, counted forward from the last preload
    /// position.
    pub fn refresh_capacity(&self) {
        let max = usize::try_from(device_memory_budget(self.probe.as_ref())).unwrap_or(usize::MAX);
        let playhead = self.playhead.load(Ordering::Acquire);

        let mut state = self.state.lock();
        state.max_cache_size = max;
        let count = state.slots.len();
        let mut evicted = 0;
        for step in (0..count).rev() {
            if state.cached_bytes <= state.max_cache_size {
                break;
            }
            let index = (playhead + step) % count;
            if state.evict(index, self.frame_cost(index)) {
                evicted += 1;
            }
        }
        drop(state);

        if evicted > 0 {
            debug!(max_cache_size = max, evicted = evicted, "Frame cache shrunk to new capacity");
        } else {
            trace!(max_cache_size = max, "Refreshed frame cache capacity");
        }
    }

    /// Cancels preloading and shrinks to the refreshed cap.
    pub fn on_memory_warning(&self) {
        self.cancel_preload();
        self.refresh_capacity();
    }

    /// Stops background work when the host is backgrounded.
    pub fn on_background(&self) {
        self.cancel_preload();
    }

    /// Resizes for the memory available after returning to the foreground.
    pub fn on_foreground(&self) {
        self.refresh_capacity();
    }

    /// Number of valid cached frames.
    #[must_use]
    pub fn cached_frame_count(&self) -> usize {
        let state = self.state.lock();
        (0..state.slots.len())
            .filter(|&i| state.valid(i).is_some())
            .count()
    }

    /// Bytes held by cached frames.
    #[must_use]
    pub fn cached_bytes(&self) -> usize {
        self.state.lock().cached_bytes
    }

    /// Current cap in bytes.
    #[must_use]
    pub fn max_cache_size(&self) -> usize {
        self.state.lock().max_cache_size
    }

    /// Returns true while a preload is scheduled or running.
    #[must_use]
    pub fn is_preload_pending(&self) -> bool {
        self.preload_pending.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for AnimatedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnimatedImage")
            .field("frames", &self.frame_count())
            .field("cached_bytes", &self.cached_bytes())
            .field("max_cache_size", &self.max_cache_size())
            .finish_non_exhaustive()
    }
}

/// Splits ascending-with-wraparound indices into `(start, len)` runs of
/// consecutive frames.
fn contiguous_runs(indices: &[usize]) -> Vec<(usize, usize)> {
    let mut runs: Vec<(usize, usize)> = Vec::new();
    for &index in indices {
        match runs.last_mut() {
            Some((start, len)) if *start + *len == index => *len += 1,
            _ => runs.push((index, 1)),
        }
    }
    runs
}
