//! Per-consumer look-ahead buffer for animated playback.
//!
//! The consumer drives `tick` from its frame clock. Upcoming frames are
//! decoded on the worker pool into a small map; the fetch window ramps up by
//! one frame per cycle until it reaches `max_buffer_count`. A buffer miss
//! stalls playback instead of skipping a frame.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use image::RgbaImage;
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, trace, warn};

use super::{AnimatedImage, device_memory_budget};
use crate::domain::entities::LoopCount;
use crate::domain::ports::MemoryProbePort;
use crate::infrastructure::pool::WorkerPool;

/// Floor for the buffer memory budget before the configured cap applies.
pub const MIN_BUFFER_BUDGET: u64 = 10 * 1024 * 1024;

/// Upper bound for `max_buffer_count`.
pub const DEFAULT_MAX_BUFFER_COUNT: usize = 512;

const UNKNOWN_FRAME_BYTES: u64 = 1024;

/// Regrowth after a memory warning starts this many cycles below zero, plus
/// up to `WARNING_BACKOFF_JITTER` more.
const WARNING_BACKOFF: i64 = 60;
const WARNING_BACKOFF_JITTER: i64 = 120;

/// How many frames a buffer may hold for frames of `bytes_per_frame`.
#[must_use]
pub fn max_buffer_count(
    probe: &dyn MemoryProbePort,
    bytes_per_frame: usize,
    configured_cap: Option<u64>,
) -> usize {
    let frame_bytes = match bytes_per_frame as u64 {
        0 => UNKNOWN_FRAME_BYTES,
        n => n,
    };
    let mut budget = device_memory_budget(probe).max(MIN_BUFFER_BUDGET);
    if let Some(cap) = configured_cap {
        budget = budget.min(cap);
    }
    usize::try_from(budget / frame_bytes)
        .unwrap_or(usize::MAX)
        .clamp(1, DEFAULT_MAX_BUFFER_COUNT)
}

/// Result of one clock tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Current frame is still on screen.
    Idle,
    /// Playback moved to the given frame.
    Advanced(usize),
    /// The next frame is not decoded yet; playback is stalled.
    Waiting,
    /// A finite loop count was reached; playback rests on the last frame.
    Finished,
}

struct BufferState {
    /// `None` records a frame that failed to decode.
    frames: HashMap<usize, Option<Arc<RgbaImage>>>,
    max_buffer_count: usize,
    incr_buffer_count: i64,
    fetching: bool,
}

struct Shared {
    image: Arc<AnimatedImage>,
    probe: Arc<dyn MemoryProbePort>,
    configured_cap: Option<u64>,
    state: Mutex<BufferState>,
    generation: AtomicU64,
}

impl Shared {
    fn recompute_max(&self) -> usize {
        max_buffer_count(
            self.probe.as_ref(),
            self.image.bytes_per_frame(),
            self.configured_cap,
        )
    }

    /// One fetch cycle: widen the window, then decode missing frames starting
    /// at `from`.
    fn fetch(&self, from: usize, generation: u64) {
        let total = self.image.frame_count();
        let window = {
            let mut state = self.state.lock();
            if self.generation.load(Ordering::Acquire) != generation {
                return;
            }
            state.incr_buffer_count += 1;
            if state.incr_buffer_count == 0 {
                state.max_buffer_count = self.recompute_max();
            }
            let max = i64::try_from(state.max_buffer_count).unwrap_or(i64::MAX);
            state.incr_buffer_count = state.incr_buffer_count.min(max);
            usize::try_from(state.incr_buffer_count.max(1))
                .unwrap_or(1)
                .min(total)
        };

        let missing: Vec<usize> = {
            let state = self.state.lock();
            (0..window)
                .map(|offset| (from + offset) % total)
                .filter(|index| !state.frames.contains_key(index))
                .collect()
        };

        for index in missing {
            if self.generation.load(Ordering::Acquire) != generation {
                return;
            }
            let frame = self.decode(index);
            let mut state = self.state.lock();
            if self.generation.load(Ordering::Acquire) != generation {
                return;
            }
            if state.frames.len() >= state.max_buffer_count {
                break;
            }
            state.frames.entry(index).or_insert(frame);
        }

        let mut state = self.state.lock();
        if self.generation.load(Ordering::Acquire) == generation {
            state.fetching = false;
        }
    }

    fn decode(&self, index: usize) -> Option<Arc<RgbaImage>> {
        if let Some(frame) = self.image.frame(index, false) {
            return Some(frame);
        }
        match self.image.source().decode_frame(index) {
            Ok(frame) => Some(Arc::new(frame)),
            Err(e) => {
                warn!(index = index, error = %e, "Playback frame decode failed");
                None
            }
        }
    }
}

/// Look-ahead frame buffer owned by one playback consumer.
pub struct PlaybackBuffer {
    shared: Arc<Shared>,
    pool: WorkerPool,
    current_index: usize,
    current_frame: Option<Arc<RgbaImage>>,
    time: Duration,
    loops: u32,
    buffer_miss: bool,
    stopped: bool,
    finished: bool,
    follow_preload: bool,
}

impl PlaybackBuffer {
    /// Creates a buffer positioned on frame 0 and starts the first fetch.
    /// Frame 0 is taken from the frame cache or decoded on the calling thread.
    #[must_use]
    pub fn new(
        image: Arc<AnimatedImage>,
        probe: Arc<dyn MemoryProbePort>,
        pool: WorkerPool,
        configured_cap: Option<u64>,
    ) -> Self {
        let max = max_buffer_count(probe.as_ref(), image.bytes_per_frame(), configured_cap);
        let current_frame = image.frame(0, true);
        debug!(
            frames = image.frame_count(),
            max_buffer_count = max,
            "Created playback buffer"
        );

        let buffer = Self {
            shared: Arc::new(Shared {
                image,
                probe,
                configured_cap,
                state: Mutex::new(BufferState {
                    frames: HashMap::new(),
                    max_buffer_count: max,
                    incr_buffer_count: 0,
                    fetching: false,
                }),
                generation: AtomicU64::new(0),
            }),
            pool,
            current_index: 0,
            current_frame,
            time: Duration::ZERO,
            loops: 0,
            buffer_miss: false,
            stopped: false,
            finished: false,
            follow_preload: false,
        };
        buffer.schedule_fetch();
        buffer
    }

    /// When enabled, every advance asks the shared frame cache to preload
    /// from the new position so its window tracks playback.
    pub fn set_frame_preload(&mut self, enabled: bool) {
        self.follow_preload = enabled;
        if enabled {
            self.shared.image.preload(self.current_index);
        }
    }

    /// Image being played.
    #[must_use]
    pub fn image(&self) -> &Arc<AnimatedImage> {
        &self.shared.image
    }

    /// Index of the frame on screen.
    #[must_use]
    pub const fn current_index(&self) -> usize {
        self.current_index
    }

    /// Frame on screen. After a failed decode this is still the last good
    /// frame.
    #[must_use]
    pub fn current_frame(&self) -> Option<&Arc<RgbaImage>> {
        self.current_frame.as_ref()
    }

    /// Number of buffered entries, failed decodes included.
    #[must_use]
    pub fn buffered_count(&self) -> usize {
        self.shared.state.lock().frames.len()
    }

    /// Current buffer bound.
    #[must_use]
    pub fn max_buffer_count(&self) -> usize {
        self.shared.state.lock().max_buffer_count
    }

    /// Returns true once a finite loop count has been played out.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.finished
    }

    /// Returns true while paused or finished.
    #[must_use]
    pub const fn is_stopped(&self) -> bool {
        self.stopped || self.finished
    }

    /// Advances playback by `elapsed` clock time.
    pub fn tick(&mut self, elapsed: Duration) -> TickOutcome {
        if self.finished {
            return TickOutcome::Finished;
        }
        let total = self.shared.image.frame_count();
        if self.stopped || total <= 1 {
            return TickOutcome::Idle;
        }
        let next = (self.current_index + 1) % total;

        if self.buffer_miss {
            self.buffer_miss = false;
        } else {
            self.time += elapsed;
            let duration = self.shared.image.frame_duration(self.current_index);
            if self.time < duration {
                return TickOutcome::Idle;
            }
            self.time -= duration;

            if next == 0 {
                self.loops += 1;
                if let LoopCount::Finite(limit) = self.shared.image.loop_count()
                    && self.loops >= limit
                {
                    self.finish();
                    return TickOutcome::Finished;
                }
            }
            self.time = self.time.min(self.shared.image.frame_duration(next));
        }

        let outcome = {
            let mut state = self.shared.state.lock();
            match state.frames.get(&next).cloned() {
                Some(entry) => {
                    if state.incr_buffer_count < i64::try_from(total).unwrap_or(i64::MAX) {
                        state.frames.remove(&next);
                    }
                    self.current_index = next;
                    if let Some(frame) = entry {
                        self.current_frame = Some(frame);
                    }
                    TickOutcome::Advanced(next)
                }
                None => {
                    self.buffer_miss = true;
                    TickOutcome::Waiting
                }
            }
        };

        match outcome {
            TickOutcome::Waiting => trace!(index = next, "Playback buffer miss"),
            TickOutcome::Advanced(index) if self.follow_preload => self.shared.image.preload(index),
            _ => {}
        }
        self.schedule_fetch();
        outcome
    }

    fn schedule_fetch(&self) {
        let total = self.shared.image.frame_count();
        if total == 0 || self.stopped || self.finished {
            return;
        }
        let generation = {
            let mut state = self.shared.state.lock();
            let full = state.frames.len() >= state.max_buffer_count.min(total);
            if full || state.fetching {
                return;
            }
            state.fetching = true;
            self.shared.generation.load(Ordering::Acquire)
        };

        let from = (self.current_index + 1) % total;
        let shared = Arc::clone(&self.shared);
        if !self.pool.spawn(move || shared.fetch(from, generation)) {
            self.shared.state.lock().fetching = false;
        }
    }

    /// Invalidates in-flight fetches. Callers hold the state lock.
    fn invalidate(&self, state: &mut BufferState) {
        self.shared.generation.fetch_add(1, Ordering::AcqRel);
        state.fetching = false;
    }

    fn finish(&mut self) {
        self.finished = true;
        let mut state = self.shared.state.lock();
        self.invalidate(&mut state);
        state.frames.clear();
        debug!(index = self.current_index, loops = self.loops, "Playback finished");
    }

    /// Keeps only the next frame and restarts the fetch window well below
    /// zero so the buffer regrows slowly.
    pub fn on_memory_warning(&self) {
        let total = self.shared.image.frame_count().max(1);
        let next = (self.current_index + 1) % total;
        let backoff = WARNING_BACKOFF + rand::rng().random_range(0..WARNING_BACKOFF_JITTER);

        let mut state = self.shared.state.lock();
        self.invalidate(&mut state);
        let keep = state.frames.remove(&next);
        let dropped = state.frames.len();
        state.frames.clear();
        if let Some(frame) = keep {
            state.frames.insert(next, frame);
        }
        state.incr_buffer_count = -backoff;
        debug!(dropped = dropped, incr = -backoff, "Playback buffer trimmed on memory warning");
    }

    /// Pauses playback and cancels in-flight fetches.
    pub fn stop(&mut self) {
        self.stopped = true;
        let mut state = self.shared.state.lock();
        self.invalidate(&mut state);
    }

    /// Resumes playback. A finished animation restarts from frame 0.
    pub fn start(&mut self) {
        if self.finished {
            self.finished = false;
            self.loops = 0;
            self.time = Duration::ZERO;
            self.current_index = 0;
            self.current_frame = self.shared.image.frame(0, true).or(self.current_frame.take());
        }
        self.stopped = false;
        self.buffer_miss = false;
        self.schedule_fetch();
    }
}

impl Drop for PlaybackBuffer {
    fn drop(&mut self) {
        self.shared.generation.fetch_add(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for PlaybackBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackBuffer")
            .field("current_index", &self.current_index)
            .field("loops", &self.loops)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}
