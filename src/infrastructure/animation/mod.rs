//! Animated image playback: a shared per-image frame cache, per-consumer
//! look-ahead buffers, and the table tying consumers to images.

mod frame_cache;
mod playback;
mod registry;

pub use frame_cache::AnimatedImage;
pub use playback::{
    DEFAULT_MAX_BUFFER_COUNT, MIN_BUFFER_BUDGET, PlaybackBuffer, TickOutcome, max_buffer_count,
};
pub use registry::{AnimationRegistry, ConsumerId, ConsumerLease};

use crate::domain::ports::MemoryProbePort;

/// Bytes animation caches may use: `min(0.2 × total, 0.6 × free)`.
#[must_use]
pub fn device_memory_budget(probe: &dyn MemoryProbePort) -> u64 {
    let total = probe.total_bytes() / 5;
    let free = probe.free_bytes().saturating_mul(3) / 5;
    total.min(free)
}
